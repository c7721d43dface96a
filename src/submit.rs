//! Stage 2: batched feed-submission state machine.
//!
//! Reads the rows Stage 1 flagged, packages them into size-bounded feed
//! documents, drives each through the marketplace's asynchronous protocol
//! (create document → upload → submit → poll → download result) and, once a
//! batch reaches `DONE`, resets the update flag for exactly that batch's
//! rows. Failed batches keep their flags and are re-included on the next
//! invocation, which makes the whole protocol safely replayable.

use crate::config::{Marketplace, SourceConfig};
use crate::db::{self, FlaggedRow, Pool};
use crate::feed::builder::{build_feed, partition_batches, validate_feed};
use crate::feed::report::{decode_artifact, parse_report, ReportSummary};
use crate::feed::{FeedApi, FeedError, ThrottleGate};
use crate::model::{BatchOutcome, BatchStatus, FeedStatus, RunHooks, SubmissionSummary};
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Status checks per submission before the batch is written off as failed.
const MAX_POLL_ATTEMPTS: u32 = 20;

/// Retry a protocol step through the process-wide throttle gate: a throttled
/// response trips the gate, waits out the hold and replays the same step.
/// Every other outcome is returned as-is.
async fn with_throttle<T, F, Fut>(gate: &ThrottleGate, mut step: F) -> Result<T, FeedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    loop {
        gate.wait_if_held().await;
        match step().await {
            Err(FeedError::Throttled) => {
                gate.trip();
            }
            other => return other,
        }
    }
}

/// One submission engine per source. Batches are processed strictly
/// sequentially; the marketplace's own throttling is coarse-grained and
/// sensitive to bursty concurrent submissions.
pub struct SubmissionEngine {
    pool: Pool,
    api: Arc<dyn FeedApi>,
    gate: Arc<ThrottleGate>,
    source_id: String,
    cfg: SourceConfig,
    marketplace: Marketplace,
    feeds_dir: PathBuf,
    poll_interval: Duration,
}

impl SubmissionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Pool,
        source_id: impl Into<String>,
        cfg: SourceConfig,
        marketplace: Marketplace,
        api: Arc<dyn FeedApi>,
        gate: Arc<ThrottleGate>,
        feeds_dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            api,
            gate,
            source_id: source_id.into(),
            cfg,
            marketplace,
            feeds_dir: feeds_dir.into(),
            poll_interval,
        }
    }

    /// Extract flagged rows, submit them batch by batch, and report per-batch
    /// status. Rows of batches that did not reach `DONE` stay flagged and are
    /// naturally re-included next run.
    #[instrument(skip_all)]
    pub async fn run_submission(&self, hooks: RunHooks) -> Result<SubmissionSummary> {
        let rows = db::flagged_rows(&self.pool, &self.source_id, self.cfg.update_flag_value)
            .await
            .context("cannot extract flagged rows")?;
        if rows.is_empty() {
            info!(source_id = %self.source_id, "no flagged rows; nothing to submit");
            return Ok(SubmissionSummary {
                success: true,
                batches: Vec::new(),
            });
        }

        let batches = partition_batches(rows, self.cfg.batch_size);
        info!(
            source_id = %self.source_id,
            batches = batches.len(),
            "starting feed submission"
        );

        let mut outcomes: Vec<BatchOutcome> = Vec::with_capacity(batches.len());
        let mut processed = 0u64;
        let total = batches.len();
        for (idx, batch) in batches.into_iter().enumerate() {
            let item_count = batch.len();
            if hooks.cancelled() {
                warn!(source_id = %self.source_id, "cancellation requested; skipping remaining batches");
                outcomes.push(BatchOutcome {
                    status: BatchStatus::Cancelled,
                    item_count,
                    report: None,
                });
                continue;
            }
            let outcome = self.submit_batch(idx + 1, total, batch, &hooks).await?;
            processed += item_count as u64;
            hooks.report_progress(processed);
            outcomes.push(outcome);
        }

        let success = outcomes.iter().all(|o| o.status == BatchStatus::Done);
        info!(source_id = %self.source_id, success, "feed submission finished");
        Ok(SubmissionSummary {
            success,
            batches: outcomes,
        })
    }

    /// Drive one batch through the full protocol. Batch-level failures are
    /// returned as outcome data; only authentication and store failures
    /// propagate as errors and abort the run.
    async fn submit_batch(
        &self,
        batch_no: usize,
        total: usize,
        batch: Vec<FlaggedRow>,
        hooks: &RunHooks,
    ) -> Result<BatchOutcome> {
        let item_count = batch.len();
        let outcome = |status, report| BatchOutcome {
            status,
            item_count,
            report,
        };

        let feed = build_feed(&self.marketplace.seller_id, &batch);
        let (ok, violations) = validate_feed(&feed);
        if !ok {
            for violation in &violations {
                warn!(batch_no, %violation, "feed validation violation");
            }
            warn!(batch_no, "feed failed validation; batch skipped");
            return Ok(outcome(BatchStatus::Invalid, None));
        }
        let content =
            serde_json::to_string_pretty(&feed).context("feed document serialization")?;
        self.save_audit_copy(batch_no, &content).await;

        // BUILT → UPLOADED → SUBMITTED
        let submission_id = match self.start_submission(&content).await {
            Ok(id) => id,
            Err(err @ FeedError::Auth(_)) => {
                return Err(err).context("marketplace authentication failed");
            }
            Err(err) => {
                warn!(batch_no, error = %err, "submission setup failed");
                return Ok(outcome(BatchStatus::Failed, None));
            }
        };
        info!(batch_no, total, submission_id = %submission_id, items = item_count, "feed submitted");

        // Poll until terminal.
        let mut result_document_id = None;
        let mut reached_done = false;
        for attempt in 1..=MAX_POLL_ATTEMPTS {
            if hooks.cancelled() {
                warn!(batch_no, "cancellation requested during poll; batch left flagged");
                return Ok(outcome(BatchStatus::Cancelled, None));
            }
            tokio::time::sleep(self.poll_interval).await;
            let status = match with_throttle(&self.gate, || self.api.get_status(&submission_id))
                .await
            {
                Ok(status) => status,
                Err(err @ FeedError::Auth(_)) => {
                    return Err(err).context("marketplace authentication failed");
                }
                Err(err) => {
                    warn!(batch_no, attempt, error = %err, "status check failed");
                    continue;
                }
            };
            info!(batch_no, attempt, status = status.status.as_str(), "submission status");
            match status.status {
                FeedStatus::Done => {
                    result_document_id = status.result_document_id;
                    reached_done = true;
                    break;
                }
                FeedStatus::Cancelled | FeedStatus::Fatal => {
                    warn!(batch_no, status = status.status.as_str(), "terminal failure; rows stay flagged");
                    return Ok(outcome(BatchStatus::Failed, None));
                }
                _ => {}
            }
        }
        if !reached_done {
            warn!(batch_no, "poll attempts exhausted; rows stay flagged");
            return Ok(outcome(BatchStatus::Failed, None));
        }

        let report = match &result_document_id {
            Some(document_id) => self.fetch_report(document_id).await,
            None => None,
        };
        if let Some(report) = &report {
            info!(
                batch_no,
                processed = report.processed,
                accepted = report.accepted,
                invalid = report.invalid,
                "processing report"
            );
        }

        // Partial acceptance is still terminal success for the batch: reset
        // the flag for exactly these rows, scoped by source.
        let listing_skus: Vec<String> = batch.into_iter().map(|r| r.listing_sku).collect();
        db::reset_flags(
            &self.pool,
            &self.source_id,
            self.cfg.update_flag_value,
            &listing_skus,
        )
        .await
        .context("cannot reset update flags")?;

        Ok(outcome(BatchStatus::Done, report))
    }

    /// create document → upload → submit, each behind the throttle gate.
    async fn start_submission(&self, content: &str) -> Result<String, FeedError> {
        let document = with_throttle(&self.gate, || self.api.create_document()).await?;
        with_throttle(&self.gate, || {
            self.api.upload(&document.upload_url, content)
        })
        .await?;
        with_throttle(&self.gate, || {
            self.api
                .submit(&document.document_id, &self.marketplace.marketplace_id)
        })
        .await
    }

    async fn fetch_report(&self, document_id: &str) -> Option<ReportSummary> {
        let url = match with_throttle(&self.gate, || self.api.get_document_url(document_id)).await
        {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "could not resolve result document");
                return None;
            }
        };
        let bytes = match with_throttle(&self.gate, || self.api.download(&url)).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "could not download result artifact");
                return None;
            }
        };
        match parse_report(&decode_artifact(&bytes)) {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(?err, "could not parse result artifact");
                None
            }
        }
    }

    /// Keep an audit copy of every built feed. Failure to write it is logged
    /// and never blocks submission.
    async fn save_audit_copy(&self, batch_no: usize, content: &str) {
        let filename = format!(
            "{}_feed_batch{}_{}.json",
            self.source_id,
            batch_no,
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = self.feeds_dir.join(filename);
        if let Err(err) = tokio::fs::write(&path, content).await {
            warn!(?err, path = %path.display(), "failed to save audit copy of feed");
        }
    }
}
