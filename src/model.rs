use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Canonical availability value stored on a product row and sent downstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Availability {
    InStock,
    OutOfStock,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::InStock => "inStock",
            Availability::OutOfStock => "outOfStock",
        }
    }

    pub fn parse(s: &str) -> Option<Availability> {
        match s {
            "inStock" => Some(Availability::InStock),
            "outOfStock" => Some(Availability::OutOfStock),
            _ => None,
        }
    }
}

/// Marketplace-side processing state of a submitted feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedStatus {
    InQueue,
    InProgress,
    Done,
    Cancelled,
    Fatal,
}

impl FeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStatus::InQueue => "IN_QUEUE",
            FeedStatus::InProgress => "IN_PROGRESS",
            FeedStatus::Done => "DONE",
            FeedStatus::Cancelled => "CANCELLED",
            FeedStatus::Fatal => "FATAL",
        }
    }

    /// Anything the marketplace reports that is not terminal keeps the poll
    /// loop going, so unknown statuses map to `InProgress`.
    pub fn parse(s: &str) -> FeedStatus {
        match s {
            "IN_QUEUE" => FeedStatus::InQueue,
            "DONE" => FeedStatus::Done,
            "CANCELLED" => FeedStatus::Cancelled,
            "FATAL" => FeedStatus::Fatal,
            _ => FeedStatus::InProgress,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeedStatus::Done | FeedStatus::Cancelled | FeedStatus::Fatal
        )
    }
}

/// Result of one reconcile sweep over a source's products.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepSummary {
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

/// Terminal state of a single submitted batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchStatus {
    /// The marketplace finished processing the batch; flags were reset.
    Done,
    /// The batch failed schema validation and was never submitted.
    Invalid,
    /// The marketplace reported FATAL/CANCELLED, a step errored out, or the
    /// poll loop hit its attempt ceiling. Rows stay flagged for the next run.
    Failed,
    /// Cancellation was requested before the batch finished.
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Done => "done",
            BatchStatus::Invalid => "invalid",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-batch slice of a submission run result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub item_count: usize,
    pub report: Option<crate::feed::report::ReportSummary>,
}

/// Aggregate result of one `run_submission` invocation. `success` is true
/// only when every batch reached `Done`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionSummary {
    pub success: bool,
    pub batches: Vec<BatchOutcome>,
}

type CancelFn = dyn Fn() -> bool + Send + Sync;
type ProgressFn = dyn Fn(u64) + Send + Sync;

/// Optional control hooks threaded through both engine stages: a polled
/// cancellation predicate checked between units of work, and a progress
/// callback fed monotonically non-decreasing counters.
#[derive(Clone, Default)]
pub struct RunHooks {
    cancel: Option<Arc<CancelFn>>,
    progress: Option<Arc<ProgressFn>>,
}

impl RunHooks {
    pub fn with_cancel(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.cancel = Some(Arc::new(f));
        self
    }

    pub fn with_progress(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|f| f()).unwrap_or(false)
    }

    pub fn report_progress(&self, done: u64) {
        if let Some(f) = &self.progress {
            f(done);
        }
    }
}

impl std::fmt::Debug for RunHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHooks")
            .field("cancel", &self.cancel.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_round_trip() {
        assert_eq!(Availability::parse("inStock"), Some(Availability::InStock));
        assert_eq!(
            Availability::parse("outOfStock"),
            Some(Availability::OutOfStock)
        );
        assert_eq!(Availability::parse("INSTOCK"), None);
    }

    #[test]
    fn unknown_feed_status_keeps_polling() {
        assert_eq!(FeedStatus::parse("IN_SAFETY_NET"), FeedStatus::InProgress);
        assert!(!FeedStatus::parse("IN_SAFETY_NET").is_terminal());
        assert!(FeedStatus::parse("FATAL").is_terminal());
    }

    #[test]
    fn hooks_default_to_not_cancelled() {
        let hooks = RunHooks::default();
        assert!(!hooks.cancelled());
        hooks.report_progress(3); // no-op without a callback

        let hooks = RunHooks::default().with_cancel(|| true);
        assert!(hooks.cancelled());
    }
}
