//! Stage 1: rate-limited, concurrent fetch-and-reconcile sweep.
//!
//! For every known product of a source the engine fetches a fresh supplier
//! snapshot, derives quantity/availability/handling fields, diffs them against
//! the stored row and, on change, persists the new values and marks the row
//! with the source's update flag. Stage 2 picks flagged rows up later; the
//! two stages only communicate through that persisted flag column.

use crate::config::SourceConfig;
use crate::db::{self, DerivedFields, Pool, ProductRecord};
use crate::limiter::{Executor, RateLimiter};
use crate::model::{Availability, RunHooks, SweepSummary};
use crate::skiplist::{SkipList, SkipReason};
use crate::supplier::{
    fetch_with_retry, supplier_handling_days, FetchError, Snapshot, SupplierClient, FETCH_ATTEMPTS,
};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Marketplace ceiling on handling windows; anything above 30 days is
/// rejected downstream, so the combined value is capped here.
pub const MAX_COMBINED_HANDLING_DAYS: i64 = 29;

/// Compute the fields Stage 1 owns from a fresh snapshot.
///
/// The quantity/availability policy is evaluated in priority order, first
/// match wins:
/// 1. zero price is a data-quality signal of unavailability;
/// 2. the supplier's own availability signal;
/// 3. residual stock below the low-stock cutoff is not worth listing;
/// 4. stock within the configured level passes through exactly;
/// 5. anything above it is capped to avoid overselling.
pub fn derive_fields(snapshot: &Snapshot, cfg: &SourceConfig, today: NaiveDate) -> DerivedFields {
    let price = snapshot.price;
    let freight_cost = snapshot.shipping_cost.unwrap_or(0.0);
    let supplier_days = supplier_handling_days(snapshot, cfg.provider_handling_days, today);
    let combined = (cfg.omd_handling_days + supplier_days).min(MAX_COMBINED_HANDLING_DAYS);

    let (quantity, availability) = if cents(price) == 0 {
        (0, Availability::OutOfStock)
    } else if !snapshot.available {
        (0, Availability::OutOfStock)
    } else if snapshot.raw_stock < cfg.low_stock_cutoff {
        (0, Availability::OutOfStock)
    } else if snapshot.raw_stock <= cfg.stock_level {
        (snapshot.raw_stock, Availability::InStock)
    } else {
        (cfg.stock_level, Availability::InStock)
    };

    DerivedFields {
        price,
        freight_cost,
        total_price: price + freight_cost,
        quantity,
        availability,
        supplier_handling_days: supplier_days,
        combined_handling_days: combined,
    }
}

/// Monetary values are compared in whole cents so equal amounts that arrived
/// through different encodings never register as a change.
fn cents(v: f64) -> i64 {
    (v * 100.0).round() as i64
}

/// True if persisting `derived` would change the stored row.
pub fn differs(row: &ProductRecord, derived: &DerivedFields) -> bool {
    cents(row.price) != cents(derived.price)
        || cents(row.freight_cost) != cents(derived.freight_cost)
        || cents(row.total_price) != cents(derived.total_price)
        || row.quantity != derived.quantity
        || row.availability != derived.availability
        || row.supplier_handling_days != derived.supplier_handling_days
        || row.combined_handling_days != derived.combined_handling_days
}

#[derive(Default)]
struct SweepCounters {
    updated: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
    progressed: AtomicU64,
}

struct SweepCtx {
    pool: Pool,
    client: Arc<dyn SupplierClient>,
    cfg: SourceConfig,
    source_id: String,
    limiter: Arc<RateLimiter>,
    skiplist: Arc<Mutex<SkipList>>,
    counters: SweepCounters,
    /// Transient failures seen during this run, queued for the second pass.
    transients: std::sync::Mutex<Vec<String>>,
    hooks: RunHooks,
}

/// One reconcile engine per source. The skip ledger lives on the engine, so
/// repeated sweeps through the same instance honor earlier cool-downs.
pub struct ReconcileEngine {
    pool: Pool,
    client: Arc<dyn SupplierClient>,
    cfg: SourceConfig,
    source_id: String,
    limiter: Arc<RateLimiter>,
    skiplist: Arc<Mutex<SkipList>>,
}

impl ReconcileEngine {
    pub fn new(
        pool: Pool,
        source_id: impl Into<String>,
        cfg: SourceConfig,
        client: Arc<dyn SupplierClient>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::per_second(cfg.requests_per_second));
        Self {
            pool,
            client,
            cfg,
            source_id: source_id.into(),
            limiter,
            skiplist: Arc::new(Mutex::new(SkipList::new())),
        }
    }

    /// Run a full sweep: main pass over all eligible products, then one
    /// lower-concurrency pass over the transient failures. Per-product
    /// failures never abort the sweep; the summary is always returned.
    #[instrument(skip_all)]
    pub async fn reconcile_source(&self, hooks: RunHooks) -> Result<SweepSummary> {
        let products = db::products_for_source(&self.pool, &self.source_id)
            .await
            .context("cannot load product rows")?;

        let mut eligible = Vec::with_capacity(products.len());
        {
            let mut ledger = self.skiplist.lock().await;
            for product in products {
                if ledger.should_skip(&product.sku) {
                    continue;
                }
                eligible.push(product);
            }
        }
        info!(
            source_id = %self.source_id,
            products = eligible.len(),
            "starting reconcile sweep"
        );

        let ctx = Arc::new(SweepCtx {
            pool: self.pool.clone(),
            client: self.client.clone(),
            cfg: self.cfg.clone(),
            source_id: self.source_id.clone(),
            limiter: self.limiter.clone(),
            skiplist: self.skiplist.clone(),
            counters: SweepCounters::default(),
            transients: std::sync::Mutex::new(Vec::new()),
            hooks: hooks.clone(),
        });

        self.run_pass(ctx.clone(), eligible, self.cfg.concurrency)
            .await;

        // Second pass: reclaim this run's transient failures at reduced fan-out.
        if !hooks.cancelled() {
            let retry_skus: Vec<String> = {
                let mut queued = ctx.transients.lock().expect("transient list poisoned");
                std::mem::take(&mut *queued)
            };
            if !retry_skus.is_empty() {
                info!(
                    source_id = %self.source_id,
                    retries = retry_skus.len(),
                    "re-running transient failures"
                );
                let mut retry_rows = Vec::with_capacity(retry_skus.len());
                {
                    let mut ledger = self.skiplist.lock().await;
                    for sku in &retry_skus {
                        ledger.remove(sku);
                    }
                }
                for sku in retry_skus {
                    if let Some(row) = db::get_product(&self.pool, &self.source_id, &sku).await? {
                        retry_rows.push(row);
                    }
                }
                // Failures from the first pass were already counted; the rerun
                // settles them as updated/unchanged or re-fails them.
                ctx.counters
                    .failed
                    .fetch_sub(retry_rows.len() as u64, Ordering::SeqCst);
                let reduced = (self.cfg.concurrency / 2).max(1);
                self.run_pass(ctx.clone(), retry_rows, reduced).await;
            }
        }

        let summary = SweepSummary {
            updated: ctx.counters.updated.load(Ordering::SeqCst),
            unchanged: ctx.counters.unchanged.load(Ordering::SeqCst),
            failed: ctx.counters.failed.load(Ordering::SeqCst),
        };
        info!(
            source_id = %self.source_id,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "reconcile sweep finished"
        );
        Ok(summary)
    }

    async fn run_pass(&self, ctx: Arc<SweepCtx>, rows: Vec<ProductRecord>, concurrency: usize) {
        let executor = Executor::new(concurrency);
        for row in rows {
            // Cancellation lets in-flight products finish but starts no more.
            if ctx.hooks.cancelled() {
                warn!(source_id = %self.source_id, "cancellation requested; stopping sweep");
                break;
            }
            let ctx = ctx.clone();
            executor.submit(async move {
                process_product(&ctx, row).await;
            });
        }
        executor.drain().await;
    }
}

/// Fetch, derive, diff and persist one product. Every failure is converted
/// into counters/ledger entries; nothing escapes the task.
async fn process_product(ctx: &SweepCtx, row: ProductRecord) {
    ctx.limiter.acquire().await;
    let sku = row.sku.clone();

    match fetch_with_retry(ctx.client.as_ref(), &sku, FETCH_ATTEMPTS).await {
        Ok(snapshot) => {
            let derived = derive_fields(&snapshot, &ctx.cfg, chrono::Utc::now().date_naive());
            if differs(&row, &derived) {
                match db::apply_derived_fields(
                    &ctx.pool,
                    &ctx.source_id,
                    &sku,
                    &derived,
                    ctx.cfg.update_flag_value,
                )
                .await
                {
                    Ok(()) => {
                        info!(
                            sku,
                            availability = derived.availability.as_str(),
                            quantity = derived.quantity,
                            price = derived.price,
                            "product updated and flagged"
                        );
                        ctx.counters.updated.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        warn!(?err, sku, "failed to persist derived fields");
                        ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            } else {
                if let Err(err) = db::touch_last_checked(&ctx.pool, &ctx.source_id, &sku).await {
                    warn!(?err, sku, "failed to touch last_checked_at");
                }
                ctx.counters.unchanged.fetch_add(1, Ordering::SeqCst);
            }
        }
        Err(FetchError::UpstreamServer { status }) => {
            // A 5xx from the supplier is an availability signal: pull the
            // listing proactively instead of leaving stale stock on it.
            warn!(sku, status, "supplier 5xx; forcing listing out of stock");
            match db::force_out_of_stock(&ctx.pool, &ctx.source_id, &sku, ctx.cfg.update_flag_value)
                .await
            {
                Ok(()) => {
                    ctx.counters.updated.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    warn!(?err, sku, "failed to force row out of stock");
                    ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        Err(err) => {
            let reason = match err {
                FetchError::NotFound => SkipReason::NotFound,
                _ => SkipReason::Transient,
            };
            warn!(sku, error = %err, "fetch failed; adding to skip ledger");
            if let Err(db_err) = db::touch_last_checked(&ctx.pool, &ctx.source_id, &sku).await {
                warn!(?db_err, sku, "failed to touch last_checked_at");
            }
            ctx.skiplist.lock().await.record(&sku, reason);
            if reason == SkipReason::Transient {
                ctx.transients
                    .lock()
                    .expect("transient list poisoned")
                    .push(sku.clone());
            }
            ctx.counters.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    let done = ctx.counters.progressed.fetch_add(1, Ordering::SeqCst) + 1;
    ctx.hooks.report_progress(done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn cfg() -> SourceConfig {
        SourceConfig {
            provider: ProviderKind::BestBuy,
            api_base_url: "http://localhost".into(),
            requests_per_second: 100,
            concurrency: 5,
            stock_level: 20,
            low_stock_cutoff: 4,
            omd_handling_days: 1,
            provider_handling_days: 3,
            update_flag_value: 4,
            batch_size: 5000,
        }
    }

    fn snapshot(price: f64, raw_stock: i64, available: bool) -> Snapshot {
        Snapshot {
            price,
            raw_stock,
            available,
            ..Default::default()
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
    }

    #[test]
    fn zero_price_wins_over_stock() {
        let d = derive_fields(&snapshot(0.0, 50, true), &cfg(), today());
        assert_eq!(d.quantity, 0);
        assert_eq!(d.availability, Availability::OutOfStock);
    }

    #[test]
    fn unavailable_signal_zeroes_quantity() {
        let d = derive_fields(&snapshot(19.99, 50, false), &cfg(), today());
        assert_eq!(d.quantity, 0);
        assert_eq!(d.availability, Availability::OutOfStock);
    }

    #[test]
    fn low_residual_stock_is_not_listed() {
        let d = derive_fields(&snapshot(19.99, 3, true), &cfg(), today());
        assert_eq!(d.quantity, 0);
        assert_eq!(d.availability, Availability::OutOfStock);
    }

    #[test]
    fn in_range_stock_passes_through() {
        let d = derive_fields(&snapshot(19.99, 4, true), &cfg(), today());
        assert_eq!((d.quantity, d.availability), (4, Availability::InStock));

        let d = derive_fields(&snapshot(19.99, 20, true), &cfg(), today());
        assert_eq!((d.quantity, d.availability), (20, Availability::InStock));
    }

    #[test]
    fn over_level_stock_is_capped() {
        let d = derive_fields(&snapshot(19.99, 21, true), &cfg(), today());
        assert_eq!((d.quantity, d.availability), (20, Availability::InStock));
    }

    #[test]
    fn combined_handling_is_capped_at_29() {
        let mut c = cfg();
        c.omd_handling_days = 20;
        c.provider_handling_days = 15;
        let d = derive_fields(&snapshot(19.99, 10, true), &c, today());
        assert_eq!(d.supplier_handling_days, 15);
        assert_eq!(d.combined_handling_days, 29);
    }

    #[test]
    fn freight_flows_into_total() {
        let mut s = snapshot(10.0, 10, true);
        s.shipping_cost = Some(2.5);
        let d = derive_fields(&s, &cfg(), today());
        assert_eq!(cents(d.total_price), 1250);
    }

    #[test]
    fn diff_ignores_sub_cent_noise() {
        let d = derive_fields(&snapshot(19.99, 10, true), &cfg(), today());
        let row = ProductRecord {
            source_id: "bestbuy".into(),
            sku: "100".into(),
            listing_sku: "SEBB100".into(),
            price: 19.990000001,
            freight_cost: 0.0,
            total_price: 19.99,
            quantity: 10,
            availability: Availability::InStock,
            omd_handling_days: 1,
            supplier_handling_days: 3,
            combined_handling_days: 4,
            update_flag: 0,
            last_checked_at: None,
        };
        assert!(!differs(&row, &d));

        let mut changed = row.clone();
        changed.quantity = 9;
        assert!(differs(&changed, &d));
    }
}
