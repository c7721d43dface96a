//! Supplier clients: one implementation per external catalog, all normalizing
//! heterogeneous responses into a canonical [`Snapshot`]. Retry, rate limiting
//! and diffing live in the reconcile engine, not here; each client performs
//! exactly one outbound call per invocation.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub mod bestbuy;
pub mod vitacost;

pub use bestbuy::BestBuyClient;
pub use vitacost::VitacostClient;

/// Canonical product state as reported by a supplier at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub price: f64,
    pub raw_stock: i64,
    pub available: bool,
    pub min_delivery_date: Option<NaiveDate>,
    pub max_delivery_date: Option<NaiveDate>,
    pub brand: Option<String>,
    pub shipping_cost: Option<f64>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The supplier definitively does not know this SKU. Never retried.
    #[error("product not found")]
    NotFound,
    /// The supplier's endpoint is erroring. Treated downstream as an
    /// availability signal, not a plain failure.
    #[error("upstream server error (status {status})")]
    UpstreamServer { status: u16 },
    /// Network trouble, timeouts, malformed envelopes. Retried with backoff.
    #[error("transient fetch failure: {0}")]
    Transient(String),
}

impl FetchError {
    /// Terminal failures must not burn retry budget.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchError::NotFound | FetchError::UpstreamServer { .. }
        )
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> FetchError {
        FetchError::Transient(err.to_string())
    }
}

#[async_trait]
pub trait SupplierClient: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetch the current snapshot for one SKU. One outbound call, no retry.
    async fn fetch_snapshot(&self, sku: &str) -> Result<Snapshot, FetchError>;
}

/// Attempts per product fetch; the first failure sleeps 1s, doubling up to 5s.
pub const FETCH_ATTEMPTS: u32 = 3;

/// Wrap a client call in a bounded retry. Terminal failures (`NotFound`,
/// 5xx) are returned immediately without consuming further attempts.
pub async fn fetch_with_retry(
    client: &dyn SupplierClient,
    sku: &str,
    max_attempts: u32,
) -> Result<Snapshot, FetchError> {
    let mut attempt = 1u32;
    loop {
        match client.fetch_snapshot(sku).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(err) if err.is_terminal() => return Err(err),
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                let secs = (1u64 << (attempt - 1)).min(5);
                warn!(
                    sku,
                    attempt,
                    delay_secs = secs,
                    error = %err,
                    "transient fetch failure; retrying"
                );
                tokio::time::sleep(Duration::from_secs(secs)).await;
                attempt += 1;
            }
        }
    }
}

/// Supplier handling contribution in days: midpoint of the delivery window
/// relative to `today`, floored at one day; falls back to the configured
/// default when the snapshot carries no usable window.
pub fn supplier_handling_days(snapshot: &Snapshot, default_days: i64, today: NaiveDate) -> i64 {
    match (snapshot.min_delivery_date, snapshot.max_delivery_date) {
        (Some(min), Some(max)) => {
            let span = (max - min).num_days();
            let midpoint = min + chrono::Duration::days(span / 2);
            (midpoint - today).num_days().max(1)
        }
        _ => default_days,
    }
}

// Lenient field readers shared by the client variants. Suppliers encode
// numbers and booleans inconsistently (raw, quoted, missing); a
// malformed-but-present field canonicalizes to 0/false rather than erroring.

pub(crate) fn json_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().replace(['$', ','], "").parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub(crate) fn json_i64(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn json_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

pub(crate) fn json_date(v: &Value) -> Option<NaiveDate> {
    v.as_str()
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
}

/// Map an HTTP status to the fetch error taxonomy. Statuses below 500 other
/// than 404/429 are malformed-request territory and treated as transient so
/// the sweep records them without special-casing.
pub(crate) fn status_to_error(status: reqwest::StatusCode) -> FetchError {
    if status == reqwest::StatusCode::NOT_FOUND {
        FetchError::NotFound
    } else if status.is_server_error() {
        FetchError::UpstreamServer {
            status: status.as_u16(),
        }
    } else {
        FetchError::Transient(format!("unexpected status {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        calls: AtomicU32,
        fail_with: fn() -> FetchError,
        succeed_after: u32,
    }

    #[async_trait]
    impl SupplierClient for FlakyClient {
        fn source_id(&self) -> &str {
            "test"
        }

        async fn fetch_snapshot(&self, _sku: &str) -> Result<Snapshot, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_after {
                Ok(Snapshot {
                    price: 9.99,
                    raw_stock: 10,
                    available: true,
                    ..Default::default()
                })
            } else {
                Err((self.fail_with)())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_with: || FetchError::Transient("boom".into()),
            succeed_after: 3,
        };
        let snapshot = fetch_with_retry(&client, "100", FETCH_ATTEMPTS).await.unwrap();
        assert_eq!(snapshot.raw_stock, 10);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_fails_fast() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_with: || FetchError::NotFound,
            succeed_after: 99,
        };
        let err = fetch_with_retry(&client, "100", FETCH_ATTEMPTS).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_fails_fast() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_with: || FetchError::UpstreamServer { status: 503 },
            succeed_after: 99,
        };
        let err = fetch_with_retry(&client, "100", FETCH_ATTEMPTS).await.unwrap_err();
        assert!(matches!(err, FetchError::UpstreamServer { status: 503 }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lenient_readers_never_fail() {
        assert_eq!(json_f64(&json!("19.99")), 19.99);
        assert_eq!(json_f64(&json!("$1,399.99")), 1399.99);
        assert_eq!(json_f64(&json!("n/a")), 0.0);
        assert_eq!(json_f64(&json!(null)), 0.0);

        assert_eq!(json_i64(&json!("12")), 12);
        assert_eq!(json_i64(&json!(7.9)), 7);
        assert_eq!(json_i64(&json!({})), 0);

        assert!(json_bool(&json!(true)));
        assert!(json_bool(&json!("YES")));
        assert!(json_bool(&json!(1)));
        assert!(!json_bool(&json!("nope")));
        assert!(!json_bool(&json!(null)));
    }

    #[test]
    fn handling_days_uses_window_midpoint() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let snapshot = Snapshot {
            min_delivery_date: NaiveDate::from_ymd_opt(2026, 8, 5),
            max_delivery_date: NaiveDate::from_ymd_opt(2026, 8, 11),
            ..Default::default()
        };
        // midpoint is Aug 8 → 7 days out
        assert_eq!(supplier_handling_days(&snapshot, 3, today), 7);
    }

    #[test]
    fn handling_days_floors_at_one() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 10).unwrap();
        let snapshot = Snapshot {
            min_delivery_date: NaiveDate::from_ymd_opt(2026, 8, 1),
            max_delivery_date: NaiveDate::from_ymd_opt(2026, 8, 3),
            ..Default::default()
        };
        assert_eq!(supplier_handling_days(&snapshot, 3, today), 1);
    }

    #[test]
    fn handling_days_falls_back_to_default() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let snapshot = Snapshot {
            min_delivery_date: NaiveDate::from_ymd_opt(2026, 8, 5),
            max_delivery_date: None,
            ..Default::default()
        };
        assert_eq!(supplier_handling_days(&snapshot, 3, today), 3);
    }
}
