//! Skip/Retry ledger: remembers products whose fetch recently failed so the
//! next sweep does not immediately hammer them again, and keeps the
//! transiently-failed subset around for a second reprocessing pass.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Entries expire after this cool-down and are evicted lazily on the next
/// encounter.
const COOL_DOWN_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Supplier definitively does not know the SKU.
    NotFound,
    /// Retries were exhausted on a transient failure; worth a later retry.
    Transient,
}

#[derive(Debug, Clone)]
pub struct SkipEntry {
    pub reason: SkipReason,
    pub added_at: DateTime<Utc>,
}

/// Per-source, process-local ledger. Callers wrap it in a lock when shared
/// across workers.
#[derive(Debug, Default)]
pub struct SkipList {
    entries: HashMap<String, SkipEntry>,
}

impl SkipList {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `sku` failed within the cool-down window. An expired entry is
    /// removed and no longer skips.
    pub fn should_skip(&mut self, sku: &str) -> bool {
        self.should_skip_at(sku, Utc::now())
    }

    fn should_skip_at(&mut self, sku: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(sku) {
            Some(entry) if now - entry.added_at < Duration::hours(COOL_DOWN_HOURS) => true,
            Some(_) => {
                debug!(sku, "skip entry expired; removing");
                self.entries.remove(sku);
                false
            }
            None => false,
        }
    }

    pub fn record(&mut self, sku: &str, reason: SkipReason) {
        self.entries.insert(
            sku.to_string(),
            SkipEntry {
                reason,
                added_at: Utc::now(),
            },
        );
    }

    /// Drop an entry so a retry pass can re-attempt the SKU immediately; the
    /// pass re-records it if it fails again.
    pub fn remove(&mut self, sku: &str) {
        self.entries.remove(sku);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
