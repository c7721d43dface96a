//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::Availability;
use chrono::{DateTime, Utc};

/// Full product row as stored, read by the reconcile sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRecord {
    pub source_id: String,
    pub sku: String,
    pub listing_sku: String,
    pub price: f64,
    pub freight_cost: f64,
    pub total_price: f64,
    pub quantity: i64,
    pub availability: Availability,
    pub omd_handling_days: i64,
    pub supplier_handling_days: i64,
    pub combined_handling_days: i64,
    pub update_flag: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Fields the reconcile sweep derives from a fresh supplier snapshot and
/// persists when they differ from the stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFields {
    pub price: f64,
    pub freight_cost: f64,
    pub total_price: f64,
    pub quantity: i64,
    pub availability: Availability,
    pub supplier_handling_days: i64,
    pub combined_handling_days: i64,
}

/// Projection of a flagged row used by the feed submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlaggedRow {
    pub listing_sku: String,
    pub quantity: i64,
    pub combined_handling_days: i64,
}
