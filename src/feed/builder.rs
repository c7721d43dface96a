//! Feed document construction and schema validation.
//!
//! A feed is one JSON document per batch of flagged rows, one
//! `PARTIAL_UPDATE` message per row. Documents that fail validation are never
//! submitted; the caller logs the violations and moves on to the next batch.

use crate::db::FlaggedRow;
use serde_json::{json, Value};
use tracing::warn;

/// Hard marketplace ceiling on messages per feed document. Nominal batch
/// sizes above this are clamped, never honored.
pub const MAX_FEED_MESSAGES: usize = 9990;

/// Marketplace ceiling on `lead_time_to_ship_max_days`.
const MAX_LEAD_TIME_DAYS: i64 = 30;

/// Build the listing-update document for one batch.
pub fn build_feed(seller_id: &str, rows: &[FlaggedRow]) -> Value {
    let messages: Vec<Value> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            json!({
                "messageId": i + 1,
                "sku": row.listing_sku,
                "operationType": "PARTIAL_UPDATE",
                "productType": "PRODUCT",
                "attributes": {
                    "fulfillment_availability": [
                        {
                            "fulfillment_channel_code": "DEFAULT",
                            "quantity": row.quantity,
                            "lead_time_to_ship_max_days": row.combined_handling_days,
                        }
                    ]
                }
            })
        })
        .collect();

    json!({
        "header": {
            "sellerId": seller_id,
            "version": "2.0",
            "issueLocale": "en_US",
        },
        "messages": messages,
    })
}

/// A single schema violation found in a built feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON-pointer-ish location, e.g. `messages[3].sku`.
    pub path: String,
    pub problem: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.problem)
    }
}

/// Check a built feed against the marketplace's message schema. Returns
/// whether the feed may be submitted plus every violation found.
pub fn validate_feed(feed: &Value) -> (bool, Vec<Violation>) {
    let mut violations = Vec::new();
    let mut push = |path: &str, problem: String| {
        violations.push(Violation {
            path: path.to_string(),
            problem,
        })
    };

    match feed["header"]["sellerId"].as_str() {
        Some(id) if !id.trim().is_empty() => {}
        _ => push("header.sellerId", "must be a non-empty string".into()),
    }
    if feed["header"]["version"].as_str() != Some("2.0") {
        push("header.version", "must be \"2.0\"".into());
    }

    let Some(messages) = feed["messages"].as_array() else {
        push("messages", "must be an array".into());
        return (false, violations);
    };
    if messages.is_empty() {
        push("messages", "must not be empty".into());
    }
    if messages.len() > MAX_FEED_MESSAGES {
        push(
            "messages",
            format!("{} messages exceeds ceiling {MAX_FEED_MESSAGES}", messages.len()),
        );
    }

    for (i, message) in messages.iter().enumerate() {
        let at = |field: &str| format!("messages[{i}].{field}");

        match message["messageId"].as_u64() {
            Some(id) if id >= 1 => {}
            _ => push(&at("messageId"), "must be a positive integer".into()),
        }
        match message["sku"].as_str() {
            Some(sku) if !sku.trim().is_empty() => {}
            _ => push(&at("sku"), "must be a non-empty string".into()),
        }
        if message["operationType"].as_str() != Some("PARTIAL_UPDATE") {
            push(&at("operationType"), "must be \"PARTIAL_UPDATE\"".into());
        }

        let fulfillment = &message["attributes"]["fulfillment_availability"][0];
        match fulfillment["quantity"].as_i64() {
            Some(q) if q >= 0 => {}
            _ => push(
                &at("attributes.fulfillment_availability[0].quantity"),
                "must be a non-negative integer".into(),
            ),
        }
        match fulfillment["lead_time_to_ship_max_days"].as_i64() {
            Some(d) if (0..=MAX_LEAD_TIME_DAYS).contains(&d) => {}
            _ => push(
                &at("attributes.fulfillment_availability[0].lead_time_to_ship_max_days"),
                format!("must be an integer in 0..={MAX_LEAD_TIME_DAYS}"),
            ),
        }
    }

    (violations.is_empty(), violations)
}

/// Partition flagged rows into submission batches. The nominal size is
/// clamped to [`MAX_FEED_MESSAGES`]: the marketplace constraint wins over
/// configuration, with a logged adjustment.
pub fn partition_batches(rows: Vec<FlaggedRow>, nominal_size: usize) -> Vec<Vec<FlaggedRow>> {
    let size = if nominal_size == 0 || nominal_size > MAX_FEED_MESSAGES {
        warn!(
            nominal_size,
            clamped = MAX_FEED_MESSAGES,
            "nominal batch size clamped to marketplace ceiling"
        );
        MAX_FEED_MESSAGES
    } else {
        nominal_size
    };

    let mut batches = Vec::with_capacity(rows.len().div_ceil(size));
    let mut rows = rows;
    while rows.len() > size {
        let rest = rows.split_off(size);
        batches.push(rows);
        rows = rest;
    }
    if !rows.is_empty() {
        batches.push(rows);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(listing_sku: &str, quantity: i64, days: i64) -> FlaggedRow {
        FlaggedRow {
            listing_sku: listing_sku.to_string(),
            quantity,
            combined_handling_days: days,
        }
    }

    #[test]
    fn builds_schema_shaped_feed() {
        let feed = build_feed("SELLER", &[row("SEVC1", 12, 4), row("SEVC2", 0, 29)]);
        assert_eq!(feed["header"]["sellerId"], "SELLER");
        assert_eq!(feed["header"]["version"], "2.0");
        assert_eq!(feed["messages"][0]["messageId"], 1);
        assert_eq!(feed["messages"][1]["messageId"], 2);
        assert_eq!(feed["messages"][1]["sku"], "SEVC2");
        assert_eq!(
            feed["messages"][0]["attributes"]["fulfillment_availability"][0]["quantity"],
            12
        );
        assert_eq!(
            feed["messages"][1]["attributes"]["fulfillment_availability"][0]
                ["lead_time_to_ship_max_days"],
            29
        );

        let (ok, violations) = validate_feed(&feed);
        assert!(ok, "unexpected violations: {violations:?}");
    }

    #[test]
    fn validation_collects_violations() {
        let mut feed = build_feed("SELLER", &[row("SEVC1", 12, 4)]);
        feed["header"]["sellerId"] = serde_json::Value::String("  ".into());
        feed["messages"][0]["sku"] = serde_json::Value::String("".into());
        feed["messages"][0]["attributes"]["fulfillment_availability"][0]
            ["lead_time_to_ship_max_days"] = serde_json::json!(45);

        let (ok, violations) = validate_feed(&feed);
        assert!(!ok);
        let paths: Vec<&str> = violations.iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"header.sellerId"));
        assert!(paths.contains(&"messages[0].sku"));
        assert!(paths
            .iter()
            .any(|p| p.contains("lead_time_to_ship_max_days")));
    }

    #[test]
    fn empty_feed_is_invalid() {
        let feed = build_feed("SELLER", &[]);
        let (ok, _) = validate_feed(&feed);
        assert!(!ok);
    }

    #[test]
    fn partitions_respect_ceiling() {
        let rows: Vec<FlaggedRow> = (0..25).map(|i| row(&format!("S{i}"), 1, 1)).collect();

        let batches = partition_batches(rows.clone(), 10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[2].len(), 5);

        // a nominal size above the hard ceiling is clamped
        let batches = partition_batches(rows, MAX_FEED_MESSAGES + 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 25);
    }

    #[test]
    fn partition_count_is_ceil_of_rows_over_size() {
        for n in [0usize, 1, 9, 10, 11, 30] {
            let rows: Vec<FlaggedRow> = (0..n).map(|i| row(&format!("S{i}"), 1, 1)).collect();
            let batches = partition_batches(rows, 10);
            assert_eq!(batches.len(), n.div_ceil(10));
            assert!(batches.iter().all(|b| b.len() <= 10));
        }
    }
}
