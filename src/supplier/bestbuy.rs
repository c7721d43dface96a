//! Best Buy style supplier endpoint: `GET {base}/{sku}` returning a flat
//! `{success, data: {...}}` envelope.

use super::{json_bool, json_f64, json_i64, status_to_error, FetchError, Snapshot, SupplierClient};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Stand-in stock count for payloads that report availability without a
/// count; high enough that the reconcile policy caps it at the configured
/// stock level.
const UNCOUNTED_STOCK: i64 = 9999;

pub struct BestBuyClient {
    http: Client,
    base_url: String,
    source_id: String,
}

impl BestBuyClient {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .user_agent("omd-sync/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            source_id: source_id.into(),
        }
    }

    fn parse_payload(&self, sku: &str, body: &Value) -> Result<Snapshot, FetchError> {
        if !json_bool(&body["success"]) {
            // The proxy answers 200 with success=false for unknown SKUs.
            return Err(FetchError::NotFound);
        }
        let data = &body["data"];
        if !data.is_object() {
            return Err(FetchError::Transient("missing data object".into()));
        }

        let availability = data["availability"]
            .as_str()
            .map(|s| s.trim().eq_ignore_ascii_case("instock"))
            .unwrap_or_else(|| json_bool(&data["availability"]));
        let raw_stock = if data.get("stock").is_some() {
            json_i64(&data["stock"])
        } else if availability {
            UNCOUNTED_STOCK
        } else {
            0
        };

        let snapshot = Snapshot {
            price: json_f64(&data["price"]),
            raw_stock,
            available: availability,
            min_delivery_date: None,
            max_delivery_date: None,
            brand: data["brand"].as_str().map(str::to_string).filter(|s| !s.is_empty()),
            shipping_cost: data.get("shipping").map(json_f64),
        };
        debug!(
            sku,
            price = snapshot.price,
            available = snapshot.available,
            "bestbuy snapshot"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl SupplierClient for BestBuyClient {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_snapshot(&self, sku: &str) -> Result<Snapshot, FetchError> {
        let url = format!("{}/{}", self.base_url, sku);
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        if !res.status().is_success() {
            return Err(status_to_error(res.status()));
        }
        let body: Value = res.json().await.map_err(FetchError::from_reqwest)?;
        self.parse_payload(sku, &body)
    }
}
