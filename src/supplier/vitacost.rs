//! Vitacost style supplier endpoint: `GET {base}/{sku}` returning a nested
//! product document with an inventory count and a delivery-date window.

use super::{json_bool, json_date, json_f64, json_i64, status_to_error, FetchError, Snapshot, SupplierClient};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub struct VitacostClient {
    http: Client,
    base_url: String,
    source_id: String,
}

impl VitacostClient {
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
        let product = &body["product"];
        if !product.is_object() {
            return Err(FetchError::Transient("missing product object".into()));
        }

        let inventory = &product["inventory"];
        let delivery = &product["delivery"];
        let snapshot = Snapshot {
            price: json_f64(&product["price"]["amount"]),
            raw_stock: json_i64(&inventory["count"]),
            available: json_bool(&inventory["in_stock"]),
            min_delivery_date: json_date(&delivery["min_date"]),
            max_delivery_date: json_date(&delivery["max_date"]),
            brand: product["brand"].as_str().map(str::to_string).filter(|s| !s.is_empty()),
            shipping_cost: product["price"].get("shipping").map(json_f64),
        };
        debug!(
            sku,
            price = snapshot.price,
            raw_stock = snapshot.raw_stock,
            "vitacost snapshot"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl SupplierClient for VitacostClient {
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
