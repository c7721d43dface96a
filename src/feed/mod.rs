//! Marketplace feed API: the async trait the submission engine talks to, the
//! HTTP implementation against the listing service, and the process-wide
//! throttle gate shared by everything that can receive a 429.

use crate::config::Marketplace;
use crate::model::FeedStatus;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

pub mod builder;
pub mod report;

#[derive(Debug, Error)]
pub enum FeedError {
    /// HTTP 429 from any step. The caller trips the shared throttle gate and
    /// retries the same step; never a permanent failure.
    #[error("marketplace throttled the request")]
    Throttled,
    /// Authentication is broken; propagates as a whole-run failure.
    #[error("marketplace authentication failed: {0}")]
    Auth(String),
    #[error("marketplace error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Write target plus id for a newly created feed document.
#[derive(Debug, Clone)]
pub struct FeedDocument {
    pub document_id: String,
    pub upload_url: String,
}

#[derive(Debug, Clone)]
pub struct FeedStatusInfo {
    pub status: FeedStatus,
    pub result_document_id: Option<String>,
}

/// The marketplace's asynchronous batch-feed surface. One method per protocol
/// step so tests can script each transition.
#[async_trait]
pub trait FeedApi: Send + Sync {
    async fn create_document(&self) -> Result<FeedDocument, FeedError>;

    async fn upload(&self, upload_url: &str, content: &str) -> Result<(), FeedError>;

    /// Submit an uploaded document for processing; returns the submission id.
    async fn submit(&self, document_id: &str, marketplace_id: &str) -> Result<String, FeedError>;

    async fn get_status(&self, submission_id: &str) -> Result<FeedStatusInfo, FeedError>;

    /// Resolve a result document id to its download URL.
    async fn get_document_url(&self, document_id: &str) -> Result<String, FeedError>;

    async fn download(&self, url: &str) -> Result<Vec<u8>, FeedError>;
}

/// Process-wide back-off shared by every submission engine. A 429 anywhere
/// holds all marketplace traffic for the configured window, which protects
/// against cascading throttling across batches and sources.
pub struct ThrottleGate {
    backoff: Duration,
    held_until: std::sync::Mutex<Option<Instant>>,
}

impl ThrottleGate {
    pub fn new(backoff: Duration) -> Self {
        Self {
            backoff,
            held_until: std::sync::Mutex::new(None),
        }
    }

    pub fn trip(&self) {
        let until = Instant::now() + self.backoff;
        *self.held_until.lock().expect("throttle gate poisoned") = Some(until);
        warn!(backoff_secs = self.backoff.as_secs(), "throttle gate tripped");
    }

    /// Suspend until any active hold expires. Returns immediately when the
    /// gate is open.
    pub async fn wait_if_held(&self) {
        let deadline = *self.held_until.lock().expect("throttle gate poisoned");
        if let Some(deadline) = deadline {
            if deadline > Instant::now() {
                tokio::time::sleep_until(deadline).await;
            }
        }
    }
}

const AUTH_GRANT: &str = "refresh_token";
const FEEDS_PATH: &str = "/feeds/2021-06-30/feeds";
const DOCUMENTS_PATH: &str = "/feeds/2021-06-30/documents";
const FEED_TYPE: &str = "JSON_LISTINGS_FEED";

/// HTTP client for the listing service's feed endpoints. Obtains an access
/// token through the refresh-token grant and caches it for the process
/// lifetime.
pub struct SpFeedClient {
    http: Client,
    cfg: Marketplace,
    token: Mutex<Option<String>>,
}

impl fmt::Debug for SpFeedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpFeedClient")
            .field("endpoint", &self.cfg.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct CreateDocumentResponse {
    #[serde(rename = "feedDocumentId")]
    feed_document_id: String,
    url: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(rename = "feedId")]
    feed_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(rename = "processingStatus")]
    processing_status: String,
    #[serde(rename = "resultFeedDocumentId")]
    result_feed_document_id: Option<String>,
}

#[derive(Deserialize)]
struct DocumentResponse {
    url: String,
}

impl SpFeedClient {
    pub fn new(cfg: Marketplace) -> Self {
        let http = Client::builder()
            .user_agent("omd-sync/0.1")
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client");
        Self {
            http,
            cfg,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, FeedError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let res = self
            .http
            .post(&self.cfg.auth_url)
            .form(&[
                ("grant_type", AUTH_GRANT),
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str()),
                ("refresh_token", self.cfg.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|err| FeedError::Auth(err.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(FeedError::Auth(format!("token endpoint {status}: {body}")));
        }
        let payload: TokenResponse = res
            .json()
            .await
            .map_err(|err| FeedError::Auth(err.to_string()))?;
        info!("marketplace access token obtained");
        *cached = Some(payload.access_token.clone());
        Ok(payload.access_token)
    }

    /// Map a non-success response to the feed error taxonomy, lifting 429
    /// into `Throttled` so callers can trip the shared gate.
    async fn check(res: reqwest::Response) -> Result<reqwest::Response, FeedError> {
        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(FeedError::Throttled);
        }
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(FeedError::Api { status, body });
        }
        Ok(res)
    }
}

#[async_trait]
impl FeedApi for SpFeedClient {
    async fn create_document(&self) -> Result<FeedDocument, FeedError> {
        let token = self.access_token().await?;
        let res = self
            .http
            .post(format!("{}{}", self.cfg.endpoint, DOCUMENTS_PATH))
            .header("x-amz-access-token", token)
            .json(&json!({"contentType": "application/json"}))
            .send()
            .await?;
        let payload: CreateDocumentResponse = Self::check(res).await?.json().await?;
        Ok(FeedDocument {
            document_id: payload.feed_document_id,
            upload_url: payload.url,
        })
    }

    async fn upload(&self, upload_url: &str, content: &str) -> Result<(), FeedError> {
        // The upload target is pre-signed; no marketplace auth header.
        let res = self
            .http
            .put(upload_url)
            .header("Content-Type", "application/json")
            .body(content.to_string())
            .send()
            .await?;
        Self::check(res).await?;
        Ok(())
    }

    async fn submit(&self, document_id: &str, marketplace_id: &str) -> Result<String, FeedError> {
        let token = self.access_token().await?;
        let res = self
            .http
            .post(format!("{}{}", self.cfg.endpoint, FEEDS_PATH))
            .header("x-amz-access-token", token)
            .json(&json!({
                "feedType": FEED_TYPE,
                "marketplaceIds": [marketplace_id],
                "inputFeedDocumentId": document_id,
            }))
            .send()
            .await?;
        let payload: SubmitResponse = Self::check(res).await?.json().await?;
        Ok(payload.feed_id)
    }

    async fn get_status(&self, submission_id: &str) -> Result<FeedStatusInfo, FeedError> {
        let token = self.access_token().await?;
        let res = self
            .http
            .get(format!("{}{}/{}", self.cfg.endpoint, FEEDS_PATH, submission_id))
            .header("x-amz-access-token", token)
            .send()
            .await?;
        let payload: StatusResponse = Self::check(res).await?.json().await?;
        Ok(FeedStatusInfo {
            status: FeedStatus::parse(&payload.processing_status),
            result_document_id: payload.result_feed_document_id,
        })
    }

    async fn get_document_url(&self, document_id: &str) -> Result<String, FeedError> {
        let token = self.access_token().await?;
        let res = self
            .http
            .get(format!("{}{}/{}", self.cfg.endpoint, DOCUMENTS_PATH, document_id))
            .header("x-amz-access-token", token)
            .send()
            .await?;
        let payload: DocumentResponse = Self::check(res).await?.json().await?;
        Ok(payload.url)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        let res = self.http.get(url).send().await?;
        let res = Self::check(res).await?;
        Ok(res.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn gate_holds_after_trip() {
        let gate = ThrottleGate::new(Duration::from_secs(300));
        let before = Instant::now();
        gate.wait_if_held().await; // open gate returns immediately
        assert_eq!(before.elapsed(), Duration::ZERO);

        gate.trip();
        gate.wait_if_held().await;
        assert!(before.elapsed() >= Duration::from_secs(300));

        // a second wait after expiry does not sleep again
        let after = Instant::now();
        gate.wait_if_held().await;
        assert_eq!(after.elapsed(), Duration::ZERO);
    }
}
