//! Decision service client.
//!
//! One POST per record, no retries. Every way an exchange can go wrong is reduced to a
//! failed [`ReplayOutcome`] plus a log line; nothing propagates past [`ReplayService::replay`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::classify::RequestRecord;
use crate::config::ClientConfig;
use crate::errors::RequestError;

/// `response.status` value meaning the service accepted and applied the request.
const SUCCESS_STATUS: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub identity: String,
    pub success: bool,
}

/// Something that can replay one captured request.
#[async_trait]
pub trait ReplayService: Send + Sync {
    async fn replay(&self, record: &RequestRecord) -> ReplayOutcome;
}

/// HTTP client for the downstream decision service
pub struct ServiceClient {
    http: Client,
    url: String,
    config: ClientConfig,
}

impl ServiceClient {
    pub fn new(url: impl Into<String>, config: &ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(0)
            .user_agent("fraud-replay/0.1")
            .build()
            .context("Failed to build decision service HTTP client")?;

        Ok(Self {
            http,
            url: url.into(),
            config: config.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends `payload` unmodified and checks the service's verdict.
    ///
    /// Waiting for the response head and reading the body are each bounded by
    /// `read_timeout`; connection setup is bounded by `connect_timeout` on the client.
    pub async fn post(&self, payload: &str) -> Result<(), RequestError> {
        let read_timeout = self.config.read_timeout;
        let request = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header(CONNECTION, "close")
            .body(payload.to_string());

        let response = timeout(read_timeout, request.send())
            .await
            .map_err(|_| RequestError::Timeout)?
            .map_err(transport_error)?;

        let status = response.status();
        let body = timeout(read_timeout, response.text())
            .await
            .map_err(|_| RequestError::Timeout)?
            .map_err(transport_error)?;

        classify_response(status, &body)
    }
}

#[async_trait]
impl ReplayService for ServiceClient {
    async fn replay(&self, record: &RequestRecord) -> ReplayOutcome {
        let result = self.post(&record.payload).await;

        match &result {
            Ok(()) => debug!(identity = %record.identity, "Replay accepted"),
            Err(e) => warn!(identity = %record.identity, error = %e, "Replay failed"),
        }

        // The response (and its connection) is already released at this point.
        if !self.config.post_request_delay.is_zero() {
            tokio::time::sleep(self.config.post_request_delay).await;
        }

        ReplayOutcome {
            identity: record.identity.clone(),
            success: result.is_ok(),
        }
    }
}

/// Success iff the status is exactly 200 and the body carries `response.status == "1"`.
pub fn classify_response(status: StatusCode, body: &str) -> Result<(), RequestError> {
    if status != StatusCode::OK {
        return Err(RequestError::HttpStatus(status.as_u16()));
    }

    let value: Value =
        serde_json::from_str(body).map_err(|e| RequestError::MalformedResponse(e.to_string()))?;

    match value.pointer("/response/status") {
        None | Some(Value::Null) => Err(RequestError::MissingStatus),
        Some(Value::String(s)) if s == SUCCESS_STATUS => Ok(()),
        Some(Value::String(s)) => Err(RequestError::Rejected(s.clone())),
        Some(other) => Err(RequestError::Rejected(other.to_string())),
    }
}

fn transport_error(e: reqwest::Error) -> RequestError {
    if e.is_timeout() {
        RequestError::Timeout
    } else {
        RequestError::Transport(e.to_string())
    }
}
