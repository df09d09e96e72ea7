//! Direct HTTP delivery to the tracking service's bulk endpoint.

use super::{lines_in_file, Receipt, TransmitError, Transmitter};
use crate::config::Settings;
use crate::core::heartbeat::{HeartbeatId, QueuedHeartbeat, WireHeartbeat};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Path of the bulk heartbeat endpoint, relative to the API url.
pub const BULK_PATH: &str = "/users/current/heartbeats.bulk";

/// Heartbeat plus the client metadata the service expects.
#[derive(Debug, Serialize)]
struct BulkHeartbeat<'a> {
    #[serde(flatten)]
    heartbeat: &'a WireHeartbeat,
    user_agent: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
}

/// Bulk endpoint response: one `[body, status]` pair per heartbeat.
#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    responses: Vec<(serde_json::Value, u16)>,
}

/// Sends batches with `reqwest`, bypassing the CLI.
pub struct HttpTransmitter {
    client: reqwest::Client,
    user_agent: String,
    hostname: Option<String>,
}

impl HttpTransmitter {
    /// `plugin` doubles as the user agent, e.g. `helix/24.03 editor-heartbeat/0.1.0`.
    pub fn new(plugin: &str) -> Result<Self, TransmitError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransmitError::network(format!("Failed to create HTTP client: {e}")))?;

        let hostname = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().to_string())
            .filter(|h| !h.is_empty());

        Ok(Self {
            client,
            user_agent: plugin.to_string(),
            hostname,
        })
    }

    /// Bulk endpoint for the configured API url.
    pub fn endpoint(settings: &Settings) -> String {
        format!("{}{}", settings.api_url().trim_end_matches('/'), BULK_PATH)
    }

    /// Map a batch-level HTTP status to a failure, if it is one.
    pub fn classify_status(status: StatusCode, body: &str) -> Option<TransmitError> {
        if status.is_success() {
            return None;
        }
        let message = format!("{status}: {}", body.trim());
        Some(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransmitError::auth(message),
            StatusCode::BAD_REQUEST => TransmitError::malformed(message),
            _ => TransmitError::server(message),
        })
    }

    /// Heartbeats the service refused individually, matched by position.
    fn rejected_ids(batch: &[QueuedHeartbeat], body: &str) -> Vec<HeartbeatId> {
        let Ok(parsed) = serde_json::from_str::<BulkResponse>(body) else {
            return Vec::new();
        };
        batch
            .iter()
            .zip(parsed.responses.iter())
            .filter(|(_, (_, status))| *status == StatusCode::BAD_REQUEST.as_u16())
            .map(|(queued, _)| queued.id)
            .collect()
    }
}

#[async_trait]
impl Transmitter for HttpTransmitter {
    async fn send(
        &self,
        batch: &[QueuedHeartbeat],
        settings: &Settings,
    ) -> Result<Receipt, TransmitError> {
        if batch.is_empty() {
            return Ok(Receipt::all_accepted());
        }
        let Some(key) = settings.api_key() else {
            return Err(TransmitError::auth("no API key configured"));
        };

        let mut wire = Vec::with_capacity(batch.len());
        for queued in batch {
            let lines = lines_in_file(&queued.heartbeat.entity).await;
            wire.push(queued.heartbeat.to_wire(lines));
        }
        let payload: Vec<BulkHeartbeat<'_>> = wire
            .iter()
            .map(|heartbeat| BulkHeartbeat {
                heartbeat,
                user_agent: &self.user_agent,
                hostname: self.hostname.as_deref(),
            })
            .collect();

        let response = self
            .client
            .post(Self::endpoint(settings))
            .basic_auth(key, None::<&str>)
            .header("User-Agent", &self.user_agent)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransmitError::network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        if let Some(error) = Self::classify_status(status, &body) {
            return Err(error);
        }

        Ok(Receipt {
            rejected: Self::rejected_ids(batch, &body),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
