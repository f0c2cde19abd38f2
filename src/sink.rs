//! Delivery of reply events to a configured sink (`K_SINK`).

use thiserror::Error;

use crate::event::http::encode_binary;
use crate::event::{BindingError, CloudEvent};

/// Failure delivering a reply to the sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The event could not be encoded for HTTP.
    #[error("failed to encode reply: {0}")]
    Encode(#[from] BindingError),
    /// The request could not be sent.
    #[error("sink request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The sink answered with a non-success status.
    #[error("sink returned non-success status {0}")]
    HttpStatus(u16),
}

/// Posts reply events to a sink URL in binary content mode.
#[derive(Debug, Clone)]
pub struct ReplySink {
    url: String,
    client: reqwest::Client,
}

impl ReplySink {
    /// Create a sink posting to `url` with `client`.
    pub fn new(url: String, client: reqwest::Client) -> Self {
        Self { url, client }
    }

    /// Sink URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one event.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if encoding, sending, or the sink's status fails.
    pub async fn deliver(&self, event: &CloudEvent) -> Result<(), SinkError> {
        let (headers, body) = encode_binary(event)?;
        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }
}
