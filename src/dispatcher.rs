//! Outbound delivery of broadcast envelopes to a FireFly node.
//!
//! [`HttpDispatcher`] serializes an envelope, POSTs it to the node's
//! broadcast endpoint and classifies what happened as a closed
//! [`DispatchOutcome`]. No retries happen here.

use std::error::Error as StdError;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::envelope::{BroadcastEnvelope, BroadcastReceipt};

/// Path of the broadcast API below the node base URL.
pub const BROADCAST_PATH: &str = "/api/v1/namespaces/default/messages/broadcast";

/// Default outbound request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ERROR_BODY_CHARS: usize = 256;

// Node error bodies can echo bearer credentials from proxies.
static BEARER_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=\-]{8,}").ok());

/// Failure before a response status was obtained.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The envelope could not be encoded as JSON.
    #[error("failed to encode broadcast message: {0}")]
    Encode(#[from] serde_json::Error),
    /// The broadcast endpoint URL is malformed.
    #[error("invalid broadcast URL {url}: {reason}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser message.
        reason: String,
    },
    /// Connection, DNS, TLS or timeout failure.
    #[error("broadcast request failed: {}", error_chain(.0))]
    Send(#[source] reqwest::Error),
    /// The adapter was asked to stop while the request was in flight.
    #[error("broadcast request cancelled")]
    Cancelled,
}

/// A response arrived but cannot be treated as a delivery.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Reading the response body failed.
    #[error("failed to read broadcast response: {0}")]
    BodyRead(String),
    /// The node answered with a non-success status.
    #[error("broadcast rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
}

/// Successful delivery details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// HTTP status returned by the node.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

/// Result of one broadcast attempt.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The node accepted the message and the response was fully read.
    Delivered(Delivery),
    /// No response was obtained.
    TransportError(TransportError),
    /// A response was obtained but signals failure or could not be read.
    ProtocolError(ProtocolError),
}

impl DispatchOutcome {
    /// Whether the message reached the node.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

/// Anything that can deliver a broadcast envelope.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Deliver one envelope, aborting if `cancel` fires.
    async fn broadcast(
        &self,
        envelope: &BroadcastEnvelope,
        cancel: &CancellationToken,
    ) -> DispatchOutcome;
}

/// Delivers envelopes to a FireFly node over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpDispatcher {
    /// Create a dispatcher for the node at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Send`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::Send)?;
        Ok(Self::with_client(base_url, client))
    }

    /// Create a dispatcher that reuses an existing client.
    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            endpoint: broadcast_url(base_url),
            client,
        }
    }

    async fn send(
        &self,
        envelope: &BroadcastEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Delivery, DispatchOutcome> {
        let body = serde_json::to_vec(envelope)
            .map_err(|e| DispatchOutcome::TransportError(TransportError::Encode(e)))?;

        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            DispatchOutcome::TransportError(TransportError::InvalidUrl {
                url: self.endpoint.clone(),
                reason: e.to_string(),
            })
        })?;

        let request = self
            .client
            .post(url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(DispatchOutcome::TransportError(TransportError::Cancelled));
            }
            result = request => result
                .map_err(|e| DispatchOutcome::TransportError(TransportError::Send(e)))?,
        };

        let status = response.status();
        // The response is consumed here on every path, releasing the connection.
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(DispatchOutcome::ProtocolError(ProtocolError::BodyRead(
                    "cancelled while reading response".to_owned(),
                )));
            }
            result = response.text() => result.map_err(|e| {
                DispatchOutcome::ProtocolError(ProtocolError::BodyRead(error_chain(&e)))
            })?,
        };

        check_status(status, text).map_err(DispatchOutcome::ProtocolError)
    }
}

#[async_trait]
impl Broadcaster for HttpDispatcher {
    async fn broadcast(
        &self,
        envelope: &BroadcastEnvelope,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        match self.send(envelope, cancel).await {
            Ok(delivery) => {
                info!(status = delivery.status, body = %delivery.body, "broadcasted ce");
                if let Some(receipt) = BroadcastReceipt::parse(&delivery.body) {
                    debug!(id = %receipt.id, hash = %receipt.hash, "broadcast receipt");
                }
                DispatchOutcome::Delivered(delivery)
            }
            Err(outcome) => outcome,
        }
    }
}

/// Join the node base URL and the broadcast path.
pub fn broadcast_url(base_url: &str) -> String {
    format!("{}{BROADCAST_PATH}", base_url.trim_end_matches('/'))
}

/// Render an error with its whole `source()` chain, `outer: inner: root`.
fn error_chain(err: &dyn StdError) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !rendered.contains(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

fn check_status(status: StatusCode, body: String) -> Result<Delivery, ProtocolError> {
    if !status.is_success() {
        return Err(ProtocolError::Rejected {
            status: status.as_u16(),
            body: sanitize_error_body(&body),
        });
    }
    Ok(Delivery {
        status: status.as_u16(),
        body,
    })
}

fn sanitize_error_body(raw: &str) -> String {
    let mut sanitized = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Some(regex) = BEARER_TOKEN.as_ref() {
        sanitized = regex.replace_all(&sanitized, "Bearer [REDACTED]").into_owned();
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}
