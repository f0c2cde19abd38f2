//! CloudEvents reply contract.
//!
//! A handler answers every inbound event with a [`Reply`]: either an
//! acknowledgement echoing the input, or a typed error event built by the
//! [`Replier`]. [`translate`] maps a [`DispatchOutcome`] onto that contract.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::dispatcher::DispatchOutcome;
use crate::event::CloudEvent;

/// Event type of every error reply emitted by this adapter.
pub const ERROR_EVENT_TYPE: &str = "io.triggermesh.firemesh.error";

/// Details attached to broadcast failures.
pub const BROADCAST_FAILED_DETAILS: &str = "failed to broadcast event";

/// Extension carrying the bridge identifier.
pub const STATEFUL_BRIDGE_EXTENSION: &str = "statefulbridge";

/// Extension carrying the correlation id within a bridge.
pub const STATEFUL_ID_EXTENSION: &str = "statefulid";

/// Extension classifying reply events.
pub const CATEGORY_EXTENSION: &str = "category";

/// Error codes carried in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The adapter failed to process the event.
    AdapterProcess,
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdapterProcess => "adapter processing failure",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which replies carry an event payload to a reply sink.
///
/// Replies answered directly to the sender always follow the reply
/// contract; the policy decides what is forwarded when a sink is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadPolicy {
    /// Forward events for both successes and errors.
    Always,
    /// Forward error events only.
    #[default]
    Errors,
    /// Never produce an event; failures become a `Nack`.
    Never,
}

impl FromStr for PayloadPolicy {
    type Err = ReplierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "always" => Ok(Self::Always),
            // "error" is the historical default value of EVENTS_PAYLOAD_POLICY.
            "errors" | "error" => Ok(Self::Errors),
            "never" => Ok(Self::Never),
            other => Err(ReplierError::UnknownPayloadPolicy(other.to_owned())),
        }
    }
}

/// Errors raised while building a [`Replier`].
#[derive(Debug, Error)]
pub enum ReplierError {
    /// The payload policy string is not recognised.
    #[error("unknown payload policy {0:?} (expected always, errors or never)")]
    UnknownPayloadPolicy(String),
    /// The response source is empty.
    #[error("reply source must not be empty")]
    EmptySource,
}

/// Result signalled to the receive loop alongside an optional event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyResult {
    /// The event was processed.
    Ack,
    /// The event was not processed; carries the failure message.
    Nack(String),
}

/// Whether a reply reports a delivery or a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The inbound event was broadcast.
    Echo,
    /// The inbound event could not be broadcast.
    Error,
}

/// What a handler returns for one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Event sent back to the sender or sink, if any.
    pub event: Option<CloudEvent>,
    /// Processing result.
    pub result: ReplyResult,
    /// What the reply reports.
    pub kind: ReplyKind,
}

impl Reply {
    /// Acknowledge by echoing the inbound event unchanged.
    pub fn ack(event: CloudEvent) -> Self {
        Self {
            event: Some(event),
            result: ReplyResult::Ack,
            kind: ReplyKind::Echo,
        }
    }

    /// Whether the result is an acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.result == ReplyResult::Ack
    }
}

/// Payload of an error reply event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReplyData {
    /// Fixed error code.
    pub code: String,
    /// Underlying cause.
    pub description: String,
    /// Human-readable context.
    pub details: String,
}

impl ErrorReplyData {
    /// Single-line rendering, `"<details>: <description>"`.
    pub fn message(&self) -> String {
        format!("{}: {}", self.details, self.description)
    }
}

/// Builds reply events.
#[derive(Debug, Clone)]
pub struct Replier {
    source: String,
    bridge: Option<String>,
    policy: PayloadPolicy,
}

impl Replier {
    /// Create a replier emitting events with `source` as their source.
    ///
    /// # Errors
    ///
    /// Returns [`ReplierError`] if the source is empty or the payload
    /// policy is unknown.
    pub fn new(
        source: &str,
        bridge: Option<&str>,
        payload_policy: &str,
    ) -> Result<Self, ReplierError> {
        if source.trim().is_empty() {
            return Err(ReplierError::EmptySource);
        }
        Ok(Self {
            source: source.to_owned(),
            bridge: bridge
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_owned),
            policy: payload_policy.parse()?,
        })
    }

    /// Configured payload policy.
    pub fn policy(&self) -> PayloadPolicy {
        self.policy
    }

    /// Build the error reply for `inbound`.
    ///
    /// Under [`PayloadPolicy::Never`] no event is produced and the result
    /// is a `Nack` carrying the message instead.
    pub fn error(
        &self,
        inbound: &CloudEvent,
        code: ErrorCode,
        cause: &dyn fmt::Display,
        details: &str,
    ) -> Reply {
        let data = ErrorReplyData {
            code: code.as_str().to_owned(),
            description: cause.to_string(),
            details: details.to_owned(),
        };

        if self.policy == PayloadPolicy::Never {
            return Reply {
                event: None,
                result: ReplyResult::Nack(data.message()),
                kind: ReplyKind::Error,
            };
        }

        let payload = match serde_json::to_value(&data) {
            Ok(value) => value,
            Err(e) => {
                // Unreachable for plain string fields; fall back to the message.
                warn!(error = %e, "failed to encode error reply payload");
                serde_json::Value::String(data.message())
            }
        };

        let mut event = CloudEvent::new(
            Uuid::new_v4().to_string(),
            self.source.clone(),
            ERROR_EVENT_TYPE,
        )
        .with_time(Utc::now())
        .with_extension(CATEGORY_EXTENSION, "error")
        .with_json_data(payload);
        self.apply_stateful_headers(inbound, &mut event);

        Reply {
            event: Some(event),
            result: ReplyResult::Ack,
            kind: ReplyKind::Error,
        }
    }

    /// Narrow `reply` to what is forwarded to a reply sink.
    ///
    /// Echoes are only forwarded under [`PayloadPolicy::Always`]; otherwise
    /// the delivery is acknowledged without an event.
    pub fn for_sink(&self, reply: Reply) -> Reply {
        match (reply.kind, self.policy) {
            (ReplyKind::Echo, PayloadPolicy::Errors | PayloadPolicy::Never) => Reply {
                event: None,
                ..reply
            },
            _ => reply,
        }
    }

    fn apply_stateful_headers(&self, inbound: &CloudEvent, reply: &mut CloudEvent) {
        let Some(bridge) = &self.bridge else {
            return;
        };
        let stateful_id = inbound
            .extension(STATEFUL_ID_EXTENSION)
            .unwrap_or(inbound.id.as_str())
            .to_owned();
        reply
            .extensions
            .insert(STATEFUL_BRIDGE_EXTENSION.to_owned(), bridge.clone());
        reply
            .extensions
            .insert(STATEFUL_ID_EXTENSION.to_owned(), stateful_id);
    }
}

/// Map a dispatch outcome to the reply for `inbound`.
pub fn translate(replier: &Replier, inbound: CloudEvent, outcome: DispatchOutcome) -> Reply {
    match outcome {
        DispatchOutcome::Delivered(_) => Reply::ack(inbound),
        DispatchOutcome::TransportError(err) => replier.error(
            &inbound,
            ErrorCode::AdapterProcess,
            &err,
            BROADCAST_FAILED_DETAILS,
        ),
        DispatchOutcome::ProtocolError(err) => replier.error(
            &inbound,
            ErrorCode::AdapterProcess,
            &err,
            BROADCAST_FAILED_DETAILS,
        ),
    }
}
