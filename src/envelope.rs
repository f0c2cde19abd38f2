//! FireFly broadcast message shapes and the envelope builder.
//!
//! See <https://hyperledger.github.io/firefly/tutorials/broadcast_data.html>.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{CloudEvent, EventData};

/// Header of a broadcast message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastHeader {
    /// Message tag; always the inbound event's source.
    pub tag: String,
    /// Topics the message is published under.
    pub topics: Vec<String>,
}

/// A single inline data item of a broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastData {
    /// Arbitrary JSON payload.
    pub value: Value,
}

/// Body of `POST /api/v1/namespaces/{ns}/messages/broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    /// Routing header.
    pub header: BroadcastHeader,
    /// Inline data items, one per inbound event.
    pub data: Vec<BroadcastData>,
}

/// Build the broadcast envelope for one inbound event.
///
/// Topic selection: when `configured_topics` is non-empty the envelope is
/// published under the event's type alone and the configured topics are
/// not used; when it is empty the (empty) configured list is used as is.
/// This reproduces the deployed behavior, which looks inverted; it is
/// pinned by `configured_topics_are_replaced_by_event_type`.
pub fn build_envelope(event: &CloudEvent, configured_topics: &[String]) -> BroadcastEnvelope {
    let topics = if configured_topics.is_empty() {
        configured_topics.to_vec()
    } else {
        vec![event.event_type.clone()]
    };

    BroadcastEnvelope {
        header: BroadcastHeader {
            tag: event.source.clone(),
            topics,
        },
        data: vec![BroadcastData {
            value: event
                .data
                .as_ref()
                .map_or(Value::Null, EventData::to_value),
        }],
    }
}

/// Blob reference inside a [`BroadcastReceipt`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BlobRef {
    /// Blob hash.
    pub hash: String,
    /// Blob size in bytes.
    pub size: u64,
    /// Blob name.
    pub name: String,
}

/// Data record the node returns for an accepted broadcast.
///
/// Only used for logging; delivery success does not depend on it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BroadcastReceipt {
    /// Identifier assigned by the node.
    pub id: String,
    /// Validator applied to the data.
    pub validator: String,
    /// Namespace the message was published in.
    pub namespace: String,
    /// Content hash.
    pub hash: String,
    /// Creation timestamp.
    pub created: Option<DateTime<Utc>>,
    /// Echoed value.
    pub value: Value,
    /// Attached blob, if any.
    pub blob: BlobRef,
}

impl BroadcastReceipt {
    /// Best-effort parse of a broadcast response body.
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }
}
