//! Per-event pipeline: envelope, broadcast, reply.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use firemesh::adapter::Adapter;
use firemesh::config::AdapterConfig;
use firemesh::dispatcher::{Broadcaster, Delivery, DispatchOutcome, ProtocolError};
use firemesh::envelope::BroadcastEnvelope;
use firemesh::event::{CloudEvent, EventData};
use firemesh::reply::{ReplyResult, ERROR_EVENT_TYPE};

use crate::mock_node::refused_url;

/// Records envelopes and answers with a fixed outcome.
struct RecordingBroadcaster {
    seen: Mutex<Vec<BroadcastEnvelope>>,
    fail_with_status: Option<u16>,
}

impl RecordingBroadcaster {
    fn delivering() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail_with_status: None,
        })
    }

    fn rejecting(status: u16) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail_with_status: Some(status),
        })
    }

    fn envelopes(&self) -> Vec<BroadcastEnvelope> {
        match self.seen.lock() {
            Ok(seen) => seen.clone(),
            Err(err) => panic!("recorder lock poisoned: {err}"),
        }
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn broadcast(
        &self,
        envelope: &BroadcastEnvelope,
        _cancel: &CancellationToken,
    ) -> DispatchOutcome {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(envelope.clone());
        }
        match self.fail_with_status {
            None => DispatchOutcome::Delivered(Delivery {
                status: 200,
                body: "{}".to_owned(),
            }),
            Some(status) => DispatchOutcome::ProtocolError(ProtocolError::Rejected {
                status,
                body: "rejected".to_owned(),
            }),
        }
    }
}

fn adapter(config: AdapterConfig, broadcaster: Arc<RecordingBroadcaster>) -> Adapter {
    match Adapter::with_broadcaster(config, broadcaster) {
        Ok(adapter) => adapter,
        Err(err) => panic!("adapter should build: {err}"),
    }
}

fn order_event() -> CloudEvent {
    CloudEvent::new("evt-1", "svc-a", "order.created").with_json_data(json!({"x": 1}))
}

#[tokio::test]
async fn delivered_event_is_echoed_with_ack() {
    let recorder = RecordingBroadcaster::delivering();
    let adapter = adapter(AdapterConfig::new("http://firefly:5000"), Arc::clone(&recorder));

    let reply = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    assert_eq!(reply.result, ReplyResult::Ack);
    assert_eq!(reply.event, Some(order_event()));

    let envelopes = recorder.envelopes();
    assert_eq!(envelopes.len(), 1);
    let rendered = match serde_json::to_value(&envelopes[0]) {
        Ok(value) => value,
        Err(err) => panic!("envelope should serialize: {err}"),
    };
    assert_eq!(
        rendered,
        json!({"header": {"tag": "svc-a", "topics": []}, "data": [{"value": {"x": 1}}]})
    );
}

#[tokio::test]
async fn configured_topics_are_replaced_by_event_type() {
    let recorder = RecordingBroadcaster::delivering();
    let mut config = AdapterConfig::new("http://firefly:5000");
    config.topics = vec!["orders".to_owned()];
    let adapter = adapter(config, Arc::clone(&recorder));

    let _ = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    let envelopes = recorder.envelopes();
    assert_eq!(envelopes[0].header.topics, vec!["order.created".to_owned()]);
    assert_eq!(envelopes[0].header.tag, "svc-a");
}

#[tokio::test]
async fn rejected_broadcast_yields_error_event() {
    let recorder = RecordingBroadcaster::rejecting(422);
    let adapter = adapter(AdapterConfig::new("http://firefly:5000"), recorder);

    let reply = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    let event = match reply.event {
        Some(event) => event,
        None => panic!("error policy should reply with an event"),
    };
    assert_eq!(event.event_type, ERROR_EVENT_TYPE);
    assert_eq!(event.source, "firemesh");
    let data = event.data.as_ref().map(EventData::to_value).unwrap_or_default();
    assert_eq!(data["code"], "adapter processing failure");
    assert_eq!(data["details"], "failed to broadcast event");
    assert!(data["description"]
        .as_str()
        .is_some_and(|d| d.contains("422")));
}

#[tokio::test]
async fn connection_refused_yields_error_reply_through_real_dispatcher() {
    let url = refused_url().await;
    let adapter = match Adapter::new(AdapterConfig::new(url)) {
        Ok(adapter) => adapter,
        Err(err) => panic!("adapter should build: {err}"),
    };

    let reply = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    assert_eq!(reply.result, ReplyResult::Ack);
    let event = match reply.event {
        Some(event) => event,
        None => panic!("error reply expected"),
    };
    assert_eq!(event.event_type, ERROR_EVENT_TYPE);
    let data = event.data.as_ref().map(EventData::to_value).unwrap_or_default();
    assert_eq!(data["code"], "adapter processing failure");
    let description = data["description"].as_str().unwrap_or_default();
    assert!(
        description.starts_with("broadcast request failed"),
        "description should carry the transport error: {description}"
    );
    assert!(
        description.to_ascii_lowercase().contains("connection refused"),
        "description should carry the root cause: {description}"
    );
}

#[tokio::test]
async fn never_policy_reports_failure_without_event() {
    let mut config = AdapterConfig::new("http://firefly:5000");
    config.payload_policy = "never".to_owned();
    let adapter = adapter(config, RecordingBroadcaster::rejecting(500));

    let reply = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    assert!(reply.event.is_none());
    match reply.result {
        ReplyResult::Nack(message) => assert!(message.contains("failed to broadcast event")),
        ReplyResult::Ack => panic!("never policy should nack"),
    }
}

#[tokio::test]
async fn bridge_identifier_correlates_error_reply() {
    let mut config = AdapterConfig::new("http://firefly:5000");
    config.bridge_identifier = Some("orders-bridge".to_owned());
    let adapter = adapter(config, RecordingBroadcaster::rejecting(500));

    let reply = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    let event = match reply.event {
        Some(event) => event,
        None => panic!("error reply expected"),
    };
    assert_eq!(event.extension("statefulbridge"), Some("orders-bridge"));
    assert_eq!(event.extension("statefulid"), Some("evt-1"));
}

fn sink_config(policy: &str) -> AdapterConfig {
    let mut config = AdapterConfig::new("http://firefly:5000");
    config.sink = Some("http://broker.default.svc".to_owned());
    config.payload_policy = policy.to_owned();
    config
}

#[tokio::test]
async fn sink_gets_no_echo_under_errors_policy() {
    let adapter = adapter(sink_config("error"), RecordingBroadcaster::delivering());

    let reply = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    assert_eq!(reply.result, ReplyResult::Ack);
    assert!(reply.event.is_none());
}

#[tokio::test]
async fn sink_gets_echo_under_always_policy() {
    let adapter = adapter(sink_config("always"), RecordingBroadcaster::delivering());

    let reply = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    assert_eq!(reply.result, ReplyResult::Ack);
    assert_eq!(reply.event, Some(order_event()));
}

#[tokio::test]
async fn sink_gets_error_event_under_errors_policy() {
    let adapter = adapter(sink_config("errors"), RecordingBroadcaster::rejecting(500));

    let reply = adapter
        .dispatch(order_event(), &CancellationToken::new())
        .await;

    match reply.event {
        Some(event) => assert_eq!(event.event_type, ERROR_EVENT_TYPE),
        None => panic!("error event should be forwarded"),
    }
}
