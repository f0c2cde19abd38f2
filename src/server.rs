//! HTTP receiver: turns CloudEvents requests into adapter dispatches.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::Adapter;
use crate::event::http::{decode_request, encode_binary};
use crate::reply::{Reply, ReplyKind, ReplyResult};

/// Path events are posted to.
pub const RECEIVE_PATH: &str = "/";

#[derive(Clone)]
struct ReceiverState {
    adapter: Arc<Adapter>,
    cancel: CancellationToken,
}

/// Build the receiver router. In-flight broadcasts abort when `cancel` fires.
pub fn router(adapter: Arc<Adapter>, cancel: CancellationToken) -> Router {
    Router::new()
        .route(RECEIVE_PATH, post(receive))
        .with_state(ReceiverState { adapter, cancel })
}

async fn receive(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = match decode_request(&headers, &body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "rejecting malformed CloudEvent");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    debug!(event_id = %event.id, event_type = %event.event_type, "received event");

    let reply = state.adapter.dispatch(event, &state.cancel).await;

    match state.adapter.sink() {
        Some(sink) => {
            if let ReplyResult::Nack(message) = &reply.result {
                return (StatusCode::INTERNAL_SERVER_ERROR, message.clone()).into_response();
            }
            if let Some(event) = &reply.event {
                if let Err(e) = sink.deliver(event).await {
                    warn!(error = %e, sink = %sink.url(), reply_id = %event.id, "failed to deliver reply to sink");
                }
            }
            StatusCode::ACCEPTED.into_response()
        }
        None => respond(reply),
    }
}

/// Write a reply back to the sender.
fn respond(reply: Reply) -> Response {
    match (reply.event, reply.result) {
        (_, ReplyResult::Nack(message)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
        (None, ReplyResult::Ack) => StatusCode::ACCEPTED.into_response(),
        (Some(event), ReplyResult::Ack) => match encode_binary(&event) {
            Ok((headers, body)) => (StatusCode::OK, headers, body).into_response(),
            Err(e) => {
                warn!(error = %e, reply_id = %event.id, "failed to encode reply");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        },
    }
}
