//! FireMesh — a CloudEvents adapter for Hyperledger FireFly.
//!
//! Receives CloudEvents over HTTP, publishes each one as a FireFly
//! broadcast message, and answers the sender with an acknowledgement or a
//! typed error event.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod logging;
pub mod reply;
pub mod server;
pub mod sink;
