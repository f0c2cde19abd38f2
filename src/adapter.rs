//! Adapter lifecycle and the per-event dispatch pipeline.
//!
//! [`Adapter::new`] validates configuration and assembles the replier,
//! dispatcher and optional reply sink. [`Adapter::start`] runs the
//! receiver until the cancellation token fires. Each inbound event goes
//! through [`Adapter::dispatch`]: build envelope, broadcast, translate.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AdapterConfig, ConfigError};
use crate::dispatcher::{Broadcaster, DispatchOutcome, HttpDispatcher, TransportError};
use crate::envelope::build_envelope;
use crate::event::CloudEvent;
use crate::reply::{translate, Replier, ReplierError, Reply};
use crate::server;
use crate::sink::ReplySink;

/// Lifecycle states. The adapter is single-use: nothing leaves
/// `Stopped` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Constructed, nothing validated yet.
    Created,
    /// Configuration validated and collaborators built; not serving.
    Initializing,
    /// Receiver is serving events.
    Running,
    /// Cancellation observed; draining in-flight requests.
    Stopping,
    /// Receiver returned after cancellation.
    Stopped,
    /// Initialization or the receiver failed.
    Failed,
}

impl AdapterState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Initializing)
                | (Self::Initializing, Self::Running)
                | (Self::Initializing, Self::Failed)
                | (Self::Running, Self::Stopping)
                | (Self::Running, Self::Failed)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopping, Self::Failed)
        )
    }

    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Startup and receiver-level failures.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The reply builder could not be created.
    #[error("error creating CloudEvents replier: {0}")]
    Replier(#[from] ReplierError),
    /// The HTTP client could not be created.
    #[error("error creating HTTP client: {0}")]
    Client(#[from] TransportError),
    /// The receiver could not bind its port.
    #[error("failed to bind receiver on {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The receiver stopped with an IO error.
    #[error("receiver failed: {0}")]
    Serve(#[source] std::io::Error),
    /// A lifecycle transition that the state machine forbids.
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: AdapterState,
        /// Requested state.
        to: AdapterState,
    },
}

/// Publishes lifecycle transitions.
#[derive(Debug, Clone)]
struct Lifecycle {
    tx: Arc<watch::Sender<AdapterState>>,
}

impl Lifecycle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(AdapterState::Created);
        Self { tx: Arc::new(tx) }
    }

    fn current(&self) -> AdapterState {
        *self.tx.borrow()
    }

    fn advance(&self, next: AdapterState) -> Result<(), AdapterError> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(AdapterError::InvalidTransition { from, to: next });
        }
        self.tx.send_replace(next);
        debug!(%from, to = %next, "adapter state changed");
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    fn fail(&self) {
        let current = self.current();
        if current.is_terminal() {
            debug!(state = %current, "adapter already terminal");
            return;
        }
        if let Err(e) = self.advance(AdapterState::Failed) {
            warn!(error = %e, "could not mark adapter failed");
        }
    }
}

/// The FireFly broadcast adapter.
pub struct Adapter {
    config: AdapterConfig,
    replier: Replier,
    broadcaster: Arc<dyn Broadcaster>,
    sink: Option<ReplySink>,
    lifecycle: Lifecycle,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("config", &self.config)
            .field("replier", &self.replier)
            .field("sink", &self.sink)
            .field("state", &self.lifecycle.current())
            .finish_non_exhaustive()
    }
}

impl Adapter {
    /// Validate `config` and build the HTTP dispatcher and replier.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] for invalid configuration, an unknown
    /// payload policy, or when the HTTP client cannot be built.
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        let client = build_client(&config)?;
        let dispatcher = HttpDispatcher::with_client(&config.node_url, client.clone());
        Self::assemble(config, Arc::new(dispatcher), Some(client))
    }

    /// Like [`Adapter::new`] but delivering through `broadcaster`.
    ///
    /// # Errors
    ///
    /// Same as [`Adapter::new`].
    pub fn with_broadcaster(
        config: AdapterConfig,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, AdapterError> {
        Self::assemble(config, broadcaster, None)
    }

    fn assemble(
        config: AdapterConfig,
        broadcaster: Arc<dyn Broadcaster>,
        client: Option<reqwest::Client>,
    ) -> Result<Self, AdapterError> {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(AdapterState::Initializing)?;

        let built = Self::build_parts(&config, client);
        let (replier, sink) = match built {
            Ok(parts) => parts,
            Err(e) => {
                lifecycle.fail();
                error!(error = %e, "adapter initialization failed");
                return Err(e);
            }
        };

        Ok(Self {
            config,
            replier,
            broadcaster,
            sink,
            lifecycle,
        })
    }

    fn build_parts(
        config: &AdapterConfig,
        client: Option<reqwest::Client>,
    ) -> Result<(Replier, Option<ReplySink>), AdapterError> {
        config.validate()?;
        let replier = Replier::new(
            &config.component,
            config.bridge_identifier.as_deref(),
            &config.payload_policy,
        )?;
        let sink = match &config.sink {
            Some(url) => {
                let client = match client {
                    Some(client) => client,
                    None => build_client(config)?,
                };
                Some(ReplySink::new(url.clone(), client))
            }
            None => None,
        };
        Ok((replier, sink))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        self.lifecycle.current()
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<AdapterState> {
        self.lifecycle.tx.subscribe()
    }

    /// Adapter configuration.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Sink receiving replies, when configured.
    pub fn sink(&self) -> Option<&ReplySink> {
        self.sink.as_ref()
    }

    /// Broadcast one inbound event and produce its reply.
    ///
    /// Never fails: every per-event error becomes an error reply. With a
    /// reply sink configured the reply is narrowed by the payload policy.
    pub async fn dispatch(&self, event: CloudEvent, cancel: &CancellationToken) -> Reply {
        let envelope = build_envelope(&event, &self.config.topics);
        let outcome = self.broadcaster.broadcast(&envelope, cancel).await;

        match &outcome {
            DispatchOutcome::Delivered(delivery) => {
                debug!(event_id = %event.id, status = delivery.status, "event broadcast");
            }
            DispatchOutcome::TransportError(err) => {
                warn!(event_id = %event.id, error = %err, "failed to broadcast event");
            }
            DispatchOutcome::ProtocolError(err) => {
                warn!(event_id = %event.id, error = %err, "failed to broadcast event");
            }
        }

        let reply = translate(&self.replier, event, outcome);
        if self.sink.is_some() {
            self.replier.for_sink(reply)
        } else {
            reply
        }
    }

    /// Bind the configured port and serve until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Bind`] or [`AdapterError::Serve`] on
    /// receiver failures.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), AdapterError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.lifecycle.fail();
                return Err(AdapterError::Bind { addr, source });
            }
        };
        self.start_with_listener(listener, cancel).await
    }

    /// Serve on an already bound listener until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Serve`] if the receiver fails, or
    /// [`AdapterError::InvalidTransition`] if the adapter is not ready.
    pub async fn start_with_listener(
        self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        let lifecycle = self.lifecycle.clone();
        lifecycle.advance(AdapterState::Running)?;

        match listener.local_addr() {
            Ok(addr) => info!(%addr, node = %self.config.node_url, "Starting FIREMESH Adapter"),
            Err(_) => info!(node = %self.config.node_url, "Starting FIREMESH Adapter"),
        }

        let router = server::router(Arc::new(self), cancel.clone());
        let shutdown_lifecycle = lifecycle.clone();
        let shutdown = async move {
            cancel.cancelled().await;
            info!("shutdown requested, draining receiver");
            if let Err(e) = shutdown_lifecycle.advance(AdapterState::Stopping) {
                warn!(error = %e, "unexpected lifecycle state at shutdown");
            }
        };

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        match served {
            Ok(()) => {
                if lifecycle.current() == AdapterState::Running {
                    // Receiver returned on its own; pass through Stopping.
                    lifecycle.advance(AdapterState::Stopping)?;
                }
                lifecycle.advance(AdapterState::Stopped)?;
                info!("FIREMESH Adapter stopped");
                Ok(())
            }
            Err(e) => {
                lifecycle.fail();
                error!(error = %e, "receiver failed");
                Err(AdapterError::Serve(e))
            }
        }
    }
}

fn build_client(config: &AdapterConfig) -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| AdapterError::Client(TransportError::Send(e)))
}
