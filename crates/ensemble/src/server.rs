//! `EnsembleServer` builder and server loop.
//!
//! This is the entry point for running an Ensemble coordinator. It ties
//! together all the layers: transport → hooks → router → participants →
//! sessions, and keeps the join-request sweeper running next to the
//! accept loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ensemble_participant::{Collaborators, Standalone};
use ensemble_protocol::{Codec, JsonCodec};
use ensemble_session::{Clock, ProjectDirectory, StaticDirectory, SystemClock};
use ensemble_transport::{Transport, WebSocketTransport};

use crate::config::MIN_RTC_SECRET_LEN;
use crate::handler::handle_connection;
use crate::{
    ConnectionLifecycleHooks, Coordinator, EnsembleConfig, EnsembleError,
    RealtimeBroadcastRouter,
};

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<B: Collaborators, C: Codec> {
    pub(crate) router: RealtimeBroadcastRouter<B>,
    pub(crate) hooks: Arc<ConnectionLifecycleHooks>,
    pub(crate) codec: C,
    pub(crate) outbox_capacity: usize,
    pub(crate) idle_timeout: Duration,
}

/// Builder for configuring and starting an Ensemble server.
///
/// Starts out over the directory seeded from `ENSEMBLE_DIRECTORY`;
/// [`directory()`](Self::directory) swaps in any other
/// [`ProjectDirectory`].
///
/// # Example
///
/// ```rust,ignore
/// use ensemble::prelude::*;
///
/// let server = EnsembleServer::builder(EnsembleConfig::from_env()?)
///     .directory(StaticDirectory::new().with_member(ProjectId(1), UserId(1)))
///     .build()
///     .await?;
/// server.run().await
/// ```
pub struct EnsembleServerBuilder<D: ProjectDirectory = StaticDirectory> {
    config: EnsembleConfig,
    directory: D,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl EnsembleServerBuilder {
    /// Creates a builder from a loaded configuration.
    pub fn new(config: EnsembleConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            sweep_interval: config.sweep_interval(),
            directory: config.static_directory(),
            config,
            clock: Arc::new(SystemClock),
        }
    }
}

impl<D: ProjectDirectory> EnsembleServerBuilder<D> {
    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_address = addr.to_string();
        self
    }

    /// Sets the project directory consulted for authorization and
    /// display names.
    pub fn directory<D2: ProjectDirectory>(self, directory: D2) -> EnsembleServerBuilder<D2> {
        EnsembleServerBuilder {
            config: self.config,
            directory,
            clock: self.clock,
            idle_timeout: self.idle_timeout,
            sweep_interval: self.sweep_interval,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides `ENSEMBLE_IDLE_TIMEOUT_SECONDS` with sub-second precision.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Binds the transport and wires up the coordinator.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    pub async fn build(self) -> Result<EnsembleServer<D>, EnsembleError> {
        if self.config.secret_len() < MIN_RTC_SECRET_LEN {
            tracing::warn!("RTC secret is shorter than {MIN_RTC_SECRET_LEN} bytes");
        }
        let transport = WebSocketTransport::bind(&self.config.bind_address).await?;

        let coordinator = Arc::new(Coordinator::standalone(
            &self.config,
            self.directory,
            self.clock,
        ));
        let hooks = Arc::new(ConnectionLifecycleHooks::standard(coordinator.participants()));
        let state = Arc::new(ServerState {
            router: RealtimeBroadcastRouter::new(Arc::clone(&coordinator)),
            hooks,
            codec: JsonCodec,
            outbox_capacity: self.config.outbox_capacity,
            idle_timeout: self.idle_timeout,
        });

        Ok(EnsembleServer {
            transport,
            coordinator,
            state,
            sweep_interval: self.sweep_interval,
        })
    }
}

/// A bound Ensemble server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct EnsembleServer<D: ProjectDirectory = StaticDirectory> {
    transport: WebSocketTransport,
    coordinator: Arc<Coordinator<Standalone<D>>>,
    state: Arc<ServerState<Standalone<D>, JsonCodec>>,
    sweep_interval: Duration,
}

impl EnsembleServer {
    /// Creates a new builder.
    pub fn builder(config: EnsembleConfig) -> EnsembleServerBuilder {
        EnsembleServerBuilder::new(config)
    }
}

impl<D: ProjectDirectory> EnsembleServer<D> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The operation surface, for embedding applications that create
    /// and manage sessions.
    pub fn coordinator(&self) -> &Arc<Coordinator<Standalone<D>>> {
        &self.coordinator
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), EnsembleError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` completes.
    ///
    /// Each accepted connection gets its own handler task. The
    /// join-request sweeper runs alongside and stops with the loop.
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), EnsembleError> {
        tracing::info!(sweep_interval = ?self.sweep_interval, "Ensemble server running");
        let sweeper = Arc::clone(self.coordinator.participants().join_requests())
            .spawn_sweeper(self.sweep_interval);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        sweeper.abort();
        self.transport.shutdown().await?;
        Ok(())
    }
}
