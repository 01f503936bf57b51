//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! registry and the viewer listener, and runs the shutdown sequence:
//! stop accepting viewers, tear down every session, then drain connections.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{self, EngineEvent};
use crate::network::{ConnectionContext, PathResolver, SessionResolver, WebSocketListener};
use crate::session::{SessionBackend, SessionRegistry, TmuxBackend};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting viewers.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The viewer listener is bound.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session registry.
    registry: Arc<SessionRegistry>,
    /// Maps request paths to sessions.
    resolver: Arc<dyn SessionResolver>,
    /// Cancelled when the listener should stop accepting viewers.
    shutdown_token: CancellationToken,
    /// The running listener task.
    listener_task: Option<JoinHandle<()>>,
    /// Address the listener is bound to.
    local_addr: Option<SocketAddr>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator backed by the configured tmux binary.
    pub fn new(config: Config) -> Result<Self> {
        let backend = TmuxBackend::new(config.session.tmux_binary.clone(), config.capture_timeout())
            .with_default_cwd(config.session.default_cwd.clone());
        Self::with_backend(config, Arc::new(backend))
    }

    /// Creates an orchestrator with a custom session backend.
    pub fn with_backend(config: Config, backend: Arc<dyn SessionBackend>) -> Result<Self> {
        let log_dir = config.session_log_dir();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create session log directory: {}", log_dir.display()))?;

        let registry = SessionRegistry::new(backend, config.registry_config(), events::channel());
        let resolver = Arc::new(PathResolver::new(config.server.path_prefix.clone()));
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            resolver,
            shutdown_token: CancellationToken::new(),
            listener_task: None,
            local_addr: None,
            event_tx,
        })
    }

    /// Replaces the request resolver. Takes effect on the next start.
    pub fn with_resolver(mut self, resolver: Arc<dyn SessionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns a receiver for engine events.
    pub fn engine_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.registry.subscribe()
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Starts accepting viewers on the configured address.
    pub async fn start(&mut self) -> Result<()> {
        let addr = self.config.bind_addr()?;
        self.start_on(addr).await
    }

    /// Starts accepting viewers on `addr`, overriding the configured address.
    pub async fn start_on(&mut self, addr: SocketAddr) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        // A stopped orchestrator may be started again.
        self.shutdown_token = CancellationToken::new();

        let ctx = ConnectionContext {
            registry: Arc::clone(&self.registry),
            write_timeout: self.config.write_timeout(),
            shutdown: self.shutdown_token.clone(),
        };

        let listener = match WebSocketListener::bind(addr, Arc::clone(&self.resolver), ctx).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("Failed to bind {addr}: {e}"),
                });
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e).with_context(|| format!("Failed to bind viewer listener on {addr}"));
            }
        };

        let local_addr = listener.local_addr();
        self.local_addr = Some(local_addr);
        self.listener_task = Some(tokio::spawn(listener.run()));
        self.emit_event(OrchestratorEvent::Listening { addr: local_addr });

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = %local_addr, prefix = %self.config.server.path_prefix, "Daemon orchestrator started");
        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Refuse new viewers before sessions go away.
        self.shutdown_token.cancel();

        // Closes every viewer queue, so connection tasks wind down.
        self.registry.shutdown().await;

        if let Some(task) = self.listener_task.take() {
            if let Err(e) = task.await {
                warn!("Listener task failed: {}", e);
            }
        }
        self.local_addr = None;
        debug!("Viewer listener drained");

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
