//! # muxcast Daemon Library
//!
//! Session multiplexing engine: many remote viewers share one persistent
//! terminal session.
//!
//! ## Overview
//!
//! - **Session Registry**: one attached process per session name, spawned on
//!   first attach and kept alive for a grace period after the last viewer
//!   leaves
//! - **Fan-out**: process output reaches every live viewer in order; a viewer
//!   that stops reading is evicted instead of stalling the others
//! - **History Replay**: new viewers receive the session's scrollback before
//!   live output
//! - **Session Logs**: optional per-session output logs with escape
//!   sequences stripped
//! - **Viewer Transport**: WebSocket, with the session name taken from the
//!   request path
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Daemon Orchestrator                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────┐        ┌──────────────────────────┐  │
//! │  │ WebSocketListener │───────▶│     SessionRegistry      │  │
//! │  │  (PathResolver)   │        │  attach / detach / grace │  │
//! │  └───────────────────┘        └────────────┬─────────────┘  │
//! │                                            │                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────▼────────────┐   │
//! │  │ HistoryReplay│  │   LogSink    │  │  FanOutBroker    │   │
//! │  └──────────────┘  └──────────────┘  └─────▲────────────┘   │
//! │                                            │                │
//! │                   SessionBackend (tmux) ───┘                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Viewers connect to ws://127.0.0.1:7681/sessions/<name>
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session registry, fan-out, history replay and logs
//! - [`network`]: WebSocket listener and viewer connections
//! - [`events`]: Engine events for external observers
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod events;
pub mod network;
pub mod orchestrator;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export protocol for convenience
pub use muxcast_protocol as protocol;

pub use config::Config;

pub use events::{EngineEvent, TeardownReason};

pub use session::{
    LifecycleState, RegistryConfig, SessionBackend, SessionError, SessionInfo, SessionRegistry,
    SessionState, TmuxBackend, ViewerHandle, ViewerOutlet, ViewerPhase,
};

pub use network::{ConnectionContext, PathResolver, SessionResolver, SessionTarget, WebSocketListener};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
