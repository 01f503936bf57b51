//! Engine events for external observers.
//!
//! Session metadata, metering and audit subsystems live outside the engine.
//! They subscribe to these events instead of reaching into session state.

use tokio::sync::broadcast;

use crate::session::ProcessStatus;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The attached process exited on its own.
    ProcessExited(ProcessStatus),
    /// The grace period elapsed with no viewers.
    GraceExpired,
    /// Forced removal.
    Removed,
    /// The daemon is shutting down.
    Shutdown,
}

/// Something observable happened in the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A process was spawned for a session.
    SessionStarted {
        session: String,
        pid: Option<u32>,
    },
    /// A session left the registry.
    SessionTornDown {
        session: String,
        reason: TeardownReason,
    },
    /// A viewer joined a session.
    ViewerAttached {
        session: String,
        viewer_id: String,
    },
    /// A viewer left a session, voluntarily or by eviction.
    ViewerDetached {
        session: String,
        viewer_id: String,
    },
    /// Viewer input reached the process.
    InputForwarded {
        session: String,
        viewer_id: String,
        bytes: usize,
    },
    /// An output chunk was fanned out.
    OutputFanned {
        session: String,
        bytes: usize,
        viewers: usize,
    },
}

/// Creates the engine event channel.
pub fn channel() -> broadcast::Sender<EngineEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Sends an event; having no subscribers is fine.
pub(crate) fn emit(tx: &broadcast::Sender<EngineEvent>, event: EngineEvent) {
    let _ = tx.send(event);
}
