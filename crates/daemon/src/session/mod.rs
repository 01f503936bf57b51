//! Session engine.
//!
//! Attaches to named tmux sessions through a PTY, fans their output out to
//! any number of viewers, replays scrollback to new viewers, and keeps each
//! session alive for a grace period after its last viewer leaves.

pub mod backend;
pub mod history;
pub mod lifecycle;
pub mod log_sink;
pub mod multiplexer;
pub mod pty;
pub mod registry;

pub use backend::{
    validate_session_name, CaptureMode, SessionBackend, SpawnRequest, Spawned, TmuxBackend,
    MAX_SESSION_NAME_LEN,
};
pub use history::{format_backlog, HistoryReplay, ReplayError};
pub use lifecycle::{CleanupTimer, LifecycleState};
pub use log_sink::{is_status_noise, strip_ansi, LogSink};
pub use multiplexer::{
    FanOutBroker, OutboundFrame, ViewerHandle, ViewerId, ViewerOutlet, ViewerPhase, ViewerStats,
    VIEWER_QUEUE_CAPACITY,
};
pub use pty::{
    ProcessControl, ProcessStatus, PtyCommand, PtyProcess, SessionError, SessionName,
    OUTPUT_CHANNEL_CAPACITY,
};
pub use registry::{RegistryConfig, SessionInfo, SessionRegistry, SessionState};
