//! Session output multiplexer.
//!
//! One [`FanOutBroker`] task runs per session. It pulls a chunk from the
//! process, optionally logs it, and writes it to every live viewer. The next
//! chunk is pulled only after every write has settled, so the process is
//! paused while any viewer is behind. Each viewer queue holds a single frame
//! and each write is bounded by a timeout; a viewer that cannot drain in time
//! is evicted instead of stalling the session indefinitely.
//!
//! History replay for a new viewer also runs on the broker, between two
//! chunks. Output produced during a replay waits in the process channel and
//! reaches the viewer once it is live.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use muxcast_protocol::EngineControl;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::history::{HistoryReplay, ReplayError};
use super::log_sink::LogSink;
use super::pty::ProcessStatus;
use super::registry::{SessionRegistry, SessionState};
use crate::events::{self, EngineEvent, TeardownReason};

/// Unique identifier for a viewer connection.
pub type ViewerId = String;

/// Frames queued per viewer: at most one outstanding chunk.
pub const VIEWER_QUEUE_CAPACITY: usize = 1;

/// Pending replay requests per session.
pub(crate) const REPLAY_QUEUE_CAPACITY: usize = 16;

/// Attempts to collect an exit status after the output stream closed.
const EXIT_STATUS_POLLS: u32 = 20;

/// Interval between exit status polls.
const EXIT_STATUS_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A frame on its way to a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Replayed or live terminal output.
    Output(Bytes),
    /// An engine control frame.
    Control(EngineControl),
}

/// Where a viewer is in its attach sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerPhase {
    /// Receiving the history backlog; skipped by live fan-out.
    Replaying,
    /// Receiving live output.
    Live,
    /// Being disconnected.
    Closing,
}

/// Statistics about a viewer's deliveries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerStats {
    /// Live chunks delivered.
    pub chunks_sent: u64,
    /// Live bytes delivered.
    pub bytes_sent: u64,
    /// Writes that did not complete within the write timeout.
    pub timeouts: u64,
}

/// Engine-side handle of a viewer connection, owned by its session.
#[derive(Debug)]
pub struct ViewerHandle {
    id: ViewerId,
    tx: mpsc::Sender<OutboundFrame>,
    close: CancellationToken,
    phase: ViewerPhase,
    geometry: Option<(u16, u16)>,
    stats: ViewerStats,
}

/// Transport-side end of a viewer connection.
#[derive(Debug)]
pub struct ViewerOutlet {
    id: ViewerId,
    rx: mpsc::Receiver<OutboundFrame>,
    close: CancellationToken,
}

impl ViewerHandle {
    /// Creates a viewer with a fresh id.
    pub fn new() -> (Self, ViewerOutlet) {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Creates a viewer with a specific id.
    pub fn with_id(id: impl Into<ViewerId>) -> (Self, ViewerOutlet) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE_CAPACITY);
        let close = CancellationToken::new();
        let handle = ViewerHandle {
            id: id.clone(),
            tx,
            close: close.clone(),
            phase: ViewerPhase::Replaying,
            geometry: None,
            stats: ViewerStats::default(),
        };
        (handle, ViewerOutlet { id, rx, close })
    }

    /// Returns the viewer ID.
    pub fn id(&self) -> &ViewerId {
        &self.id
    }

    /// Current phase.
    pub fn phase(&self) -> ViewerPhase {
        self.phase
    }

    /// Last geometry this viewer requested.
    pub fn geometry(&self) -> Option<(u16, u16)> {
        self.geometry
    }

    /// Returns a clone of the current statistics.
    pub fn stats(&self) -> ViewerStats {
        self.stats.clone()
    }

    /// A sender into this viewer's queue.
    pub fn sender(&self) -> mpsc::Sender<OutboundFrame> {
        self.tx.clone()
    }

    /// Whether the transport side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.close.is_cancelled()
    }

    pub(crate) fn set_phase(&mut self, phase: ViewerPhase) {
        self.phase = phase;
    }

    pub(crate) fn set_geometry(&mut self, cols: u16, rows: u16) {
        self.geometry = Some((cols, rows));
    }

    pub(crate) fn record_delivery(&mut self, bytes: usize) {
        self.stats.chunks_sent += 1;
        self.stats.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_timeout(&mut self) {
        self.stats.timeouts += 1;
    }

    /// Asks the transport to close the connection.
    pub fn close(&mut self) {
        self.phase = ViewerPhase::Closing;
        self.close.cancel();
    }
}

impl ViewerOutlet {
    /// Returns the viewer ID.
    pub fn id(&self) -> &ViewerId {
        &self.id
    }

    /// Receives the next frame; `None` once the session dropped the viewer.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    /// Token cancelled when the engine wants the connection closed.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Whether the engine asked for the connection to close.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// Result of writing one frame to one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was queued.
    Delivered,
    /// The queue stayed full for the whole write timeout.
    TimedOut,
    /// The viewer's transport is gone.
    Closed,
}

/// Writes `frame` to every target concurrently and waits for all writes to
/// settle.
pub async fn deliver(
    targets: Vec<(ViewerId, mpsc::Sender<OutboundFrame>)>,
    frame: OutboundFrame,
    write_timeout: Duration,
) -> Vec<(ViewerId, Delivery)> {
    join_all(targets.into_iter().map(|(id, tx)| {
        let frame = frame.clone();
        async move {
            let outcome = match tx.send_timeout(frame, write_timeout).await {
                Ok(()) => Delivery::Delivered,
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => Delivery::TimedOut,
                Err(mpsc::error::SendTimeoutError::Closed(_)) => Delivery::Closed,
            };
            (id, outcome)
        }
    }))
    .await
}

/// A viewer waiting for its history replay.
#[derive(Debug)]
pub(crate) struct ReplayRequest {
    pub(crate) viewer_id: ViewerId,
    pub(crate) done: oneshot::Sender<Result<usize, ReplayError>>,
}

enum Step {
    Replay(ReplayRequest),
    Output(Option<Bytes>),
}

/// Per-session task distributing process output to viewers.
pub struct FanOutBroker {
    registry: Weak<SessionRegistry>,
    state: Arc<SessionState>,
    output: mpsc::Receiver<Bytes>,
    replays: mpsc::Receiver<ReplayRequest>,
    history: HistoryReplay,
    sink: LogSink,
    write_timeout: Duration,
    events: broadcast::Sender<EngineEvent>,
}

impl FanOutBroker {
    /// Creates a broker for `state` consuming `output` and the replay
    /// requests queued on `replays`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Weak<SessionRegistry>,
        state: Arc<SessionState>,
        output: mpsc::Receiver<Bytes>,
        replays: mpsc::Receiver<ReplayRequest>,
        history: HistoryReplay,
        sink: LogSink,
        write_timeout: Duration,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            registry,
            state,
            output,
            replays,
            history,
            sink,
            write_timeout,
            events,
        }
    }

    /// Starts the broker task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let shutdown = self.state.shutdown_token();

        let exited = loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break false,
                Some(request) = self.replays.recv() => Step::Replay(request),
                chunk = self.output.recv() => Step::Output(chunk),
            };

            let chunk = match step {
                Step::Replay(request) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break false,
                        _ = self.replay(request) => {}
                    }
                    continue;
                }
                Step::Output(Some(chunk)) => chunk,
                Step::Output(None) => break true,
            };

            if self.state.logging_enabled() {
                self.sink.record(&chunk).await;
            }
            self.fan_out(chunk).await;
        };

        self.sink.close().await;

        if exited {
            let status = self.exit_status().await;
            tracing::info!(session = %self.state.name(), status = ?status, "Session process exited");
            if let Some(registry) = self.registry.upgrade() {
                registry
                    .remove_instance(
                        self.state.name(),
                        self.state.instance_id(),
                        TeardownReason::ProcessExited(status),
                    )
                    .await;
            }
        }

        tracing::debug!(session = %self.state.name(), "Broker stopped");
    }

    /// Sends scrollback and the completion marker to one viewer, then moves
    /// it live. The process stays paused until this returns.
    async fn replay(&self, request: ReplayRequest) {
        let ReplayRequest { viewer_id, done } = request;

        let result = match self.state.viewer_sender(&viewer_id) {
            Some(tx) => {
                self.history
                    .replay(self.state.name(), &tx, self.write_timeout)
                    .await
            }
            None => Err(ReplayError::Closed),
        };

        match &result {
            Ok(_) => {
                self.state.mark_live(&viewer_id);
            }
            Err(e) => {
                tracing::warn!(
                    session = %self.state.name(),
                    viewer_id = %viewer_id,
                    error = %e,
                    "History replay failed, dropping viewer"
                );
                self.evict(&viewer_id);
            }
        }

        // The requester may have given up.
        let _ = done.send(result);
    }

    /// Writes one chunk to every live viewer, evicting those that fail.
    async fn fan_out(&self, chunk: Bytes) {
        let targets = self.state.live_viewers();
        let viewers = targets.len();
        let bytes = chunk.len();

        let outcomes = deliver(targets, OutboundFrame::Output(chunk), self.write_timeout).await;

        for (viewer_id, outcome) in outcomes {
            match outcome {
                Delivery::Delivered => self.state.record_delivery(&viewer_id, bytes),
                Delivery::TimedOut => {
                    tracing::warn!(
                        session = %self.state.name(),
                        viewer_id = %viewer_id,
                        timeout = ?self.write_timeout,
                        "Viewer did not drain output in time, evicting"
                    );
                    self.state.record_timeout(&viewer_id);
                    self.evict(&viewer_id);
                }
                Delivery::Closed => {
                    tracing::debug!(
                        session = %self.state.name(),
                        viewer_id = %viewer_id,
                        "Viewer queue closed, evicting"
                    );
                    self.evict(&viewer_id);
                }
            }
        }

        events::emit(
            &self.events,
            EngineEvent::OutputFanned {
                session: self.state.name().to_string(),
                bytes,
                viewers,
            },
        );
    }

    fn evict(&self, viewer_id: &ViewerId) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.state.name(), viewer_id);
        }
    }

    async fn exit_status(&self) -> ProcessStatus {
        for _ in 0..EXIT_STATUS_POLLS {
            match self.state.process().try_wait().await {
                Ok(Some(status)) => return status,
                Ok(None) => tokio::time::sleep(EXIT_STATUS_POLL_INTERVAL).await,
                Err(_) => break,
            }
        }
        ProcessStatus::Unknown
    }
}
