//! Session registry.
//!
//! The registry is the single source of truth for which sessions are
//! attached. It owns every [`SessionState`], starts one [`FanOutBroker`] per
//! session, and runs the zero-viewer grace timer.
//!
//! Locking: the session map is a `DashMap`; per-session bookkeeping sits
//! behind a `std::sync::Mutex` inside [`SessionState`]. Whenever both are
//! held, the map shard is taken first. Neither is ever held across an
//! `.await`. Spawns are serialized by a per-name async gate so two concurrent
//! first attaches for one name never start two processes, while attaches to
//! other names proceed independently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::backend::{validate_session_name, SessionBackend, SpawnRequest};
use super::history::{HistoryReplay, ReplayError};
use super::lifecycle::{CleanupTimer, LifecycleState};
use super::log_sink::LogSink;
use super::multiplexer::{
    FanOutBroker, OutboundFrame, ReplayRequest, ViewerHandle, ViewerId, ViewerPhase, ViewerStats,
    REPLAY_QUEUE_CAPACITY,
};
use super::pty::{ProcessControl, SessionError, SessionName};
use crate::events::{self, EngineEvent, TeardownReason};

/// Default zero-viewer grace period.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default per-viewer write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a session outlives its last viewer.
    pub grace_period: Duration,
    /// How long a viewer may take to accept one frame.
    pub write_timeout: Duration,
    /// Geometry of newly spawned processes.
    pub default_cols: u16,
    /// Geometry of newly spawned processes.
    pub default_rows: u16,
    /// Upper bound on concurrently attached sessions.
    pub max_sessions: usize,
    /// Whether new viewers get a scrollback replay.
    pub history_enabled: bool,
    /// Lines captured for replay.
    pub history_lines: usize,
    /// Timeout of each capture attempt.
    pub capture_timeout: Duration,
    /// Initial logging flag of new sessions.
    pub logging_enabled_by_default: bool,
    /// Directory for per-session output logs.
    pub log_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            default_cols: 80,
            default_rows: 24,
            max_sessions: 64,
            history_enabled: true,
            history_lines: 1000,
            capture_timeout: Duration::from_secs(2),
            logging_enabled_by_default: true,
            log_dir: std::env::temp_dir().join("muxcast-session-logs"),
        }
    }
}

/// Snapshot of a session for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session name.
    pub name: SessionName,
    /// Identifier of this incarnation of the session.
    pub instance_id: String,
    /// Process ID of the attach client.
    pub pid: Option<u32>,
    /// Attached viewers.
    pub viewers: usize,
    /// Lifecycle state.
    pub lifecycle: LifecycleState,
    /// Whether output is being logged.
    pub logging_enabled: bool,
    /// Terminal geometry.
    pub size: (u16, u16),
    /// Time left before cleanup, while in grace.
    pub grace_remaining: Option<Duration>,
    /// Time since the process was spawned.
    pub uptime: Duration,
}

#[derive(Default)]
struct SessionInner {
    viewers: HashMap<ViewerId, ViewerHandle>,
    cleanup: Option<CleanupTimer>,
    torn_down: bool,
}

impl SessionInner {
    fn lifecycle(&self) -> LifecycleState {
        if self.torn_down {
            LifecycleState::TornDown
        } else if self.cleanup.is_some() {
            LifecycleState::Grace
        } else {
            LifecycleState::Active
        }
    }
}

/// State of one attached session.
pub struct SessionState {
    name: SessionName,
    instance_id: String,
    process: Box<dyn ProcessControl>,
    logging: AtomicBool,
    shutdown: CancellationToken,
    started_at: Instant,
    events: broadcast::Sender<EngineEvent>,
    replays: mpsc::Sender<ReplayRequest>,
    inner: Mutex<SessionInner>,
}

impl SessionState {
    fn new(
        name: &str,
        process: Box<dyn ProcessControl>,
        logging: bool,
        events: broadcast::Sender<EngineEvent>,
        replays: mpsc::Sender<ReplayRequest>,
    ) -> Self {
        Self {
            name: name.to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            process,
            logging: AtomicBool::new(logging),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            events,
            replays,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of this incarnation; changes when a name is re-attached
    /// after teardown.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The attached process.
    pub fn process(&self) -> &dyn ProcessControl {
        self.process.as_ref()
    }

    /// Whether output is appended to the session log.
    pub fn logging_enabled(&self) -> bool {
        self.logging.load(Ordering::SeqCst)
    }

    /// Toggles the session log.
    pub fn set_logging(&self, enabled: bool) {
        let previous = self.logging.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            tracing::info!(session = %self.name, enabled, "Session logging toggled");
        }
    }

    /// Token cancelled when the session is torn down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether the session has been torn down.
    pub fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    /// Attached viewers, in any phase.
    pub fn viewer_count(&self) -> usize {
        self.lock().viewers.len()
    }

    /// IDs of attached viewers.
    pub fn viewer_ids(&self) -> Vec<ViewerId> {
        self.lock().viewers.keys().cloned().collect()
    }

    /// Phase of one viewer.
    pub fn viewer_phase(&self, viewer_id: &str) -> Option<ViewerPhase> {
        self.lock().viewers.get(viewer_id).map(ViewerHandle::phase)
    }

    /// Last geometry a viewer requested.
    pub fn viewer_geometry(&self, viewer_id: &str) -> Option<(u16, u16)> {
        self.lock().viewers.get(viewer_id).and_then(ViewerHandle::geometry)
    }

    /// Delivery statistics of one viewer.
    pub fn viewer_stats(&self, viewer_id: &str) -> Option<ViewerStats> {
        self.lock().viewers.get(viewer_id).map(ViewerHandle::stats)
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        self.lock().lifecycle()
    }

    /// Introspection snapshot.
    pub fn info(&self) -> SessionInfo {
        let inner = self.lock();
        SessionInfo {
            name: self.name.clone(),
            instance_id: self.instance_id.clone(),
            pid: self.process.pid(),
            viewers: inner.viewers.len(),
            lifecycle: inner.lifecycle(),
            logging_enabled: self.logging_enabled(),
            size: self.process.size(),
            grace_remaining: inner.cleanup.as_ref().map(CleanupTimer::remaining),
            uptime: self.started_at.elapsed(),
        }
    }

    /// Queues a history replay for `viewer_id` on the session's broker and
    /// waits for it to finish.
    pub(crate) async fn request_replay(&self, viewer_id: &str) -> Result<usize, ReplayError> {
        let (done, result) = oneshot::channel();
        self.replays
            .send(ReplayRequest {
                viewer_id: viewer_id.to_string(),
                done,
            })
            .await
            .map_err(|_| ReplayError::Closed)?;
        result.await.unwrap_or(Err(ReplayError::Closed))
    }

    /// Moves a replayed viewer into live fan-out.
    pub fn mark_live(&self, viewer_id: &str) -> bool {
        match self.lock().viewers.get_mut(viewer_id) {
            Some(viewer) if viewer.phase() == ViewerPhase::Replaying => {
                viewer.set_phase(ViewerPhase::Live);
                true
            }
            _ => false,
        }
    }

    /// Queue senders of every live viewer.
    pub(crate) fn live_viewers(&self) -> Vec<(ViewerId, tokio::sync::mpsc::Sender<OutboundFrame>)> {
        self.lock()
            .viewers
            .values()
            .filter(|viewer| viewer.phase() == ViewerPhase::Live)
            .map(|viewer| (viewer.id().clone(), viewer.sender()))
            .collect()
    }

    pub(crate) fn viewer_sender(
        &self,
        viewer_id: &str,
    ) -> Option<tokio::sync::mpsc::Sender<OutboundFrame>> {
        self.lock().viewers.get(viewer_id).map(ViewerHandle::sender)
    }

    pub(crate) fn record_delivery(&self, viewer_id: &str, bytes: usize) {
        if let Some(viewer) = self.lock().viewers.get_mut(viewer_id) {
            viewer.record_delivery(bytes);
        }
    }

    pub(crate) fn record_timeout(&self, viewer_id: &str) {
        if let Some(viewer) = self.lock().viewers.get_mut(viewer_id) {
            viewer.record_timeout();
        }
    }

    /// Forwards viewer input to the process unmodified.
    pub async fn write_input(&self, viewer_id: &str, data: &[u8]) -> Result<(), SessionError> {
        self.process.write(data).await?;
        events::emit(
            &self.events,
            EngineEvent::InputForwarded {
                session: self.name.clone(),
                viewer_id: viewer_id.to_string(),
                bytes: data.len(),
            },
        );
        Ok(())
    }

    /// Resizes the terminal on behalf of a viewer.
    pub async fn resize(&self, viewer_id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        if let Some(viewer) = self.lock().viewers.get_mut(viewer_id) {
            viewer.set_geometry(cols, rows);
        }
        self.process.resize(cols, rows).await
    }
}

/// A slot held against the session limit while a spawn is in flight.
struct SpawnReservation<'a>(&'a AtomicUsize);

impl Drop for SpawnReservation<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-wide map from session name to session state.
pub struct SessionRegistry {
    sessions: DashMap<SessionName, Arc<SessionState>>,
    backend: Arc<dyn SessionBackend>,
    history: HistoryReplay,
    config: RegistryConfig,
    spawn_gates: DashMap<SessionName, Arc<tokio::sync::Mutex<()>>>,
    pending_spawns: AtomicUsize,
    next_timer_id: AtomicU64,
    events: broadcast::Sender<EngineEvent>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        config: RegistryConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> Arc<Self> {
        let history = HistoryReplay::new(
            Arc::clone(&backend),
            config.history_lines,
            config.capture_timeout,
        )
        .with_enabled(config.history_enabled);

        Arc::new(Self {
            sessions: DashMap::new(),
            backend,
            history,
            config,
            spawn_gates: DashMap::new(),
            pending_spawns: AtomicUsize::new(0),
            next_timer_id: AtomicU64::new(1),
            events,
        })
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Attaches `viewer` to the named session, spawning a process on first
    /// attach.
    ///
    /// Idempotent per name: an existing session is reused and any pending
    /// cleanup is cancelled. The viewer starts in [`ViewerPhase::Replaying`];
    /// call [`replay_history`](Self::replay_history) to move it live.
    pub async fn attach(
        self: &Arc<Self>,
        name: &str,
        cwd_hint: Option<PathBuf>,
        viewer: ViewerHandle,
    ) -> Result<Arc<SessionState>, SessionError> {
        validate_session_name(name)?;
        let viewer_id = viewer.id().clone();

        let viewer = match self.try_join(name, viewer) {
            Ok(state) => return Ok(self.joined(state, &viewer_id)),
            Err(viewer) => viewer,
        };

        let gate = Arc::clone(self.spawn_gates.entry(name.to_string()).or_default().value());
        let result = {
            let _guard = gate.lock().await;
            self.spawn_and_join(name, cwd_hint, viewer).await
        };

        drop(gate);
        self.spawn_gates
            .remove_if(name, |_, gate| Arc::strong_count(gate) == 1);

        result.map(|state| self.joined(state, &viewer_id))
    }

    /// Spawns the session and adds the first viewer. Runs under the name's
    /// spawn gate.
    async fn spawn_and_join(
        self: &Arc<Self>,
        name: &str,
        cwd_hint: Option<PathBuf>,
        viewer: ViewerHandle,
    ) -> Result<Arc<SessionState>, SessionError> {
        // Another attach may have spawned while we waited for the gate.
        let viewer = match self.try_join(name, viewer) {
            Ok(state) => return Ok(state),
            Err(viewer) => viewer,
        };

        // Spawns of other names run concurrently; in-flight ones count
        // against the limit.
        let Some(_reservation) = self.reserve_spawn() else {
            tracing::warn!(
                session = %name,
                max_sessions = self.config.max_sessions,
                "Session limit reached"
            );
            return Err(SessionError::LimitReached(self.config.max_sessions));
        };

        let spawned = self
            .backend
            .spawn(SpawnRequest {
                name: name.to_string(),
                cwd: cwd_hint,
                cols: self.config.default_cols,
                rows: self.config.default_rows,
            })
            .await
            .map_err(|e| {
                tracing::warn!(session = %name, error = %e, "Failed to attach session");
                e
            })?;

        let (replay_tx, replay_rx) = mpsc::channel(REPLAY_QUEUE_CAPACITY);
        let state = Arc::new(SessionState::new(
            name,
            spawned.process,
            self.config.logging_enabled_by_default,
            self.events.clone(),
            replay_tx,
        ));
        state.lock().viewers.insert(viewer.id().clone(), viewer);
        self.sessions.insert(name.to_string(), Arc::clone(&state));

        tracing::info!(
            session = %name,
            instance_id = %state.instance_id(),
            pid = ?state.process().pid(),
            "Session attached"
        );
        events::emit(
            &self.events,
            EngineEvent::SessionStarted {
                session: name.to_string(),
                pid: state.process().pid(),
            },
        );

        FanOutBroker::new(
            Arc::downgrade(self),
            Arc::clone(&state),
            spawned.output,
            replay_rx,
            self.history.clone(),
            LogSink::new(&self.config.log_dir, name),
            self.config.write_timeout,
            self.events.clone(),
        )
        .spawn();

        Ok(state)
    }

    fn reserve_spawn(&self) -> Option<SpawnReservation<'_>> {
        self.pending_spawns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                (self.sessions.len() + pending < self.config.max_sessions).then_some(pending + 1)
            })
            .ok()
            .map(|_| SpawnReservation(&self.pending_spawns))
    }

    /// Adds a viewer to an existing session, cancelling its cleanup timer.
    ///
    /// Hands the viewer back if there is no session to join.
    fn try_join(&self, name: &str, viewer: ViewerHandle) -> Result<Arc<SessionState>, ViewerHandle> {
        let Some(entry) = self.sessions.get(name) else {
            return Err(viewer);
        };
        let state = Arc::clone(entry.value());

        {
            let mut inner = state.lock();
            if inner.torn_down {
                return Err(viewer);
            }
            if let Some(timer) = inner.cleanup.take() {
                timer.cancel();
                tracing::info!(session = %name, "Viewer reattached, cleanup cancelled");
            }
            inner.viewers.insert(viewer.id().clone(), viewer);
        }

        drop(entry);
        Ok(state)
    }

    fn joined(&self, state: Arc<SessionState>, viewer_id: &str) -> Arc<SessionState> {
        tracing::info!(
            session = %state.name(),
            viewer_id = %viewer_id,
            viewers = state.viewer_count(),
            "Viewer attached"
        );
        events::emit(
            &self.events,
            EngineEvent::ViewerAttached {
                session: state.name().to_string(),
                viewer_id: viewer_id.to_string(),
            },
        );
        state
    }

    /// Sends scrollback and the completion marker to a viewer, then moves it
    /// into live fan-out.
    ///
    /// The replay runs on the session's broker between two output chunks,
    /// so the process is paused until the viewer is live and no chunk is
    /// lost in between. A viewer that cannot take the replay is detached.
    pub async fn replay_history(
        &self,
        state: &SessionState,
        viewer_id: &str,
    ) -> Result<usize, ReplayError> {
        if state.viewer_sender(viewer_id).is_none() {
            return Err(ReplayError::Closed);
        }
        state.request_replay(viewer_id).await
    }

    /// Removes a viewer from a session and closes its connection.
    ///
    /// Starts the grace timer when the last viewer leaves; an already
    /// running timer is kept. Unknown names and viewers are ignored.
    pub fn detach(self: &Arc<Self>, name: &str, viewer_id: &str) -> bool {
        let Some(state) = self.sessions.get(name).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };

        let remaining = {
            let mut inner = state.lock();
            let Some(mut viewer) = inner.viewers.remove(viewer_id) else {
                return false;
            };
            viewer.close();

            if inner.viewers.is_empty() && inner.cleanup.is_none() && !inner.torn_down {
                inner.cleanup = Some(self.schedule_cleanup(&state));
                tracing::info!(
                    session = %name,
                    grace_period = ?self.config.grace_period,
                    "Last viewer left, cleanup scheduled"
                );
            }
            inner.viewers.len()
        };

        tracing::info!(
            session = %name,
            viewer_id = %viewer_id,
            viewers = remaining,
            "Viewer detached"
        );
        events::emit(
            &self.events,
            EngineEvent::ViewerDetached {
                session: name.to_string(),
                viewer_id: viewer_id.to_string(),
            },
        );
        true
    }

    fn schedule_cleanup(self: &Arc<Self>, state: &SessionState) -> CleanupTimer {
        let timer_id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(self);
        let name = state.name().to_string();
        let instance_id = state.instance_id().to_string();

        CleanupTimer::schedule(timer_id, self.config.grace_period, move || async move {
            if let Some(registry) = registry.upgrade() {
                registry.expire(&name, &instance_id, timer_id).await;
            }
        })
    }

    /// Tears a session down if `timer_id` is still its pending cleanup and
    /// nobody re-attached.
    async fn expire(&self, name: &str, instance_id: &str, timer_id: u64) {
        let removed = self.sessions.remove_if(name, |_, state| {
            let inner = state.lock();
            state.instance_id() == instance_id
                && inner.viewers.is_empty()
                && inner
                    .cleanup
                    .as_ref()
                    .is_some_and(|timer| timer.id() == timer_id)
        });

        match removed {
            Some((_, state)) => {
                tracing::info!(session = %name, "Grace period expired with no viewers");
                self.teardown(state, TeardownReason::GraceExpired).await;
            }
            None => {
                tracing::debug!(session = %name, timer_id, "Stale cleanup timer ignored");
            }
        }
    }

    /// Forcibly tears a session down.
    ///
    /// Closes every viewer, kills the process and closes the log. Returns
    /// whether a session was removed.
    pub async fn remove(&self, name: &str) -> bool {
        match self.sessions.remove(name) {
            Some((_, state)) => {
                self.teardown(state, TeardownReason::Removed).await;
                true
            }
            None => false,
        }
    }

    /// Tears down a specific incarnation of a session.
    pub(crate) async fn remove_instance(
        &self,
        name: &str,
        instance_id: &str,
        reason: TeardownReason,
    ) -> bool {
        let removed = self
            .sessions
            .remove_if(name, |_, state| state.instance_id() == instance_id);
        match removed {
            Some((_, state)) => {
                self.teardown(state, reason).await;
                true
            }
            None => false,
        }
    }

    /// Tears down every session.
    pub async fn shutdown(&self) {
        let names: Vec<SessionName> = self.sessions.iter().map(|e| e.key().clone()).collect();
        tracing::info!(sessions = names.len(), "Tearing down all sessions");

        for name in names {
            if let Some((_, state)) = self.sessions.remove(&name) {
                self.teardown(state, TeardownReason::Shutdown).await;
            }
        }
    }

    async fn teardown(&self, state: Arc<SessionState>, reason: TeardownReason) {
        let viewers: Vec<ViewerHandle> = {
            let mut inner = state.lock();
            inner.torn_down = true;
            if let Some(timer) = inner.cleanup.take() {
                timer.cancel();
            }
            inner.viewers.drain().map(|(_, viewer)| viewer).collect()
        };

        for mut viewer in viewers {
            viewer.close();
            events::emit(
                &self.events,
                EngineEvent::ViewerDetached {
                    session: state.name().to_string(),
                    viewer_id: viewer.id().clone(),
                },
            );
        }

        // Stops the broker, which closes the log sink.
        state.shutdown.cancel();

        if !matches!(reason, TeardownReason::ProcessExited(_)) {
            match state.process().kill().await {
                Ok(status) => {
                    tracing::debug!(session = %state.name(), status = ?status, "Process stopped");
                }
                Err(SessionError::AlreadyTerminated(_)) => {
                    tracing::debug!(session = %state.name(), "Process already gone");
                }
                Err(e) => {
                    tracing::warn!(session = %state.name(), error = %e, "Failed to kill process");
                }
            }
        }

        tracing::info!(session = %state.name(), reason = ?reason, "Session torn down");
        events::emit(
            &self.events,
            EngineEvent::SessionTornDown {
                session: state.name().to_string(),
                reason,
            },
        );
    }

    /// Returns the state of a session.
    pub fn state(&self, name: &str) -> Option<Arc<SessionState>> {
        self.sessions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns a snapshot of a session.
    pub fn get(&self, name: &str) -> Option<SessionInfo> {
        self.state(name).map(|state| state.info())
    }

    /// Snapshots of every session, sorted by name.
    pub fn list(&self) -> Vec<SessionInfo> {
        let states: Vec<Arc<SessionState>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut infos: Vec<SessionInfo> = states.iter().map(|state| state.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Number of sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a session is registered.
    pub fn exists(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    /// Lifecycle state of a session.
    pub fn lifecycle(&self, name: &str) -> Option<LifecycleState> {
        self.state(name).map(|state| state.lifecycle())
    }
}
