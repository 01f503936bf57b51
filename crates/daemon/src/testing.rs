//! In-memory session backend for tests.
//!
//! [`ScriptedBackend`] stands in for tmux: sessions are registered by name,
//! captures return scripted text per [`CaptureMode`], and every spawned
//! process is a [`ScriptedProcess`] whose output and exit are driven through
//! a [`ScriptedProcessHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::session::backend::{
    validate_session_name, CaptureMode, SessionBackend, SpawnRequest, Spawned,
};
use crate::session::pty::{ProcessControl, ProcessStatus, SessionError, OUTPUT_CHANNEL_CAPACITY};

static NEXT_PID: AtomicU32 = AtomicU32::new(10_000);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct BackendInner {
    sessions: HashSet<String>,
    captures: HashMap<(String, CaptureMode), Result<String, String>>,
    capture_delays: HashMap<CaptureMode, Duration>,
    capture_calls: Vec<CaptureMode>,
    spawn_delay: Option<Duration>,
    spawn_delays: HashMap<String, Duration>,
    spawn_failure: Option<String>,
    processes: HashMap<String, Vec<ScriptedProcessHandle>>,
}

/// Scripted stand-in for the tmux backend.
#[derive(Default)]
pub struct ScriptedBackend {
    inner: Mutex<BackendInner>,
}

impl ScriptedBackend {
    /// Creates a backend with no sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend knowing the given session names.
    pub fn with_sessions<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::new();
        for name in names {
            backend.add_session(name);
        }
        backend
    }

    /// Makes a session name attachable.
    pub fn add_session(&self, name: impl Into<String>) {
        lock(&self.inner).sessions.insert(name.into());
    }

    /// Scripts the result of capturing `name` in `mode`.
    pub fn set_capture(&self, name: &str, mode: CaptureMode, result: Result<String, String>) {
        lock(&self.inner)
            .captures
            .insert((name.to_string(), mode), result);
    }

    /// Delays every capture in `mode`.
    pub fn set_capture_delay(&self, mode: CaptureMode, delay: Duration) {
        lock(&self.inner).capture_delays.insert(mode, delay);
    }

    /// Delays every spawn.
    pub fn set_spawn_delay(&self, delay: Duration) {
        lock(&self.inner).spawn_delay = Some(delay);
    }

    /// Delays spawns of one session, overriding the global delay.
    pub fn set_spawn_delay_for(&self, name: &str, delay: Duration) {
        lock(&self.inner).spawn_delays.insert(name.to_string(), delay);
    }

    /// Makes every spawn fail with `SpawnFailed(message)`.
    pub fn set_spawn_failure(&self, message: Option<String>) {
        lock(&self.inner).spawn_failure = message;
    }

    /// Modes captured so far, in call order.
    pub fn capture_calls(&self) -> Vec<CaptureMode> {
        lock(&self.inner).capture_calls.clone()
    }

    /// Processes spawned so far, across all sessions.
    pub fn spawn_count(&self) -> usize {
        lock(&self.inner).processes.values().map(Vec::len).sum()
    }

    /// Processes spawned so far for one session.
    pub fn spawn_count_for(&self, name: &str) -> usize {
        lock(&self.inner).processes.get(name).map_or(0, Vec::len)
    }

    /// The most recently spawned process for a session.
    pub fn process(&self, name: &str) -> Option<ScriptedProcessHandle> {
        lock(&self.inner)
            .processes
            .get(name)
            .and_then(|spawned| spawned.last().cloned())
    }
}

impl SessionBackend for ScriptedBackend {
    fn spawn(&self, request: SpawnRequest) -> BoxFuture<'_, Result<Spawned, SessionError>> {
        Box::pin(async move {
            validate_session_name(&request.name)?;

            let delay = {
                let inner = lock(&self.inner);
                inner
                    .spawn_delays
                    .get(&request.name)
                    .copied()
                    .or(inner.spawn_delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut inner = lock(&self.inner);
            if let Some(message) = inner.spawn_failure.clone() {
                return Err(SessionError::SpawnFailed(message));
            }
            if !inner.sessions.contains(&request.name) {
                return Err(SessionError::NotFound(request.name));
            }

            let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
            let shared = Arc::new(ProcessShared {
                label: request.name.clone(),
                pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
                cwd: request.cwd.clone(),
                size: Mutex::new((request.cols, request.rows)),
                resizes: Mutex::new(Vec::new()),
                input: Mutex::new(Vec::new()),
                running: AtomicBool::new(true),
                killed: AtomicBool::new(false),
                status: Mutex::new(None),
                output: Mutex::new(Some(tx)),
            });

            let handle = ScriptedProcessHandle {
                shared: Arc::clone(&shared),
            };
            inner
                .processes
                .entry(request.name)
                .or_default()
                .push(handle);

            Ok(Spawned {
                process: Box::new(ScriptedProcess { shared }),
                output: rx,
            })
        })
    }

    fn capture<'a>(
        &'a self,
        name: &'a str,
        mode: CaptureMode,
        _lines: usize,
    ) -> BoxFuture<'a, Result<String, SessionError>> {
        Box::pin(async move {
            let (delay, result) = {
                let mut inner = lock(&self.inner);
                inner.capture_calls.push(mode);
                (
                    inner.capture_delays.get(&mode).copied(),
                    inner.captures.get(&(name.to_string(), mode)).cloned(),
                )
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            match result {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(SessionError::CaptureFailed(message)),
                None => Err(SessionError::CaptureFailed(format!(
                    "no scripted {} capture for {name}",
                    mode.as_str()
                ))),
            }
        })
    }
}

struct ProcessShared {
    label: String,
    pid: u32,
    cwd: Option<std::path::PathBuf>,
    size: Mutex<(u16, u16)>,
    resizes: Mutex<Vec<(u16, u16)>>,
    input: Mutex<Vec<u8>>,
    running: AtomicBool,
    killed: AtomicBool,
    status: Mutex<Option<ProcessStatus>>,
    output: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ProcessShared {
    fn finish(&self, status: ProcessStatus) {
        self.running.store(false, Ordering::SeqCst);
        *lock(&self.status) = Some(status);
        // Closing the output stream is what the broker sees as an exit.
        lock(&self.output).take();
    }

    fn terminated(&self) -> SessionError {
        SessionError::AlreadyTerminated(self.label.clone())
    }
}

/// A process that only exists in memory.
pub struct ScriptedProcess {
    shared: Arc<ProcessShared>,
}

impl ProcessControl for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.shared.pid)
    }

    fn size(&self) -> (u16, u16) {
        *lock(&self.shared.size)
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(self.shared.terminated());
            }
            lock(&self.shared.input).extend_from_slice(data);
            Ok(())
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(self.shared.terminated());
            }
            if cols == 0 || rows == 0 {
                return Err(SessionError::ResizeFailed(format!(
                    "invalid size {cols}x{rows}"
                )));
            }
            *lock(&self.shared.size) = (cols, rows);
            lock(&self.shared.resizes).push((cols, rows));
            Ok(())
        })
    }

    fn kill(&self) -> BoxFuture<'_, Result<ProcessStatus, SessionError>> {
        Box::pin(async move {
            if !self.shared.running.swap(false, Ordering::SeqCst) {
                return Err(self.shared.terminated());
            }
            self.shared.killed.store(true, Ordering::SeqCst);
            self.shared.finish(ProcessStatus::Killed);
            Ok(ProcessStatus::Killed)
        })
    }

    fn try_wait(&self) -> BoxFuture<'_, Result<Option<ProcessStatus>, SessionError>> {
        Box::pin(async move { Ok(*lock(&self.shared.status)) })
    }
}

/// Test-side control of a [`ScriptedProcess`].
#[derive(Clone)]
pub struct ScriptedProcessHandle {
    shared: Arc<ProcessShared>,
}

impl ScriptedProcessHandle {
    /// Produces an output chunk, waiting while the broker is behind.
    ///
    /// Returns `false` if the process has exited or the broker is gone.
    pub async fn emit(&self, data: impl Into<Bytes>) -> bool {
        let tx = lock(&self.shared.output).clone();
        match tx {
            Some(tx) => tx.send(data.into()).await.is_ok(),
            None => false,
        }
    }

    /// Produces an output chunk without waiting.
    ///
    /// Returns `false` if the single output slot is occupied.
    pub fn try_emit(&self, data: impl Into<Bytes>) -> bool {
        lock(&self.shared.output)
            .as_ref()
            .is_some_and(|tx| tx.try_send(data.into()).is_ok())
    }

    /// Makes the process exit with `code`.
    pub fn exit(&self, code: i32) {
        self.shared.finish(ProcessStatus::Exited(code));
    }

    /// Process ID reported to the engine.
    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    /// Working directory the process was spawned with.
    pub fn cwd(&self) -> Option<std::path::PathBuf> {
        self.shared.cwd.clone()
    }

    /// Everything written to the process so far.
    pub fn input(&self) -> Vec<u8> {
        lock(&self.shared.input).clone()
    }

    /// Current terminal geometry.
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.shared.size)
    }

    /// Every successful resize, in order.
    pub fn resizes(&self) -> Vec<(u16, u16)> {
        lock(&self.shared.resizes).clone()
    }

    /// Whether the engine killed the process.
    pub fn is_killed(&self) -> bool {
        self.shared.killed.load(Ordering::SeqCst)
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}
