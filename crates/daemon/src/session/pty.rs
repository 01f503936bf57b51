//! PTY-backed process handle.
//!
//! A [`PtyProcess`] owns one pseudo-terminal and the child running in it
//! (for muxcast, a `tmux attach-session` client). Output is pumped into a
//! bounded channel by a dedicated reader thread that only issues the next
//! read once the previous chunk has been accepted, so a consumer that stops
//! pulling pauses the PTY.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Name of a session, identical to the external tmux session name.
pub type SessionName = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The external session does not exist.
    #[error("session not found: {0}")]
    NotFound(SessionName),

    /// The session name cannot be used as a tmux target.
    #[error("invalid session name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The process has already exited or been killed.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionName),

    /// Failed to spawn the PTY or the attach client.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// Scrollback capture failed.
    #[error("history capture failed: {0}")]
    CaptureFailed(String),

    /// Scrollback capture did not finish in time.
    #[error("history capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    /// The configured session limit is reached.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The process exited with a code.
    Exited(i32),
    /// The process was killed by the engine.
    Killed,
    /// The process is gone but its status could not be collected.
    Unknown,
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Output chunks buffered between the reader thread and the broker.
///
/// One chunk: the reader blocks until the broker has pulled the previous one.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1;

/// Polls of `try_wait` after SIGHUP before escalating to a hard kill.
const HANGUP_POLLS: u32 = 25;

/// Interval between hang-up polls.
const HANGUP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Control surface of a spawned terminal process.
///
/// Object-safe so the registry can hold real PTYs and in-memory test doubles
/// behind the same pointer.
pub trait ProcessControl: Send + Sync {
    /// Process ID of the child, if known.
    fn pid(&self) -> Option<u32>;

    /// Current terminal geometry as `(cols, rows)`.
    fn size(&self) -> (u16, u16);

    /// Whether the process is still considered running.
    fn is_running(&self) -> bool;

    /// Writes input bytes to the terminal.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), SessionError>>;

    /// Resizes the terminal.
    fn resize(&self, cols: u16, rows: u16) -> BoxFuture<'_, Result<(), SessionError>>;

    /// Terminates the process and reaps it.
    fn kill(&self) -> BoxFuture<'_, Result<ProcessStatus, SessionError>>;

    /// Returns the exit status if the process has already ended.
    fn try_wait(&self) -> BoxFuture<'_, Result<Option<ProcessStatus>, SessionError>>;
}

/// What to run inside a new PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    /// Label used in log records (the session name).
    pub label: String,
    /// Program to execute.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Environment variables removed from the inherited environment.
    pub env_remove: Vec<String>,
}

impl PtyCommand {
    /// Creates a command with no arguments.
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            env_remove: Vec::new(),
        }
    }

    /// Appends arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Removes an inherited environment variable.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }
}

/// A child process attached to a pseudo-terminal.
pub struct PtyProcess {
    label: String,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    running: Arc<AtomicBool>,
    /// `cols << 16 | rows`.
    geometry: AtomicU32,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns `command` in a new PTY of the given size.
    ///
    /// Returns the process and the receiver its output is pumped into. The
    /// receiver yields `None` once the PTY reaches EOF (the child exited).
    pub fn spawn(
        command: PtyCommand,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, mpsc::Receiver<Bytes>), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        if let Some(ref dir) = command.cwd {
            cmd.cwd(dir);
        }
        for key in &command.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));

        start_read_loop(
            command.label.clone(),
            reader,
            output_tx,
            Arc::clone(&running),
        )?;

        tracing::debug!(
            session = %command.label,
            program = %command.program,
            pid = ?pid,
            cols,
            rows,
            "Spawned PTY process"
        );

        let process = PtyProcess {
            label: command.label,
            master: Arc::new(Mutex::new(pair.master)),
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            running,
            geometry: AtomicU32::new(pack(cols, rows)),
            pid,
        };

        Ok((process, output_rx))
    }

    fn terminated(&self) -> SessionError {
        SessionError::AlreadyTerminated(self.label.clone())
    }
}

impl ProcessControl for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn size(&self) -> (u16, u16) {
        unpack(self.geometry.load(Ordering::SeqCst))
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(self.terminated());
            }

            let mut writer = self.writer.lock().await;
            writer
                .write_all(data)
                .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

            Ok(())
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            if !self.is_running() {
                return Err(self.terminated());
            }
            if cols == 0 || rows == 0 {
                return Err(SessionError::ResizeFailed(format!(
                    "invalid size {cols}x{rows}"
                )));
            }

            let master = self.master.lock().await;
            master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
            self.geometry.store(pack(cols, rows), Ordering::SeqCst);

            tracing::debug!(session = %self.label, cols, rows, "Resized PTY");

            Ok(())
        })
    }

    fn kill(&self) -> BoxFuture<'_, Result<ProcessStatus, SessionError>> {
        Box::pin(async move {
            if !self.running.swap(false, Ordering::SeqCst) {
                return Err(self.terminated());
            }

            // A hang-up lets the tmux client detach cleanly; the tmux session
            // itself keeps running.
            #[cfg(unix)]
            if let Some(pid) = self.pid {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                    tracing::debug!(session = %self.label, error = %e, "SIGHUP failed");
                }
            }

            let child = Arc::clone(&self.child);
            let status = tokio::task::spawn_blocking(move || {
                let mut child = child.blocking_lock();
                for _ in 0..HANGUP_POLLS {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Ok(ProcessStatus::Exited(status.exit_code() as i32));
                    }
                    std::thread::sleep(HANGUP_POLL_INTERVAL);
                }
                child.kill()?;
                child.wait()?;
                Ok::<_, std::io::Error>(ProcessStatus::Killed)
            })
            .await
            .map_err(|e| SessionError::KillFailed(e.to_string()))?
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

            tracing::info!(session = %self.label, status = ?status, "PTY process killed");

            Ok(status)
        })
    }

    fn try_wait(&self) -> BoxFuture<'_, Result<Option<ProcessStatus>, SessionError>> {
        Box::pin(async move {
            let mut child = self.child.lock().await;
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.running.store(false, Ordering::SeqCst);
                    Ok(Some(ProcessStatus::Exited(status.exit_code() as i32)))
                }
                Ok(None) => Ok(None),
                Err(e) => Err(SessionError::Io(e)),
            }
        })
    }
}

/// Pumps PTY output into `output_tx` on a dedicated thread.
///
/// `blocking_send` parks the thread while the channel is full, which stops
/// reads from the PTY until the broker catches up.
fn start_read_loop(
    label: String,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Bytes>,
    running: Arc<AtomicBool>,
) -> Result<(), SessionError> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{label}"))
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::info!(session = %label, "PTY EOF - process exited");
                        break;
                    }
                    Ok(n) => {
                        if output_tx
                            .blocking_send(Bytes::copy_from_slice(&buffer[..n]))
                            .is_err()
                        {
                            tracing::debug!(session = %label, "Output receiver dropped");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO on the master once the child is gone.
                        if running.load(Ordering::SeqCst) {
                            tracing::debug!(
                                session = %label,
                                error = %e,
                                "PTY read ended"
                            );
                        }
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        })
        .map(|_| ())
        .map_err(|e| SessionError::SpawnFailed(format!("failed to start PTY reader: {e}")))
}

fn pack(cols: u16, rows: u16) -> u32 {
    (u32::from(cols) << 16) | u32::from(rows)
}

fn unpack(value: u32) -> (u16, u16) {
    ((value >> 16) as u16, (value & 0xffff) as u16)
}
