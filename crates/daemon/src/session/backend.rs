//! External multiplexer backend.
//!
//! The engine never talks to tmux directly; it goes through
//! [`SessionBackend`], which spawns attach clients and captures scrollback.
//! [`TmuxBackend`] is the production implementation.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::process::Command;
use tokio::sync::mpsc;

use super::pty::{ProcessControl, PtyCommand, PtyProcess, SessionError};

/// Longest accepted session name, in bytes.
pub const MAX_SESSION_NAME_LEN: usize = 128;

/// `TERM` advertised to the attach client.
const ATTACH_TERM: &str = "xterm-256color";

/// Parameters for attaching to an external session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// External session name.
    pub name: String,
    /// Working directory hint from the session-identity resolver.
    pub cwd: Option<PathBuf>,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
}

/// A freshly spawned process and its output stream.
pub struct Spawned {
    /// Control handle for the process.
    pub process: Box<dyn ProcessControl>,
    /// Output chunks; closes when the process exits.
    pub output: mpsc::Receiver<Bytes>,
}

/// Scrollback capture strategies, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    /// Bounded window with wrapped lines joined.
    Joined,
    /// Bounded window, lines as displayed.
    Plain,
    /// Visible pane only, no line-count bound.
    Visible,
}

impl CaptureMode {
    /// All modes in the order they should be tried.
    pub const FALLBACK_ORDER: [CaptureMode; 3] =
        [CaptureMode::Joined, CaptureMode::Plain, CaptureMode::Visible];

    /// Short name used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Joined => "joined",
            CaptureMode::Plain => "plain",
            CaptureMode::Visible => "visible",
        }
    }
}

/// Access to the external multiplexer.
pub trait SessionBackend: Send + Sync + 'static {
    /// Attaches a new process to the named external session.
    ///
    /// Fails with [`SessionError::NotFound`] if the session does not exist.
    fn spawn(&self, request: SpawnRequest) -> BoxFuture<'_, Result<Spawned, SessionError>>;

    /// Captures recent scrollback of the named session as text.
    fn capture<'a>(
        &'a self,
        name: &'a str,
        mode: CaptureMode,
        lines: usize,
    ) -> BoxFuture<'a, Result<String, SessionError>>;
}

/// Checks that `name` is safe to use as a tmux target.
pub fn validate_session_name(name: &str) -> Result<(), SessionError> {
    let reject = |reason| {
        Err(SessionError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return reject("name is empty");
    }
    if name.len() > MAX_SESSION_NAME_LEN {
        return reject("name is too long");
    }
    if name.starts_with('-') {
        return reject("name starts with '-'");
    }
    if name.chars().any(|c| c == ':' || c == '.') {
        return reject("name contains ':' or '.'");
    }
    if name.chars().any(char::is_control) {
        return reject("name contains control characters");
    }
    Ok(())
}

/// Backend driving a local tmux server.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    binary: String,
    default_cwd: Option<PathBuf>,
    command_timeout: Duration,
}

impl TmuxBackend {
    /// Creates a backend using the given tmux binary.
    ///
    /// `command_timeout` bounds every short-lived tmux invocation
    /// (`has-session`, `capture-pane`).
    pub fn new(binary: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            default_cwd: None,
            command_timeout,
        }
    }

    /// Sets the working directory used when no usable hint is given.
    pub fn with_default_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.default_cwd = cwd;
        self
    }

    /// Returns whether the named session exists.
    pub async fn has_session(&self, name: &str) -> Result<bool, SessionError> {
        let target = session_target(name);
        let output = self.run(&["has-session", "-t", target.as_str()]).await?;
        Ok(output.status.success())
    }

    /// Builds the `capture-pane` arguments for a mode.
    fn capture_args(name: &str, mode: CaptureMode, lines: usize) -> Vec<String> {
        let mut args = vec![
            "capture-pane".to_string(),
            "-p".to_string(),
            "-e".to_string(),
            "-t".to_string(),
            pane_target(name),
        ];
        match mode {
            CaptureMode::Joined => {
                args.push("-J".to_string());
                args.push("-S".to_string());
                args.push(format!("-{lines}"));
            }
            CaptureMode::Plain => {
                args.push("-S".to_string());
                args.push(format!("-{lines}"));
            }
            CaptureMode::Visible => {}
        }
        args
    }

    /// Picks the working directory for a new attach client.
    fn resolve_cwd(&self, hint: Option<PathBuf>) -> Option<PathBuf> {
        hint.filter(|dir| dir.is_dir())
            .or_else(|| self.default_cwd.clone().filter(|dir| dir.is_dir()))
    }

    async fn run<S: AsRef<std::ffi::OsStr>>(&self, args: &[S]) -> Result<Output, SessionError> {
        let mut command = Command::new(&self.binary);
        command.args(args).env_remove("TMUX").kill_on_drop(true);

        match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::CaptureTimeout(self.command_timeout)),
        }
    }
}

impl SessionBackend for TmuxBackend {
    fn spawn(&self, request: SpawnRequest) -> BoxFuture<'_, Result<Spawned, SessionError>> {
        Box::pin(async move {
            validate_session_name(&request.name)?;

            match self.has_session(&request.name).await {
                Ok(true) => {}
                Ok(false) => return Err(SessionError::NotFound(request.name)),
                Err(SessionError::Io(e)) => {
                    return Err(SessionError::SpawnFailed(format!(
                        "cannot run {}: {e}",
                        self.binary
                    )))
                }
                Err(e) => return Err(SessionError::SpawnFailed(e.to_string())),
            }

            let target = session_target(&request.name);
            let command = PtyCommand::new(&request.name, &self.binary)
                .args(["attach-session", "-t", target.as_str()])
                .cwd(self.resolve_cwd(request.cwd))
                .env("TERM", ATTACH_TERM)
                .env_remove("TMUX");

            let (process, output) = PtyProcess::spawn(command, request.cols, request.rows)?;

            Ok(Spawned {
                process: Box::new(process),
                output,
            })
        })
    }

    fn capture<'a>(
        &'a self,
        name: &'a str,
        mode: CaptureMode,
        lines: usize,
    ) -> BoxFuture<'a, Result<String, SessionError>> {
        Box::pin(async move {
            let args = Self::capture_args(name, mode, lines);
            let output = self.run(&args).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(SessionError::CaptureFailed(stderr.trim().to_string()));
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }
}

/// Exact-match target for a session (`=name`).
fn session_target(name: &str) -> String {
    format!("={name}")
}

/// Exact-match target for the active pane of a session (`=name:`).
fn pane_target(name: &str) -> String {
    format!("={name}:")
}
