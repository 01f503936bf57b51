//! Per-session output log.
//!
//! Raw output is appended to `<log_dir>/<session>.log`. Chunks that only
//! move the cursor or redraw a spinner/status line are kept out of the log;
//! they are still delivered to viewers.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// CSI, OSC and two-byte escape sequences.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[()][0-9A-Za-z]",
        r"|\x1b[@-Z\\-_=>78]",
    ))
    .expect("static regex")
});

/// Transient status lines emitted by interactive agents and progress bars.
///
/// Every alternative is anchored to the whole (trimmed) line. Agent status
/// lines must start with a spinner glyph, carry a short label and end with
/// the timer block, so ordinary output that merely mentions these phrases is
/// kept.
static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)^\(?\s*esc to interrupt\s*\)?$",
        r"|^[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏✻✽✶✳✢·◐◓◑◒●○*]\s*[^()]{0,48}\(\s*\d+(?:\.\d+)?s\s*·[^)]*\)$",
        r"|^[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏✻✽✶✳✢·◐◓◑◒●○*]\s*[^()]{0,48}\([^)]*esc to interrupt[^)]*\)$",
        r"|^\s*\d{1,3}(?:\.\d+)?\s*%\s*$",
        r"|^\s*\[\s*\d+\s*/\s*\d+\s*\]\s*$",
    ))
    .expect("static regex")
});

/// Glyphs used by spinners and progress indicators.
const SPINNER_GLYPHS: &[char] = &[
    '⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏', '✻', '✽', '✶', '✳', '✢', '·', '◐',
    '◓', '◑', '◒', '●', '○', '…', '█', '▉', '▊', '▋', '▌', '▍', '▎', '▏', '░', '▒', '▓',
];

/// ASCII spinner frames; only counted on very short lines.
const ASCII_SPINNER: &[char] = &['|', '/', '-', '\\', '*'];

/// Share of non-space characters that must be spinner glyphs.
const SPINNER_RATIO: f32 = 0.6;

/// Removes terminal escape sequences from `text`.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// Returns whether a chunk is cursor movement or status noise.
///
/// Best effort: a chunk is noise only if nothing visible remains after
/// stripping escapes, or every visible line is a recognised status line.
pub fn is_status_noise(chunk: &[u8]) -> bool {
    let text = String::from_utf8_lossy(chunk);
    let visible = strip_ansi(&text);

    let mut lines = visible
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .peekable();

    if lines.peek().is_none() {
        return true;
    }
    lines.all(is_status_line)
}

fn is_status_line(line: &str) -> bool {
    if STATUS_LINE.is_match(line) {
        return true;
    }

    let glyphs: Vec<char> = line.chars().filter(|c| !c.is_whitespace()).collect();
    if glyphs.is_empty() {
        return true;
    }
    if glyphs.len() <= 2 && glyphs.iter().all(|c| ASCII_SPINNER.contains(c)) {
        return true;
    }

    let spinner = glyphs.iter().filter(|c| SPINNER_GLYPHS.contains(c)).count();
    spinner as f32 / glyphs.len() as f32 >= SPINNER_RATIO
}

/// Append-only log file for one session.
///
/// The file is opened lazily on the first logged chunk. Write failures are
/// reported through `tracing` and never propagate to the caller.
pub struct LogSink {
    session: String,
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl LogSink {
    /// Creates a sink writing to `<dir>/<session>.log`.
    pub fn new(dir: &Path, session: &str) -> Self {
        Self {
            session: session.to_string(),
            path: dir.join(format!("{session}.log")),
            file: None,
            bytes_written: 0,
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Appends a chunk unless it is status noise.
    ///
    /// Returns whether the chunk was written.
    pub async fn record(&mut self, chunk: &[u8]) -> bool {
        if chunk.is_empty() || is_status_noise(chunk) {
            tracing::trace!(session = %self.session, bytes = chunk.len(), "Skipped noise chunk");
            return false;
        }

        match self.append(chunk).await {
            Ok(()) => {
                self.bytes_written += chunk.len() as u64;
                true
            }
            Err(e) => {
                tracing::warn!(
                    session = %self.session,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to write session log"
                );
                // Reopen on the next chunk.
                self.file = None;
                false
            }
        }
    }

    async fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            tracing::debug!(session = %self.session, path = %self.path.display(), "Opened session log");
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Flushes and closes the file.
    pub async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                tracing::warn!(session = %self.session, error = %e, "Failed to flush session log");
            }
            tracing::debug!(
                session = %self.session,
                bytes = self.bytes_written,
                "Closed session log"
            );
        }
    }
}
