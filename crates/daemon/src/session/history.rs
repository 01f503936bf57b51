//! Scrollback replay for newly attached viewers.
//!
//! Before a viewer joins live fan-out it receives a bounded window of the
//! session's recent scrollback followed by a single `history-complete`
//! marker. Capture is best effort: each [`CaptureMode`] is tried in order
//! under its own timeout and the first success wins. If every mode fails the
//! viewer gets an empty backlog, but still gets the marker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use muxcast_protocol::EngineControl;
use thiserror::Error;
use tokio::sync::mpsc;

use super::backend::{CaptureMode, SessionBackend};
use super::multiplexer::OutboundFrame;

/// Why a replay could not be delivered to a viewer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    /// The viewer did not accept a frame within the write timeout.
    #[error("viewer did not accept history within {0:?}")]
    Timeout(Duration),

    /// The viewer went away during replay.
    #[error("viewer closed during history replay")]
    Closed,
}

/// Captures scrollback and sends it to viewers.
#[derive(Clone)]
pub struct HistoryReplay {
    backend: Arc<dyn SessionBackend>,
    enabled: bool,
    lines: usize,
    capture_timeout: Duration,
}

impl HistoryReplay {
    /// Creates a replay service capturing up to `lines` lines per attempt.
    pub fn new(backend: Arc<dyn SessionBackend>, lines: usize, capture_timeout: Duration) -> Self {
        Self {
            backend,
            enabled: true,
            lines,
            capture_timeout,
        }
    }

    /// Enables or disables capture. A disabled service only sends the marker.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether capture is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Captures the session's scrollback, trying each mode in fallback order.
    ///
    /// Returns `None` when every mode failed.
    pub async fn capture(&self, session: &str) -> Option<String> {
        for mode in CaptureMode::FALLBACK_ORDER {
            let attempt = tokio::time::timeout(
                self.capture_timeout,
                self.backend.capture(session, mode, self.lines),
            )
            .await;

            match attempt {
                Ok(Ok(text)) => {
                    tracing::debug!(
                        session = %session,
                        mode = mode.as_str(),
                        bytes = text.len(),
                        "Captured scrollback"
                    );
                    return Some(text);
                }
                Ok(Err(e)) => {
                    tracing::debug!(
                        session = %session,
                        mode = mode.as_str(),
                        error = %e,
                        "Scrollback capture failed, falling back"
                    );
                }
                Err(_) => {
                    tracing::debug!(
                        session = %session,
                        mode = mode.as_str(),
                        timeout = ?self.capture_timeout,
                        "Scrollback capture timed out, falling back"
                    );
                }
            }
        }

        tracing::warn!(session = %session, "All scrollback capture modes failed, skipping replay");
        None
    }

    /// Sends the backlog and the `history-complete` marker to one viewer.
    ///
    /// Returns the number of backlog bytes sent.
    pub async fn replay(
        &self,
        session: &str,
        tx: &mpsc::Sender<OutboundFrame>,
        write_timeout: Duration,
    ) -> Result<usize, ReplayError> {
        let backlog = if self.enabled {
            self.capture(session).await.map(|text| format_backlog(&text))
        } else {
            None
        };

        let mut sent = 0;
        if let Some(backlog) = backlog.filter(|b| !b.is_empty()) {
            sent = backlog.len();
            send(tx, OutboundFrame::Output(Bytes::from(backlog)), write_timeout).await?;
        }

        send(
            tx,
            OutboundFrame::Control(EngineControl::HistoryComplete),
            write_timeout,
        )
        .await?;

        tracing::debug!(session = %session, bytes = sent, "History replay complete");
        Ok(sent)
    }
}

async fn send(
    tx: &mpsc::Sender<OutboundFrame>,
    frame: OutboundFrame,
    write_timeout: Duration,
) -> Result<(), ReplayError> {
    tx.send_timeout(frame, write_timeout)
        .await
        .map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(_) => ReplayError::Timeout(write_timeout),
            mpsc::error::SendTimeoutError::Closed(_) => ReplayError::Closed,
        })
}

/// Terminates every captured line with CRLF.
///
/// Trailing blank lines (the unused part of the pane) are dropped so the
/// viewer's cursor ends right after the last real line.
pub fn format_backlog(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let mut out = String::with_capacity(text.len() + lines.len());
    for line in lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}
