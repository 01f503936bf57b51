//! Per-viewer connection pump.
//!
//! A viewer connection is split in two halves. The writer task drains the
//! viewer's outbound queue into the socket; the reader loop classifies
//! incoming messages and routes input and control frames to the session.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use muxcast_protocol::{classify, ViewerControl, ViewerFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::resolver::SessionTarget;
use crate::session::{OutboundFrame, SessionRegistry, SessionState, ViewerHandle, ViewerOutlet};

/// Close reasons are limited to 123 bytes by RFC 6455.
const MAX_CLOSE_REASON: usize = 123;

/// How long the final Close frame may take to send.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state every connection needs.
#[derive(Clone)]
pub struct ConnectionContext {
    /// The session registry.
    pub registry: Arc<SessionRegistry>,
    /// Bound on each socket write.
    pub write_timeout: Duration,
    /// Cancelled when the daemon stops accepting viewers.
    pub shutdown: CancellationToken,
}

/// Runs one viewer connection to completion.
pub async fn serve_viewer<S>(ws: WebSocketStream<S>, target: SessionTarget, ctx: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, stream) = ws.split();

    if ctx.shutdown.is_cancelled() {
        send_close(&mut sink, CloseCode::Away, "daemon shutting down").await;
        return;
    }

    let (handle, outlet) = ViewerHandle::new();
    let viewer_id = handle.id().clone();
    let close = outlet.close_token();

    let state = match ctx.registry.attach(&target.name, target.cwd, handle).await {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(session = %target.name, error = %e, "Rejected viewer");
            send_close(&mut sink, CloseCode::Error, &e.to_string()).await;
            return;
        }
    };

    tracing::info!(session = %target.name, viewer_id = %viewer_id, "Viewer connected");

    let writer = tokio::spawn(write_frames(sink, outlet, ctx.write_timeout));

    {
        let registry = Arc::clone(&ctx.registry);
        let state = Arc::clone(&state);
        let viewer_id = viewer_id.clone();
        tokio::spawn(async move {
            // Failures are logged and the viewer detached by the broker.
            let _ = registry.replay_history(&state, &viewer_id).await;
        });
    }

    read_frames(stream, &state, &viewer_id, &close).await;

    ctx.registry.detach(&target.name, &viewer_id);
    close.cancel();
    if let Err(e) = writer.await {
        tracing::debug!(viewer_id = %viewer_id, error = %e, "Writer task failed");
    }

    tracing::info!(session = %target.name, viewer_id = %viewer_id, "Viewer disconnected");
}

/// Routes viewer messages until the socket closes or the engine drops the
/// viewer.
async fn read_frames<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    state: &SessionState,
    viewer_id: &str,
    close: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = close.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(data))) => handle_payload(state, viewer_id, &data).await,
            Some(Ok(Message::Text(text))) => handle_payload(state, viewer_id, text.as_bytes()).await,
            Some(Ok(Message::Close(_))) | None => break,
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(viewer_id = %viewer_id, error = %e, "Viewer socket error");
                break;
            }
        }
    }
}

/// Applies one viewer payload to the session.
pub async fn handle_payload(state: &SessionState, viewer_id: &str, payload: &[u8]) {
    match classify(payload) {
        Ok(ViewerFrame::Input(data)) => {
            if let Err(e) = state.write_input(viewer_id, data).await {
                tracing::warn!(session = %state.name(), viewer_id = %viewer_id, error = %e, "Failed to forward input");
            }
        }
        Ok(ViewerFrame::Control(ViewerControl::Resize { cols, rows })) => {
            if let Err(e) = state.resize(viewer_id, cols, rows).await {
                tracing::warn!(session = %state.name(), viewer_id = %viewer_id, error = %e, "Failed to resize");
            }
        }
        Ok(ViewerFrame::Control(ViewerControl::SetLogging { enabled })) => {
            state.set_logging(enabled);
        }
        Err(e) => {
            tracing::warn!(
                session = %state.name(),
                viewer_id = %viewer_id,
                error = %e,
                "Dropped invalid control frame"
            );
        }
    }
}

/// Drains the viewer queue into the socket, then closes it normally.
async fn write_frames<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outlet: ViewerOutlet,
    write_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let close = outlet.close_token();

    loop {
        let frame = tokio::select! {
            biased;
            frame = outlet.recv() => frame,
            _ = close.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };

        let message = match frame {
            OutboundFrame::Output(bytes) => Message::Binary(bytes.to_vec()),
            OutboundFrame::Control(control) => match control.to_json() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize control frame");
                    continue;
                }
            },
        };

        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(viewer_id = %outlet.id(), error = %e, "Viewer write failed");
                close.cancel();
                return;
            }
            Err(_) => {
                tracing::warn!(viewer_id = %outlet.id(), timeout = ?write_timeout, "Viewer write timed out");
                close.cancel();
                return;
            }
        }
    }

    send_close(&mut sink, CloseCode::Normal, "session closed").await;
}

async fn send_close<S>(sink: &mut SplitSink<WebSocketStream<S>, Message>, code: CloseCode, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(truncate_reason(reason).to_string()),
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "Failed to send close frame"),
        Err(_) => tracing::debug!("Timed out sending close frame"),
    }
}

/// Cuts `reason` to the close-frame limit on a character boundary.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::session::{RegistryConfig, SessionBackend};
    use crate::testing::ScriptedBackend;

    #[test]
    fn test_truncate_reason() {
        assert_eq!(truncate_reason("short"), "short");

        let long = "x".repeat(200);
        assert_eq!(truncate_reason(&long).len(), MAX_CLOSE_REASON);

        let wide = "é".repeat(100);
        let cut = truncate_reason(&wide);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn test_handle_payload_routes_frames() {
        let logs = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::with_sessions(["s"]));
        let registry = SessionRegistry::new(
            Arc::clone(&backend) as Arc<dyn SessionBackend>,
            RegistryConfig {
                log_dir: logs.path().to_path_buf(),
                ..RegistryConfig::default()
            },
            events::channel(),
        );

        let (viewer, _outlet) = ViewerHandle::new();
        let viewer_id = viewer.id().clone();
        let state = registry.attach("s", None, viewer).await.unwrap();
        let process = backend.process("s").unwrap();

        handle_payload(&state, &viewer_id, b"echo hi\r").await;
        handle_payload(&state, &viewer_id, br#"{"type":"resize","cols":100,"rows":40}"#).await;
        handle_payload(&state, &viewer_id, br#"{"type":"set-logging","enabled":false}"#).await;
        handle_payload(&state, &viewer_id, br#"{"type":"resize","cols":0,"rows":40}"#).await;
        handle_payload(&state, &viewer_id, br#"{"type":"unknown"}"#).await;

        let mut expected = b"echo hi\r".to_vec();
        expected.extend_from_slice(br#"{"type":"unknown"}"#);
        assert_eq!(process.input(), expected);
        assert_eq!(process.size(), (100, 40));
        assert_eq!(process.resizes(), vec![(100, 40)]);
        assert!(!state.logging_enabled());
    }
}
