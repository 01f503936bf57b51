//! WebSocket listener for viewers.
//!
//! Viewers connect to `<prefix>/<session>`. The session is resolved during
//! the HTTP upgrade so unknown paths and invalid names are refused with a
//! plain HTTP error instead of an accepted-then-closed socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use super::connection::{serve_viewer, ConnectionContext};
use super::resolver::{ResolveError, SessionResolver, SessionTarget};

/// How long open connections get to wind down after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts viewer connections and hands them to the registry.
pub struct WebSocketListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    resolver: Arc<dyn SessionResolver>,
    ctx: ConnectionContext,
}

impl WebSocketListener {
    /// Binds the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        resolver: Arc<dyn SessionResolver>,
        ctx: ConnectionContext,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "WebSocket listener started");

        Ok(Self {
            listener,
            local_addr,
            resolver,
            ctx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the context's shutdown token is cancelled,
    /// then waits briefly for open connections to finish.
    pub async fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let resolver = Arc::clone(&self.resolver);
                        let ctx = self.ctx.clone();
                        connections.spawn(handle_connection(stream, peer, resolver, ctx));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "TCP accept failed");
                    }
                },
                // Reap finished connections so the set does not grow.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!(open = connections.len(), "WebSocket listener stopped");

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(open = connections.len(), "Aborting connections still open");
            connections.abort_all();
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    resolver: Arc<dyn SessionResolver>,
    ctx: ConnectionContext,
) {
    let mut target: Option<SessionTarget> = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let uri = request.uri();
        match resolver.resolve(uri.path(), uri.query()) {
            Ok(resolved) => {
                target = Some(resolved);
                Ok(response)
            }
            Err(e) => {
                tracing::debug!(peer = %peer, path = %uri.path(), error = %e, "Refused upgrade");
                Err(reject(&e))
            }
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let Some(target) = target else {
        return;
    };

    tracing::debug!(peer = %peer, session = %target.name, "WebSocket connection accepted");
    serve_viewer(ws, target, ctx).await;
}

/// HTTP response for an unresolvable upgrade request.
fn reject(error: &ResolveError) -> ErrorResponse {
    let status = match error {
        ResolveError::NotFound(_) => StatusCode::NOT_FOUND,
        ResolveError::InvalidName(_) => StatusCode::BAD_REQUEST,
    };
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = status;
    response
}
