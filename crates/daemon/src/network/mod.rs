//! Viewer transport.
//!
//! Viewers reach the engine over WebSocket:
//! - [`websocket`]: listener and upgrade-time session resolution
//! - [`connection`]: per-viewer reader/writer pump
//! - [`resolver`]: maps request paths to session names and cwd hints

pub mod connection;
pub mod resolver;
pub mod websocket;

pub use connection::{handle_payload, serve_viewer, ConnectionContext};
pub use resolver::{PathResolver, ResolveError, SessionResolver, SessionTarget, CWD_PARAM};
pub use websocket::WebSocketListener;
