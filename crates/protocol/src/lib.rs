//! # muxcast Protocol Library
//!
//! Frame definitions shared by the muxcast daemon and its viewers.
//!
//! ## Overview
//!
//! A viewer holds one WebSocket per session. Over it:
//!
//! - **Viewer → engine**: raw terminal input, or a JSON control object
//!   (`resize`, `set-logging`) that is intercepted and never typed into the
//!   terminal.
//! - **Engine → viewer**: raw terminal output, and one
//!   `{"type":"history-complete"}` marker separating replayed scrollback
//!   from live output.
//!
//! ## Example Usage
//!
//! ```rust
//! use muxcast_protocol::{classify, ViewerControl, ViewerFrame};
//!
//! let frame = classify(br#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
//! assert_eq!(
//!     frame,
//!     ViewerFrame::Control(ViewerControl::Resize { cols: 120, rows: 40 })
//! );
//!
//! let frame = classify(b"echo hi\r").unwrap();
//! assert_eq!(frame, ViewerFrame::Input(b"echo hi\r"));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Control frame definitions and payload classification
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    classify, EngineControl, ViewerControl, ViewerFrame, MAX_TERMINAL_DIMENSION,
    TYPE_HISTORY_COMPLETE, TYPE_RESIZE, TYPE_SET_LOGGING,
};
