//! Frame definitions for the viewer connection.
//!
//! Viewers speak a deliberately thin protocol: everything they send is
//! terminal input, except for a small set of JSON control objects that are
//! intercepted by the engine. The engine sends raw output bytes plus a single
//! JSON marker after history replay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// `type` value of the resize control frame.
pub const TYPE_RESIZE: &str = "resize";

/// `type` value of the logging toggle control frame.
pub const TYPE_SET_LOGGING: &str = "set-logging";

/// `type` value of the end-of-replay marker.
pub const TYPE_HISTORY_COMPLETE: &str = "history-complete";

/// Largest accepted terminal dimension (matches tmux's own limit).
pub const MAX_TERMINAL_DIMENSION: u16 = 10_000;

/// Control frames a viewer may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ViewerControl {
    /// Resize the terminal geometry of the attached process.
    Resize {
        /// Terminal width in columns.
        cols: u16,
        /// Terminal height in rows.
        rows: u16,
    },
    /// Enable or disable the session's output log.
    SetLogging {
        /// Whether logging should be enabled.
        enabled: bool,
    },
}

/// Control frames the engine sends to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineControl {
    /// Sent exactly once per viewer, after the backlog and before live output.
    HistoryComplete,
}

impl EngineControl {
    /// Serializes the frame to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A classified viewer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerFrame<'a> {
    /// Bytes to forward verbatim to the process.
    Input(&'a [u8]),
    /// An intercepted control frame.
    Control(ViewerControl),
}

/// Classifies a payload received from a viewer.
///
/// Only JSON objects whose `type` names a known control frame are
/// intercepted. Everything else, including JSON with an unknown `type`, is
/// input and is returned untouched. A known control type with invalid fields
/// is an error: it must be dropped, never typed into the terminal.
pub fn classify(payload: &[u8]) -> Result<ViewerFrame<'_>> {
    let trimmed = payload.trim_ascii();
    if !trimmed.starts_with(b"{") || !trimmed.ends_with(b"}") {
        return Ok(ViewerFrame::Input(payload));
    }

    let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(trimmed) else {
        return Ok(ViewerFrame::Input(payload));
    };

    match object.get("type").and_then(Value::as_str) {
        Some(TYPE_RESIZE) => {
            let cols = dimension(object.get("cols"), "cols")?;
            let rows = dimension(object.get("rows"), "rows")?;
            let max = u64::from(MAX_TERMINAL_DIMENSION);
            if cols == 0 || rows == 0 || cols > max || rows > max {
                return Err(ProtocolError::InvalidSize { cols, rows });
            }
            Ok(ViewerFrame::Control(ViewerControl::Resize {
                cols: cols as u16,
                rows: rows as u16,
            }))
        }
        Some(TYPE_SET_LOGGING) => {
            let enabled = object
                .get("enabled")
                .and_then(Value::as_bool)
                .ok_or_else(|| ProtocolError::InvalidControl {
                    kind: TYPE_SET_LOGGING,
                    reason: "enabled must be a boolean".to_string(),
                })?;
            Ok(ViewerFrame::Control(ViewerControl::SetLogging { enabled }))
        }
        _ => Ok(ViewerFrame::Input(payload)),
    }
}

fn dimension(value: Option<&Value>, field: &str) -> Result<u64> {
    value
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::InvalidControl {
            kind: TYPE_RESIZE,
            reason: format!("{field} must be a non-negative integer"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes_are_input() {
        let payload = b"ls -la\r";
        assert_eq!(classify(payload).unwrap(), ViewerFrame::Input(payload));
    }

    #[test]
    fn test_binary_input_is_untouched() {
        let payload = [0x1b, b'[', b'A', 0x00, 0xff];
        assert_eq!(classify(&payload).unwrap(), ViewerFrame::Input(&payload));
    }

    #[test]
    fn test_resize_frame() {
        let frame = classify(br#"{"type":"resize","cols":100,"rows":40}"#).unwrap();
        assert_eq!(
            frame,
            ViewerFrame::Control(ViewerControl::Resize {
                cols: 100,
                rows: 40
            })
        );
    }

    #[test]
    fn test_resize_frame_with_whitespace() {
        let frame = classify(b"  {\"rows\": 24, \"type\": \"resize\", \"cols\": 80}\n").unwrap();
        assert_eq!(
            frame,
            ViewerFrame::Control(ViewerControl::Resize { cols: 80, rows: 24 })
        );
    }

    #[test]
    fn test_set_logging_frame() {
        let frame = classify(br#"{"type":"set-logging","enabled":false}"#).unwrap();
        assert_eq!(
            frame,
            ViewerFrame::Control(ViewerControl::SetLogging { enabled: false })
        );
    }

    #[test]
    fn test_unknown_type_is_input() {
        let payload = br#"{"type":"paste","text":"hi"}"#;
        assert_eq!(classify(payload).unwrap(), ViewerFrame::Input(payload));
    }

    #[test]
    fn test_json_without_type_is_input() {
        let payload = br#"{"cols":100,"rows":40}"#;
        assert_eq!(classify(payload).unwrap(), ViewerFrame::Input(payload));
    }

    #[test]
    fn test_non_object_json_is_input() {
        let payload = b"[1,2,3]";
        assert_eq!(classify(payload).unwrap(), ViewerFrame::Input(payload));
    }

    #[test]
    fn test_truncated_json_is_input() {
        let payload = br#"{"type":"resize","cols":100"#;
        assert_eq!(classify(payload).unwrap(), ViewerFrame::Input(payload));
    }

    #[test]
    fn test_resize_missing_rows_is_rejected() {
        let err = classify(br#"{"type":"resize","cols":100}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidControl { kind: "resize", .. }));
    }

    #[test]
    fn test_resize_zero_is_rejected() {
        let err = classify(br#"{"type":"resize","cols":0,"rows":40}"#).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidSize { cols: 0, rows: 40 });
    }

    #[test]
    fn test_resize_too_large_is_rejected() {
        let err = classify(br#"{"type":"resize","cols":70000,"rows":40}"#).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidSize {
                cols: 70000,
                rows: 40
            }
        );
    }

    #[test]
    fn test_resize_negative_is_rejected() {
        let err = classify(br#"{"type":"resize","cols":-1,"rows":40}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidControl { .. }));
    }

    #[test]
    fn test_set_logging_non_bool_is_rejected() {
        let err = classify(br#"{"type":"set-logging","enabled":"yes"}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidControl {
                kind: "set-logging",
                ..
            }
        ));
    }

    #[test]
    fn test_history_complete_json() {
        assert_eq!(
            EngineControl::HistoryComplete.to_json().unwrap(),
            r#"{"type":"history-complete"}"#
        );
    }

    #[test]
    fn test_viewer_control_serializes_with_type_tag() {
        let json = serde_json::to_string(&ViewerControl::Resize { cols: 1, rows: 2 }).unwrap();
        assert_eq!(json, r#"{"type":"resize","cols":1,"rows":2}"#);
        let json = serde_json::to_string(&ViewerControl::SetLogging { enabled: true }).unwrap();
        assert_eq!(json, r#"{"type":"set-logging","enabled":true}"#);
    }
}
