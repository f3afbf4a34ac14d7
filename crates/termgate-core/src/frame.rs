//! Client frame classification.
//!
//! The client channel carries two things on the same message stream: resize
//! control frames (`{"type":"resize","cols":N,"rows":N}`) and raw terminal
//! input. A message is a control frame only when it parses as a JSON object
//! with `type == "resize"` and numeric `cols` and `rows`; every other message,
//! JSON or not, is passed through to the shell untouched.
//!
//! Input that happens to match the resize shape is consumed as control. That
//! is part of the wire protocol and is kept as is.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    /// Geometry requested when the shell is first opened.
    pub const DEFAULT: TermSize = TermSize { cols: 80, rows: 24 };

    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for TermSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// A classified inbound client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Geometry change for the remote PTY.
    Resize(TermSize),
    /// Literal terminal input, byte for byte as received.
    Input(Vec<u8>),
}

impl ClientFrame {
    /// Classify one inbound message.
    pub fn classify(message: Vec<u8>) -> Self {
        match parse_resize(&message) {
            Some(size) => ClientFrame::Resize(size),
            None => ClientFrame::Input(message),
        }
    }
}

/// Audit text for a geometry change.
pub fn resize_description(size: TermSize) -> String {
    format!("Terminal resized to {size}")
}

fn parse_resize(message: &[u8]) -> Option<TermSize> {
    let value: Value = serde_json::from_slice(message).ok()?;
    let object = value.as_object()?;
    if object.get("type").and_then(Value::as_str) != Some("resize") {
        return None;
    }
    let cols = object.get("cols").and_then(Value::as_f64)?;
    let rows = object.get("rows").and_then(Value::as_f64)?;
    Some(TermSize {
        cols: saturate_u16(cols),
        rows: saturate_u16(rows),
    })
}

/// `as` saturates float-to-int casts (NaN maps to 0).
fn saturate_u16(n: f64) -> u16 {
    n as u16
}
