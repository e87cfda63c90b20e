//! The seam between the dispatch engine and a compositor connection.
//!
//! A [`Connector`] is handed to the dispatch thread and opened there; the
//! resulting [`ProtocolSink`] never leaves that thread.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::keymap::{Keymap, Modifiers};

/// Linux input event codes for mouse buttons.
pub(crate) const BTN_LEFT: u32 = 0x110;
pub(crate) const BTN_RIGHT: u32 = 0x111;
pub(crate) const BTN_MIDDLE: u32 = 0x112;

/// Delay between characters of a typed string when the caller gives none.
pub const DEFAULT_TYPE_INTERVAL: Duration = Duration::from_millis(15);

/// Mouse buttons that can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    /// Convert to the Linux evdev button code.
    #[must_use]
    pub const fn to_linux_code(self) -> u32 {
        match self {
            Self::Left => BTN_LEFT,
            Self::Right => BTN_RIGHT,
            Self::Middle => BTN_MIDDLE,
        }
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Middle => "middle",
        };
        f.write_str(name)
    }
}

/// A mouse button name that is not `left`, `right` or `middle`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mouse button: {0} (expected left, right or middle)")]
pub struct ParseButtonError(pub String);

impl FromStr for MouseButton {
    type Err = ParseButtonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(Self::Left),
            "right" | "r" => Ok(Self::Right),
            "middle" | "mid" | "m" => Ok(Self::Middle),
            _ => Err(ParseButtonError(s.to_string())),
        }
    }
}

/// Errors reported by a compositor connection.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The compositor connection is gone. Terminal for the owning loop.
    #[error("compositor connection lost: {0}")]
    Disconnected(String),

    /// The compositor does not offer what the request needs.
    #[error("capability not available: {0}")]
    Unsupported(&'static str),

    /// The request could not be expressed on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local I/O failed while preparing a request (e.g. keymap upload).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Whether the connection is unusable after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

/// Emits synthetic pointer and keyboard events into a compositor.
///
/// Keycodes passed to [`emit_key`](Self::emit_key) are XKB keycodes as
/// produced by [`Keymap::lookup`]; implementations convert them to whatever
/// their protocol expects.
pub trait ProtocolSink {
    /// Create the virtual keyboard and make `keymap` its active layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the compositor has no keyboard capability or the
    /// keymap cannot be installed.
    fn attach_keyboard(&mut self, keymap: &Keymap) -> Result<(), SinkError>;

    /// Create the virtual pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if the compositor has no pointer capability.
    fn attach_pointer(&mut self) -> Result<(), SinkError>;

    /// Move the pointer. `relative` treats `(x, y)` as a delta.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Disconnected`] when the connection drops.
    fn emit_motion(&mut self, x: i32, y: i32, relative: bool) -> Result<(), SinkError>;

    /// Press or release a mouse button.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Disconnected`] when the connection drops.
    fn emit_button(&mut self, button: MouseButton, down: bool) -> Result<(), SinkError>;

    /// Press or release a key with `modifiers` held for the transition.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Disconnected`] when the connection drops.
    fn emit_key(&mut self, keycode: u32, modifiers: Modifiers, down: bool)
        -> Result<(), SinkError>;

    /// Handle incoming compositor traffic without blocking.
    ///
    /// Called after every dispatched action and while idle so that pings are
    /// answered and a dropped connection is noticed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Disconnected`] when the connection drops.
    fn service(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Delay between typed characters when the caller did not pick one.
    fn default_type_interval(&self) -> Duration {
        DEFAULT_TYPE_INTERVAL
    }
}

/// Opens a [`ProtocolSink`] on the thread that will own it.
pub trait Connector: Send + 'static {
    /// The sink produced by this connector.
    type Sink: ProtocolSink;

    /// Connect to the compositor.
    ///
    /// # Errors
    ///
    /// Returns an error if no compositor connection can be established.
    fn connect(self) -> Result<Self::Sink, SinkError>;
}
