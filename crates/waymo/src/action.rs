//! Caller-issued input operations and their results.

use std::time::Duration;

use waymo_input::MouseButton;

/// A single input operation with its own timing parameters.
///
/// Actions are plain values; the event loop consumes them on dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Move the pointer. `relative` treats `(x, y)` as a delta.
    MoveMouse { x: i32, y: i32, relative: bool },

    /// Press and release `button` `clicks` times, holding each press for
    /// `hold`.
    ClickMouse {
        button: MouseButton,
        clicks: u32,
        hold: Duration,
    },

    /// A single button transition. The caller owns the matching release.
    PressMouse { button: MouseButton, down: bool },

    /// A single key transition, optionally delayed by `interval`.
    PressKey {
        key: char,
        interval: Option<Duration>,
        down: bool,
    },

    /// Press `key`, hold it for `hold`, release it.
    HoldKey {
        key: char,
        interval: Option<Duration>,
        hold: Duration,
    },

    /// Type `text` one character at a time, `interval` apart.
    TypeText {
        text: String,
        interval: Option<Duration>,
    },
}

impl Action {
    /// Absolute pointer motion.
    #[must_use]
    pub const fn move_to(x: i32, y: i32) -> Self {
        Self::MoveMouse {
            x,
            y,
            relative: false,
        }
    }

    /// Relative pointer motion.
    #[must_use]
    pub const fn move_by(dx: i32, dy: i32) -> Self {
        Self::MoveMouse {
            x: dx,
            y: dy,
            relative: true,
        }
    }

    /// `clicks` clicks of `button`, each held for `hold`.
    #[must_use]
    pub const fn click(button: MouseButton, clicks: u32, hold: Duration) -> Self {
        Self::ClickMouse {
            button,
            clicks,
            hold,
        }
    }

    /// Press (`down = true`) or release a mouse button.
    #[must_use]
    pub const fn press_mouse(button: MouseButton, down: bool) -> Self {
        Self::PressMouse { button, down }
    }

    /// Press (`down = true`) or release a key.
    #[must_use]
    pub const fn press_key(key: char, down: bool) -> Self {
        Self::PressKey {
            key,
            interval: None,
            down,
        }
    }

    /// Hold `key` for `hold`.
    #[must_use]
    pub const fn hold_key(key: char, hold: Duration) -> Self {
        Self::HoldKey {
            key,
            interval: None,
            hold,
        }
    }

    /// Type `text` at the sink's default pace.
    #[must_use]
    pub fn type_text(text: impl Into<String>) -> Self {
        Self::TypeText {
            text: text.into(),
            interval: None,
        }
    }

    /// Set the per-action interval of a key-bearing action.
    ///
    /// Has no effect on pointer actions.
    #[must_use]
    pub fn with_interval(mut self, value: Duration) -> Self {
        match &mut self {
            Self::PressKey { interval, .. }
            | Self::HoldKey { interval, .. }
            | Self::TypeText { interval, .. } => *interval = Some(value),
            Self::MoveMouse { .. } | Self::ClickMouse { .. } | Self::PressMouse { .. } => {}
        }
        self
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MoveMouse { .. } => "move_mouse",
            Self::ClickMouse { .. } => "click_mouse",
            Self::PressMouse { .. } => "press_mouse",
            Self::PressKey { .. } => "press_key",
            Self::HoldKey { .. } => "hold_key",
            Self::TypeText { .. } => "type_text",
        }
    }
}

/// What happened to a dispatched action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Every event was emitted.
    Completed,
    /// Some characters had no key in the active layout and were skipped.
    Partial { unresolved: Vec<char> },
    /// Nothing was emitted; the action could not be expressed.
    Skipped { reason: String },
    /// The compositor connection dropped while dispatching.
    Failed { reason: String },
}

impl ActionOutcome {
    /// Whether every event of the action was emitted.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}
