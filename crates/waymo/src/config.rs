use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default queue capacity.
pub const DEFAULT_MAX_COMMANDS: usize = 50;
/// Default keyboard layout.
pub const DEFAULT_KEYBOARD_LAYOUT: &str = "us";
/// Default gap between dispatched actions, in milliseconds.
pub const DEFAULT_ACTION_COOLDOWN_MS: u64 = 1;

/// Event loop construction parameters.
///
/// Consumed by [`EventLoop::create`](crate::EventLoop::create) and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Capacity of the command queue. Submissions beyond it fail with
    /// [`SubmitError::QueueFull`](crate::SubmitError::QueueFull).
    pub max_commands: usize,

    /// XKB layout identifier (`"us"`, `"de"`, ...). Empty selects the XKB
    /// default layout (`XKB_DEFAULT_LAYOUT` or the libxkbcommon built-in),
    /// not whatever layout the compositor is currently using.
    pub keyboard_layout: String,

    /// Minimum gap between two dispatched actions, in milliseconds.
    pub action_cooldown_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_commands: DEFAULT_MAX_COMMANDS,
            keyboard_layout: DEFAULT_KEYBOARD_LAYOUT.to_string(),
            action_cooldown_ms: DEFAULT_ACTION_COOLDOWN_MS,
        }
    }
}

impl LoopConfig {
    /// Set the queue capacity.
    #[must_use]
    pub fn with_max_commands(mut self, max_commands: usize) -> Self {
        self.max_commands = max_commands;
        self
    }

    /// Set the keyboard layout identifier.
    #[must_use]
    pub fn with_keyboard_layout(mut self, layout: impl Into<String>) -> Self {
        self.keyboard_layout = layout.into();
        self
    }

    /// Set the inter-action cooldown in milliseconds.
    #[must_use]
    pub fn with_action_cooldown_ms(mut self, ms: u64) -> Self {
        self.action_cooldown_ms = ms;
        self
    }

    /// The cooldown as a [`Duration`].
    #[must_use]
    pub fn action_cooldown(&self) -> Duration {
        Duration::from_millis(self.action_cooldown_ms)
    }

    /// Check the invariants the event loop relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroCapacity`] if `max_commands` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_commands == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// Invalid [`LoopConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_commands must be greater than zero")]
    ZeroCapacity,
}
