//! Synthetic keyboard and pointer input for Wayland compositors.
//!
//! An [`EventLoop`] owns one compositor connection and a dispatch thread.
//! Callers submit [`Action`]s from any thread; they are executed in order,
//! spaced by a configurable cooldown, through a virtual keyboard and
//! pointer.
//!
//! ```no_run
//! use std::time::Duration;
//! use waymo::{Action, EventLoop, LoopConfig, MouseButton};
//!
//! let (event_loop, status) = EventLoop::create(LoopConfig::default());
//! status.into_result()?;
//! event_loop.submit(Action::move_to(200, 100))?;
//! event_loop.submit(Action::click(MouseButton::Left, 1, Duration::from_millis(20)))?;
//! event_loop.submit_and_wait(Action::type_text("hello"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod action;
pub mod config;
mod cooldown;
mod dispatch;
pub mod error;
pub mod event_loop;
mod queue;
pub mod status;

#[cfg(test)]
mod testing;

pub use action::{Action, ActionOutcome};
pub use config::{ConfigError, LoopConfig};
pub use error::SubmitError;
pub use event_loop::{EventLoop, Submitter};
pub use queue::Completion;
pub use status::{InitError, LoopStatus};
pub use waymo_input::MouseButton;
