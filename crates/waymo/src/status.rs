//! Loop status and its shared, lock-free cell.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of an event loop.
///
/// Everything except [`LoopStatus::Ok`] is terminal: the loop accepts no
/// further actions and only supports inspection and destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopStatus {
    /// Connected with keyboard and pointer; dispatching.
    Ok,
    /// No compositor connection could be established.
    InitFailed,
    /// The layout did not compile or the virtual keyboard was refused.
    KeyboardInitFailed,
    /// The virtual pointer was refused.
    PointerInitFailed,
    /// The compositor connection dropped while running.
    Disconnected,
}

impl LoopStatus {
    /// Integer code for FFI and process boundaries.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::InitFailed => 1 << 0,
            Self::KeyboardInitFailed => 1 << 1,
            Self::PointerInitFailed => 1 << 2,
            Self::Disconnected => 1 << 3,
        }
    }

    /// Whether actions may be submitted.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Map to a caller-visible error, keeping every failure distinct.
    ///
    /// # Errors
    ///
    /// Returns the [`InitError`] matching any status other than `Ok`.
    pub const fn into_result(self) -> Result<(), InitError> {
        match self {
            Self::Ok => Ok(()),
            Self::InitFailed => Err(InitError::Connection),
            Self::KeyboardInitFailed => Err(InitError::Keyboard),
            Self::PointerInitFailed => Err(InitError::Pointer),
            Self::Disconnected => Err(InitError::Disconnected),
        }
    }
}

impl TryFrom<u8> for LoopStatus {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Ok),
            1 => Ok(Self::InitFailed),
            2 => Ok(Self::KeyboardInitFailed),
            4 => Ok(Self::PointerInitFailed),
            8 => Ok(Self::Disconnected),
            other => Err(other),
        }
    }
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "OK",
            Self::InitFailed => "initialization failed",
            Self::KeyboardInitFailed => "keyboard initialization failed",
            Self::PointerInitFailed => "pointer initialization failed",
            Self::Disconnected => "compositor disconnected",
        };
        f.write_str(text)
    }
}

/// Why an event loop is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("could not connect to the compositor")]
    Connection,
    #[error("virtual keyboard unavailable or keyboard layout unknown")]
    Keyboard,
    #[error("virtual pointer unavailable")]
    Pointer,
    #[error("compositor connection lost")]
    Disconnected,
}

/// Status shared between the dispatch thread and callers.
///
/// Written by the dispatch thread only; read from anywhere without locking.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(status: LoopStatus) -> Self {
        Self(AtomicU8::new(status.code()))
    }

    pub(crate) fn get(&self) -> LoopStatus {
        LoopStatus::try_from(self.0.load(Ordering::Acquire)).unwrap_or(LoopStatus::InitFailed)
    }

    pub(crate) fn set(&self, status: LoopStatus) {
        self.0.store(status.code(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [LoopStatus; 5] = [
        LoopStatus::Ok,
        LoopStatus::InitFailed,
        LoopStatus::KeyboardInitFailed,
        LoopStatus::PointerInitFailed,
        LoopStatus::Disconnected,
    ];

    #[test]
    fn codes_round_trip() {
        for status in ALL {
            assert_eq!(LoopStatus::try_from(status.code()), Ok(status));
        }
        assert_eq!(LoopStatus::try_from(3), Err(3));
    }

    #[test]
    fn only_ok_maps_to_success() {
        assert!(LoopStatus::Ok.into_result().is_ok());
        assert_eq!(
            LoopStatus::KeyboardInitFailed.into_result(),
            Err(InitError::Keyboard)
        );
        assert_eq!(
            LoopStatus::PointerInitFailed.into_result(),
            Err(InitError::Pointer)
        );
        let failures: Vec<_> = ALL.iter().filter(|s| !s.is_ok()).collect();
        assert_eq!(failures.len(), 4);
    }

    #[test]
    fn cell_stores_latest() {
        let cell = StatusCell::new(LoopStatus::InitFailed);
        assert_eq!(cell.get(), LoopStatus::InitFailed);
        cell.set(LoopStatus::Ok);
        assert_eq!(cell.get(), LoopStatus::Ok);
        cell.set(LoopStatus::Disconnected);
        assert_eq!(cell.get(), LoopStatus::Disconnected);
    }
}
