use crate::status::LoopStatus;

/// Why an action was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The command queue is at `max_commands`. Retry or drop.
    #[error("command queue is full")]
    QueueFull,

    /// The loop never started or has stopped dispatching.
    #[error("event loop is not running: {0}")]
    Inactive(LoopStatus),

    /// The loop has been destroyed.
    #[error("event loop has been destroyed")]
    Closed,
}
