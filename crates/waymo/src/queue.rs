//! Bounded FIFO hand-off from caller threads to the dispatch thread.
//!
//! Any number of producers push without blocking; the dispatch thread is
//! the only consumer. Capacity is a hard ceiling: a push into a full queue
//! fails immediately with [`SubmitError::QueueFull`].

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::action::{Action, ActionOutcome};
use crate::error::SubmitError;

/// A queued action and, when the caller asked for one, its ticket.
#[derive(Debug)]
pub(crate) struct Command {
    pub(crate) action: Action,
    pub(crate) ticket: Option<Sender<ActionOutcome>>,
}

impl Command {
    pub(crate) const fn untracked(action: Action) -> Self {
        Self {
            action,
            ticket: None,
        }
    }

    pub(crate) fn tracked(action: Action) -> (Self, Completion) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            Self {
                action,
                ticket: Some(tx),
            },
            Completion(rx),
        )
    }

    /// Resolve the ticket, if any. A caller that stopped waiting is not an
    /// error.
    pub(crate) fn complete(self, outcome: ActionOutcome) {
        if let Some(ticket) = self.ticket {
            let _ = ticket.send(outcome);
        }
    }
}

/// Create a queue holding at most `capacity` commands.
///
/// `capacity` must be non-zero; a zero-capacity channel would turn every
/// push into a rendezvous with the consumer.
pub(crate) fn command_queue(capacity: usize) -> (CommandSender, CommandReceiver) {
    debug_assert!(capacity > 0);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (CommandSender(tx), CommandReceiver(rx))
}

/// Producer side; cheap to clone and safe to use from any thread.
#[derive(Debug, Clone)]
pub(crate) struct CommandSender(Sender<Command>);

impl CommandSender {
    /// Enqueue without blocking.
    pub(crate) fn push(&self, command: Command) -> Result<(), SubmitError> {
        self.0.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::QueueFull,
            TrySendError::Disconnected(_) => SubmitError::Closed,
        })
    }

    /// Number of queued commands.
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

/// Consumer side, owned by the dispatch thread.
#[derive(Debug)]
pub(crate) struct CommandReceiver(Receiver<Command>);

impl CommandReceiver {
    pub(crate) fn inner(&self) -> &Receiver<Command> {
        &self.0
    }

    /// Drop every queued command, resolving no tickets. Returns how many
    /// were discarded.
    pub(crate) fn discard(&self) -> usize {
        self.0.try_iter().count()
    }
}

/// Ticket for a tracked submission.
///
/// Resolves once the action has been dispatched. If the action is
/// discarded instead (loop destroyed or connection lost first), waiting
/// returns `None`.
#[derive(Debug)]
pub struct Completion(Receiver<ActionOutcome>);

impl Completion {
    /// Block until the action has been dispatched.
    #[must_use]
    pub fn wait(self) -> Option<ActionOutcome> {
        self.0.recv().ok()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the ticket back if `timeout` elapsed first.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<ActionOutcome>, Self> {
        match self.0.recv_timeout(timeout) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }

    /// The outcome if it is already available.
    #[must_use]
    pub fn try_outcome(&self) -> Option<ActionOutcome> {
        self.0.try_recv().ok()
    }
}
