//! The event loop: one dispatch thread per compositor connection.
//!
//! [`EventLoop::create`] spawns the dispatch thread, which opens the
//! connection, compiles the layout and attaches the virtual devices before
//! reporting back. Callers then submit [`Action`]s from any thread; the
//! dispatch thread executes them one at a time, in submission order, spaced
//! by the configured cooldown.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use waymo_input::{Connector, KeymapCompiler, ProtocolSink, WaylandConnector, XkbCompiler};

use crate::action::{Action, ActionOutcome};
use crate::config::LoopConfig;
use crate::dispatch::Dispatcher;
use crate::error::SubmitError;
use crate::queue::{command_queue, Command, CommandReceiver, CommandSender, Completion};
use crate::status::{LoopStatus, StatusCell};

/// How long the dispatch thread sleeps between servicing the connection
/// when no actions arrive.
const IDLE_SERVICE_INTERVAL: Duration = Duration::from_millis(100);

/// Handle for submitting actions to a running loop.
///
/// Cheap to clone; clones share the queue and status of their loop.
#[derive(Debug, Clone)]
pub struct Submitter {
    queue: CommandSender,
    status: Arc<StatusCell>,
}

impl Submitter {
    /// Current loop status.
    #[must_use]
    pub fn status(&self) -> LoopStatus {
        self.status.get()
    }

    /// Number of actions waiting to be dispatched.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn push(&self, command: Command) -> Result<(), SubmitError> {
        let status = self.status();
        if !status.is_ok() {
            return Err(SubmitError::Inactive(status));
        }
        self.queue.push(command)
    }

    /// Enqueue `action` without waiting for it.
    ///
    /// # Errors
    ///
    /// [`SubmitError::QueueFull`] if `max_commands` actions are already
    /// pending, [`SubmitError::Inactive`] if the loop is not running and
    /// [`SubmitError::Closed`] after destruction.
    pub fn submit(&self, action: Action) -> Result<(), SubmitError> {
        self.push(Command::untracked(action))
    }

    /// Enqueue `action` and get a ticket that resolves on dispatch.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    pub fn submit_tracked(&self, action: Action) -> Result<Completion, SubmitError> {
        let (command, completion) = Command::tracked(action);
        self.push(command)?;
        Ok(completion)
    }

    /// Enqueue `action` and block until it has been dispatched.
    ///
    /// Returns `None` if the action was discarded before dispatch.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    pub fn submit_and_wait(&self, action: Action) -> Result<Option<ActionOutcome>, SubmitError> {
        Ok(self.submit_tracked(action)?.wait())
    }
}

/// A synthetic input session with a compositor.
///
/// Dropping the loop destroys it.
#[derive(Debug)]
pub struct EventLoop {
    submitter: Submitter,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Start a loop against the compositor named by `WAYLAND_DISPLAY`,
    /// resolving characters with the system XKB data.
    ///
    /// Always returns a loop; check the status before submitting. A loop
    /// whose status is not [`LoopStatus::Ok`] rejects every submission.
    #[must_use]
    pub fn create(config: LoopConfig) -> (Self, LoopStatus) {
        Self::create_with(config, WaylandConnector, XkbCompiler::default())
    }

    /// Start a loop over an arbitrary backend.
    ///
    /// Blocks until the dispatch thread has finished initialization.
    #[must_use]
    pub fn create_with<C, K>(config: LoopConfig, connector: C, compiler: K) -> (Self, LoopStatus)
    where
        C: Connector,
        K: KeymapCompiler,
    {
        let status = Arc::new(StatusCell::new(LoopStatus::InitFailed));

        if let Err(e) = config.validate() {
            tracing::error!("Invalid event loop configuration: {e}");
            return (Self::inert(status), LoopStatus::InitFailed);
        }

        let (queue, commands) = command_queue(config.max_commands);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let thread_status = Arc::clone(&status);
        let spawned = thread::Builder::new()
            .name("waymo-dispatch".into())
            .spawn(move || {
                run(
                    &config,
                    connector,
                    &compiler,
                    &commands,
                    &shutdown_rx,
                    &thread_status,
                    &ready_tx,
                );
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to spawn dispatch thread: {e}");
                return (Self::inert(status), LoopStatus::InitFailed);
            }
        };

        // A thread that dies before reporting leaves the status at InitFailed.
        let initial = ready_rx.recv().unwrap_or(LoopStatus::InitFailed);

        let event_loop = Self {
            submitter: Submitter { queue, status },
            shutdown: Some(shutdown_tx),
            thread: Some(handle),
        };
        (event_loop, initial)
    }

    /// A loop with no thread behind it.
    fn inert(status: Arc<StatusCell>) -> Self {
        let (queue, _) = command_queue(1);
        Self {
            submitter: Submitter { queue, status },
            shutdown: None,
            thread: None,
        }
    }

    /// Current loop status.
    #[must_use]
    pub fn status(&self) -> LoopStatus {
        self.submitter.status()
    }

    /// See [`Submitter::submit`].
    ///
    /// # Errors
    ///
    /// See [`Submitter::submit`].
    pub fn submit(&self, action: Action) -> Result<(), SubmitError> {
        self.submitter.submit(action)
    }

    /// See [`Submitter::submit_tracked`].
    ///
    /// # Errors
    ///
    /// See [`Submitter::submit`].
    pub fn submit_tracked(&self, action: Action) -> Result<Completion, SubmitError> {
        self.submitter.submit_tracked(action)
    }

    /// See [`Submitter::submit_and_wait`].
    ///
    /// # Errors
    ///
    /// See [`Submitter::submit`].
    pub fn submit_and_wait(&self, action: Action) -> Result<Option<ActionOutcome>, SubmitError> {
        self.submitter.submit_and_wait(action)
    }

    /// A handle other threads can submit through.
    #[must_use]
    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    /// Stop the dispatch thread and release the connection.
    ///
    /// An action already being dispatched runs to completion; queued ones
    /// are discarded. Safe to call more than once.
    pub fn destroy(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if handle.join().is_err() {
            tracing::error!("Dispatch thread panicked");
        }
        tracing::debug!("Event loop destroyed");
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Body of the dispatch thread.
fn run<C, K>(
    config: &LoopConfig,
    connector: C,
    compiler: &K,
    commands: &CommandReceiver,
    shutdown: &Receiver<()>,
    status: &StatusCell,
    ready: &Sender<LoopStatus>,
) where
    C: Connector,
    K: KeymapCompiler,
{
    let dispatcher = match start(config, connector, compiler) {
        Ok(dispatcher) => dispatcher,
        Err(failed) => {
            status.set(failed);
            let _ = ready.send(failed);
            return;
        }
    };

    status.set(LoopStatus::Ok);
    let _ = ready.send(LoopStatus::Ok);
    tracing::info!(
        layout = %config.keyboard_layout,
        max_commands = config.max_commands,
        cooldown_ms = config.action_cooldown_ms,
        "Event loop running"
    );

    serve(dispatcher, commands, shutdown, status);

    let discarded = commands.discard();
    if discarded > 0 {
        tracing::info!(discarded, "Queued actions discarded");
    }
}

/// Connect, compile the layout and attach both devices, in that order.
fn start<C, K>(
    config: &LoopConfig,
    connector: C,
    compiler: &K,
) -> Result<Dispatcher<C::Sink>, LoopStatus>
where
    C: Connector,
    K: KeymapCompiler,
{
    let mut sink = connector.connect().map_err(|e| {
        tracing::error!("Compositor connection failed: {e}");
        LoopStatus::InitFailed
    })?;

    let keymap = compiler.compile(&config.keyboard_layout).map_err(|e| {
        tracing::error!("{e}");
        LoopStatus::KeyboardInitFailed
    })?;

    sink.attach_keyboard(&keymap).map_err(|e| {
        tracing::error!("Virtual keyboard setup failed: {e}");
        LoopStatus::KeyboardInitFailed
    })?;

    sink.attach_pointer().map_err(|e| {
        tracing::error!("Virtual pointer setup failed: {e}");
        LoopStatus::PointerInitFailed
    })?;

    Ok(Dispatcher::new(sink, keymap, config.action_cooldown()))
}

/// Dispatch until shutdown or until the connection drops.
fn serve<S: ProtocolSink>(
    mut dispatcher: Dispatcher<S>,
    commands: &CommandReceiver,
    shutdown: &Receiver<()>,
    status: &StatusCell,
) {
    loop {
        // Shutdown wins over queued work.
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        crossbeam_channel::select! {
            recv(shutdown) -> _ => break,
            recv(commands.inner()) -> msg => {
                let Ok(command) = msg else { break };
                if !execute(&mut dispatcher, command, status)
                    || !service_connection(&mut dispatcher, status)
                {
                    break;
                }
            }
            default(IDLE_SERVICE_INTERVAL) => {
                if !service_connection(&mut dispatcher, status) {
                    break;
                }
            }
        }
    }
}

/// Answer pending compositor traffic. Returns `false` once the connection
/// is gone.
fn service_connection<S: ProtocolSink>(
    dispatcher: &mut Dispatcher<S>,
    status: &StatusCell,
) -> bool {
    match dispatcher.service() {
        Ok(()) => true,
        Err(e) if e.is_fatal() => {
            tracing::error!("{e}");
            status.set(LoopStatus::Disconnected);
            false
        }
        Err(e) => {
            tracing::warn!("Servicing compositor connection: {e}");
            true
        }
    }
}

/// Run one command and resolve its ticket. Returns `false` once the
/// connection is gone.
fn execute<S: ProtocolSink>(
    dispatcher: &mut Dispatcher<S>,
    command: Command,
    status: &StatusCell,
) -> bool {
    match dispatcher.dispatch(&command.action) {
        Ok(outcome) => {
            command.complete(outcome);
            true
        }
        Err(e) => {
            tracing::error!(action = command.action.kind(), "{e}");
            status.set(LoopStatus::Disconnected);
            command.complete(ActionOutcome::Failed {
                reason: e.to_string(),
            });
            false
        }
    }
}
