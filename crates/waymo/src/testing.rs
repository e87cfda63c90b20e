//! In-process sink that records what would have reached the compositor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use waymo_input::{
    Connector, KeySpec, Keymap, KeymapCompiler, KeymapError, Modifiers, MouseButton,
    ProtocolSink, SinkError,
};

pub(crate) const KEY_A: u32 = 38;
pub(crate) const KEY_B: u32 = 56;
pub(crate) const KEY_RETURN: u32 = 36;

/// `a`, `A` and `b` on their US positions, plus Return.
pub(crate) fn test_keymap() -> Keymap {
    Keymap::from_entries(
        "us",
        "",
        [
            ('a', KeySpec { keycode: KEY_A, modifiers: Modifiers::empty() }),
            ('A', KeySpec { keycode: KEY_A, modifiers: Modifiers::SHIFT }),
            ('b', KeySpec { keycode: KEY_B, modifiers: Modifiers::empty() }),
            ('\r', KeySpec { keycode: KEY_RETURN, modifiers: Modifiers::empty() }),
        ],
    )
}

/// Compiles `"us"` to [`test_keymap`] and rejects every other layout.
pub(crate) struct TableCompiler;

impl KeymapCompiler for TableCompiler {
    fn compile(&self, layout: &str) -> Result<Keymap, KeymapError> {
        if layout == "us" {
            Ok(test_keymap())
        } else {
            Err(KeymapError::Compile {
                layout: layout.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Emitted {
    Motion { x: i32, y: i32, relative: bool },
    Button { button: MouseButton, down: bool },
    Key { keycode: u32, modifiers: Modifiers, down: bool },
}

impl Emitted {
    pub(crate) const fn key(keycode: u32, down: bool) -> Self {
        Self::Key {
            keycode,
            modifiers: Modifiers::empty(),
            down,
        }
    }
}

/// Shared log of emitted events with their timestamps.
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<(Instant, Emitted)>>>,
    services: Arc<AtomicUsize>,
}

impl Recorder {
    fn push(&self, event: Emitted) {
        self.events.lock().unwrap().push((Instant::now(), event));
    }

    pub(crate) fn timed(&self) -> Vec<(Instant, Emitted)> {
        self.events.lock().unwrap().clone()
    }

    /// How many times the sink was asked to service its connection.
    pub(crate) fn service_calls(&self) -> usize {
        self.services.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> Vec<Emitted> {
        self.timed().into_iter().map(|(_, e)| e).collect()
    }

    /// Poll until at least `count` events were recorded.
    pub(crate) fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.events.lock().unwrap().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Connect,
    Keyboard,
    Pointer,
}

/// Holds the first emitted event until released.
pub(crate) struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Test side of a [`Gate`].
pub(crate) struct GateHandle {
    pub(crate) entered: Receiver<()>,
    pub(crate) release: Sender<()>,
}

pub(crate) struct RecordingConnector {
    recorder: Recorder,
    fail_at: Option<Stage>,
    disconnect_after: Option<usize>,
    hang_up_when_idle: bool,
    gate: Option<Gate>,
}

impl RecordingConnector {
    pub(crate) fn new() -> Self {
        Self {
            recorder: Recorder::default(),
            fail_at: None,
            disconnect_after: None,
            hang_up_when_idle: false,
            gate: None,
        }
    }

    pub(crate) fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    pub(crate) fn fail_at(mut self, stage: Stage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Report a lost connection once `events` events have been emitted.
    pub(crate) fn disconnect_after(mut self, events: usize) -> Self {
        self.disconnect_after = Some(events);
        self
    }

    /// Report a lost connection the first time the sink is serviced.
    pub(crate) fn hang_up_when_idle(mut self) -> Self {
        self.hang_up_when_idle = true;
        self
    }

    pub(crate) fn gated(mut self) -> (Self, GateHandle) {
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        self.gate = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        (
            self,
            GateHandle {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl Connector for RecordingConnector {
    type Sink = RecordingSink;

    fn connect(self) -> Result<RecordingSink, SinkError> {
        if self.fail_at == Some(Stage::Connect) {
            return Err(SinkError::Disconnected("no compositor".into()));
        }
        Ok(RecordingSink {
            recorder: self.recorder,
            fail_at: self.fail_at,
            disconnect_after: self.disconnect_after,
            hang_up_when_idle: self.hang_up_when_idle,
            gate: self.gate,
            emitted: 0,
        })
    }
}

pub(crate) struct RecordingSink {
    recorder: Recorder,
    fail_at: Option<Stage>,
    disconnect_after: Option<usize>,
    hang_up_when_idle: bool,
    gate: Option<Gate>,
    emitted: usize,
}

impl RecordingSink {
    fn emit(&mut self, event: Emitted) -> Result<(), SinkError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        if self.disconnect_after.is_some_and(|n| self.emitted >= n) {
            return Err(SinkError::Disconnected("compositor went away".into()));
        }
        self.emitted += 1;
        self.recorder.push(event);
        Ok(())
    }
}

impl ProtocolSink for RecordingSink {
    fn attach_keyboard(&mut self, _keymap: &Keymap) -> Result<(), SinkError> {
        if self.fail_at == Some(Stage::Keyboard) {
            return Err(SinkError::Unsupported("virtual keyboard"));
        }
        Ok(())
    }

    fn attach_pointer(&mut self) -> Result<(), SinkError> {
        if self.fail_at == Some(Stage::Pointer) {
            return Err(SinkError::Unsupported("virtual pointer"));
        }
        Ok(())
    }

    fn emit_motion(&mut self, x: i32, y: i32, relative: bool) -> Result<(), SinkError> {
        self.emit(Emitted::Motion { x, y, relative })
    }

    fn emit_button(&mut self, button: MouseButton, down: bool) -> Result<(), SinkError> {
        self.emit(Emitted::Button { button, down })
    }

    fn emit_key(
        &mut self,
        keycode: u32,
        modifiers: Modifiers,
        down: bool,
    ) -> Result<(), SinkError> {
        self.emit(Emitted::Key {
            keycode,
            modifiers,
            down,
        })
    }

    fn service(&mut self) -> Result<(), SinkError> {
        self.recorder.services.fetch_add(1, Ordering::SeqCst);
        if self.hang_up_when_idle {
            return Err(SinkError::Disconnected("compositor hung up".into()));
        }
        Ok(())
    }
}
