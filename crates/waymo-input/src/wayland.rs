//! Wayland virtual input backend.
//!
//! Speaks `zwp_virtual_keyboard_v1` and `zwlr_virtual_pointer_v1` over a
//! plain `wayland-client` connection. The compiled XKB keymap is uploaded
//! to the virtual keyboard through a memfd, so keycodes from
//! [`Keymap::lookup`] are interpreted exactly as they were resolved.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsFd;
use std::time::Instant;

use wayland_client::backend::ObjectId;
use wayland_client::globals::{registry_queue_init, GlobalListContents};
use wayland_client::protocol::{wl_keyboard, wl_output, wl_pointer, wl_registry, wl_seat};
use wayland_client::{delegate_noop, Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

use crate::keymap::{Keymap, Modifiers};
use crate::sink::{Connector, MouseButton, ProtocolSink, SinkError};

/// Highest `wl_seat` version we understand.
const SEAT_VERSION: u32 = 7;
/// Highest `wl_output` version we understand.
const OUTPUT_VERSION: u32 = 4;
/// `zwlr_virtual_pointer_manager_v1` version with `create_virtual_pointer_with_output`.
const POINTER_MANAGER_VERSION: u32 = 2;

/// Key states as carried by `zwp_virtual_keyboard_v1.key`.
const KEY_STATE_RELEASED: u32 = 0;
const KEY_STATE_PRESSED: u32 = 1;

/// XKB keycodes are evdev keycodes offset by 8.
const XKB_KEYCODE_OFFSET: u32 = 8;

/// Logical placement and current mode of one output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct OutputInfo {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

/// Compute the extent of the desktop spanned by `outputs`.
///
/// Returns `(width, height)` of the bounding box anchored at the origin.
fn bounding_box<'a>(outputs: impl IntoIterator<Item = &'a OutputInfo>) -> (u32, u32) {
    let mut max_x: i32 = 0;
    let mut max_y: i32 = 0;

    for o in outputs {
        max_x = max_x.max(o.x.saturating_add(o.width));
        max_y = max_y.max(o.y.saturating_add(o.height));
    }

    (max_x.unsigned_abs(), max_y.unsigned_abs())
}

/// Modifier state of the virtual keyboard.
///
/// Each held key remembers the mask it was pressed with; the depressed
/// mask sent to the compositor is the union over all held keys.
#[derive(Debug, Default)]
struct ModifierLatch {
    held: HashMap<u32, u32>,
    depressed: u32,
}

impl ModifierLatch {
    /// Record a key press. Returns the new depressed mask if it changed.
    fn press(&mut self, key: u32, mask: u32) -> Option<u32> {
        self.held.insert(key, mask);
        self.update()
    }

    /// Record a key release. Returns the new depressed mask if it changed.
    fn release(&mut self, key: u32) -> Option<u32> {
        self.held.remove(&key);
        self.update()
    }

    fn update(&mut self) -> Option<u32> {
        let mask = self.held.values().fold(0, |acc, m| acc | m);
        if mask == self.depressed {
            return None;
        }
        self.depressed = mask;
        Some(mask)
    }
}

/// Dispatch state for the sink's event queue.
#[derive(Debug, Default)]
struct State {
    outputs: HashMap<ObjectId, OutputInfo>,
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for State {
    fn event(
        _state: &mut Self,
        _registry: &wl_registry::WlRegistry,
        _event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Outputs added after start-up are not tracked.
    }
}

impl Dispatch<wl_output::WlOutput, ()> for State {
    fn event(
        state: &mut Self,
        output: &wl_output::WlOutput,
        event: wl_output::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let info = state.outputs.entry(output.id()).or_default();
        match event {
            wl_output::Event::Geometry { x, y, .. } => {
                info.x = x;
                info.y = y;
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                ..
            } => {
                let current = matches!(flags, WEnum::Value(f) if f.contains(wl_output::Mode::Current));
                if current {
                    info.width = width;
                    info.height = height;
                }
            }
            _ => {}
        }
    }
}

delegate_noop!(State: ignore wl_seat::WlSeat);
delegate_noop!(State: ZwpVirtualKeyboardManagerV1);
delegate_noop!(State: ZwpVirtualKeyboardV1);
delegate_noop!(State: ZwlrVirtualPointerManagerV1);
delegate_noop!(State: ZwlrVirtualPointerV1);

/// Opens a [`WaylandSink`] on the compositor named by `WAYLAND_DISPLAY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaylandConnector;

impl Connector for WaylandConnector {
    type Sink = WaylandSink;

    fn connect(self) -> Result<WaylandSink, SinkError> {
        WaylandSink::connect()
    }
}

/// Virtual keyboard and pointer on a Wayland compositor.
pub struct WaylandSink {
    conn: Connection,
    queue: EventQueue<State>,
    qh: QueueHandle<State>,
    state: State,
    seat: wl_seat::WlSeat,
    keyboard_manager: Option<ZwpVirtualKeyboardManagerV1>,
    pointer_manager: Option<ZwlrVirtualPointerManagerV1>,
    keyboard: Option<ZwpVirtualKeyboardV1>,
    pointer: Option<ZwlrVirtualPointerV1>,
    shift_mask: u32,
    altgr_mask: u32,
    modifiers: ModifierLatch,
    started: Instant,
}

impl WaylandSink {
    /// Connect, enumerate globals and outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no compositor or it exposes no seat.
    pub fn connect() -> Result<Self, SinkError> {
        let conn = Connection::connect_to_env()
            .map_err(|e| SinkError::Disconnected(format!("connect: {e}")))?;

        let (globals, mut queue) = registry_queue_init::<State>(&conn)
            .map_err(|e| SinkError::Protocol(format!("registry: {e}")))?;
        let qh = queue.handle();

        let seat: wl_seat::WlSeat = globals
            .bind(&qh, 1..=SEAT_VERSION, ())
            .map_err(|_| SinkError::Unsupported("wl_seat"))?;
        let keyboard_manager: Option<ZwpVirtualKeyboardManagerV1> =
            globals.bind(&qh, 1..=1, ()).ok();
        let pointer_manager: Option<ZwlrVirtualPointerManagerV1> =
            globals.bind(&qh, 1..=POINTER_MANAGER_VERSION, ()).ok();

        let output_globals: Vec<(u32, u32)> = globals.contents().with_list(|list| {
            list.iter()
                .filter(|g| g.interface == wl_output::WlOutput::interface().name)
                .map(|g| (g.name, g.version))
                .collect()
        });
        for (name, version) in output_globals {
            let _output: wl_output::WlOutput =
                globals
                    .registry()
                    .bind(name, version.min(OUTPUT_VERSION), &qh, ());
        }

        let mut state = State::default();
        queue
            .roundtrip(&mut state)
            .map_err(|e| SinkError::Disconnected(format!("roundtrip: {e}")))?;

        tracing::info!(
            keyboard = keyboard_manager.is_some(),
            pointer = pointer_manager.is_some(),
            outputs = state.outputs.len(),
            "Connected to Wayland compositor"
        );

        Ok(Self {
            conn,
            queue,
            qh,
            state,
            seat,
            keyboard_manager,
            pointer_manager,
            keyboard: None,
            pointer: None,
            shift_mask: 0,
            altgr_mask: 0,
            modifiers: ModifierLatch::default(),
            started: Instant::now(),
        })
    }

    /// Milliseconds since the sink was opened, for event timestamps.
    #[allow(clippy::cast_possible_truncation)]
    fn timestamp_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.conn
            .flush()
            .map_err(|e| SinkError::Disconnected(format!("flush: {e}")))
    }

    fn roundtrip(&mut self) -> Result<(), SinkError> {
        self.queue
            .roundtrip(&mut self.state)
            .map(|_| ())
            .map_err(|e| SinkError::Disconnected(format!("roundtrip: {e}")))
    }

    fn pointer(&self) -> Result<&ZwlrVirtualPointerV1, SinkError> {
        self.pointer
            .as_ref()
            .ok_or(SinkError::Unsupported("zwlr_virtual_pointer_v1"))
    }

    fn mask_for(&self, modifiers: Modifiers) -> u32 {
        let mut mask = 0;
        if modifiers.contains(Modifiers::SHIFT) {
            mask |= self.shift_mask;
        }
        if modifiers.contains(Modifiers::ALTGR) {
            mask |= self.altgr_mask;
        }
        mask
    }
}

/// Write the keymap text, NUL-terminated, into an anonymous file.
fn keymap_file(text: &str) -> Result<(File, u32), SinkError> {
    let fd = rustix::fs::memfd_create("waymo-keymap", rustix::fs::MemfdFlags::CLOEXEC)
        .map_err(std::io::Error::from)?;
    let mut file = File::from(fd);
    file.write_all(text.as_bytes())?;
    file.write_all(&[0])?;
    let size = u32::try_from(text.len() + 1)
        .map_err(|_| SinkError::Protocol("keymap too large".to_string()))?;
    Ok((file, size))
}

impl ProtocolSink for WaylandSink {
    fn attach_keyboard(&mut self, keymap: &Keymap) -> Result<(), SinkError> {
        let manager = self
            .keyboard_manager
            .as_ref()
            .ok_or(SinkError::Unsupported("zwp_virtual_keyboard_manager_v1"))?;
        if keymap.text().is_empty() {
            return Err(SinkError::Protocol(format!(
                "keymap for layout {:?} has no XKB text to upload",
                keymap.layout()
            )));
        }

        let keyboard = manager.create_virtual_keyboard(&self.seat, &self.qh, ());
        let (file, size) = match keymap_file(keymap.text()) {
            Ok(upload) => upload,
            Err(e) => {
                keyboard.destroy();
                return Err(e);
            }
        };
        keyboard.keymap(wl_keyboard::KeymapFormat::XkbV1 as u32, file.as_fd(), size);
        self.keyboard = Some(keyboard);
        self.shift_mask = keymap.modifier_mask(Modifiers::SHIFT);
        self.altgr_mask = keymap.modifier_mask(Modifiers::ALTGR);
        self.roundtrip()?;

        tracing::debug!(layout = keymap.layout(), size, "Virtual keyboard keymap uploaded");
        Ok(())
    }

    fn attach_pointer(&mut self) -> Result<(), SinkError> {
        let manager = self
            .pointer_manager
            .as_ref()
            .ok_or(SinkError::Unsupported("zwlr_virtual_pointer_manager_v1"))?;
        self.pointer = Some(manager.create_virtual_pointer(Some(&self.seat), &self.qh, ()));
        self.roundtrip()?;

        let (width, height) = bounding_box(self.state.outputs.values());
        tracing::debug!(width, height, "Virtual pointer created");
        Ok(())
    }

    fn emit_motion(&mut self, x: i32, y: i32, relative: bool) -> Result<(), SinkError> {
        let time = self.timestamp_ms();
        if relative {
            self.pointer()?.motion(time, f64::from(x), f64::from(y));
        } else {
            let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
                return Err(SinkError::Protocol(format!(
                    "absolute position ({x}, {y}) is off-screen"
                )));
            };
            let (width, height) = bounding_box(self.state.outputs.values());
            if width == 0 || height == 0 {
                return Err(SinkError::Unsupported("output extent for absolute motion"));
            }
            self.pointer()?
                .motion_absolute(time, x.min(width - 1), y.min(height - 1), width, height);
        }
        self.pointer()?.frame();
        self.flush()
    }

    fn emit_button(&mut self, button: MouseButton, down: bool) -> Result<(), SinkError> {
        let state = if down {
            wl_pointer::ButtonState::Pressed
        } else {
            wl_pointer::ButtonState::Released
        };
        let time = self.timestamp_ms();
        let pointer = self.pointer()?;
        pointer.button(time, button.to_linux_code(), state);
        pointer.frame();
        self.flush()
    }

    fn emit_key(
        &mut self,
        keycode: u32,
        modifiers: Modifiers,
        down: bool,
    ) -> Result<(), SinkError> {
        let time = self.timestamp_ms();
        let mask = self.mask_for(modifiers);
        let keyboard = self
            .keyboard
            .as_ref()
            .ok_or(SinkError::Unsupported("zwp_virtual_keyboard_v1"))?;
        let key = keycode.saturating_sub(XKB_KEYCODE_OFFSET);

        if down {
            if let Some(depressed) = self.modifiers.press(key, mask) {
                keyboard.modifiers(depressed, 0, 0, 0);
            }
            keyboard.key(time, key, KEY_STATE_PRESSED);
        } else {
            keyboard.key(time, key, KEY_STATE_RELEASED);
            if let Some(depressed) = self.modifiers.release(key) {
                keyboard.modifiers(depressed, 0, 0, 0);
            }
        }
        self.flush()
    }

    fn service(&mut self) -> Result<(), SinkError> {
        if let Some(guard) = self.conn.prepare_read() {
            let readable = {
                let fd = guard.connection_fd();
                let mut fds = [rustix::event::PollFd::new(&fd, rustix::event::PollFlags::IN)];
                rustix::event::poll(&mut fds, 0)
                    .map_err(|e| SinkError::Disconnected(format!("poll: {e}")))?;
                let revents = fds[0].revents();
                if revents.intersects(rustix::event::PollFlags::HUP | rustix::event::PollFlags::ERR)
                {
                    return Err(SinkError::Disconnected("compositor hung up".to_string()));
                }
                revents.contains(rustix::event::PollFlags::IN)
            };
            if readable {
                guard
                    .read()
                    .map_err(|e| SinkError::Disconnected(format!("read: {e}")))?;
            }
        }
        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(|e| SinkError::Disconnected(format!("dispatch: {e}")))?;
        self.flush()
    }
}

impl Drop for WaylandSink {
    fn drop(&mut self) {
        if let Some(keyboard) = self.keyboard.take() {
            keyboard.destroy();
        }
        if let Some(pointer) = self.pointer.take() {
            pointer.destroy();
        }
        let _ = self.conn.flush();
        tracing::debug!("Wayland virtual devices released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(x: i32, y: i32, width: i32, height: i32) -> OutputInfo {
        OutputInfo {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn modifier_latch_keeps_shift_while_a_shifted_key_is_held() {
        let mut latch = ModifierLatch::default();
        assert_eq!(latch.press(30, 1), Some(1));
        assert_eq!(latch.press(48, 1), None);
        assert_eq!(latch.release(48), None);
        assert_eq!(latch.release(30), Some(0));
    }

    #[test]
    fn modifier_latch_unions_held_masks() {
        let mut latch = ModifierLatch::default();
        assert_eq!(latch.press(30, 1), Some(1));
        assert_eq!(latch.press(16, 1 << 7), Some(1 | (1 << 7)));
        assert_eq!(latch.release(30), Some(1 << 7));
        assert_eq!(latch.press(31, 0), None);
        assert_eq!(latch.release(16), Some(0));
    }

    #[test]
    fn modifier_latch_ignores_unmodified_keys() {
        let mut latch = ModifierLatch::default();
        assert_eq!(latch.press(30, 0), None);
        assert_eq!(latch.release(30), None);
    }

    #[test]
    fn bounding_box_empty() {
        assert_eq!(bounding_box(&[] as &[OutputInfo]), (0, 0));
    }

    #[test]
    fn bounding_box_single_output() {
        assert_eq!(bounding_box(&[output(0, 0, 1920, 1080)]), (1920, 1080));
    }

    #[test]
    fn bounding_box_side_by_side() {
        let outputs = [output(0, 0, 1920, 1080), output(1920, 0, 2560, 1440)];
        assert_eq!(bounding_box(&outputs), (4480, 1440));
    }

    #[test]
    fn bounding_box_stacked_with_offset() {
        let outputs = [output(0, 0, 1920, 1080), output(320, 1080, 1280, 1024)];
        assert_eq!(bounding_box(&outputs), (1920, 2104));
    }
}
