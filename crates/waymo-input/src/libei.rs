//! Direct `reis` (libei) backend.
//!
//! Uses the `reis` crate to speak the libei protocol directly, connecting
//! through `LIBEI_SOCKET` when set and the `RemoteDesktop` XDG portal
//! (`ashpd`) otherwise. Compositors without the wlroots virtual input
//! protocols (GNOME, KDE) accept input this way.
//!
//! The EIS server owns the keymap on this path; keycodes from the local
//! [`Keymap`] are sent as-is, so the configured layout should match the
//! session layout.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::time::SystemTime;

use reis::ei;
use reis::handshake::ei_handshake_blocking;
use reis::PendingRequestResult;

use crate::keymap::{Keymap, Modifiers};
use crate::sink::{Connector, MouseButton, ProtocolSink, SinkError};

/// Name announced to the EIS server during the handshake.
const CLIENT_NAME: &str = "waymo";

/// Evdev keycodes for the modifier keys we synthesize.
const KEY_LEFTSHIFT: u32 = 42;
const KEY_RIGHTALT: u32 = 100;

/// XKB keycodes are evdev keycodes offset by 8.
const XKB_KEYCODE_OFFSET: u32 = 8;

/// Rounds of socket polling allowed for device discovery.
const DISCOVERY_ITERATIONS: u32 = 200;
/// Poll timeout per discovery round, in milliseconds.
const DISCOVERY_POLL_MS: i32 = 50;

/// Opens an [`EiSink`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EiConnector;

impl Connector for EiConnector {
    type Sink = EiSink;

    fn connect(self) -> Result<EiSink, SinkError> {
        EiSink::connect()
    }
}

/// Input sink backed by `reis` (direct libei protocol).
pub struct EiSink {
    context: ei::Context,
    device: ei::Device,
    keyboard: Option<ei::Keyboard>,
    pointer: Option<ei::Pointer>,
    pointer_abs: Option<ei::PointerAbsolute>,
    button: Option<ei::Button>,
    serial: u32,
    sequence: u32,
    emulating: bool,
}

impl EiSink {
    /// Connect to the EIS server and discover input capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if no EIS socket can be obtained, the handshake
    /// fails, or no input device is offered.
    pub fn connect() -> Result<Self, SinkError> {
        let context = open_context()?;
        let resp = ei_handshake_blocking(&context, CLIENT_NAME, ei::handshake::ContextType::Sender)
            .map_err(|e| SinkError::Protocol(format!("handshake failed: {e}")))?;
        discover_devices(context, resp.serial)
    }

    /// Get the current timestamp in microseconds for frame events.
    #[allow(clippy::cast_possible_truncation)]
    fn timestamp_us() -> u64 {
        SystemTime::UNIX_EPOCH
            .elapsed()
            .map_or(0, |d| d.as_micros() as u64)
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.context
            .flush()
            .map_err(|e| SinkError::Disconnected(format!("flush: {e}")))
    }

    /// Ensure we are in emulating mode before sending events.
    fn ensure_emulating(&mut self) -> Result<(), SinkError> {
        if !self.emulating {
            self.device.start_emulating(self.serial, self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
            self.emulating = true;
            self.flush()?;
        }
        Ok(())
    }

    /// Send a frame event and flush the context.
    fn frame_and_flush(&self) -> Result<(), SinkError> {
        self.device.frame(self.serial, Self::timestamp_us());
        self.flush()
    }

    fn modifier_keys(modifiers: Modifiers) -> impl Iterator<Item = u32> {
        [
            (Modifiers::SHIFT, KEY_LEFTSHIFT),
            (Modifiers::ALTGR, KEY_RIGHTALT),
        ]
        .into_iter()
        .filter(move |(flag, _)| modifiers.contains(*flag))
        .map(|(_, key)| key)
    }
}

impl ProtocolSink for EiSink {
    fn attach_keyboard(&mut self, keymap: &Keymap) -> Result<(), SinkError> {
        if self.keyboard.is_none() {
            return Err(SinkError::Unsupported("ei_keyboard"));
        }
        tracing::debug!(
            layout = keymap.layout(),
            "libei keyboard ready; keymap is owned by the EIS server"
        );
        Ok(())
    }

    fn attach_pointer(&mut self) -> Result<(), SinkError> {
        if self.button.is_none() {
            return Err(SinkError::Unsupported("ei_button"));
        }
        if self.pointer.is_none() && self.pointer_abs.is_none() {
            return Err(SinkError::Unsupported("ei_pointer"));
        }
        Ok(())
    }

    fn emit_motion(&mut self, x: i32, y: i32, relative: bool) -> Result<(), SinkError> {
        if relative {
            if self.pointer.is_none() {
                return Err(SinkError::Unsupported("ei_pointer"));
            }
            self.ensure_emulating()?;
            if let Some(ref pointer) = self.pointer {
                #[allow(clippy::cast_precision_loss)]
                pointer.motion_relative(x as f32, y as f32);
            }
        } else {
            if self.pointer_abs.is_none() {
                return Err(SinkError::Unsupported("ei_pointer_absolute"));
            }
            self.ensure_emulating()?;
            if let Some(ref pointer_abs) = self.pointer_abs {
                #[allow(clippy::cast_precision_loss)]
                pointer_abs.motion_absolute(x as f32, y as f32);
            }
        }
        self.frame_and_flush()
    }

    fn emit_button(&mut self, button: MouseButton, down: bool) -> Result<(), SinkError> {
        if self.button.is_none() {
            return Err(SinkError::Unsupported("ei_button"));
        }
        let state = if down {
            ei::button::ButtonState::Press
        } else {
            ei::button::ButtonState::Released
        };
        self.ensure_emulating()?;
        if let Some(ref b) = self.button {
            b.button(button.to_linux_code(), state);
        }
        self.frame_and_flush()
    }

    fn emit_key(
        &mut self,
        keycode: u32,
        modifiers: Modifiers,
        down: bool,
    ) -> Result<(), SinkError> {
        if self.keyboard.is_none() {
            return Err(SinkError::Unsupported("ei_keyboard"));
        }
        self.ensure_emulating()?;
        let evdev = keycode.saturating_sub(XKB_KEYCODE_OFFSET);
        if let Some(ref keyboard) = self.keyboard {
            if down {
                for key in Self::modifier_keys(modifiers) {
                    keyboard.key(key, ei::keyboard::KeyState::Press);
                }
                keyboard.key(evdev, ei::keyboard::KeyState::Press);
            } else {
                keyboard.key(evdev, ei::keyboard::KeyState::Released);
                for key in Self::modifier_keys(modifiers) {
                    keyboard.key(key, ei::keyboard::KeyState::Released);
                }
            }
        }
        self.frame_and_flush()
    }

    fn service(&mut self) -> Result<(), SinkError> {
        let mut fds = [rustix::event::PollFd::new(
            &self.context,
            rustix::event::PollFlags::IN,
        )];
        rustix::event::poll(&mut fds, 0)
            .map_err(|e| SinkError::Disconnected(format!("poll: {e}")))?;
        let revents = fds[0].revents();
        if revents.intersects(rustix::event::PollFlags::HUP | rustix::event::PollFlags::ERR) {
            return Err(SinkError::Disconnected("EIS server hung up".to_string()));
        }
        if revents.contains(rustix::event::PollFlags::IN) {
            self.context
                .read()
                .map_err(|e| SinkError::Disconnected(format!("read: {e}")))?;
        }

        while let Some(result) = self.context.pending_event() {
            let event = match result {
                PendingRequestResult::Request(event) => event,
                PendingRequestResult::ParseError(e) => {
                    tracing::warn!("Parse error from EIS server: {e:?}");
                    continue;
                }
                PendingRequestResult::InvalidObject(id) => {
                    tracing::warn!(id, "Invalid object from EIS server");
                    continue;
                }
            };
            match event {
                ei::Event::Connection(_connection, conn_event) => match conn_event {
                    ei::connection::Event::Ping { ping } => ping.done(0),
                    ei::connection::Event::Disconnected { .. } => {
                        return Err(SinkError::Disconnected(
                            "EIS server closed the connection".to_string(),
                        ));
                    }
                    _ => {}
                },
                ei::Event::Device(device, dev_event) if device == self.device => match dev_event {
                    ei::device::Event::Resumed { serial } => self.serial = serial,
                    ei::device::Event::Paused { serial } => {
                        self.serial = serial;
                        self.emulating = false;
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        self.flush()
    }
}

impl Drop for EiSink {
    fn drop(&mut self) {
        if self.emulating {
            self.device.stop_emulating(self.serial);
            let _ = self.context.flush();
        }
        tracing::debug!("libei device released");
    }
}

/// Obtain an EIS socket, directly or through the `RemoteDesktop` portal.
fn open_context() -> Result<ei::Context, SinkError> {
    if let Ok(Some(context)) = ei::Context::connect_to_env() {
        tracing::info!("Connected to ei via LIBEI_SOCKET");
        return Ok(context);
    }

    tracing::info!("No LIBEI_SOCKET, using RemoteDesktop portal");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let stream = runtime.block_on(portal_stream())?;
    let context =
        ei::Context::new(stream).map_err(|e| SinkError::Protocol(format!("ei context: {e}")))?;

    tracing::info!("Connected to ei via RemoteDesktop portal");
    Ok(context)
}

/// Negotiate a `RemoteDesktop` session and return its EIS socket.
async fn portal_stream() -> Result<UnixStream, SinkError> {
    use ashpd::desktop::remote_desktop::{DeviceType, RemoteDesktop};
    use ashpd::desktop::PersistMode;

    let remote_desktop = RemoteDesktop::new()
        .await
        .map_err(|e| portal_err("RemoteDesktop proxy", e))?;

    let session = remote_desktop
        .create_session()
        .await
        .map_err(|e| portal_err("create session", e))?;

    remote_desktop
        .select_devices(
            &session,
            DeviceType::Keyboard | DeviceType::Pointer,
            None,
            PersistMode::DoNot,
        )
        .await
        .map_err(|e| portal_err("select devices", e))?;

    let _response = remote_desktop
        .start(&session, None)
        .await
        .map_err(|e| portal_err("start session", e))?
        .response()
        .map_err(|e| portal_err("start response", e))?;

    let fd = remote_desktop
        .connect_to_eis(&session)
        .await
        .map_err(|e| portal_err("connect to EIS", e))?;

    Ok(UnixStream::from(fd))
}

fn portal_err(what: &str, e: impl std::fmt::Display) -> SinkError {
    SinkError::Protocol(format!("{what}: {e}"))
}

/// Seat and device bookkeeping while waiting for the first usable device.
#[derive(Default)]
struct Discovery {
    /// Capabilities announced per seat, bound once the seat is `Done`.
    seats: HashMap<ei::Seat, u64>,
    device: Option<ei::Device>,
    interfaces: HashMap<String, reis::Object>,
    resumed_serial: Option<u32>,
}

impl Discovery {
    fn ready(&self) -> bool {
        self.device.is_some() && self.resumed_serial.is_some()
    }

    fn interface<T: reis::Interface>(&self) -> Option<T> {
        self.interfaces.get(T::NAME)?.clone().downcast()
    }

    fn is_ours(&self, device: &ei::Device) -> bool {
        self.device.as_ref() == Some(device)
    }

    /// Fold one server event into the discovery state.
    fn handle(&mut self, context: &ei::Context, event: ei::Event) -> Result<(), SinkError> {
        match event {
            ei::Event::Connection(_, ei::connection::Event::Seat { seat }) => {
                self.seats.insert(seat, 0);
            }
            ei::Event::Connection(_, ei::connection::Event::Ping { ping }) => ping.done(0),
            ei::Event::Connection(_, ei::connection::Event::Disconnected { .. }) => {
                return Err(SinkError::Disconnected(
                    "EIS server closed the connection during discovery".to_string(),
                ));
            }
            ei::Event::Seat(seat, ei::seat::Event::Capability { mask, .. }) => {
                if let Some(caps) = self.seats.get_mut(&seat) {
                    *caps |= mask;
                }
            }
            ei::Event::Seat(seat, ei::seat::Event::Done) => {
                if let Some(&caps) = self.seats.get(&seat) {
                    seat.bind(caps);
                    let _ = context.flush();
                }
            }
            ei::Event::Seat(_, ei::seat::Event::Device { device }) => {
                self.device.get_or_insert(device);
            }
            ei::Event::Device(device, ei::device::Event::Interface { object })
                if self.is_ours(&device) =>
            {
                self.interfaces.insert(object.interface().to_string(), object);
            }
            ei::Event::Device(device, ei::device::Event::Resumed { serial })
                if self.is_ours(&device) =>
            {
                self.resumed_serial = Some(serial);
            }
            _ => {}
        }
        Ok(())
    }

    fn into_sink(self, context: ei::Context, handshake_serial: u32) -> Result<EiSink, SinkError> {
        let keyboard = self.interface::<ei::Keyboard>();
        let pointer = self.interface::<ei::Pointer>();
        let pointer_abs = self.interface::<ei::PointerAbsolute>();
        let button = self.interface::<ei::Button>();
        let device = self
            .device
            .ok_or_else(|| SinkError::Protocol("EIS server offered no input device".to_string()))?;

        tracing::info!(
            keyboard = keyboard.is_some(),
            pointer = pointer.is_some(),
            pointer_abs = pointer_abs.is_some(),
            button = button.is_some(),
            "ei device capabilities"
        );

        Ok(EiSink {
            context,
            device,
            keyboard,
            pointer,
            pointer_abs,
            button,
            serial: self.resumed_serial.unwrap_or(handshake_serial),
            sequence: 0,
            emulating: false,
        })
    }
}

/// Bind every seat capability and wait for a resumed device.
fn discover_devices(context: ei::Context, serial: u32) -> Result<EiSink, SinkError> {
    let mut discovery = Discovery::default();

    for round in 0..DISCOVERY_ITERATIONS {
        let mut fds = [rustix::event::PollFd::new(
            &context,
            rustix::event::PollFlags::IN,
        )];
        let ready = rustix::event::poll(&mut fds, DISCOVERY_POLL_MS)
            .map_err(|e| SinkError::Disconnected(format!("poll: {e}")))?;
        if ready > 0 {
            context
                .read()
                .map_err(|e| SinkError::Disconnected(format!("read: {e}")))?;
        }

        // The handshake may already have buffered seat announcements.
        while let Some(pending) = context.pending_event() {
            match pending {
                PendingRequestResult::Request(event) => discovery.handle(&context, event)?,
                PendingRequestResult::ParseError(e) => {
                    tracing::warn!("Parse error during device discovery: {e:?}");
                }
                PendingRequestResult::InvalidObject(id) => {
                    tracing::warn!(id, "Invalid object during device discovery");
                }
            }
        }
        let _ = context.flush();

        if discovery.ready() {
            tracing::debug!(round, "Device discovery complete");
            break;
        }
    }

    discovery.into_sink(context, serial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_keys_follow_flags() {
        assert_eq!(EiSink::modifier_keys(Modifiers::empty()).count(), 0);
        assert_eq!(
            EiSink::modifier_keys(Modifiers::SHIFT).collect::<Vec<_>>(),
            vec![KEY_LEFTSHIFT]
        );
        assert_eq!(
            EiSink::modifier_keys(Modifiers::SHIFT | Modifiers::ALTGR).collect::<Vec<_>>(),
            vec![KEY_LEFTSHIFT, KEY_RIGHTALT]
        );
    }
}
