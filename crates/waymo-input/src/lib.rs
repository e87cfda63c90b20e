//! Compositor input backends for waymo.
//!
//! Everything the dispatch engine needs from the outside world lives here:
//!
//! - [`sink`]: the [`ProtocolSink`] / [`Connector`] seam the engine drives
//! - [`keymap`]: layout compilation and character to keycode lookup
//! - [`wayland`]: `zwp_virtual_keyboard_v1` + `zwlr_virtual_pointer_v1`
//! - [`libei`]: direct libei protocol via `reis`

pub mod keymap;
pub mod libei;
pub mod sink;
pub mod wayland;

pub use keymap::{KeySpec, Keymap, KeymapCompiler, KeymapError, Modifiers, XkbCompiler};
pub use libei::{EiConnector, EiSink};
pub use sink::{Connector, MouseButton, ParseButtonError, ProtocolSink, SinkError};
pub use wayland::{WaylandConnector, WaylandSink};
