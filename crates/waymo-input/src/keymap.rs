//! Keyboard layout compilation and character to keycode lookup.
//!
//! A layout identifier (`"us"`, `"de"`, ...) is compiled once with
//! `xkbcommon`. The compiled keymap is flattened into a [`Keymap`]: the
//! serialized keymap text (uploaded to compositors that accept one) and a
//! table from characters to the key and modifiers that produce them.
//! After that nothing is looked up in libxkbcommon again.

use std::collections::HashMap;

use bitflags::bitflags;
use xkbcommon::xkb;

/// The single XKB layout group used for lookups.
const LAYOUT_INDEX: u32 = 0;

bitflags! {
    /// Modifiers that must be held while a key is pressed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u8 {
        const SHIFT = 1 << 0;
        /// ISO Level 3 shift (`Mod5` in the default rules).
        const ALTGR = 1 << 1;
    }
}

impl Modifiers {
    /// Modifiers needed to reach a shift level in the conventional
    /// four-level key type.
    #[must_use]
    pub fn for_level(level: u32) -> Self {
        let mut mods = Self::empty();
        if level & 1 == 1 {
            mods |= Self::SHIFT;
        }
        if level >= 2 {
            mods |= Self::ALTGR;
        }
        mods
    }
}

/// A character resolved against a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    /// XKB keycode (evdev keycode + 8).
    pub keycode: u32,
    /// Modifiers held for the key transition.
    pub modifiers: Modifiers,
}

/// Errors from keymap compilation.
#[derive(Debug, thiserror::Error)]
pub enum KeymapError {
    /// libxkbcommon rejected the layout.
    #[error("failed to compile keymap for layout {layout:?}")]
    Compile { layout: String },

    /// The layout compiled but produces no characters.
    #[error("keymap for layout {layout:?} maps no characters")]
    Empty { layout: String },
}

/// A compiled layout, immutable after construction.
#[derive(Debug, Clone)]
pub struct Keymap {
    layout: String,
    text: String,
    entries: HashMap<char, KeySpec>,
    shift_mask: u32,
    altgr_mask: u32,
}

impl Keymap {
    /// Build a keymap from an explicit table.
    ///
    /// `text` is the XKB keymap handed to compositors that accept one; it
    /// may be empty for backends that never upload a keymap.
    #[must_use]
    pub fn from_entries(
        layout: impl Into<String>,
        text: impl Into<String>,
        entries: impl IntoIterator<Item = (char, KeySpec)>,
    ) -> Self {
        Self {
            layout: layout.into(),
            text: text.into(),
            entries: entries.into_iter().collect(),
            shift_mask: 1 << 0,
            altgr_mask: 1 << 7,
        }
    }

    /// The layout identifier this keymap was compiled from.
    #[must_use]
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Serialized keymap in `XKB_KEYMAP_FORMAT_TEXT_V1`.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of characters this layout can produce.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the layout produces no characters at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a character to the key that types it.
    ///
    /// Returns `None` if the layout has no key for `ch`.
    #[must_use]
    pub fn lookup(&self, ch: char) -> Option<KeySpec> {
        let ch = match ch {
            '\n' => '\r',
            other => other,
        };
        self.entries.get(&ch).copied()
    }

    /// Depressed-modifier mask for the `modifiers` request of
    /// `zwp_virtual_keyboard_v1`, using this keymap's modifier indices.
    #[must_use]
    pub fn modifier_mask(&self, modifiers: Modifiers) -> u32 {
        let mut mask = 0;
        if modifiers.contains(Modifiers::SHIFT) {
            mask |= self.shift_mask;
        }
        if modifiers.contains(Modifiers::ALTGR) {
            mask |= self.altgr_mask;
        }
        mask
    }

    /// Insert `spec` for `ch` unless an entry needing fewer modifiers
    /// already exists.
    fn insert_preferred(&mut self, ch: char, spec: KeySpec) {
        let better = self.entries.get(&ch).is_none_or(|existing| {
            spec.modifiers.bits().count_ones() < existing.modifiers.bits().count_ones()
        });
        if better {
            self.entries.insert(ch, spec);
        }
    }
}

/// The keymap system: turns a layout identifier into a [`Keymap`].
pub trait KeymapCompiler: Send + 'static {
    /// Compile `layout`. An empty identifier selects the system default.
    ///
    /// # Errors
    ///
    /// Returns [`KeymapError`] if the layout is unknown or unusable.
    fn compile(&self, layout: &str) -> Result<Keymap, KeymapError>;
}

/// [`KeymapCompiler`] backed by libxkbcommon and the system XKB data.
#[derive(Debug, Clone, Default)]
pub struct XkbCompiler {
    /// Optional XKB variant (e.g. `"dvorak"`).
    pub variant: String,
    /// Optional XKB options (e.g. `"ctrl:nocaps"`).
    pub options: Option<String>,
}

impl KeymapCompiler for XkbCompiler {
    fn compile(&self, layout: &str) -> Result<Keymap, KeymapError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let xkb_keymap = xkb::Keymap::new_from_names(
            &context,
            "",
            "",
            layout,
            self.variant.as_str(),
            self.options.clone(),
            xkb::COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| KeymapError::Compile {
            layout: layout.to_string(),
        })?;

        let keymap = flatten(layout, &xkb_keymap);
        if keymap.is_empty() {
            return Err(KeymapError::Empty {
                layout: layout.to_string(),
            });
        }

        tracing::info!(
            layout = if layout.is_empty() { "default" } else { layout },
            characters = keymap.len(),
            "Keymap compiled"
        );
        Ok(keymap)
    }
}

/// Walk every key and shift level of a compiled keymap.
fn flatten(layout: &str, xkb_keymap: &xkb::Keymap) -> Keymap {
    let mut keymap = Keymap {
        layout: layout.to_string(),
        text: xkb_keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1),
        entries: HashMap::new(),
        shift_mask: mod_mask(xkb_keymap, "Shift"),
        altgr_mask: mod_mask(xkb_keymap, "Mod5"),
    };

    let min = xkb_keymap.min_keycode().raw();
    let max = xkb_keymap.max_keycode().raw();
    for raw in min..=max {
        let keycode = xkb::Keycode::new(raw);
        let levels = xkb_keymap.num_levels_for_key(keycode, LAYOUT_INDEX);
        for level in 0..levels {
            for sym in xkb_keymap.key_get_syms_by_level(keycode, LAYOUT_INDEX, level) {
                let Some(ch) = char::from_u32(xkb::keysym_to_utf32(*sym)) else {
                    continue;
                };
                if ch == '\0' {
                    continue;
                }
                keymap.insert_preferred(
                    ch,
                    KeySpec {
                        keycode: raw,
                        modifiers: Modifiers::for_level(level),
                    },
                );
            }
        }
    }
    keymap
}

fn mod_mask(xkb_keymap: &xkb::Keymap, name: &str) -> u32 {
    let index = xkb_keymap.mod_get_index(name);
    if index == xkb::MOD_INVALID || index >= 32 {
        0
    } else {
        1 << index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(keycode: u32, modifiers: Modifiers) -> KeySpec {
        KeySpec { keycode, modifiers }
    }

    #[test]
    fn levels_map_to_modifiers() {
        assert_eq!(Modifiers::for_level(0), Modifiers::empty());
        assert_eq!(Modifiers::for_level(1), Modifiers::SHIFT);
        assert_eq!(Modifiers::for_level(2), Modifiers::ALTGR);
        assert_eq!(Modifiers::for_level(3), Modifiers::SHIFT | Modifiers::ALTGR);
    }

    #[test]
    fn lookup_hits_and_misses() {
        let keymap = Keymap::from_entries(
            "us",
            "",
            [
                ('a', spec(38, Modifiers::empty())),
                ('A', spec(38, Modifiers::SHIFT)),
            ],
        );
        assert_eq!(keymap.lookup('a'), Some(spec(38, Modifiers::empty())));
        assert_eq!(keymap.lookup('A'), Some(spec(38, Modifiers::SHIFT)));
        assert_eq!(keymap.lookup('ß'), None);
        assert_eq!(keymap.len(), 2);
        assert_eq!(keymap.layout(), "us");
    }

    #[test]
    fn newline_resolves_like_return() {
        let keymap = Keymap::from_entries("us", "", [('\r', spec(36, Modifiers::empty()))]);
        assert_eq!(keymap.lookup('\n'), Some(spec(36, Modifiers::empty())));
    }

    #[test]
    fn fewer_modifiers_win() {
        let mut keymap = Keymap::from_entries("de", "", []);
        keymap.insert_preferred('@', spec(24, Modifiers::ALTGR));
        keymap.insert_preferred('@', spec(11, Modifiers::SHIFT | Modifiers::ALTGR));
        assert_eq!(keymap.lookup('@'), Some(spec(24, Modifiers::ALTGR)));

        keymap.insert_preferred('@', spec(50, Modifiers::empty()));
        assert_eq!(keymap.lookup('@'), Some(spec(50, Modifiers::empty())));
    }

    #[test]
    fn modifier_mask_uses_keymap_indices() {
        let keymap = Keymap::from_entries("us", "", []);
        assert_eq!(keymap.modifier_mask(Modifiers::empty()), 0);
        assert_eq!(keymap.modifier_mask(Modifiers::SHIFT), 1);
        assert_eq!(
            keymap.modifier_mask(Modifiers::SHIFT | Modifiers::ALTGR),
            1 | (1 << 7)
        );
    }
}
