//! Key chords expanded into the explicit key events the device expects.

use crate::network::ControlMessage;
use crate::network::protocol::KeyAction;

pub const KEYCODE_A: i32 = 29;
pub const KEYCODE_C: i32 = 31;
pub const KEYCODE_V: i32 = 50;
pub const KEYCODE_X: i32 = 52;
pub const KEYCODE_Z: i32 = 54;
pub const KEYCODE_TAB: i32 = 61;
pub const KEYCODE_DEL: i32 = 67;
pub const KEYCODE_DPAD_UP: i32 = 19;
pub const KEYCODE_DPAD_DOWN: i32 = 20;
pub const KEYCODE_DPAD_LEFT: i32 = 21;
pub const KEYCODE_DPAD_RIGHT: i32 = 22;
pub const KEYCODE_MOVE_HOME: i32 = 122;
pub const KEYCODE_MOVE_END: i32 = 123;

pub const KEYCODE_ALT_LEFT: i32 = 57;
pub const KEYCODE_SHIFT_LEFT: i32 = 59;
pub const KEYCODE_CTRL_LEFT: i32 = 113;
pub const KEYCODE_META_LEFT: i32 = 117;

pub const META_SHIFT_ON: i32 = 0x1;
pub const META_ALT_ON: i32 = 0x2;
pub const META_CTRL_ON: i32 = 0x1000;
pub const META_META_ON: i32 = 0x10000;

/// Modifiers in the order they are pressed.
const MODIFIERS: [(i32, i32); 4] = [
    (KEYCODE_CTRL_LEFT, META_CTRL_ON),
    (KEYCODE_SHIFT_LEFT, META_SHIFT_ON),
    (KEYCODE_ALT_LEFT, META_ALT_ON),
    (KEYCODE_META_LEFT, META_META_ON),
];

/// A key pressed together with a set of modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStroke {
    pub key_code: i32,
    pub meta_state: i32,
}

impl KeyStroke {
    pub const fn new(key_code: i32, meta_state: i32) -> Self {
        Self {
            key_code,
            meta_state,
        }
    }

    /// Modifier presses, then the key, then modifier releases in reverse.
    /// Every event carries the meta state in effect at that moment.
    pub fn to_messages(&self) -> Vec<ControlMessage> {
        let held: Vec<(i32, i32)> = MODIFIERS
            .iter()
            .copied()
            .filter(|(_, mask)| self.meta_state & mask != 0)
            .collect();

        let mut messages = Vec::with_capacity(held.len() * 2 + 1);
        let mut meta_state = 0;
        for &(key_code, mask) in &held {
            meta_state |= mask;
            messages.push(key_event(KeyAction::Down, key_code, meta_state));
        }
        messages.push(key_event(KeyAction::DownAndUp, self.key_code, meta_state));
        for &(key_code, mask) in held.iter().rev() {
            meta_state &= !mask;
            messages.push(key_event(KeyAction::Up, key_code, meta_state));
        }
        messages
    }
}

fn key_event(action: KeyAction, key_code: i32, meta_state: i32) -> ControlMessage {
    ControlMessage::KeyEvent {
        action,
        key_code,
        meta_state,
    }
}
