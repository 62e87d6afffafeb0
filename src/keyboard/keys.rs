//! Key codes and modifiers of the boot loader's key state interface, and the
//! ASCII to key press mapping of a US keyboard layout.
//!
//! Key codes are USB HID usage IDs offset by `0x7000`.

use zeroize::Zeroize;

pub const MOD_LEFT_CONTROL: u16 = 0x01;
pub const MOD_LEFT_SHIFT: u16 = 0x02;
pub const MOD_LEFT_OPTION: u16 = 0x04;
pub const MOD_LEFT_COMMAND: u16 = 0x08;
pub const MOD_RIGHT_CONTROL: u16 = 0x10;
pub const MOD_RIGHT_SHIFT: u16 = 0x20;
pub const MOD_RIGHT_OPTION: u16 = 0x40;
pub const MOD_RIGHT_COMMAND: u16 = 0x80;

pub const KEY_A: u16 = 0x7004;
pub const KEY_V: u16 = KEY_A + 21;
pub const KEY_Z: u16 = KEY_A + 25;
pub const KEY_1: u16 = 0x701e;
pub const KEY_0: u16 = 0x7027;
pub const KEY_ENTER: u16 = 0x7028;
pub const KEY_ESCAPE: u16 = 0x7029;
pub const KEY_BACKSPACE: u16 = 0x702a;
pub const KEY_TAB: u16 = 0x702b;
pub const KEY_SPACE: u16 = 0x702c;
pub const KEY_MINUS: u16 = 0x702d;
pub const KEY_EQUAL: u16 = 0x702e;
pub const KEY_LEFT_BRACKET: u16 = 0x702f;
pub const KEY_RIGHT_BRACKET: u16 = 0x7030;
pub const KEY_BACKSLASH: u16 = 0x7031;
pub const KEY_SEMICOLON: u16 = 0x7033;
pub const KEY_QUOTE: u16 = 0x7034;
pub const KEY_GRAVE: u16 = 0x7035;
pub const KEY_COMMA: u16 = 0x7036;
pub const KEY_PERIOD: u16 = 0x7037;
pub const KEY_SLASH: u16 = 0x7038;

/// One pressed key and the modifiers held with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Zeroize)]
pub struct KeyPress {
    pub key_code: u16,
    pub modifiers: u16,
}

impl KeyPress {
    pub const fn new(key_code: u16) -> Self {
        Self {
            key_code,
            modifiers: 0,
        }
    }

    pub const fn shifted(key_code: u16) -> Self {
        Self {
            key_code,
            modifiers: MOD_LEFT_SHIFT,
        }
    }
}

/// Cmd+V, held on the first scan to request a verbose boot.
pub const VERBOSE_BOOT: KeyPress = KeyPress {
    key_code: KEY_V,
    modifiers: MOD_LEFT_COMMAND | MOD_RIGHT_COMMAND,
};

/// Maps a printable ASCII character, CR or LF to its key press. Anything
/// else maps to key code 0.
pub fn ascii_to_key(c: u8) -> KeyPress {
    match c {
        b'a'..=b'z' => KeyPress::new(KEY_A + u16::from(c - b'a')),
        b'A'..=b'Z' => KeyPress::shifted(KEY_A + u16::from(c - b'A')),
        b'1'..=b'9' => KeyPress::new(KEY_1 + u16::from(c - b'1')),
        b'0' => KeyPress::new(KEY_0),
        b'\n' | b'\r' => KeyPress::new(KEY_ENTER),
        b' ' => KeyPress::new(KEY_SPACE),
        b'!' => KeyPress::shifted(KEY_1),
        b'@' => KeyPress::shifted(KEY_1 + 1),
        b'#' => KeyPress::shifted(KEY_1 + 2),
        b'$' => KeyPress::shifted(KEY_1 + 3),
        b'%' => KeyPress::shifted(KEY_1 + 4),
        b'^' => KeyPress::shifted(KEY_1 + 5),
        b'&' => KeyPress::shifted(KEY_1 + 6),
        b'*' => KeyPress::shifted(KEY_1 + 7),
        b'(' => KeyPress::shifted(KEY_1 + 8),
        b')' => KeyPress::shifted(KEY_0),
        b'-' => KeyPress::new(KEY_MINUS),
        b'_' => KeyPress::shifted(KEY_MINUS),
        b'=' => KeyPress::new(KEY_EQUAL),
        b'+' => KeyPress::shifted(KEY_EQUAL),
        b'[' => KeyPress::new(KEY_LEFT_BRACKET),
        b'{' => KeyPress::shifted(KEY_LEFT_BRACKET),
        b']' => KeyPress::new(KEY_RIGHT_BRACKET),
        b'}' => KeyPress::shifted(KEY_RIGHT_BRACKET),
        b'\\' => KeyPress::new(KEY_BACKSLASH),
        b'|' => KeyPress::shifted(KEY_BACKSLASH),
        b';' => KeyPress::new(KEY_SEMICOLON),
        b':' => KeyPress::shifted(KEY_SEMICOLON),
        b'\'' => KeyPress::new(KEY_QUOTE),
        b'"' => KeyPress::shifted(KEY_QUOTE),
        b'`' => KeyPress::new(KEY_GRAVE),
        b'~' => KeyPress::shifted(KEY_GRAVE),
        b',' => KeyPress::new(KEY_COMMA),
        b'<' => KeyPress::shifted(KEY_COMMA),
        b'.' => KeyPress::new(KEY_PERIOD),
        b'>' => KeyPress::shifted(KEY_PERIOD),
        b'/' => KeyPress::new(KEY_SLASH),
        b'?' => KeyPress::shifted(KEY_SLASH),
        _ => KeyPress::default(),
    }
}
