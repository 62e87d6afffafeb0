//! Scripted keyboard input.
//!
//! The boot loader reads the password prompt through two sources: the
//! console's line reader ([`SimpleTextInput`]) and, where the firmware has
//! one, a key state reader ([`KeyStateProtocol`]) it scans for held keys.
//! [`KeyboardHook`] swaps both for a [`ScriptedKeyboard`] that types a fixed
//! password, and puts the originals back on `unhook`.

use crate::config::Timing;
use ambassador::{delegatable_trait, Delegate};
use log::{debug, info};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use zeroize::Zeroize;

pub mod key_state;
pub mod keys;
pub mod text_input;
pub mod timer;

pub use self::key_state::{FixedKeyState, Phase};
pub use self::text_input::FixedTextInput;
use self::timer::Timer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("no key available")]
    NotReady,
    #[error("input device error")]
    DeviceError,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyStateError {
    /// The keys buffer cannot hold the pressed keys. Nothing is consumed.
    #[error("key buffer too small, {required} slots required")]
    BufferTooSmall { modifiers: u16, required: usize },
    #[error("key state device error")]
    DeviceError,
}

/// One console key stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Zeroize)]
pub struct InputKey {
    pub scan_code: u16,
    pub unicode_char: u16,
}

/// Result of a key state scan: held modifiers and how many entries of the
/// keys buffer were filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PressedKeys {
    pub modifiers: u16,
    pub count: usize,
}

impl PressedKeys {
    pub const NONE: Self = Self {
        modifiers: 0,
        count: 0,
    };
}

/// Poll-based console reader.
#[delegatable_trait]
pub trait SimpleTextInput {
    fn reset(&mut self, extended_verification: bool) -> Result<(), InputError>;
    /// Next key stroke, or `InputError::NotReady`.
    fn read_key_stroke(&mut self) -> Result<InputKey, InputError>;
    /// Whether waiting for a key would return immediately.
    fn key_available(&self) -> bool;
}

/// Reader of the currently held keys.
#[delegatable_trait]
pub trait KeyStateProtocol {
    fn read_key_state(&mut self, keys: &mut [u16]) -> Result<PressedKeys, KeyStateError>;
}

impl<K: SimpleTextInput + ?Sized> SimpleTextInput for Rc<RefCell<K>> {
    fn reset(&mut self, extended_verification: bool) -> Result<(), InputError> {
        self.borrow_mut().reset(extended_verification)
    }

    fn read_key_stroke(&mut self) -> Result<InputKey, InputError> {
        self.borrow_mut().read_key_stroke()
    }

    fn key_available(&self) -> bool {
        self.borrow().key_available()
    }
}

impl<K: KeyStateProtocol + ?Sized> KeyStateProtocol for Rc<RefCell<K>> {
    fn read_key_state(&mut self, keys: &mut [u16]) -> Result<PressedKeys, KeyStateError> {
        self.borrow_mut().read_key_state(keys)
    }
}

/// A console with nobody typing.
#[derive(Debug, Default)]
pub struct NullInput;

impl SimpleTextInput for NullInput {
    fn reset(&mut self, _extended_verification: bool) -> Result<(), InputError> {
        Ok(())
    }

    fn read_key_stroke(&mut self) -> Result<InputKey, InputError> {
        Err(InputError::NotReady)
    }

    fn key_available(&self) -> bool {
        false
    }
}

/// A keyboard with no keys held.
#[derive(Debug, Default)]
pub struct NullKeyState;

impl KeyStateProtocol for NullKeyState {
    fn read_key_state(&mut self, _keys: &mut [u16]) -> Result<PressedKeys, KeyStateError> {
        Ok(PressedKeys::NONE)
    }
}

/// Both scripted readers for one password. Each keeps its own copy and
/// cursor.
#[derive(Delegate)]
#[delegate(SimpleTextInput, target = "text")]
#[delegate(KeyStateProtocol, target = "key_state")]
pub struct ScriptedKeyboard<T: Timer> {
    text: FixedTextInput,
    key_state: FixedKeyState<T>,
}

impl<T: Timer> ScriptedKeyboard<T> {
    pub fn new(password: &[u8], timer: T, timing: Timing) -> Self {
        Self {
            text: FixedTextInput::new(password),
            key_state: FixedKeyState::new(password, timer).with_timing(timing),
        }
    }

    pub fn text(&self) -> &FixedTextInput {
        &self.text
    }

    pub fn key_state(&self) -> &FixedKeyState<T> {
        &self.key_state
    }

    /// Stops the timer and zeroes everything not yet typed.
    pub fn release(&mut self) {
        self.key_state.disarm();
        self.key_state.erase();
        self.text.erase();
    }
}

/// The input slots of the firmware system table.
pub struct SystemTable {
    pub con_in: Box<dyn SimpleTextInput>,
    pub key_state: Option<Box<dyn KeyStateProtocol>>,
}

impl SystemTable {
    pub fn new(
        con_in: Box<dyn SimpleTextInput>,
        key_state: Option<Box<dyn KeyStateProtocol>>,
    ) -> Self {
        Self { con_in, key_state }
    }
}

/// Installs a scripted keyboard into a [`SystemTable`], remembering what it
/// replaced.
pub struct KeyboardHook<T: Timer> {
    scripted: Option<Rc<RefCell<ScriptedKeyboard<T>>>>,
    saved_con_in: Option<Box<dyn SimpleTextInput>>,
    saved_key_state: Option<Box<dyn KeyStateProtocol>>,
}

impl<T: Timer + 'static> Default for KeyboardHook<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Timer + 'static> KeyboardHook<T> {
    pub fn new() -> Self {
        Self {
            scripted: None,
            saved_con_in: None,
            saved_key_state: None,
        }
    }

    /// Replaces the console reader, and the key state reader if the table
    /// has one, with readers typing `password`. An existing hook is removed
    /// first.
    pub fn install(&mut self, table: &mut SystemTable, password: &[u8], timer: T, timing: Timing) {
        self.unhook(table);

        let keyboard = Rc::new(RefCell::new(ScriptedKeyboard::new(password, timer, timing)));
        let console: Box<dyn SimpleTextInput> = Box::new(keyboard.clone());
        self.saved_con_in = Some(std::mem::replace(&mut table.con_in, console));
        match table.key_state.take() {
            Some(original) => {
                self.saved_key_state = Some(original);
                table.key_state = Some(Box::new(keyboard.clone()));
            }
            None => debug!("no key state reader to hook"),
        }
        self.scripted = Some(keyboard);
        info!("keyboard hooked");
    }

    /// Restores the original readers and zeroes whatever was not typed.
    pub fn unhook(&mut self, table: &mut SystemTable) {
        if let Some(original) = self.saved_key_state.take() {
            table.key_state = Some(original);
        }
        if let Some(original) = self.saved_con_in.take() {
            table.con_in = original;
        }
        if let Some(keyboard) = self.scripted.take() {
            keyboard.borrow_mut().release();
            info!("keyboard unhooked");
        }
    }

    pub fn is_hooked(&self) -> bool {
        self.scripted.is_some()
    }

    pub fn scripted(&self) -> Option<Rc<RefCell<ScriptedKeyboard<T>>>> {
        self.scripted.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::keys::{KeyPress, KEY_A, VERBOSE_BOOT};
    use super::timer::ManualTimer;
    use super::*;
    use eyre::Result;

    /// An original console that always reports the same marker key.
    struct Marker(u16);

    impl SimpleTextInput for Marker {
        fn reset(&mut self, _: bool) -> Result<(), InputError> {
            Ok(())
        }

        fn read_key_stroke(&mut self) -> Result<InputKey, InputError> {
            Ok(InputKey {
                scan_code: self.0,
                unicode_char: 0,
            })
        }

        fn key_available(&self) -> bool {
            true
        }
    }

    struct HeldMarker(u16);

    impl KeyStateProtocol for HeldMarker {
        fn read_key_state(&mut self, keys: &mut [u16]) -> Result<PressedKeys, KeyStateError> {
            keys[0] = self.0;
            Ok(PressedKeys {
                modifiers: 0,
                count: 1,
            })
        }
    }

    fn table() -> SystemTable {
        SystemTable::new(Box::new(Marker(0x17)), Some(Box::new(HeldMarker(0x42))))
    }

    fn held_key(table: &mut SystemTable) -> Result<u16> {
        let mut keys = [0u16; 4];
        let reader = table
            .key_state
            .as_mut()
            .ok_or_else(|| eyre::eyre!("no key state"))?;
        reader.read_key_state(&mut keys)?;
        Ok(keys[0])
    }

    #[test]
    fn install_replaces_both_readers() -> Result<()> {
        let mut table = table();
        let mut hook = KeyboardHook::new();
        hook.install(&mut table, b"a", ManualTimer::new(), Timing::default());
        assert!(hook.is_hooked());

        assert_eq!(held_key(&mut table)?, VERBOSE_BOOT.key_code);
        assert!(table.con_in.key_available());
        assert_eq!(table.con_in.read_key_stroke()?.unicode_char, u16::from(b'a'));
        assert_eq!(table.con_in.read_key_stroke(), Err(InputError::NotReady));
        Ok(())
    }

    #[test]
    fn unhook_restores_originals() -> Result<()> {
        let mut table = table();
        let mut hook = KeyboardHook::new();
        hook.install(&mut table, b"secret", ManualTimer::new(), Timing::default());
        hook.unhook(&mut table);
        assert!(!hook.is_hooked());
        assert_eq!(table.con_in.read_key_stroke()?.scan_code, 0x17);
        assert_eq!(held_key(&mut table)?, 0x42);

        // A second unhook is harmless.
        hook.unhook(&mut table);
        assert_eq!(table.con_in.read_key_stroke()?.scan_code, 0x17);
        Ok(())
    }

    #[test]
    fn unhook_erases_pending_keys() -> Result<()> {
        let mut table = table();
        let timer = ManualTimer::new();
        let mut hook = KeyboardHook::new();
        hook.install(&mut table, b"hunter2", timer.clone(), Timing::default());

        held_key(&mut table)?;
        timer.advance(std::time::Duration::from_secs(3));
        held_key(&mut table)?;
        table.con_in.read_key_stroke()?;
        assert!(timer.deadline().is_some());

        let scripted = hook.scripted().ok_or_else(|| eyre::eyre!("not hooked"))?;
        hook.unhook(&mut table);

        let keyboard = scripted.borrow();
        assert!(keyboard
            .key_state()
            .items()
            .iter()
            .all(|k| *k == KeyPress::default()));
        assert!(keyboard
            .text()
            .items()
            .iter()
            .all(|k| *k == InputKey::default()));
        assert_eq!(keyboard.key_state().remaining(), 0);
        assert_eq!(timer.deadline(), None);
        Ok(())
    }

    #[test]
    fn missing_key_state_is_left_alone() -> Result<()> {
        let mut table = SystemTable::new(Box::new(Marker(0x17)), None);
        let mut hook = KeyboardHook::new();
        hook.install(&mut table, b"x", ManualTimer::new(), Timing::default());
        assert!(table.key_state.is_none());
        assert_eq!(table.con_in.read_key_stroke()?.unicode_char, u16::from(b'x'));
        hook.unhook(&mut table);
        assert!(table.key_state.is_none());
        assert_eq!(table.con_in.read_key_stroke()?.scan_code, 0x17);
        Ok(())
    }

    #[test]
    fn reinstall_keeps_first_originals() -> Result<()> {
        let mut table = table();
        let mut hook = KeyboardHook::new();
        hook.install(&mut table, b"one", ManualTimer::new(), Timing::default());
        hook.install(&mut table, b"two", ManualTimer::new(), Timing::default());
        assert_eq!(table.con_in.read_key_stroke()?.unicode_char, u16::from(b't'));
        hook.unhook(&mut table);
        assert_eq!(table.con_in.read_key_stroke()?.scan_code, 0x17);
        assert_eq!(held_key(&mut table)?, 0x42);
        Ok(())
    }

    #[test]
    fn scripted_keyboard_serves_both_traits() -> Result<()> {
        let timer = ManualTimer::new();
        let mut keyboard = ScriptedKeyboard::new(b"a", timer.clone(), Timing::default());
        let mut keys = [0u16; 1];
        assert_eq!(
            keyboard.read_key_state(&mut keys)?,
            PressedKeys {
                modifiers: VERBOSE_BOOT.modifiers,
                count: 1
            }
        );
        assert_eq!(keyboard.read_key_stroke()?.unicode_char, u16::from(b'a'));
        assert!(!keyboard.key_available());

        timer.advance(std::time::Duration::from_secs(3));
        keyboard.read_key_state(&mut keys)?;
        assert_eq!(keys[0], KEY_A);
        Ok(())
    }

    #[test]
    fn null_devices() -> Result<()> {
        let mut input = NullInput;
        input.reset(false)?;
        assert_eq!(input.read_key_stroke(), Err(InputError::NotReady));
        assert!(!input.key_available());
        let mut keys = [0u16; 2];
        assert_eq!(NullKeyState.read_key_state(&mut keys)?, PressedKeys::NONE);
        Ok(())
    }
}
