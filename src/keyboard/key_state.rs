use super::keys::{ascii_to_key, KeyPress, VERBOSE_BOOT};
use super::timer::Timer;
use super::{KeyStateError, KeyStateProtocol, PressedKeys};
use crate::config::Timing;
use log::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing scanned yet. The boot loader's first scan looks for boot
    /// option hot-keys.
    AwaitingFirstScan,
    Idle,
    KeyDown,
    KeyUp,
}

/// Virtual keyboard replaying a password one key at a time.
///
/// Each key is reported as held for `key_down`, then released for `key_up`
/// before the next one may be picked up by a scan. Consumed keys are zeroed
/// in the backing buffer as they are taken.
pub struct FixedKeyState<T: Timer> {
    items: Zeroizing<Vec<KeyPress>>,
    cursor: usize,
    phase: Phase,
    current: KeyPress,
    timer: T,
    timing: Timing,
}

impl<T: Timer> FixedKeyState<T> {
    pub fn new(password: &[u8], timer: T) -> Self {
        Self {
            items: Zeroizing::new(password.iter().copied().map(ascii_to_key).collect()),
            cursor: 0,
            phase: Phase::AwaitingFirstScan,
            current: KeyPress::default(),
            timer,
            timing: Timing::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Key presses not yet taken by a scan.
    pub fn remaining(&self) -> usize {
        self.items.len() - self.cursor
    }

    /// True once every key has been pressed and released.
    pub fn is_finished(&self) -> bool {
        self.remaining() == 0 && self.phase == Phase::Idle
    }

    pub fn items(&self) -> &[KeyPress] {
        &self.items
    }

    /// Zeroes the key presses not yet taken.
    pub fn erase(&mut self) {
        self.items[self.cursor..]
            .iter_mut()
            .for_each(Zeroize::zeroize);
        self.cursor = self.items.len();
        self.current.zeroize();
    }

    /// Cancels the pending timer and stops reporting keys.
    pub fn disarm(&mut self) {
        self.timer.cancel();
        self.current = KeyPress::default();
        self.phase = Phase::Idle;
    }

    /// Timer expiry: release a held key, or end the release interval.
    pub fn on_timer(&mut self) {
        self.current = KeyPress::default();
        self.phase = match self.phase {
            Phase::KeyDown => self.arm(self.timing.key_up(), Phase::KeyUp),
            _ => Phase::Idle,
        };
    }

    fn arm(&mut self, after: std::time::Duration, next: Phase) -> Phase {
        match self.timer.arm(after) {
            Ok(()) => next,
            Err(e) => {
                warn!("key press timer: {}", e);
                Phase::Idle
            }
        }
    }

    fn deliver_timer(&mut self) {
        while self.timer.expired() {
            self.on_timer();
        }
    }

    fn first_scan(&mut self, keys: &mut [u16]) -> Result<PressedKeys, KeyStateError> {
        let Some(slot) = keys.first_mut() else {
            return Err(KeyStateError::BufferTooSmall {
                modifiers: VERBOSE_BOOT.modifiers,
                required: 1,
            });
        };
        *slot = VERBOSE_BOOT.key_code;
        self.phase = self.arm(self.timing.first_scan_ignore(), Phase::KeyUp);
        debug!("first scan answered with verbose boot hot-key");
        Ok(PressedKeys {
            modifiers: VERBOSE_BOOT.modifiers,
            count: 1,
        })
    }
}

impl<T: Timer> KeyStateProtocol for FixedKeyState<T> {
    fn read_key_state(&mut self, keys: &mut [u16]) -> Result<PressedKeys, KeyStateError> {
        self.deliver_timer();
        if self.phase == Phase::AwaitingFirstScan {
            return self.first_scan(keys);
        }

        let available = match self.phase {
            Phase::KeyDown => true,
            Phase::Idle => self.cursor < self.items.len(),
            _ => false,
        };
        if !available {
            return Ok(PressedKeys::NONE);
        }

        if keys.is_empty() {
            let next = match self.phase {
                Phase::KeyDown => self.current,
                _ => self.items[self.cursor],
            };
            return Err(KeyStateError::BufferTooSmall {
                modifiers: next.modifiers,
                required: 1,
            });
        }

        if self.phase != Phase::KeyDown {
            self.current = self.items[self.cursor];
            self.items[self.cursor].zeroize();
            self.cursor += 1;
            self.phase = self.arm(self.timing.key_down(), Phase::KeyDown);
        }
        keys[0] = self.current.key_code;
        Ok(PressedKeys {
            modifiers: self.current.modifiers,
            count: 1,
        })
    }
}

impl<T: Timer> Drop for FixedKeyState<T> {
    fn drop(&mut self) {
        self.disarm();
        self.erase();
    }
}
