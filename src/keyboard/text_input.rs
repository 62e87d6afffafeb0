use super::{InputError, InputKey, SimpleTextInput};
use zeroize::{Zeroize, Zeroizing};

/// Console reader that hands out a fixed byte sequence, one character per
/// read, with no pacing.
pub struct FixedTextInput {
    items: Zeroizing<Vec<InputKey>>,
    cursor: usize,
}

impl FixedTextInput {
    pub fn new(data: &[u8]) -> Self {
        Self {
            items: Zeroizing::new(
                data.iter()
                    .map(|&c| InputKey {
                        scan_code: 0,
                        unicode_char: u16::from(c),
                    })
                    .collect(),
            ),
            cursor: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len() - self.cursor
    }

    pub fn items(&self) -> &[InputKey] {
        &self.items
    }

    /// Zeroes the characters not yet read.
    pub fn erase(&mut self) {
        self.items[self.cursor..]
            .iter_mut()
            .for_each(Zeroize::zeroize);
        self.cursor = self.items.len();
    }
}

impl SimpleTextInput for FixedTextInput {
    fn reset(&mut self, _extended_verification: bool) -> Result<(), InputError> {
        Ok(())
    }

    fn read_key_stroke(&mut self) -> Result<InputKey, InputError> {
        let slot = self.items.get_mut(self.cursor).ok_or(InputError::NotReady)?;
        let key = *slot;
        slot.zeroize();
        self.cursor += 1;
        Ok(key)
    }

    fn key_available(&self) -> bool {
        self.cursor < self.items.len()
    }
}

impl Drop for FixedTextInput {
    fn drop(&mut self) {
        self.erase();
    }
}
