use thiserror::Error;

pub mod aes;
pub mod xts;

pub use self::aes::{Aes, BLOCK_SIZE};
pub use self::xts::{Tweak, Xts};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CipherError {
    #[error("invalid AES key length {0} bytes, expected 16, 24 or 32")]
    InvalidKeyLength(usize),
    #[error("invalid XTS key length {0} bytes, expected 32 or 64")]
    InvalidXtsKeyLength(usize),
    #[error("data unit of {0} bytes is shorter than one block")]
    DataTooShort(usize),
}

pub type Result<T, E = CipherError> = core::result::Result<T, E>;
