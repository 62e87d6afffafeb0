//! Unattended FileVault 2 unlock for the pre-boot environment.
//!
//! Two interceptions cooperate to get a Mac with an escrowed disk password
//! through the FileVault prompt without a keyboard:
//!
//! - [`escrow`] hooks the recovery volume so that the boot loader's
//!   `EncryptedRoot.plist.wipekey` only offers the disk password entry.
//! - [`keyboard`] replaces the console input sources with a scripted keyboard
//!   that types that password.
//!
//! The binary exposes the same code paths for offline inspection:
//! ```bash
//! fv2-unlock header disk0s2.img
//! fv2-unlock users --volume-header disk0s2.img EncryptedRoot.plist.wipekey
//! fv2-unlock replay password.txt
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod escrow;
pub mod fs;
pub mod keyboard;
pub mod plist;
pub mod volume;
