//! Escrow file substitution on the recovery volume.
//!
//! The boot loader reads `EncryptedRoot.plist.wipekey`, decrypts it with the
//! volume's wide-block key and offers one password prompt per `CryptoUsers`
//! entry. When the file is opened through a hooked volume it is decrypted,
//! cut down to the disk password entry, re-encrypted and served from memory
//! for the lifetime of that handle. Boot loader resources (`*.efires`) are
//! swapped for same-named files from the unlock volume the same way.
//!
//! Any failure leaves the handle untouched so the boot loader sees the
//! original file.

use crate::config::{Config, ESCROW_FILE_NAME, RESOURCE_EXTENSION};
use crate::crypto::xts::tweak_from_sequence;
use crate::crypto::{CipherError, Tweak, Xts};
use crate::fs::hook::{hook_simple_file_system, Call, HandleId, HookTable, Opened};
use crate::fs::{
    self, file_name, join_path, read_to_end, Attributes, Device, FileError, FileProtocol, Info,
    InfoType, OpenMode, SimpleFileSystem,
};
use crate::plist::{self, USER_TYPE_DISK};
use crate::volume::{KeySource, VolumeError};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("escrow file does not decrypt to an XML property list")]
    NotXml,
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    File(#[from] FileError),
}

pub type Result<T, E = EscrowError> = core::result::Result<T, E>;

/// Decrypts `buf`, drops every `CryptoUsers` entry but the first one of
/// `keep_user_type`, and encrypts the result back into the front of `buf`.
///
/// Returns the new length. Everything past it is zeroed, and on error the
/// whole buffer is, since it may hold plaintext by then.
pub fn rewrite_escrow(xts: &Xts, buf: &mut [u8], keep_user_type: u32) -> Result<usize> {
    let tweak = tweak_from_sequence(0);
    xts.decrypt(&tweak, buf)?;
    match filter_and_encrypt(xts, &tweak, buf, keep_user_type) {
        Ok(len) => {
            buf[len..].zeroize();
            Ok(len)
        }
        Err(e) => {
            buf.zeroize();
            Err(e)
        }
    }
}

fn filter_and_encrypt(xts: &Xts, tweak: &Tweak, buf: &mut [u8], keep_user_type: u32) -> Result<usize> {
    if !plist::is_xml(buf) {
        return Err(EscrowError::NotXml);
    }
    let len = plist::filter_crypto_users_in_place(buf, keep_user_type);
    xts.encrypt(tweak, &mut buf[..len])?;
    Ok(len)
}

/// Hex SHA-256 of a buffer, for identifying substituted content in logs.
pub fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// In-memory content standing in for an open file.
struct SyntheticFile {
    data: Zeroizing<Vec<u8>>,
    offset: u64,
}

impl SyntheticFile {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Synthetic files by the handle they replace.
#[derive(Default)]
pub struct SyntheticFiles {
    files: Mutex<HashMap<HandleId, SyntheticFile>>,
}

impl SyntheticFiles {
    fn lock(&self) -> MutexGuard<'_, HashMap<HandleId, SyntheticFile>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, id: HandleId, data: Zeroizing<Vec<u8>>) {
        self.lock().insert(id, SyntheticFile { data, offset: 0 });
    }

    /// Drops the record for `id`; its content is zeroed on the way out.
    pub fn remove(&self, id: HandleId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self, id: HandleId) -> Option<u64> {
        self.lock().get(&id).map(SyntheticFile::size)
    }

    /// Copies from the current offset and advances it. `None` when `id` has
    /// no record.
    pub fn read(&self, id: HandleId, buf: &mut [u8]) -> Option<usize> {
        let mut files = self.lock();
        let file = files.get_mut(&id)?;
        let start = usize::try_from(file.offset.min(file.size())).unwrap_or(file.data.len());
        let n = buf.len().min(file.data.len() - start);
        buf[..n].copy_from_slice(&file.data[start..start + n]);
        file.offset += n as u64;
        Some(n)
    }

    pub fn position(&self, id: HandleId) -> Option<u64> {
        self.lock().get(&id).map(|file| file.offset)
    }

    /// Seeks, clamping to the end of the content.
    pub fn set_position(&self, id: HandleId, position: u64) -> Option<()> {
        let mut files = self.lock();
        let file = files.get_mut(&id)?;
        file.offset = position.min(file.size());
        Some(())
    }
}

/// Loads replacement files by bare name.
pub trait ResourceLoader {
    fn load(&self, name: &str) -> fs::Result<Vec<u8>>;
}

/// Serves resources from a directory of another volume, typically the one the
/// unlock tool itself was loaded from.
pub struct DirectoryResources {
    volume: Mutex<Box<dyn SimpleFileSystem>>,
    directory: String,
}

impl DirectoryResources {
    pub fn new(volume: Box<dyn SimpleFileSystem>, directory: &str) -> Self {
        Self {
            volume: Mutex::new(volume),
            directory: join_path("", directory),
        }
    }
}

impl ResourceLoader for DirectoryResources {
    fn load(&self, name: &str) -> fs::Result<Vec<u8>> {
        let mut root = self
            .volume
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .open_volume()?;
        let mut file = root.open(
            &join_path(&self.directory, name),
            OpenMode::READ,
            Attributes::NONE,
        )?;
        let data = read_to_end(file.as_mut());
        file.close()?;
        root.close()?;
        data
    }
}

/// Hook user data: where keys and replacements come from, and the synthetic
/// files currently being served.
pub struct EscrowHooks {
    key_source: Box<dyn KeySource>,
    resources: Option<Box<dyn ResourceLoader>>,
    files: SyntheticFiles,
    escrow_file_name: String,
    resource_extension: String,
    keep_user_type: u32,
}

impl EscrowHooks {
    pub fn new(key_source: Box<dyn KeySource>) -> Self {
        Self {
            key_source,
            resources: None,
            files: SyntheticFiles::default(),
            escrow_file_name: ESCROW_FILE_NAME.to_owned(),
            resource_extension: RESOURCE_EXTENSION.to_owned(),
            keep_user_type: USER_TYPE_DISK,
        }
    }

    pub fn with_config(self, config: &Config) -> Self {
        Self {
            escrow_file_name: config.escrow_file_name.clone(),
            resource_extension: config.resource_extension.clone(),
            keep_user_type: config.keep_user_type,
            ..self
        }
    }

    pub fn with_resources(self, resources: Box<dyn ResourceLoader>) -> Self {
        Self {
            resources: Some(resources),
            ..self
        }
    }

    pub fn files(&self) -> &SyntheticFiles {
        &self.files
    }

    fn is_escrow_file(&self, path: &str) -> bool {
        path.ends_with(&self.escrow_file_name)
    }

    fn is_resource(&self, path: &str) -> bool {
        let name = file_name(path);
        name.len() > self.resource_extension.len() && name.ends_with(&self.resource_extension)
    }

    /// Reads the escrow file through `original` and registers its rewrite
    /// under `id`.
    #[tracing::instrument(skip(self, original))]
    pub fn substitute_escrow(&self, original: &mut dyn FileProtocol, id: HandleId) -> Result<u64> {
        let mut data = Zeroizing::new(read_to_end(original)?);
        let original_size = data.len();
        let xts = self.key_source.wide_block_key()?;
        let len = rewrite_escrow(&xts, &mut data, self.keep_user_type)?;
        data.truncate(len);
        info!(
            "{}: {} -> {} bytes, sha256 {}",
            self.escrow_file_name,
            original_size,
            len,
            digest(&data)
        );
        self.files.insert(id, data);
        Ok(len as u64)
    }

    /// Registers the same-named file from the resource loader under `id`.
    #[tracing::instrument(skip(self))]
    pub fn substitute_resource(&self, path: &str, id: HandleId) -> Result<u64> {
        let resources = self.resources.as_ref().ok_or(FileError::NotFound)?;
        let name = file_name(path);
        let data = resources.load(name)?;
        let len = data.len() as u64;
        debug!("{} replaced by {} bytes, sha256 {}", path, len, digest(&data));
        self.files.insert(id, Zeroizing::new(data));
        Ok(len)
    }
}

fn opened(original: &mut dyn FileProtocol, opened: Opened<'_>, hooks: &Arc<EscrowHooks>) -> bool {
    if hooks.is_escrow_file(opened.path) {
        match hooks.substitute_escrow(original, opened.id) {
            Ok(_) => true,
            Err(e) => {
                warn!("Processing of {} failed: {}", hooks.escrow_file_name, e);
                if let Err(e) = original.set_position(0) {
                    debug!("rewind of {} failed: {}", opened.path, e);
                }
                false
            }
        }
    } else if hooks.is_resource(opened.path) {
        match hooks.substitute_resource(opened.path, opened.id) {
            Ok(_) => true,
            Err(e) => {
                debug!("keeping original {}: {}", opened.path, e);
                false
            }
        }
    } else {
        false
    }
}

fn close(original: Box<dyn FileProtocol>, id: HandleId, hooks: &Arc<EscrowHooks>) -> fs::Result<()> {
    hooks.files.remove(id);
    original.close()
}

fn delete(original: Box<dyn FileProtocol>, id: HandleId, hooks: &Arc<EscrowHooks>) -> fs::Result<()> {
    hooks.files.remove(id);
    original.delete()
}

fn read(call: Call<'_, Arc<EscrowHooks>>, buf: &mut [u8]) -> fs::Result<usize> {
    match call.data.files.read(call.id, buf) {
        Some(n) => Ok(n),
        None => call.original.read(buf),
    }
}

fn write(_: Call<'_, Arc<EscrowHooks>>, _: &[u8]) -> fs::Result<usize> {
    Err(FileError::WriteProtected)
}

fn get_position(call: Call<'_, Arc<EscrowHooks>>) -> fs::Result<u64> {
    match call.data.files.position(call.id) {
        Some(position) => Ok(position),
        None => call.original.get_position(),
    }
}

fn set_position(call: Call<'_, Arc<EscrowHooks>>, position: u64) -> fs::Result<()> {
    match call.data.files.set_position(call.id, position) {
        Some(()) => Ok(()),
        None => call.original.set_position(position),
    }
}

fn get_info(call: Call<'_, Arc<EscrowHooks>>, info_type: InfoType) -> fs::Result<Info> {
    let mut info = call.original.get_info(info_type)?;
    if let (Info::File(file), Some(size)) = (&mut info, call.data.files.size(call.id)) {
        file.file_size = size;
    }
    Ok(info)
}

fn set_info(_: Call<'_, Arc<EscrowHooks>>, _: &Info) -> fs::Result<()> {
    Err(FileError::WriteProtected)
}

/// Hooks serving synthetic files read-only. Flush is left to the original.
pub fn hook_table() -> HookTable<Arc<EscrowHooks>> {
    HookTable {
        opened: Some(opened),
        close: Some(close),
        delete: Some(delete),
        read: Some(read),
        write: Some(write),
        get_position: Some(get_position),
        set_position: Some(set_position),
        get_info: Some(get_info),
        set_info: Some(set_info),
        flush: None,
    }
}

/// Installs the escrow hooks on the boot volume's file system.
pub fn hook_volume(device: &mut Device, hooks: Arc<EscrowHooks>) -> fs::Result<()> {
    hook_simple_file_system(device, hook_table(), hooks).map_err(|e| {
        warn!("unable to hook boot volume: {}", e);
        e
    })?;
    info!("boot volume hooked");
    Ok(())
}
