//! CoreStorage volume header and the escrow file key derived from it.
//!
//! Sector 0 of the encrypted CoreStorage partition carries the volume's
//! 128 bit data key and its physical volume identifier. Together they form
//! the XTS-AES-128 key that protects `EncryptedRoot.plist.wipekey` on the
//! paired recovery partition.

use crate::crypto::{CipherError, Xts};
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const SECTOR_SIZE: usize = 512;

const VOLUME_SIZE_OFFSET: usize = 64;
const SIGNATURE_OFFSET: usize = 88;
const SIGNATURE: &[u8; 2] = b"CS";
const BLOCK_SIZE_OFFSET: usize = 96;
const KEY_SIZE_OFFSET: usize = 168;
const ENCRYPTION_METHOD_OFFSET: usize = 172;
const KEY_DATA_OFFSET: usize = 176;
const KEY_DATA_LEN: usize = 128;
const PHYSICAL_VOLUME_OFFSET: usize = 304;
const VOLUME_GROUP_OFFSET: usize = 320;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("volume header is {0} bytes, expected at least {SECTOR_SIZE}")]
    ShortSector(usize),
    #[error("missing CoreStorage signature in volume header")]
    NotCoreStorage,
    #[error("unsupported volume key size of {0} bytes")]
    UnsupportedKeySize(u32),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = VolumeError> = core::result::Result<T, E>;

/// Raw sector access to a partition.
pub trait SectorReader {
    fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> Result<()>;
}

impl<R: Read + Seek> SectorReader for R {
    fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))?;
        self.read_exact(buf)?;
        Ok(())
    }
}

/// Supplies the wide-block key for a volume's escrow file.
pub trait KeySource {
    fn wide_block_key(&self) -> Result<Xts>;
}

pub struct CoreStorageHeader {
    pub volume_size: u64,
    pub block_size: u32,
    pub encryption_method: u32,
    pub physical_volume: Uuid,
    pub volume_group: Uuid,
    key: Zeroizing<Vec<u8>>,
}

impl CoreStorageHeader {
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < SECTOR_SIZE {
            return Err(VolumeError::ShortSector(sector.len()));
        }
        if &sector[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] != SIGNATURE {
            return Err(VolumeError::NotCoreStorage);
        }
        let key_size = read_u32(sector, KEY_SIZE_OFFSET);
        if key_size != 16 && key_size != 32 {
            return Err(VolumeError::UnsupportedKeySize(key_size));
        }
        let key = &sector[KEY_DATA_OFFSET..KEY_DATA_OFFSET + KEY_DATA_LEN];
        Ok(Self {
            volume_size: read_u64(sector, VOLUME_SIZE_OFFSET),
            block_size: read_u32(sector, BLOCK_SIZE_OFFSET),
            encryption_method: read_u32(sector, ENCRYPTION_METHOD_OFFSET),
            physical_volume: read_uuid(sector, PHYSICAL_VOLUME_OFFSET),
            volume_group: read_uuid(sector, VOLUME_GROUP_OFFSET),
            key: Zeroizing::new(key[..key_size as usize].to_vec()),
        })
    }

    pub fn key_size(&self) -> usize {
        self.key.len()
    }

    /// The data key with the physical volume identifier appended as tweak key.
    pub fn wide_block_key(&self) -> Result<Xts> {
        let mut key = Zeroizing::new(Vec::with_capacity(self.key.len() * 2));
        key.extend_from_slice(&self.key);
        key.extend_from_slice(self.physical_volume.as_bytes());
        if self.key.len() > 16 {
            key.extend_from_slice(self.volume_group.as_bytes());
        }
        Ok(Xts::new(&key)?)
    }
}

impl fmt::Debug for CoreStorageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreStorageHeader")
            .field("volume_size", &self.volume_size)
            .field("block_size", &self.block_size)
            .field("encryption_method", &self.encryption_method)
            .field("physical_volume", &self.physical_volume)
            .field("volume_group", &self.volume_group)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn read_u32(sector: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&sector[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(sector: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&sector[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_uuid(sector: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&sector[offset..offset + 16]);
    Uuid::from_bytes(bytes)
}

/// Reads the key from sector 0 of the paired CoreStorage partition each time
/// it is asked for one.
pub struct SectorKeySource<R> {
    reader: Mutex<R>,
}

impl<R: SectorReader> SectorKeySource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }

    pub fn header(&self) -> Result<CoreStorageHeader> {
        let mut sector = Zeroizing::new([0u8; SECTOR_SIZE]);
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .read_sector(0, &mut sector[..])?;
        CoreStorageHeader::parse(&sector[..])
    }
}

impl<R: SectorReader> KeySource for SectorKeySource<R> {
    fn wide_block_key(&self) -> Result<Xts> {
        self.header()?.wide_block_key()
    }
}

/// A wide-block key known up front, e.g. given on the command line.
pub struct StaticKeySource {
    key: Zeroizing<Vec<u8>>,
}

impl StaticKeySource {
    pub fn new(key: Vec<u8>) -> Result<Self> {
        Xts::new(&key)?;
        Ok(Self {
            key: Zeroizing::new(key),
        })
    }
}

impl KeySource for StaticKeySource {
    fn wide_block_key(&self) -> Result<Xts> {
        Ok(Xts::new(&self.key)?)
    }
}
