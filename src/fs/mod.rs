//! File-handle interface of the boot firmware, modelled as trait objects.
//!
//! [`FileProtocol`] carries the ten per-handle operations plus `open`;
//! [`SimpleFileSystem`] hands out the root directory of a volume. The
//! [`hook`] module decorates both.

use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

pub mod hook;
#[cfg(test)]
pub mod memory;

pub const SEPARATOR: char = '\\';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileError {
    #[error("file not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("media is write protected")]
    WriteProtected,
    #[error("device error")]
    DeviceError,
    #[error("volume corrupted")]
    VolumeCorrupted,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("unsupported")]
    Unsupported,
    #[error("out of resources")]
    OutOfResources,
}

pub type Result<T, E = FileError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode(u64);

impl OpenMode {
    pub const READ: Self = Self(0x1);
    pub const WRITE: Self = Self(0x2);
    pub const CREATE: Self = Self(0x8000_0000_0000_0000);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenMode {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes(u64);

impl Attributes {
    pub const NONE: Self = Self(0);
    pub const READ_ONLY: Self = Self(0x01);
    pub const HIDDEN: Self = Self(0x02);
    pub const SYSTEM: Self = Self(0x04);
    pub const DIRECTORY: Self = Self(0x10);
    pub const ARCHIVE: Self = Self(0x20);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Attributes {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Selects which metadata record `get_info` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoType {
    File,
    FileSystem,
    VolumeLabel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file_size: u64,
    pub physical_size: u64,
    pub attributes: Attributes,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemInfo {
    pub read_only: bool,
    pub volume_size: u64,
    pub free_space: u64,
    pub block_size: u32,
    pub volume_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Info {
    File(FileInfo),
    FileSystem(FileSystemInfo),
    VolumeLabel(String),
}

impl Info {
    pub fn info_type(&self) -> InfoType {
        match self {
            Info::File(_) => InfoType::File,
            Info::FileSystem(_) => InfoType::FileSystem,
            Info::VolumeLabel(_) => InfoType::VolumeLabel,
        }
    }
}

/// An open file or directory.
///
/// `read` returns fewer bytes than requested only at end of data. Positions
/// are absolute byte offsets; `u64::MAX` passed to `set_position` seeks to the
/// end of a file.
pub trait FileProtocol {
    /// Opens `name` relative to this handle. `name` may contain `\`, `.` and
    /// `..` modifiers.
    fn open(
        &mut self,
        name: &str,
        mode: OpenMode,
        attributes: Attributes,
    ) -> Result<Box<dyn FileProtocol>>;
    fn close(self: Box<Self>) -> Result<()>;
    fn delete(self: Box<Self>) -> Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn get_position(&mut self) -> Result<u64>;
    fn set_position(&mut self, position: u64) -> Result<()>;
    fn get_info(&mut self, info_type: InfoType) -> Result<Info>;
    fn set_info(&mut self, info: &Info) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub trait SimpleFileSystem {
    fn open_volume(&mut self) -> Result<Box<dyn FileProtocol>>;
}

/// A firmware device handle. Only some devices carry a file system.
#[derive(Default)]
pub struct Device {
    pub file_system: Option<Box<dyn SimpleFileSystem>>,
}

impl Device {
    pub fn new(file_system: Box<dyn SimpleFileSystem>) -> Self {
        Self {
            file_system: Some(file_system),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("file_system", &self.file_system.is_some())
            .finish()
    }
}

/// Resolves `name` against `directory`.
///
/// A leading separator in `name` restarts from the root, empty and `.`
/// segments are dropped and `..` removes the previous component (never past
/// the root). The result always starts with a separator.
pub fn join_path(directory: &str, name: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    let base = if name.starts_with(SEPARATOR) {
        ""
    } else {
        directory
    };
    for segment in base.split(SEPARATOR).chain(name.split(SEPARATOR)) {
        match segment {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            component => components.push(component),
        }
    }
    let mut path = String::with_capacity(directory.len() + name.len() + 1);
    path.push(SEPARATOR);
    path.push_str(&components.join("\\"));
    path
}

/// Final component of a path, i.e. everything after the last separator.
pub fn file_name(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}

/// Reads the whole file, sized by its `File` info record.
pub fn read_to_end(file: &mut dyn FileProtocol) -> Result<Vec<u8>> {
    let size = match file.get_info(InfoType::File)? {
        Info::File(info) => info.file_size,
        _ => return Err(FileError::DeviceError),
    };
    let size = usize::try_from(size).map_err(|_| FileError::OutOfResources)?;
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    buf.truncate(filled);
    Ok(buf)
}
