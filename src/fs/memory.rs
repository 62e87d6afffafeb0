//! Volatile file system backed by a path map.
//!
//! Stands in for firmware volumes when exercising the interception layer and
//! the escrow pipeline off the target.

use super::{
    file_name, join_path, Attributes, FileError, FileInfo, FileProtocol, FileSystemInfo, Info,
    InfoType, OpenMode, Result, SimpleFileSystem, SEPARATOR,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

const BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone)]
enum Node {
    Directory,
    File { data: Vec<u8>, attributes: Attributes },
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    read_only: bool,
    label: String,
}

#[derive(Debug, Clone)]
pub struct MemoryFileSystem {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(SEPARATOR.to_string(), Node::Directory);
        Self {
            tree: Arc::new(Mutex::new(Tree {
                nodes,
                read_only: false,
                label: String::new(),
            })),
        }
    }

    pub fn read_only(self, read_only: bool) -> Self {
        self.lock().read_only = read_only;
        self
    }

    pub fn with_label(self, label: &str) -> Self {
        self.lock().label = label.to_owned();
        self
    }

    /// Adds a file (and any missing parent directories) at `path`.
    pub fn with_file(self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert_file(path, data.into());
        self
    }

    pub fn insert_file(&self, path: &str, data: Vec<u8>) {
        let path = join_path("", path);
        let mut tree = self.lock();
        let mut parent = String::new();
        let components: Vec<&str> = path.split(SEPARATOR).filter(|c| !c.is_empty()).collect();
        if let Some((_, dirs)) = components.split_last() {
            for dir in dirs {
                parent.push(SEPARATOR);
                parent.push_str(dir);
                tree.nodes.entry(parent.clone()).or_insert(Node::Directory);
            }
        }
        tree.nodes.insert(
            path,
            Node::File {
                data,
                attributes: Attributes::ARCHIVE,
            },
        );
    }

    /// Current content of the file at `path`, if any.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&join_path("", path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SimpleFileSystem for MemoryFileSystem {
    fn open_volume(&mut self) -> Result<Box<dyn FileProtocol>> {
        Ok(Box::new(MemoryFile {
            fs: self.clone(),
            path: SEPARATOR.to_string(),
            mode: OpenMode::READ | OpenMode::WRITE,
            position: 0,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryFile {
    fs: MemoryFileSystem,
    path: String,
    mode: OpenMode,
    position: u64,
}

impl MemoryFile {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> Result<T>) -> Result<T> {
        let mut tree = self.fs.lock();
        match tree.nodes.get_mut(&self.path) {
            Some(Node::File { data, .. }) => f(data),
            Some(Node::Directory) => Err(FileError::Unsupported),
            None => Err(FileError::DeviceError),
        }
    }
}

impl FileProtocol for MemoryFile {
    fn open(
        &mut self,
        name: &str,
        mode: OpenMode,
        attributes: Attributes,
    ) -> Result<Box<dyn FileProtocol>> {
        let path = join_path(&self.path, name);
        let mut tree = self.fs.lock();
        if tree.read_only && (mode.contains(OpenMode::WRITE) || mode.contains(OpenMode::CREATE)) {
            return Err(FileError::WriteProtected);
        }
        if !tree.nodes.contains_key(&path) {
            if !mode.contains(OpenMode::CREATE) {
                return Err(FileError::NotFound);
            }
            let node = if attributes.contains(Attributes::DIRECTORY) {
                Node::Directory
            } else {
                Node::File {
                    data: Vec::new(),
                    attributes,
                }
            };
            tree.nodes.insert(path.clone(), node);
        }
        Ok(Box::new(MemoryFile {
            fs: self.fs.clone(),
            path,
            mode,
            position: 0,
        }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn delete(self: Box<Self>) -> Result<()> {
        let mut tree = self.fs.lock();
        if tree.read_only {
            return Err(FileError::WriteProtected);
        }
        let prefix = format!("{}{}", self.path, SEPARATOR);
        tree.nodes
            .retain(|path, _| path != &self.path && !path.starts_with(&prefix));
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let position = self.position;
        let read = match self.with_data(|data| {
            let start = usize::try_from(position).unwrap_or(usize::MAX).min(data.len());
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }) {
            Err(FileError::Unsupported) => 0,
            other => other?,
        };
        self.position += read as u64;
        Ok(read)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.mode.contains(OpenMode::WRITE) {
            return Err(FileError::AccessDenied);
        }
        let position = usize::try_from(self.position).map_err(|_| FileError::OutOfResources)?;
        self.with_data(|data| {
            if data.len() < position + buf.len() {
                data.resize(position + buf.len(), 0);
            }
            data[position..position + buf.len()].copy_from_slice(buf);
            Ok(())
        })?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn get_position(&mut self) -> Result<u64> {
        Ok(self.position)
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.position = match position {
            u64::MAX => self.with_data(|data| Ok(data.len() as u64))?,
            position => position,
        };
        Ok(())
    }

    fn get_info(&mut self, info_type: InfoType) -> Result<Info> {
        let tree = self.fs.lock();
        match info_type {
            InfoType::File => {
                let (file_size, attributes) = match tree.nodes.get(&self.path) {
                    Some(Node::File { data, attributes }) => (data.len() as u64, *attributes),
                    Some(Node::Directory) => (0, Attributes::DIRECTORY),
                    None => return Err(FileError::DeviceError),
                };
                let blocks = (file_size + u64::from(BLOCK_SIZE) - 1) / u64::from(BLOCK_SIZE);
                Ok(Info::File(FileInfo {
                    file_size,
                    physical_size: blocks * u64::from(BLOCK_SIZE),
                    attributes,
                    file_name: file_name(&self.path).to_owned(),
                }))
            }
            InfoType::FileSystem => {
                let used: u64 = tree
                    .nodes
                    .values()
                    .map(|node| match node {
                        Node::File { data, .. } => data.len() as u64,
                        Node::Directory => 0,
                    })
                    .sum();
                Ok(Info::FileSystem(FileSystemInfo {
                    read_only: tree.read_only,
                    volume_size: used,
                    free_space: 0,
                    block_size: BLOCK_SIZE,
                    volume_label: tree.label.clone(),
                }))
            }
            InfoType::VolumeLabel => Ok(Info::VolumeLabel(tree.label.clone())),
        }
    }

    fn set_info(&mut self, info: &Info) -> Result<()> {
        let mut tree = self.fs.lock();
        if tree.read_only {
            return Err(FileError::WriteProtected);
        }
        match info {
            Info::File(requested) => match tree.nodes.get_mut(&self.path) {
                Some(Node::File { data, attributes }) => {
                    let size =
                        usize::try_from(requested.file_size).map_err(|_| FileError::OutOfResources)?;
                    data.resize(size, 0);
                    *attributes = requested.attributes;
                    Ok(())
                }
                Some(Node::Directory) => Err(FileError::AccessDenied),
                None => Err(FileError::DeviceError),
            },
            Info::FileSystem(requested) => {
                tree.label = requested.volume_label.clone();
                Ok(())
            }
            Info::VolumeLabel(label) => {
                tree.label = label.clone();
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.fs.lock().read_only {
            return Err(FileError::WriteProtected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::read_to_end;
    use eyre::Result;

    #[test]
    fn open_read_and_seek() -> Result<()> {
        let mut fs = MemoryFileSystem::new().with_file("\\a\\b.txt", b"hello world".to_vec());
        let mut root = fs.open_volume()?;
        let mut dir = root.open("a", OpenMode::READ, Attributes::NONE)?;
        let mut file = dir.open("..\\a\\.\\b.txt", OpenMode::READ, Attributes::NONE)?;

        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf)?, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(file.get_position()?, 5);

        file.set_position(u64::MAX)?;
        assert_eq!(file.get_position()?, 11);
        assert_eq!(file.read(&mut buf)?, 0);

        file.set_position(0)?;
        assert_eq!(read_to_end(file.as_mut())?, b"hello world");
        Ok(())
    }

    #[test]
    fn missing_files_and_create() -> Result<()> {
        let fs = MemoryFileSystem::new();
        let mut root = fs.clone().open_volume()?;
        assert_eq!(
            root.open("nope", OpenMode::READ, Attributes::NONE).err(),
            Some(FileError::NotFound)
        );

        let mode = OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE;
        let mut file = root.open("new.bin", mode, Attributes::ARCHIVE)?;
        assert_eq!(file.write(b"abc")?, 3);
        file.close()?;
        assert_eq!(fs.contents("\\new.bin"), Some(b"abc".to_vec()));
        Ok(())
    }

    #[test]
    fn read_only_volume_rejects_writes() -> Result<()> {
        let mut fs = MemoryFileSystem::new()
            .with_file("f", b"x".to_vec())
            .read_only(true);
        let mut root = fs.open_volume()?;
        assert_eq!(
            root.open("f", OpenMode::READ | OpenMode::WRITE, Attributes::NONE).err(),
            Some(FileError::WriteProtected)
        );
        let mut file = root.open("f", OpenMode::READ, Attributes::NONE)?;
        assert_eq!(file.write(b"y").err(), Some(FileError::AccessDenied));
        Ok(())
    }

    #[test]
    fn info_and_delete() -> Result<()> {
        let fs = MemoryFileSystem::new()
            .with_file("\\dir\\f.bin", vec![7u8; 600])
            .with_label("Recovery HD");
        let mut root = fs.clone().open_volume()?;
        let mut file = root.open("dir\\f.bin", OpenMode::READ | OpenMode::WRITE, Attributes::NONE)?;
        match file.get_info(InfoType::File)? {
            Info::File(info) => {
                assert_eq!(info.file_size, 600);
                assert_eq!(info.physical_size, 1024);
                assert_eq!(info.file_name, "f.bin");
            }
            other => panic!("unexpected info {:?}", other),
        }
        assert_eq!(
            root.get_info(InfoType::VolumeLabel)?,
            Info::VolumeLabel("Recovery HD".into())
        );
        file.delete()?;
        assert_eq!(fs.contents("\\dir\\f.bin"), None);
        Ok(())
    }
}
