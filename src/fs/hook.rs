//! Call interception for file handles.
//!
//! A [`HookedFileSystem`] stands in for a volume's [`SimpleFileSystem`]. Every
//! handle opened through it is wrapped in a [`HookedFile`] that remembers its
//! resolved path and asks the `opened` hook once whether the rest of the hook
//! table applies to it. Handles the hook declines, and operations without a
//! hook, go straight to the original handle.

use super::{
    join_path, Attributes, Device, FileError, FileProtocol, Info, InfoType, OpenMode, Result,
    SimpleFileSystem, SEPARATOR,
};
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies one open handle for the lifetime of its wrapper.
pub type HandleId = u64;

/// What the `opened` hook learns about a freshly opened handle.
#[derive(Debug, Clone, Copy)]
pub struct Opened<'a> {
    pub id: HandleId,
    pub path: &'a str,
    pub mode: OpenMode,
    pub attributes: Attributes,
}

/// Arguments shared by every per-operation hook.
pub struct Call<'a, D> {
    pub original: &'a mut dyn FileProtocol,
    pub id: HandleId,
    pub data: &'a D,
}

pub type OpenedHook<D> = fn(&mut dyn FileProtocol, Opened<'_>, &D) -> bool;
pub type ReleaseHook<D> = fn(Box<dyn FileProtocol>, HandleId, &D) -> Result<()>;
pub type ReadHook<D> = fn(Call<'_, D>, &mut [u8]) -> Result<usize>;
pub type WriteHook<D> = fn(Call<'_, D>, &[u8]) -> Result<usize>;
pub type GetPositionHook<D> = fn(Call<'_, D>) -> Result<u64>;
pub type SetPositionHook<D> = fn(Call<'_, D>, u64) -> Result<()>;
pub type GetInfoHook<D> = fn(Call<'_, D>, InfoType) -> Result<Info>;
pub type SetInfoHook<D> = fn(Call<'_, D>, &Info) -> Result<()>;
pub type FlushHook<D> = fn(Call<'_, D>) -> Result<()>;

/// Per-operation overrides. `None` falls through to the original handle.
pub struct HookTable<D> {
    pub opened: Option<OpenedHook<D>>,
    pub close: Option<ReleaseHook<D>>,
    pub delete: Option<ReleaseHook<D>>,
    pub read: Option<ReadHook<D>>,
    pub write: Option<WriteHook<D>>,
    pub get_position: Option<GetPositionHook<D>>,
    pub set_position: Option<SetPositionHook<D>>,
    pub get_info: Option<GetInfoHook<D>>,
    pub set_info: Option<SetInfoHook<D>>,
    pub flush: Option<FlushHook<D>>,
}

impl<D> Default for HookTable<D> {
    fn default() -> Self {
        Self {
            opened: None,
            close: None,
            delete: None,
            read: None,
            write: None,
            get_position: None,
            set_position: None,
            get_info: None,
            set_info: None,
            flush: None,
        }
    }
}

impl<D> Clone for HookTable<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for HookTable<D> {}

struct Shared<D> {
    hooks: HookTable<D>,
    data: D,
    next_id: AtomicU64,
}

impl<D> Shared<D> {
    fn new(hooks: HookTable<D>, data: D) -> Result<Arc<Self>> {
        if hooks.opened.is_none() {
            return Err(FileError::InvalidParameter);
        }
        Ok(Arc::new(Self {
            hooks,
            data,
            next_id: AtomicU64::new(1),
        }))
    }
}

pub struct HookedFileSystem<D> {
    original: Box<dyn SimpleFileSystem>,
    shared: Arc<Shared<D>>,
}

impl<D: 'static> HookedFileSystem<D> {
    /// Fails with `InvalidParameter` when the table has no `opened` hook.
    pub fn new(
        original: Box<dyn SimpleFileSystem>,
        hooks: HookTable<D>,
        data: D,
    ) -> Result<Self> {
        Ok(Self {
            original,
            shared: Shared::new(hooks, data)?,
        })
    }

    pub fn data(&self) -> &D {
        &self.shared.data
    }
}

impl<D: 'static> SimpleFileSystem for HookedFileSystem<D> {
    fn open_volume(&mut self) -> Result<Box<dyn FileProtocol>> {
        let root = self.original.open_volume().map_err(|e| {
            debug!("open volume failed: {}", e);
            e
        })?;
        Ok(Box::new(HookedFile::new(
            root,
            self.shared.clone(),
            SEPARATOR.to_string(),
            OpenMode::READ | OpenMode::WRITE,
            Attributes::DIRECTORY,
        )))
    }
}

/// Replaces the file system on `device` with a hooked one.
///
/// Fails with `InvalidParameter` when `hooks` has no `opened` hook and with
/// `Unsupported` when the device carries no file system. The device is left
/// unchanged on failure.
pub fn hook_simple_file_system<D: 'static>(
    device: &mut Device,
    hooks: HookTable<D>,
    data: D,
) -> Result<()> {
    let shared = Shared::new(hooks, data)?;
    let original = device.file_system.take().ok_or(FileError::Unsupported)?;
    device.file_system = Some(Box::new(HookedFileSystem { original, shared }));
    debug!("file system hooks installed");
    Ok(())
}

/// Wraps an already opened handle, e.g. a volume root obtained elsewhere.
pub fn wrap<D: 'static>(
    original: Box<dyn FileProtocol>,
    path: &str,
    hooks: HookTable<D>,
    data: D,
) -> Result<HookedFile<D>> {
    let shared = Shared::new(hooks, data)?;
    Ok(HookedFile::new(
        original,
        shared,
        join_path("", path),
        OpenMode::READ,
        Attributes::NONE,
    ))
}

pub struct HookedFile<D> {
    original: Box<dyn FileProtocol>,
    path: String,
    id: HandleId,
    hooks_active: bool,
    shared: Arc<Shared<D>>,
}

impl<D: 'static> HookedFile<D> {
    fn new(
        mut original: Box<dyn FileProtocol>,
        shared: Arc<Shared<D>>,
        path: String,
        mode: OpenMode,
        attributes: Attributes,
    ) -> Self {
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let opened = Opened {
            id,
            path: &path,
            mode,
            attributes,
        };
        let hooks_active = shared
            .hooks
            .opened
            .map_or(false, |hook| hook(original.as_mut(), opened, &shared.data));
        if hooks_active {
            debug!("hooks active for {} (handle {})", path, id);
        }
        Self {
            original,
            path,
            id,
            hooks_active,
            shared,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn hooks_active(&self) -> bool {
        self.hooks_active
    }

    pub fn data(&self) -> &D {
        &self.shared.data
    }

    /// The table to dispatch through (if any) and the call arguments.
    fn split(&mut self) -> (Option<&HookTable<D>>, Call<'_, D>) {
        let hooks = self.hooks_active.then_some(&self.shared.hooks);
        let call = Call {
            original: self.original.as_mut(),
            id: self.id,
            data: &self.shared.data,
        };
        (hooks, call)
    }

    fn release(
        self,
        select: fn(&HookTable<D>) -> Option<ReleaseHook<D>>,
        fallback: fn(Box<dyn FileProtocol>) -> Result<()>,
    ) -> Result<()> {
        let hook = match self.hooks_active {
            true => select(&self.shared.hooks),
            false => None,
        };
        let HookedFile {
            original,
            id,
            shared,
            ..
        } = self;
        match hook {
            Some(hook) => hook(original, id, &shared.data),
            None => fallback(original),
        }
    }
}

impl<D: 'static> FileProtocol for HookedFile<D> {
    fn open(
        &mut self,
        name: &str,
        mode: OpenMode,
        attributes: Attributes,
    ) -> Result<Box<dyn FileProtocol>> {
        let child = self.original.open(name, mode, attributes).map_err(|e| {
            debug!("open of {} under {} failed: {}", name, self.path, e);
            e
        })?;
        Ok(Box::new(HookedFile::new(
            child,
            self.shared.clone(),
            join_path(&self.path, name),
            mode,
            attributes,
        )))
    }

    fn close(self: Box<Self>) -> Result<()> {
        (*self).release(|hooks| hooks.close, |original| original.close())
    }

    fn delete(self: Box<Self>) -> Result<()> {
        (*self).release(|hooks| hooks.delete, |original| original.delete())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (hooks, call) = self.split();
        match hooks.and_then(|h| h.read) {
            Some(read) => read(call, buf),
            None => call.original.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let (hooks, call) = self.split();
        match hooks.and_then(|h| h.write) {
            Some(write) => write(call, buf),
            None => call.original.write(buf),
        }
    }

    fn get_position(&mut self) -> Result<u64> {
        let (hooks, call) = self.split();
        match hooks.and_then(|h| h.get_position) {
            Some(get_position) => get_position(call),
            None => call.original.get_position(),
        }
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        let (hooks, call) = self.split();
        match hooks.and_then(|h| h.set_position) {
            Some(set_position) => set_position(call, position),
            None => call.original.set_position(position),
        }
    }

    fn get_info(&mut self, info_type: InfoType) -> Result<Info> {
        let (hooks, call) = self.split();
        match hooks.and_then(|h| h.get_info) {
            Some(get_info) => get_info(call, info_type),
            None => call.original.get_info(info_type),
        }
    }

    fn set_info(&mut self, info: &Info) -> Result<()> {
        let (hooks, call) = self.split();
        match hooks.and_then(|h| h.set_info) {
            Some(set_info) => set_info(call, info),
            None => call.original.set_info(info),
        }
    }

    fn flush(&mut self) -> Result<()> {
        let (hooks, call) = self.split();
        match hooks.and_then(|h| h.flush) {
            Some(flush) => flush(call),
            None => call.original.flush(),
        }
    }
}
