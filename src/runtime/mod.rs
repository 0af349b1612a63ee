//! Runtime API
//!
//! The dlopen/dlsym/dlclose/dlerror surface plus the boot-time constructor
//! and shutdown-time destructor sweeps. All state lives in an explicit
//! [`Runtime`] context so tests can simulate independent boots; there are
//! no hidden globals.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::console_println;
use crate::elf::constants::{DT_FINI, DT_INIT};
use crate::elf::linker::{ImageLinker, InterpHook, SymbolResolver};
use crate::elf::loader::ImageLoader;
use crate::error::{LoadError, LoadResult};
use crate::heap::{ChainWalker, FlashHeap, ImageHeader, HTYPE_MODULE};
use crate::source::ByteSource;
use crate::storage::{FlashDevice, StorageError};

pub mod image;

pub use image::ImageView;

pub const MAX_DEVICES: usize = 2;
pub const MAX_HOOKS: usize = 4;

/// One firmware-exported symbol: name and absolute address
pub type FirmwareExport = (&'static str, u32);

/// Calls a committed image's INIT/FINI target; the firmware supplies the
/// transmuting implementation, tests supply a recorder.
pub type EntryInvoker = fn(u32);

struct DeviceSlot<'d> {
    dev: &'d dyn FlashDevice,
    ram_limit: u32,
    /// Address below which new loads are refused once constructors ran
    watermark: u32,
}

pub struct Runtime<'d> {
    devices: Vec<DeviceSlot<'d>, MAX_DEVICES>,
    exports: &'d [FirmwareExport],
    hooks: Vec<(&'static str, &'d dyn InterpHook), MAX_HOOKS>,
    invoker: Option<EntryInvoker>,
    last_error: Option<String<96>>,
}

impl<'d> Runtime<'d> {
    pub fn new(exports: &'d [FirmwareExport]) -> Self {
        Runtime {
            devices: Vec::new(),
            exports,
            hooks: Vec::new(),
            invoker: None,
            last_error: None,
        }
    }

    /// Register a storage device; index 0 is the `dlopen` search device.
    pub fn add_device(&mut self, dev: &'d dyn FlashDevice, ram_limit: u32) -> Option<usize> {
        let index = self.devices.len();
        self.devices
            .push(DeviceSlot {
                dev,
                ram_limit,
                watermark: 0,
            })
            .ok()?;
        Some(index)
    }

    pub fn register_hook(&mut self, name: &'static str, hook: &'d dyn InterpHook) -> bool {
        self.hooks.push((name, hook)).is_ok()
    }

    pub fn set_invoker(&mut self, invoker: EntryInvoker) {
        self.invoker = Some(invoker);
    }

    /// Erase a device's chain and seed its RAM handout.
    pub fn format_device(&mut self, device: usize, ram_base: u32) -> LoadResult<()> {
        let slot = self
            .devices
            .get(device)
            .ok_or(LoadError::Storage(StorageError::DeviceNotReady))?;
        FlashHeap::format(slot.dev, ram_base)
    }

    /// Load, link and commit one image. Returns the committed header's
    /// address; on failure nothing is committed and `dlerror` reports why.
    pub fn load(&mut self, src: &mut dyn ByteSource, device: usize) -> Option<u32> {
        self.last_error = None;
        match self.load_inner(src, device) {
            Ok(addr) => {
                console_println!("[o] image loaded at 0x{:08x}", addr);
                Some(addr)
            }
            Err(e) => {
                console_println!("[x] load failed: {}", e);
                self.set_error(&e);
                None
            }
        }
    }

    fn load_inner(&mut self, src: &mut dyn ByteSource, device: usize) -> LoadResult<u32> {
        let (dev, ram_limit, watermark) = {
            let slot = self
                .devices
                .get(device)
                .ok_or(LoadError::Storage(StorageError::DeviceNotReady))?;
            (slot.dev, slot.ram_limit, slot.watermark)
        };
        let mut loader = ImageLoader::open(dev, ram_limit, watermark)?;
        loader.copy_segments(src)?;
        src.close();
        ImageLinker::link(loader, &*self)
    }

    /// Restartable walk over a device's committed module records.
    pub fn iterate(&self, device: usize) -> ModuleIter<'d> {
        ModuleIter {
            walker: self.devices.get(device).map(|s| ChainWalker::new(s.dev)),
        }
    }

    /// Find an image whose dynamic section names `name` as its SONAME.
    pub fn dlopen(&mut self, name: &str) -> Option<u32> {
        self.last_error = None;
        if self.devices.is_empty() {
            self.set_error(&LoadError::Storage(StorageError::DeviceNotReady));
            return None;
        }
        let dev = self.devices[0].dev;
        for (addr, _) in self.iterate(0) {
            let Ok(view) = ImageView::open(dev, addr) else {
                continue;
            };
            if let Ok(Some(soname)) = view.soname() {
                if soname.as_str() == name {
                    return Some(addr);
                }
            }
        }
        self.set_error(&LoadError::NotFound);
        None
    }

    /// Symbol lookup: one image's table when `handle` is given, otherwise
    /// the global search every undefined symbol resolves through.
    pub fn dlsym(&mut self, handle: Option<u32>, name: &str) -> Option<u32> {
        self.last_error = None;
        let found = match handle {
            Some(addr) => self
                .view_at(addr)
                .and_then(|view| view.lookup(name).ok().flatten()),
            None => self.resolve(name),
        };
        if found.is_none() {
            let mut msg = String::new();
            let _ = write!(msg, "symbol '{}' not found", name);
            self.last_error = Some(msg);
        }
        found
    }

    /// Unloading is not supported; succeeds for any handle.
    pub fn dlclose(&mut self, _handle: u32) -> i32 {
        self.last_error = None;
        0
    }

    /// Return and clear the message from the most recent failing call.
    pub fn dlerror(&mut self) -> Option<String<96>> {
        self.last_error.take()
    }

    /// Boot-time sweep: run every image's INIT target in chain order, then
    /// record each chain's tail as the execution high-water mark.
    pub fn run_constructors(&mut self) {
        for i in 0..self.devices.len() {
            let tail = self.sweep(i, DT_INIT);
            self.devices[i].watermark = tail;
        }
    }

    /// Shutdown sweep: run FINI targets and clear the high-water marks.
    pub fn run_destructors(&mut self) {
        for i in 0..self.devices.len() {
            self.sweep(i, DT_FINI);
            self.devices[i].watermark = 0;
        }
    }

    fn sweep(&self, device: usize, tag: u32) -> u32 {
        let dev = self.devices[device].dev;
        let mut walker = ChainWalker::new(dev);
        loop {
            match walker.next_record() {
                Ok(Some((addr, header))) => {
                    if header.htype != HTYPE_MODULE {
                        continue;
                    }
                    let target = ImageView::open(dev, addr)
                        .and_then(|view| view.dynamic_val(tag))
                        .unwrap_or(None);
                    if let (Some(entry), Some(invoker)) = (target, self.invoker) {
                        if entry != 0 {
                            invoker(entry);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    console_println!("[x] chain sweep stopped: {}", e);
                    break;
                }
            }
        }
        walker.addr()
    }

    fn view_at(&self, addr: u32) -> Option<ImageView<'d>> {
        let slot = self.devices.iter().find(|s| {
            let base = s.dev.base();
            addr >= base && addr - base < s.dev.size()
        })?;
        ImageView::open(slot.dev, addr).ok()
    }

    fn set_error(&mut self, e: &LoadError) {
        let mut msg = String::new();
        let _ = write!(msg, "{}", e);
        self.last_error = Some(msg);
    }
}

impl<'d> SymbolResolver for Runtime<'d> {
    fn resolve(&self, name: &str) -> Option<u32> {
        for (export, value) in self.exports {
            if *export == name {
                return Some(*value);
            }
        }
        for (di, slot) in self.devices.iter().enumerate() {
            for (addr, _) in self.iterate(di) {
                let Ok(view) = ImageView::open(slot.dev, addr) else {
                    continue;
                };
                if let Ok(Some(value)) = view.lookup(name) {
                    return Some(value);
                }
            }
        }
        None
    }

    fn interp_hook(&self, name: &str) -> Option<&dyn InterpHook> {
        self.hooks
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, h)| *h)
    }
}

/// Lazy, finite, restartable iterator over one chain's module records.
pub struct ModuleIter<'d> {
    walker: Option<ChainWalker<'d>>,
}

impl<'d> Iterator for ModuleIter<'d> {
    type Item = (u32, ImageHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let mut walker = self.walker.take()?;
        loop {
            match walker.next_record() {
                Ok(Some((addr, header))) => {
                    if header.htype == HTYPE_MODULE {
                        self.walker = Some(walker);
                        return Some((addr, header));
                    }
                }
                _ => return None,
            }
        }
    }
}
