//! Memory-backed storage device
//!
//! Serves two roles: the PSRAM image store on parts that have one, and the
//! storage fake the loader tests run against. Erase fills with 0xFF to match
//! NOR flash behavior.

use spin::Mutex;

use super::{FlashDevice, StorageError, StorageResult};

pub const ERASED_BYTE: u8 = 0xFF;

pub struct MemDevice<'a> {
    base: u32,
    erase_unit: u32,
    bytes: Mutex<&'a mut [u8]>,
}

impl<'a> MemDevice<'a> {
    /// Wrap a caller-owned buffer as a device mapped at `base`.
    pub fn new(base: u32, erase_unit: u32, bytes: &'a mut [u8]) -> Self {
        MemDevice {
            base,
            erase_unit,
            bytes: Mutex::new(bytes),
        }
    }

    fn check_range(&self, offset: u32, len: usize) -> StorageResult<usize> {
        let off = offset as usize;
        let size = self.size() as usize;
        if off > size || len > size - off {
            return Err(StorageError::OutOfRange);
        }
        Ok(off)
    }
}

impl<'a> FlashDevice for MemDevice<'a> {
    fn base(&self) -> u32 {
        self.base
    }

    fn size(&self) -> u32 {
        self.bytes.lock().len() as u32
    }

    fn erase_unit(&self) -> u32 {
        self.erase_unit
    }

    fn pread(&self, offset: u32, buf: &mut [u8]) -> StorageResult<()> {
        let off = self.check_range(offset, buf.len())?;
        let guard = self.bytes.lock();
        buf.copy_from_slice(&guard[off..off + buf.len()]);
        Ok(())
    }

    fn pwrite(&self, offset: u32, buf: &[u8]) -> StorageResult<()> {
        let off = self.check_range(offset, buf.len())?;
        let mut guard = self.bytes.lock();
        guard[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&self, offset: u32, len: u32) -> StorageResult<()> {
        let off = self.check_range(offset, len as usize)?;
        let mut guard = self.bytes.lock();
        for b in guard[off..off + len as usize].iter_mut() {
            *b = ERASED_BYTE;
        }
        Ok(())
    }
}
