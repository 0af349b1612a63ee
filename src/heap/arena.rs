//! Flash heap arena
//!
//! An append-only allocator over one storage device. Opening the heap claims
//! the slice past the chain's tail sentinel for exactly one image; closing
//! commits the image's header and a fresh sentinel, advancing the shared
//! tail. Nothing written before `close` is visible to chain walks.

use crate::console_println;
use crate::error::{LoadError, LoadResult};
use crate::storage::{FlashDevice, StorageError};

use super::chain::ChainWalker;
use super::header::{align_up, ImageHeader, HEADER_SIZE};

pub struct FlashHeap<'d> {
    dev: &'d dyn FlashDevice,
    htype: u32,
    // Flash-side cursors, all absolute addresses.
    // Invariant: flash_start <= flash_pos, flash_end <= flash_limit
    flash_base: u32,
    flash_start: u32,
    flash_end: u32,
    flash_limit: u32,
    flash_pos: u32,
    // RAM-side reservation, address bookkeeping only
    ram_start: u32,
    ram_end: u32,
    ram_limit: u32,
    entry: u32,
}

impl<'d> FlashHeap<'d> {
    /// Erase the chain head and write the initial sentinel. `ram_base` seeds
    /// the RAM handout for every image the device will ever hold.
    pub fn format(dev: &dyn FlashDevice, ram_base: u32) -> LoadResult<()> {
        if dev.size() < HEADER_SIZE || ram_base == 0 {
            return Err(LoadError::Storage(StorageError::OutOfRange));
        }
        let unit = dev.erase_unit().max(HEADER_SIZE).min(dev.size());
        dev.erase(0, unit)?;
        let sentinel = ImageHeader::sentinel(ram_base);
        dev.pwrite(0, &sentinel.to_le_bytes())?;
        Ok(())
    }

    /// Walk the chain and open an arena positioned just past the tail.
    pub fn open(dev: &'d dyn FlashDevice, htype: u32, ram_limit: u32) -> LoadResult<Self> {
        if dev.size() < HEADER_SIZE {
            return Err(LoadError::Storage(StorageError::OutOfRange));
        }
        let (tail_addr, sentinel) = ChainWalker::new(dev).tail()?;
        if sentinel.ram_base == 0 {
            // Never formatted
            return Err(LoadError::CorruptChain);
        }
        let flash_base = dev.base();
        Ok(FlashHeap {
            dev,
            htype,
            flash_base,
            flash_start: tail_addr,
            flash_end: tail_addr + HEADER_SIZE,
            flash_limit: flash_base + dev.size(),
            flash_pos: tail_addr + HEADER_SIZE,
            ram_start: sentinel.ram_base,
            ram_end: sentinel.ram_base,
            ram_limit,
            entry: 0,
        })
    }

    pub fn flash_start(&self) -> u32 {
        self.flash_start
    }

    pub fn flash_end(&self) -> u32 {
        self.flash_end
    }

    pub fn flash_base(&self) -> u32 {
        self.flash_base
    }

    pub fn ram_start(&self) -> u32 {
        self.ram_start
    }

    pub fn ram_end(&self) -> u32 {
        self.ram_end
    }

    pub fn set_entry(&mut self, entry: u32) {
        self.entry = entry;
    }

    /// Move the flash cursor. Moving past the current high-water mark
    /// extends it.
    pub fn seek(&mut self, pos: u32) -> LoadResult<()> {
        if pos < self.flash_start || pos >= self.flash_limit {
            return Err(LoadError::AddressFault(pos));
        }
        self.flash_pos = pos;
        if pos > self.flash_end {
            self.flash_end = pos;
        }
        Ok(())
    }

    /// Move the RAM reservation cursor.
    pub fn set_ram(&mut self, pos: u32) -> LoadResult<()> {
        if pos < self.ram_start || pos >= self.ram_limit {
            return Err(LoadError::AddressFault(pos));
        }
        self.ram_end = pos;
        Ok(())
    }

    /// Sequential write at the cursor.
    pub fn write(&mut self, buf: &[u8]) -> LoadResult<()> {
        let pos = self.flash_pos;
        self.pwrite(pos, buf)?;
        self.flash_pos += buf.len() as u32;
        if self.flash_pos > self.flash_end {
            self.flash_end = self.flash_pos;
        }
        Ok(())
    }

    /// Sequential read at the cursor.
    pub fn read(&mut self, buf: &mut [u8]) -> LoadResult<()> {
        let pos = self.flash_pos;
        self.pread(pos, buf)?;
        self.flash_pos += buf.len() as u32;
        Ok(())
    }

    /// Write at an absolute flash address; the cursor does not move.
    pub fn pwrite(&mut self, addr: u32, buf: &[u8]) -> LoadResult<()> {
        let off = self.device_offset(addr, buf.len())?;
        self.dev.pwrite(off, buf)?;
        Ok(())
    }

    /// Read at an absolute flash address; the cursor does not move.
    pub fn pread(&self, addr: u32, buf: &mut [u8]) -> LoadResult<()> {
        let off = self.device_offset(addr, buf.len())?;
        self.dev.pread(off, buf)?;
        Ok(())
    }

    /// Truncate the slice to end exactly at `addr`, discarding reserved
    /// flash past it.
    pub fn trim(&mut self, addr: u32) -> LoadResult<()> {
        self.seek(addr)?;
        self.flash_end = addr;
        Ok(())
    }

    /// Bounds check used before every patch: inside the slice's flash span
    /// or its RAM reservation.
    pub fn is_valid_ptr(&self, addr: u32) -> bool {
        (addr >= self.flash_start && addr <= self.flash_end)
            || (addr >= self.ram_start && addr <= self.ram_end)
    }

    /// Commit: write the sentinel for the next slice, then this image's
    /// header. The header write is the commit point; a failure before it
    /// leaves the chain tail where it was and the written bytes orphaned.
    pub fn close(self) -> LoadResult<(u32, ImageHeader)> {
        let flash_size = align_up(self.flash_end - self.flash_start);
        let ram_next = align_up(self.ram_end);
        let sentinel_addr = self.flash_start + flash_size;
        if sentinel_addr + HEADER_SIZE > self.flash_limit {
            return Err(LoadError::Storage(StorageError::OutOfRange));
        }
        let header = ImageHeader {
            htype: self.htype,
            flash_size,
            ram_size: ram_next - self.ram_start,
            ram_base: self.ram_start,
            entry: self.entry,
        };
        let sentinel = ImageHeader::sentinel(ram_next);
        self.dev
            .pwrite(sentinel_addr - self.flash_base, &sentinel.to_le_bytes())?;
        self.dev
            .pwrite(self.flash_start - self.flash_base, &header.to_le_bytes())?;
        console_println!(
            "[o] committed image: flash 0x{:08x}+0x{:x} ram 0x{:08x}+0x{:x}",
            self.flash_start,
            header.flash_size,
            header.ram_base,
            header.ram_size
        );
        Ok((self.flash_start, header))
    }

    /// Drop the arena without committing anything.
    pub fn free(self) {}

    fn device_offset(&self, addr: u32, len: usize) -> LoadResult<u32> {
        let end = addr.checked_add(len as u32).ok_or(LoadError::AddressFault(addr))?;
        if addr < self.flash_base || end > self.flash_limit {
            return Err(LoadError::AddressFault(addr));
        }
        Ok(addr - self.flash_base)
    }
}
