//! Image loader
//!
//! Copies one ELF file's loadable segments into a freshly claimed arena
//! slice, establishing the flash/RAM bases every later translation uses,
//! and recovers the in-flash program header table through the image footer.

use heapless::String;

use crate::console_println;
use crate::error::{LoadError, LoadResult};
use crate::heap::{FlashHeap, HEADER_SIZE, HTYPE_MODULE};
use crate::source::ByteSource;
use crate::storage::FlashDevice;

use super::addr::{RegionMap, TaggedAddr};
use super::constants::*;
use super::structures::{read_u32, Elf32Header, Elf32Phdr, EHDR_SIZE, PHDR_SIZE};

/// Trailing `{addr, ~addr}` pair anchoring the program header table
pub const FOOTER_SIZE: u32 = 8;

const COPY_CHUNK: usize = 128;

pub struct ImageLoader<'d> {
    heap: FlashHeap<'d>,
    map: RegionMap,
}

impl<'d> ImageLoader<'d> {
    /// Claim the next slice of `dev`. Refuses to open below `watermark`:
    /// code above it may already be executing and cannot be invalidated.
    pub fn open(dev: &'d dyn FlashDevice, ram_limit: u32, watermark: u32) -> LoadResult<Self> {
        let heap = FlashHeap::open(dev, HTYPE_MODULE, ram_limit)?;
        if heap.flash_start() < watermark {
            return Err(LoadError::ResetNeeded);
        }
        let map = RegionMap {
            flash_base: heap.flash_start() + HEADER_SIZE,
            ram_base: heap.ram_start(),
        };
        Ok(ImageLoader { heap, map })
    }

    /// Translate a tagged address against this image's bases.
    pub fn relocate(&self, addr: TaggedAddr) -> LoadResult<u32> {
        self.map.resolve(addr)
    }

    pub fn map(&self) -> RegionMap {
        self.map
    }

    pub fn heap(&self) -> &FlashHeap<'d> {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut FlashHeap<'d> {
        &mut self.heap
    }

    pub fn into_heap(self) -> FlashHeap<'d> {
        self.heap
    }

    /// Release without committing.
    pub fn free(self) {
        self.heap.free();
    }

    /// Read at a tagged address.
    pub fn read(&self, buf: &mut [u8], addr: TaggedAddr) -> LoadResult<()> {
        let abs = self.relocate(addr)?;
        self.heap.pread(abs, buf)
    }

    /// Write at a tagged address.
    pub fn write(&mut self, buf: &[u8], addr: TaggedAddr) -> LoadResult<()> {
        let abs = self.relocate(addr)?;
        self.heap.pwrite(abs, buf)
    }

    /// Validate the file identity and stream every `PT_LOAD` segment into
    /// the arena at its translated physical address.
    pub fn copy_segments(&mut self, src: &mut dyn ByteSource) -> LoadResult<()> {
        let mut ehdr_buf = [0u8; EHDR_SIZE];
        src.pread(0, &mut ehdr_buf)?;
        let ehdr = Elf32Header::from_le_bytes(&ehdr_buf);
        validate_header(&ehdr)?;

        if (ehdr.e_phentsize as usize) < PHDR_SIZE {
            return Err(LoadError::BadPhdrType(ehdr.e_phentsize as u32));
        }
        for i in 0..ehdr.e_phnum as u32 {
            let mut phdr_buf = [0u8; PHDR_SIZE];
            src.pread(ehdr.e_phoff + i * ehdr.e_phentsize as u32, &mut phdr_buf)?;
            let ph = Elf32Phdr::from_le_bytes(&phdr_buf);
            if ph.p_type != PT_LOAD {
                continue;
            }
            self.copy_one(src, &ph)?;
        }
        Ok(())
    }

    fn copy_one(&mut self, src: &mut dyn ByteSource, ph: &Elf32Phdr) -> LoadResult<()> {
        if ph.p_filesz == 0 {
            // Pure reservation (bss); the linker accounts for it
            return Ok(());
        }
        let dest = self.relocate(TaggedAddr(ph.p_paddr))?;
        console_println!(
            "[i] segment: {} bytes file 0x{:x} -> 0x{:08x}",
            ph.p_filesz,
            ph.p_offset,
            dest
        );
        src.seek(ph.p_offset)?;
        let mut buf = [0u8; COPY_CHUNK];
        let mut done = 0u32;
        while done < ph.p_filesz {
            let n = core::cmp::min(COPY_CHUNK as u32, ph.p_filesz - done) as usize;
            src.read_exact(&mut buf[..n])?;
            self.heap.pwrite(dest + done, &buf[..n])?;
            done += n as u32;
        }
        // Cover the copied extent so the footer and the chain size see it
        let end = dest + ph.p_filesz;
        if end > self.heap.flash_end() {
            self.heap.seek(end)?;
        }
        Ok(())
    }

    /// Recover the program header table without side-channel metadata: the
    /// last 8 bytes of the claimed slice are `{addr, ~addr}`; the relocated
    /// `addr` must hold a `PT_PHDR` record.
    pub fn find_phdrs(&self) -> LoadResult<(u32, Elf32Phdr)> {
        let mut footer = [0u8; FOOTER_SIZE as usize];
        self.heap
            .pread(self.heap.flash_end() - FOOTER_SIZE, &mut footer)?;
        let addr = read_u32(&footer, 0);
        let complement = read_u32(&footer, 4);
        if complement != !addr {
            return Err(LoadError::BadFooter(addr));
        }
        let table = self.relocate(TaggedAddr(addr))?;
        let mut phdr_buf = [0u8; PHDR_SIZE];
        self.heap.pread(table, &mut phdr_buf)?;
        let ph = Elf32Phdr::from_le_bytes(&phdr_buf);
        if ph.p_type != PT_PHDR {
            return Err(LoadError::BadPhdrType(ph.p_type));
        }
        Ok((table, ph))
    }

    /// Bounded NUL-terminated name read at an absolute flash address.
    pub fn read_cstr(&self, addr: u32) -> LoadResult<String<NAME_MAX>> {
        read_cstr_with(&mut |a, buf| self.heap.pread(a, buf), addr)
    }
}

fn validate_header(h: &Elf32Header) -> LoadResult<()> {
    if h.e_ident[0..4] != ELF_MAGIC {
        return Err(LoadError::BadMagic);
    }
    if h.e_ident[4] != ELFCLASS32 {
        return Err(LoadError::BadClass);
    }
    if h.e_ident[5] != ELFDATA2LSB {
        return Err(LoadError::BadEndian);
    }
    if h.e_machine != EM_ARM {
        return Err(LoadError::BadMachine(h.e_machine));
    }
    if h.e_type != ET_EXEC {
        return Err(LoadError::BadType(h.e_type));
    }
    Ok(())
}

/// Shared bounded C-string reader: one byte at a time so a name sitting at
/// the end of the device does not over-read.
pub(crate) fn read_cstr_with(
    pread: &mut dyn FnMut(u32, &mut [u8]) -> LoadResult<()>,
    addr: u32,
) -> LoadResult<String<NAME_MAX>> {
    let mut name: String<NAME_MAX> = String::new();
    for i in 0..NAME_MAX as u32 {
        let mut b = [0u8];
        pread(addr + i, &mut b)?;
        if b[0] == 0 {
            return Ok(name);
        }
        name.push(b[0] as char).map_err(|_| LoadError::NameTooLong)?;
    }
    Err(LoadError::NameTooLong)
}
