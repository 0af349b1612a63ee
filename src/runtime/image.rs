//! Committed image access
//!
//! A loaded image is reachable only through its persisted header record.
//! [`ImageView`] rebuilds the region bases from that record (`flash_base`
//! from the record's position, `ram_base` from the stored field) and walks
//! the in-flash footer, program headers and dynamic section to answer
//! `dlopen`/`dlsym` queries.

use heapless::String;

use crate::elf::addr::{RegionMap, TaggedAddr};
use crate::elf::constants::*;
use crate::elf::loader::{read_cstr_with, FOOTER_SIZE};
use crate::elf::structures::{
    read_u32, Elf32Dyn, Elf32Phdr, Elf32Sym, DYN_SIZE, PHDR_SIZE, SYM_SIZE,
};
use crate::elf::elf_hash;
use crate::error::{LoadError, LoadResult};
use crate::heap::{ImageHeader, HEADER_SIZE};
use crate::storage::FlashDevice;

pub struct ImageView<'d> {
    dev: &'d dyn FlashDevice,
    header_addr: u32,
    header: ImageHeader,
    map: RegionMap,
}

impl<'d> ImageView<'d> {
    pub fn open(dev: &'d dyn FlashDevice, header_addr: u32) -> LoadResult<Self> {
        let off = header_addr
            .checked_sub(dev.base())
            .ok_or(LoadError::AddressFault(header_addr))?;
        let mut buf = [0u8; HEADER_SIZE as usize];
        dev.pread(off, &mut buf)?;
        let header = ImageHeader::from_le_bytes(&buf);
        let map = RegionMap {
            flash_base: header_addr + HEADER_SIZE,
            ram_base: header.ram_base,
        };
        Ok(ImageView {
            dev,
            header_addr,
            header,
            map,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn header_addr(&self) -> u32 {
        self.header_addr
    }

    fn read_abs(&self, addr: u32, buf: &mut [u8]) -> LoadResult<()> {
        let off = addr
            .checked_sub(self.dev.base())
            .ok_or(LoadError::AddressFault(addr))?;
        self.dev.pread(off, buf)?;
        Ok(())
    }

    fn read_cstr(&self, addr: u32) -> LoadResult<String<NAME_MAX>> {
        read_cstr_with(&mut |a, buf| self.read_abs(a, buf), addr)
    }

    /// Re-anchor the program header table through the slice footer.
    fn phdr_table(&self) -> LoadResult<(u32, u32)> {
        let slice_end = self.header_addr + self.header.flash_size;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        self.read_abs(slice_end - FOOTER_SIZE, &mut footer)?;
        let addr = read_u32(&footer, 0);
        let complement = read_u32(&footer, 4);
        if complement != !addr {
            return Err(LoadError::BadFooter(addr));
        }
        let table = self.map.resolve(TaggedAddr(addr))?;
        let mut buf = [0u8; PHDR_SIZE];
        self.read_abs(table, &mut buf)?;
        let ph = Elf32Phdr::from_le_bytes(&buf);
        if ph.p_type != PT_PHDR {
            return Err(LoadError::BadPhdrType(ph.p_type));
        }
        Ok((table, (ph.p_filesz as usize / PHDR_SIZE) as u32))
    }

    /// First program header of the given type, if any.
    pub fn find_phdr(&self, ptype: u32) -> LoadResult<Option<Elf32Phdr>> {
        let (table, count) = self.phdr_table()?;
        for i in 0..count {
            let mut buf = [0u8; PHDR_SIZE];
            self.read_abs(table + i * PHDR_SIZE as u32, &mut buf)?;
            let ph = Elf32Phdr::from_le_bytes(&buf);
            if ph.p_type == ptype {
                return Ok(Some(ph));
            }
        }
        Ok(None)
    }

    /// Raw value of a dynamic tag; pointer-valued tags are absolute after
    /// linking.
    pub fn dynamic_val(&self, tag: u32) -> LoadResult<Option<u32>> {
        let Some(dynamic) = self.find_phdr(PT_DYNAMIC)? else {
            return Ok(None);
        };
        let mut addr = dynamic.p_paddr;
        loop {
            let mut buf = [0u8; DYN_SIZE];
            self.read_abs(addr, &mut buf)?;
            let dy = Elf32Dyn::from_le_bytes(&buf);
            if dy.d_tag == DT_NULL {
                return Ok(None);
            }
            if dy.d_tag == tag {
                return Ok(Some(dy.d_val));
            }
            addr += DYN_SIZE as u32;
        }
    }

    /// The image's `DT_SONAME`, if it carries one.
    pub fn soname(&self) -> LoadResult<Option<String<NAME_MAX>>> {
        let Some(off) = self.dynamic_val(DT_SONAME)? else {
            return Ok(None);
        };
        let Some(strtab) = self.dynamic_val(DT_STRTAB)? else {
            return Ok(None);
        };
        Ok(Some(self.read_cstr(strtab + off)?))
    }

    /// Hash-table scan for the first non-local, default-visibility
    /// definition of `name` in this image.
    pub fn lookup(&self, name: &str) -> LoadResult<Option<u32>> {
        let (Some(hash), Some(strtab), Some(symtab)) = (
            self.dynamic_val(DT_HASH)?,
            self.dynamic_val(DT_STRTAB)?,
            self.dynamic_val(DT_SYMTAB)?,
        ) else {
            return Ok(None);
        };
        let syment = self.dynamic_val(DT_SYMENT)?.unwrap_or(SYM_SIZE as u32);

        let mut hash_hdr = [0u8; 8];
        self.read_abs(hash, &mut hash_hdr)?;
        let nbucket = read_u32(&hash_hdr, 0);
        let nchain = read_u32(&hash_hdr, 4);
        if nbucket == 0 {
            return Ok(None);
        }

        let buckets = hash + 8;
        let chains = buckets + 4 * nbucket;
        let mut idx_buf = [0u8; 4];
        self.read_abs(buckets + 4 * (elf_hash(name.as_bytes()) % nbucket), &mut idx_buf)?;
        let mut idx = u32::from_le_bytes(idx_buf);

        let mut steps = 0;
        while idx != 0 && steps < nchain {
            let mut buf = [0u8; SYM_SIZE];
            self.read_abs(symtab + idx * syment, &mut buf)?;
            let sym = Elf32Sym::from_le_bytes(&buf);
            if sym.bind() != STB_LOCAL && sym.visibility() == STV_DEFAULT {
                let sym_name = self.read_cstr(strtab + sym.st_name)?;
                if sym_name.as_str() == name {
                    return Ok(Some(sym.st_value));
                }
            }
            self.read_abs(chains + 4 * idx, &mut idx_buf)?;
            idx = u32::from_le_bytes(idx_buf);
            steps += 1;
        }
        Ok(None)
    }
}
