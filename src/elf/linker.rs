//! Image linker
//!
//! Makes a just-loaded image internally consistent and externally
//! resolvable: relocates its program headers, rewrites its dynamic section,
//! resolves its symbol table against the global resolver, and patches its
//! relocations in place. Stages run strictly in order; the first failure
//! aborts the load with the arena un-committed.

use crate::console_println;
use crate::error::{LoadError, LoadResult};
use crate::heap::ImageHeader;

use super::addr::{TaggedAddr, TAG_FLASH, TAG_RAM};
use super::constants::*;
use super::loader::ImageLoader;
use super::structures::{
    Elf32Dyn, Elf32Phdr, Elf32Rel, Elf32Rela, Elf32Sym, DYN_SIZE, PHDR_SIZE, REL_SIZE, RELA_SIZE,
    SYM_SIZE,
};

/// Dynamic-tag values the linker resolves and hands to interp hooks.
/// Addresses are absolute after stage 2; zero means the tag was absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkTables {
    pub hash: u32,
    pub strtab: u32,
    pub symtab: u32,
    pub syment: u32,
    pub rel: u32,
    pub relsz: u32,
    pub relent: u32,
    pub rela: u32,
    pub relasz: u32,
    pub relaent: u32,
}

/// Invoked after commit with the finalized header record.
pub type PostLinkFn = fn(&ImageHeader) -> LoadResult<()>;

/// The `PT_INTERP`-driven extension point: resolved by name from the
/// runtime registry and run between relocation processing and commit.
pub trait InterpHook: Sync {
    fn post_link(
        &self,
        loader: &mut ImageLoader<'_>,
        tables: &LinkTables,
    ) -> LoadResult<Option<PostLinkFn>>;
}

/// Process-wide name lookup the linker resolves against: firmware exports
/// plus every previously committed image, in chain order.
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<u32>;
    fn interp_hook(&self, name: &str) -> Option<&dyn InterpHook>;
}

pub struct ImageLinker<'d> {
    loader: ImageLoader<'d>,
    tables: LinkTables,
    dynamic: Option<Elf32Phdr>,
    interp: Option<Elf32Phdr>,
    end_marker: Option<Elf32Phdr>,
}

impl<'d> ImageLinker<'d> {
    /// Run every link stage and commit. Returns the committed header's
    /// absolute address.
    pub fn link(loader: ImageLoader<'d>, resolver: &dyn SymbolResolver) -> LoadResult<u32> {
        let mut lk = ImageLinker {
            loader,
            tables: LinkTables::default(),
            dynamic: None,
            interp: None,
            end_marker: None,
        };

        lk.walk_program_headers()?;
        lk.process_dynamic()?;
        lk.resolve_symbols(resolver)?;
        lk.apply_relocations()?;
        let callback = lk.run_interp_hook(resolver)?;

        if let Some(end) = lk.end_marker {
            lk.loader.heap_mut().trim(end.p_paddr)?;
        }

        let entry = lk.dynamic.map(|d| d.p_vaddr).unwrap_or(0);
        let mut heap = lk.loader.into_heap();
        heap.set_entry(entry);
        let (header_addr, header) = heap.close()?;

        if let Some(cb) = callback {
            cb(&header).map_err(|_| LoadError::HookFailed)?;
        }
        Ok(header_addr)
    }

    /// Stage 1: relocate the structural program headers in place and grow
    /// the arena over every loadable span.
    fn walk_program_headers(&mut self) -> LoadResult<()> {
        let (table, phdr0) = self.loader.find_phdrs()?;
        let count = (phdr0.p_filesz as usize / PHDR_SIZE) as u32;
        for i in 0..count {
            let addr = table + i * PHDR_SIZE as u32;
            let mut buf = [0u8; PHDR_SIZE];
            self.loader.heap().pread(addr, &mut buf)?;
            let mut ph = Elf32Phdr::from_le_bytes(&buf);

            match ph.p_type {
                PT_LOAD | PT_DYNAMIC | PT_INTERP | PT_IMAGE_END => {}
                _ => continue,
            }

            let paddr_tag = TaggedAddr(ph.p_paddr).tag();
            let vaddr_tag = TaggedAddr(ph.p_vaddr).tag();
            ph.p_paddr = self.loader.relocate(TaggedAddr(ph.p_paddr))?;
            ph.p_vaddr = self.loader.relocate(TaggedAddr(ph.p_vaddr))?;
            self.loader.heap_mut().pwrite(addr, &ph.to_le_bytes())?;

            match ph.p_type {
                PT_LOAD => {
                    if paddr_tag == TAG_FLASH {
                        // memsz, not filesz: over-committed scratch past the
                        // file bytes is reserved here and trimmed at stage 6
                        let end = ph.p_paddr + ph.p_memsz;
                        if end > self.loader.heap().flash_end() {
                            self.loader.heap_mut().seek(end)?;
                        }
                    }
                    if vaddr_tag == TAG_RAM {
                        let end = ph.p_vaddr + ph.p_memsz;
                        if end > self.loader.heap().ram_end() {
                            self.loader.heap_mut().set_ram(end)?;
                        }
                    }
                }
                PT_DYNAMIC => self.dynamic = Some(ph),
                PT_INTERP => self.interp = Some(ph),
                PT_IMAGE_END => self.end_marker = Some(ph),
                _ => {}
            }
        }
        Ok(())
    }

    /// Stage 2: rewrite pointer-valued dynamic tags and record the table
    /// descriptors.
    fn process_dynamic(&mut self) -> LoadResult<()> {
        let Some(dynamic) = self.dynamic else {
            return Ok(());
        };
        let mut addr = dynamic.p_paddr;
        loop {
            if !self.loader.heap().is_valid_ptr(addr) {
                return Err(LoadError::AddressFault(addr));
            }
            let mut buf = [0u8; DYN_SIZE];
            self.loader.heap().pread(addr, &mut buf)?;
            let mut dy = Elf32Dyn::from_le_bytes(&buf);
            if dy.d_tag == DT_NULL {
                break;
            }

            if is_pointer_tag(dy.d_tag) {
                dy.d_val = self.loader.relocate(TaggedAddr(dy.d_val))?;
                self.loader.heap_mut().pwrite(addr, &dy.to_le_bytes())?;
            }

            match dy.d_tag {
                DT_HASH => self.tables.hash = dy.d_val,
                DT_STRTAB => self.tables.strtab = dy.d_val,
                DT_SYMTAB => self.tables.symtab = dy.d_val,
                DT_SYMENT => self.tables.syment = dy.d_val,
                DT_REL => self.tables.rel = dy.d_val,
                DT_RELSZ => self.tables.relsz = dy.d_val,
                DT_RELENT => self.tables.relent = dy.d_val,
                DT_RELA => self.tables.rela = dy.d_val,
                DT_RELASZ => self.tables.relasz = dy.d_val,
                DT_RELAENT => self.tables.relaent = dy.d_val,
                _ => {}
            }
            addr += DYN_SIZE as u32;
        }
        Ok(())
    }

    /// Stage 3: resolve or relocate every symbol, marking each absolute.
    fn resolve_symbols(&mut self, resolver: &dyn SymbolResolver) -> LoadResult<()> {
        let t = self.tables;
        if t.hash == 0 || t.strtab == 0 || t.symtab == 0 || t.syment == 0 {
            return Ok(());
        }
        let mut hash_hdr = [0u8; 8];
        self.loader.heap().pread(t.hash, &mut hash_hdr)?;
        let nsyms = u32::from_le_bytes([hash_hdr[4], hash_hdr[5], hash_hdr[6], hash_hdr[7]]);

        for i in 1..nsyms {
            let addr = t.symtab + i * t.syment;
            let mut buf = [0u8; SYM_SIZE];
            self.loader.heap().pread(addr, &mut buf)?;
            let mut sym = Elf32Sym::from_le_bytes(&buf);

            if sym.st_shndx == SHN_UNDEF {
                let name = self.loader.read_cstr(t.strtab + sym.st_name)?;
                let value = resolver
                    .resolve(name.as_str())
                    .ok_or_else(|| LoadError::UnresolvedSymbol(name.clone()))?;
                sym.st_value = value;
                sym.st_shndx = SHN_ABS;
            } else if sym.st_shndx < SHN_LORESERVE {
                let value = self.loader.relocate(TaggedAddr(sym.st_value))?;
                if !self.loader.heap().is_valid_ptr(value) {
                    return Err(LoadError::AddressFault(value));
                }
                sym.st_value = value;
                sym.st_shndx = SHN_ABS;
            } else {
                continue;
            }
            self.loader.heap_mut().pwrite(addr, &sym.to_le_bytes())?;
        }
        Ok(())
    }

    /// Stage 4: apply explicit-addend entries first, then derived-addend
    /// ones.
    fn apply_relocations(&mut self) -> LoadResult<()> {
        let t = self.tables;
        if t.rela != 0 && t.relaent as usize >= RELA_SIZE {
            for i in 0..t.relasz / t.relaent {
                let mut buf = [0u8; RELA_SIZE];
                self.loader.heap().pread(t.rela + i * t.relaent, &mut buf)?;
                let r = Elf32Rela::from_le_bytes(&buf);
                self.apply_one(r.r_offset, r.rtype(), r.sym(), Some(r.r_addend))?;
            }
        }
        if t.rel != 0 && t.relent as usize >= REL_SIZE {
            for i in 0..t.relsz / t.relent {
                let mut buf = [0u8; REL_SIZE];
                self.loader.heap().pread(t.rel + i * t.relent, &mut buf)?;
                let r = Elf32Rel::from_le_bytes(&buf);
                self.apply_one(r.r_offset, r.rtype(), r.sym(), None)?;
            }
        }
        Ok(())
    }

    fn apply_one(
        &mut self,
        r_offset: u32,
        rtype: u32,
        sym_index: u32,
        addend: Option<i32>,
    ) -> LoadResult<()> {
        let s = self.sym_value(sym_index)?;
        let p = self.loader.relocate(TaggedAddr(r_offset))?;
        if !self.loader.heap().is_valid_ptr(p) {
            return Err(LoadError::AddressFault(p));
        }

        match rtype {
            R_ARM_ABS32 | R_ARM_TARGET1 => {
                let a = match addend {
                    Some(a) => a,
                    None => {
                        let mut w = [0u8; 4];
                        self.loader.heap().pread(p, &mut w)?;
                        u32::from_le_bytes(w) as i32
                    }
                };
                let value = s.wrapping_add(a as u32);
                self.loader.heap_mut().pwrite(p, &value.to_le_bytes())?;
            }
            R_ARM_THM_PC22 | R_ARM_THM_JUMP24 => {
                let mut w = [0u8; 4];
                self.loader.heap().pread(p, &mut w)?;
                let upper = u16::from_le_bytes([w[0], w[1]]);
                let lower = u16::from_le_bytes([w[2], w[3]]);
                let a = addend.unwrap_or_else(|| thumb22_decode(upper, lower));
                let value = s.wrapping_add(a as u32).wrapping_sub(p);
                // Branch offset in half-words, signed 22-bit field
                let hw = (value as i32) >> 1;
                if (hw >> 21) != 0 && (hw >> 21) != -1 {
                    return Err(LoadError::AddressFault(p));
                }
                let (nu, nl) = thumb22_encode(upper, lower, hw);
                w[0..2].copy_from_slice(&nu.to_le_bytes());
                w[2..4].copy_from_slice(&nl.to_le_bytes());
                self.loader.heap_mut().pwrite(p, &w)?;
            }
            other => {
                console_println!("[x] relocation type {} not supported", other);
                return Err(LoadError::UnsupportedRelocation(other));
            }
        }
        Ok(())
    }

    fn sym_value(&self, index: u32) -> LoadResult<u32> {
        if index == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; SYM_SIZE];
        self.loader
            .heap()
            .pread(self.tables.symtab + index * self.tables.syment, &mut buf)?;
        Ok(Elf32Sym::from_le_bytes(&buf).st_value)
    }

    /// Stage 5: resolve and run the interpreter hook, if the image names
    /// one.
    fn run_interp_hook(
        &mut self,
        resolver: &dyn SymbolResolver,
    ) -> LoadResult<Option<PostLinkFn>> {
        let Some(interp) = self.interp else {
            return Ok(None);
        };
        let name = self.loader.read_cstr(interp.p_paddr)?;
        let hook = resolver
            .interp_hook(name.as_str())
            .ok_or_else(|| LoadError::UnknownInterp(name.clone()))?;
        console_println!("[i] running interp hook '{}'", name);
        hook.post_link(&mut self.loader, &self.tables)
    }
}

fn is_pointer_tag(tag: u32) -> bool {
    matches!(
        tag,
        DT_PLTGOT
            | DT_HASH
            | DT_STRTAB
            | DT_SYMTAB
            | DT_RELA
            | DT_REL
            | DT_INIT
            | DT_FINI
            | DT_DEBUG
            | DT_JMPREL
            | DT_INIT_ARRAY
            | DT_FINI_ARRAY
    ) || (DT_LOOS..=DT_HIOS).contains(&tag) && tag & 1 == 0
}

/// Unpack the split 11+11-bit Thumb-2 branch immediate: sign-extended from
/// 22 bits of half-words, doubled to byte units.
fn thumb22_decode(upper: u16, lower: u16) -> i32 {
    let imm = (((upper as u32 & 0x7FF) << 11) | (lower as u32 & 0x7FF)) as i32;
    ((imm << 10) >> 10) << 1
}

/// Pack a half-word branch offset back into the immediate fields, leaving
/// every other instruction bit untouched.
fn thumb22_encode(upper: u16, lower: u16, hw: i32) -> (u16, u16) {
    let v = hw as u32;
    (
        (upper & 0xF800) | ((v >> 11) & 0x7FF) as u16,
        (lower & 0xF800) | (v & 0x7FF) as u16,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumb22_roundtrip() {
        // BL opcode bits with a positive offset
        let (u0, l0) = (0xF000u16, 0xF800u16);
        for off in [0i32, 2, 0x1FE, 0x3F_FFFE, -2, -0x400, -0x40_0000] {
            let hw = off >> 1;
            let (u, l) = thumb22_encode(u0, l0, hw);
            assert_eq!(thumb22_decode(u, l), off, "offset {:#x}", off);
            // Opcode bits preserved
            assert_eq!(u & 0xF800, 0xF000);
            assert_eq!(l & 0xF800, 0xF800);
        }
    }

    #[test]
    fn test_thumb22_decode_sign_extension() {
        // All-ones immediate is -2 bytes
        assert_eq!(thumb22_decode(0xF7FF, 0xFFFF), -2);
        // Zero immediate is zero
        assert_eq!(thumb22_decode(0xF000, 0xF800), 0);
    }

    #[test]
    fn test_pointer_tags() {
        assert!(is_pointer_tag(DT_HASH));
        assert!(is_pointer_tag(DT_INIT_ARRAY));
        assert!(is_pointer_tag(0x6000_0010));
        assert!(!is_pointer_tag(0x6000_0011));
        assert!(!is_pointer_tag(DT_RELSZ));
        assert!(!is_pointer_tag(DT_SONAME));
    }
}
