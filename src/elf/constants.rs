//! ELF Constants and Type Definitions
//!
//! Constants for ELF32 parsing and in-place linking of ARM/Thumb images.

/// ELF identification
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1; // Little-endian
pub const EM_ARM: u16 = 40;
pub const ET_EXEC: u16 = 2; // Executable file

/// Program header types
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_PHDR: u32 = 6;
/// OS-specific end-of-needed-content marker; its address is where the
/// committed slice is trimmed to
pub const PT_IMAGE_END: u32 = 0x6000_0000;

/// Program header flags
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// Dynamic section tags
pub const DT_NULL: u32 = 0;
pub const DT_PLTRELSZ: u32 = 2;
pub const DT_PLTGOT: u32 = 3;
pub const DT_HASH: u32 = 4;
pub const DT_STRTAB: u32 = 5;
pub const DT_SYMTAB: u32 = 6;
pub const DT_RELA: u32 = 7;
pub const DT_RELASZ: u32 = 8;
pub const DT_RELAENT: u32 = 9;
pub const DT_SYMENT: u32 = 11;
pub const DT_INIT: u32 = 12;
pub const DT_FINI: u32 = 13;
pub const DT_SONAME: u32 = 14;
pub const DT_REL: u32 = 17;
pub const DT_RELSZ: u32 = 18;
pub const DT_RELENT: u32 = 19;
pub const DT_DEBUG: u32 = 21;
pub const DT_JMPREL: u32 = 23;
pub const DT_INIT_ARRAY: u32 = 25;
pub const DT_FINI_ARRAY: u32 = 26;
pub const DT_LOOS: u32 = 0x6000_0000;
pub const DT_HIOS: u32 = 0x6FFF_FFFF;

/// Section header index values carried by symbols
pub const SHN_UNDEF: u16 = 0;
pub const SHN_LORESERVE: u16 = 0xff00;
pub const SHN_ABS: u16 = 0xfff1;

/// Symbol binding and visibility
pub const STB_LOCAL: u8 = 0;
pub const STV_DEFAULT: u8 = 0;

/// ARM relocation types the linker implements
pub const R_ARM_ABS32: u32 = 2;
pub const R_ARM_THM_PC22: u32 = 10;
pub const R_ARM_THM_JUMP24: u32 = 30;
pub const R_ARM_TARGET1: u32 = 38;

/// Fixed bound on symbol and interpreter names
pub const NAME_MAX: usize = 64;
