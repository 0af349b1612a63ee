//! Load Error Types and Result Definitions
//!
//! This module provides error handling for image loading, linking, and the
//! dlopen-style runtime API.

use core::fmt;
use heapless::String;

use crate::storage::StorageError;

/// Image loading and linking errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Underlying storage device rejected a read/write/erase
    Storage(StorageError),
    BadMagic,
    BadClass,
    BadEndian,
    BadMachine(u16),
    BadType(u16),
    /// Footer complement check failed; carries the raw footer address
    BadFooter(u32),
    /// The record the footer points at is not a PHDR slot
    BadPhdrType(u32),
    /// A symbol or interpreter name does not fit the name buffer
    NameTooLong,
    /// Header chain walk did not reach a sentinel inside the device
    CorruptChain,
    /// Tagged address with an unknown region, or out of range once resolved
    AddressFault(u32),
    UnresolvedSymbol(String<64>),
    UnsupportedRelocation(u32),
    /// No handler registered for the image's interpreter name
    UnknownInterp(String<64>),
    /// New image would sit below the execution high-water mark
    ResetNeeded,
    /// The post-link callback rejected the committed image
    HookFailed,
    /// dlopen target not present in the chain
    NotFound,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadError::Storage(e) => write!(f, "storage error: {}", e),
            LoadError::BadMagic => write!(f, "invalid ELF magic number"),
            LoadError::BadClass => write!(f, "unsupported ELF class"),
            LoadError::BadEndian => write!(f, "unsupported endianness"),
            LoadError::BadMachine(m) => write!(f, "unsupported machine type 0x{:x}", m),
            LoadError::BadType(t) => write!(f, "unsupported ELF type 0x{:x}", t),
            LoadError::BadFooter(a) => write!(f, "bad image footer address 0x{:08x}", a),
            LoadError::BadPhdrType(t) => write!(f, "bad program header type 0x{:x}", t),
            LoadError::NameTooLong => write!(f, "name too long"),
            LoadError::CorruptChain => write!(f, "corrupt image header chain"),
            LoadError::AddressFault(a) => write!(f, "address fault at 0x{:08x}", a),
            LoadError::UnresolvedSymbol(n) => write!(f, "unresolved symbol '{}'", n),
            LoadError::UnsupportedRelocation(t) => write!(f, "unsupported relocation type {}", t),
            LoadError::UnknownInterp(n) => write!(f, "unknown interpreter '{}'", n),
            LoadError::ResetNeeded => write!(f, "reset needed before loading"),
            LoadError::HookFailed => write!(f, "post-link callback failed"),
            LoadError::NotFound => write!(f, "module not found"),
        }
    }
}

impl From<StorageError> for LoadError {
    fn from(e: StorageError) -> Self {
        LoadError::Storage(e)
    }
}

/// Result type for load/link operations
pub type LoadResult<T> = Result<T, LoadError>;
