//! Address-space model
//!
//! ## Components
//!
//! - Translation tables (per protection domain, page granular)
//! - Address-space identifier allocation with flush-before-reuse
//! - Per-core translation caches tagged by ASID
//!
//! Page-table formats are architecture specific and live outside this
//! crate; the kernel core only needs the page-granular mapping relation and
//! the rule that cached translations of a reclaimed ASID must be gone before
//! the ASID is handed out again.

mod asid;
mod tlb;
mod translation;

pub use asid::{Asid, AsidAllocator, FlushedAsid};
pub use tlb::Tlb;
pub use translation::{Mapping, TranslationTable};

use bitflags::bitflags;

/// Page size
pub const PAGE_SIZE: u64 = 4096;

/// Physical address type
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Create a new physical address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address starts a page
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

/// Virtual address type
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// Create a new virtual address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address starts a page
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Virtual page number
    pub const fn page(self) -> u64 {
        self.0 / PAGE_SIZE
    }

    /// Offset inside the page
    pub const fn page_offset(self) -> u64 {
        self.0 % PAGE_SIZE
    }
}

bitflags! {
    /// Memory protection flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Kind of a memory access, as reported by a fault
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    /// Load
    Read = 0,
    /// Store
    Write = 1,
    /// Instruction fetch
    Execute = 2,
}

impl AccessKind {
    /// Protection bit an access of this kind needs
    pub fn required(self) -> Protection {
        match self {
            AccessKind::Read => Protection::READ,
            AccessKind::Write => Protection::WRITE,
            AccessKind::Execute => Protection::EXECUTE,
        }
    }

    /// Decode the ABI value
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Execute),
            _ => None,
        }
    }
}
