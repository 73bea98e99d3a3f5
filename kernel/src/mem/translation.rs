//! Page-granular translation table of one protection domain

use alloc::collections::BTreeMap;

use super::{AccessKind, PhysAddr, Protection, VirtAddr, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// A single page mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Backing frame
    pub frame: PhysAddr,
    /// Permitted accesses
    pub protection: Protection,
}

impl Mapping {
    /// Whether an access of `kind` is allowed
    pub fn permits(&self, kind: AccessKind) -> bool {
        self.protection.contains(kind.required())
    }
}

/// Virtual page number to mapping
#[derive(Default)]
pub struct TranslationTable {
    pages: BTreeMap<u64, Mapping>,
}

impl TranslationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the mapping of one page.
    ///
    /// Returns the replaced mapping, whose cached translations the caller
    /// must invalidate.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        frame: PhysAddr,
        protection: Protection,
    ) -> KernelResult<Option<Mapping>> {
        if !virt.is_page_aligned() || !frame.is_page_aligned() || protection.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(self.pages.insert(virt.page(), Mapping { frame, protection }))
    }

    /// Remove the mapping of the page containing `virt`
    pub fn unmap(&mut self, virt: VirtAddr) -> Option<Mapping> {
        self.pages.remove(&virt.page())
    }

    /// Mapping of the page containing `virt`
    pub fn lookup(&self, virt: VirtAddr) -> Option<Mapping> {
        self.pages.get(&virt.page()).copied()
    }

    /// Translate an access, `None` if it would fault
    pub fn translate(&self, virt: VirtAddr, kind: AccessKind) -> Option<PhysAddr> {
        let mapping = self.lookup(virt)?;
        mapping
            .permits(kind)
            .then(|| PhysAddr::new(mapping.frame.as_u64() + virt.page_offset()))
    }

    /// Number of mapped pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Drop every mapping
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Mapped ranges, lowest first
    pub fn iter(&self) -> impl Iterator<Item = (VirtAddr, Mapping)> + '_ {
        self.pages
            .iter()
            .map(|(&page, &mapping)| (VirtAddr::new(page * PAGE_SIZE), mapping))
    }
}
