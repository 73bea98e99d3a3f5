//! Per-core translation cache model
//!
//! Entries are tagged with the ASID they were filled under. A hit needs no
//! table walk, which is exactly why entries of a reclaimed ASID have to be
//! flushed before the ASID is reused.

use alloc::collections::BTreeMap;

use super::{AccessKind, Asid, Mapping, PhysAddr, VirtAddr};

/// Translation cache of one core
#[derive(Default)]
pub struct Tlb {
    entries: BTreeMap<(Asid, u64), Mapping>,
}

impl Tlb {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached translation of an access, if any
    pub fn lookup(&self, asid: Asid, virt: VirtAddr, kind: AccessKind) -> Option<PhysAddr> {
        let mapping = self.entries.get(&(asid, virt.page()))?;
        mapping
            .permits(kind)
            .then(|| PhysAddr::new(mapping.frame.as_u64() + virt.page_offset()))
    }

    /// Cache a walked translation
    pub fn fill(&mut self, asid: Asid, virt: VirtAddr, mapping: Mapping) {
        self.entries.insert((asid, virt.page()), mapping);
    }

    /// Drop one page of one address space
    pub fn flush_page(&mut self, asid: Asid, virt: VirtAddr) {
        self.entries.remove(&(asid, virt.page()));
    }

    /// Drop everything cached for an address space
    pub fn flush_asid(&mut self, asid: Asid) -> usize {
        let before = self.entries.len();
        self.entries.retain(|&(tag, _), _| tag != asid);
        before - self.entries.len()
    }

    /// Whether anything is cached for an address space
    pub fn holds(&self, asid: Asid) -> bool {
        self.entries
            .range((asid, 0)..=(asid, u64::MAX))
            .next()
            .is_some()
    }

    /// Number of cached translations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
