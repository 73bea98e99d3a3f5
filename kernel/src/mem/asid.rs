//! ASID (Address Space Identifier) allocation
//!
//! ASID 0 is reserved for the kernel. Domains get ASIDs 1..count.
//!
//! Fresh ASIDs are handed out first; once the range is used up, released
//! ASIDs are recycled oldest first. An ASID can only be released through a
//! [`FlushedAsid`], which only the per-core flush path creates, so a
//! recycled ASID can never hit translations cached for its previous owner.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KernelResult, Resource};

/// Address-space identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asid(pub u16);

impl Asid {
    /// The kernel's own ASID
    pub const KERNEL: Asid = Asid(0);
}

impl core::fmt::Display for Asid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof that no core caches translations for an ASID anymore.
#[derive(Debug, PartialEq, Eq)]
pub struct FlushedAsid(Asid);

impl FlushedAsid {
    pub(crate) fn new(asid: Asid) -> Self {
        Self(asid)
    }

    /// The flushed ASID
    pub fn asid(&self) -> Asid {
        self.0
    }
}

/// ASID allocator with flush-before-reuse
pub struct AsidAllocator {
    /// Next never-used ASID
    next_fresh: u16,
    /// One past the highest ASID
    limit: u16,
    /// Released ASIDs, oldest first
    released: VecDeque<u16>,
    /// Allocation bitmap
    bitmap: Vec<u64>,
    /// Number of times a released ASID was handed out again
    recycled: u64,
}

impl AsidAllocator {
    /// Create an allocator for `count` ASIDs, ASID 0 included
    pub fn new(count: u16) -> Self {
        let words = (count as usize).div_ceil(64);
        Self {
            next_fresh: 1,
            limit: count,
            released: VecDeque::new(),
            bitmap: vec![0; words],
            recycled: 0,
        }
    }

    /// Allocate an ASID
    pub fn allocate(&mut self) -> KernelResult<Asid> {
        let asid = if self.next_fresh < self.limit {
            let asid = self.next_fresh;
            self.next_fresh += 1;
            asid
        } else {
            let asid = self.released.pop_front().ok_or(Resource::Asids)?;
            self.recycled += 1;
            log::debug!("ASID {asid} recycled ({} reuses)", self.recycled);
            asid
        };

        self.set(asid, true);
        Ok(Asid(asid))
    }

    /// Return a flushed ASID to the pool.
    ///
    /// Returns `false` if the ASID was not allocated.
    pub fn release(&mut self, flushed: FlushedAsid) -> bool {
        let Asid(asid) = flushed.asid();
        if asid == 0 || !self.is_allocated(Asid(asid)) {
            return false;
        }
        self.set(asid, false);
        self.released.push_back(asid);
        true
    }

    /// Check if an ASID is allocated
    pub fn is_allocated(&self, Asid(asid): Asid) -> bool {
        let (word, bit) = (asid as usize / 64, asid as usize % 64);
        self.bitmap
            .get(word)
            .is_some_and(|w| w & (1u64 << bit) != 0)
    }

    /// Number of ASIDs still available
    pub fn available(&self) -> usize {
        (self.limit - self.next_fresh) as usize + self.released.len()
    }

    /// Number of recycled allocations so far
    pub fn recycled(&self) -> u64 {
        self.recycled
    }

    fn set(&mut self, asid: u16, allocated: bool) {
        let (word, bit) = (asid as usize / 64, asid as usize % 64);
        if allocated {
            self.bitmap[word] |= 1u64 << bit;
        } else {
            self.bitmap[word] &= !(1u64 << bit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;

    #[test]
    fn test_asid_zero_reserved() {
        let mut asids = AsidAllocator::new(4);
        assert_eq!(asids.allocate(), Ok(Asid(1)));
        assert!(!asids.is_allocated(Asid::KERNEL));
        assert!(!asids.release(FlushedAsid::new(Asid::KERNEL)));
    }

    #[test]
    fn test_fresh_before_recycled() {
        let mut asids = AsidAllocator::new(4);
        let a = asids.allocate().unwrap();
        assert!(asids.release(FlushedAsid::new(a)));

        assert_eq!(asids.allocate(), Ok(Asid(2)));
        assert_eq!(asids.allocate(), Ok(Asid(3)));
        assert_eq!(asids.allocate(), Ok(a));
        assert_eq!(asids.recycled(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let mut asids = AsidAllocator::new(2);
        asids.allocate().unwrap();
        assert_eq!(asids.available(), 0);
        assert_eq!(
            asids.allocate(),
            Err(KernelError::Exhausted(Resource::Asids))
        );
    }

    #[test]
    fn test_double_release_rejected() {
        let mut asids = AsidAllocator::new(8);
        let a = asids.allocate().unwrap();
        assert!(asids.release(FlushedAsid::new(a)));
        assert!(!asids.release(FlushedAsid::new(a)));
        assert_eq!(asids.available(), 7);
    }
}
