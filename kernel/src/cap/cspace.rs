//! Capability Space (CSpace): one protection domain's directory

use hashbrown::HashMap;

use super::{Badge, CapId, ObjectId, ObjectKind, Rights};
use crate::error::{KernelError, KernelResult, Resource};

/// One directory entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapEntry {
    /// Referenced object
    pub object: ObjectId,
    /// Kind of the referenced object
    pub kind: ObjectKind,
    /// Rights granted through this entry
    pub rights: Rights,
    /// Identity stamped on IPC sent through this entry
    pub badge: Badge,
}

/// Capability space: capability id to entry
///
/// Ids come from a monotonic counter. After the counter wraps, ids still
/// held by live entries are skipped, so an id is never handed out twice
/// while in use.
#[derive(Clone)]
pub struct CSpace {
    entries: HashMap<CapId, CapEntry>,
    next: u32,
    quota: usize,
}

impl CSpace {
    /// Create a new capability space
    pub fn new(quota: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next: 1,
            quota,
        }
    }

    /// Insert an entry under a fresh id
    pub fn insert(&mut self, entry: CapEntry) -> KernelResult<CapId> {
        if self.entries.len() >= self.quota {
            return Err(Resource::CapabilitySlots.into());
        }

        let id = loop {
            let candidate = CapId(self.next);
            self.next = self.next.checked_add(1).unwrap_or(1);
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        self.entries.insert(id, entry);
        Ok(id)
    }

    /// Resolve an id
    pub fn get(&self, cap: CapId) -> KernelResult<&CapEntry> {
        self.entries
            .get(&cap)
            .ok_or(KernelError::InvalidCapability(cap))
    }

    /// Remove an entry
    pub fn remove(&mut self, cap: CapId) -> KernelResult<CapEntry> {
        self.entries
            .remove(&cap)
            .ok_or(KernelError::InvalidCapability(cap))
    }

    /// Whether `cap` is a live id
    pub fn contains(&self, cap: CapId) -> bool {
        self.entries.contains_key(&cap)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the space is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (CapId, &CapEntry)> {
        self.entries.iter().map(|(&id, entry)| (id, entry))
    }

    /// First id referencing `object`, if any
    pub fn find(&self, object: ObjectId) -> Option<CapId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.object == object)
            .map(|(&id, _)| id)
            .min()
    }

    #[cfg(test)]
    pub(crate) fn set_next(&mut self, next: u32) {
        self.next = next;
    }
}
