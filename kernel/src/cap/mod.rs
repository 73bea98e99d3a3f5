//! # Capability Directory
//!
//! Every protection domain owns a directory ([`CSpace`]) mapping small
//! integer ids to kernel objects. Ids only mean something relative to the
//! domain that holds them.
//!
//! ## Design
//!
//! Objects live in the [`ObjectTable`] arena. A directory entry stores the
//! object's [`ObjectId`]; the object stores a back-link `(pd, cap)` for every
//! entry. Back-links are used to count references and to remove every entry
//! of an object when it is destroyed.
//!
//! ## Security Properties
//!
//! - **No Forgery**: entries are only created by the kernel, either for a
//!   freshly constructed object or by mapping an existing entry
//! - **Monotonic Rights**: a mapped entry never has more rights than its source
//! - **Total Invalidation**: destroying an object removes all of its entries
//!   at once; no directory can observe a half-destroyed object
//! - **Unforgeable Identity**: badges are set by whoever mints the entry,
//!   never by the thread sending through it

mod cspace;
mod object;
mod rights;
mod table;

pub use cspace::{CSpace, CapEntry};
pub use object::{KernelObject, ObjectId, ObjectKind};
pub use rights::Rights;
pub use table::{ObjectEntry, ObjectTable};

use crate::error::{InvariantViolation, KernelError, KernelResult, ProtocolViolation};

/// Directory-local capability id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CapId(pub u32);

impl CapId {
    /// The reserved "no capability" id
    pub const NONE: CapId = CapId(0);

    /// Decode a register argument; out-of-range values never resolve.
    pub fn from_arg(arg: u64) -> Self {
        u32::try_from(arg).map_or(Self::NONE, CapId)
    }

    /// Whether this is the reserved id
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl core::fmt::Display for CapId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cap:{}", self.0)
    }
}

/// Opaque caller identity attached to a directory entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Badge(pub u64);

impl Badge {
    /// Unbadged entry
    pub const NONE: Badge = Badge(0);
}

impl ObjectTable {
    /// Create a directory entry in `pd` for `object`.
    pub fn allocate_cap(
        &mut self,
        pd: ObjectId,
        object: ObjectId,
        rights: Rights,
        badge: Badge,
    ) -> KernelResult<CapId> {
        let kind = self
            .kind(object)
            .ok_or(InvariantViolation::MissingObject(object))?;
        let domain = self.pd_mut(pd).ok_or(InvariantViolation::MissingObject(pd))?;
        if domain.is_dying() {
            return Err(ProtocolViolation::PdDying.into());
        }

        let cap = domain.cspace.insert(CapEntry {
            object,
            kind,
            rights,
            badge,
        })?;
        self.add_link(object, pd, cap);
        log::trace!("{pd} {cap} -> {object} ({kind:?}, {rights})");
        Ok(cap)
    }

    /// Resolve `cap` in `pd`.
    pub fn lookup_cap(&self, pd: ObjectId, cap: CapId) -> KernelResult<CapEntry> {
        let domain = self.pd(pd).ok_or(InvariantViolation::MissingObject(pd))?;
        let entry = *domain.cspace.get(cap)?;
        if !self.contains(entry.object) {
            return Err(InvariantViolation::DanglingEntry {
                pd,
                cap,
                object: entry.object,
            }
            .into());
        }
        Ok(entry)
    }

    /// Resolve `cap` in `pd` and check the object kind and rights.
    pub fn lookup_typed(
        &self,
        pd: ObjectId,
        cap: CapId,
        kind: ObjectKind,
        rights: Rights,
    ) -> KernelResult<CapEntry> {
        let entry = self.lookup_cap(pd, cap)?;
        if entry.kind != kind {
            return Err(KernelError::WrongKind {
                expected: kind,
                found: entry.kind,
            });
        }
        if !rights.is_subset_of(entry.rights) {
            return Err(KernelError::InsufficientRights(rights - entry.rights));
        }
        Ok(entry)
    }

    /// Duplicate an entry of `src` into `dst`.
    ///
    /// The new entry's rights are the source rights restricted by `mask`.
    /// An unbadged source may be minted with `badge`; a badged source keeps
    /// its badge.
    pub fn map_cap(
        &mut self,
        src: ObjectId,
        cap: CapId,
        dst: ObjectId,
        mask: Rights,
        badge: Badge,
    ) -> KernelResult<CapId> {
        let entry = self.lookup_cap(src, cap)?;
        if !entry.rights.contains(Rights::GRANT) {
            return Err(KernelError::InsufficientRights(Rights::GRANT));
        }
        let badge = if entry.badge == Badge::NONE {
            badge
        } else {
            entry.badge
        };
        self.allocate_cap(dst, entry.object, entry.rights & mask, badge)
    }

    /// Remove one entry of `pd`.
    ///
    /// Returns the referenced object if this was its last entry; the caller
    /// must then destroy it.
    pub fn revoke_cap(&mut self, pd: ObjectId, cap: CapId) -> KernelResult<Option<ObjectId>> {
        let domain = self.pd_mut(pd).ok_or(InvariantViolation::MissingObject(pd))?;
        let entry = domain.cspace.remove(cap)?;
        if !self.remove_link(entry.object, pd, cap) {
            return Err(InvariantViolation::BackLink {
                object: entry.object,
                pd,
                cap,
            }
            .into());
        }
        log::trace!("{pd} {cap} revoked");
        Ok((self.ref_count(entry.object) == 0).then_some(entry.object))
    }

    /// Remove every entry referencing `object`, in every directory.
    pub fn unlink_all(&mut self, object: ObjectId) -> KernelResult<usize> {
        let links = match self.get_mut(object) {
            Some(entry) => entry.take_links(),
            None => return Err(InvariantViolation::MissingObject(object).into()),
        };

        for &(pd, cap) in &links {
            let removed = self
                .pd_mut(pd)
                .and_then(|domain| domain.cspace.remove(cap).ok());
            if removed.map(|entry| entry.object) != Some(object) {
                return Err(InvariantViolation::BackLink { object, pd, cap }.into());
            }
        }
        Ok(links.len())
    }
}
