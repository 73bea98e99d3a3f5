//! Protection domains
//!
//! A protection domain pairs a capability directory with an address space.
//! Every thread is bound to exactly one domain for its whole life.
//!
//! Teardown runs in a fixed order: mark the domain dying so nothing new is
//! placed in it, kill its threads, revoke every directory entry, flush its
//! ASID from every core, and only then hand the ASID back to the pool.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::cap::{CSpace, CapId, KernelObject, ObjectId, ObjectKind, Rights};
use crate::cpu::CpuId;
use crate::error::{InvariantViolation, KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mem::{AccessKind, Asid, FlushedAsid, PhysAddr, Protection, TranslationTable, VirtAddr};
use crate::sched::ThreadId;

/// Protection domain identifier
pub type PdId = ObjectId;

/// Protection domain
pub struct ProtectionDomain {
    pub(crate) cspace: CSpace,
    pub(crate) table: TranslationTable,
    pub(crate) threads: Vec<ThreadId>,
    asid: Option<Asid>,
    dying: bool,
}

impl ProtectionDomain {
    /// Create a domain with an empty directory and address space
    pub fn new(asid: Asid, cspace_quota: usize) -> Self {
        Self {
            cspace: CSpace::new(cspace_quota),
            table: TranslationTable::new(),
            threads: Vec::new(),
            asid: Some(asid),
            dying: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(asid: u16, cspace_quota: usize) -> Self {
        Self::new(Asid(asid), cspace_quota)
    }

    /// ASID of the address space; `None` once torn down
    pub fn asid(&self) -> Option<Asid> {
        self.asid
    }

    /// Whether teardown has started
    pub fn is_dying(&self) -> bool {
        self.dying
    }

    /// Capability directory
    pub fn cspace(&self) -> &CSpace {
        &self.cspace
    }

    /// Page table
    pub fn table(&self) -> &TranslationTable {
        &self.table
    }

    /// Threads bound to this domain
    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }
}

impl Kernel {
    /// Create a protection domain owned by the caller's domain.
    pub fn create_pd(&mut self, caller: ThreadId) -> KernelResult<CapId> {
        let inv = self.invoker(caller)?;
        let asid = self.asids.allocate()?;
        let domain = ProtectionDomain::new(asid, self.config.cspace_quota);

        match self.install(inv.pd, KernelObject::Pd(domain)) {
            Ok((pd, cap)) => {
                log::debug!("{pd} created with ASID {asid}");
                Ok(cap)
            }
            Err(err) => {
                // never installed on a core, nothing can be cached
                if self.asids.is_allocated(asid) {
                    self.asids.release(FlushedAsid::new(asid));
                }
                Err(err)
            }
        }
    }

    /// Destroy the domain behind `pd_cap`.
    pub fn kill_pd(&mut self, caller: ThreadId, pd_cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        self.resolve(inv.pd, pd_cap, ObjectKind::Pd, Rights::DESTROY)?;
        self.delete_object(caller, pd_cap)
    }

    /// Map one page into the domain behind `pd_cap`.
    pub fn map_page(
        &mut self,
        caller: ThreadId,
        pd_cap: CapId,
        virt: VirtAddr,
        frame: PhysAddr,
        protection: Protection,
    ) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let pd = self.resolve(inv.pd, pd_cap, ObjectKind::Pd, Rights::CONTROL)?;
        let domain = self.pd_mut(pd)?;
        let replaced = domain.table.map(virt, frame, protection)?;
        let asid = domain.asid;

        if let (Some(_), Some(asid)) = (replaced, asid) {
            self.flush_page_everywhere(asid, virt);
        }
        Ok(())
    }

    /// Remove one page from the domain behind `pd_cap`.
    ///
    /// Returns whether a mapping existed.
    pub fn unmap_page(&mut self, caller: ThreadId, pd_cap: CapId, virt: VirtAddr) -> KernelResult<bool> {
        let inv = self.invoker(caller)?;
        let pd = self.resolve(inv.pd, pd_cap, ObjectKind::Pd, Rights::CONTROL)?;
        let domain = self.pd_mut(pd)?;
        let removed = domain.table.unmap(virt).is_some();
        if let Some(asid) = domain.asid {
            self.flush_page_everywhere(asid, virt);
        }
        Ok(removed)
    }

    /// Drop every cached translation of the domain behind `pd_cap`.
    pub fn update_pd(&mut self, caller: ThreadId, pd_cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let pd = self.resolve(inv.pd, pd_cap, ObjectKind::Pd, Rights::CONTROL)?;
        if let Some(asid) = self.pd_mut(pd)?.asid {
            for cpu in &mut self.cpus {
                cpu.tlb.flush_asid(asid);
            }
        }
        Ok(())
    }

    /// Drop cached translations of one page of the domain behind `pd_cap`.
    pub fn update_region(&mut self, caller: ThreadId, pd_cap: CapId, virt: VirtAddr) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let pd = self.resolve(inv.pd, pd_cap, ObjectKind::Pd, Rights::CONTROL)?;
        if let Some(asid) = self.pd_mut(pd)?.asid {
            self.flush_page_everywhere(asid, virt);
        }
        Ok(())
    }

    /// Translate an access by the thread running on `cpu` the way its MMU
    /// would: translation cache first, then the page table.
    ///
    /// `None` means the access faults; the board reports it with
    /// [`crate::EntryCause::PageFault`].
    pub fn access(&mut self, cpu: CpuId, virt: VirtAddr, kind: AccessKind) -> Option<PhysAddr> {
        let core = self.cpus.get_mut(cpu.index())?;
        let space = core.active?;
        if let Some(phys) = core.tlb.lookup(space.asid, virt, kind) {
            return Some(phys);
        }

        let mapping = self
            .objects
            .pd(space.pd)?
            .table
            .lookup(virt)
            .filter(|m| m.permits(kind))?;
        core.tlb.fill(space.asid, virt, mapping);
        Some(PhysAddr::new(mapping.frame.as_u64() + virt.page_offset()))
    }

    fn flush_page_everywhere(&mut self, asid: Asid, virt: VirtAddr) {
        for cpu in &mut self.cpus {
            cpu.tlb.flush_page(asid, virt);
        }
    }

    /// Remove every trace of `asid` from every core.
    fn flush_asid_everywhere(&mut self, asid: Asid) -> FlushedAsid {
        for cpu in &mut self.cpus {
            let dropped = cpu.tlb.flush_asid(asid);
            if cpu.active.is_some_and(|space| space.asid == asid) {
                cpu.active = None;
            }
            if dropped > 0 {
                log::trace!("core {}: flushed {dropped} translations of ASID {asid}", cpu.id());
            }
        }
        FlushedAsid::new(asid)
    }

    pub(crate) fn teardown_pd(
        &mut self,
        pd: PdId,
        pending: &mut VecDeque<ObjectId>,
    ) -> KernelResult<()> {
        let domain = self.pd_mut(pd)?;
        domain.dying = true;
        let threads = core::mem::take(&mut domain.threads);

        for thread in threads {
            self.kill(thread, KernelError::Cancelled)?;
        }

        let caps: Vec<CapId> = self.pd_mut(pd)?.cspace.iter().map(|(cap, _)| cap).collect();
        for cap in caps {
            if let Some(orphan) = self.objects.revoke_cap(pd, cap)? {
                if orphan != pd {
                    pending.push_back(orphan);
                }
            }
        }

        let domain = self.pd_mut(pd)?;
        domain.table.clear();
        if let Some(asid) = domain.asid.take() {
            let flushed = self.flush_asid_everywhere(asid);
            if !self.asids.release(flushed) {
                return Err(InvariantViolation::AsidNotAllocated(asid).into());
            }
            log::debug!("{pd} torn down, ASID {asid} released");
        }
        Ok(())
    }
}
