//! Per-core kernel state
//!
//! Each core owns its scheduler, its translation cache, the address space
//! currently installed on it, and a local work list. Work for one core is
//! posted to its local list and announced with an inter-processor interrupt;
//! work for every core goes to the shared [`GlobalWork`] list. A core drains
//! both lists, oldest item first, at its next kernel entry.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::mem::{Asid, Tlb};
use crate::pd::PdId;
use crate::sched::{Scheduler, ThreadId};

/// Physical core index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl CpuId {
    /// The boot core
    pub const BOOT: CpuId = CpuId(0);

    /// Index into per-core tables
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for CpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deferred work executed at a core's next kernel entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkItem {
    /// Put a woken thread into this core's ready queues
    Ready(ThreadId),
    /// Re-evaluate the scheduling decision
    Reschedule,
}

/// Address space installed on a core
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveSpace {
    /// Domain whose table is installed
    pub pd: PdId,
    /// Its ASID
    pub asid: Asid,
}

/// Kernel state of one core
pub struct Cpu {
    id: CpuId,
    pub(crate) scheduler: Scheduler,
    pub(crate) tlb: Tlb,
    pub(crate) active: Option<ActiveSpace>,
    pub(crate) current: Option<ThreadId>,
    local_work: VecDeque<WorkItem>,
    ipi_pending: bool,
    ipis: u64,
    time: u64,
}

impl Cpu {
    /// Create the state of core `id`
    pub fn new(id: CpuId, scheduler: Scheduler) -> Self {
        Self {
            id,
            scheduler,
            tlb: Tlb::new(),
            active: None,
            current: None,
            local_work: VecDeque::new(),
            ipi_pending: false,
            ipis: 0,
            time: 0,
        }
    }

    /// Core index
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Thread chosen to run, `None` while idle
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    /// Installed address space
    pub fn active(&self) -> Option<ActiveSpace> {
        self.active
    }

    /// The core's scheduler
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The core's translation cache
    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Queue work for this core and raise an IPI.
    ///
    /// Returns `true` if a new IPI had to be sent.
    pub fn post(&mut self, item: WorkItem) -> bool {
        self.local_work.push_back(item);
        let raise = !self.ipi_pending;
        self.ipi_pending = true;
        if raise {
            self.ipis += 1;
            log::trace!("IPI -> core {} ({item:?})", self.id);
        }
        raise
    }

    /// Take all local work, oldest first
    pub fn take_local_work(&mut self) -> VecDeque<WorkItem> {
        self.ipi_pending = false;
        core::mem::take(&mut self.local_work)
    }

    /// Pending local work
    pub fn local_work(&self) -> impl Iterator<Item = &WorkItem> {
        self.local_work.iter()
    }

    /// Whether an IPI is outstanding
    pub fn ipi_pending(&self) -> bool {
        self.ipi_pending
    }

    /// IPIs sent to this core so far
    pub fn ipis_sent(&self) -> u64 {
        self.ipis
    }

    /// Ticks consumed on this core
    pub fn time(&self) -> u64 {
        self.time
    }

    pub(crate) fn advance(&mut self, elapsed: u64) {
        self.time = self.time.saturating_add(elapsed);
    }

    pub(crate) fn raise_ipi(&mut self) {
        if !self.ipi_pending {
            self.ipi_pending = true;
            self.ipis += 1;
        }
    }
}

struct Broadcast {
    item: WorkItem,
    pending: u64,
}

/// Work broadcast to every core
#[derive(Default)]
pub struct GlobalWork {
    items: VecDeque<Broadcast>,
}

impl GlobalWork {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item` for cores `0..cpus`
    pub fn broadcast(&mut self, item: WorkItem, cpus: usize) {
        let pending = if cpus >= 64 {
            u64::MAX
        } else {
            (1u64 << cpus) - 1
        };
        self.items.push_back(Broadcast { item, pending });
    }

    /// Take the items `cpu` has not executed yet, oldest first
    pub fn take_for(&mut self, cpu: CpuId) -> Vec<WorkItem> {
        let bit = 1u64 << cpu.0;
        let mut taken = Vec::new();
        for broadcast in self.items.iter_mut() {
            if broadcast.pending & bit != 0 {
                broadcast.pending &= !bit;
                taken.push(broadcast.item);
            }
        }
        self.items.retain(|b| b.pending != 0);
        taken
    }

    /// Whether `cpu` has outstanding broadcast work
    pub fn pending_for(&self, cpu: CpuId) -> bool {
        let bit = 1u64 << cpu.0;
        self.items.iter().any(|b| b.pending & bit != 0)
    }

    /// Number of broadcasts not yet seen by every core
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether every core has drained every broadcast
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
