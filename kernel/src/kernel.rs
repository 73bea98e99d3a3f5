//! Kernel context and entry path
//!
//! [`Kernel`] owns every piece of kernel state: the object arena, the ASID
//! pool, one [`Cpu`] per core and the shared work list. Nothing is global;
//! boot code creates one value and every entry receives it explicitly.
//!
//! Operations are written against an explicit calling thread. The caller's
//! protection domain resolves capability ids and the caller's core decides
//! whether a woken thread is queued directly or through an IPI.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::cap::{Badge, CapEntry, CapId, KernelObject, ObjectId, ObjectKind, ObjectTable, Rights};
use crate::config::{ConfigError, KernelConfig};
use crate::cpu::{ActiveSpace, Cpu, CpuId, GlobalWork, WorkItem};
use crate::error::{InvariantViolation, KernelError, KernelResult, ProtocolViolation};
use crate::mem::{AccessKind, Asid, AsidAllocator, VirtAddr};
use crate::pd::{PdId, ProtectionDomain};
use crate::sched::{SchedContext, Scheduler, Thread, ThreadId, ThreadState};

/// Why a core entered the kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryCause {
    /// The current thread issued a kernel call
    Syscall,
    /// The current thread touched memory its domain does not map
    PageFault {
        /// Faulting address
        addr: VirtAddr,
        /// Kind of access
        kind: AccessKind,
    },
    /// Device interrupt line
    Interrupt(u32),
    /// Scheduler timer expired
    Timer,
    /// Another core posted work
    Ipi,
    /// A virtual machine stopped running
    VmExit(ObjectId),
}

/// What a core runs after leaving the kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dispatch {
    /// Core
    pub cpu: CpuId,
    /// Thread to run, `None` to idle
    pub thread: Option<ThreadId>,
    /// Address space to install
    pub asid: Option<Asid>,
    /// Ticks until the next timer entry
    pub time_slice: u64,
}

/// Boot failure
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Boot objects could not be created
    #[error("boot object creation failed: {0}")]
    Kernel(#[from] KernelError),
}

/// The calling thread of an operation
#[derive(Clone, Copy, Debug)]
pub(crate) struct Invoker {
    pub thread: ThreadId,
    pub pd: PdId,
}

/// Kernel state
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) objects: ObjectTable,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) asids: AsidAllocator,
    pub(crate) global_work: GlobalWork,
    pub(crate) irq_lines: BTreeMap<u32, ObjectId>,
    pub(crate) executing: CpuId,
    core_pd: PdId,
    core_thread: ThreadId,
}

impl Kernel {
    /// Boot a kernel.
    ///
    /// Creates the core protection domain, which holds a capability to
    /// itself, and the first thread, started on the boot core.
    pub fn new(config: KernelConfig) -> Result<Self, BootError> {
        config.validate()?;

        let cpus = (0..config.cpus)
            .map(|i| {
                Cpu::new(
                    CpuId(i as u32),
                    Scheduler::new(config.priorities, config.super_period, config.fill_slice),
                )
            })
            .collect();

        let mut kernel = Self {
            objects: ObjectTable::with_capacity(config.max_objects),
            asids: AsidAllocator::new(config.asid_count),
            cpus,
            global_work: GlobalWork::new(),
            irq_lines: BTreeMap::new(),
            executing: CpuId::BOOT,
            core_pd: ObjectId::new(0, 0),
            core_thread: ObjectId::new(0, 0),
            config,
        };

        let asid = kernel.asids.allocate()?;
        let pd = ProtectionDomain::new(asid, kernel.config.cspace_quota);
        let core_pd = kernel.objects.insert(KernelObject::Pd(pd), None)?;
        kernel
            .objects
            .allocate_cap(core_pd, core_pd, Rights::ALL, Badge::NONE)?;
        kernel.core_pd = core_pd;

        let sched = SchedContext {
            priority: kernel.config.priorities - 1,
            quota: kernel.config.default_quota,
        };
        let thread = Thread::new(core_pd, sched, None);
        let core_thread = kernel
            .objects
            .insert(KernelObject::Thread(thread), None)?;
        kernel
            .objects
            .allocate_cap(core_pd, core_thread, Rights::ALL, Badge::NONE)?;
        kernel.pd_mut(core_pd)?.threads.push(core_thread);
        kernel.core_thread = core_thread;
        kernel.activate(core_thread, CpuId::BOOT, 0, 0)?;

        log::info!(
            "kernel booted: {} cores, core pd {core_pd}, core thread {core_thread}",
            kernel.cpus.len()
        );
        Ok(kernel)
    }

    /// Configuration the kernel booted with
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Object arena
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// The core protection domain
    pub fn core_pd(&self) -> PdId {
        self.core_pd
    }

    /// The first thread
    pub fn core_thread(&self) -> ThreadId {
        self.core_thread
    }

    /// State of one core
    pub fn cpu(&self, cpu: CpuId) -> Option<&Cpu> {
        self.cpus.get(cpu.index())
    }

    /// Number of cores
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Core the last operation executed on
    pub fn executing(&self) -> CpuId {
        self.executing
    }

    /// Shared work list
    pub fn global_work(&self) -> &GlobalWork {
        &self.global_work
    }

    /// ASID pool
    pub fn asids(&self) -> &AsidAllocator {
        &self.asids
    }

    /// A live thread
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.objects.thread(id)
    }

    /// A live thread, mutable (for loading registers and message buffers)
    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.objects.thread_mut(id)
    }

    /// A live protection domain
    pub fn pd(&self, id: PdId) -> Option<&ProtectionDomain> {
        self.objects.pd(id)
    }

    /// Resolve `cap` in the directory of `pd`
    pub fn lookup(&self, pd: PdId, cap: CapId) -> KernelResult<CapEntry> {
        self.objects.lookup_cap(pd, cap)
    }

    /// Enter the kernel on `cpu`.
    ///
    /// `elapsed` is the time the previous dispatch consumed. Fatal errors
    /// halt the kernel.
    pub fn enter(&mut self, cpu: CpuId, elapsed: u64, cause: EntryCause) -> Dispatch {
        match self.enter_inner(cpu, elapsed, cause) {
            Ok(dispatch) => dispatch,
            Err(err) => self.halt(err),
        }
    }

    fn enter_inner(&mut self, cpu: CpuId, elapsed: u64, cause: EntryCause) -> KernelResult<Dispatch> {
        if cpu.index() >= self.cpus.len() {
            return Err(InvariantViolation::UnknownCore(cpu).into());
        }
        self.executing = cpu;
        self.drain_work(cpu)?;
        self.cpus[cpu.index()].advance(elapsed);

        let current = self.cpus[cpu.index()]
            .current
            .filter(|&t| self.objects.thread(t).is_some_and(Thread::is_active));

        match cause {
            EntryCause::Syscall => {
                if let Some(thread) = current {
                    self.handle_syscall(thread)?;
                }
            }
            EntryCause::PageFault { addr, kind } => {
                if let Some(thread) = current {
                    self.handle_page_fault(thread, addr, kind)?;
                }
            }
            EntryCause::Interrupt(line) => self.handle_interrupt(line)?,
            EntryCause::Timer => self.cpus[cpu.index()].scheduler.timeout(),
            EntryCause::Ipi => {}
            EntryCause::VmExit(vm) => self.handle_vm_exit(vm)?,
        }

        self.schedule(cpu, elapsed)
    }

    fn drain_work(&mut self, cpu: CpuId) -> KernelResult<()> {
        let global = self.global_work.take_for(cpu);
        let local = self.cpus[cpu.index()].take_local_work();
        for item in global.into_iter().chain(local) {
            match item {
                WorkItem::Ready(thread) => {
                    let runnable = self
                        .objects
                        .thread(thread)
                        .is_some_and(|t| t.is_active() && t.cpu == Some(cpu));
                    if runnable {
                        self.cpus[cpu.index()].scheduler.ready(thread);
                    }
                }
                WorkItem::Reschedule => self.cpus[cpu.index()].scheduler.timeout(),
            }
        }
        Ok(())
    }

    fn schedule(&mut self, cpu: CpuId, elapsed: u64) -> KernelResult<Dispatch> {
        let core = &mut self.cpus[cpu.index()];
        core.scheduler.update(elapsed);
        let next = core.scheduler.head();
        core.current = next;
        let time_slice = core.scheduler.current_time_left();

        let asid = match next {
            Some(thread) => Some(self.admit(thread, cpu)?),
            None => None,
        };

        #[cfg(feature = "paranoid")]
        self.check_invariants()?;

        Ok(Dispatch {
            cpu,
            thread: next,
            asid,
            time_slice,
        })
    }

    /// Stop the kernel after a broken invariant.
    pub fn halt(&self, err: KernelError) -> ! {
        log::error!("kernel halted on core {}: {err}", self.executing);
        panic!("kernel halted: {err}");
    }

    // ------------------------------------------------------------------
    // Helpers shared by the operation modules
    // ------------------------------------------------------------------

    /// Validate the calling thread and move execution to its core.
    pub(crate) fn invoker(&mut self, caller: ThreadId) -> KernelResult<Invoker> {
        let thread = self
            .objects
            .thread(caller)
            .ok_or(InvariantViolation::MissingObject(caller))?;
        if !thread.is_active() {
            return Err(ProtocolViolation::CallerBlocked.into());
        }
        let pd = thread.pd;
        if let Some(cpu) = thread.cpu {
            self.executing = cpu;
        }
        Ok(Invoker {
            thread: caller,
            pd,
        })
    }

    /// Resolve a capability of the caller to an object id.
    pub(crate) fn resolve(
        &self,
        pd: PdId,
        cap: CapId,
        kind: ObjectKind,
        rights: Rights,
    ) -> KernelResult<ObjectId> {
        Ok(self.objects.lookup_typed(pd, cap, kind, rights)?.object)
    }

    /// Resolve an optional capability; `CapId::NONE` resolves to `None`.
    pub(crate) fn resolve_optional(
        &self,
        pd: PdId,
        cap: CapId,
        kind: ObjectKind,
        rights: Rights,
    ) -> KernelResult<Option<ObjectId>> {
        if cap.is_none() {
            return Ok(None);
        }
        self.resolve(pd, cap, kind, rights).map(Some)
    }

    pub(crate) fn thread_ref(&self, id: ThreadId) -> KernelResult<&Thread> {
        self.objects
            .thread(id)
            .ok_or_else(|| InvariantViolation::MissingObject(id).into())
    }

    pub(crate) fn thread_entry(&mut self, id: ThreadId) -> KernelResult<&mut Thread> {
        self.objects
            .thread_mut(id)
            .ok_or_else(|| InvariantViolation::MissingObject(id).into())
    }

    pub(crate) fn pd_mut(&mut self, id: PdId) -> KernelResult<&mut ProtectionDomain> {
        self.objects
            .pd_mut(id)
            .ok_or_else(|| InvariantViolation::MissingObject(id).into())
    }

    /// Construct an object owned by `owner` and give `owner` a capability.
    pub(crate) fn install(
        &mut self,
        owner: PdId,
        object: KernelObject,
    ) -> KernelResult<(ObjectId, CapId)> {
        let id = self.objects.insert(object, Some(owner))?;
        match self
            .objects
            .allocate_cap(owner, id, Rights::ALL, Badge::NONE)
        {
            Ok(cap) => Ok((id, cap)),
            Err(err) => {
                self.destroy_object(id)?;
                Err(err)
            }
        }
    }

    /// Put a thread on a core and make it runnable.
    pub(crate) fn activate(
        &mut self,
        thread: ThreadId,
        cpu: CpuId,
        ip: u64,
        sp: u64,
    ) -> KernelResult<()> {
        let entry = self.thread_entry(thread)?;
        entry.cpu = Some(cpu);
        entry.regs.ip = ip;
        entry.regs.sp = sp;
        entry.state = ThreadState::Active;
        let sched = entry.sched;
        self.cpus[cpu.index()].scheduler.insert(thread, sched);
        self.make_runnable(thread)
    }

    /// Block a running thread.
    ///
    /// A thread homed on another core may be running there right now; that
    /// core gets a reschedule request and an IPI.
    pub(crate) fn block(&mut self, thread: ThreadId, state: ThreadState) -> KernelResult<()> {
        let executing = self.executing;
        let entry = self.thread_entry(thread)?;
        entry.state = state;
        let cpu = entry.cpu;
        if let Some(cpu) = cpu {
            let core = &mut self.cpus[cpu.index()];
            core.scheduler.unready(thread);
            if cpu != executing {
                core.post(WorkItem::Reschedule);
            }
        }
        Ok(())
    }

    /// Finish a blocking call of `thread` with `result` and make it runnable.
    pub(crate) fn wake(&mut self, thread: ThreadId, result: KernelResult<u64>) -> KernelResult<()> {
        let value = crate::syscall::encode_result(result);
        self.thread_entry(thread)?.regs.set_result(value);
        self.make_runnable(thread)
    }

    /// Make a thread runnable without touching its registers.
    ///
    /// A thread homed on the executing core is queued directly; any other
    /// core gets a work item and an IPI.
    pub(crate) fn make_runnable(&mut self, thread: ThreadId) -> KernelResult<()> {
        let executing = self.executing;
        let entry = self.thread_entry(thread)?;
        entry.state = ThreadState::Active;
        let cpu = entry.cpu.ok_or(InvariantViolation::Scheduler {
            core: executing,
            thread,
        })?;

        if cpu == executing {
            self.cpus[cpu.index()].scheduler.ready(thread);
        } else {
            self.cpus[cpu.index()].post(WorkItem::Ready(thread));
        }
        Ok(())
    }

    /// Ask every core to re-evaluate its scheduling decision.
    pub fn broadcast_reschedule(&mut self) {
        self.global_work
            .broadcast(WorkItem::Reschedule, self.cpus.len());
        let executing = self.executing;
        for cpu in self.cpus.iter_mut().filter(|c| c.id() != executing) {
            cpu.raise_ipi();
        }
        self.cpus[executing.index()].scheduler.timeout();
    }

    /// Install the domain of `thread` on `cpu`.
    pub(crate) fn admit(&mut self, thread: ThreadId, cpu: CpuId) -> KernelResult<Asid> {
        let pd = self.thread_ref(thread)?.pd;
        let asid = self
            .objects
            .pd(pd)
            .and_then(ProtectionDomain::asid)
            .ok_or(InvariantViolation::AddressSpace { core: cpu, thread })?;
        self.cpus[cpu.index()].active = Some(ActiveSpace { pd, asid });
        Ok(asid)
    }

    // ------------------------------------------------------------------
    // Object lifetime
    // ------------------------------------------------------------------

    /// Destroy an object and everything that dies with it.
    ///
    /// Teardown of one object may orphan others (a domain's directory held
    /// their last capability); those are queued and destroyed in turn.
    pub(crate) fn destroy_object(&mut self, root: ObjectId) -> KernelResult<()> {
        let mut pending = VecDeque::from([root]);
        while let Some(id) = pending.pop_front() {
            let Some(kind) = self.objects.kind(id) else {
                continue;
            };
            log::debug!("destroying {kind:?} {id}");

            match kind {
                ObjectKind::Pd => self.teardown_pd(id, &mut pending)?,
                ObjectKind::Thread => self.teardown_thread(id)?,
                ObjectKind::SignalReceiver => self.teardown_receiver(id, &mut pending)?,
                ObjectKind::SignalContext => self.teardown_context(id)?,
                ObjectKind::Irq => self.teardown_irq(id)?,
                ObjectKind::Vm => self.teardown_vm(id)?,
            }

            self.objects.unlink_all(id)?;
            self.objects.remove(id);
        }
        Ok(())
    }

    /// Destroy the object behind `cap`. Only its owner may do this.
    pub fn delete_object(&mut self, caller: ThreadId, cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let entry = self.objects.lookup_cap(inv.pd, cap)?;
        if !entry.rights.contains(Rights::DESTROY) {
            return Err(KernelError::InsufficientRights(Rights::DESTROY));
        }
        let owner = self.objects.get(entry.object).and_then(|e| e.owner());
        if owner != Some(inv.pd) {
            return Err(KernelError::NotOwner);
        }
        self.destroy_object(entry.object)
    }

    /// Drop one capability of the caller; the object dies with its last one.
    pub fn delete_cap(&mut self, caller: ThreadId, cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        if let Some(orphan) = self.objects.revoke_cap(inv.pd, cap)? {
            self.destroy_object(orphan)?;
        }
        Ok(())
    }

    /// Copy a capability of the caller into the domain behind `dst_pd`.
    ///
    /// Returns the id of the new entry in the destination directory.
    pub fn map_cap(
        &mut self,
        caller: ThreadId,
        cap: CapId,
        dst_pd: CapId,
        mask: Rights,
        badge: Badge,
    ) -> KernelResult<CapId> {
        let inv = self.invoker(caller)?;
        let dst = self.resolve(inv.pd, dst_pd, ObjectKind::Pd, Rights::CONTROL)?;
        self.objects.map_cap(inv.pd, cap, dst, mask, badge)
    }

    /// Check every structural invariant, failing on the first violation.
    pub fn check_invariants(&self) -> KernelResult<()> {
        match crate::invariants::check_all(self).into_iter().next() {
            Some(violation) => Err(violation.into()),
            None => Ok(()),
        }
    }
}
