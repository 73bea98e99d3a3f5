//! Fault delivery to user-level pagers
//!
//! When a thread touches memory its domain does not map, the kernel holds
//! the thread in `AwaitsRestart`, records the fault, and submits one signal
//! to the thread's fault context. The pager reads the record, installs a
//! mapping, and resumes the thread.
//!
//! Every fault gets a sequence number. A resume naming a sequence only
//! succeeds while the thread is still held in exactly that fault, so a late
//! resume for an older fault can never release the thread from a newer one.

use crate::cap::{CapId, ObjectId, ObjectKind, Rights};
use crate::error::{KernelResult, ProtocolViolation};
use crate::kernel::Kernel;
use crate::mem::{AccessKind, VirtAddr};
use crate::sched::{ThreadId, ThreadState};

/// A recorded page fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
    /// Faulting address
    pub addr: VirtAddr,
    /// Kind of access
    pub kind: AccessKind,
    /// Instruction pointer at the fault
    pub ip: u64,
    /// Fault sequence number, starting at 1
    pub sequence: u64,
}

/// Per-thread fault bookkeeping
#[derive(Debug)]
pub struct FaultState {
    handler: Option<ObjectId>,
    last: Option<FaultRecord>,
    held: Option<u64>,
    sequence: u64,
}

impl FaultState {
    /// State with an optional handler context
    pub fn new(handler: Option<ObjectId>) -> Self {
        Self {
            handler,
            last: None,
            held: None,
            sequence: 0,
        }
    }

    /// Signal context notified on faults
    pub fn handler(&self) -> Option<ObjectId> {
        self.handler
    }

    /// Most recent fault
    pub fn last(&self) -> Option<FaultRecord> {
        self.last
    }

    /// Sequence of the fault the thread is held in, if any
    pub fn held(&self) -> Option<u64> {
        self.held
    }

    pub(crate) fn clear_pending(&mut self) {
        self.held = None;
    }

    fn record(&mut self, addr: VirtAddr, kind: AccessKind, ip: u64) -> FaultRecord {
        self.sequence += 1;
        let record = FaultRecord {
            addr,
            kind,
            ip,
            sequence: self.sequence,
        };
        self.last = Some(record);
        self.held = Some(record.sequence);
        record
    }
}

impl Kernel {
    /// Handle a page fault of a running thread.
    pub(crate) fn handle_page_fault(
        &mut self,
        thread: ThreadId,
        addr: VirtAddr,
        kind: AccessKind,
    ) -> KernelResult<()> {
        let pd = self.thread_ref(thread)?.pd;
        let resolved = self
            .objects
            .pd(pd)
            .and_then(|domain| domain.table.lookup(addr))
            .is_some_and(|mapping| mapping.permits(kind));
        if resolved {
            log::trace!("{thread}: spurious fault at {:#x}", addr.as_u64());
            return Ok(());
        }

        let entry = self.thread_entry(thread)?;
        let ip = entry.regs.ip;
        let record = entry.fault.record(addr, kind, ip);
        let handler = entry.fault.handler;
        self.block(thread, ThreadState::AwaitsRestart)?;

        if self.notify(handler)? {
            log::trace!(
                "{thread}: fault #{} at {:#x} ({kind:?}) sent to pager",
                record.sequence,
                addr.as_u64()
            );
        } else {
            log::warn!(
                "{thread}: fault at {:#x} ({kind:?}, ip {ip:#x}) without a handler, thread held",
                addr.as_u64()
            );
        }
        Ok(())
    }

    /// Hold the thread behind `thread_cap` until it is resumed.
    pub fn pause_thread(&mut self, caller: ThreadId, thread_cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let thread = self.resolve(inv.pd, thread_cap, ObjectKind::Thread, Rights::CONTROL)?;
        if !self.thread_ref(thread)?.is_active() {
            return Err(ProtocolViolation::NotActive.into());
        }
        self.thread_entry(thread)?.fault.held = None;
        self.block(thread, ThreadState::AwaitsRestart)
    }

    /// Release the thread behind `thread_cap` from a fault or pause.
    ///
    /// With `sequence`, the thread must still be held in that fault.
    pub fn resume_thread(
        &mut self,
        caller: ThreadId,
        thread_cap: CapId,
        sequence: Option<u64>,
    ) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let thread = self.resolve(inv.pd, thread_cap, ObjectKind::Thread, Rights::CONTROL)?;
        let entry = self.thread_entry(thread)?;
        if entry.state != ThreadState::AwaitsRestart {
            return Err(ProtocolViolation::NotAwaitingRestart.into());
        }
        if let Some(sequence) = sequence {
            if entry.fault.held != Some(sequence) {
                return Err(ProtocolViolation::StaleResume.into());
            }
        }
        entry.fault.held = None;
        log::trace!("{thread} resumed");
        self.make_runnable(thread)
    }

    /// Route faults of the thread behind `thread_cap` to a signal context;
    /// `CapId::NONE` removes the handler.
    pub fn route_thread_event(
        &mut self,
        caller: ThreadId,
        thread_cap: CapId,
        context_cap: CapId,
    ) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let thread = self.resolve(inv.pd, thread_cap, ObjectKind::Thread, Rights::CONTROL)?;
        let handler =
            self.resolve_optional(inv.pd, context_cap, ObjectKind::SignalContext, Rights::SIGNAL)?;
        self.thread_entry(thread)?.fault.handler = handler;
        Ok(())
    }

    /// Last fault of the thread behind `thread_cap`.
    pub fn fault_info(&mut self, caller: ThreadId, thread_cap: CapId) -> KernelResult<Option<FaultRecord>> {
        let inv = self.invoker(caller)?;
        let thread = self.resolve(inv.pd, thread_cap, ObjectKind::Thread, Rights::CONTROL)?;
        Ok(self.thread_ref(thread)?.fault.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::cpu::CpuId;
    use crate::kernel::EntryCause;
    use crate::mem::{PhysAddr, Protection};
    use crate::signal::Signal;

    struct Setup {
        kernel: Kernel,
        core: ThreadId,
        thread: ThreadId,
        thread_cap: CapId,
        pd_cap: CapId,
        receiver_cap: CapId,
    }

    fn setup() -> Setup {
        let mut kernel = Kernel::new(KernelConfig {
            cpus: 1,
            max_objects: 64,
            ..KernelConfig::default()
        })
        .unwrap();
        let core = kernel.core_thread();
        let receiver_cap = kernel.new_signal_receiver(core).unwrap();
        let context_cap = kernel.new_signal_context(core, receiver_cap, 9).unwrap();
        let pd_cap = kernel.create_pd(core).unwrap();
        let thread_cap = kernel.new_thread(core, pd_cap, 2, 1_000, context_cap).unwrap();
        kernel.start_thread(core, thread_cap, CpuId::BOOT, 0x400, 0).unwrap();
        let thread = kernel.lookup(kernel.core_pd(), thread_cap).unwrap().object;
        Setup {
            kernel,
            core,
            thread,
            thread_cap,
            pd_cap,
            receiver_cap,
        }
    }

    /// The test thread holds a quota, so it wins every decision while ready.
    fn run(kernel: &mut Kernel, thread: ThreadId) {
        let dispatch = kernel.enter(CpuId::BOOT, 0, EntryCause::Timer);
        assert_eq!(dispatch.thread, Some(thread));
    }

    #[test]
    fn test_fault_notifies_and_resume_retries() {
        let Setup {
            mut kernel,
            core,
            thread,
            thread_cap,
            pd_cap,
            receiver_cap,
        } = setup();
        run(&mut kernel, thread);

        let addr = VirtAddr::new(0x7000);
        assert_eq!(kernel.access(CpuId::BOOT, addr, AccessKind::Write), None);
        kernel.enter(
            CpuId::BOOT,
            0,
            EntryCause::PageFault {
                addr,
                kind: AccessKind::Write,
            },
        );
        assert_eq!(kernel.thread(thread).unwrap().state(), ThreadState::AwaitsRestart);

        assert_eq!(
            kernel.await_signal(core, receiver_cap, CapId::NONE),
            Ok(Some(Signal { imprint: 9, count: 1 }))
        );
        let record = kernel.fault_info(core, thread_cap).unwrap().unwrap();
        assert_eq!(record.addr, addr);
        assert_eq!(record.kind, AccessKind::Write);
        assert_eq!(record.ip, 0x400);

        kernel
            .map_page(
                core,
                pd_cap,
                VirtAddr::new(0x7000),
                PhysAddr::new(0x20000),
                Protection::READ | Protection::WRITE,
            )
            .unwrap();
        kernel
            .resume_thread(core, thread_cap, Some(record.sequence))
            .unwrap();
        run(&mut kernel, thread);
        assert_eq!(
            kernel.access(CpuId::BOOT, addr, AccessKind::Write),
            Some(PhysAddr::new(0x20000))
        );
        assert_eq!(kernel.signal_pending(core, receiver_cap), Ok(false));
    }

    #[test]
    fn test_stale_resume_rejected() {
        let Setup {
            mut kernel,
            core,
            thread,
            thread_cap,
            ..
        } = setup();
        run(&mut kernel, thread);

        let fault = EntryCause::PageFault {
            addr: VirtAddr::new(0x1000),
            kind: AccessKind::Read,
        };
        kernel.enter(CpuId::BOOT, 0, fault);
        let first = kernel.fault_info(core, thread_cap).unwrap().unwrap().sequence;
        kernel.resume_thread(core, thread_cap, Some(first)).unwrap();

        run(&mut kernel, thread);
        kernel.enter(CpuId::BOOT, 0, fault);
        assert_eq!(
            kernel.resume_thread(core, thread_cap, Some(first)),
            Err(ProtocolViolation::StaleResume.into())
        );
        assert_eq!(kernel.thread(thread).unwrap().state(), ThreadState::AwaitsRestart);
    }

    #[test]
    fn test_resume_requires_restart_state() {
        let Setup {
            mut kernel,
            core,
            thread_cap,
            ..
        } = setup();
        assert_eq!(
            kernel.resume_thread(core, thread_cap, None),
            Err(ProtocolViolation::NotAwaitingRestart.into())
        );
    }

    #[test]
    fn test_pause_and_resume() {
        let Setup {
            mut kernel,
            core,
            thread,
            thread_cap,
            ..
        } = setup();

        kernel.pause_thread(core, thread_cap).unwrap();
        assert_eq!(kernel.thread(thread).unwrap().state(), ThreadState::AwaitsRestart);
        assert_eq!(
            kernel.pause_thread(core, thread_cap),
            Err(ProtocolViolation::NotActive.into())
        );
        assert_eq!(
            kernel.resume_thread(core, thread_cap, Some(1)),
            Err(ProtocolViolation::StaleResume.into())
        );
        kernel.resume_thread(core, thread_cap, None).unwrap();
        assert!(kernel.thread(thread).unwrap().is_active());
    }

    #[test]
    fn test_fault_without_handler_holds_thread() {
        let Setup {
            mut kernel,
            core,
            thread,
            thread_cap,
            receiver_cap,
            ..
        } = setup();
        kernel.route_thread_event(core, thread_cap, CapId::NONE).unwrap();
        run(&mut kernel, thread);

        kernel.enter(
            CpuId::BOOT,
            0,
            EntryCause::PageFault {
                addr: VirtAddr::new(0x3000),
                kind: AccessKind::Execute,
            },
        );
        assert_eq!(kernel.thread(thread).unwrap().state(), ThreadState::AwaitsRestart);
        assert_eq!(kernel.signal_pending(core, receiver_cap), Ok(false));
    }
}
