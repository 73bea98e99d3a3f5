//! Thread management
//!
//! ```text
//! AwaitsStart ──start──► Active ◄──────► AwaitsIpc
//!                          │ ▲ ◄───────► AwaitsSignal
//!                fault/pause│ │resume
//!                          ▼ │
//!                     AwaitsRestart          any ──kill──► Dead
//! ```

use crate::cap::{CapId, KernelObject, ObjectId, ObjectKind, Rights};
use crate::cpu::{CpuId, WorkItem};
use crate::error::{KernelError, KernelResult, ProtocolViolation};
use crate::fault::FaultState;
use crate::ipc::{IpcNode, Message};
use crate::kernel::Kernel;
use crate::pd::PdId;

/// Thread identifier
pub type ThreadId = ObjectId;

/// Number of positional registers in a kernel call
pub const REGISTER_ARGS: usize = 6;

/// Thread state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, never started
    AwaitsStart,
    /// Runnable
    Active,
    /// Blocked in a call or waiting for a request
    AwaitsIpc,
    /// Blocked on a signal receiver
    AwaitsSignal,
    /// Held after a fault or pause until resumed
    AwaitsRestart,
    /// Terminated
    Dead,
}

/// Saved user registers
///
/// `args[0]` carries the call id into the kernel and the call result back
/// out; `args[1..]` are the positional call arguments.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterState {
    /// Instruction pointer
    pub ip: u64,
    /// Stack pointer
    pub sp: u64,
    /// Call id / result and arguments
    pub args: [u64; REGISTER_ARGS],
}

impl RegisterState {
    /// Call id of a pending kernel call
    pub fn call_id(&self) -> u64 {
        self.args[0]
    }

    /// Positional argument `n`, counted from 1
    pub fn arg(&self, n: usize) -> u64 {
        self.args.get(n).copied().unwrap_or(0)
    }

    /// Result of the last kernel call
    pub fn result(&self) -> i64 {
        self.args[0] as i64
    }

    /// Store a call result
    pub fn set_result(&mut self, value: i64) {
        self.args[0] = value as u64;
    }

    /// Fill in a kernel call
    pub fn set_call(&mut self, call_id: u64, args: &[u64]) {
        self.args = [0; REGISTER_ARGS];
        self.args[0] = call_id;
        for (slot, &value) in self.args[1..].iter_mut().zip(args) {
            *slot = value;
        }
    }
}

/// Scheduling parameters of a thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedContext {
    /// Priority band, 0 is the lowest
    pub priority: u8,
    /// Ticks per super period the thread may claim
    pub quota: u64,
}

/// Thread control block
pub struct Thread {
    pub(crate) pd: PdId,
    pub(crate) state: ThreadState,
    pub(crate) regs: RegisterState,
    pub(crate) sched: SchedContext,
    pub(crate) cpu: Option<CpuId>,
    pub(crate) ipc: IpcNode,
    pub(crate) utcb: Message,
    pub(crate) fault: FaultState,
    pub(crate) awaited_receiver: Option<ObjectId>,
}

impl Thread {
    /// Create a thread bound to `pd`, waiting to be started
    pub fn new(pd: PdId, sched: SchedContext, fault_handler: Option<ObjectId>) -> Self {
        Self {
            pd,
            state: ThreadState::AwaitsStart,
            regs: RegisterState::default(),
            sched,
            cpu: None,
            ipc: IpcNode::new(),
            utcb: Message::default(),
            fault: FaultState::new(fault_handler),
            awaited_receiver: None,
        }
    }

    /// Owning protection domain
    pub fn pd(&self) -> PdId {
        self.pd
    }

    /// Current state
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Saved registers
    pub fn regs(&self) -> &RegisterState {
        &self.regs
    }

    /// Saved registers, mutable
    pub fn regs_mut(&mut self) -> &mut RegisterState {
        &mut self.regs
    }

    /// Scheduling parameters
    pub fn sched(&self) -> SchedContext {
        self.sched
    }

    /// Core the thread was started on
    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    /// Message buffer
    pub fn utcb(&self) -> &Message {
        &self.utcb
    }

    /// Message buffer, mutable
    pub fn utcb_mut(&mut self) -> &mut Message {
        &mut self.utcb
    }

    /// Fault bookkeeping
    pub fn fault(&self) -> &FaultState {
        &self.fault
    }

    /// IPC bookkeeping
    pub fn ipc(&self) -> &IpcNode {
        &self.ipc
    }

    /// Whether the thread may execute
    pub fn is_active(&self) -> bool {
        self.state == ThreadState::Active
    }

    /// Whether the thread is stuck in a blocking call
    pub fn is_blocked(&self) -> bool {
        matches!(self.state, ThreadState::AwaitsIpc | ThreadState::AwaitsSignal)
    }
}

impl Kernel {
    /// Create a thread bound to the domain behind `pd_cap`.
    ///
    /// `fault_ctx` names the signal context notified when the thread
    /// faults; `CapId::NONE` leaves it without a handler.
    pub fn new_thread(
        &mut self,
        caller: ThreadId,
        pd_cap: CapId,
        priority: u8,
        quota: u64,
        fault_ctx: CapId,
    ) -> KernelResult<CapId> {
        let inv = self.invoker(caller)?;
        let pd = self.resolve(inv.pd, pd_cap, ObjectKind::Pd, Rights::CONTROL)?;
        if priority >= self.config.priorities {
            return Err(KernelError::InvalidArgument);
        }
        let handler =
            self.resolve_optional(inv.pd, fault_ctx, ObjectKind::SignalContext, Rights::SIGNAL)?;
        if self.pd_mut(pd)?.is_dying() {
            return Err(ProtocolViolation::PdDying.into());
        }

        let thread = Thread::new(pd, SchedContext { priority, quota }, handler);
        let (id, cap) = self.install(inv.pd, KernelObject::Thread(thread))?;
        self.pd_mut(pd)?.threads.push(id);
        log::debug!("{id} created in {pd} (priority {priority}, quota {quota})");
        Ok(cap)
    }

    /// Start a created thread on `cpu`.
    pub fn start_thread(
        &mut self,
        caller: ThreadId,
        thread_cap: CapId,
        cpu: CpuId,
        ip: u64,
        sp: u64,
    ) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let thread = self.resolve(inv.pd, thread_cap, ObjectKind::Thread, Rights::CONTROL)?;
        if cpu.index() >= self.cpus.len() {
            return Err(KernelError::InvalidArgument);
        }
        if self.thread_ref(thread)?.state != ThreadState::AwaitsStart {
            return Err(ProtocolViolation::AlreadyStarted.into());
        }
        self.activate(thread, cpu, ip, sp)?;
        log::debug!("{thread} started on core {cpu} at {ip:#x}");
        Ok(())
    }

    /// Destroy the thread behind `thread_cap`.
    pub fn kill_thread(&mut self, caller: ThreadId, thread_cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        self.resolve(inv.pd, thread_cap, ObjectKind::Thread, Rights::DESTROY)?;
        self.delete_object(caller, thread_cap)
    }

    /// Give up the rest of the caller's time slice.
    pub fn yield_thread(&mut self, caller: ThreadId) -> KernelResult<()> {
        self.invoker(caller)?;
        if let Some(cpu) = self.thread_ref(caller)?.cpu {
            let scheduler = &mut self.cpus[cpu.index()].scheduler;
            if scheduler.head() == Some(caller) {
                scheduler.yield_head();
            }
        }
        Ok(())
    }

    /// Change the quota of the thread behind `thread_cap`.
    pub fn set_quota(&mut self, caller: ThreadId, thread_cap: CapId, quota: u64) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let thread = self.resolve(inv.pd, thread_cap, ObjectKind::Thread, Rights::CONTROL)?;
        let executing = self.executing;
        let entry = self.thread_entry(thread)?;
        entry.sched.quota = quota;
        let cpu = entry.cpu;
        if let Some(cpu) = cpu {
            let core = &mut self.cpus[cpu.index()];
            core.scheduler.set_quota(thread, quota);
            if cpu != executing {
                core.post(WorkItem::Reschedule);
            }
        }
        Ok(())
    }

    /// Force the thread behind `thread_cap` out of a blocking IPC or signal
    /// wait. The interrupted call returns `Cancelled`.
    ///
    /// Returns whether the thread was blocked.
    pub fn cancel_blocking(&mut self, caller: ThreadId, thread_cap: CapId) -> KernelResult<bool> {
        let inv = self.invoker(caller)?;
        let thread = self.resolve(inv.pd, thread_cap, ObjectKind::Thread, Rights::CONTROL)?;
        match self.thread_ref(thread)?.state {
            ThreadState::AwaitsIpc => self.detach_ipc(thread)?,
            ThreadState::AwaitsSignal => self.detach_signal_wait(thread)?,
            _ => return Ok(false),
        }
        self.wake(thread, Err(KernelError::Cancelled))?;
        log::debug!("{thread}: blocking call cancelled");
        Ok(true)
    }

    /// Terminate a thread, failing everyone blocked on it.
    ///
    /// A thread that was itself blocked finds `reason` as its call result.
    /// The object stays alive (and `Dead`) while capabilities refer to it.
    pub(crate) fn kill(&mut self, thread: ThreadId, reason: KernelError) -> KernelResult<()> {
        let state = self.thread_ref(thread)?.state;
        match state {
            ThreadState::Dead => return Ok(()),
            ThreadState::AwaitsIpc => self.detach_ipc(thread)?,
            ThreadState::AwaitsSignal => self.detach_signal_wait(thread)?,
            _ => {}
        }
        self.fail_ipc_peers(thread)?;

        let executing = self.executing;
        let entry = self.thread_entry(thread)?;
        if matches!(state, ThreadState::AwaitsIpc | ThreadState::AwaitsSignal) {
            entry
                .regs
                .set_result(crate::syscall::encode_result(Err(reason)));
        }
        entry.state = ThreadState::Dead;
        entry.fault.clear_pending();
        let cpu = entry.cpu;

        if let Some(cpu) = cpu {
            let core = &mut self.cpus[cpu.index()];
            core.scheduler.remove(thread);
            if cpu != executing {
                core.post(WorkItem::Reschedule);
            }
        }
        log::debug!("{thread} killed ({state:?})");
        Ok(())
    }

    pub(crate) fn teardown_thread(&mut self, thread: ThreadId) -> KernelResult<()> {
        self.kill(thread, KernelError::PeerDestroyed)?;
        let pd = self.thread_ref(thread)?.pd;
        if let Some(domain) = self.objects.pd_mut(pd) {
            domain.threads.retain(|&t| t != thread);
        }
        Ok(())
    }
}
