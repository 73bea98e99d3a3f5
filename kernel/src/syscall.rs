//! System call interface
//!
//! A kernel call arrives as a register block: `args[0]` holds the call id,
//! `args[1..]` the positional arguments. Message payloads travel through
//! the thread's message buffer. The result goes back into `args[0]`, either
//! right away or, for calls that block, when the thread is woken.

use crate::cap::{Badge, CapId, ObjectKind, Rights};
use crate::cpu::CpuId;
use crate::error::{KernelError, KernelResult};
use crate::ipc::{Message, Receive};
use crate::kernel::Kernel;
use crate::mem::{PhysAddr, Protection, VirtAddr};
use crate::sched::{RegisterState, ThreadId, ThreadState};

/// Kernel call numbers
///
/// 0 to 26 are the thread, domain, IPC and signal calls; the remaining calls
/// cover capability management, pagers and interrupts.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallId {
    // Threads (0-7)
    /// Create a thread in a domain
    NewThread = 0,
    /// Terminate a thread
    KillThread = 1,
    /// Start a created thread on a core
    StartThread = 2,
    /// Hold a thread until resumed
    PauseThread = 3,
    /// Release a held or faulted thread
    ResumeThread = 4,
    /// Give up the rest of the slice
    YieldThread = 5,
    /// Read the last fault record into the message buffer
    ThreadFault = 6,
    /// Set the fault signal context of a thread
    RouteThreadEvent = 7,

    // Protection domains (8-11)
    /// Flush all cached translations of a domain
    UpdatePd = 8,
    /// Flush one cached page of a domain
    UpdateRegion = 9,
    /// Create a protection domain
    NewPd = 10,
    /// Destroy a protection domain
    KillPd = 11,

    // IPC (12-14)
    /// Call a thread and wait for its reply
    SendRequestMsg = 12,
    /// Reply to the current caller
    SendReplyMsg = 13,
    /// Wait for the next request
    AwaitRequestMsg = 14,

    // Signals (15-22)
    /// Create a signal receiver
    NewSignalReceiver = 15,
    /// Create a signal context bound to a receiver
    NewSignalContext = 16,
    /// Detach a signal context
    KillSignalContext = 17,
    /// Destroy a signal receiver
    KillSignalReceiver = 18,
    /// Submit signals to a context
    SubmitSignal = 19,
    /// Wait for a signal
    AwaitSignal = 20,
    /// Poll a receiver
    SignalPending = 21,
    /// Acknowledge a delivery
    AckSignal = 22,

    // Virtual machines (23-25)
    /// Create a virtual machine
    NewVm = 23,
    /// Let a virtual machine run
    RunVm = 24,
    /// Stop a virtual machine
    PauseVm = 25,

    // Debug
    /// Write one character to the kernel log
    PrintChar = 26,

    // Capabilities and objects (27-29)
    /// Drop one capability
    DeleteCap = 27,
    /// Copy a capability into another domain
    MapCap = 28,
    /// Destroy an owned object
    DeleteObject = 29,

    // Interrupts (30-31)
    /// Bind an interrupt line
    NewIrq = 30,
    /// Unmask an interrupt line
    AckIrq = 31,

    // Pager interface (32-33)
    /// Map a page into a domain
    MapPage = 32,
    /// Remove a page mapping
    UnmapPage = 33,

    // Thread control (34-35)
    /// Cancel a blocking call of a thread
    CancelBlocking = 34,
    /// Change the quota of a thread
    SetQuota = 35,

    // Generic construction
    /// Create an object by kind
    NewObject = 36,
}

impl CallId {
    /// Decode a call id from the register block
    pub fn from_u64(value: u64) -> Option<Self> {
        use CallId::*;
        const CALLS: [CallId; 37] = [
            NewThread,
            KillThread,
            StartThread,
            PauseThread,
            ResumeThread,
            YieldThread,
            ThreadFault,
            RouteThreadEvent,
            UpdatePd,
            UpdateRegion,
            NewPd,
            KillPd,
            SendRequestMsg,
            SendReplyMsg,
            AwaitRequestMsg,
            NewSignalReceiver,
            NewSignalContext,
            KillSignalContext,
            KillSignalReceiver,
            SubmitSignal,
            AwaitSignal,
            SignalPending,
            AckSignal,
            NewVm,
            RunVm,
            PauseVm,
            PrintChar,
            DeleteCap,
            MapCap,
            DeleteObject,
            NewIrq,
            AckIrq,
            MapPage,
            UnmapPage,
            CancelBlocking,
            SetQuota,
            NewObject,
        ];
        usize::try_from(value).ok().and_then(|i| CALLS.get(i)).copied()
    }
}

/// Syscall errors as seen by user code
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallError {
    /// No error
    Success = 0,
    /// Unknown call id
    InvalidSyscall = -1,
    /// Capability id does not resolve, or names the wrong kind of object
    InvalidCapability = -2,
    /// Missing rights or not the owner
    PermissionDenied = -3,
    /// A kernel resource ran out
    OutOfMemory = -4,
    /// Argument out of range
    InvalidArgument = -5,
    /// Blocking call cancelled
    Interrupted = -8,
    /// Call made out of protocol order
    ProtocolViolation = -9,
    /// The peer died
    PeerDestroyed = -10,
    /// Kernel invariant broken
    KernelFault = -11,
}

impl KernelError {
    /// Stable ABI code of the error
    pub fn code(&self) -> i64 {
        let error = match self {
            KernelError::InvalidCapability(_) | KernelError::WrongKind { .. } => {
                SyscallError::InvalidCapability
            }
            KernelError::InsufficientRights(_) | KernelError::NotOwner => {
                SyscallError::PermissionDenied
            }
            KernelError::Protocol(_) => SyscallError::ProtocolViolation,
            KernelError::Exhausted(_) => SyscallError::OutOfMemory,
            KernelError::PeerDestroyed => SyscallError::PeerDestroyed,
            KernelError::Cancelled => SyscallError::Interrupted,
            KernelError::InvalidArgument => SyscallError::InvalidArgument,
            KernelError::UnknownCall(_) => SyscallError::InvalidSyscall,
            KernelError::Fatal(_) => SyscallError::KernelFault,
        };
        error as i64
    }
}

/// Register encoding of a call result: the value on success, the negative
/// error code otherwise.
pub fn encode_result(result: KernelResult<u64>) -> i64 {
    match result {
        Ok(value) => value as i64,
        Err(err) => err.code(),
    }
}

/// How a call left the caller
enum Completion {
    /// Finished with a result
    Done(u64),
    /// Blocked; the result is written when the thread is woken
    Blocked,
}

fn cap(value: u64) -> KernelResult<CapId> {
    u32::try_from(value)
        .map(CapId)
        .map_err(|_| KernelError::InvalidArgument)
}

fn cpu(value: u64) -> KernelResult<CpuId> {
    u32::try_from(value)
        .map(CpuId)
        .map_err(|_| KernelError::InvalidArgument)
}

fn narrow<T: TryFrom<u64>>(value: u64) -> KernelResult<T> {
    T::try_from(value).map_err(|_| KernelError::InvalidArgument)
}

fn created(cap: CapId) -> Completion {
    Completion::Done(u64::from(cap.0))
}

fn done(_: ()) -> Completion {
    Completion::Done(0)
}

fn received(receive: Receive) -> Completion {
    match receive {
        Receive::Delivered => Completion::Done(0),
        Receive::Blocked => Completion::Blocked,
    }
}

impl Kernel {
    /// Execute the kernel call in the registers of `thread`.
    ///
    /// User errors become the call result; only fatal errors propagate.
    pub(crate) fn handle_syscall(&mut self, thread: ThreadId) -> KernelResult<()> {
        let regs = self.thread_ref(thread)?.regs;
        let outcome = match CallId::from_u64(regs.call_id()) {
            Some(call) => self.dispatch(thread, call, &regs),
            None => Err(KernelError::UnknownCall(regs.call_id())),
        };

        let result = match outcome {
            Ok(Completion::Blocked) => return Ok(()),
            Ok(Completion::Done(value)) => Ok(value),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log::debug!("{thread}: call {} failed: {err}", regs.call_id());
                Err(err)
            }
        };

        // The call may have killed its own caller.
        if let Some(entry) = self.objects.thread_mut(thread) {
            if entry.state != ThreadState::Dead {
                entry.regs.set_result(encode_result(result));
            }
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        thread: ThreadId,
        call: CallId,
        regs: &RegisterState,
    ) -> KernelResult<Completion> {
        let arg = |n: usize| regs.arg(n);

        match call {
            CallId::NewThread => self
                .new_thread(thread, cap(arg(1))?, narrow(arg(2))?, arg(3), cap(arg(4))?)
                .map(created),
            CallId::KillThread => self.kill_thread(thread, cap(arg(1))?).map(done),
            CallId::StartThread => self
                .start_thread(thread, cap(arg(1))?, cpu(arg(2))?, arg(3), arg(4))
                .map(done),
            CallId::PauseThread => self.pause_thread(thread, cap(arg(1))?).map(done),
            CallId::ResumeThread => {
                let sequence = Some(arg(2)).filter(|&s| s != 0);
                self.resume_thread(thread, cap(arg(1))?, sequence).map(done)
            }
            CallId::YieldThread => self.yield_thread(thread).map(done),
            CallId::ThreadFault => {
                let Some(record) = self.fault_info(thread, cap(arg(1))?)? else {
                    return Ok(Completion::Done(0));
                };
                let words = [
                    record.addr.as_u64(),
                    record.kind as u64,
                    record.ip,
                    record.sequence,
                ];
                self.thread_entry(thread)?.utcb = Message::with_words(0, &words);
                Ok(Completion::Done(1))
            }
            CallId::RouteThreadEvent => self
                .route_thread_event(thread, cap(arg(1))?, cap(arg(2))?)
                .map(done),
            CallId::UpdatePd => self.update_pd(thread, cap(arg(1))?).map(done),
            CallId::UpdateRegion => self
                .update_region(thread, cap(arg(1))?, VirtAddr::new(arg(2)))
                .map(done),
            CallId::NewPd => self.create_pd(thread).map(created),
            CallId::KillPd => self.kill_pd(thread, cap(arg(1))?).map(done),
            CallId::SendRequestMsg => {
                let msg = self.thread_ref(thread)?.utcb.clone();
                self.call(thread, cap(arg(1))?, msg)?;
                Ok(Completion::Blocked)
            }
            CallId::SendReplyMsg => {
                let msg = self.thread_ref(thread)?.utcb.clone();
                if arg(1) != 0 {
                    self.reply_and_wait(thread, msg).map(received)
                } else {
                    self.reply(thread, msg).map(done)
                }
            }
            CallId::AwaitRequestMsg => self.wait(thread).map(received),
            CallId::NewSignalReceiver => self.new_signal_receiver(thread).map(created),
            CallId::NewSignalContext => self
                .new_signal_context(thread, cap(arg(1))?, arg(2))
                .map(created),
            CallId::KillSignalContext => self.kill_signal_context(thread, cap(arg(1))?).map(done),
            CallId::KillSignalReceiver => self.kill_signal_receiver(thread, cap(arg(1))?).map(done),
            CallId::SubmitSignal => self
                .submit_signal(thread, cap(arg(1))?, narrow(arg(2))?)
                .map(done),
            CallId::AwaitSignal => match self.await_signal(thread, cap(arg(1))?, cap(arg(2))?)? {
                Some(_) => Ok(Completion::Done(0)),
                None => Ok(Completion::Blocked),
            },
            CallId::SignalPending => self
                .signal_pending(thread, cap(arg(1))?)
                .map(|pending| Completion::Done(u64::from(pending))),
            CallId::AckSignal => self.ack_signal(thread, cap(arg(1))?).map(done),
            CallId::NewVm => self.new_vm(thread, cpu(arg(1))?, cap(arg(2))?).map(created),
            CallId::RunVm => self.run_vm(thread, cap(arg(1))?).map(done),
            CallId::PauseVm => self.pause_vm(thread, cap(arg(1))?).map(done),
            CallId::PrintChar => {
                let c = char::from_u32(narrow(arg(1))?).ok_or(KernelError::InvalidArgument)?;
                log::info!("{thread}: {c}");
                Ok(Completion::Done(0))
            }
            CallId::DeleteCap => self.delete_cap(thread, cap(arg(1))?).map(done),
            CallId::MapCap => self
                .map_cap(
                    thread,
                    cap(arg(1))?,
                    cap(arg(2))?,
                    Rights::from_bits_truncate(narrow(arg(3))?),
                    Badge(arg(4)),
                )
                .map(created),
            CallId::DeleteObject => self.delete_object(thread, cap(arg(1))?).map(done),
            CallId::NewIrq => self
                .new_irq(thread, narrow(arg(1))?, cap(arg(2))?)
                .map(created),
            CallId::AckIrq => self.ack_irq(thread, cap(arg(1))?).map(done),
            CallId::MapPage => {
                let protection =
                    Protection::from_bits(narrow(arg(4))?).ok_or(KernelError::InvalidArgument)?;
                self.map_page(
                    thread,
                    cap(arg(1))?,
                    VirtAddr::new(arg(2)),
                    PhysAddr::new(arg(3)),
                    protection,
                )
                .map(done)
            }
            CallId::UnmapPage => self
                .unmap_page(thread, cap(arg(1))?, VirtAddr::new(arg(2)))
                .map(|removed| Completion::Done(u64::from(removed))),
            CallId::CancelBlocking => self
                .cancel_blocking(thread, cap(arg(1))?)
                .map(|cancelled| Completion::Done(u64::from(cancelled))),
            CallId::SetQuota => self.set_quota(thread, cap(arg(1))?, arg(2)).map(done),
            CallId::NewObject => self.new_object(thread, regs),
        }
    }

    /// Construct an object of the kind in `args[1]` from `args[2..]`.
    fn new_object(&mut self, thread: ThreadId, regs: &RegisterState) -> KernelResult<Completion> {
        let kind = narrow::<u8>(regs.arg(1))
            .ok()
            .and_then(ObjectKind::from_u8)
            .ok_or(KernelError::InvalidArgument)?;
        let arg = |n: usize| regs.arg(n + 1);

        let cap = match kind {
            ObjectKind::Pd => self.create_pd(thread)?,
            ObjectKind::Thread => {
                self.new_thread(thread, cap(arg(1))?, narrow(arg(2))?, arg(3), cap(arg(4))?)?
            }
            ObjectKind::SignalReceiver => self.new_signal_receiver(thread)?,
            ObjectKind::SignalContext => self.new_signal_context(thread, cap(arg(1))?, arg(2))?,
            ObjectKind::Irq => self.new_irq(thread, narrow(arg(1))?, cap(arg(2))?)?,
            ObjectKind::Vm => self.new_vm(thread, cpu(arg(1))?, cap(arg(2))?)?,
        };
        Ok(created(cap))
    }
}
