//! Asynchronous signals
//!
//! A [`SignalContext`] is the thing submitted to; each context belongs to
//! one [`SignalReceiver`], the thing waited on. Submissions only add to the
//! context's count, so any number of them collapse into one delivery that
//! carries the total.
//!
//! Delivery hands `(imprint, count)` to the oldest waiting thread and resets
//! the count. The context then stays out of the receiver's queue until it is
//! acknowledged; submissions made meanwhile keep accumulating and are
//! delivered after the acknowledgement.
//!
//! The fault path, interrupts and VM exits all notify user level through
//! contexts; ids of destroyed contexts never resolve again, so such
//! references are simply skipped once stale.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::cap::{CapId, KernelObject, ObjectId, ObjectKind, Rights};
use crate::error::{InvariantViolation, KernelError, KernelResult, ProtocolViolation};
use crate::ipc::Message;
use crate::kernel::Kernel;
use crate::sched::{ThreadId, ThreadState};

/// Message tag of a delivered signal
pub const SIGNAL_TAG: u64 = 0;

/// A delivered signal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    /// Value chosen when the context was created
    pub imprint: u64,
    /// Submissions since the previous delivery
    pub count: u32,
}

impl Signal {
    /// Encode into a message buffer
    pub fn to_message(self) -> Message {
        Message::with_words(SIGNAL_TAG, &[self.imprint, u64::from(self.count)])
    }

    /// Decode from a message buffer
    pub fn from_message(msg: &Message) -> Option<Self> {
        match (msg.tag(), msg.words()) {
            (SIGNAL_TAG, &[imprint, count]) => Some(Self {
                imprint,
                count: u32::try_from(count).ok()?,
            }),
            _ => None,
        }
    }
}

/// Delivery state of a context
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    /// Nothing to deliver
    Idle,
    /// In the receiver's pending queue
    Queued,
    /// Delivered, waiting for acknowledgement
    Delivered,
    /// No longer accepts submissions
    Killed,
}

/// Submission endpoint
#[derive(Debug)]
pub struct SignalContext {
    receiver: ObjectId,
    imprint: u64,
    count: u32,
    state: ContextState,
}

impl SignalContext {
    /// Receiver the context delivers to
    pub fn receiver(&self) -> ObjectId {
        self.receiver
    }

    /// Imprint handed out with every delivery
    pub fn imprint(&self) -> u64 {
        self.imprint
    }

    /// Undelivered submissions
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Delivery state
    pub fn state(&self) -> ContextState {
        self.state
    }
}

/// Waiting endpoint
#[derive(Debug, Default)]
pub struct SignalReceiver {
    contexts: Vec<ObjectId>,
    pending: VecDeque<ObjectId>,
    listeners: VecDeque<ThreadId>,
}

impl SignalReceiver {
    /// Create a receiver without contexts
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts bound to this receiver
    pub fn contexts(&self) -> &[ObjectId] {
        &self.contexts
    }

    /// Contexts with an undelivered count, oldest first
    pub fn pending(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.pending.iter().copied()
    }

    /// Threads blocked on this receiver, oldest first
    pub fn listeners(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.listeners.iter().copied()
    }
}

impl Kernel {
    /// Create a signal receiver.
    pub fn new_signal_receiver(&mut self, caller: ThreadId) -> KernelResult<CapId> {
        let inv = self.invoker(caller)?;
        let (id, cap) = self.install(inv.pd, KernelObject::SignalReceiver(SignalReceiver::new()))?;
        log::debug!("{id} created");
        Ok(cap)
    }

    /// Create a context delivering to the receiver behind `receiver_cap`.
    pub fn new_signal_context(
        &mut self,
        caller: ThreadId,
        receiver_cap: CapId,
        imprint: u64,
    ) -> KernelResult<CapId> {
        let inv = self.invoker(caller)?;
        let receiver = self.resolve(inv.pd, receiver_cap, ObjectKind::SignalReceiver, Rights::CONTROL)?;
        let context = SignalContext {
            receiver,
            imprint,
            count: 0,
            state: ContextState::Idle,
        };
        let (id, cap) = self.install(inv.pd, KernelObject::SignalContext(context))?;
        self.receiver_entry(receiver)?.contexts.push(id);
        log::debug!("{id} created for {receiver} (imprint {imprint:#x})");
        Ok(cap)
    }

    /// Submit `count` to the context behind `context_cap`.
    pub fn submit_signal(&mut self, caller: ThreadId, context_cap: CapId, count: u32) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let context = self.resolve(inv.pd, context_cap, ObjectKind::SignalContext, Rights::SIGNAL)?;
        self.submit(context, count)
    }

    /// Wait on the receiver behind `receiver_cap`.
    ///
    /// A non-NONE `ack_cap` acknowledges that context first. Returns the
    /// signal if one was pending; otherwise the caller blocks and finds the
    /// signal in its message buffer when woken.
    pub fn await_signal(
        &mut self,
        caller: ThreadId,
        receiver_cap: CapId,
        ack_cap: CapId,
    ) -> KernelResult<Option<Signal>> {
        let inv = self.invoker(caller)?;
        let receiver = self.resolve(inv.pd, receiver_cap, ObjectKind::SignalReceiver, Rights::WAIT)?;
        if let Some(context) =
            self.resolve_optional(inv.pd, ack_cap, ObjectKind::SignalContext, Rights::empty())?
        {
            self.ack(context)?;
        }

        if let Some(context) = self.receiver_entry(receiver)?.pending.pop_front() {
            let signal = self.take_signal(context)?;
            self.thread_entry(caller)?.utcb = signal.to_message();
            return Ok(Some(signal));
        }

        self.receiver_entry(receiver)?.listeners.push_back(caller);
        self.thread_entry(caller)?.awaited_receiver = Some(receiver);
        self.block(caller, ThreadState::AwaitsSignal)?;
        Ok(None)
    }

    /// Whether the receiver behind `receiver_cap` has a signal ready.
    pub fn signal_pending(&mut self, caller: ThreadId, receiver_cap: CapId) -> KernelResult<bool> {
        let inv = self.invoker(caller)?;
        let receiver = self.resolve(inv.pd, receiver_cap, ObjectKind::SignalReceiver, Rights::WAIT)?;
        Ok(!self.receiver_entry(receiver)?.pending.is_empty())
    }

    /// Acknowledge the last delivery of the context behind `context_cap`.
    pub fn ack_signal(&mut self, caller: ThreadId, context_cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let context = self.resolve(inv.pd, context_cap, ObjectKind::SignalContext, Rights::empty())?;
        self.ack(context)
    }

    /// Stop the context behind `context_cap` from delivering.
    pub fn kill_signal_context(&mut self, caller: ThreadId, context_cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let context = self.resolve(inv.pd, context_cap, ObjectKind::SignalContext, Rights::CONTROL)?;
        self.kill_context(context)
    }

    /// Destroy the receiver behind `receiver_cap` together with its contexts.
    pub fn kill_signal_receiver(&mut self, caller: ThreadId, receiver_cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        self.resolve(inv.pd, receiver_cap, ObjectKind::SignalReceiver, Rights::DESTROY)?;
        self.delete_object(caller, receiver_cap)
    }

    /// Add `count` to a context and deliver if a listener is waiting.
    pub(crate) fn submit(&mut self, context: ObjectId, count: u32) -> KernelResult<()> {
        let entry = self.context_entry(context)?;
        if entry.state == ContextState::Killed {
            return Err(ProtocolViolation::ContextKilled.into());
        }
        if count == 0 {
            return Ok(());
        }
        entry.count = entry.count.saturating_add(count);
        if entry.state != ContextState::Idle {
            return Ok(());
        }

        entry.state = ContextState::Queued;
        let receiver = entry.receiver;
        self.receiver_entry(receiver)?.pending.push_back(context);
        self.deliver_signals(receiver)
    }

    /// Submit one signal to an optional handler context.
    ///
    /// Returns whether anything was submitted; missing or killed contexts
    /// are skipped.
    pub(crate) fn notify(&mut self, context: Option<ObjectId>) -> KernelResult<bool> {
        let Some(context) = context else {
            return Ok(false);
        };
        match self.objects.context(context).map(SignalContext::state) {
            None | Some(ContextState::Killed) => Ok(false),
            Some(_) => self.submit(context, 1).map(|()| true),
        }
    }

    fn ack(&mut self, context: ObjectId) -> KernelResult<()> {
        let entry = self.context_entry(context)?;
        if entry.state != ContextState::Delivered {
            return Ok(());
        }
        if entry.count == 0 {
            entry.state = ContextState::Idle;
            return Ok(());
        }

        entry.state = ContextState::Queued;
        let receiver = entry.receiver;
        self.receiver_entry(receiver)?.pending.push_back(context);
        self.deliver_signals(receiver)
    }

    fn kill_context(&mut self, context: ObjectId) -> KernelResult<()> {
        let entry = self.context_entry(context)?;
        entry.state = ContextState::Killed;
        entry.count = 0;
        let receiver = entry.receiver;
        if let Some(r) = self.objects.receiver_mut(receiver) {
            r.pending.retain(|&c| c != context);
        }
        Ok(())
    }

    /// Pair waiting listeners with pending contexts, oldest first.
    fn deliver_signals(&mut self, receiver: ObjectId) -> KernelResult<()> {
        loop {
            let r = self.receiver_entry(receiver)?;
            if r.listeners.is_empty() || r.pending.is_empty() {
                return Ok(());
            }
            let (Some(listener), Some(context)) = (r.listeners.pop_front(), r.pending.pop_front())
            else {
                return Ok(());
            };

            let signal = self.take_signal(context)?;
            let thread = self.thread_entry(listener)?;
            thread.awaited_receiver = None;
            thread.utcb = signal.to_message();
            log::trace!("{context} -> {listener}: {} signal(s)", signal.count);
            self.wake(listener, Ok(0))?;
        }
    }

    fn take_signal(&mut self, context: ObjectId) -> KernelResult<Signal> {
        let entry = self.context_entry(context)?;
        let signal = Signal {
            imprint: entry.imprint,
            count: entry.count,
        };
        entry.count = 0;
        entry.state = ContextState::Delivered;
        Ok(signal)
    }

    /// Take a blocked thread off its receiver without waking it.
    pub(crate) fn detach_signal_wait(&mut self, thread: ThreadId) -> KernelResult<()> {
        if let Some(receiver) = self.thread_entry(thread)?.awaited_receiver.take() {
            if let Some(r) = self.objects.receiver_mut(receiver) {
                r.listeners.retain(|&t| t != thread);
            }
        }
        Ok(())
    }

    pub(crate) fn teardown_receiver(
        &mut self,
        receiver: ObjectId,
        pending: &mut VecDeque<ObjectId>,
    ) -> KernelResult<()> {
        let r = self.receiver_entry(receiver)?;
        let listeners: Vec<ThreadId> = r.listeners.drain(..).collect();
        pending.extend(r.contexts.drain(..));
        r.pending.clear();

        for listener in listeners {
            self.thread_entry(listener)?.awaited_receiver = None;
            self.wake(listener, Err(KernelError::PeerDestroyed))?;
        }
        Ok(())
    }

    pub(crate) fn teardown_context(&mut self, context: ObjectId) -> KernelResult<()> {
        self.kill_context(context)?;
        let receiver = self.context_entry(context)?.receiver;
        if let Some(r) = self.objects.receiver_mut(receiver) {
            r.contexts.retain(|&c| c != context);
        }
        Ok(())
    }

    fn receiver_entry(&mut self, id: ObjectId) -> KernelResult<&mut SignalReceiver> {
        self.objects
            .receiver_mut(id)
            .ok_or_else(|| InvariantViolation::MissingObject(id).into())
    }

    fn context_entry(&mut self, id: ObjectId) -> KernelResult<&mut SignalContext> {
        self.objects
            .context_mut(id)
            .ok_or_else(|| InvariantViolation::MissingObject(id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::cpu::CpuId;

    struct Setup {
        kernel: Kernel,
        core: ThreadId,
        waiter: ThreadId,
        receiver_cap: CapId,
        context_cap: CapId,
    }

    fn setup() -> Setup {
        let mut kernel = Kernel::new(KernelConfig {
            cpus: 1,
            max_objects: 64,
            ..KernelConfig::default()
        })
        .unwrap();
        let core = kernel.core_thread();
        let own = kernel
            .pd(kernel.core_pd())
            .unwrap()
            .cspace()
            .find(kernel.core_pd())
            .unwrap();
        let thread_cap = kernel.new_thread(core, own, 1, 0, CapId::NONE).unwrap();
        kernel.start_thread(core, thread_cap, CpuId::BOOT, 0, 0).unwrap();
        let waiter = kernel.lookup(kernel.core_pd(), thread_cap).unwrap().object;

        let receiver_cap = kernel.new_signal_receiver(core).unwrap();
        let context_cap = kernel.new_signal_context(core, receiver_cap, 0x77).unwrap();
        Setup {
            kernel,
            core,
            waiter,
            receiver_cap,
            context_cap,
        }
    }

    #[test]
    fn test_submissions_accumulate() {
        let Setup {
            mut kernel,
            core,
            receiver_cap,
            context_cap,
            ..
        } = setup();

        for _ in 0..3 {
            kernel.submit_signal(core, context_cap, 2).unwrap();
        }
        assert_eq!(kernel.signal_pending(core, receiver_cap), Ok(true));
        assert_eq!(
            kernel.await_signal(core, receiver_cap, CapId::NONE),
            Ok(Some(Signal {
                imprint: 0x77,
                count: 6
            }))
        );
        assert_eq!(kernel.signal_pending(core, receiver_cap), Ok(false));
    }

    #[test]
    fn test_blocked_waiter_woken_with_signal() {
        let Setup {
            mut kernel,
            core,
            waiter,
            receiver_cap,
            context_cap,
        } = setup();
        assert_eq!(kernel.await_signal(waiter, receiver_cap, CapId::NONE), Ok(None));
        assert_eq!(kernel.thread(waiter).unwrap().state(), ThreadState::AwaitsSignal);

        kernel.submit_signal(core, context_cap, 1).unwrap();
        let thread = kernel.thread(waiter).unwrap();
        assert!(thread.is_active());
        assert_eq!(
            Signal::from_message(thread.utcb()),
            Some(Signal {
                imprint: 0x77,
                count: 1
            })
        );
    }

    #[test]
    fn test_redelivery_waits_for_ack() {
        let Setup {
            mut kernel,
            core,
            receiver_cap,
            context_cap,
            ..
        } = setup();

        kernel.submit_signal(core, context_cap, 1).unwrap();
        kernel.await_signal(core, receiver_cap, CapId::NONE).unwrap();
        kernel.submit_signal(core, context_cap, 4).unwrap();
        assert_eq!(kernel.signal_pending(core, receiver_cap), Ok(false));

        assert_eq!(
            kernel.await_signal(core, receiver_cap, context_cap),
            Ok(Some(Signal {
                imprint: 0x77,
                count: 4
            }))
        );
    }

    #[test]
    fn test_killed_context_rejects_submit() {
        let Setup {
            mut kernel,
            core,
            receiver_cap,
            context_cap,
            ..
        } = setup();

        kernel.submit_signal(core, context_cap, 1).unwrap();
        kernel.kill_signal_context(core, context_cap).unwrap();
        assert_eq!(kernel.signal_pending(core, receiver_cap), Ok(false));
        assert_eq!(
            kernel.submit_signal(core, context_cap, 1),
            Err(ProtocolViolation::ContextKilled.into())
        );
    }

    #[test]
    fn test_receiver_destruction_fails_listeners() {
        let Setup {
            mut kernel,
            core,
            waiter,
            receiver_cap,
            context_cap,
        } = setup();
        let context = kernel.lookup(kernel.core_pd(), context_cap).unwrap().object;
        kernel.await_signal(waiter, receiver_cap, CapId::NONE).unwrap();

        kernel.kill_signal_receiver(core, receiver_cap).unwrap();
        let thread = kernel.thread(waiter).unwrap();
        assert!(thread.is_active());
        assert_eq!(
            thread.regs().result(),
            crate::syscall::SyscallError::PeerDestroyed as i64
        );
        assert!(!kernel.objects().contains(context));
        assert!(kernel.lookup(kernel.core_pd(), context_cap).is_err());
    }

    #[test]
    fn test_signal_message_roundtrip_rejects_foreign_tags() {
        assert_eq!(Signal::from_message(&Message::with_words(5, &[1, 2])), None);
    }
}
