//! Synchronous rendezvous IPC
//!
//! A client calls a server thread and blocks until the server replies. The
//! request stays in the client's message buffer until the server is ready
//! to receive it; nothing is buffered by the kernel. Clients that call a
//! busy server queue up on it in FIFO order.
//!
//! ```text
//! client                     server
//!   │ call ──────────────────► (pending queue, or delivered if waiting)
//!   │ AwaitsIpc                │ wait / reply_and_wait
//!   │                          │ ... handles request ...
//!   ◄──────────────────── reply│
//!   │ Active                   │
//! ```
//!
//! Each call is answered at most once: the server's pending-caller slot is
//! cleared by the reply. When either side dies the other side fails
//! immediately with `PeerDestroyed`.

mod message;

pub use message::{Message, MSG_CAPS, MSG_WORDS};

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::cap::{Badge, CapId, ObjectKind, Rights};
use crate::error::{KernelError, KernelResult, ProtocolViolation};
use crate::kernel::Kernel;
use crate::pd::PdId;
use crate::sched::{ThreadId, ThreadState};

/// IPC role a thread is blocked in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcState {
    /// Not blocked in IPC
    Inactive,
    /// Waiting for the next request
    AwaitRequest,
    /// Called the given thread, waiting for its reply
    AwaitReply(ThreadId),
}

/// The client a server owes a reply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Caller {
    /// Client is blocked waiting for the reply
    Waiting(ThreadId),
    /// Client died while its request was being handled
    Lost,
}

/// Result of waiting for a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Receive {
    /// A request was in the queue and now sits in the message buffer
    Delivered,
    /// No request yet; the thread is blocked
    Blocked,
}

/// Per-thread IPC bookkeeping
#[derive(Debug)]
pub struct IpcNode {
    pub(crate) state: IpcState,
    pub(crate) pending: VecDeque<ThreadId>,
    pub(crate) caller: Option<Caller>,
    pub(crate) badge: Badge,
}

impl IpcNode {
    /// Create an idle node
    pub fn new() -> Self {
        Self {
            state: IpcState::Inactive,
            pending: VecDeque::new(),
            caller: None,
            badge: Badge::NONE,
        }
    }

    /// Current IPC role
    pub fn state(&self) -> IpcState {
        self.state
    }

    /// Client owed a reply
    pub fn caller(&self) -> Option<Caller> {
        self.caller
    }

    /// Clients queued on this thread, oldest first
    pub fn pending(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.pending.iter().copied()
    }
}

impl Default for IpcNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Send `msg` to the thread behind `target_cap` and block for its reply.
    ///
    /// The reply, or the failure, is delivered into the caller's registers
    /// and message buffer when the caller is woken.
    pub fn call(&mut self, caller: ThreadId, target_cap: CapId, msg: Message) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let entry = self
            .objects
            .lookup_typed(inv.pd, target_cap, ObjectKind::Thread, Rights::CALL)?;
        let target = entry.object;
        if target == caller {
            return Err(ProtocolViolation::SelfCall.into());
        }
        if self.thread_ref(target)?.state == ThreadState::Dead {
            return Err(KernelError::PeerDestroyed);
        }

        let client = self.thread_entry(caller)?;
        client.utcb = msg;
        client.ipc.state = IpcState::AwaitReply(target);
        client.ipc.badge = entry.badge;
        self.block(caller, ThreadState::AwaitsIpc)?;

        let server = self.thread_ref(target)?;
        if server.state == ThreadState::AwaitsIpc && server.ipc.state == IpcState::AwaitRequest {
            self.deliver_request(target, caller)?;
            self.wake(target, Ok(0))?;
        } else {
            self.thread_entry(target)?.ipc.pending.push_back(caller);
            log::trace!("{caller} queued on {target}");
        }
        Ok(())
    }

    /// Wait for the next request.
    pub fn wait(&mut self, receiver: ThreadId) -> KernelResult<Receive> {
        self.invoker(receiver)?;
        let node = &mut self.thread_entry(receiver)?.ipc;
        match node.caller {
            Some(Caller::Waiting(_)) => return Err(ProtocolViolation::ReplyPending.into()),
            Some(Caller::Lost) => node.caller = None,
            None => {}
        }
        self.await_request(receiver)
    }

    /// Answer the call the replier received last.
    pub fn reply(&mut self, replier: ThreadId, msg: Message) -> KernelResult<()> {
        self.invoker(replier)?;
        self.send_reply(replier, msg)
    }

    /// Answer the last call, if any, and wait for the next request.
    pub fn reply_and_wait(&mut self, server: ThreadId, msg: Message) -> KernelResult<Receive> {
        self.invoker(server)?;
        match self.send_reply(server, msg) {
            Ok(()) | Err(KernelError::Protocol(ProtocolViolation::NoPendingCall)) => {}
            Err(KernelError::PeerDestroyed) => {
                log::debug!("{server}: caller died before the reply");
            }
            Err(err) => return Err(err),
        }
        self.await_request(server)
    }

    fn await_request(&mut self, server: ThreadId) -> KernelResult<Receive> {
        if let Some(client) = self.thread_entry(server)?.ipc.pending.pop_front() {
            self.deliver_request(server, client)?;
            return Ok(Receive::Delivered);
        }
        self.thread_entry(server)?.ipc.state = IpcState::AwaitRequest;
        self.block(server, ThreadState::AwaitsIpc)?;
        Ok(Receive::Blocked)
    }

    fn send_reply(&mut self, server: ThreadId, mut msg: Message) -> KernelResult<()> {
        let client = match self.thread_entry(server)?.ipc.caller.take() {
            None => return Err(ProtocolViolation::NoPendingCall.into()),
            Some(Caller::Lost) => return Err(KernelError::PeerDestroyed),
            Some(Caller::Waiting(client)) => client,
        };

        let src = self.thread_ref(server)?.pd;
        let dst = self.thread_ref(client)?.pd;
        msg.set_badge(Badge::NONE);
        let msg = self.transfer(src, dst, msg)?;

        let entry = self.thread_entry(client)?;
        entry.utcb = msg;
        entry.ipc.state = IpcState::Inactive;
        log::trace!("{server} -> {client}: reply");
        self.wake(client, Ok(0))
    }

    /// Copy the request of `client` into the message buffer of `server`.
    fn deliver_request(&mut self, server: ThreadId, client: ThreadId) -> KernelResult<()> {
        let entry = self.thread_ref(client)?;
        let (msg, badge, src) = (entry.utcb.clone(), entry.ipc.badge, entry.pd);
        let dst = self.thread_ref(server)?.pd;
        let mut msg = self.transfer(src, dst, msg)?;
        msg.set_badge(badge);

        let entry = self.thread_entry(server)?;
        entry.utcb = msg;
        entry.ipc.state = IpcState::Inactive;
        entry.ipc.caller = Some(Caller::Waiting(client));
        log::trace!("{client} -> {server}: request");
        Ok(())
    }

    /// Map the capabilities attached to `msg` from `src` into `dst`.
    ///
    /// Capabilities that cannot be mapped arrive as `CapId::NONE`.
    fn transfer(&mut self, src: PdId, dst: PdId, mut msg: Message) -> KernelResult<Message> {
        if msg.caps().is_empty() {
            return Ok(msg);
        }

        let mut translated: heapless::Vec<CapId, MSG_CAPS> = heapless::Vec::new();
        for &cap in msg.caps() {
            let mapped = match self.objects.map_cap(src, cap, dst, Rights::ALL, Badge::NONE) {
                Ok(mapped) => mapped,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::trace!("{cap} not transferred: {err}");
                    CapId::NONE
                }
            };
            // same capacity as the source list
            let _ = translated.push(mapped);
        }
        msg.replace_caps(translated);
        Ok(msg)
    }

    /// Take a blocked thread out of its IPC wait without waking it.
    pub(crate) fn detach_ipc(&mut self, thread: ThreadId) -> KernelResult<()> {
        let node = &mut self.thread_entry(thread)?.ipc;
        let state = core::mem::replace(&mut node.state, IpcState::Inactive);

        if let IpcState::AwaitReply(target) = state {
            if let Some(server) = self.objects.thread_mut(target) {
                server.ipc.pending.retain(|&client| client != thread);
                if server.ipc.caller == Some(Caller::Waiting(thread)) {
                    server.ipc.caller = Some(Caller::Lost);
                }
            }
        }
        Ok(())
    }

    /// Fail every client queued on, or served by, a dying thread.
    pub(crate) fn fail_ipc_peers(&mut self, thread: ThreadId) -> KernelResult<()> {
        let node = &mut self.thread_entry(thread)?.ipc;
        let mut clients: Vec<ThreadId> = node.pending.drain(..).collect();
        if let Some(Caller::Waiting(client)) = node.caller.take() {
            clients.push(client);
        }

        for client in clients {
            self.thread_entry(client)?.ipc.state = IpcState::Inactive;
            self.wake(client, Err(KernelError::PeerDestroyed))?;
            log::trace!("{client}: peer {thread} destroyed");
        }
        Ok(())
    }
}
