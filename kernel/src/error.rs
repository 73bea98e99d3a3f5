//! Kernel error taxonomy
//!
//! Everything a user thread can trigger (bad capability, protocol misuse,
//! exhausted resources) is a recoverable [`KernelError`] returned at the
//! syscall boundary. Only [`KernelError::Fatal`] reports a broken kernel
//! invariant; the entry path halts the kernel on it instead of returning.

use crate::cap::{CapId, ObjectId, ObjectKind, Rights};
use crate::cpu::CpuId;
use crate::mem::Asid;

/// Result of a kernel operation
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// Capability id does not resolve in the caller's directory
    #[error("invalid capability {0}")]
    InvalidCapability(CapId),
    /// Capability resolves to an object of another kind
    #[error("capability names a {found:?}, expected a {expected:?}")]
    WrongKind {
        /// Kind the operation needs
        expected: ObjectKind,
        /// Kind the capability refers to
        found: ObjectKind,
    },
    /// Capability lacks rights required by the operation
    #[error("capability lacks rights {0}")]
    InsufficientRights(Rights),
    /// Only the owning domain may destroy the object
    #[error("caller does not own the object")]
    NotOwner,
    /// Operation is not allowed in the current protocol state
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    /// A bounded kernel resource ran out
    #[error("out of {0}")]
    Exhausted(#[from] Resource),
    /// The peer of a blocking operation was destroyed
    #[error("peer was destroyed")]
    PeerDestroyed,
    /// A blocking operation was cancelled from outside
    #[error("blocking operation was cancelled")]
    Cancelled,
    /// Malformed argument (alignment, range, unknown core)
    #[error("invalid argument")]
    InvalidArgument,
    /// Unknown kernel call id
    #[error("unknown kernel call {0}")]
    UnknownCall(u64),
    /// Kernel-internal structure is corrupt; never returned to user code
    #[error("kernel invariant violated: {0}")]
    Fatal(#[from] InvariantViolation),
}

impl KernelError {
    /// Whether the error indicates broken kernel state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::Fatal(_))
    }
}

/// Misuse of a stateful kernel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// Reply without a received call to answer
    #[error("no call awaiting a reply")]
    NoPendingCall,
    /// Waiting for a new request while the previous one is unanswered
    #[error("previous call has not been replied to")]
    ReplyPending,
    /// A thread called itself
    #[error("thread cannot call itself")]
    SelfCall,
    /// The calling thread is not in a state that can issue calls
    #[error("caller is not running")]
    CallerBlocked,
    /// Resume of a thread that is not held in a fault or pause
    #[error("thread is not awaiting restart")]
    NotAwaitingRestart,
    /// Resume aimed at an earlier fault than the current one
    #[error("resume refers to a stale fault")]
    StaleResume,
    /// Thread was already started
    #[error("thread already started")]
    AlreadyStarted,
    /// Target thread is not runnable
    #[error("thread is not active")]
    NotActive,
    /// Signal context was killed
    #[error("signal context is dead")]
    ContextKilled,
    /// Interrupt line already has a handler
    #[error("interrupt line is already bound")]
    LineInUse,
    /// Protection domain is being torn down
    #[error("protection domain is dying")]
    PdDying,
}

/// Bounded kernel resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Resource {
    /// Object arena slots
    #[error("kernel object slots")]
    Objects,
    /// Entries of one capability directory
    #[error("capability directory slots")]
    CapabilitySlots,
    /// Address-space identifiers
    #[error("address-space identifiers")]
    Asids,
    /// Capability slots in one message
    #[error("message capability slots")]
    MessageCaps,
}

/// Broken structural invariant of the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// Directory entry points at an object that does not exist
    #[error("{pd} entry {cap} references missing object {object}")]
    DanglingEntry {
        /// Domain holding the entry
        pd: ObjectId,
        /// Entry id
        cap: CapId,
        /// Referenced object
        object: ObjectId,
    },
    /// Directory entry without matching back-link, or the reverse
    #[error("back-link of {object} to {pd} entry {cap} is inconsistent")]
    BackLink {
        /// Object
        object: ObjectId,
        /// Domain holding the entry
        pd: ObjectId,
        /// Entry id
        cap: CapId,
    },
    /// Object is not of the kind recorded for it
    #[error("{object} is not a {expected:?}")]
    KindMismatch {
        /// Object
        object: ObjectId,
        /// Recorded kind
        expected: ObjectKind,
    },
    /// Thread and domain disagree about their binding
    #[error("{thread} is not bound to {pd}")]
    ThreadBinding {
        /// Thread
        thread: ObjectId,
        /// Domain
        pd: ObjectId,
    },
    /// IPC node references a peer in an incompatible state
    #[error("IPC state of {thread} is inconsistent")]
    IpcLink {
        /// Thread
        thread: ObjectId,
    },
    /// Core runs a thread whose domain is not installed
    #[error("core {core} runs {thread} outside its address space")]
    AddressSpace {
        /// Core
        core: CpuId,
        /// Thread
        thread: ObjectId,
    },
    /// Scheduler holds a thread that is not runnable on that core
    #[error("core {core} schedules non-runnable {thread}")]
    Scheduler {
        /// Core
        core: CpuId,
        /// Thread
        thread: ObjectId,
    },
    /// Two live domains share an address-space identifier
    #[error("ASID {0} assigned twice")]
    AsidShared(Asid),
    /// ASID released that the allocator does not consider allocated
    #[error("ASID {0} is not allocated")]
    AsidNotAllocated(Asid),
    /// Live object without any directory entry
    #[error("{0} has no references")]
    Unreferenced(ObjectId),
    /// Kernel-internal id of an object that does not exist
    #[error("{0} does not exist")]
    MissingObject(ObjectId),
    /// Kernel entered on a core it does not manage
    #[error("unknown core {0}")]
    UnknownCore(CpuId),
}
