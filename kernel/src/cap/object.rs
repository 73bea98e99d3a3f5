//! Kernel object kinds and identifiers

use crate::irq::UserIrq;
use crate::pd::ProtectionDomain;
use crate::sched::Thread;
use crate::signal::{SignalContext, SignalReceiver};
use crate::vm::VirtualMachine;

/// Stable identity of a slot in the object arena
///
/// The generation changes every time the slot is reused, so an id kept
/// after its object died never resolves to a newer occupant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    /// Build an id from its parts
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Occupancy generation of the slot
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl core::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ObjectId({}.{})", self.index, self.generation)
    }
}

impl core::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "obj:{}.{}", self.index, self.generation)
    }
}

/// Kinds of kernel objects
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Protection domain
    Pd = 1,
    /// Execution context
    Thread = 2,
    /// Signal receiver
    SignalReceiver = 3,
    /// Signal context
    SignalContext = 4,
    /// User-level interrupt
    Irq = 5,
    /// Virtual machine
    Vm = 6,
}

impl ObjectKind {
    /// Decode the ABI value used by the object constructor call
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pd),
            2 => Some(Self::Thread),
            3 => Some(Self::SignalReceiver),
            4 => Some(Self::SignalContext),
            5 => Some(Self::Irq),
            6 => Some(Self::Vm),
            _ => None,
        }
    }
}

/// The closed set of kernel objects
pub enum KernelObject {
    /// Protection domain
    Pd(ProtectionDomain),
    /// Thread
    Thread(Thread),
    /// Signal receiver
    SignalReceiver(SignalReceiver),
    /// Signal context
    SignalContext(SignalContext),
    /// User-level interrupt
    Irq(UserIrq),
    /// Virtual machine
    Vm(VirtualMachine),
}

impl KernelObject {
    /// Kind tag of this object
    pub fn kind(&self) -> ObjectKind {
        match self {
            KernelObject::Pd(_) => ObjectKind::Pd,
            KernelObject::Thread(_) => ObjectKind::Thread,
            KernelObject::SignalReceiver(_) => ObjectKind::SignalReceiver,
            KernelObject::SignalContext(_) => ObjectKind::SignalContext,
            KernelObject::Irq(_) => ObjectKind::Irq,
            KernelObject::Vm(_) => ObjectKind::Vm,
        }
    }
}
