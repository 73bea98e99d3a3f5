//! # Nocturne Kernel Core
//!
//! The architecture-independent core of a capability-secured microkernel:
//! the object directory, protection domains, threads with synchronous IPC,
//! asynchronous signals, fault delivery to user-level pagers, and one
//! fair-share scheduler per physical core.
//!
//! ## Design Principles
//!
//! - **Zero Ambient Authority**: every operation names its objects through
//!   capability ids that are resolved in the caller's protection domain
//! - **Explicit Context**: all kernel state lives in one [`Kernel`] value that
//!   is passed to every entry point, so several kernels can coexist in tests
//! - **Arena Objects**: kernel objects live in an indexed arena; back-links
//!   are ids, never pointers
//! - **Closed Object Set**: [`KernelObject`] is a tagged union matched
//!   exhaustively at every dispatch site
//! - **Big Kernel Lock**: cores serialize on one [`sync::KernelLock`], which
//!   detects re-entry by the holding core
//!
//! ## Kernel Entry
//!
//! ```text
//! trap / irq / ipi ──► SmpKernel::enter(core)
//!                         │  KernelLock (reentered callback on same core)
//!                         ▼
//!                      Kernel::enter(core, elapsed, cause)
//!                         ├─ drain global + local work (FIFO)
//!                         ├─ handle cause (syscall, fault, irq, timer, ...)
//!                         ├─ Scheduler::update(elapsed)
//!                         └─ admit next thread's Pd into the core
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cap;
pub mod config;
pub mod cpu;
pub mod error;
pub mod fault;
pub mod invariants;
pub mod ipc;
pub mod irq;
pub mod kernel;
pub mod mem;
pub mod pd;
pub mod sched;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod vm;

pub use cap::{Badge, CapId, KernelObject, ObjectId, ObjectKind, Rights};
pub use config::KernelConfig;
pub use cpu::CpuId;
pub use error::{KernelError, KernelResult, ProtocolViolation, Resource};
pub use kernel::{Dispatch, EntryCause, Kernel};
pub use sync::{KernelLock, SmpKernel};

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
