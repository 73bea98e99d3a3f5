//! Structural invariants
//!
//! [`check_all`] walks the whole kernel state and reports every
//! inconsistency it finds. The `paranoid` feature runs it after each kernel
//! entry; tests call it after every scenario.

use alloc::vec::Vec;

use crate::cap::{KernelObject, ObjectId, ObjectKind};
use crate::cpu::CpuId;
use crate::error::InvariantViolation;
use crate::ipc::{Caller, IpcState};
use crate::kernel::Kernel;
use crate::sched::{Thread, ThreadState};

/// Collect all invariant violations of `kernel`.
pub fn check_all(kernel: &Kernel) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    check_directories(kernel, &mut violations);
    check_back_links(kernel, &mut violations);
    check_thread_binding(kernel, &mut violations);
    check_ipc(kernel, &mut violations);
    check_cores(kernel, &mut violations);
    check_asids(kernel, &mut violations);
    violations
}

/// Every directory entry names a live object of the recorded kind and is
/// mirrored by a back-link.
fn check_directories(kernel: &Kernel, out: &mut Vec<InvariantViolation>) {
    let objects = kernel.objects();
    for (pd, entry) in objects.iter() {
        let KernelObject::Pd(domain) = &entry.object else {
            continue;
        };
        for (cap, cap_entry) in domain.cspace().iter() {
            let Some(target) = objects.get(cap_entry.object) else {
                out.push(InvariantViolation::DanglingEntry {
                    pd,
                    cap,
                    object: cap_entry.object,
                });
                continue;
            };
            if target.object.kind() != cap_entry.kind {
                out.push(InvariantViolation::KindMismatch {
                    object: cap_entry.object,
                    expected: cap_entry.kind,
                });
            }
            if !target.links().contains(&(pd, cap)) {
                out.push(InvariantViolation::BackLink {
                    object: cap_entry.object,
                    pd,
                    cap,
                });
            }
        }
    }
}

/// Every back-link is mirrored by a directory entry, and every live object
/// is referenced at least once.
fn check_back_links(kernel: &Kernel, out: &mut Vec<InvariantViolation>) {
    let objects = kernel.objects();
    for (id, entry) in objects.iter() {
        if entry.links().is_empty() {
            out.push(InvariantViolation::Unreferenced(id));
        }
        for &(pd, cap) in entry.links() {
            let mirrored = kernel
                .pd(pd)
                .and_then(|domain| domain.cspace().get(cap).ok())
                .is_some_and(|cap_entry| cap_entry.object == id);
            if !mirrored {
                out.push(InvariantViolation::BackLink { object: id, pd, cap });
            }
        }
    }
}

/// Live threads and their domains agree on the binding.
fn check_thread_binding(kernel: &Kernel, out: &mut Vec<InvariantViolation>) {
    let objects = kernel.objects();
    for (id, entry) in objects.iter() {
        match &entry.object {
            KernelObject::Thread(thread) if thread.state() != ThreadState::Dead => {
                let bound = kernel
                    .pd(thread.pd())
                    .is_some_and(|domain| domain.threads().contains(&id));
                if !bound {
                    out.push(InvariantViolation::ThreadBinding {
                        thread: id,
                        pd: thread.pd(),
                    });
                }
            }
            KernelObject::Pd(domain) => {
                for &thread in domain.threads() {
                    if kernel.thread(thread).is_some_and(|t| t.pd() != id) {
                        out.push(InvariantViolation::ThreadBinding { thread, pd: id });
                    }
                }
            }
            _ => {}
        }
    }
}

/// Clients, servers and pending queues reference each other consistently.
fn check_ipc(kernel: &Kernel, out: &mut Vec<InvariantViolation>) {
    let awaits_reply_from = |client: ObjectId, server: ObjectId| {
        kernel.thread(client).is_some_and(|t| {
            t.state() == ThreadState::AwaitsIpc && t.ipc().state() == IpcState::AwaitReply(server)
        })
    };

    for (id, entry) in kernel.objects().iter() {
        let KernelObject::Thread(thread) = &entry.object else {
            continue;
        };
        let ipc = thread.ipc();
        let consistent = match ipc.state() {
            IpcState::Inactive => true,
            IpcState::AwaitRequest => thread.state() == ThreadState::AwaitsIpc,
            IpcState::AwaitReply(server) => {
                thread.state() == ThreadState::AwaitsIpc
                    && kernel.thread(server).is_some_and(|s| serves(s, id))
            }
        } && ipc.pending().all(|client| awaits_reply_from(client, id))
            && match ipc.caller() {
                Some(Caller::Waiting(client)) => awaits_reply_from(client, id),
                Some(Caller::Lost) | None => true,
            };

        if !consistent {
            out.push(InvariantViolation::IpcLink { thread: id });
        }
    }
}

fn serves(server: &Thread, client: ObjectId) -> bool {
    let ipc = server.ipc();
    ipc.caller() == Some(Caller::Waiting(client)) || ipc.pending().any(|t| t == client)
}

/// Ready threads are active on their core, and the running thread's domain
/// is the core's active address space.
fn check_cores(kernel: &Kernel, out: &mut Vec<InvariantViolation>) {
    for index in 0..kernel.cpu_count() {
        let Some(cpu) = kernel.cpu(CpuId(index as u32)) else {
            continue;
        };
        let core = cpu.id();

        for thread in cpu.scheduler().ready_threads() {
            let runnable = kernel
                .thread(thread)
                .is_some_and(|t| t.is_active() && t.cpu() == Some(core));
            if !runnable {
                out.push(InvariantViolation::Scheduler { core, thread });
            }
        }

        if let Some(thread) = cpu.current() {
            if let Some(t) = kernel.thread(thread).filter(|t| t.is_active()) {
                if cpu.active().map(|space| space.pd) != Some(t.pd()) {
                    out.push(InvariantViolation::AddressSpace { core, thread });
                }
            }
        }

        if let Some(space) = cpu.active() {
            if !kernel.asids().is_allocated(space.asid) {
                out.push(InvariantViolation::AsidNotAllocated(space.asid));
            }
        }
    }
}

/// Live domains hold distinct, allocated ASIDs.
fn check_asids(kernel: &Kernel, out: &mut Vec<InvariantViolation>) {
    let mut seen = Vec::new();
    for id in kernel.objects().ids_of(ObjectKind::Pd) {
        let Some(asid) = kernel.pd(id).and_then(|domain| domain.asid()) else {
            continue;
        };
        if seen.contains(&asid) {
            out.push(InvariantViolation::AsidShared(asid));
        }
        if !kernel.asids().is_allocated(asid) {
            out.push(InvariantViolation::AsidNotAllocated(asid));
        }
        seen.push(asid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::{Badge, Rights};
    use crate::config::KernelConfig;
    use crate::kernel::EntryCause;

    #[test]
    fn test_fresh_kernel_is_consistent() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        assert_eq!(check_all(&kernel), Vec::new());
        kernel.enter(CpuId::BOOT, 0, EntryCause::Timer);
        assert_eq!(check_all(&kernel), Vec::new());
    }

    #[test]
    fn test_consistent_after_object_churn() {
        let mut kernel = Kernel::new(KernelConfig::uniprocessor()).unwrap();
        let core = kernel.core_thread();
        let receiver = kernel.new_signal_receiver(core).unwrap();
        let context = kernel.new_signal_context(core, receiver, 1).unwrap();
        let pd = kernel.create_pd(core).unwrap();
        let thread = kernel.new_thread(core, pd, 0, 0, context).unwrap();
        kernel.start_thread(core, thread, CpuId::BOOT, 0, 0).unwrap();
        kernel
            .map_cap(core, receiver, pd, Rights::WAIT, Badge::NONE)
            .unwrap();
        assert_eq!(check_all(&kernel), Vec::new());

        kernel.kill_pd(core, pd).unwrap();
        kernel.delete_cap(core, thread).unwrap();
        assert_eq!(check_all(&kernel), Vec::new());
        assert_eq!(kernel.check_invariants(), Ok(()));
    }

    #[test]
    fn test_detects_dangling_back_link() {
        let mut kernel = Kernel::new(KernelConfig::uniprocessor()).unwrap();
        let core = kernel.core_thread();
        let receiver = kernel.new_signal_receiver(core).unwrap();
        let core_pd = kernel.core_pd();
        let id = kernel.lookup(core_pd, receiver).unwrap().object;

        // Drop the entry behind the arena's back.
        kernel.pd_mut(core_pd).unwrap().cspace.remove(receiver).unwrap();

        let violations = check_all(&kernel);
        assert!(violations.contains(&InvariantViolation::BackLink {
            object: id,
            pd: core_pd,
            cap: receiver,
        }));
        assert!(kernel.check_invariants().is_err());
    }
}
