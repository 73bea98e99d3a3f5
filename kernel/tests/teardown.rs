//! Protection domain teardown tests
//!
//! Destroying a domain must stop its threads on every core, drop every
//! cached translation of its ASID, and only then make the ASID available
//! to the next domain.

use nocturne_kernel::mem::{AccessKind, PhysAddr, Protection, VirtAddr};
use nocturne_kernel::sched::ThreadState;
use nocturne_kernel::{CapId, CpuId, EntryCause, Kernel, KernelConfig, KernelError, ObjectId, Resource};

const PAGE: VirtAddr = VirtAddr::new(0x4000);

fn kernel(cpus: usize, asid_count: u16) -> Kernel {
    Kernel::new(KernelConfig {
        cpus,
        asid_count,
        max_objects: 64,
        ..KernelConfig::default()
    })
    .unwrap()
}

/// Create a domain with one thread holding a quota on `cpu`.
fn spawn(kernel: &mut Kernel, cpu: CpuId) -> (CapId, CapId, ObjectId) {
    let core = kernel.core_thread();
    let pd_cap = kernel.create_pd(core).unwrap();
    let thread_cap = kernel
        .new_thread(core, pd_cap, 1, 5_000, CapId::NONE)
        .unwrap();
    kernel.start_thread(core, thread_cap, cpu, 0x1000, 0).unwrap();
    let thread = kernel.lookup(kernel.core_pd(), thread_cap).unwrap().object;
    (pd_cap, thread_cap, thread)
}

#[test]
fn test_reused_asid_has_no_stale_translation() {
    let mut kernel = kernel(1, 3);
    let core = kernel.core_thread();

    let (first_pd, _, first) = spawn(&mut kernel, CpuId::BOOT);
    kernel
        .map_page(core, first_pd, PAGE, PhysAddr::new(0x9_0000), Protection::READ)
        .unwrap();
    let dispatch = kernel.enter(CpuId::BOOT, 0, EntryCause::Timer);
    assert_eq!(dispatch.thread, Some(first));
    let asid = dispatch.asid.unwrap();

    assert_eq!(
        kernel.access(CpuId::BOOT, PAGE, AccessKind::Read),
        Some(PhysAddr::new(0x9_0000))
    );
    assert!(kernel.cpu(CpuId::BOOT).unwrap().tlb().holds(asid));

    kernel.kill_pd(core, first_pd).unwrap();
    assert!(!kernel.cpu(CpuId::BOOT).unwrap().tlb().holds(asid));
    assert!(kernel.cpu(CpuId::BOOT).unwrap().active().is_none());
    assert_eq!(kernel.thread(first).unwrap().state(), ThreadState::Dead);

    let (_, _, second) = spawn(&mut kernel, CpuId::BOOT);
    let dispatch = kernel.enter(CpuId::BOOT, 0, EntryCause::Timer);
    assert_eq!(dispatch.thread, Some(second));
    assert_eq!(dispatch.asid, Some(asid));
    assert_eq!(kernel.asids().recycled(), 1);

    assert_eq!(kernel.access(CpuId::BOOT, PAGE, AccessKind::Read), None);
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_asid_exhaustion_is_recoverable() {
    let mut kernel = kernel(1, 2);
    let core = kernel.core_thread();

    assert_eq!(
        kernel.create_pd(core),
        Err(KernelError::Exhausted(Resource::Asids))
    );
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_teardown_reaches_remote_cores() {
    let mut kernel = kernel(2, 8);
    let core = kernel.core_thread();
    let remote = CpuId(1);

    let (pd_cap, thread_cap, thread) = spawn(&mut kernel, remote);
    let dispatch = kernel.enter(remote, 0, EntryCause::Ipi);
    assert_eq!(dispatch.thread, Some(thread));
    assert!(kernel.cpu(remote).unwrap().active().is_some());

    kernel.kill_pd(core, pd_cap).unwrap();
    let cpu = kernel.cpu(remote).unwrap();
    assert!(cpu.active().is_none());
    assert!(!cpu.scheduler().is_ready(thread));

    // The remote core goes idle on its next entry.
    let dispatch = kernel.enter(remote, 0, EntryCause::Ipi);
    assert_eq!(dispatch.thread, None);

    kernel.delete_cap(core, thread_cap).unwrap();
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_domain_cannot_grow_while_gone() {
    let mut kernel = kernel(1, 8);
    let core = kernel.core_thread();

    let (pd_cap, _, _) = spawn(&mut kernel, CpuId::BOOT);
    kernel.kill_pd(core, pd_cap).unwrap();
    assert_eq!(
        kernel.new_thread(core, pd_cap, 0, 0, CapId::NONE),
        Err(KernelError::InvalidCapability(pd_cap))
    );
}
