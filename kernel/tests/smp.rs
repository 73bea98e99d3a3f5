//! Multicore entry tests
//!
//! Host threads play the cores. Every entry goes through the kernel lock,
//! so the kernel must come out consistent no matter how entries interleave.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use nocturne_kernel::sync::LockState;
use nocturne_kernel::{CapId, CpuId, EntryCause, Kernel, KernelConfig, SmpKernel};

const CORES: usize = 4;

fn smp_kernel() -> (SmpKernel, Vec<CapId>) {
    let mut kernel = Kernel::new(KernelConfig {
        cpus: CORES,
        max_objects: 64,
        ..KernelConfig::default()
    })
    .unwrap();
    let core = kernel.core_thread();

    let pd_cap = kernel.create_pd(core).unwrap();
    let mut threads = Vec::new();
    for cpu in 0..CORES {
        for quota in [0, 2_000] {
            let cap = kernel
                .new_thread(core, pd_cap, 1, quota, CapId::NONE)
                .unwrap();
            kernel
                .start_thread(core, cap, CpuId(cpu as u32), 0x1000, 0)
                .unwrap();
            threads.push(cap);
        }
    }
    (SmpKernel::new(kernel), threads)
}

#[test]
fn test_concurrent_entries_stay_consistent() {
    let (kernel, _) = smp_kernel();
    let kernel = Arc::new(kernel);
    let entries = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..CORES)
        .map(|cpu| {
            let kernel = Arc::clone(&kernel);
            let entries = Arc::clone(&entries);
            thread::spawn(move || {
                let cpu = CpuId(cpu as u32);
                for round in 0..200u64 {
                    let cause = if round % 3 == 0 {
                        EntryCause::Ipi
                    } else {
                        EntryCause::Timer
                    };
                    let dispatch = kernel
                        .enter(cpu, round % 700, cause, || panic!("core {cpu} re-entered"))
                        .expect("distinct cores never re-enter");
                    assert_eq!(dispatch.cpu, cpu);
                    assert!(dispatch.thread.is_some());
                    entries.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(entries.load(Ordering::Relaxed), CORES * 200);
    assert_eq!(kernel.lock().state(), LockState::Unlocked);
    let kernel = Arc::try_unwrap(kernel).ok().unwrap().into_inner();
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_reentry_takes_reentered_branch() {
    let (kernel, _) = smp_kernel();
    let cpu = CpuId(2);

    let mut reentered = false;
    let outcome = kernel.with(cpu, |_| {
        assert_eq!(kernel.lock().state(), LockState::LockedBy(cpu));
        kernel.enter(cpu, 0, EntryCause::Timer, || reentered = true)
    });
    assert_eq!(outcome, Some(None));
    assert!(reentered);
    assert_eq!(kernel.lock().state(), LockState::Unlocked);
}

#[test]
fn test_cross_core_kill_from_boot_core() {
    let (kernel, threads) = smp_kernel();
    let remote = CpuId(3);

    let first = kernel
        .enter(remote, 0, EntryCause::Ipi, || unreachable!())
        .unwrap();
    let victim = first.thread.unwrap();

    kernel
        .with(CpuId::BOOT, |k| {
            let core = k.core_thread();
            let cap = threads
                .iter()
                .copied()
                .find(|&cap| k.lookup(k.core_pd(), cap).unwrap().object == victim)
                .unwrap();
            k.kill_thread(core, cap).unwrap();
            assert!(k.cpu(remote).unwrap().ipi_pending());
        })
        .unwrap();

    let next = kernel
        .enter(remote, 0, EntryCause::Ipi, || unreachable!())
        .unwrap();
    assert!(next.thread.is_some());
    assert_ne!(next.thread, Some(victim));
    assert_eq!(kernel.into_inner().check_invariants(), Ok(()));
}
