//! # Kernel Lock
//!
//! All cores serialize on one lock around kernel entry. The lock records
//! which core holds it, so a core that enters the kernel again while it is
//! still inside (a trap taken in kernel mode) is detected instead of
//! spinning on itself forever.
//!
//! ```text
//!            lock(core N)                      release
//! Unlocked ───────────────► LockedBy(N) ─────────────────► Unlocked
//!                              │  lock(core N)
//!                              └──► reentered callback, no guard
//! ```

use core::sync::atomic::{AtomicU32, Ordering};

use crate::cpu::CpuId;
use crate::kernel::{Dispatch, EntryCause, Kernel};

const UNLOCKED: u32 = u32::MAX;

/// Observable state of a [`KernelLock`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Nobody is in the kernel
    Unlocked,
    /// The given core is in the kernel
    LockedBy(CpuId),
}

/// Spin lock owned by one core at a time
pub struct KernelLock {
    owner: AtomicU32,
}

impl KernelLock {
    /// Create an unlocked lock.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire the lock for `cpu`.
    ///
    /// If `cpu` already holds the lock, `reentered` runs and no guard is
    /// returned. The caller must not run the normal entry body on `None`:
    /// the interrupted entry on the same core still owns the kernel and
    /// releases the lock when it finishes. Otherwise the call spins until
    /// the lock is free.
    pub fn lock(&self, cpu: CpuId, reentered: impl FnOnce()) -> Option<KernelLockGuard<'_>> {
        if self.owner.load(Ordering::Relaxed) == cpu.0 {
            reentered();
            return None;
        }
        loop {
            if let Some(guard) = self.try_lock(cpu) {
                return Some(guard);
            }
            while self.owner.load(Ordering::Relaxed) != UNLOCKED {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquire the lock for `cpu` if nobody holds it.
    pub fn try_lock(&self, cpu: CpuId) -> Option<KernelLockGuard<'_>> {
        self.owner
            .compare_exchange(UNLOCKED, cpu.0, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| KernelLockGuard { lock: self })
    }

    /// Current holder
    pub fn state(&self) -> LockState {
        match self.owner.load(Ordering::Relaxed) {
            UNLOCKED => LockState::Unlocked,
            owner => LockState::LockedBy(CpuId(owner)),
        }
    }
}

impl Default for KernelLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the [`KernelLock`] on drop
pub struct KernelLockGuard<'a> {
    lock: &'a KernelLock,
}

impl KernelLockGuard<'_> {
    /// Core holding the lock
    pub fn cpu(&self) -> CpuId {
        CpuId(self.lock.owner.load(Ordering::Relaxed))
    }
}

impl Drop for KernelLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.owner.store(UNLOCKED, Ordering::Release);
    }
}

/// A [`Kernel`] shared by all cores behind the kernel lock
pub struct SmpKernel {
    lock: KernelLock,
    kernel: spin::Mutex<Kernel>,
}

impl SmpKernel {
    /// Wrap a booted kernel.
    pub fn new(kernel: Kernel) -> Self {
        Self {
            lock: KernelLock::new(),
            kernel: spin::Mutex::new(kernel),
        }
    }

    /// Kernel entry on `cpu`.
    ///
    /// Returns `None` if `cpu` is already inside the kernel; `reentered` has
    /// run in that case.
    pub fn enter(
        &self,
        cpu: CpuId,
        elapsed: u64,
        cause: EntryCause,
        reentered: impl FnOnce(),
    ) -> Option<Dispatch> {
        let _guard = self.lock.lock(cpu, reentered)?;
        Some(self.kernel.lock().enter(cpu, elapsed, cause))
    }

    /// Run `f` on the kernel while holding the lock for `cpu`.
    pub fn with<R>(&self, cpu: CpuId, f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
        let _guard = self.lock.lock(cpu, || log::error!("core {cpu} re-entered the kernel"))?;
        Some(f(&mut self.kernel.lock()))
    }

    /// The kernel lock
    pub fn lock(&self) -> &KernelLock {
        &self.lock
    }

    /// Unwrap the kernel.
    pub fn into_inner(self) -> Kernel {
        self.kernel.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    #[test]
    fn test_lock_states() {
        let lock = KernelLock::new();
        assert_eq!(lock.state(), LockState::Unlocked);

        {
            let guard = lock.lock(CpuId(2), || unreachable!()).unwrap();
            assert_eq!(guard.cpu(), CpuId(2));
            assert_eq!(lock.state(), LockState::LockedBy(CpuId(2)));
            assert!(lock.try_lock(CpuId(1)).is_none());
        }

        assert_eq!(lock.state(), LockState::Unlocked);
        assert!(lock.try_lock(CpuId(1)).is_some());
    }

    #[test]
    fn test_reentry_runs_callback() {
        let lock = KernelLock::new();
        let _guard = lock.lock(CpuId::BOOT, || unreachable!()).unwrap();

        let mut reentered = false;
        assert!(lock.lock(CpuId::BOOT, || reentered = true).is_none());
        assert!(reentered);
        assert_eq!(lock.state(), LockState::LockedBy(CpuId::BOOT));
    }

    #[test]
    fn test_smp_kernel_entry() {
        let kernel = SmpKernel::new(Kernel::new(KernelConfig::default()).unwrap());
        let dispatch = kernel
            .enter(CpuId::BOOT, 0, EntryCause::Timer, || unreachable!())
            .unwrap();
        assert_eq!(dispatch.cpu, CpuId::BOOT);
        assert_eq!(kernel.lock().state(), LockState::Unlocked);

        let cores = kernel.with(CpuId(1), |k| k.cpu_count()).unwrap();
        assert_eq!(cores, 4);
    }
}
