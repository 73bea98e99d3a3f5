//! Virtual machines
//!
//! The kernel only tracks whether a VM may run and which signal context is
//! told when it stops. Guest state and the world switch belong to the
//! architecture layer.

use crate::cap::{CapId, KernelObject, ObjectId, ObjectKind, Rights};
use crate::cpu::CpuId;
use crate::error::{InvariantViolation, KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::sched::ThreadId;

/// Run state of a VM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    /// Not scheduled
    Paused,
    /// May enter the guest
    Running,
}

/// Virtual machine
#[derive(Debug)]
pub struct VirtualMachine {
    cpu: CpuId,
    context: ObjectId,
    state: VmState,
    exits: u64,
}

impl VirtualMachine {
    /// Core the VM runs on
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Run state
    pub fn state(&self) -> VmState {
        self.state
    }

    /// Exits so far
    pub fn exits(&self) -> u64 {
        self.exits
    }
}

impl Kernel {
    /// Create a paused VM on `cpu` reporting exits to `context_cap`.
    pub fn new_vm(&mut self, caller: ThreadId, cpu: CpuId, context_cap: CapId) -> KernelResult<CapId> {
        let inv = self.invoker(caller)?;
        if cpu.index() >= self.cpus.len() {
            return Err(KernelError::InvalidArgument);
        }
        let context = self.resolve(inv.pd, context_cap, ObjectKind::SignalContext, Rights::SIGNAL)?;
        let vm = VirtualMachine {
            cpu,
            context,
            state: VmState::Paused,
            exits: 0,
        };
        let (id, cap) = self.install(inv.pd, KernelObject::Vm(vm))?;
        log::debug!("{id} created on core {cpu}");
        Ok(cap)
    }

    /// Let the VM behind `vm_cap` run.
    pub fn run_vm(&mut self, caller: ThreadId, vm_cap: CapId) -> KernelResult<()> {
        self.set_vm_state(caller, vm_cap, VmState::Running)
    }

    /// Stop the VM behind `vm_cap`.
    pub fn pause_vm(&mut self, caller: ThreadId, vm_cap: CapId) -> KernelResult<()> {
        self.set_vm_state(caller, vm_cap, VmState::Paused)
    }

    fn set_vm_state(&mut self, caller: ThreadId, vm_cap: CapId, state: VmState) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let vm = self.resolve(inv.pd, vm_cap, ObjectKind::Vm, Rights::CONTROL)?;
        self.vm_entry(vm)?.state = state;
        Ok(())
    }

    pub(crate) fn handle_vm_exit(&mut self, vm: ObjectId) -> KernelResult<()> {
        let Some(entry) = self.objects.vm_mut(vm) else {
            log::warn!("exit of unknown VM {vm}");
            return Ok(());
        };
        if entry.state != VmState::Running {
            return Ok(());
        }
        entry.state = VmState::Paused;
        entry.exits += 1;
        let context = entry.context;
        self.notify(Some(context))?;
        Ok(())
    }

    pub(crate) fn teardown_vm(&mut self, vm: ObjectId) -> KernelResult<()> {
        self.vm_entry(vm)?.state = VmState::Paused;
        Ok(())
    }

    fn vm_entry(&mut self, id: ObjectId) -> KernelResult<&mut VirtualMachine> {
        self.objects
            .vm_mut(id)
            .ok_or_else(|| InvariantViolation::MissingObject(id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::EntryCause;

    #[test]
    fn test_exit_pauses_and_signals() {
        let mut kernel = Kernel::new(KernelConfig::uniprocessor()).unwrap();
        let core = kernel.core_thread();
        let receiver = kernel.new_signal_receiver(core).unwrap();
        let context = kernel.new_signal_context(core, receiver, 1).unwrap();
        let vm_cap = kernel.new_vm(core, CpuId::BOOT, context).unwrap();
        let vm = kernel.lookup(kernel.core_pd(), vm_cap).unwrap().object;

        kernel.enter(CpuId::BOOT, 0, EntryCause::VmExit(vm));
        assert_eq!(kernel.signal_pending(core, receiver), Ok(false));

        kernel.run_vm(core, vm_cap).unwrap();
        kernel.enter(CpuId::BOOT, 0, EntryCause::VmExit(vm));
        assert_eq!(kernel.signal_pending(core, receiver), Ok(true));
        let state = kernel.objects().vm(vm).unwrap();
        assert_eq!(state.state(), VmState::Paused);
        assert_eq!(state.exits(), 1);
    }

    #[test]
    fn test_vm_core_must_exist() {
        let mut kernel = Kernel::new(KernelConfig::uniprocessor()).unwrap();
        let core = kernel.core_thread();
        let receiver = kernel.new_signal_receiver(core).unwrap();
        let context = kernel.new_signal_context(core, receiver, 1).unwrap();
        assert_eq!(
            kernel.new_vm(core, CpuId(3), context),
            Err(KernelError::InvalidArgument)
        );
    }
}
