//! User-level interrupts
//!
//! An interrupt object binds one line to a signal context. When the line
//! fires, the kernel submits one signal and masks the line; it stays masked
//! until the handler acknowledges the interrupt.

use crate::cap::{CapId, KernelObject, ObjectId, ObjectKind, Rights};
use crate::error::{InvariantViolation, KernelResult, ProtocolViolation};
use crate::kernel::Kernel;
use crate::sched::ThreadId;

/// Interrupt line bound to a signal context
#[derive(Debug)]
pub struct UserIrq {
    line: u32,
    context: ObjectId,
    masked: bool,
    occurrences: u64,
}

impl UserIrq {
    /// Interrupt line
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Whether the line waits for an acknowledgement
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Interrupts signalled so far
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }
}

impl Kernel {
    /// Bind `line` to the signal context behind `context_cap`.
    pub fn new_irq(&mut self, caller: ThreadId, line: u32, context_cap: CapId) -> KernelResult<CapId> {
        let inv = self.invoker(caller)?;
        let context = self.resolve(inv.pd, context_cap, ObjectKind::SignalContext, Rights::SIGNAL)?;
        if self.irq_lines.contains_key(&line) {
            return Err(ProtocolViolation::LineInUse.into());
        }

        let irq = UserIrq {
            line,
            context,
            masked: false,
            occurrences: 0,
        };
        let (id, cap) = self.install(inv.pd, KernelObject::Irq(irq))?;
        self.irq_lines.insert(line, id);
        log::debug!("IRQ {line} bound to {context}");
        Ok(cap)
    }

    /// Unmask the line of the interrupt behind `irq_cap`.
    pub fn ack_irq(&mut self, caller: ThreadId, irq_cap: CapId) -> KernelResult<()> {
        let inv = self.invoker(caller)?;
        let irq = self.resolve(inv.pd, irq_cap, ObjectKind::Irq, Rights::CONTROL)?;
        self.irq_entry(irq)?.masked = false;
        Ok(())
    }

    pub(crate) fn handle_interrupt(&mut self, line: u32) -> KernelResult<()> {
        let Some(&irq) = self.irq_lines.get(&line) else {
            log::warn!("spurious interrupt on line {line}");
            return Ok(());
        };

        let entry = self.irq_entry(irq)?;
        if entry.masked {
            log::trace!("IRQ {line} masked, dropped");
            return Ok(());
        }
        entry.masked = true;
        entry.occurrences += 1;
        let context = entry.context;

        if !self.notify(Some(context))? {
            log::warn!("IRQ {line}: signal context gone");
        }
        Ok(())
    }

    pub(crate) fn teardown_irq(&mut self, irq: ObjectId) -> KernelResult<()> {
        let line = self.irq_entry(irq)?.line;
        self.irq_lines.remove(&line);
        log::debug!("IRQ {line} released");
        Ok(())
    }

    fn irq_entry(&mut self, id: ObjectId) -> KernelResult<&mut UserIrq> {
        self.objects
            .irq_mut(id)
            .ok_or_else(|| InvariantViolation::MissingObject(id).into())
    }
}
