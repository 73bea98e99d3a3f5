//! Capability rights definitions

use bitflags::bitflags;

bitflags! {
    /// Rights carried by a directory entry
    ///
    /// Rights only ever shrink along a chain of `map` operations: the new
    /// entry receives the source rights intersected with the caller's mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rights: u32 {
        /// Send a request to a thread and await its reply
        const CALL = 1 << 0;
        /// Submit to a signal context
        const SIGNAL = 1 << 1;
        /// Wait on a signal receiver or poll it
        const WAIT = 1 << 2;
        /// Map the entry into another directory
        const GRANT = 1 << 3;
        /// Manage the object: start, pause, resume, route events, map pages
        const CONTROL = 1 << 4;
        /// Destroy the object (still subject to the ownership check)
        const DESTROY = 1 << 5;

        /// Everything a creator receives
        const ALL = Self::CALL.bits() | Self::SIGNAL.bits() | Self::WAIT.bits()
            | Self::GRANT.bits() | Self::CONTROL.bits() | Self::DESTROY.bits();

        /// What a client of a server thread typically holds
        const CLIENT = Self::CALL.bits();
    }
}

impl Rights {
    /// Check if this rights set is a subset of another
    #[inline]
    pub fn is_subset_of(self, other: Rights) -> bool {
        (self.bits() & !other.bits()) == 0
    }
}

impl core::fmt::Display for Rights {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        const NAMES: [(Rights, &str); 6] = [
            (Rights::CALL, "call"),
            (Rights::SIGNAL, "signal"),
            (Rights::WAIT, "wait"),
            (Rights::GRANT, "grant"),
            (Rights::CONTROL, "control"),
            (Rights::DESTROY, "destroy"),
        ];

        let mut first = true;
        for (right, name) in NAMES {
            if self.contains(right) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}
