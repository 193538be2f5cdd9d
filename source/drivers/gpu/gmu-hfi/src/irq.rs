// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Firmware-to-host interrupt status bits.

bitflags::bitflags! {
    /// Status word delivered with the firmware-to-host interrupt.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct IrqStatus: u32 {
        /// Message queue has new entries.
        const MSGQ = 1 << 0;
        /// Side message queue has new entries; drained like the message queue.
        const SIDEMSGQ = 1 << 1;
        /// Debug queue has new entries.
        const DBGQ = 1 << 2;
        /// Firmware core faulted.
        const CM3_FAULT = 1 << 15;
        /// Out-of-band handshake bits, owned by power management.
        const OOB = 0xFFFF_0000;
    }
}

impl IrqStatus {
    /// Interrupt mask programmed for the firmware-to-host line.
    pub const HANDLED: Self = Self::SIDEMSGQ.union(Self::DBGQ).union(Self::CM3_FAULT);

    /// Keeps bits without a name so they can be reported.
    pub const fn from_raw(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    /// Whether either message queue needs draining.
    pub const fn has_messages(self) -> bool {
        self.intersects(Self::MSGQ.union(Self::SIDEMSGQ))
    }

    /// Bits nobody acts on. `MSGQ` is polled rather than masked in, but still drained.
    pub const fn unhandled(self) -> Self {
        self.difference(Self::HANDLED.union(Self::MSGQ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bits_survive() {
        let status = IrqStatus::from_raw(0x0001_8005);
        assert!(status.has_messages());
        assert!(status.contains(IrqStatus::DBGQ | IrqStatus::CM3_FAULT));
        assert_eq!(status.unhandled().bits(), 0x0001_0000);
    }

    #[test]
    fn side_queue_counts_as_messages() {
        assert!(IrqStatus::SIDEMSGQ.has_messages());
        assert!(!IrqStatus::DBGQ.has_messages());
        assert!(IrqStatus::from_raw(1 << 8).unhandled().bits() == 1 << 8);
    }
}
