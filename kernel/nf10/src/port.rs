//! The NIC's four physical Ethernet ports and the encodings the device uses for them.

use core::sync::atomic::{AtomicBool, Ordering};
use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::config::NUM_PORTS;

/// One of the physical ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Port {
    Port0 = 0,
    Port1 = 1,
    Port2 = 2,
    Port3 = 3,
}

bitflags! {
    /// A set of ports, in the short form carried by add-descriptor doorbell instructions.
    pub struct PortMask: u8 {
        const PORT0 = 1 << 0;
        const PORT1 = 1 << 1;
        const PORT2 = 1 << 2;
        const PORT3 = 1 << 3;
    }
}

impl Port {
    pub const ALL: [Port; NUM_PORTS] = [Port::Port0, Port::Port1, Port::Port2, Port::Port3];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn mask(self) -> PortMask {
        PortMask::from_bits_truncate(1 << self as u8)
    }

    /// The port field of a TX descriptor, in which each port owns two bits.
    pub fn tx_descriptor_bits(self) -> u16 {
        match self {
            Port::Port0 => 0x0102,
            Port::Port1 => 0x0408,
            Port::Port2 => 0x1020,
            Port::Port3 => 0x4080,
        }
    }

    /// Decodes the port field of an RX completion. The lowest-numbered port that matches wins.
    pub fn from_rx_bits(bits: u16) -> Option<Port> {
        if bits & 0x0200 != 0 {
            Some(Port::Port0)
        } else if bits & 0x0800 != 0 {
            Some(Port::Port1)
        } else if bits & 0x2000 != 0 {
            Some(Port::Port2)
        } else if bits & 0x8000 != 0 {
            Some(Port::Port3)
        } else {
            None
        }
    }

    /// The RX completion encoding of this port. Inverse of [`Port::from_rx_bits()`].
    pub fn rx_bits(self) -> u16 {
        0x0200 << (2 * self as u16)
    }
}

/// The administrative up/down state of each port. All ports start down.
#[derive(Debug, Default)]
pub struct PortStates {
    up: [AtomicBool; NUM_PORTS],
}

impl PortStates {
    pub fn set_up(&self, port: Port, up: bool) {
        self.up[port.index()].store(up, Ordering::Release);
    }

    pub fn is_up(&self, port: Port) -> bool {
        self.up[port.index()].load(Ordering::Acquire)
    }
}
