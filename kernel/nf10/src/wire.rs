//! Encoding and decoding of everything the driver and the device exchange through shared memory:
//! doorbell instructions, TX and RX descriptors, and the three kinds of completion records.
//!
//! Every descriptor and instruction is two 64-bit words written into a 64-byte slot.

use core::ops::Range;
use bit_field::BitField;
use num_enum::TryFromPrimitive;
use nic_buffers::PhysicalAddress;

use crate::{config::RX_BUFFER_SIZE, port::{Port, PortMask}};

const OPCODE_BITS:      Range<u8> = 0..6;
const CLASS_BITS:       Range<u8> = 6..16;
const LENGTH_BITS:      Range<u8> = 16..32;
const PORT_BITS:        Range<u8> = 32..38;
const TAIL_BITS:        Range<u8> = 38..64;
const BUFFER_MASK_BITS: Range<u8> = 32..64;

/// The operation requested by a doorbell instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    AddClass = 1,
    SetRate = 2,
    SetTokenMax = 3,
    AddDescriptor = 4,
    StopClass = 5,
    DeleteClass = 6,
}

/// An instruction sent to the device through the doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Registers a new traffic class whose descriptor buffer of `buffer_mask + 1` bytes lives at `buffer_addr`.
    /// The device numbers classes in the order they are added.
    AddClass { buffer_mask: u64, buffer_addr: PhysicalAddress },
    SetRate { class: u32, rate: u64 },
    SetTokenMax { class: u32, token_max: u64 },
    /// Tells the device that the descriptors of `class` up to (not including) slot `tail` are ready.
    AddDescriptor { class: u32, packet_addr: PhysicalAddress, ports: PortMask, length: u16, tail: u64 },
    StopClass { class: u32 },
    /// Removes the most recently added class.
    DeleteClass,
}

/// Truncates `value` to the width of the field spanning `bits`.
fn field(value: u64, bits: Range<u8>) -> u64 {
    let width = bits.end - bits.start;
    if width < 64 { value & ((1 << width) - 1) } else { value }
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::AddClass { .. } => Opcode::AddClass,
            Instruction::SetRate { .. } => Opcode::SetRate,
            Instruction::SetTokenMax { .. } => Opcode::SetTokenMax,
            Instruction::AddDescriptor { .. } => Opcode::AddDescriptor,
            Instruction::StopClass { .. } => Opcode::StopClass,
            Instruction::DeleteClass => Opcode::DeleteClass,
        }
    }

    /// Encodes this instruction into the two words of a doorbell slot.
    ///
    /// Operands wider than their field are truncated, as the device would do.
    /// Traffic class creation keeps class indices, buffer masks and tail indices within range.
    pub fn encode(&self) -> [u64; 2] {
        let mut word0 = 0u64;
        word0.set_bits(OPCODE_BITS, self.opcode() as u64);
        let word1 = match *self {
            Instruction::AddClass { buffer_mask, buffer_addr } => {
                word0.set_bits(BUFFER_MASK_BITS, field(buffer_mask, BUFFER_MASK_BITS));
                buffer_addr.value()
            }
            Instruction::SetRate { class, rate } => {
                word0.set_bits(CLASS_BITS, field(class as u64, CLASS_BITS));
                rate
            }
            Instruction::SetTokenMax { class, token_max } => {
                word0.set_bits(CLASS_BITS, field(class as u64, CLASS_BITS));
                token_max
            }
            Instruction::AddDescriptor { class, packet_addr, ports, length, tail } => {
                word0.set_bits(CLASS_BITS, field(class as u64, CLASS_BITS));
                word0.set_bits(LENGTH_BITS, length as u64);
                word0.set_bits(PORT_BITS, ports.bits() as u64);
                word0.set_bits(TAIL_BITS, field(tail, TAIL_BITS));
                packet_addr.value()
            }
            Instruction::StopClass { class } => {
                word0.set_bits(CLASS_BITS, field(class as u64, CLASS_BITS));
                u64::MAX
            }
            Instruction::DeleteClass => u64::MAX,
        };
        [word0, word1]
    }

    /// Decodes the two words of a doorbell slot, as the device would.
    pub fn decode(words: [u64; 2]) -> Option<Instruction> {
        let [word0, word1] = words;
        let opcode = Opcode::try_from(word0.get_bits(OPCODE_BITS) as u8).ok()?;
        let class = word0.get_bits(CLASS_BITS) as u32;
        Some(match opcode {
            Opcode::AddClass => Instruction::AddClass {
                buffer_mask: word0.get_bits(BUFFER_MASK_BITS),
                buffer_addr: PhysicalAddress::new(word1),
            },
            Opcode::SetRate => Instruction::SetRate { class, rate: word1 },
            Opcode::SetTokenMax => Instruction::SetTokenMax { class, token_max: word1 },
            Opcode::AddDescriptor => Instruction::AddDescriptor {
                class,
                packet_addr: PhysicalAddress::new(word1),
                ports: PortMask::from_bits_truncate(word0.get_bits(PORT_BITS) as u8),
                length: word0.get_bits(LENGTH_BITS) as u16,
                tail: word0.get_bits(TAIL_BITS),
            },
            Opcode::StopClass => Instruction::StopClass { class },
            Opcode::DeleteClass => Instruction::DeleteClass,
        })
    }
}


/// A transmit descriptor, written into a traffic class's descriptor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDescriptor {
    pub length: u16,
    pub port: Port,
    pub packet_addr: PhysicalAddress,
}

impl TxDescriptor {
    pub fn encode(&self) -> [u64; 2] {
        let word0 = ((self.length as u64) << 48)
            | ((self.port.tx_descriptor_bits() as u64) << 32)
            | 0xffff_ffff;
        [word0, self.packet_addr.value()]
    }
}

/// A receive descriptor, written into the device's RX descriptor ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxDescriptor {
    /// Where in the device's RX packet region the frame is staged before being copied to the host.
    pub packet_offset: u64,
    pub buffer_addr: PhysicalAddress,
}

impl RxDescriptor {
    pub fn encode(&self) -> [u64; 2] {
        let word0 = ((RX_BUFFER_SIZE as u64) << 48) | (self.packet_offset & 0xffff_ffff);
        [word0, self.buffer_addr.value()]
    }
}


/// The device's acknowledgement that it consumed one doorbell instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellCompletion {
    /// The raw opcode of the acknowledged instruction.
    pub opcode: u8,
    pub succeeded: bool,
}

impl DoorbellCompletion {
    /// Returns `None` if the record has not been written by the device.
    pub fn decode(status: u64) -> Option<DoorbellCompletion> {
        if status.get_bits(0..8) != 1 {
            return None;
        }
        Some(DoorbellCompletion {
            opcode: status.get_bits(16..22) as u8,
            succeeded: status.get_bit(8),
        })
    }

    pub fn encode(&self) -> u64 {
        1 | ((self.succeeded as u64) << 8) | ((self.opcode as u64 & 0x3f) << 16)
    }
}

/// The device's report that a traffic class finished transmitting every descriptor before slot `head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    pub class: u32,
    pub head: u64,
}

impl TxCompletion {
    /// Returns `None` if the record has not been written by the device.
    pub fn decode(status: u64) -> Option<TxCompletion> {
        if status.get_bits(0..16) != 1 {
            return None;
        }
        Some(TxCompletion {
            class: status.get_bits(16..32) as u32,
            head: status.get_bits(32..64),
        })
    }

    pub fn encode(&self) -> u64 {
        1 | ((self.class as u64 & 0xffff) << 16) | (self.head << 32)
    }
}

/// The device's report that a frame was written into the receive buffer of the oldest RX descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxCompletion {
    pub length: u16,
    /// The port field, see [`Port::from_rx_bits()`].
    pub port_bits: u16,
}

impl RxCompletion {
    /// Returns `None` if the record has not been written by the device.
    pub fn decode(rx_status: u64) -> Option<RxCompletion> {
        if rx_status.get_bits(48..64) == 0xffff {
            return None;
        }
        Some(RxCompletion {
            length: rx_status.get_bits(0..16) as u16,
            port_bits: rx_status.get_bits(16..32) as u16,
        })
    }

    pub fn encode(&self) -> u64 {
        (self.length as u64) | ((self.port_bits as u64) << 16)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::registers::COMPLETION_SENTINEL;

    fn instruction() -> impl Strategy<Value = Instruction> {
        let class = 0u32..1024;
        prop_oneof![
            (0u64..(1 << 32), any::<u64>()).prop_map(|(buffer_mask, addr)| {
                Instruction::AddClass { buffer_mask, buffer_addr: PhysicalAddress::new(addr) }
            }),
            (class.clone(), any::<u64>()).prop_map(|(class, rate)| Instruction::SetRate { class, rate }),
            (class.clone(), any::<u64>()).prop_map(|(class, token_max)| Instruction::SetTokenMax { class, token_max }),
            (class.clone(), any::<u64>(), 0u8..16, any::<u16>(), 0u64..(1 << 26)).prop_map(
                |(class, addr, ports, length, tail)| Instruction::AddDescriptor {
                    class,
                    packet_addr: PhysicalAddress::new(addr),
                    ports: PortMask::from_bits_truncate(ports),
                    length,
                    tail,
                }
            ),
            class.prop_map(|class| Instruction::StopClass { class }),
            Just(Instruction::DeleteClass),
        ]
    }

    proptest! {
        #[test]
        fn decode_recovers_every_operand(instr in instruction()) {
            prop_assert_eq!(Instruction::decode(instr.encode()), Some(instr));
        }
    }

    #[test]
    fn add_descriptor_layout() {
        let words = Instruction::AddDescriptor {
            class: 3,
            packet_addr: PhysicalAddress::new(0xabcd_0000),
            ports: PortMask::PORT3,
            length: 1514,
            tail: 7,
        }.encode();
        assert_eq!(words[0], (7 << 38) + (8 << 32) + (1514 << 16) + (3 << 6) + 4);
        assert_eq!(words[1], 0xabcd_0000);
    }

    #[test]
    fn control_instruction_layouts() {
        let add = Instruction::AddClass { buffer_mask: 0xff, buffer_addr: PhysicalAddress::new(0x4000) };
        assert_eq!(add.encode(), [(0xff << 32) + 1, 0x4000]);
        assert_eq!(Instruction::SetRate { class: 2, rate: 9 }.encode(), [(2 << 6) + 2, 9]);
        assert_eq!(Instruction::SetTokenMax { class: 2, token_max: 5 }.encode(), [(2 << 6) + 3, 5]);
        assert_eq!(Instruction::StopClass { class: 1 }.encode(), [(1 << 6) + 5, u64::MAX]);
        assert_eq!(Instruction::DeleteClass.encode(), [6, u64::MAX]);
    }

    #[test]
    fn wide_operands_are_truncated() {
        assert_eq!(Instruction::StopClass { class: 1025 }.encode()[0], (1 << 6) + 5);
        let dsc = Instruction::AddDescriptor {
            class: 0, packet_addr: PhysicalAddress::zero(), ports: PortMask::PORT0, length: 60, tail: (1 << 26) + 2,
        };
        assert_eq!(dsc.encode()[0] >> 38, 2);
    }

    #[test]
    fn field_widths() {
        assert_eq!(field(u64::MAX, OPCODE_BITS), 0x3f);
        assert_eq!(field(u64::MAX, CLASS_BITS), 0x3ff);
        assert_eq!(field(u64::MAX, TAIL_BITS), (1 << 26) - 1);
        assert_eq!(field(u64::MAX, BUFFER_MASK_BITS), 0xffff_ffff);
        assert_eq!(field(u64::MAX, 0..64), u64::MAX);

        let add = Instruction::AddClass { buffer_mask: u64::MAX, buffer_addr: PhysicalAddress::zero() };
        assert_eq!(add.encode()[0], (0xffff_ffff << 32) + 1);
    }

    #[test]
    fn decode_rejects_unknown_opcodes() {
        assert_eq!(Instruction::decode([0, 0]), None);
        assert_eq!(Instruction::decode([7, 0]), None);
        assert_eq!(Instruction::decode([0x3f, 0]), None);
    }

    #[test]
    fn tx_descriptor_layout() {
        let dsc = TxDescriptor { length: 60, port: Port::Port1, packet_addr: PhysicalAddress::new(0x1000) };
        assert_eq!(dsc.encode(), [(60 << 48) + (0x0408 << 32) + 0xffff_ffff, 0x1000]);
    }

    #[test]
    fn rx_descriptor_layout() {
        let dsc = RxDescriptor { packet_offset: 0x1_0000_0603, buffer_addr: PhysicalAddress::new(0x2003) };
        assert_eq!(dsc.encode(), [(1533 << 48) + 0x603, 0x2003]);
    }

    #[test]
    fn sentinels_decode_as_empty() {
        assert_eq!(DoorbellCompletion::decode(COMPLETION_SENTINEL), None);
        assert_eq!(TxCompletion::decode(COMPLETION_SENTINEL), None);
        assert_eq!(RxCompletion::decode(COMPLETION_SENTINEL), None);
    }

    #[test]
    fn completion_fields() {
        let ack = DoorbellCompletion::decode(0x0006_0101).unwrap();
        assert_eq!(ack, DoorbellCompletion { opcode: Opcode::DeleteClass as u8, succeeded: true });
        assert_eq!(ack.encode(), 0x0006_0101);

        let tx = TxCompletion::decode((5 << 32) | (2 << 16) | 1).unwrap();
        assert_eq!(tx, TxCompletion { class: 2, head: 5 });
        assert_eq!(TxCompletion::decode((5 << 32) | (2 << 16) | 2), None);

        let rx = RxCompletion::decode((0x0800 << 16) | 128).unwrap();
        assert_eq!(rx, RxCompletion { length: 128, port_bits: 0x0800 });
        assert_eq!(Port::from_rx_bits(rx.port_bits), Some(Port::Port1));
    }

    #[test]
    fn port_encodings() {
        for port in Port::ALL {
            assert_eq!(Port::from_rx_bits(port.rx_bits()), Some(port));
        }
        assert_eq!(Port::from_rx_bits(0x0100), None);
        assert_eq!(Port::from_rx_bits(0xa000), Some(Port::Port2));
        assert_eq!(Port::Port2.mask(), PortMask::PORT2);
    }
}
