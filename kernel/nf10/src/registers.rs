//! The layout of the NetFPGA-10G's configuration registers and of the 64-byte slots
//! that make up every ring shared with the device.
//!
//! Device-visible writes are always bracketed by [`barrier()`] so that the device never
//! observes a half-written slot, and never observes a register update before the memory it refers to.

use alloc::boxed::Box;
use core::sync::atomic::{fence, Ordering};
use spin::Mutex;
use volatile::{ReadOnly, Volatile};
use zerocopy::FromBytes;
use owning_ref::BoxRefMut;
use nic_buffers::{MappedRegion, PhysicalAddress};

use crate::doorbell::ConsumptionSource;

/// A full memory barrier, ordering all prior memory accesses before all later ones.
#[inline]
pub fn barrier() {
    fence(Ordering::SeqCst);
}

/// The configuration registers in BAR0.
#[derive(FromBytes)]
#[repr(C)]
pub struct Nf10Registers {
    _reserved0:                         [u64; 16],          // 0x00 - 0x7F
    /// Physical address of the host TX completion ring
    pub tx_completion_ring_addr:        Volatile<u64>,      // 0x80
    pub tx_completion_ring_mask:        Volatile<u64>,      // 0x88
    /// Physical address of the host RX completion ring
    pub rx_completion_ring_addr:        Volatile<u64>,      // 0x90
    pub rx_completion_ring_mask:        Volatile<u64>,      // 0x98
    _reserved1:                         [u64; 5],           // 0xA0 - 0xC7
    pub tx_interrupt_enable:            Volatile<u64>,      // 0xC8
    pub rx_interrupt_enable:            Volatile<u64>,      // 0xD0
    _reserved2:                         [u64; 3],           // 0xD8 - 0xEF
    /// Writing 1 resets the data path
    pub reset:                          Volatile<u64>,      // 0xF0
    _reserved3:                         [u64; 6],           // 0xF8 - 0x127
    /// Physical address of the host doorbell completion ring
    pub doorbell_completion_ring_addr:  Volatile<u64>,      // 0x128
    pub doorbell_completion_ring_mask:  Volatile<u64>,      // 0x130
    pub doorbell_interrupt_enable:      Volatile<u64>,      // 0x138
    /// Host read pointer of the TX completion ring
    pub tx_completion_read_ptr:         Volatile<u64>,      // 0x140
    /// Host read pointer of the doorbell completion ring
    pub doorbell_completion_read_ptr:   Volatile<u64>,      // 0x148
    /// Byte offset up to which the device has consumed the doorbell ring
    pub doorbell_consumed:              ReadOnly<u64>,      // 0x150
    _reserved4:                         [u64; 21],          // 0x158 - 0x1FF
}

const_assert_eq!(core::mem::size_of::<Nf10Registers>(), 512);


/// One 64-byte slot of a descriptor or doorbell ring. Only the first two words are meaningful.
#[derive(FromBytes)]
#[repr(C)]
pub struct DescriptorSlot {
    word0:      Volatile<u64>,
    word1:      Volatile<u64>,
    _reserved:  [u64; 6],
}

const_assert_eq!(core::mem::size_of::<DescriptorSlot>(), 64);

impl DescriptorSlot {
    /// Writes both words of this slot, with a full barrier before and after.
    pub fn write(&mut self, words: [u64; 2]) {
        barrier();
        self.word0.write(words[0]);
        self.word1.write(words[1]);
        barrier();
    }
}


/// The value of a completion word that the device has not written yet.
pub const COMPLETION_SENTINEL: u64 = u64::MAX;

/// One 64-byte slot of a host completion ring.
///
/// TX and doorbell completions are reported in the first word, RX completions in the last one.
#[derive(FromBytes)]
#[repr(C)]
pub struct CompletionRecord {
    status:     Volatile<u64>,
    _reserved:  [u64; 6],
    rx_status:  Volatile<u64>,
}

const_assert_eq!(core::mem::size_of::<CompletionRecord>(), 64);

impl CompletionRecord {
    pub fn status(&self) -> u64 {
        self.status.read()
    }

    pub fn rx_status(&self) -> u64 {
        self.rx_status.read()
    }

    /// Resets this slot to the "no event yet" sentinel. Invalidating twice changes nothing.
    pub fn invalidate(&mut self) {
        self.status.write(COMPLETION_SENTINEL);
        self.rx_status.write(COMPLETION_SENTINEL);
    }

    pub fn is_invalidated(&self) -> bool {
        self.status() == COMPLETION_SENTINEL && self.rx_status() == COMPLETION_SENTINEL
    }
}


/// The location and size of one host completion ring, as programmed into the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLocation {
    pub phys_addr: PhysicalAddress,
    pub mask: u64,
}

/// Exclusive access to the configuration registers.
pub struct RegisterWindow {
    regs: Mutex<BoxRefMut<MappedRegion, Nf10Registers>>,
}

impl RegisterWindow {
    pub fn new(region: MappedRegion) -> Result<RegisterWindow, &'static str> {
        let regs = BoxRefMut::new(Box::new(region))
            .try_map_mut(|mr| mr.as_type_mut::<Nf10Registers>(0))?;
        Ok(RegisterWindow { regs: Mutex::new(regs) })
    }

    pub fn reset(&self) {
        let mut regs = self.regs.lock();
        barrier();
        regs.reset.write(1);
        barrier();
    }

    /// Tells the device where the three host completion rings live.
    pub fn program_completion_rings(&self, doorbell: RingLocation, tx: RingLocation, rx: RingLocation) {
        let mut regs = self.regs.lock();
        barrier();
        regs.tx_completion_ring_addr.write(tx.phys_addr.value());
        regs.tx_completion_ring_mask.write(tx.mask);
        regs.rx_completion_ring_addr.write(rx.phys_addr.value());
        regs.rx_completion_ring_mask.write(rx.mask);
        regs.doorbell_completion_ring_addr.write(doorbell.phys_addr.value());
        regs.doorbell_completion_ring_mask.write(doorbell.mask);
        barrier();
    }

    /// Enables or disables all three completion interrupts (TX, RX and doorbell).
    pub fn set_interrupts_enabled(&self, enabled: bool) {
        let value = enabled as u64;
        let mut regs = self.regs.lock();
        barrier();
        regs.tx_interrupt_enable.write(value);
        regs.rx_interrupt_enable.write(value);
        regs.doorbell_interrupt_enable.write(value);
        barrier();
    }

    pub fn publish_tx_completion_read_ptr(&self, offset: u64) {
        let mut regs = self.regs.lock();
        barrier();
        regs.tx_completion_read_ptr.write(offset);
        barrier();
    }

    pub fn publish_doorbell_completion_read_ptr(&self, offset: u64) {
        let mut regs = self.regs.lock();
        barrier();
        regs.doorbell_completion_read_ptr.write(offset);
        barrier();
    }
}

impl ConsumptionSource for RegisterWindow {
    fn doorbell_consumed(&self) -> u64 {
        let regs = self.regs.lock();
        barrier();
        let consumed = regs.doorbell_consumed.read();
        barrier();
        consumed
    }
}
