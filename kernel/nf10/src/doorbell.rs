//! The doorbell: the single instruction channel from the driver to the device.
//!
//! Every control operation (adding, configuring and removing traffic classes) and every
//! transmitted packet goes through [`DoorbellMailbox::send()`], which writes one instruction
//! into the next 64-byte slot of the doorbell ring on the device.
//! The device reports how far it has read through a register, see [`ConsumptionSource`],
//! and later acknowledges each instruction in the doorbell completion ring.

use alloc::{boxed::Box, sync::Arc};
use core::{cmp::min, hint::spin_loop, sync::atomic::{AtomicU64, Ordering}};
use spin::Mutex;
use owning_ref::BoxRefMut;
use nic_buffers::MappedRegion;
use nic_queues::{DescriptorRing, SLOT_SIZE};

use crate::{
    config::{DoorbellBackoff, Nf10Config},
    registers::DescriptorSlot,
    wire::Instruction,
};

/// Reports the byte offset in the doorbell ring up to which the device has read instructions.
pub trait ConsumptionSource: Send + Sync {
    fn doorbell_consumed(&self) -> u64;
}

/// The ways in which sending an instruction through the doorbell can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellError {
    /// The device did not make room in the doorbell ring before the backoff policy ran out
    Backpressure,
}

impl From<DoorbellError> for &'static str {
    fn from(error: DoorbellError) -> Self {
        match error {
            DoorbellError::Backpressure => "Timed out waiting for room in the doorbell ring",
        }
    }
}

/// The doorbell ring and the state needed to write into it safely.
pub struct DoorbellMailbox {
    /// The doorbell ring on the device. Holding this lock is what serializes all senders.
    window: Mutex<BoxRefMut<MappedRegion, [DescriptorSlot]>>,
    /// `outstanding` counts instructions that the device has not acknowledged yet.
    ring: DescriptorRing,
    consumption: Arc<dyn ConsumptionSource>,
    low_watermark: u64,
    backoff: DoorbellBackoff,
    backpressure_events: AtomicU64,
}

impl DoorbellMailbox {
    /// Creates a mailbox over the device's doorbell ring, which must be `config.doorbell_mask + 1` bytes.
    pub fn new(
        region: MappedRegion,
        config: &Nf10Config,
        consumption: Arc<dyn ConsumptionSource>,
    ) -> Result<DoorbellMailbox, &'static str> {
        let ring = DescriptorRing::new(config.doorbell_mask)?;
        let slot_count = ring.cluster_size() as usize;
        let window = BoxRefMut::new(Box::new(region))
            .try_map_mut(|mr| mr.as_slice_mut::<DescriptorSlot>(0, slot_count))?;
        Ok(DoorbellMailbox {
            window: Mutex::new(window),
            ring,
            consumption,
            low_watermark: config.doorbell_low_watermark,
            backoff: config.doorbell_backoff,
            backpressure_events: AtomicU64::new(0),
        })
    }

    /// Free slots between our write pointer and the device's reported read position.
    fn free_slots(&self) -> u64 {
        let consumed = self.consumption.doorbell_consumed() & self.ring.mask();
        let in_use = self.ring.write_ptr().wrapping_sub(consumed) & self.ring.mask();
        (self.ring.capacity() - in_use) / SLOT_SIZE
    }

    /// Writes `instruction` into the next doorbell slot.
    ///
    /// Waits, with exponential backoff, until at least `doorbell_low_watermark` slots are free
    /// and fewer than a ring's worth of instructions are unacknowledged.
    pub fn send(&self, instruction: Instruction) -> Result<(), DoorbellError> {
        let words = instruction.encode();
        let mut window = self.window.lock();
        let mut spins = self.backoff.initial_spins;

        for _attempt in 0..self.backoff.max_attempts {
            if self.free_slots() >= self.low_watermark {
                if let Some(offset) = self.ring.reserve(1) {
                    window[DescriptorRing::slot_index(offset)].write(words);
                    trace!("nf10: doorbell slot {:#x} <- {:?}", offset, instruction);
                    return Ok(());
                }
            }
            for _ in 0..spins {
                spin_loop();
            }
            spins = min(spins.saturating_mul(2), self.backoff.max_spins);
        }

        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
        warn!("nf10: doorbell backpressure, dropping {:?} ({} unacknowledged, {} slots free)",
            instruction, self.ring.outstanding(), self.free_slots()
        );
        Err(DoorbellError::Backpressure)
    }

    /// Records that the device acknowledged one instruction.
    pub fn acknowledge(&self) {
        if self.ring.release(1).is_err() {
            error!("nf10: doorbell acknowledgement without an unacknowledged instruction");
        }
    }

    /// The number of instructions sent but not yet acknowledged.
    pub fn outstanding(&self) -> u64 {
        self.ring.outstanding()
    }

    /// The byte offset at which the next instruction will be written.
    pub fn write_ptr(&self) -> u64 {
        self.ring.write_ptr()
    }

    /// How many times [`DoorbellMailbox::send()`] gave up with `Backpressure`.
    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }
}
