//! The completion engine: draining the three host completion rings after an interrupt.
//!
//! The device reports doorbell acknowledgements, transmitted descriptors and received frames
//! by writing 64-byte records into three rings in host memory. A drain masks the device's
//! interrupts, polls all three rings until they stay empty for a while, then unmasks them again.
//!
//! ```text
//!  Idle/Armed ──(any ring has a record)──> Draining ──(budget reaches 0, rings empty)──> Armed
//!                                            ^   |
//!                                            └───┘ (a record shows up right after unmasking)
//! ```
//!
//! Each drain iteration polls every ring at most once. The budget starts at 1, grows by one
//! for every busy iteration up to the spin ceiling, and shrinks by one for every idle iteration.

use alloc::boxed::Box;
use core::{cmp::min, sync::atomic::{AtomicBool, AtomicU8, Ordering}};
use num_enum::TryFromPrimitive;
use spin::Mutex;
use owning_ref::BoxRefMut;
use nic_buffers::{ChecksumStatus, DmaPlatform, MappedRegion};
use nic_queues::DescriptorRing;
use network_interface_card::PacketSink;

use crate::{
    config::{Nf10Config, MAX_FRAME_SIZE, MIN_FRAME_SIZE},
    doorbell::DoorbellMailbox,
    port::{Port, PortStates},
    registers::{barrier, CompletionRecord, RegisterWindow, RingLocation, COMPLETION_SENTINEL},
    rx::RxReplenisher,
    stats::Nf10Stats,
    traffic_class::TrafficClasses,
    wire::{DoorbellCompletion, Opcode, RxCompletion, TxCompletion},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum DrainState {
    /// No drain has run yet
    Idle = 0,
    /// Interrupts are masked and the rings are being polled
    Draining = 1,
    /// The rings were found empty and interrupts are enabled
    Armed = 2,
}

/// What one call to [`CompletionEngine::drain()`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub doorbell_acks: u64,
    pub tx_completions: u64,
    pub rx_completions: u64,
    /// Frames handed to the packet sink
    pub rx_delivered: u64,
    /// Frames discarded because their port was down or the completion was malformed
    pub rx_dropped: u64,
    /// Fresh receive buffers posted in place of filled ones
    pub rx_replenished: u64,
    /// Records that could not be decoded or referred to unknown state
    pub malformed: u64,
    pub iterations: u64,
}

/// Everything a drain needs to act on completions.
pub struct DrainContext<'a> {
    pub registers: &'a RegisterWindow,
    pub doorbell: &'a DoorbellMailbox,
    pub classes: &'a TrafficClasses,
    pub rx: &'a RxReplenisher,
    pub platform: &'a dyn DmaPlatform,
    pub sink: &'a dyn PacketSink,
    pub stats: &'a Nf10Stats,
    pub ports: &'a PortStates,
}

/// One host ring the device writes completion records into.
struct CompletionRing {
    records: BoxRefMut<MappedRegion, [CompletionRecord]>,
    ring: DescriptorRing,
}

impl CompletionRing {
    /// Allocates a ring of `mask + 1` bytes and marks every slot as empty.
    fn allocate(platform: &dyn DmaPlatform, mask: u64) -> Result<CompletionRing, &'static str> {
        let ring = DescriptorRing::new(mask)?;
        let slot_count = ring.cluster_size() as usize;
        let memory = platform.allocate_dma_buffer(ring.capacity() as usize)?;
        if let Err(e) = memory.as_slice::<CompletionRecord>(0, slot_count) {
            platform.free_dma_buffer(memory);
            return Err(e);
        }
        let mut records = BoxRefMut::new(Box::new(memory))
            .try_map_mut(|mr| mr.as_slice_mut::<CompletionRecord>(0, slot_count))?;
        for record in records.iter_mut() {
            record.invalidate();
        }
        barrier();
        Ok(CompletionRing { records, ring })
    }

    fn location(&self) -> RingLocation {
        RingLocation { phys_addr: self.records.as_owner().phys_addr(), mask: self.ring.mask() }
    }

    /// The record at the read pointer.
    fn peek(&self) -> &CompletionRecord {
        &self.records[DescriptorRing::slot_index(self.ring.read_ptr())]
    }

    /// Passes over the record at the read pointer and marks it empty again.
    /// Returns the slot index that was consumed; the new read pointer is `self.ring.read_ptr()`.
    fn consume(&mut self) -> usize {
        let slot = DescriptorRing::slot_index(self.ring.consume());
        self.records[slot].invalidate();
        barrier();
        slot
    }

    fn free(self, platform: &dyn DmaPlatform) {
        platform.free_dma_buffer(*self.records.into_owner());
    }
}

struct CompletionRings {
    doorbell: CompletionRing,
    tx: CompletionRing,
    rx: CompletionRing,
}

impl CompletionRings {
    fn has_pending(&self) -> bool {
        self.doorbell.peek().status() != COMPLETION_SENTINEL
            || self.tx.peek().status() != COMPLETION_SENTINEL
            || RxCompletion::decode(self.rx.peek().rx_status()).is_some()
    }
}

pub struct CompletionEngine {
    /// `None` once the rings have been freed.
    rings: Mutex<Option<CompletionRings>>,
    /// Set by every caller of `drain()`; cleared by the one that runs it.
    pending: AtomicBool,
    state: AtomicU8,
    spin_ceiling: u32,
}

impl CompletionEngine {
    /// Allocates the doorbell, TX and RX completion rings.
    pub fn new(platform: &dyn DmaPlatform, config: &Nf10Config) -> Result<CompletionEngine, &'static str> {
        let doorbell = CompletionRing::allocate(platform, config.doorbell_completion_mask)?;
        let tx = match CompletionRing::allocate(platform, config.tx_completion_mask) {
            Ok(tx) => tx,
            Err(e) => {
                doorbell.free(platform);
                return Err(e);
            }
        };
        let rx = match CompletionRing::allocate(platform, config.rx_completion_mask) {
            Ok(rx) => rx,
            Err(e) => {
                doorbell.free(platform);
                tx.free(platform);
                return Err(e);
            }
        };
        Ok(CompletionEngine {
            rings: Mutex::new(Some(CompletionRings { doorbell, tx, rx })),
            pending: AtomicBool::new(false),
            state: AtomicU8::new(DrainState::Idle as u8),
            spin_ceiling: config.drain_spin_ceiling,
        })
    }

    /// The locations of the doorbell, TX and RX completion rings, in that order.
    pub fn locations(&self) -> Option<(RingLocation, RingLocation, RingLocation)> {
        self.rings.lock().as_ref().map(|rings| (rings.doorbell.location(), rings.tx.location(), rings.rx.location()))
    }

    pub fn state(&self) -> DrainState {
        DrainState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(DrainState::Idle)
    }

    fn set_state(&self, state: DrainState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Processes every pending completion.
    ///
    /// Only one drain runs at a time. A call that finds another drain in progress returns `None`
    /// right away, and the running drain goes around once more on its behalf.
    pub fn drain(&self, ctx: &DrainContext) -> Option<DrainReport> {
        self.pending.store(true, Ordering::Release);
        let mut report = None;
        loop {
            let mut guard = match self.rings.try_lock() {
                Some(guard) => guard,
                None => return report,
            };
            self.pending.store(false, Ordering::Release);
            let rings = match guard.as_mut() {
                Some(rings) => rings,
                None => return report,
            };
            let this_run = report.get_or_insert_with(DrainReport::default);
            self.run(rings, ctx, this_run);
            drop(guard);

            if !self.pending.load(Ordering::Acquire) {
                return report;
            }
        }
    }

    fn run(&self, rings: &mut CompletionRings, ctx: &DrainContext, report: &mut DrainReport) {
        if !rings.has_pending() {
            self.set_state(DrainState::Armed);
            return;
        }
        ctx.registers.set_interrupts_enabled(false);
        self.set_state(DrainState::Draining);

        let mut budget: u32 = 1;
        let mut rx_deficit = false;
        loop {
            report.iterations += 1;
            let acked = Self::poll_doorbell(&mut rings.doorbell, ctx, report);
            let transmitted = Self::poll_tx(&mut rings.tx, ctx, report);
            let received = Self::poll_rx(&mut rings.rx, ctx, report, &mut rx_deficit);

            if acked || transmitted || received {
                budget = min(budget + 1, self.spin_ceiling);
            } else {
                budget -= 1;
            }
            if budget == 0 {
                ctx.registers.set_interrupts_enabled(true);
                if !rings.has_pending() {
                    break;
                }
                // A record landed between the last poll and unmasking.
                ctx.registers.set_interrupts_enabled(false);
                budget = 1;
            }
        }

        if rx_deficit {
            while ctx.rx.post_one(ctx.platform).is_ok() {
                report.rx_replenished += 1;
            }
        }
        self.set_state(DrainState::Armed);
    }

    fn poll_doorbell(ring: &mut CompletionRing, ctx: &DrainContext, report: &mut DrainReport) -> bool {
        let status = ring.peek().status();
        if status == COMPLETION_SENTINEL {
            return false;
        }
        ring.consume();
        ctx.registers.publish_doorbell_completion_read_ptr(ring.ring.read_ptr());

        // Every doorbell completion answers one instruction, even one we cannot decode.
        ctx.doorbell.acknowledge();
        let ack = match DoorbellCompletion::decode(status) {
            Some(ack) => ack,
            None => {
                warn!("nf10: dropping malformed doorbell completion {:#x}", status);
                report.malformed += 1;
                return true;
            }
        };
        report.doorbell_acks += 1;
        match Opcode::try_from(ack.opcode) {
            Ok(Opcode::DeleteClass) => ctx.classes.complete_deletion(ack.succeeded, ctx.platform),
            Ok(opcode) if !ack.succeeded => warn!("nf10: device rejected a {:?} instruction", opcode),
            Ok(_) => {}
            Err(_) => warn!("nf10: doorbell completion for unknown opcode {}", ack.opcode),
        }
        true
    }

    fn poll_tx(ring: &mut CompletionRing, ctx: &DrainContext, report: &mut DrainReport) -> bool {
        let status = ring.peek().status();
        if status == COMPLETION_SENTINEL {
            return false;
        }
        ring.consume();
        ctx.registers.publish_tx_completion_read_ptr(ring.ring.read_ptr());

        let completion = match TxCompletion::decode(status) {
            Some(completion) => completion,
            None => {
                warn!("nf10: dropping malformed TX completion {:#x}", status);
                report.malformed += 1;
                return true;
            }
        };
        report.tx_completions += 1;
        match ctx.classes.get(completion.class) {
            Some(class) => {
                if let Err(e) = class.reclaim_up_to(completion.head, ctx.platform, ctx.stats) {
                    error!("{} (class {}, head {})", e, completion.class, completion.head);
                    report.malformed += 1;
                }
            }
            None => {
                error!("nf10: TX completion for nonexistent class {}", completion.class);
                report.malformed += 1;
            }
        }
        true
    }

    fn poll_rx(ring: &mut CompletionRing, ctx: &DrainContext, report: &mut DrainReport, deficit: &mut bool) -> bool {
        let completion = match RxCompletion::decode(ring.peek().rx_status()) {
            Some(completion) => completion,
            None => return false,
        };
        // The device does not track the host's read pointer for this ring.
        let slot = ring.consume();
        report.rx_completions += 1;

        let buffer = ctx.rx.take_completed(slot, ctx.platform);
        match ctx.rx.post_one(ctx.platform) {
            Ok(()) => report.rx_replenished += 1,
            Err(_) => *deficit = true,
        }
        let mut buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                error!("nf10: RX completion in slot {} with no posted buffer", slot);
                report.malformed += 1;
                return true;
            }
        };

        let length = completion.length as usize;
        let port = match Port::from_rx_bits(completion.port_bits) {
            Some(port) if (MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&length) => port,
            _ => {
                warn!("nf10: dropping malformed RX completion (length {}, ports {:#x})", length, completion.port_bits);
                ctx.stats.count_rx_error();
                report.rx_dropped += 1;
                return true;
            }
        };
        if !ctx.ports.is_up(port) {
            ctx.stats.count_rx_dropped(port);
            report.rx_dropped += 1;
            return true;
        }
        if buffer.set_length(completion.length).is_err() {
            ctx.stats.count_rx_error();
            report.rx_dropped += 1;
            return true;
        }
        buffer.set_checksum(ChecksumStatus::Unverified);
        ctx.stats.count_rx(port, completion.length);
        ctx.sink.on_received(buffer, port as u8);
        report.rx_delivered += 1;
        true
    }

    /// Gives the completion rings back to the platform. Later drains do nothing.
    pub fn free_rings(&self, platform: &dyn DmaPlatform) {
        if let Some(rings) = self.rings.lock().take() {
            rings.doorbell.free(platform);
            rings.tx.free(platform);
            rings.rx.free(platform);
        }
    }
}
