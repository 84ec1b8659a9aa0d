//! Traffic classes: the device's transmit queues.
//!
//! Each class owns a descriptor buffer in host memory that the device reads TX descriptors from,
//! and is shaped by the device according to its rate and token bucket size.
//! Classes are numbered in creation order and can only be removed in reverse order,
//! because the device identifies them by position.
//!
//! The driver is the producer of a class's ring (it advances the tail in [`TrafficClass::enqueue()`])
//! and the device is the consumer; the head moves only when the completion engine processes a
//! TX completion for the class, see [`TrafficClass::reclaim_up_to()`].

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, RwLock};
use owning_ref::BoxRefMut;
use nic_buffers::{DmaDirection, DmaPlatform, MappedRegion, PhysicalAddress, TransmitBuffer};
use nic_queues::{DescriptorRing, SLOT_SIZE};

use crate::{
    config::MAX_TRAFFIC_CLASSES,
    doorbell::DoorbellMailbox,
    port::Port,
    registers::DescriptorSlot,
    stats::Nf10Stats,
    wire::{Instruction, TxDescriptor},
};

/// Value: 128. The smallest descriptor buffer a class may have (two slots).
pub const MIN_CLASS_BUFFER_SIZE: u64 = 2 * SLOT_SIZE;

/// Where a class is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassState {
    /// Accepting packets
    Active,
    /// A stop-class instruction is being sent; no new packets are accepted
    Stopping,
    /// The device has been told to stop the class, but it still exists
    Stopped,
    /// A delete-class instruction was sent and has not been acknowledged yet
    Deleting,
}

/// Possible reasons for failure of a traffic class operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassError {
    /// The platform could not provide memory for the descriptor buffer
    AllocationFailed,
    /// There are already `MAX_TRAFFIC_CLASSES` classes
    ClassLimitReached,
    /// The doorbell stayed full
    Backpressure,
    /// There is no class to destroy
    NoTrafficClasses,
    /// The most recent class is being removed and the device has not acknowledged it yet
    DeletionPending,
    /// The descriptor buffer size is not a power of two between 128 bytes and 4 GiB
    InvalidBufferMask,
    /// The class with this index was added, but its rate or token bucket size could not be set
    PartiallyConfigured(u32),
    /// There is no class with the given index
    NoSuchClass,
}

impl From<ClassError> for &'static str {
    fn from(error: ClassError) -> Self {
        match error {
            ClassError::AllocationFailed => "Failed to allocate a traffic class descriptor buffer",
            ClassError::ClassLimitReached => "The maximum number of traffic classes already exist",
            ClassError::Backpressure => "Timed out waiting for room in the doorbell ring",
            ClassError::NoTrafficClasses => "There are no traffic classes",
            ClassError::DeletionPending => "A traffic class deletion has not been acknowledged yet",
            ClassError::InvalidBufferMask => "Traffic class buffer size must be a power of two between 128 bytes and 4 GiB",
            ClassError::PartiallyConfigured(_) => "Traffic class was created, but its rate or token bucket could not be set",
            ClassError::NoSuchClass => "No traffic class with that index exists",
        }
    }
}

/// Why [`TrafficClass::enqueue()`] did not accept a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    RingFull,
    ClassStopping,
    Backpressure,
}

/// A packet whose descriptor the device may still be reading.
struct InFlight {
    buffer: TransmitBuffer,
    dma_addr: PhysicalAddress,
    port: Port,
}

/// The producer side of a class, guarded by one lock.
struct Producer {
    state: ClassState,
    /// The aligned descriptor slots. `None` once the memory has been given back to the platform.
    slots: Option<BoxRefMut<MappedRegion, [DescriptorSlot]>>,
}

/// One transmit queue on the device.
pub struct TrafficClass {
    index: u32,
    /// Where the device finds the first descriptor slot.
    ring_addr: PhysicalAddress,
    /// The device's position, as a slot index.
    head: AtomicU64,
    /// `write_ptr` is the tail; `outstanding` counts in-flight descriptors.
    ring: DescriptorRing,
    producer: Mutex<Producer>,
    in_flight: Box<[Mutex<Option<InFlight>>]>,
}

impl TrafficClass {
    /// Lays out a class's descriptor ring in `memory`, which must be `buffer_mask + 1 + 64` bytes.
    ///
    /// The usable ring starts at the first 64-byte boundary strictly after the start of `memory`.
    /// On failure `memory` is returned to `platform`.
    fn new(index: u32, buffer_mask: u64, memory: MappedRegion, platform: &dyn DmaPlatform) -> Option<TrafficClass> {
        let ring = match DescriptorRing::new(buffer_mask) {
            Ok(ring) => ring,
            Err(_) => {
                platform.free_dma_buffer(memory);
                return None;
            }
        };
        let phys = memory.phys_addr();
        let aligned = phys.align_down(SLOT_SIZE) + SLOT_SIZE;
        let offset = (aligned.value() - phys.value()) as usize;
        let slot_count = ring.cluster_size() as usize;
        // `try_map_mut` drops its owner on failure, so check the view while the region can still be freed.
        if let Err(err) = memory.as_slice::<DescriptorSlot>(offset, slot_count) {
            error!("nf10: traffic class {} descriptor buffer is unusable: {}", index, err);
            platform.free_dma_buffer(memory);
            return None;
        }
        let slots = BoxRefMut::new(Box::new(memory))
            .try_map_mut(|mr| mr.as_slice_mut::<DescriptorSlot>(offset, slot_count))
            .ok()?;

        let in_flight = (0..slot_count).map(|_| Mutex::new(None)).collect::<Vec<_>>().into_boxed_slice();
        Some(TrafficClass {
            index,
            ring_addr: aligned,
            head: AtomicU64::new(0),
            ring,
            producer: Mutex::new(Producer { state: ClassState::Active, slots: Some(slots) }),
            in_flight,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> ClassState {
        self.producer.lock().state
    }

    /// The number of descriptor slots.
    pub fn capacity(&self) -> u64 {
        self.ring.cluster_size()
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u64 {
        self.ring.write_ptr() / SLOT_SIZE
    }

    /// The number of descriptors the device has not reported as transmitted.
    pub fn in_flight(&self) -> u64 {
        self.ring.outstanding()
    }

    /// The device-visible address of the descriptor ring, or `None` if it was already freed.
    pub fn ring_address(&self) -> Option<PhysicalAddress> {
        self.producer.lock().slots.as_ref().map(|_| self.ring_addr)
    }

    /// A class is full when advancing the tail would make it equal to the head.
    /// One slot always stays empty.
    pub fn is_full(&self) -> bool {
        Self::full(self.head(), self.tail(), self.capacity())
    }

    fn full(head: u64, tail: u64, slots: u64) -> bool {
        (head == 0 && tail == slots - 1) || (head != 0 && tail == head - 1)
    }

    /// Posts one packet, already mapped for the device at `dma_addr`, and rings the doorbell.
    ///
    /// On failure nothing was sent to the device and the buffer is handed back.
    pub fn enqueue(
        &self,
        buffer: TransmitBuffer,
        dma_addr: PhysicalAddress,
        port: Port,
        doorbell: &DoorbellMailbox,
    ) -> Result<(), (EnqueueError, TransmitBuffer)> {
        let mut producer = self.producer.lock();
        if producer.state != ClassState::Active {
            return Err((EnqueueError::ClassStopping, buffer));
        }
        if self.is_full() {
            return Err((EnqueueError::RingFull, buffer));
        }
        let (offset, slots) = match (self.ring.reserve(1), producer.slots.as_mut()) {
            (Some(offset), Some(slots)) => (offset, slots),
            (Some(_), None) => {
                let _ = self.ring.unreserve(1);
                return Err((EnqueueError::ClassStopping, buffer));
            }
            (None, _) => return Err((EnqueueError::RingFull, buffer)),
        };
        let slot = DescriptorRing::slot_index(offset);
        let length = buffer.length();

        // Hold the slot until it is recorded, so that a completion racing with the doorbell waits for it.
        let mut entry = self.in_flight[slot].lock();
        slots[slot].write(TxDescriptor { length, port, packet_addr: dma_addr }.encode());

        let instruction = Instruction::AddDescriptor {
            class: self.index,
            packet_addr: dma_addr,
            ports: port.mask(),
            length,
            tail: self.tail(),
        };
        if doorbell.send(instruction).is_err() {
            drop(entry);
            let _ = self.ring.unreserve(1);
            return Err((EnqueueError::Backpressure, buffer));
        }
        *entry = Some(InFlight { buffer, dma_addr, port });
        Ok(())
    }

    /// Frees every buffer the device has finished with, i.e., those in slots `[head, new_head)`,
    /// then moves the head to `new_head`.
    pub fn reclaim_up_to(&self, new_head: u64, platform: &dyn DmaPlatform, stats: &Nf10Stats) -> Result<u64, &'static str> {
        let head = self.head();
        if new_head >= self.capacity() {
            return Err("nf10: TX completion head is outside of the class's ring");
        }
        let reclaimed = self.ring.distance(head * SLOT_SIZE, new_head * SLOT_SIZE);
        if reclaimed > self.ring.outstanding() {
            return Err("nf10: TX completion head is beyond the class's tail");
        }

        for i in 0..reclaimed {
            let slot = ((head + i) % self.capacity()) as usize;
            match self.in_flight[slot].lock().take() {
                Some(entry) => {
                    platform.unmap(entry.dma_addr, entry.buffer.length() as usize, DmaDirection::ToDevice);
                    stats.count_tx(entry.port, entry.buffer.length());
                }
                None => error!("nf10: class {} slot {} was completed but held no buffer", self.index, slot),
            }
        }
        self.ring.release(reclaimed)?;
        self.head.store(new_head, Ordering::Release);
        Ok(reclaimed)
    }

    /// Frees every buffer still in flight, used when the class is removed or the NIC goes away.
    fn sweep(&self, platform: &dyn DmaPlatform) {
        for (slot, entry) in self.in_flight.iter().enumerate() {
            if let Some(entry) = entry.lock().take() {
                warn!("nf10: class {} slot {} still held a {}-byte packet at teardown", self.index, slot, entry.buffer.length());
                platform.unmap(entry.dma_addr, entry.buffer.length() as usize, DmaDirection::ToDevice);
            }
        }
        let outstanding = self.ring.outstanding();
        let _ = self.ring.release(outstanding);
        self.head.store(self.tail(), Ordering::Release);
    }

    /// Gives the descriptor memory back to the platform. Does nothing if it is already gone.
    fn release_memory(&self, platform: &dyn DmaPlatform) {
        if let Some(slots) = self.producer.lock().slots.take() {
            platform.free_dma_buffer(*slots.into_owner());
        }
    }
}


/// All traffic classes of one NIC, in creation order (a class's index is its position).
pub struct TrafficClasses {
    classes: RwLock<Vec<Arc<TrafficClass>>>,
    /// Serializes class creation and destruction.
    lifecycle: Mutex<()>,
}

impl Default for TrafficClasses {
    fn default() -> Self {
        TrafficClasses::new()
    }
}

impl TrafficClasses {
    pub fn new() -> TrafficClasses {
        TrafficClasses {
            classes: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn count(&self) -> usize {
        self.classes.read().len()
    }

    pub fn get(&self, index: u32) -> Option<Arc<TrafficClass>> {
        self.classes.read().get(index as usize).cloned()
    }

    fn last(&self) -> Option<Arc<TrafficClass>> {
        self.classes.read().last().cloned()
    }

    /// Creates a new class with a descriptor buffer of `buffer_mask + 1` bytes and returns its index.
    pub fn create(
        &self,
        rate: u64,
        token_max: u64,
        buffer_mask: u64,
        doorbell: &DoorbellMailbox,
        platform: &dyn DmaPlatform,
    ) -> Result<u32, ClassError> {
        let size = buffer_mask.checked_add(1).ok_or(ClassError::InvalidBufferMask)?;
        if !size.is_power_of_two() || size < MIN_CLASS_BUFFER_SIZE || size > 1 << 32 {
            return Err(ClassError::InvalidBufferMask);
        }

        let _lifecycle = self.lifecycle.lock();
        if let Some(last) = self.last() {
            if last.state() == ClassState::Deleting {
                return Err(ClassError::DeletionPending);
            }
        }
        let index = self.count();
        if index >= MAX_TRAFFIC_CLASSES {
            return Err(ClassError::ClassLimitReached);
        }
        let index = index as u32;

        let memory = platform.allocate_dma_buffer((size + SLOT_SIZE) as usize)
            .map_err(|_| ClassError::AllocationFailed)?;
        let class = TrafficClass::new(index, buffer_mask, memory, platform)
            .ok_or(ClassError::AllocationFailed)?;
        let buffer_addr = class.ring_address().ok_or(ClassError::AllocationFailed)?;

        if doorbell.send(Instruction::AddClass { buffer_mask, buffer_addr }).is_err() {
            class.release_memory(platform);
            return Err(ClassError::Backpressure);
        }
        self.classes.write().push(Arc::new(class));
        debug!("nf10: created traffic class {} ({} descriptor slots at {:?})", index, size / SLOT_SIZE, buffer_addr);

        doorbell.send(Instruction::SetRate { class: index, rate })
            .and_then(|_| doorbell.send(Instruction::SetTokenMax { class: index, token_max }))
            .map_err(|_| {
                warn!("nf10: traffic class {} was added but could not be fully configured", index);
                ClassError::PartiallyConfigured(index)
            })?;
        Ok(index)
    }

    pub fn set_rate(&self, index: u32, rate: u64, doorbell: &DoorbellMailbox) -> Result<(), ClassError> {
        self.get(index).ok_or(ClassError::NoSuchClass)?;
        doorbell.send(Instruction::SetRate { class: index, rate }).map_err(|_| ClassError::Backpressure)
    }

    pub fn set_token_max(&self, index: u32, token_max: u64, doorbell: &DoorbellMailbox) -> Result<(), ClassError> {
        self.get(index).ok_or(ClassError::NoSuchClass)?;
        doorbell.send(Instruction::SetTokenMax { class: index, token_max }).map_err(|_| ClassError::Backpressure)
    }

    /// Stops and deletes the most recently created class, returning its index.
    ///
    /// The class is only removed once the device acknowledges the deletion,
    /// see [`TrafficClasses::complete_deletion()`].
    /// If sending fails, the class is left `Active` (stop not sent) or `Stopped` (delete not sent),
    /// and `destroy` can simply be called again.
    pub fn destroy(&self, doorbell: &DoorbellMailbox) -> Result<u32, ClassError> {
        let _lifecycle = self.lifecycle.lock();
        let class = self.last().ok_or(ClassError::NoTrafficClasses)?;
        let mut producer = class.producer.lock();

        match producer.state {
            ClassState::Active => {
                producer.state = ClassState::Stopping;
                if doorbell.send(Instruction::StopClass { class: class.index }).is_err() {
                    producer.state = ClassState::Active;
                    return Err(ClassError::Backpressure);
                }
                producer.state = ClassState::Stopped;
            }
            ClassState::Stopped => {}
            ClassState::Stopping | ClassState::Deleting => return Err(ClassError::DeletionPending),
        }

        producer.state = ClassState::Deleting;
        if doorbell.send(Instruction::DeleteClass).is_err() {
            producer.state = ClassState::Stopped;
            return Err(ClassError::Backpressure);
        }
        debug!("nf10: deleting traffic class {}", class.index);
        Ok(class.index)
    }

    /// Finishes a deletion once the device has acknowledged the delete-class instruction.
    ///
    /// A successful acknowledgement removes the class and frees everything it holds;
    /// a failed one moves it back to `Stopped`.
    pub fn complete_deletion(&self, succeeded: bool, platform: &dyn DmaPlatform) {
        let mut classes = self.classes.write();
        let class = match classes.last() {
            Some(class) => class.clone(),
            None => {
                error!("nf10: delete-class acknowledged, but there are no traffic classes");
                return;
            }
        };
        let mut producer = class.producer.lock();
        if producer.state != ClassState::Deleting {
            error!("nf10: delete-class acknowledged, but class {} is {:?}", class.index, producer.state);
            return;
        }
        if !succeeded {
            warn!("nf10: device refused to delete traffic class {}", class.index);
            producer.state = ClassState::Stopped;
            return;
        }
        classes.pop();
        drop(classes);
        drop(producer);

        class.sweep(platform);
        class.release_memory(platform);
        debug!("nf10: deleted traffic class {}", class.index);
    }

    /// Removes every class without telling the device, freeing all in-flight buffers and descriptor memory.
    pub fn teardown(&self, platform: &dyn DmaPlatform) {
        let _lifecycle = self.lifecycle.lock();
        let classes = core::mem::take(&mut *self.classes.write());
        for class in classes.iter().rev() {
            class.sweep(platform);
            class.release_memory(platform);
        }
    }
}
