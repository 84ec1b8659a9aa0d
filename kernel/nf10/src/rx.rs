//! Posting receive buffers to the device.
//!
//! Each posted buffer takes one slot of the RX descriptor ring and `RX_BUFFER_SLOTS` slots of the
//! device's RX packet region, where the device stages the frame before copying it to the host.
//! The device fills buffers in the order they were posted and reports each one in the RX completion
//! ring slot with the same index as its descriptor.

use alloc::{boxed::Box, vec::Vec};
use spin::Mutex;
use owning_ref::BoxRefMut;
use nic_buffers::{DmaDirection, DmaPlatform, MappedRegion, PhysicalAddress, ReceiveBuffer};
use nic_queues::DescriptorRing;

use crate::{
    config::{Nf10Config, RX_BUFFER_SIZE, RX_BUFFER_SLOTS, RX_HEADROOM},
    registers::DescriptorSlot,
    wire::RxDescriptor,
};

/// Possible reasons for failure of [`RxReplenisher::post_one()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    /// Either the RX descriptor ring or the RX packet region is full
    PoolExhausted,
    /// No memory for a new receive buffer
    AllocationFailed,
    /// The new receive buffer could not be mapped for the device
    MappingFailed,
}

impl From<RxError> for &'static str {
    fn from(error: RxError) -> Self {
        match error {
            RxError::PoolExhausted => "All receive descriptors are in use",
            RxError::AllocationFailed => "Failed to allocate a receive buffer",
            RxError::MappingFailed => "Failed to map a receive buffer for the device",
        }
    }
}

/// A buffer handed to the device, waiting to be filled.
struct PostedRx {
    buffer: ReceiveBuffer,
    dma_addr: PhysicalAddress,
}

struct RxInner {
    /// The RX descriptor ring on the device.
    window: BoxRefMut<MappedRegion, [DescriptorSlot]>,
    descriptors: DescriptorRing,
    /// Only offsets are tracked; the region itself is device memory the host never touches.
    packets: DescriptorRing,
    /// Indexed by RX descriptor slot.
    pool: Vec<Option<PostedRx>>,
}

pub struct RxReplenisher {
    inner: Mutex<RxInner>,
}

impl RxReplenisher {
    /// Creates a replenisher over the device's RX descriptor ring, which must be `config.rx_descriptor_mask + 1` bytes.
    pub fn new(region: MappedRegion, config: &Nf10Config) -> Result<RxReplenisher, &'static str> {
        let descriptors = DescriptorRing::new(config.rx_descriptor_mask)?;
        let packets = DescriptorRing::new(config.rx_packet_mask)?;
        let slot_count = descriptors.cluster_size() as usize;
        let window = BoxRefMut::new(Box::new(region))
            .try_map_mut(|mr| mr.as_slice_mut::<DescriptorSlot>(0, slot_count))?;
        let mut pool = Vec::with_capacity(slot_count);
        pool.resize_with(slot_count, || None);
        Ok(RxReplenisher {
            inner: Mutex::new(RxInner { window, descriptors, packets, pool }),
        })
    }

    /// Posts one fresh receive buffer to the device.
    pub fn post_one(&self, platform: &dyn DmaPlatform) -> Result<(), RxError> {
        let mut inner = self.inner.lock();
        if inner.descriptors.free_slots() < 1 || inner.packets.free_slots() < RX_BUFFER_SLOTS {
            return Err(RxError::PoolExhausted);
        }
        let buffer = ReceiveBuffer::try_new(RX_BUFFER_SIZE, RX_HEADROOM)
            .map_err(|_| RxError::AllocationFailed)?;

        let (desc_offset, packet_offset) = match (inner.descriptors.reserve(1), inner.packets.reserve(RX_BUFFER_SLOTS)) {
            (Some(desc), Some(packet)) => (desc, packet),
            // Both were checked above, and only this lock's holder reserves.
            _ => return Err(RxError::PoolExhausted),
        };
        let dma_addr = match platform.map_for_device(buffer.device_area(), DmaDirection::FromDevice) {
            Ok(addr) => addr,
            Err(_) => {
                let _ = inner.packets.unreserve(RX_BUFFER_SLOTS);
                let _ = inner.descriptors.unreserve(1);
                return Err(RxError::MappingFailed);
            }
        };

        let slot = DescriptorRing::slot_index(desc_offset);
        inner.pool[slot] = Some(PostedRx { buffer, dma_addr });
        // The device copies starting at the same alignment within a word as the host buffer.
        let descriptor = RxDescriptor {
            packet_offset: packet_offset + (dma_addr.value() & 0x3),
            buffer_addr: dma_addr,
        };
        inner.window[slot].write(descriptor.encode());
        Ok(())
    }

    /// Takes back the buffer posted at RX descriptor `slot`, which the device has filled,
    /// and frees its descriptor and packet region space.
    pub fn take_completed(&self, slot: usize, platform: &dyn DmaPlatform) -> Option<ReceiveBuffer> {
        let mut inner = self.inner.lock();
        let posted = inner.pool.get_mut(slot)?.take()?;
        if inner.descriptors.release(1).is_err() || inner.packets.release(RX_BUFFER_SLOTS).is_err() {
            error!("nf10: RX completion in slot {} did not match the posted descriptors", slot);
        }
        platform.unmap(posted.dma_addr, RX_BUFFER_SIZE as usize, DmaDirection::FromDevice);
        Some(posted.buffer)
    }

    /// The number of buffers currently posted.
    pub fn posted(&self) -> u64 {
        self.inner.lock().descriptors.outstanding()
    }

    /// Unmaps and frees every posted buffer.
    pub fn drain_all(&self, platform: &dyn DmaPlatform) {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for entry in inner.pool.iter_mut() {
            if let Some(posted) = entry.take() {
                platform.unmap(posted.dma_addr, RX_BUFFER_SIZE as usize, DmaDirection::FromDevice);
                count += 1;
            }
        }
        let _ = inner.descriptors.release(count);
        let _ = inner.packets.release(count * RX_BUFFER_SLOTS);
    }
}
