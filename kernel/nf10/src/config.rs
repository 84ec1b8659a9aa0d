//! Hardware constants of the NetFPGA-10G NIC and the tunable geometry of the driver's rings.

use nic_queues::{DescriptorRing, SLOT_SIZE};

/// Value: 1514. The largest Ethernet frame (without FCS) the device will send or deliver.
pub const MAX_FRAME_SIZE: usize = 1514;
/// Value: 60. Received frames shorter than this are malformed.
pub const MIN_FRAME_SIZE: usize = 60;
/// Value: 1533. The number of bytes the device may write into one receive buffer.
pub const RX_BUFFER_SIZE: u16 = 1533;
/// Value: 2. Bytes left in front of received data so that the IP header is 16-byte aligned.
pub const RX_HEADROOM: usize = 2;
/// Value: 24. The number of RX packet region slots that one receive buffer occupies on the device.
pub const RX_BUFFER_SLOTS: u64 = (RX_BUFFER_SIZE as u64 + 66) / SLOT_SIZE;
/// Value: 1023. The most traffic classes that can exist at once.
pub const MAX_TRAFFIC_CLASSES: usize = 1023;
/// Value: 31. Free doorbell slots that must exist before another instruction may be written.
pub const DOORBELL_LOW_WATERMARK: u64 = 31;
/// Value: 10000. Upper bound of a drain's extra polling budget.
pub const DRAIN_SPIN_CEILING: u32 = 10_000;
/// Value: 4. The number of physical Ethernet ports.
pub const NUM_PORTS: usize = 4;


/// How long [`DoorbellMailbox::send()`](crate::doorbell::DoorbellMailbox::send) waits for the device
/// to make room before giving up with `Backpressure`.
///
/// Each attempt spins for twice as long as the one before, starting at `initial_spins`
/// and never exceeding `max_spins`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellBackoff {
    pub initial_spins: u32,
    pub max_spins: u32,
    pub max_attempts: u32,
}

impl Default for DoorbellBackoff {
    fn default() -> Self {
        DoorbellBackoff {
            initial_spins: 1,
            max_spins: 1 << 10,
            max_attempts: 4096,
        }
    }
}

/// Ring geometry and policy knobs for one [`Nf10Nic`](crate::Nf10Nic).
///
/// Every `*_mask` is the byte capacity of the corresponding ring minus one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nf10Config {
    /// The doorbell instruction ring on the device.
    pub doorbell_mask: u64,
    /// The host ring into which the device acknowledges doorbell instructions.
    pub doorbell_completion_mask: u64,
    /// The host ring into which the device reports transmitted descriptors.
    pub tx_completion_mask: u64,
    /// The RX descriptor ring on the device.
    pub rx_descriptor_mask: u64,
    /// The host ring into which the device reports received frames, one slot per RX descriptor.
    pub rx_completion_mask: u64,
    /// The device's RX packet buffer region, carved into `RX_BUFFER_SLOTS`-sized chunks.
    pub rx_packet_mask: u64,
    /// Free doorbell slots required before writing an instruction.
    pub doorbell_low_watermark: u64,
    pub doorbell_backoff: DoorbellBackoff,
    /// Upper bound of the extra polling budget of one drain.
    pub drain_spin_ceiling: u32,
}

impl Default for Nf10Config {
    fn default() -> Self {
        Nf10Config {
            doorbell_mask: 0x7ff,
            doorbell_completion_mask: 0x7ff,
            tx_completion_mask: 0x7ff,
            rx_descriptor_mask: 0x7ff,
            rx_completion_mask: 0x7ff,
            rx_packet_mask: 0x7fff,
            doorbell_low_watermark: DOORBELL_LOW_WATERMARK,
            doorbell_backoff: DoorbellBackoff::default(),
            drain_spin_ceiling: DRAIN_SPIN_CEILING,
        }
    }
}

/// Reasons an [`Nf10Config`] cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A ring's capacity is not a power of two, or is smaller than one slot
    InvalidRingSize,
    /// The RX completion ring must have exactly one slot per RX descriptor
    CompletionRingMismatch,
    /// The RX packet region cannot hold even one receive buffer
    PacketRegionTooSmall,
    /// The doorbell ring is not larger than its own low watermark
    DoorbellTooSmall,
    /// The backoff policy would never attempt a send
    InvalidBackoff,
    /// The drain budget ceiling must be at least one
    InvalidSpinCeiling,
}

impl From<ConfigError> for &'static str {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::InvalidRingSize => "Ring capacity must be a power of two of at least 64 bytes",
            ConfigError::CompletionRingMismatch => "RX completion ring and RX descriptor ring must have the same number of slots",
            ConfigError::PacketRegionTooSmall => "RX packet region is too small for a single receive buffer",
            ConfigError::DoorbellTooSmall => "Doorbell ring must have more slots than its low watermark",
            ConfigError::InvalidBackoff => "Doorbell backoff must allow at least one attempt and one spin",
            ConfigError::InvalidSpinCeiling => "Drain spin ceiling must be at least one",
        }
    }
}

impl Nf10Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let masks = [
            self.doorbell_mask,
            self.doorbell_completion_mask,
            self.tx_completion_mask,
            self.rx_descriptor_mask,
            self.rx_completion_mask,
            self.rx_packet_mask,
        ];
        for mask in masks {
            DescriptorRing::new(mask).map_err(|_| ConfigError::InvalidRingSize)?;
        }
        if self.rx_completion_mask != self.rx_descriptor_mask {
            return Err(ConfigError::CompletionRingMismatch);
        }
        if (self.rx_packet_mask + 1) / SLOT_SIZE < RX_BUFFER_SLOTS {
            return Err(ConfigError::PacketRegionTooSmall);
        }
        if (self.doorbell_mask + 1) / SLOT_SIZE <= self.doorbell_low_watermark {
            return Err(ConfigError::DoorbellTooSmall);
        }
        let backoff = &self.doorbell_backoff;
        if backoff.max_attempts == 0 || backoff.initial_spins == 0 || backoff.max_spins < backoff.initial_spins {
            return Err(ConfigError::InvalidBackoff);
        }
        if self.drain_spin_ceiling == 0 {
            return Err(ConfigError::InvalidSpinCeiling);
        }
        Ok(())
    }
}
