//! The transmit path: choosing a traffic class for each outgoing frame and posting it.

use alloc::boxed::Box;
use nic_buffers::{DmaDirection, DmaPlatform, TransmitBuffer};

use crate::{
    config::MAX_FRAME_SIZE,
    doorbell::DoorbellMailbox,
    port::Port,
    stats::Nf10Stats,
    traffic_class::{EnqueueError, TrafficClasses},
};

/// Possible reasons for failure of [`TxEngine::transmit()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The chosen traffic class has no free descriptor slot
    RingFull,
    /// The frame could not be mapped for the device
    MappingFailed,
    /// The frame is longer than `MAX_FRAME_SIZE`
    OversizeBuffer,
    /// The doorbell stayed full
    Backpressure,
    /// No traffic class exists to carry the frame
    NoTrafficClass,
    /// The chosen traffic class is being removed
    ClassStopping,
}

impl From<TxError> for &'static str {
    fn from(error: TxError) -> Self {
        match error {
            TxError::RingFull => "Traffic class descriptor ring is full",
            TxError::MappingFailed => "Failed to map the transmit buffer for the device",
            TxError::OversizeBuffer => "Frame is larger than the maximum Ethernet frame size",
            TxError::Backpressure => "Timed out waiting for room in the doorbell ring",
            TxError::NoTrafficClass => "No traffic class exists",
            TxError::ClassStopping => "Traffic class is being removed",
        }
    }
}

impl From<EnqueueError> for TxError {
    fn from(error: EnqueueError) -> Self {
        match error {
            EnqueueError::RingFull => TxError::RingFull,
            EnqueueError::ClassStopping => TxError::ClassStopping,
            EnqueueError::Backpressure => TxError::Backpressure,
        }
    }
}

/// Picks the traffic class that will carry a frame.
pub trait Classifier: Send + Sync {
    /// Returns a class index for `frame`, given that classes `0..class_count` exist.
    fn classify(&self, frame: &[u8], class_count: usize) -> u32;
}

/// The default classifier: the first two bytes of the frame, read as a little-endian selector `s`,
/// pick class `s - 1` when `1 <= s <= class_count`. Every other frame goes to class 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectorClassifier;

impl Classifier for SelectorClassifier {
    fn classify(&self, frame: &[u8], class_count: usize) -> u32 {
        let selector = match frame {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]) as usize,
            _ => 0,
        };
        if selector >= 1 && selector <= class_count {
            (selector - 1) as u32
        } else {
            0
        }
    }
}

pub struct TxEngine {
    classifier: Box<dyn Classifier>,
}

impl TxEngine {
    pub fn new(classifier: Box<dyn Classifier>) -> TxEngine {
        TxEngine { classifier }
    }

    /// Sends `buffer` out of `port`.
    ///
    /// On success the buffer belongs to its traffic class until the device reports it transmitted.
    /// On failure the buffer is unmapped and dropped, and no instruction reached the device.
    pub fn transmit(
        &self,
        buffer: TransmitBuffer,
        port: Port,
        classes: &TrafficClasses,
        doorbell: &DoorbellMailbox,
        platform: &dyn DmaPlatform,
        stats: &Nf10Stats,
    ) -> Result<(), TxError> {
        if buffer.len() > MAX_FRAME_SIZE {
            return Err(TxError::OversizeBuffer);
        }
        let index = self.classifier.classify(&buffer, classes.count());
        let class = classes.get(index).ok_or(TxError::NoTrafficClass)?;
        if class.is_full() {
            stats.count_tx_ring_full();
            return Err(TxError::RingFull);
        }

        let dma_addr = platform.map_for_device(&buffer, DmaDirection::ToDevice)
            .map_err(|_| TxError::MappingFailed)?;
        class.enqueue(buffer, dma_addr, port, doorbell).map_err(|(error, buffer)| {
            platform.unmap(dma_addr, buffer.len(), DmaDirection::ToDevice);
            if error == EnqueueError::RingFull {
                stats.count_tx_ring_full();
            }
            TxError::from(error)
        })
    }
}
