//! Packet and error counters.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{config::NUM_PORTS, port::Port};

#[derive(Debug, Default)]
struct PortCounters {
    tx_packets: AtomicU64,
    tx_bytes:   AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes:   AtomicU64,
    rx_dropped: AtomicU64,
}

/// Live counters, updated from the transmit and completion paths.
#[derive(Debug, Default)]
pub struct Nf10Stats {
    ports: [PortCounters; NUM_PORTS],
    rx_errors: AtomicU64,
    tx_ring_full: AtomicU64,
}

impl Nf10Stats {
    /// Counts a packet whose transmission the device has reported complete.
    pub fn count_tx(&self, port: Port, bytes: u16) {
        let counters = &self.ports[port.index()];
        counters.tx_packets.fetch_add(1, Ordering::Relaxed);
        counters.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_rx(&self, port: Port, bytes: u16) {
        let counters = &self.ports[port.index()];
        counters.rx_packets.fetch_add(1, Ordering::Relaxed);
        counters.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts a well-formed frame that arrived on a port that is administratively down.
    pub fn count_rx_dropped(&self, port: Port) {
        self.ports[port.index()].rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a malformed RX completion.
    pub fn count_rx_error(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_tx_ring_full(&self) {
        self.tx_ring_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of every counter. `doorbell_backpressure` is kept by the doorbell itself.
    pub fn snapshot(&self, doorbell_backpressure: u64) -> StatisticsSnapshot {
        let mut ports = [PortStatistics::default(); NUM_PORTS];
        for (snapshot, counters) in ports.iter_mut().zip(self.ports.iter()) {
            *snapshot = PortStatistics {
                tx_packets: counters.tx_packets.load(Ordering::Relaxed),
                tx_bytes:   counters.tx_bytes.load(Ordering::Relaxed),
                rx_packets: counters.rx_packets.load(Ordering::Relaxed),
                rx_bytes:   counters.rx_bytes.load(Ordering::Relaxed),
                rx_dropped: counters.rx_dropped.load(Ordering::Relaxed),
            };
        }
        StatisticsSnapshot {
            ports,
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_ring_full: self.tx_ring_full.load(Ordering::Relaxed),
            doorbell_backpressure,
        }
    }
}

/// The counters of one port at the time of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatistics {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    /// Frames received while the port was down
    pub rx_dropped: u64,
}

/// A point-in-time copy of all counters of one NIC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub ports: [PortStatistics; NUM_PORTS],
    /// RX completions with an invalid length or port
    pub rx_errors: u64,
    /// Transmit attempts rejected because the traffic class's ring was full
    pub tx_ring_full: u64,
    /// Instructions dropped because the doorbell stayed full
    pub doorbell_backpressure: u64,
}

impl StatisticsSnapshot {
    pub fn port(&self, port: Port) -> &PortStatistics {
        &self.ports[port.index()]
    }
}
