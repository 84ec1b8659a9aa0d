//! The interface between NIC drivers and the network stack above them.

#![no_std]

use nic_buffers::{ReceiveBuffer, TransmitBuffer};


/// A trait that defines the necessary minimum functions that all network interface card (NIC) drivers
/// should implement.
///
/// Methods take `&self` because a NIC is driven concurrently from the transmit path
/// and from its interrupt handler; implementations synchronize internally.
pub trait NetworkInterfaceCard {
    /// Sends a packet contained in the given `transmit_buffer` out through the given physical `port`.
    ///
    /// Returns once the packet has been handed to the hardware, not once it has been sent;
    /// the buffer is released when the NIC reports its completion.
    fn send_packet(&self, transmit_buffer: TransmitBuffer, port: u8) -> Result<(), &'static str>;

    /// Poll the NIC for completed transmissions and received frames.
    /// Can be used as an alternative to interrupts, or as a supplement to interrupts.
    fn poll_receive(&self) -> Result<(), &'static str>;

    /// Returns the number of physical ports this NIC drives.
    fn num_ports(&self) -> u8;
}


/// The receiving half of the network stack, to which a NIC driver hands received frames.
pub trait PacketSink: Send + Sync {
    /// Takes ownership of a frame that arrived on the given physical `port`.
    fn on_received(&self, frame: ReceiveBuffer, port: u8);
}
