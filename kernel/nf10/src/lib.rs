//! A driver core for the NetFPGA-10G reference NIC.
//!
//! The NIC has four 10G Ethernet ports and no fixed transmit queues. Instead, the driver creates
//! *traffic classes* at runtime: each one is a descriptor ring in host memory that the device drains
//! at a configured rate. All instructions to the device, including "here is a new TX descriptor",
//! go through a single ring on the device called the doorbell.
//! The device reports back through three completion rings in host memory
//! (doorbell acknowledgements, transmitted descriptors, received frames),
//! which are drained by [`Nf10Nic::handle_interrupt()`].
//!
//! Device enumeration, interrupt registration and DMA memory are provided by the platform:
//! see [`DeviceWindows`] and [`DmaPlatform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;

pub mod completion;
pub mod config;
pub mod doorbell;
pub mod port;
pub mod registers;
pub mod rx;
pub mod stats;
pub mod traffic_class;
pub mod tx;
pub mod wire;

#[cfg(test)]
mod test;

use alloc::{boxed::Box, sync::Arc};
use nic_buffers::{DmaPlatform, MappedRegion, TransmitBuffer};
use network_interface_card::{NetworkInterfaceCard, PacketSink};

use crate::{
    completion::{CompletionEngine, DrainContext, DrainReport, DrainState},
    config::{Nf10Config, NUM_PORTS},
    doorbell::DoorbellMailbox,
    port::{Port, PortStates},
    registers::RegisterWindow,
    rx::{RxError, RxReplenisher},
    stats::{Nf10Stats, StatisticsSnapshot},
    traffic_class::{ClassError, TrafficClasses},
    tx::{Classifier, SelectorClassifier, TxEngine, TxError},
};

/// The device memory the driver needs, already mapped by the platform.
pub struct DeviceWindows {
    /// The configuration registers (BAR0), at least 512 bytes.
    pub registers: MappedRegion,
    /// The doorbell ring, `doorbell_mask + 1` bytes.
    pub doorbell: MappedRegion,
    /// The RX descriptor ring, `rx_descriptor_mask + 1` bytes.
    pub rx_descriptors: MappedRegion,
}

/// A NetFPGA-10G NIC.
///
/// All methods take `&self`: transmitting, class management and interrupt handling
/// may happen concurrently, each component guards its own state.
pub struct Nf10Nic {
    config: Nf10Config,
    platform: Arc<dyn DmaPlatform>,
    sink: Arc<dyn PacketSink>,
    registers: Arc<RegisterWindow>,
    doorbell: DoorbellMailbox,
    classes: TrafficClasses,
    tx: TxEngine,
    rx: RxReplenisher,
    completions: CompletionEngine,
    ports: PortStates,
    stats: Nf10Stats,
}

impl Nf10Nic {
    /// Brings up the NIC with the default [`SelectorClassifier`].
    pub fn new(
        config: Nf10Config,
        windows: DeviceWindows,
        platform: Arc<dyn DmaPlatform>,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Nf10Nic, &'static str> {
        Self::new_with_classifier(config, windows, platform, sink, Box::new(SelectorClassifier))
    }

    /// Brings up the NIC: allocates and programs the completion rings, resets the device,
    /// enables interrupts and posts as many receive buffers as fit.
    ///
    /// All ports start administratively down and there are no traffic classes.
    pub fn new_with_classifier(
        config: Nf10Config,
        windows: DeviceWindows,
        platform: Arc<dyn DmaPlatform>,
        sink: Arc<dyn PacketSink>,
        classifier: Box<dyn Classifier>,
    ) -> Result<Nf10Nic, &'static str> {
        config.validate()?;
        let registers = Arc::new(RegisterWindow::new(windows.registers)?);
        let doorbell = DoorbellMailbox::new(windows.doorbell, &config, registers.clone())?;
        let rx = RxReplenisher::new(windows.rx_descriptors, &config)?;
        let completions = CompletionEngine::new(&*platform, &config)?;

        let nic = Nf10Nic {
            config,
            platform,
            sink,
            registers,
            doorbell,
            classes: TrafficClasses::new(),
            tx: TxEngine::new(classifier),
            rx,
            completions,
            ports: PortStates::default(),
            stats: Nf10Stats::default(),
        };

        let (doorbell_ring, tx_ring, rx_ring) = nic.completions.locations()
            .ok_or("nf10: completion rings were not allocated")?;
        nic.registers.program_completion_rings(doorbell_ring, tx_ring, rx_ring);
        nic.registers.reset();
        nic.registers.set_interrupts_enabled(true);

        let mut posted = 0;
        loop {
            match nic.rx.post_one(&*nic.platform) {
                Ok(()) => posted += 1,
                Err(RxError::PoolExhausted) => break,
                Err(e) => return Err(e.into()),
            }
        }
        debug!("nf10: initialized, {} receive buffers posted", posted);
        Ok(nic)
    }

    pub fn config(&self) -> &Nf10Config {
        &self.config
    }

    /// Creates a traffic class whose descriptor ring is `buffer_mask + 1` bytes and returns its index.
    pub fn create_class(&self, rate: u64, token_max: u64, buffer_mask: u64) -> Result<u32, ClassError> {
        self.classes.create(rate, token_max, buffer_mask, &self.doorbell, &*self.platform)
    }

    /// Starts removing the most recently created traffic class and returns its index.
    /// The class goes away once the device acknowledges the deletion during a later drain.
    pub fn destroy_class(&self) -> Result<u32, ClassError> {
        self.classes.destroy(&self.doorbell)
    }

    pub fn set_class_rate(&self, class: u32, rate: u64) -> Result<(), ClassError> {
        self.classes.set_rate(class, rate, &self.doorbell)
    }

    pub fn set_class_token_max(&self, class: u32, token_max: u64) -> Result<(), ClassError> {
        self.classes.set_token_max(class, token_max, &self.doorbell)
    }

    pub fn class_count(&self) -> usize {
        self.classes.count()
    }

    pub fn classes(&self) -> &TrafficClasses {
        &self.classes
    }

    /// Sends a frame out of `port` through the traffic class chosen by the classifier.
    pub fn transmit(&self, buffer: TransmitBuffer, port: Port) -> Result<(), TxError> {
        self.tx.transmit(buffer, port, &self.classes, &self.doorbell, &*self.platform, &self.stats)
    }

    /// Posts one more receive buffer, if there is room for it.
    pub fn post_rx_buffer(&self) -> Result<(), RxError> {
        self.rx.post_one(&*self.platform)
    }

    /// The number of receive buffers currently owned by the device.
    pub fn posted_rx_buffers(&self) -> u64 {
        self.rx.posted()
    }

    /// The interrupt handler: drains all completion rings.
    ///
    /// Returns `None` if a drain was already running, in which case that drain will pick up whatever
    /// caused this call.
    pub fn handle_interrupt(&self) -> Option<DrainReport> {
        let ctx = DrainContext {
            registers: &self.registers,
            doorbell: &self.doorbell,
            classes: &self.classes,
            rx: &self.rx,
            platform: &*self.platform,
            sink: &*self.sink,
            stats: &self.stats,
            ports: &self.ports,
        };
        self.completions.drain(&ctx)
    }

    /// Instructions sent through the doorbell that the device has not acknowledged yet.
    pub fn unacknowledged_instructions(&self) -> u64 {
        self.doorbell.outstanding()
    }

    pub fn drain_state(&self) -> DrainState {
        self.completions.state()
    }

    pub fn set_port_up(&self, port: Port, up: bool) {
        debug!("nf10: {:?} is now {}", port, if up { "up" } else { "down" });
        self.ports.set_up(port, up);
    }

    pub fn is_port_up(&self, port: Port) -> bool {
        self.ports.is_up(port)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot(self.doorbell.backpressure_events())
    }
}

impl NetworkInterfaceCard for Nf10Nic {
    fn send_packet(&self, transmit_buffer: TransmitBuffer, port: u8) -> Result<(), &'static str> {
        let port = Port::try_from(port).map_err(|_| "nf10: no such port")?;
        self.transmit(transmit_buffer, port)?;
        Ok(())
    }

    fn poll_receive(&self) -> Result<(), &'static str> {
        self.handle_interrupt();
        Ok(())
    }

    fn num_ports(&self) -> u8 {
        NUM_PORTS as u8
    }
}

impl Drop for Nf10Nic {
    fn drop(&mut self) {
        self.registers.set_interrupts_enabled(false);
        self.classes.teardown(&*self.platform);
        self.rx.drain_all(&*self.platform);
        self.completions.free_rings(&*self.platform);
        debug!("nf10: shut down");
    }
}
