//! Bring-up, teardown and the network interface facade.

use super::*;
use network_interface_card::NetworkInterfaceCard;
use nic_buffers::TransmitBuffer;
use crate::{config::ConfigError, registers::COMPLETION_SENTINEL};

#[test]
fn bring_up_programs_the_device() {
    let h = harness();
    for ring in [TX_COMPLETION_RING, RX_COMPLETION_RING, DOORBELL_COMPLETION_RING] {
        let addr = h.device.register(ring);
        assert!(h.platform.is_allocated(addr), "ring at word {} was not allocated", ring);
        assert_eq!(h.device.register(ring + 1), 0x7ff);
        for slot in 0..32 {
            assert_eq!(h.device.completion_status(ring, slot), COMPLETION_SENTINEL);
        }
    }
    assert_eq!(h.device.register(RESET), 1);
    assert!(h.device.interrupts_enabled());
    assert_eq!(h.nic.class_count(), 0);
    for port in Port::ALL {
        assert!(!h.nic.is_port_up(port));
    }
}

#[test]
fn invalid_configurations_are_rejected() {
    assert_eq!(Nf10Config::default().validate(), Ok(()));
    let mismatched = Nf10Config { rx_completion_mask: 0xfff, ..Nf10Config::default() };
    assert_eq!(mismatched.validate(), Err(ConfigError::CompletionRingMismatch));
    let not_power_of_two = Nf10Config { tx_completion_mask: 0x7fe, ..Nf10Config::default() };
    assert_eq!(not_power_of_two.validate(), Err(ConfigError::InvalidRingSize));
    let tiny_packets = Nf10Config { rx_packet_mask: 0x3ff, ..Nf10Config::default() };
    assert_eq!(tiny_packets.validate(), Err(ConfigError::PacketRegionTooSmall));
    let tiny_doorbell = Nf10Config { doorbell_mask: 0x3ff, ..Nf10Config::default() };
    assert_eq!(tiny_doorbell.validate(), Err(ConfigError::DoorbellTooSmall));

    let device = FakeDevice::new(&Nf10Config::default());
    let platform = Arc::new(MockPlatform::default());
    let result = Nf10Nic::new(mismatched, device.windows(), platform.clone(), Arc::new(RecordingSink::default()));
    assert!(result.is_err());
    assert_eq!(platform.live_allocations(), 0);
}

#[test]
fn dropping_the_nic_releases_everything() {
    let config = test_config();
    let device = FakeDevice::new(&config);
    let platform = Arc::new(MockPlatform::default());
    let nic = Nf10Nic::new(config, device.windows(), platform.clone(), Arc::new(RecordingSink::default())).unwrap();
    nic.create_class(1, 1, 0xff).unwrap();
    nic.create_class(1, 1, 0x7ff).unwrap();
    let mut bytes = frame(60);
    bytes[0] = 2;
    nic.transmit(TransmitBuffer::from_slice(&frame(60)).unwrap(), Port::Port0).unwrap();
    nic.transmit(TransmitBuffer::from_slice(&bytes).unwrap(), Port::Port3).unwrap();
    assert!(platform.live_allocations() > 0);
    assert!(platform.live_mappings() > 0);

    drop(nic);
    assert_eq!(platform.live_allocations(), 0);
    assert_eq!(platform.live_mappings(), 0);
    assert!(!device.interrupts_enabled());
}

#[test]
fn network_interface_card_facade() {
    let h = harness();
    h.nic.create_class(1, 1, 0xff).unwrap();
    h.nic.set_port_up(Port::Port1, true);
    let nic: &dyn NetworkInterfaceCard = &h.nic;
    assert_eq!(nic.num_ports(), 4);

    assert!(nic.send_packet(TransmitBuffer::from_slice(&frame(60)).unwrap(), 4).is_err());
    nic.send_packet(TransmitBuffer::from_slice(&frame(60)).unwrap(), 1).unwrap();
    assert_eq!(h.nic.classes().get(0).unwrap().in_flight(), 1);

    h.device.receive(&frame(70), Port::Port1);
    nic.poll_receive().unwrap();
    let frames = h.sink.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, 1);
    assert_eq!(frames[0].0.len(), 70);
}

#[test]
fn received_bytes_are_counted() {
    let h = harness();
    h.nic.set_port_up(Port::Port0, true);
    h.device.receive(&frame(60), Port::Port0);
    h.device.receive(&frame(1514), Port::Port0);
    h.nic.handle_interrupt().unwrap();
    let stats = h.nic.statistics();
    assert_eq!(stats.port(Port::Port0).rx_packets, 2);
    assert_eq!(stats.port(Port::Port0).rx_bytes, 1574);
    assert_eq!(stats.rx_errors, 0);
}
