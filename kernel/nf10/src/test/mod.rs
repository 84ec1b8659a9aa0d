//! Tests for the NF10 driver core, run against a heap-backed DMA platform and a scripted device.

extern crate std;

mod nic;

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::BTreeMap,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    vec::Vec,
};
use alloc::sync::Arc;
use spin::Mutex;
use nic_buffers::{DmaDirection, DmaError, DmaPlatform, MappedRegion, PhysicalAddress, ReceiveBuffer, ChecksumStatus};
use network_interface_card::PacketSink;

use crate::{
    config::{DoorbellBackoff, Nf10Config},
    port::Port,
    wire::{DoorbellCompletion, Instruction, Opcode, RxCompletion, TxCompletion},
    DeviceWindows, Nf10Nic,
};


/// Hands out zeroed heap memory whose "physical" address is its virtual address,
/// and keeps track of every allocation and mapping so tests can detect leaks and double unmaps.
#[derive(Default)]
pub struct MockPlatform {
    allocations: Mutex<BTreeMap<usize, Layout>>,
    mappings: Mutex<BTreeMap<u64, (usize, DmaDirection)>>,
    pub fail_allocations: AtomicBool,
    pub fail_maps: AtomicBool,
}

impl MockPlatform {
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().len()
    }

    pub fn live_mappings(&self) -> usize {
        self.mappings.lock().len()
    }

    pub fn is_allocated(&self, addr: u64) -> bool {
        self.allocations.lock().contains_key(&(addr as usize))
    }
}

impl DmaPlatform for MockPlatform {
    fn allocate_dma_buffer(&self, size_in_bytes: usize) -> Result<MappedRegion, DmaError> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(DmaError::AllocationFailed);
        }
        let layout = Layout::from_size_align(size_in_bytes.max(1), 64).map_err(|_| DmaError::AllocationFailed)?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(DmaError::AllocationFailed)?;
        self.allocations.lock().insert(ptr.as_ptr() as usize, layout);
        Ok(unsafe { MappedRegion::new(ptr, PhysicalAddress::new(ptr.as_ptr() as u64), size_in_bytes) })
    }

    fn free_dma_buffer(&self, region: MappedRegion) {
        let addr = region.start_address();
        let layout = self.allocations.lock().remove(&addr)
            .unwrap_or_else(|| panic!("freeing {:#x}, which was never allocated", addr));
        unsafe { dealloc(addr as *mut u8, layout) };
    }

    fn map_for_device(&self, buffer: &[u8], direction: DmaDirection) -> Result<PhysicalAddress, DmaError> {
        if self.fail_maps.load(Ordering::SeqCst) {
            return Err(DmaError::MappingFailed);
        }
        let phys = buffer.as_ptr() as u64;
        if self.mappings.lock().insert(phys, (buffer.len(), direction)).is_some() {
            panic!("{:#x} mapped twice", phys);
        }
        Ok(PhysicalAddress::new(phys))
    }

    fn unmap(&self, phys_addr: PhysicalAddress, size_in_bytes: usize, direction: DmaDirection) {
        match self.mappings.lock().remove(&phys_addr.value()) {
            Some(mapping) => assert_eq!(mapping, (size_in_bytes, direction), "unmap of {:?} doesn't match its mapping", phys_addr),
            None => panic!("unmapping {:?}, which is not mapped", phys_addr),
        }
    }
}


/// Collects every frame handed to the network stack.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<(Vec<u8>, u8, ChecksumStatus)>>,
}

impl PacketSink for RecordingSink {
    fn on_received(&self, frame: ReceiveBuffer, port: u8) {
        self.frames.lock().push((frame.to_vec(), port, frame.checksum()));
    }
}


/// A block of memory standing in for one of the device's BAR windows.
struct Window {
    ptr: *mut u8,
    layout: Layout,
}

impl Window {
    fn new(size: usize) -> Window {
        let layout = Layout::from_size_align(size, 64).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Window { ptr, layout }
    }

    fn region(&self) -> MappedRegion {
        unsafe { MappedRegion::new(NonNull::new(self.ptr).unwrap(), PhysicalAddress::new(self.ptr as u64), self.layout.size()) }
    }

    fn read(&self, word: usize) -> u64 {
        assert!(word * 8 < self.layout.size());
        unsafe { ptr::read_volatile((self.ptr as *const u64).add(word)) }
    }

    fn write(&self, word: usize, value: u64) {
        assert!(word * 8 < self.layout.size());
        unsafe { ptr::write_volatile((self.ptr as *mut u64).add(word), value) }
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

fn host_read(addr: u64) -> u64 {
    unsafe { ptr::read_volatile(addr as *const u64) }
}

fn host_write(addr: u64, value: u64) {
    unsafe { ptr::write_volatile(addr as *mut u64, value) }
}

pub const TX_COMPLETION_RING: usize = 16;
pub const RX_COMPLETION_RING: usize = 18;
pub const TX_INTERRUPT_ENABLE: usize = 25;
pub const RX_INTERRUPT_ENABLE: usize = 26;
pub const RESET: usize = 30;
pub const DOORBELL_COMPLETION_RING: usize = 37;
pub const DOORBELL_INTERRUPT_ENABLE: usize = 39;
pub const TX_COMPLETION_READ_PTR: usize = 40;
pub const DOORBELL_COMPLETION_READ_PTR: usize = 41;
pub const DOORBELL_CONSUMED: usize = 42;

/// Plays the part of the hardware: reads what the driver writes into the device windows
/// and writes completion records into the host rings the driver programmed.
///
/// Must outlive the `Nf10Nic` it was attached to.
pub struct FakeDevice {
    registers: Window,
    doorbell: Window,
    rx_descriptors: Window,
    doorbell_read: AtomicU64,
    doorbell_completion_write: AtomicU64,
    tx_completion_write: AtomicU64,
    rx_next: AtomicU64,
}

impl FakeDevice {
    pub fn new(config: &Nf10Config) -> FakeDevice {
        FakeDevice {
            registers: Window::new(512),
            doorbell: Window::new(config.doorbell_mask as usize + 1),
            rx_descriptors: Window::new(config.rx_descriptor_mask as usize + 1),
            doorbell_read: AtomicU64::new(0),
            doorbell_completion_write: AtomicU64::new(0),
            tx_completion_write: AtomicU64::new(0),
            rx_next: AtomicU64::new(0),
        }
    }

    pub fn windows(&self) -> DeviceWindows {
        DeviceWindows {
            registers: self.registers.region(),
            doorbell: self.doorbell.region(),
            rx_descriptors: self.rx_descriptors.region(),
        }
    }

    pub fn register(&self, word: usize) -> u64 {
        self.registers.read(word)
    }

    pub fn interrupts_enabled(&self) -> bool {
        [TX_INTERRUPT_ENABLE, RX_INTERRUPT_ENABLE, DOORBELL_INTERRUPT_ENABLE].iter().all(|w| self.register(*w) == 1)
    }

    pub fn doorbell_slot(&self, slot: usize) -> [u64; 2] {
        [self.doorbell.read(slot * 8), self.doorbell.read(slot * 8 + 1)]
    }

    /// Reads every instruction written since the last call and reports them consumed.
    pub fn take_instructions(&self) -> Vec<Instruction> {
        let slots = (self.doorbell.layout.size() / 64) as u64;
        let mut slot = self.doorbell_read.load(Ordering::SeqCst);
        let mut instructions = Vec::new();
        while let Some(instruction) = Instruction::decode(self.doorbell_slot(slot as usize)) {
            instructions.push(instruction);
            self.doorbell.write(slot as usize * 8, 0);
            self.doorbell.write(slot as usize * 8 + 1, 0);
            slot = (slot + 1) % slots;
        }
        self.doorbell_read.store(slot, Ordering::SeqCst);
        self.registers.write(DOORBELL_CONSUMED, slot * 64);
        instructions
    }

    /// Consumes and successfully acknowledges every pending instruction.
    pub fn acknowledge_all(&self) -> Vec<Instruction> {
        let instructions = self.take_instructions();
        for instruction in &instructions {
            self.acknowledge(instruction.opcode(), true);
        }
        instructions
    }

    pub fn acknowledge(&self, opcode: Opcode, succeeded: bool) {
        self.raw_doorbell_completion(DoorbellCompletion { opcode: opcode as u8, succeeded }.encode());
    }

    pub fn raw_doorbell_completion(&self, status: u64) {
        let offset = self.advance(DOORBELL_COMPLETION_RING, &self.doorbell_completion_write);
        host_write(self.register(DOORBELL_COMPLETION_RING) + offset, status);
    }

    pub fn complete_tx(&self, class: u32, head: u64) {
        self.raw_tx_completion(TxCompletion { class, head }.encode());
    }

    pub fn raw_tx_completion(&self, status: u64) {
        let offset = self.advance(TX_COMPLETION_RING, &self.tx_completion_write);
        host_write(self.register(TX_COMPLETION_RING) + offset, status);
    }

    /// Returns the next write offset into the completion ring programmed at `ring` and moves past it.
    fn advance(&self, ring: usize, cursor: &AtomicU64) -> u64 {
        let mask = self.register(ring + 1);
        let offset = cursor.load(Ordering::SeqCst);
        cursor.store((offset + 64) & mask, Ordering::SeqCst);
        offset
    }

    pub fn rx_descriptor(&self, slot: usize) -> [u64; 2] {
        [self.rx_descriptors.read(slot * 8), self.rx_descriptors.read(slot * 8 + 1)]
    }

    /// Delivers `frame` into the oldest posted receive buffer and reports it.
    pub fn receive(&self, frame: &[u8], port: Port) {
        let slot = self.rx_next.load(Ordering::SeqCst) as usize;
        let [_, buffer_addr] = self.rx_descriptor(slot);
        assert_ne!(buffer_addr, 0, "no receive buffer posted in slot {}", slot);
        unsafe { ptr::copy_nonoverlapping(frame.as_ptr(), buffer_addr as *mut u8, frame.len()) };
        self.raw_rx_completion(RxCompletion { length: frame.len() as u16, port_bits: port.rx_bits() }.encode());
    }

    pub fn raw_rx_completion(&self, rx_status: u64) {
        let slots = (self.rx_descriptors.layout.size() / 64) as u64;
        let slot = self.rx_next.load(Ordering::SeqCst);
        self.rx_next.store((slot + 1) % slots, Ordering::SeqCst);
        host_write(self.register(RX_COMPLETION_RING) + slot * 64 + 56, rx_status);
    }

    /// The status word of a slot in the completion ring programmed at `ring`.
    pub fn completion_status(&self, ring: usize, slot: u64) -> u64 {
        let word = if ring == RX_COMPLETION_RING { 7 } else { 0 };
        host_read(self.register(ring) + slot * 64 + word * 8)
    }
}


/// A driver attached to a fake device. Fields drop in order, so the driver goes away before the device.
pub struct Harness {
    pub nic: Nf10Nic,
    pub device: FakeDevice,
    pub platform: Arc<MockPlatform>,
    pub sink: Arc<RecordingSink>,
}

/// A doorbell large enough that tests rarely need the device to consume or acknowledge instructions,
/// and a backoff short enough that backpressure shows up immediately.
pub fn test_config() -> Nf10Config {
    Nf10Config {
        doorbell_mask: 0xffff,
        doorbell_backoff: DoorbellBackoff { initial_spins: 1, max_spins: 4, max_attempts: 4 },
        ..Nf10Config::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: Nf10Config) -> Harness {
    let device = FakeDevice::new(&config);
    let platform = Arc::new(MockPlatform::default());
    let sink = Arc::new(RecordingSink::default());
    let nic = Nf10Nic::new(config, device.windows(), platform.clone(), sink.clone()).unwrap();
    Harness { nic, device, platform, sink }
}

/// A minimum-size frame that the default classifier sends to class 0.
pub fn frame(len: usize) -> Vec<u8> {
    let mut frame = std::vec![0u8; len];
    for (i, byte) in frame.iter_mut().enumerate().skip(2) {
        *byte = i as u8;
    }
    frame
}
