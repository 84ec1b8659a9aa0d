//! Defines buffers that are used to send and receive packets,
//! as well as the physically-contiguous memory regions that a NIC shares with its driver.
//!
//! Memory that the device reads or writes on its own (descriptor buffers, completion rings,
//! register windows) is handed to the driver as a [`MappedRegion`] by a [`DmaPlatform`].
//! Drivers overlay `#[repr(C)]` structures that derive [`FromBytes`] onto a region with
//! [`MappedRegion::as_type_mut()`] or [`MappedRegion::as_slice_mut()`], usually keeping the region
//! and the typed view together in an `owning_ref::BoxRefMut`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;


use core::{
    fmt,
    mem::{align_of, size_of},
    ops::{Add, Deref, DerefMut},
    ptr::NonNull,
    slice,
};
use alloc::{boxed::Box, vec::Vec};
use zerocopy::FromBytes;


/// An address in the device's view of physical memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> PhysicalAddress {
        PhysicalAddress(addr)
    }

    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Rounds this address down to a multiple of `align`, which must be a power of two.
    pub const fn align_down(&self, align: u64) -> PhysicalAddress {
        PhysicalAddress(self.0 & !(align - 1))
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = PhysicalAddress;
    fn add(self, rhs: u64) -> PhysicalAddress {
        PhysicalAddress(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}
impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
impl fmt::UpperHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}


/// A virtually-contiguous region of memory that is also contiguous in the device's physical
/// address space, such as a DMA allocation or a mapped device BAR.
///
/// A `MappedRegion` does not free its memory when dropped;
/// DMA allocations must be returned with [`DmaPlatform::free_dma_buffer()`].
pub struct MappedRegion {
    virt: NonNull<u8>,
    phys: PhysicalAddress,
    size_in_bytes: usize,
}

// The region is uniquely owned; all access to its memory goes through `&self`/`&mut self`.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Wraps `size_in_bytes` of memory starting at `virt`, which the device sees at `phys`.
    ///
    /// # Safety
    /// The memory must remain valid and must not be accessed through any other path
    /// (except by the device itself) for as long as the returned region exists.
    pub unsafe fn new(virt: NonNull<u8>, phys: PhysicalAddress, size_in_bytes: usize) -> MappedRegion {
        MappedRegion { virt, phys, size_in_bytes }
    }

    /// Returns the virtual address where this region begins.
    pub fn start_address(&self) -> usize {
        self.virt.as_ptr() as usize
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    /// Checks that `length` values of type `T` fit in this region at `byte_offset`
    /// and that they would be properly aligned there.
    fn check_bounds<T>(&self, byte_offset: usize, length: usize) -> Result<(), &'static str> {
        let end = size_of::<T>().checked_mul(length)
            .and_then(|size| size.checked_add(byte_offset))
            .ok_or("MappedRegion: requested size overflowed")?;
        if end > self.size_in_bytes {
            return Err("MappedRegion: requested type and offset would not fit within the region");
        }
        if (self.start_address() + byte_offset) % align_of::<T>() != 0 {
            return Err("MappedRegion: requested type and offset would be misaligned");
        }
        Ok(())
    }

    /// Returns a reference to the `T` at `byte_offset` within this region.
    pub fn as_type<T: FromBytes>(&self, byte_offset: usize) -> Result<&T, &'static str> {
        self.check_bounds::<T>(byte_offset, 1)?;
        Ok(unsafe { &*(self.virt.as_ptr().add(byte_offset) as *const T) })
    }

    /// Returns a mutable reference to the `T` at `byte_offset` within this region.
    pub fn as_type_mut<T: FromBytes>(&mut self, byte_offset: usize) -> Result<&mut T, &'static str> {
        self.check_bounds::<T>(byte_offset, 1)?;
        Ok(unsafe { &mut *(self.virt.as_ptr().add(byte_offset) as *mut T) })
    }

    /// Returns a slice of `length` values of type `T` starting at `byte_offset` within this region.
    pub fn as_slice<T: FromBytes>(&self, byte_offset: usize, length: usize) -> Result<&[T], &'static str> {
        self.check_bounds::<T>(byte_offset, length)?;
        Ok(unsafe { slice::from_raw_parts(self.virt.as_ptr().add(byte_offset) as *const T, length) })
    }

    /// Returns a mutable slice of `length` values of type `T` starting at `byte_offset` within this region.
    pub fn as_slice_mut<T: FromBytes>(&mut self, byte_offset: usize, length: usize) -> Result<&mut [T], &'static str> {
        self.check_bounds::<T>(byte_offset, length)?;
        Ok(unsafe { slice::from_raw_parts_mut(self.virt.as_ptr().add(byte_offset) as *mut T, length) })
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("virt", &format_args!("{:#X}", self.start_address()))
            .field("phys", &self.phys)
            .field("size_in_bytes", &self.size_in_bytes)
            .finish()
    }
}


/// The direction of a DMA transfer, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads the buffer, e.g., a packet being transmitted.
    ToDevice,
    /// The device writes the buffer, e.g., a packet being received.
    FromDevice,
}

/// Possible reasons for failure of a [`DmaPlatform`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No physically-contiguous memory of the requested size was available
    AllocationFailed,
    /// The buffer could not be made visible to the device
    MappingFailed,
}

impl From<DmaError> for &'static str {
    fn from(error: DmaError) -> Self {
        match error {
            DmaError::AllocationFailed => "Failed to allocate DMA-capable memory",
            DmaError::MappingFailed => "Failed to map a buffer for device access",
        }
    }
}

/// The memory services a NIC driver needs from the platform it runs on.
pub trait DmaPlatform: Send + Sync {
    /// Allocates `size_in_bytes` of zeroed, physically-contiguous memory that the device can access.
    fn allocate_dma_buffer(&self, size_in_bytes: usize) -> Result<MappedRegion, DmaError>;

    /// Returns memory obtained from [`DmaPlatform::allocate_dma_buffer()`].
    fn free_dma_buffer(&self, region: MappedRegion);

    /// Makes `buffer` accessible to the device and returns the address the device must use for it.
    fn map_for_device(&self, buffer: &[u8], direction: DmaDirection) -> Result<PhysicalAddress, DmaError>;

    /// Tears down a mapping established by [`DmaPlatform::map_for_device()`].
    fn unmap(&self, phys_addr: PhysicalAddress, size_in_bytes: usize, direction: DmaDirection);
}


/// A buffer that stores a packet to be transmitted through the NIC.
/// Auto-dereferences into a byte slice covering its current length.
///
/// The buffer becomes device-visible only while a transmit descriptor references it;
/// the driver maps it right before posting and unmaps it once the device reports completion.
pub struct TransmitBuffer {
    data: Box<[u8]>,
    length: u16,
}

impl TransmitBuffer {
    /// Creates a TransmitBuffer that holds a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<TransmitBuffer, &'static str> {
        let length = u16::try_from(bytes.len())
            .map_err(|_| "TransmitBuffer::from_slice(): packet is larger than a transmit buffer")?;
        Ok(TransmitBuffer { data: Box::from(bytes), length })
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if usize::from(length) > self.data.len() {
            Err("TransmitBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl Deref for TransmitBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..usize::from(self.length)]
    }
}

impl DerefMut for TransmitBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..usize::from(self.length)]
    }
}

impl fmt::Debug for TransmitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TransmitBuffer").field("length", &self.length).finish()
    }
}


/// How much of a received frame's checksum the device has already verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// Nothing was verified; the network stack must check every checksum itself.
    Unverified,
    /// The device verified the checksums.
    Verified,
}

/// A buffer that stores a packet that has been received from the NIC.
///
/// The device writes into [`ReceiveBuffer::device_area()`], which starts a few bytes of headroom
/// into the allocation so that the IP header following the Ethernet header ends up aligned.
/// Auto-dereferences into a byte slice covering the received frame.
pub struct ReceiveBuffer {
    data: Box<[u8]>,
    headroom: usize,
    capacity: u16,
    length: u16,
    checksum: ChecksumStatus,
}

impl ReceiveBuffer {
    /// Allocates a zeroed receive buffer that the device may fill with up to `capacity` bytes,
    /// placed `headroom` bytes into the allocation.
    ///
    /// Returns an error instead of aborting if the heap cannot satisfy the allocation.
    pub fn try_new(capacity: u16, headroom: usize) -> Result<ReceiveBuffer, &'static str> {
        let total = headroom + usize::from(capacity);
        let mut data = Vec::new();
        if data.try_reserve_exact(total).is_err() {
            error!("ReceiveBuffer::try_new(): couldn't allocate {} bytes", total);
            return Err("ReceiveBuffer::try_new(): out of memory");
        }
        data.resize(total, 0u8);
        Ok(ReceiveBuffer {
            data: data.into_boxed_slice(),
            headroom,
            capacity,
            length: 0,
            checksum: ChecksumStatus::Unverified,
        })
    }

    /// The bytes that the device is allowed to write into.
    pub fn device_area(&self) -> &[u8] {
        &self.data[self.headroom..]
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    /// Sets the buffer's length, i.e., how many bytes the device has written.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if length > self.capacity {
            Err("ReceiveBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }

    pub fn checksum(&self) -> ChecksumStatus {
        self.checksum
    }

    pub fn set_checksum(&mut self, status: ChecksumStatus) {
        self.checksum = status;
    }
}

impl Deref for ReceiveBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[self.headroom..self.headroom + usize::from(self.length)]
    }
}

impl DerefMut for ReceiveBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let start = self.headroom;
        &mut self.data[start..start + usize::from(self.length)]
    }
}

impl fmt::Debug for ReceiveBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReceiveBuffer")
            .field("length", &self.length)
            .field("capacity", &self.capacity)
            .field("checksum", &self.checksum)
            .finish()
    }
}
