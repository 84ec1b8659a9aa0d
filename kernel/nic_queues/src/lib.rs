//! Circular-index bookkeeping for the rings a NIC driver shares with its device.
//!
//! A [`DescriptorRing`] knows nothing about what is stored in the ring;
//! it only tracks byte offsets into a power-of-two sized region that is divided into 64-byte slots.
//! The same type is used for descriptor rings the host produces into,
//! completion rings the host consumes from, and byte regions carved up in multi-slot chunks.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate log;

#[cfg(test)]
mod test;

use core::sync::atomic::{AtomicU64, Ordering};

/// The size in bytes of one ring slot. Every ring offset is a multiple of this.
pub const SLOT_SIZE: u64 = 64;


/// The producer/consumer state of one circular ring.
///
/// `mask + 1` is the capacity of the ring in bytes, which is always a power of two,
/// and `cluster_size` is the number of 64-byte slots in it.
/// Both pointers are byte offsets that are always slot-aligned and within `mask`,
/// and `outstanding` (the number of reserved but not yet released slots) never exceeds `cluster_size`.
///
/// The producer advances `write_ptr` through [`DescriptorRing::reserve()`];
/// the consumer (usually the completion path) advances `read_ptr` through [`DescriptorRing::release()`].
#[derive(Debug)]
pub struct DescriptorRing {
    write_ptr: AtomicU64,
    read_ptr: AtomicU64,
    outstanding: AtomicU64,
    mask: u64,
    cluster_size: u64,
}

impl DescriptorRing {
    /// Creates an empty ring whose byte capacity is `mask + 1`.
    ///
    /// Returns an error if the capacity is not a power of two or cannot hold a single slot.
    pub fn new(mask: u64) -> Result<DescriptorRing, &'static str> {
        let capacity = mask.checked_add(1).ok_or("DescriptorRing::new(): mask is too large")?;
        if !capacity.is_power_of_two() {
            return Err("DescriptorRing::new(): capacity must be a power of two");
        }
        if capacity < SLOT_SIZE {
            return Err("DescriptorRing::new(): capacity must be at least one slot");
        }
        Ok(DescriptorRing {
            write_ptr: AtomicU64::new(0),
            read_ptr: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
            mask,
            cluster_size: capacity / SLOT_SIZE,
        })
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// The capacity of this ring in bytes.
    pub fn capacity(&self) -> u64 {
        self.mask + 1
    }

    /// The number of slots in this ring.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn write_ptr(&self) -> u64 {
        self.write_ptr.load(Ordering::Acquire)
    }

    pub fn read_ptr(&self) -> u64 {
        self.read_ptr.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// The number of slots that can currently be reserved.
    pub fn free_slots(&self) -> u64 {
        self.cluster_size - self.outstanding()
    }

    /// Converts a ring byte offset into a slot index.
    pub fn slot_index(offset: u64) -> usize {
        (offset / SLOT_SIZE) as usize
    }

    /// The number of slots from offset `from` forward to offset `to`, wrapping around the ring.
    pub fn distance(&self, from: u64, to: u64) -> u64 {
        (to.wrapping_sub(from) & self.mask) / SLOT_SIZE
    }

    /// Reserves `n_slots` consecutive slots, returning the byte offset of the first one.
    ///
    /// Succeeds only if `outstanding + n_slots <= cluster_size`,
    /// in which case `outstanding` grows by `n_slots` and `write_ptr` advances past the reserved slots.
    pub fn reserve(&self, n_slots: u64) -> Option<u64> {
        let cluster_size = self.cluster_size;
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |outstanding| {
                outstanding.checked_add(n_slots).filter(|total| *total <= cluster_size)
            })
            .ok()?;
        Some(self.advance(&self.write_ptr, n_slots))
    }

    /// Gives back the `n_slots` most recently reserved slots, rewinding `write_ptr`.
    ///
    /// Only valid while the caller still has exclusive producer access,
    /// i.e., no other reservation can have happened since the one being undone.
    pub fn unreserve(&self, n_slots: u64) -> Result<(), &'static str> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |outstanding| outstanding.checked_sub(n_slots))
            .map_err(|_| "DescriptorRing::unreserve(): more slots than are outstanding")?;
        let mask = self.mask;
        let _ = self.write_ptr.fetch_update(Ordering::AcqRel, Ordering::Acquire, |ptr| {
            Some(ptr.wrapping_sub(n_slots * SLOT_SIZE) & mask)
        });
        Ok(())
    }

    /// Releases the `n_slots` oldest outstanding slots, advancing `read_ptr` past them.
    ///
    /// Returns an error, and changes nothing, if fewer than `n_slots` are outstanding.
    pub fn release(&self, n_slots: u64) -> Result<(), &'static str> {
        if let Err(outstanding) = self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |outstanding| outstanding.checked_sub(n_slots))
        {
            warn!("DescriptorRing::release(): releasing {} slots, but only {} are outstanding", n_slots, outstanding);
            return Err("DescriptorRing::release(): more slots than are outstanding");
        }
        self.advance(&self.read_ptr, n_slots);
        Ok(())
    }

    /// Advances `read_ptr` by one slot without any reservation accounting,
    /// returning the offset of the slot that was passed over.
    ///
    /// This is how the host consumes a ring that only the device produces into.
    pub fn consume(&self) -> u64 {
        self.advance(&self.read_ptr, 1)
    }

    fn advance(&self, ptr: &AtomicU64, n_slots: u64) -> u64 {
        let mask = self.mask;
        match ptr.fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
            Some(p.wrapping_add(n_slots * SLOT_SIZE) & mask)
        }) {
            Ok(previous) | Err(previous) => previous,
        }
    }
}
