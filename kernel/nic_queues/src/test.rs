//! Tests for `DescriptorRing` reservation and release accounting.

use super::*;
use proptest::prelude::*;

#[test]
fn rejects_bad_geometry() {
    assert!(DescriptorRing::new(0x7fe).is_err());
    assert!(DescriptorRing::new(0x1f).is_err());
    assert!(DescriptorRing::new(u64::MAX).is_err());
    let ring = DescriptorRing::new(0x7ff).unwrap();
    assert_eq!(ring.cluster_size(), 32);
    assert_eq!(ring.capacity(), 0x800);
}

#[test]
fn reserve_until_full() {
    let ring = DescriptorRing::new(0xff).unwrap();
    assert_eq!(ring.reserve(1), Some(0));
    assert_eq!(ring.reserve(2), Some(64));
    assert_eq!(ring.reserve(2), None);
    assert_eq!(ring.reserve(1), Some(192));
    assert_eq!(ring.reserve(1), None);
    assert_eq!(ring.outstanding(), 4);
    assert_eq!(ring.write_ptr(), 0);
}

#[test]
fn release_advances_read_pointer() {
    let ring = DescriptorRing::new(0xff).unwrap();
    ring.reserve(3).unwrap();
    ring.release(2).unwrap();
    assert_eq!(ring.read_ptr(), 128);
    assert_eq!(ring.outstanding(), 1);
    assert_eq!(ring.free_slots(), 3);
    assert!(ring.release(2).is_err());
    assert_eq!(ring.read_ptr(), 128);
    assert_eq!(ring.outstanding(), 1);
}

#[test]
fn multi_slot_reservations_wrap() {
    // an RX packet region hands out 24-slot chunks
    let ring = DescriptorRing::new(0x7fff).unwrap();
    let mut offsets = Vec::new();
    while let Some(offset) = ring.reserve(24) {
        offsets.push(offset);
    }
    assert_eq!(offsets.len(), 21);
    ring.release(24).unwrap();
    assert_eq!(ring.reserve(24), Some((21 * 24 * 64) & 0x7fff));
}

#[test]
fn unreserve_rewinds_write_pointer() {
    let ring = DescriptorRing::new(0xff).unwrap();
    ring.reserve(1).unwrap();
    assert_eq!(ring.reserve(1), Some(64));
    ring.unreserve(1).unwrap();
    assert_eq!(ring.write_ptr(), 64);
    assert_eq!(ring.outstanding(), 1);
    assert!(ring.unreserve(2).is_err());
}

#[test]
fn consume_wraps() {
    let ring = DescriptorRing::new(0x7f).unwrap();
    assert_eq!(ring.consume(), 0);
    assert_eq!(ring.consume(), 64);
    assert_eq!(ring.read_ptr(), 0);
    assert_eq!(ring.outstanding(), 0);
}

#[test]
fn distance_wraps() {
    let ring = DescriptorRing::new(0xff).unwrap();
    assert_eq!(ring.distance(192, 64), 2);
    assert_eq!(ring.distance(64, 64), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Reserve(u64),
    Release(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..40).prop_map(Op::Reserve),
        (0u64..40).prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn outstanding_stays_within_cluster_size(mask_bits in 6u32..12, ops in prop::collection::vec(op(), 0..200)) {
        let ring = DescriptorRing::new((1u64 << mask_bits) - 1).unwrap();
        let mut model: u64 = 0;
        for op in ops {
            match op {
                Op::Reserve(n) => {
                    let result = ring.reserve(n);
                    prop_assert_eq!(result.is_some(), model + n <= ring.cluster_size());
                    if result.is_some() {
                        model += n;
                    }
                }
                Op::Release(n) => {
                    let result = ring.release(n);
                    prop_assert_eq!(result.is_ok(), n <= model);
                    if result.is_ok() {
                        model -= n;
                    }
                }
            }
            prop_assert_eq!(ring.outstanding(), model);
            prop_assert!(ring.outstanding() <= ring.cluster_size());
            prop_assert_eq!(ring.write_ptr() % SLOT_SIZE, 0);
            prop_assert_eq!(ring.read_ptr() % SLOT_SIZE, 0);
            prop_assert!(ring.write_ptr() <= ring.mask());
            prop_assert_eq!(ring.distance(ring.read_ptr(), ring.write_ptr()), model % ring.cluster_size());
        }
    }
}
