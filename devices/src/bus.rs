//! The address-range map (spec §4.1): an ordered association from
//! half-open `[start, start+length)` intervals to devices, supporting point
//! lookup in O(log n). Generalized from `original_source/AddressRange.hpp`,
//! which relies on the same "two ranges compare equal iff they overlap"
//! trick to make `std::map::find` double as an interval lookup.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DeviceError;
use crate::error::Result;
use crate::pio::PioDevice;

/// A half-open `[start, start + length)` guest address interval.
#[derive(Debug, Clone, Copy)]
pub struct AddressRange {
    pub start: u64,
    pub length: u64,
}

impl AddressRange {
    pub fn new(start: u64, length: u64) -> AddressRange {
        AddressRange { start, length }
    }

    /// A single-address range, used to query the map for the range that
    /// contains `addr`.
    pub fn point(addr: u64) -> AddressRange {
        AddressRange {
            start: addr,
            length: 1,
        }
    }

    fn last(&self) -> u64 {
        self.start + self.length - 1
    }

    fn overlaps(&self, other: &AddressRange) -> bool {
        self.start <= other.last() && other.start <= self.last()
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.length
    }
}

// Two ranges are "equal" for ordering purposes iff they overlap; this is
// the invariant that makes a point query against the map resolve to the
// unique owning range. It only gives a consistent total order as long as no
// two *stored* ranges overlap each other, which `Bus::insert` enforces.
impl PartialEq for AddressRange {
    fn eq(&self, other: &Self) -> bool {
        self.overlaps(other)
    }
}
impl Eq for AddressRange {}

impl PartialOrd for AddressRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AddressRange {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.overlaps(other) {
            Ordering::Equal
        } else {
            self.start.cmp(&other.start)
        }
    }
}

pub type SharedDevice = Arc<Mutex<dyn PioDevice>>;

/// The guest port-I/O / MMIO routing table. A device may be registered
/// under more than one range (e.g. each chip-select unit gets its own
/// range even though they share one implementation type); a single device
/// instance may also be shared across ranges by registering the same
/// `Arc` twice.
#[derive(Default)]
pub struct Bus {
    devices: BTreeMap<AddressRange, SharedDevice>,
}

impl Bus {
    pub fn new() -> Bus {
        Bus {
            devices: BTreeMap::new(),
        }
    }

    /// Registers `device` for `range`. Rejects the insert if `range`
    /// overlaps any range already present (spec §3 invariant).
    pub fn insert(&mut self, range: AddressRange, device: SharedDevice) -> Result<()> {
        if self.devices.contains_key(&range) {
            return Err(DeviceError::OverlappingRange);
        }
        self.devices.insert(range, device);
        Ok(())
    }

    /// Finds the device whose registered range contains `addr`, along with
    /// the offset of `addr` within that range.
    pub fn find(&self, addr: u64) -> Option<(u64, SharedDevice)> {
        let key = AddressRange::point(addr);
        self.devices.iter().find_map(|(range, device)| {
            if *range == key {
                Some((addr - range.start, device.clone()))
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Dummy;
    impl PioDevice for Dummy {}

    fn dummy() -> SharedDevice {
        Arc::new(Mutex::new(Dummy))
    }

    #[test]
    fn non_overlapping_ranges_are_distinct() {
        let mut bus = Bus::new();
        bus.insert(AddressRange::new(0x3f8, 8), dummy()).unwrap();
        bus.insert(AddressRange::new(0x2f8, 8), dummy()).unwrap();
        assert!(bus.find(0x3f8).is_some());
        assert!(bus.find(0x2f8).is_some());
        assert!(bus.find(0x300).is_none());
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut bus = Bus::new();
        bus.insert(AddressRange::new(0x3f8, 8), dummy()).unwrap();
        let err = bus.insert(AddressRange::new(0x3fa, 4), dummy());
        assert!(matches!(err, Err(DeviceError::OverlappingRange)));
    }

    #[test]
    fn find_reports_offset_within_range() {
        let mut bus = Bus::new();
        bus.insert(AddressRange::new(0x3f8, 8), dummy()).unwrap();
        let (offset, _) = bus.find(0x3fb).unwrap();
        assert_eq!(offset, 3);
    }

    #[test]
    fn every_point_in_range_resolves() {
        let mut bus = Bus::new();
        bus.insert(AddressRange::new(0x100, 16), dummy()).unwrap();
        for addr in 0x100..0x110 {
            assert!(bus.find(addr).is_some());
        }
        assert!(bus.find(0x110).is_none());
        assert!(bus.find(0xff).is_none());
    }
}
