// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Bounded identifier allocation
//!
//! Hands out small integer identifiers from a fixed range, always the
//! lowest free one, so a released id is the next one handed out again.
//! DIF addresses come from an [`AddressPool`], which tracks free ranges
//! instead of single ids.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bitmap allocator over `[offset, offset + capacity)`
#[derive(Debug, Clone)]
pub struct IdAllocator {
    offset: u64,
    words: Vec<u64>,
    capacity: usize,
    used: usize,
}

impl IdAllocator {
    /// Creates an allocator for `capacity` ids starting at `offset`
    pub fn new(capacity: usize, offset: u64) -> Self {
        Self {
            offset,
            words: vec![0; capacity.div_ceil(64)],
            capacity,
            used: 0,
        }
    }

    /// Allocates the lowest free id, or `None` when depleted
    pub fn allocate(&mut self) -> Option<u64> {
        if self.used == self.capacity {
            return None;
        }

        for (i, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let idx = i * 64 + bit;
            if idx >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(self.offset + idx as u64);
        }

        None
    }

    /// Releases an id; returns false if it was not allocated
    pub fn release(&mut self, id: u64) -> bool {
        let Some(idx) = self.index(id) else {
            return false;
        };
        let (word, bit) = (idx / 64, idx % 64);
        if self.words[word] & (1 << bit) == 0 {
            return false;
        }
        self.words[word] &= !(1 << bit);
        self.used -= 1;
        true
    }

    /// Number of allocated ids
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total number of ids
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index(&self, id: u64) -> Option<usize> {
        let idx = id.checked_sub(self.offset)?;
        (idx < self.capacity as u64).then_some(idx as usize)
    }
}

/// Inclusive range of DIF addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub first: u64,
    pub last: u64,
}

impl AddressRange {
    pub fn contains(&self, address: u64) -> bool {
        (self.first..=self.last).contains(&address)
    }

    /// Number of addresses, saturating for the full `u64` range
    pub fn count(&self) -> u64 {
        (self.last - self.first).saturating_add(1)
    }
}

/// Pool of DIF addresses handed out during enrollment
///
/// Free addresses are kept as disjoint, non-adjacent ranges, so the pool
/// costs the same whatever its size.
#[derive(Debug, Clone)]
pub struct AddressPool {
    bounds: Option<AddressRange>,
    /// First address of each free range mapped to its last one
    free: BTreeMap<u64, u64>,
}

impl AddressPool {
    /// Creates a pool covering `first..=last`; empty if `first > last`
    pub fn new(first: u64, last: u64) -> Self {
        let bounds = (first <= last).then_some(AddressRange { first, last });
        Self {
            bounds,
            free: bounds.map(|r| (r.first, r.last)).into_iter().collect(),
        }
    }

    /// Addresses this pool manages, free or not
    pub fn bounds(&self) -> Option<AddressRange> {
        self.bounds
    }

    /// Takes the lowest free address
    pub fn allocate(&mut self) -> Option<u64> {
        let (first, last) = self.free.pop_first()?;
        if first < last {
            self.free.insert(first + 1, last);
        }
        Some(first)
    }

    /// Gives away the upper half of the highest free range
    ///
    /// A range of one address is never split. The returned range can seed
    /// the pool of another IPCP.
    pub fn split(&mut self) -> Option<AddressRange> {
        let (&first, &last) = self.free.last_key_value()?;
        if first == last {
            return None;
        }

        let mid = first + (last - first) / 2;
        self.free.insert(first, mid);
        Some(AddressRange { first: mid + 1, last })
    }

    /// Returns an address to the pool
    pub fn release(&mut self, address: u64) -> bool {
        self.release_range(AddressRange {
            first: address,
            last: address,
        })
    }

    /// Returns a range to the pool; false if any of it lies outside the
    /// pool or is already free
    pub fn release_range(&mut self, range: AddressRange) -> bool {
        let Some(bounds) = self.bounds else {
            return false;
        };
        if range.first > range.last || !bounds.contains(range.first) || !bounds.contains(range.last) {
            return false;
        }
        let overlaps = self
            .free
            .range(..=range.last)
            .next_back()
            .is_some_and(|(_, &last)| last >= range.first);
        if overlaps {
            return false;
        }

        let (mut first, mut last) = (range.first, range.last);
        let adjacent = self
            .free
            .range(..first)
            .next_back()
            .filter(|&(_, &prev_last)| prev_last + 1 == first)
            .map(|(&prev_first, _)| prev_first);
        if let Some(prev_first) = adjacent {
            self.free.remove(&prev_first);
            first = prev_first;
        }
        if let Some(next_last) = last.checked_add(1).and_then(|next| self.free.remove(&next)) {
            last = next_last;
        }

        self.free.insert(first, last);
        true
    }

    /// Number of addresses still available, saturating
    pub fn available(&self) -> u64 {
        self.free
            .iter()
            .map(|(&first, &last)| AddressRange { first, last }.count())
            .fold(0, u64::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allocate_lowest_first() {
        let mut ids = IdAllocator::new(4, 0);
        assert_eq!(ids.allocate(), Some(0));
        assert_eq!(ids.allocate(), Some(1));
        assert!(ids.release(0));
        assert_eq!(ids.allocate(), Some(0));
    }

    #[test]
    fn test_depletion() {
        let mut ids = IdAllocator::new(2, 10);
        assert_eq!(ids.allocate(), Some(10));
        assert_eq!(ids.allocate(), Some(11));
        assert_eq!(ids.allocate(), None);
        assert_eq!(ids.used(), 2);
    }

    #[test]
    fn test_release_rejects_unknown() {
        let mut ids = IdAllocator::new(8, 0);
        assert!(!ids.release(3));
        assert!(!ids.release(100));
        ids.allocate();
        assert!(ids.release(0));
        assert!(!ids.release(0));
    }

    #[test]
    fn test_capacity_spanning_words() {
        let mut ids = IdAllocator::new(130, 0);
        for expected in 0..130 {
            assert_eq!(ids.allocate(), Some(expected));
        }
        assert_eq!(ids.allocate(), None);
        assert!(ids.release(64));
        assert_eq!(ids.allocate(), Some(64));
    }

    #[test]
    fn test_address_pool() {
        let mut pool = AddressPool::new(2000, 2001);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocate(), Some(2000));
        assert_eq!(pool.allocate(), Some(2001));
        assert_eq!(pool.allocate(), None);
        assert!(pool.release(2000));
        assert!(!pool.release(2000));
        assert!(!pool.release(1999));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.allocate(), Some(2000));
    }

    #[test]
    fn test_address_pool_spanning_whole_space() {
        let mut pool = AddressPool::new(2, u64::MAX);
        assert_eq!(pool.available(), u64::MAX - 1);
        assert_eq!(pool.allocate(), Some(2));
        assert!(!pool.release(u64::MAX - 5));

        let delegated = pool.split().unwrap();
        assert_eq!(delegated.last, u64::MAX);
        assert!(pool.release_range(delegated));
        assert_eq!(pool.available(), u64::MAX - 2);
    }

    #[test]
    fn test_empty_address_pool() {
        let mut pool = AddressPool::new(5, 4);
        assert_eq!(pool.bounds(), None);
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.split(), None);
        assert!(!pool.release(4));
    }

    #[test]
    fn test_split_gives_upper_half() {
        let mut pool = AddressPool::new(2, 254);
        assert_eq!(pool.allocate(), Some(2));

        let delegated = pool.split().unwrap();
        assert_eq!(delegated, AddressRange { first: 129, last: 254 });
        assert_eq!(pool.available(), 126);
        assert_eq!(pool.allocate(), Some(3));

        // A single address stays with its owner
        let mut pool = AddressPool::new(7, 7);
        assert_eq!(pool.split(), None);
        assert_eq!(pool.allocate(), Some(7));
    }

    #[test]
    fn test_released_ranges_coalesce() {
        let mut pool = AddressPool::new(10, 19);
        let upper = pool.split().unwrap();
        assert_eq!(upper, AddressRange { first: 15, last: 19 });
        for expected in 10..15 {
            assert_eq!(pool.allocate(), Some(expected));
        }
        assert_eq!(pool.allocate(), None);

        assert!(pool.release(14));
        assert!(pool.release_range(upper));
        assert!(!pool.release_range(AddressRange { first: 16, last: 17 }));
        assert_eq!(pool.available(), 6);
        assert_eq!(pool.split(), Some(AddressRange { first: 17, last: 19 }));
    }

    proptest! {
        #[test]
        fn prop_allocated_ids_are_distinct(capacity in 1usize..200, ops in prop::collection::vec(any::<bool>(), 0..400)) {
            let mut ids = IdAllocator::new(capacity, 0);
            let mut held: Vec<u64> = Vec::new();

            for alloc in ops {
                if alloc || held.is_empty() {
                    match ids.allocate() {
                        Some(id) => {
                            prop_assert!(!held.contains(&id));
                            prop_assert!(id < capacity as u64);
                            held.push(id);
                        }
                        None => prop_assert_eq!(held.len(), capacity),
                    }
                } else {
                    let id = held.remove(0);
                    prop_assert!(ids.release(id));
                }
                prop_assert_eq!(ids.used(), held.len());
            }
        }

        #[test]
        fn prop_addresses_are_distinct(first in 0u64..1000, len in 1u64..300, ops in prop::collection::vec(0u8..3, 0..400)) {
            let last = first + len - 1;
            let mut pool = AddressPool::new(first, last);
            let mut held: Vec<u64> = Vec::new();
            let mut lent: Vec<AddressRange> = Vec::new();

            for op in ops {
                match op {
                    0 => {
                        if let Some(address) = pool.allocate() {
                            prop_assert!(first <= address && address <= last);
                            prop_assert!(!held.contains(&address));
                            prop_assert!(!lent.iter().any(|r| r.contains(address)));
                            held.push(address);
                        }
                    }
                    1 => {
                        if let Some(range) = pool.split() {
                            prop_assert!(!held.iter().any(|a| range.contains(*a)));
                            lent.push(range);
                        }
                    }
                    _ => {
                        if let Some(address) = held.pop() {
                            prop_assert!(pool.release(address));
                        } else if let Some(range) = lent.pop() {
                            prop_assert!(pool.release_range(range));
                        }
                    }
                }
                let out = held.len() as u64 + lent.iter().map(AddressRange::count).sum::<u64>();
                prop_assert_eq!(pool.available() + out, len);
            }
        }
    }
}
