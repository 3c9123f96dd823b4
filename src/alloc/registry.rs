//! The table of live blocks.
//!
//! Open addressing with linear probing, keyed by block address. The slot
//! array's length (`capacity`) is always a power of two, so the home slot of
//! an address is `hash & (capacity - 1)`, and it doubles whenever an insert
//! would take the load past one half.
//!
//! Removal empties the slot and then pulls later members of the same probe
//! cluster back into the hole wherever their home slot allows it. That keeps
//! one invariant which everything else relies on:
//!
//! > No record is separated from its home slot by an empty slot.
//!
//! So a probe may stop at the first empty slot it meets: if the record were
//! in the table it would have been found before that point. Since the load is
//! at most one half, there always *is* an empty slot, and a probe that wraps
//! all the way around means the table itself is broken.

use std::{iter::FusedIterator, mem, slice};

use log::debug;
use serde::{Deserialize, Serialize};

use super::{
    error::Fault,
    hash::home_slot,
    site::{Address, CallSite, Operation},
};
use crate::util::hint::cold;

/// The smallest (and starting) number of slots.
pub const INITIAL_CAPACITY: usize = 4;

/// The maximum load is `MAX_LOAD_NUMERATOR / MAX_LOAD_DENOMINATOR`.
pub const MAX_LOAD_NUMERATOR: usize = 1;
pub const MAX_LOAD_DENOMINATOR: usize = 2;

/// Must be a power of two, otherwise the index mask breaks.
pub const GROW_FACTOR: usize = 2;

const _: () = assert!(INITIAL_CAPACITY.is_power_of_two() && GROW_FACTOR.is_power_of_two());

/// One live block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub address: Address,
    /// Size in bytes, as last recorded.
    pub size: usize,
    /// Who asked for the block (or last resized it, depending on
    /// [`Provenance`](crate::Provenance)).
    pub origin: CallSite,
}

type Slot = Option<BlockRecord>;

enum Probe {
    /// The record for the address is in this slot.
    Found(usize),
    /// The address is not in the table; this is where it would go.
    Vacant(usize),
}

/// Walk the probe sequence of `address` from its home slot. `None` means the
/// walk came back to where it started, which the load factor rules out.
fn probe(slots: &[Slot], address: Address) -> Option<Probe> {
    let mask = slots.len() - 1;
    let start = home_slot(address, slots.len());
    let mut index = start;
    loop {
        match &slots[index] {
            None => return Some(Probe::Vacant(index)),
            Some(record) if record.address == address => return Some(Probe::Found(index)),
            Some(_) => {}
        }
        index = (index + 1) & mask;
        if index == start {
            return None;
        }
    }
}

fn empty_slots(capacity: usize) -> Option<Box<[Slot]>> {
    let mut slots = Vec::new();
    slots.try_reserve_exact(capacity).ok()?;
    slots.resize_with(capacity, || None);
    Some(slots.into_boxed_slice())
}

/// Live block address -> [`BlockRecord`].
#[derive(Debug)]
pub struct Registry {
    slots: Box<[Slot]>,
    count: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: (0..INITIAL_CAPACITY).map(|_| None).collect(),
            count: 0,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots. Only ever grows.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn needs_growth(&self) -> bool {
        self.count * MAX_LOAD_DENOMINATOR >= self.capacity() * MAX_LOAD_NUMERATOR
    }

    /// Track a new block, returning the stored record.
    ///
    /// # Errors
    ///
    /// - [`Fault::DuplicateKey`] if `record.address` is already tracked. The
    ///   table is left as it was (apart from a growth, which is invisible).
    /// - [`Fault::ResourceExhausted`] if a growth was due and the bigger slot
    ///   array could not be allocated.
    /// - [`Fault::ProbeExhausted`] if no empty slot was found, which means the
    ///   table is broken.
    pub fn insert(&mut self, record: BlockRecord, op: Operation) -> Result<&BlockRecord, Fault> {
        if self.needs_growth() {
            self.grow(op, &record.origin)?;
        }
        match probe(&self.slots, record.address) {
            Some(Probe::Vacant(index)) => {
                self.count += 1;
                Ok(self.slots[index].insert(record))
            }
            Some(Probe::Found(index)) => Err(cold(|| Fault::DuplicateKey {
                op,
                address: record.address,
                existing: self.record_at(index).origin.clone(),
                site: record.origin,
            })),
            None => Err(cold(|| Fault::ProbeExhausted {
                address: record.address,
                capacity: self.capacity(),
            })),
        }
    }

    /// Double the slot array and re-place every record by its hash in the
    /// bigger one. The old array is only replaced once the new one is fully
    /// built.
    fn grow(&mut self, op: Operation, site: &CallSite) -> Result<(), Fault> {
        let old_capacity = self.capacity();
        let new_capacity = old_capacity.checked_mul(GROW_FACTOR);
        let Some(mut fresh) = new_capacity.and_then(empty_slots) else {
            return Err(cold(|| Fault::ResourceExhausted {
                op,
                requested: old_capacity.saturating_mul(GROW_FACTOR * mem::size_of::<Slot>()),
                site: site.clone(),
            }));
        };

        // Copies, so a failure part way leaves `self.slots` untouched
        for record in self.slots.iter().flatten() {
            // Addresses are unique and the new table is at most a quarter
            // full, so the probe always ends on an empty slot.
            match probe(&fresh, record.address) {
                Some(Probe::Vacant(index)) => fresh[index] = Some(record.clone()),
                _ => {
                    return Err(cold(|| Fault::ProbeExhausted {
                        address: record.address,
                        capacity: fresh.len(),
                    }))
                }
            }
        }

        self.slots = fresh;
        debug!(
            "registry grew from {old_capacity} to {} slots ({} live)",
            self.capacity(),
            self.count
        );
        Ok(())
    }

    fn record_at(&self, index: usize) -> &BlockRecord {
        match &self.slots[index] {
            Some(record) => record,
            None => unreachable!("probe reported slot {index} as occupied"),
        }
    }

    /// Find the slot holding `address` and make sure its size is
    /// `expected_size`.
    fn checked_slot(
        &self,
        address: Address,
        expected_size: usize,
        site: &CallSite,
        op: Operation,
    ) -> Result<usize, Fault> {
        let Some(Probe::Found(index)) = probe(&self.slots, address) else {
            return Err(cold(|| Fault::UnknownAddress {
                op,
                address,
                site: site.clone(),
            }));
        };
        let record = self.record_at(index);
        if record.size != expected_size {
            return Err(cold(|| Fault::SizeMismatch {
                op,
                address,
                supplied: expected_size,
                recorded: record.size,
                site: site.clone(),
                origin: record.origin.clone(),
            }));
        }
        Ok(index)
    }

    /// The find half of [`Registry::remove`]: the same checks, no mutation.
    pub fn check(
        &self,
        address: Address,
        expected_size: usize,
        site: &CallSite,
        op: Operation,
    ) -> Result<&BlockRecord, Fault> {
        self.checked_slot(address, expected_size, site, op)
            .map(|index| self.record_at(index))
    }

    /// Stop tracking `address`, which must be tracked with exactly
    /// `expected_size` bytes.
    ///
    /// # Errors
    ///
    /// - [`Fault::UnknownAddress`] if `address` is not tracked (double free,
    ///   or memory that never came from this tracker).
    /// - [`Fault::SizeMismatch`] if it is tracked with a different size. The
    ///   record stays where it is.
    pub fn remove(
        &mut self,
        address: Address,
        expected_size: usize,
        site: &CallSite,
        op: Operation,
    ) -> Result<BlockRecord, Fault> {
        let index = self.checked_slot(address, expected_size, site, op)?;
        Ok(self.remove_at(index))
    }

    /// Empty slot `index`, then close the gap behind it.
    fn remove_at(&mut self, index: usize) -> BlockRecord {
        let removed = match self.slots[index].take() {
            Some(record) => record,
            None => unreachable!("removing empty slot {index}"),
        };
        self.count -= 1;

        let capacity = self.capacity();
        let mask = capacity - 1;
        let mut hole = index;
        let mut next = (index + 1) & mask;
        loop {
            let home = match &self.slots[next] {
                Some(record) => home_slot(record.address, capacity),
                None => break,
            };
            // The record at `next` may fill the hole unless its home slot lies
            // cyclically in (hole, next]; moving it then would put it before
            // its home.
            let from_home = next.wrapping_sub(home) & mask;
            let from_hole = next.wrapping_sub(hole) & mask;
            if from_home >= from_hole {
                self.slots[hole] = self.slots[next].take();
                hole = next;
            }
            next = (next + 1) & mask;
        }

        removed
    }

    pub fn get(&self, address: Address) -> Option<&BlockRecord> {
        match probe(&self.slots, address)? {
            Probe::Found(index) => Some(self.record_at(index)),
            Probe::Vacant(_) => None,
        }
    }

    pub fn contains(&self, address: Address) -> bool {
        self.get(address).is_some()
    }

    /// All live records, in slot order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            slots: self.slots.iter(),
            remaining: self.count,
        }
    }

    /// Take every record out, leaving the table empty at its current
    /// capacity. Records not consumed from the iterator are dropped.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain {
            slots: self.slots.iter_mut(),
            count: &mut self.count,
        }
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = &'a BlockRecord;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Iter<'a> {
    slots: slice::Iter<'a, Slot>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a BlockRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.slots.find_map(Option::as_ref)?;
        self.remaining -= 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}
impl FusedIterator for Iter<'_> {}

/// Keeps the registry's count in step with its slots even if leaked.
pub struct Drain<'a> {
    slots: slice::IterMut<'a, Slot>,
    count: &'a mut usize,
}

impl Iterator for Drain<'_> {
    type Item = BlockRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.slots.find_map(Option::take)?;
        *self.count -= 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (*self.count, Some(*self.count))
    }
}

impl ExactSizeIterator for Drain<'_> {}
impl FusedIterator for Drain<'_> {}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        self.slots.by_ref().for_each(|slot| *slot = None);
        *self.count = 0;
    }
}
