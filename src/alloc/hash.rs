//! Address hashing for the registry.
//!
//! A 64-to-32 bit integer avalanche mix (the `hash6432shift` family). Block
//! addresses share almost all of their high bits and their low 4 bits are
//! usually zero, so an identity hash would pile them into a few slots.

use super::site::Address;

/// Hashes are masked to 30 bits. Table indices are `hash & (capacity - 1)`,
/// so capacities above 2^30 get no extra spread, but nothing breaks either.
pub const HASH_MASK: u32 = 0x3fff_ffff;

/// Pure and total. Equal addresses hash equally; collisions between unequal
/// ones are expected and left to probing.
pub fn hash_address(address: Address) -> u32 {
    let mut h = address.get() as u64;
    h = (!h).wrapping_add(h << 18);
    h ^= h >> 31;
    h = h.wrapping_mul(21);
    h ^= h >> 11;
    h = h.wrapping_add(h << 6);
    h ^= h >> 22;
    (h as u32) & HASH_MASK
}

/// The slot probing starts from for `address` in a table of `capacity` slots.
/// `capacity` must be a power of two.
#[inline]
pub fn home_slot(address: Address, capacity: usize) -> usize {
    debug_assert!(capacity.is_power_of_two());
    hash_address(address) as usize & (capacity - 1)
}
