use crate::meta::SHARD_COUNT;

/// Seed fed to MurmurHash3 for every key. Part of the file format.
pub const HASH_SEED: u32 = 0xcafe;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Hashes a key the way both builders and readers must agree on.
#[inline]
pub fn hash_key(key: &[u8]) -> u32 {
    murmur3_32(key, HASH_SEED)
}

/// Selects the shard owning `hash`.
#[inline]
pub fn shard_index(hash: u32) -> usize {
    (hash % SHARD_COUNT as u32) as usize
}

/// First slot probed for `hash` in a table of `capacity` slots.
///
/// The low byte already picked the shard, so placement uses the remaining bits.
#[inline]
pub fn probe_start(hash: u32, capacity: u32) -> u32 {
    (hash >> 8) % capacity
}

/// MurmurHash3, x86 32-bit variant.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k ^= (byte as u32) << (8 * i);
        }
        h ^= mix_k(k);
    }

    h ^= data.len() as u32;
    fmix32(h)
}

#[inline]
fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
