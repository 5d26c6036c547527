//! Client identifier fingerprinting
//!
//! One Murmur3 64-bit hash per identifier, stretched into L bucket indices
//! with the Kirsch-Mitzenmacher double-hashing construction
//! (<https://www.eecs.harvard.edu/~michaelm/postscripts/rsa2008.pdf>), so a
//! visit costs a single hash regardless of the level count.

/// Map a client identifier to one bucket column index per level.
///
/// Deterministic for a given `(client_id, seed, levels, buckets_per_level)`;
/// empty identifiers are valid input.
pub(crate) fn bucket_indices(
    client_id: &[u8],
    seed: u32,
    levels: u32,
    buckets_per_level: u32,
) -> Vec<u32> {
    let (hash, _) = mur3::murmurhash3_x64_128(client_id, seed);

    // Two independent 32-bit hashes from the halves of the 64-bit hash
    let h1 = hash as u32;
    let h2 = (hash >> 32) as u32;

    (0..levels)
        .map(|level| h1.wrapping_add(level.wrapping_mul(h2)) % buckets_per_level)
        .collect()
}
