//! Deterministic question ordering
//!
//! Two peers never exchange their question lists. Instead the host picks one
//! 32-bit seed, ships it in the room config, and both sides run the same
//! seeded permutation over the same question pool. For that to work the
//! generator must be bit-for-bit reproducible across platforms, so this
//! module pins a fully specified algorithm (mulberry32) instead of any
//! ambient random source. The arithmetic here must not change: every
//! wrapping add, shift and multiply is part of the wire contract.

/// mulberry32, a 32-bit counter-based mixing PRNG.
///
/// Yields floats in `[0, 1)`. All arithmetic wraps on 32-bit unsigned
/// overflow, matching the reference constants exactly.
pub fn mulberry32(seed: u32) -> impl FnMut() -> f64 {
    let mut s = seed;
    move || {
        s = s.wrapping_add(0x6d2b_79f5);
        let mut t = (s ^ (s >> 15)).wrapping_mul(s | 1);
        t = t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61)) ^ t;
        f64::from(t ^ (t >> 14)) / 4_294_967_296.0
    }
}

/// Returns a seeded permutation of `items`.
///
/// Backward Fisher-Yates driven by [`mulberry32`]: for `i` from `len-1` down
/// to `1`, swap index `i` with `floor(rng() * (i + 1))`. Same seed and same
/// input order always produce the same output order.
pub fn seeded_shuffle<T: Clone>(items: &[T], seed: u32) -> Vec<T> {
    let mut arr = items.to_vec();
    let mut rng = mulberry32(seed);
    for i in (1..arr.len()).rev() {
        let j = (rng() * (i as f64 + 1.0)).floor() as usize;
        arr.swap(i, j);
    }
    arr
}

/// Shuffles `pool` with `seed` and keeps the first `count` entries.
///
/// This is the question list handed to the quiz engine on both peers.
pub fn battle_questions<T: Clone>(pool: &[T], seed: u32, count: usize) -> Vec<T> {
    let mut questions = seeded_shuffle(pool, seed);
    questions.truncate(count);
    questions
}

/// Generates a fresh random 32-bit seed.
///
/// Host-only, at room-creation time; peers reconstructing the order must use
/// the transmitted seed, never this.
pub fn generate_seed() -> u32 {
    use rand::Rng;
    rand::thread_rng().r#gen()
}
