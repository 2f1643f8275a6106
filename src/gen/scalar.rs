//! Integer-like argument values.

use super::choose_weighted;
use crate::{arch::PAGE_SIZE, RngType};
use rand::prelude::*;

/// Values at the edges of common integer widths.
const BOUNDARY: [u64; 10] = [
    0,
    1,
    u64::MAX,
    u64::MAX - 1,
    u32::MAX as u64,
    i32::MAX as u64,
    i32::MIN as u32 as u64,
    i64::MAX as u64,
    i64::MIN as u64,
    u16::MAX as u64,
];

pub(super) fn raw(rng: &mut RngType) -> u64 {
    match rng.gen_range(0..100) {
        0..=19 => BOUNDARY.choose(rng).copied().unwrap_or(0),
        20..=44 => special_int(rng),
        45..=69 => favor_range(rng),
        _ => rng.gen(),
    }
}

pub(super) fn len(rng: &mut RngType) -> u64 {
    let page = *PAGE_SIZE as u64;
    match rng.gen_range(0..100) {
        0..=39 => rng.gen_range(0..=64),
        40..=64 => {
            let base = rng.gen_range(1..=4) * page;
            match rng.gen_range(0..3) {
                0 => base - 1,
                1 => base,
                _ => base + 1,
            }
        }
        65..=84 => favor_range(rng),
        85..=94 => MAGIC32.choose(rng).copied().unwrap_or(0),
        _ => rng.gen(),
    }
}

/// OR of a subset of `vals`, or a wild value with probability `wild_ratio`.
pub(super) fn flags(rng: &mut RngType, vals: &[u64], wild_ratio: f64) -> u64 {
    if vals.is_empty() || rng.gen_bool(wild_ratio) {
        flag_rand_val(rng)
    } else {
        flags_bits_composition(rng, vals)
    }
}

/// One of `vals` most of the time.
pub(super) fn op(rng: &mut RngType, vals: &[u64]) -> u64 {
    let base = match vals.choose(rng) {
        Some(v) => *v,
        None => return flag_rand_val(rng),
    };
    match rng.gen_range(0..100) {
        0 => flag_rand_val(rng),
        1..=2 => rand_inc(rng, base),
        _ => base,
    }
}

pub(super) fn range(rng: &mut RngType, lo: u64, hi: u64) -> u64 {
    if lo > hi {
        rng.gen_range(hi..=lo)
    } else {
        rng.gen_range(lo..=hi)
    }
}

fn flags_bits_composition(rng: &mut RngType, vals: &[u64]) -> u64 {
    let mut val = 0;
    let mut tries = 0;
    let max = std::cmp::min(10, vals.len());
    while tries < max && (val == 0 || rng.gen_ratio(2, 3)) {
        val |= vals.choose(rng).copied().unwrap_or(0);
        tries += 1;
    }
    val
}

fn rand_inc(rng: &mut RngType, mut base: u64) -> u64 {
    let inc: u64 = if rng.gen() { 1 } else { u64::MAX };
    base = base.wrapping_add(inc);
    while rng.gen_ratio(1, 4) {
        base = base.wrapping_add(inc);
    }
    base
}

#[inline]
fn flag_rand_val(rng: &mut RngType) -> u64 {
    if rng.gen_ratio(3, 5) {
        rng.gen()
    } else {
        0
    }
}

fn favor_range(rng: &mut RngType) -> u64 {
    const FAVOR: [u64; 5] = [16, 256, 4 << 10, 64 << 10, 1 << 31];
    const WEIGHTS: [u64; 5] = [50, 70, 85, 95, 100];
    let idx = choose_weighted(rng, &WEIGHTS);
    rng.gen_range(0..FAVOR[idx])
}

const MAGIC32: [u64; 24] = [
    0,             //
    1,             //
    16,            // One-off with common buffer size
    32,            // One-off with common buffer size
    64,            // One-off with common buffer size
    100,           // One-off with common buffer size
    127,           // Overflow signed 8-bit when incremented
    128,           // Overflow signed 8-bit when decremented
    255,           // -1
    256,           // Overflow unsig 8-bit
    512,           // One-off with common buffer size
    1000,          // One-off with common buffer size
    1024,          // One-off with common buffer size
    4096,          // One-off with common buffer size
    32767,         // Overflow signed 16-bit when incremented
    32768,         // Overflow signed 16-bit when decremented
    65407,         // Overflow signed 8-bit
    65535,         // Overflow unsig 16-bit when incremented
    65536,         // Overflow unsig 16 bit
    100_663_045,   // Large positive number (endian-agnostic)
    2_147_483_647, // Overflow signed 32-bit when incremented
    2_147_483_648, // Overflow signed 32-bit when decremented
    4_194_304_250, // Large negative number (endian-agnostic)
    4_294_934_527, // Overflow signed 16-bit
];

const MAGIC64: [u64; 24 * 24] = {
    let mut magic = [0; 24 * 24];
    let mut i = 0;
    while i != 24 {
        let mut j = 0;
        while j != 24 {
            magic[i * 24 + j] = (MAGIC32[i] << 32) | MAGIC32[j];
            j += 1;
        }
        i += 1;
    }
    magic
};

#[inline]
fn special_int(rng: &mut RngType) -> u64 {
    if rng.gen() {
        MAGIC32.choose(rng).copied().unwrap_or(0)
    } else {
        MAGIC64.choose(rng).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> RngType {
        RngType::seed_from_u64(0x5eed)
    }

    #[test]
    fn flags_stay_within_candidates() {
        const VALS: [u64; 4] = [0x1, 0x4, 0x40, 0x4000];
        let union = VALS.iter().fold(0, |acc, v| acc | v);
        let mut rng = rng();
        let n = 20_000;
        let wild = 0.1;
        let outside = (0..n)
            .filter(|_| flags(&mut rng, &VALS, wild) & !union != 0)
            .count();
        // a wild value is random, it lands inside the union only by chance.
        let ratio = outside as f64 / n as f64;
        assert!(ratio < wild + 0.02, "outside ratio {}", ratio);
        assert!(ratio > wild * 0.5 - 0.02, "outside ratio {}", ratio);
    }

    #[test]
    fn flags_without_wild_are_compliant() {
        const VALS: [u64; 3] = [0x2, 0x8, 0x100];
        let mut rng = rng();
        for _ in 0..5000 {
            let v = flags(&mut rng, &VALS, 0.0);
            assert_ne!(v, 0);
            assert_eq!(v & !0x10a, 0);
        }
    }

    #[test]
    fn op_mostly_candidates() {
        const VALS: [u64; 3] = [0, 1, 2];
        let mut rng = rng();
        let hits = (0..10_000)
            .filter(|_| VALS.contains(&op(&mut rng, &VALS)))
            .count();
        assert!(hits > 9_500, "hits {}", hits);
    }

    #[test]
    fn range_is_inclusive() {
        let mut rng = rng();
        let mut seen = [false; 4];
        for _ in 0..1000 {
            let v = range(&mut rng, 3, 6);
            assert!((3..=6).contains(&v));
            seen[(v - 3) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
        assert_eq!(range(&mut rng, 9, 9), 9);
    }

    #[test]
    fn len_biased_small() {
        let mut rng = rng();
        let small = (0..10_000)
            .filter(|_| len(&mut rng) <= 4 * *PAGE_SIZE as u64 + 1)
            .count();
        assert!(small > 6_000, "small {}", small);
    }

    #[test]
    fn magic64_layout() {
        assert_eq!(MAGIC64[0], 0);
        assert_eq!(MAGIC64[1], 1);
        assert_eq!(MAGIC64[24], 1 << 32);
        assert_eq!(MAGIC64[24 * 24 - 1], (4_294_934_527 << 32) | 4_294_934_527);
    }
}
