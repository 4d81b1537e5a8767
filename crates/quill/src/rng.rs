use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;

use quill_core::{bail, Array, DType, Error, Result, Shape};

// Stateless PRNG — explicit keys instead of hidden generator state
//
// A Key is 128 bits of opaque state. `make_key` derives one from a seed,
// `split` derives two independent children, and `sample` turns a key
// into an array of draws. Everything is a pure function of its inputs:
// the same key and distribution always produce bit-identical arrays, and
// splitting the same key twice yields the same pair.
//
// Discipline: treat a key as consumed once passed to `split` or
// `sample`; reusing it reproduces the same randomness, which is a
// correlation bug in simulations even though it is deterministic by
// construction.
//
// Key derivation uses the splitmix64 finalizer; the draws themselves
// come from a key-seeded StdRng feeding rand_distr samplers.

/// Opaque 128-bit PRNG state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    hi: u64,
    lo: u64,
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Derive a root key from a seed.
pub fn make_key(seed: u64) -> Key {
    let mut state = seed;
    Key {
        hi: splitmix64(&mut state),
        lo: splitmix64(&mut state),
    }
}

/// Derive exactly two independent child keys. Deterministic: the same
/// parent always yields the same pair. The parent should not be used
/// again after splitting.
pub fn split(key: Key) -> (Key, Key) {
    let mut state = key.hi ^ key.lo.rotate_left(31);
    let first = Key {
        hi: splitmix64(&mut state),
        lo: splitmix64(&mut state),
    };
    let second = Key {
        hi: splitmix64(&mut state),
        lo: splitmix64(&mut state),
    };
    (first, second)
}

/// Distributions `sample` can draw from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dist {
    Uniform { lo: f64, hi: f64 },
    Normal { mean: f64, std: f64 },
    Bernoulli { p: f64 },
}

fn rng_for(key: Key) -> StdRng {
    // Expand the 128-bit key into the 32-byte StdRng seed.
    let mut state = key.hi ^ key.lo.rotate_left(17);
    let words = [key.hi, key.lo, splitmix64(&mut state), splitmix64(&mut state)];
    let mut seed = [0u8; 32];
    for (chunk, word) in seed.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    StdRng::from_seed(seed)
}

/// Draw an array of samples. A pure function: identical key,
/// distribution, shape and dtype produce a bit-identical array.
///
/// Uniform and Normal require a float dtype; Bernoulli produces Bool.
pub fn sample<S: Into<Shape>>(key: Key, dist: &Dist, shape: S, dtype: DType) -> Result<Array> {
    let shape = shape.into();
    let n = shape.elem_count();
    let mut rng = rng_for(key);
    let data: Vec<f64> = match *dist {
        Dist::Uniform { lo, hi } => {
            if !dtype.is_float() {
                bail!("uniform sampling requires a float dtype, got {dtype}");
            }
            if !(lo < hi) {
                bail!("uniform bounds must satisfy lo < hi, got [{lo}, {hi})");
            }
            let d = rand_distr::Uniform::new(lo, hi);
            (0..n).map(|_| d.sample(&mut rng)).collect()
        }
        Dist::Normal { mean, std } => {
            if !dtype.is_float() {
                bail!("normal sampling requires a float dtype, got {dtype}");
            }
            let d = rand_distr::Normal::new(mean, std).map_err(|e| Error::msg(e.to_string()))?;
            (0..n).map(|_| d.sample(&mut rng)).collect()
        }
        Dist::Bernoulli { p } => {
            if dtype != DType::Bool {
                bail!("bernoulli sampling produces bool arrays, got {dtype}");
            }
            let d = rand_distr::Bernoulli::new(p).map_err(|e| Error::msg(e.to_string()))?;
            (0..n)
                .map(|_| if d.sample(&mut rng) { 1.0 } else { 0.0 })
                .collect()
        }
    };
    Array::from_f64_slice(&data, shape, dtype)
}
