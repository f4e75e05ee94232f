//! Per-thread xoshiro256+ state and the uniform-variate draw built on it.
//!
//! State lives in a thread-local `Cell`, never shared or locked: each
//! thread owns an independent stream, seeded lazily from OS entropy on
//! first use.

use std::cell::Cell;

use crate::ffi::syscall;

/// Four 64-bit state words plus the byte countdown the sampler keeps
/// alongside them. `Copy` so the thread-local `Cell` can hand out and
/// take back a whole snapshot per access without any locking.
#[derive(Clone, Copy)]
pub(crate) struct SampleState {
    s: [u64; 4],
    pub(crate) bytes_until_next_sample: u64,
}

impl SampleState {
    const ZERO: SampleState = SampleState {
        s: [0, 0, 0, 0],
        bytes_until_next_sample: 0,
    };
}

thread_local! {
    static STATE: Cell<SampleState> = const { Cell::new(SampleState::ZERO) };
}

/// Runs `f` against this thread's state, writing any mutation back.
pub(crate) fn with_state<R>(f: impl FnOnce(&mut SampleState) -> R) -> R {
    STATE.with(|cell| {
        let mut state = cell.get();
        let result = f(&mut state);
        cell.set(state);
        result
    })
}

/// xoshiro256+ (Blackman & Vigna), the public-domain reference
/// algorithm: <https://prng.di.unimi.it/xoshiro256plus.c>
fn next(state: &mut SampleState) -> u64 {
    let s = &mut state.s;
    let result = s[0].wrapping_add(s[3]);

    let t = s[1] << 17;
    s[2] ^= s[0];
    s[3] ^= s[1];
    s[1] ^= s[2];
    s[0] ^= s[3];
    s[2] ^= t;
    s[3] = s[3].rotate_left(45);

    result
}

/// All-zero state is the "never seeded" sentinel: starting from it,
/// `next` is a fixed point that returns 0 forever, which is also the
/// only practical way a properly seeded generator could ever emit 0.
/// Either way, seeing a raw 0 means this thread must reseed (if it
/// hasn't yet) and redraw, so the uniform draw below never silently
/// returns the degenerate, non-random value a still-zero state would
/// otherwise produce.
fn seed_from_os() -> [u64; 4] {
    let mut bytes = [0u8; 32];
    if let Err(err) = syscall::getrandom(&mut bytes) {
        // No unbiased sample is possible without entropy; there is no
        // degraded mode worth limping along in.
        eprintln!("poireau: failed to read OS entropy to seed sampler: {err}");
        std::process::abort();
    }
    let mut words = [0u64; 4];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
        *word = u64::from_ne_bytes(chunk.try_into().unwrap());
    }
    words
}

/// Draws a uniform variate in `(0, 1]` and reports whether this call
/// seeded a previously-unseeded generator. The half-open-at-zero,
/// closed-at-one range keeps `-mean * ln(uniform)` (the exponential draw
/// built on top of this) always finite and non-negative.
pub(crate) fn uniform(state: &mut SampleState) -> (f64, bool) {
    let mut newly_initialized = false;
    let mut raw = next(state);

    if crate::util::unlikely(raw == 0) {
        if state.s == [0, 0, 0, 0] {
            state.s = seed_from_os();
            newly_initialized = true;
        }
        loop {
            raw = next(state);
            if raw != 0 {
                break;
            }
        }
    }

    // Top 52 bits of `raw` become the mantissa of a double in [1, 2);
    // `2.0 - x` maps that onto (0, 1], with the all-zero mantissa (x ==
    // 1.0) landing on the closed end rather than the open one.
    let mantissa = raw >> 12;
    let bits = (0x3ffu64 << 52) | mantissa;
    let x = f64::from_bits(bits);
    (2.0 - x, newly_initialized)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uniform_stays_in_open_zero_closed_one_range() {
        let mut state = SampleState {
            s: [0x9e3779b97f4a7c15, 0xbf58476d1ce4e5b9, 0x94d049bb133111eb, 1],
            bytes_until_next_sample: 0,
        };
        for _ in 0..10_000 {
            let (u, _) = uniform(&mut state);
            assert!(u > 0.0 && u <= 1.0);
        }
    }

    #[test]
    fn zero_state_seeds_and_reports_newly_initialized_once() {
        let mut state = SampleState::ZERO;
        let (u, newly_initialized) = uniform(&mut state);
        assert!(u > 0.0 && u <= 1.0);
        assert!(newly_initialized);
        assert_ne!(state.s, [0, 0, 0, 0]);

        let (_, newly_initialized_again) = uniform(&mut state);
        assert!(!newly_initialized_again);
    }

    #[test]
    fn with_state_round_trips_mutations() {
        with_state(|s| s.bytes_until_next_sample = 42);
        let observed = with_state(|s| s.bytes_until_next_sample);
        assert_eq!(observed, 42);
    }
}
