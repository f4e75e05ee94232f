//! Process-wide sampler configuration, loaded once at load time.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// `2^25` bytes, matching the default mean sampling interval most
/// allocation-profiler deployments converge on: frequent enough to see
/// hot allocation sites quickly, rare enough that the tracking
/// allocator's overhead stays negligible.
pub(crate) const DEFAULT_SAMPLE_PERIOD_BYTES: f64 = 33_554_432.0;

/// Bit pattern of [`DEFAULT_SAMPLE_PERIOD_BYTES`], spelled out as a
/// literal so the static below can start from it directly: `f64::to_bits`
/// is not guaranteed `const` at this crate's MSRV. Covered by
/// `default_bits_match_the_float_they_encode` below.
const DEFAULT_SAMPLE_PERIOD_BITS: u64 = 0x4180_0000_0000_0000;

const SAMPLE_PERIOD_ENV: &str = "POIREAU_SAMPLE_PERIOD_BYTES";
const QUIET_ENV: &str = "POIREAU_QUIET";

/// Starts at the default period's bits, not `0`: `load()` reads
/// `std::env::var`, which itself allocates and so can run an interposed
/// `malloc` through the sampler before `load()` has stored anything.
/// Seeing a `0.0` mean there would turn `sample_request_reset`'s
/// `-mean * ln(uniform)` draw into `0.0` for every `uniform`, spinning
/// its "redraw while zero" loop forever.
static SAMPLE_PERIOD_BITS: AtomicU64 = AtomicU64::new(DEFAULT_SAMPLE_PERIOD_BITS);

#[derive(Debug, Error)]
pub(crate) enum SamplePeriodError {
    #[error("{SAMPLE_PERIOD_ENV} is not a number: {0}")]
    Parse(#[from] std::num::ParseFloatError),
    #[error("{SAMPLE_PERIOD_ENV} must be positive and finite, got {0}")]
    OutOfRange(f64),
}

/// Parses and caches the sample period. Idempotent; safe to call more
/// than once (the constructor calls it exactly once, but nothing breaks
/// if a test calls it again).
pub(crate) fn load() {
    let period = match std::env::var(SAMPLE_PERIOD_ENV) {
        Ok(value) => match parse(&value) {
            Ok(period) => period,
            Err(err) => {
                warn_direct(&format!("{err}; falling back to the default sample period"));
                DEFAULT_SAMPLE_PERIOD_BYTES
            }
        },
        Err(_) => DEFAULT_SAMPLE_PERIOD_BYTES,
    };
    SAMPLE_PERIOD_BITS.store(period.to_bits(), Ordering::Relaxed);
}

fn parse(value: &str) -> Result<f64, SamplePeriodError> {
    let period: f64 = value.trim().parse()?;
    if !period.is_finite() || period <= 0.0 {
        return Err(SamplePeriodError::OutOfRange(period));
    }
    Ok(period)
}

/// Bypasses the `log` facade: this exact message, on this exact channel,
/// suppressible by this exact variable, is part of the observable
/// contract, and must not depend on whether a host happens to have
/// installed a `log::Log` implementation.
fn warn_direct(message: &str) {
    if std::env::var_os(QUIET_ENV).is_none() {
        eprintln!("poireau: {message}");
    }
}

/// Read with relaxed ordering from every allocation-path thread; never
/// mutated after [`load`] runs in the constructor.
#[inline(always)]
pub(crate) fn sample_period() -> f64 {
    f64::from_bits(SAMPLE_PERIOD_BITS.load(Ordering::Relaxed))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_accepts_positive_finite_values() {
        assert_eq!(parse("1024").unwrap(), 1024.0);
        assert_eq!(parse("  2048.5 ").unwrap(), 2048.5);
    }

    #[test]
    fn parse_rejects_non_positive_and_non_finite() {
        assert!(parse("0").is_err());
        assert!(parse("-1").is_err());
        assert!(parse("nan").is_err());
        assert!(parse("inf").is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(parse("banana"), Err(SamplePeriodError::Parse(_))));
    }

    #[test]
    fn default_bits_match_the_float_they_encode() {
        assert_eq!(DEFAULT_SAMPLE_PERIOD_BITS, DEFAULT_SAMPLE_PERIOD_BYTES.to_bits());
    }

    #[test]
    fn sample_period_is_never_zero_before_load_runs() {
        assert_eq!(f64::from_bits(DEFAULT_SAMPLE_PERIOD_BITS), DEFAULT_SAMPLE_PERIOD_BYTES);
        assert!(DEFAULT_SAMPLE_PERIOD_BYTES > 0.0);
    }
}
