//! Poisson-process byte-countdown sampler.
//!
//! Deciding whether to sample every allocation individually would mean
//! drawing a variate per call; instead each thread keeps a running
//! countdown of how many more bytes it can hand out before the next
//! sample is due, refilled from an exponential draw whenever it's spent.
//! That makes the common, unsampled case a single subtract-and-compare.

pub(crate) mod state;

use state::SampleState;

/// Subtracts `request_bytes` from the thread's countdown and reports
/// whether this request crossed (or landed exactly on) zero, i.e.
/// whether it's the one that should be sampled.
fn sample_request(request_bytes: u64) -> bool {
    state::with_state(|s| {
        let (remaining, borrowed) = s.bytes_until_next_sample.overflowing_sub(request_bytes);
        s.bytes_until_next_sample = remaining;
        borrowed || remaining == 0
    })
}

/// Clamps a configured mean back to the default whenever it isn't a
/// usable mean, regardless of how it got that way: a non-positive or
/// non-finite mean would make `-mean * ln(uniform)` stuck at `0.0` or
/// `NaN` for every draw, spinning `sample_request_reset`'s redraw loop
/// forever.
fn effective_period(period: f64) -> f64 {
    if period.is_finite() && period > 0.0 {
        period
    } else {
        crate::config::DEFAULT_SAMPLE_PERIOD_BYTES
    }
}

/// Draws a new countdown from the exponential distribution with mean
/// `config::sample_period()`. Returns whether this thread's PRNG
/// transitioned from unseeded to seeded during the draw, which signals
/// the caller that the countdown it just raced against was an arbitrary
/// placeholder rather than a real draw, and the sampling decision for
/// this request should be redone against the fresh one.
fn sample_request_reset() -> bool {
    state::with_state(|s| {
        let mut became_seeded = false;
        loop {
            let (uniform, newly_initialized) = state::uniform(s);
            became_seeded |= newly_initialized;

            let period = effective_period(crate::config::sample_period());
            let draw = -period * uniform.ln();
            if draw == 0.0 {
                // Only possible when uniform == 1.0 exactly (a 1-in-2^52
                // mantissa draw); redraw rather than leave the countdown
                // at zero forever.
                continue;
            }
            s.bytes_until_next_sample = draw as u64;
            return became_seeded;
        }
    })
}

/// Decides whether `request_bytes` should be the sampled allocation,
/// resetting and redrawing the countdown exactly once if it was
/// consumed. Resamples on a freshly-seeded thread's first decision so
/// a thread's very first allocation isn't implicitly biased by whatever
/// countdown happened to sit in its zero-initialized state.
pub(crate) fn decide(request_bytes: u64) -> bool {
    if crate::util::likely(!sample_request(request_bytes)) {
        return false;
    }
    if sample_request_reset() {
        return decide(request_bytes);
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sample_request_triggers_on_zero_countdown() {
        state::with_state(|s| s.bytes_until_next_sample = 0);
        assert!(sample_request(1));
    }

    #[test]
    fn sample_request_counts_down_before_triggering() {
        state::with_state(|s| s.bytes_until_next_sample = 100);
        assert!(!sample_request(40));
        assert!(!sample_request(40));
        assert!(sample_request(40));
    }

    #[test]
    fn sample_request_reset_produces_a_positive_countdown() {
        crate::config::load();
        sample_request_reset();
        let remaining = state::with_state(|s| s.bytes_until_next_sample);
        assert!(remaining > 0);
    }

    #[test]
    fn decide_eventually_samples_given_enough_bytes() {
        crate::config::load();
        // With a 32 MiB mean period, requesting far more than that in a
        // single call is effectively guaranteed to land on the sample.
        assert!(decide(1 << 28));
    }

    #[test]
    fn effective_period_clamps_non_positive_and_non_finite_means() {
        assert_eq!(effective_period(0.0), crate::config::DEFAULT_SAMPLE_PERIOD_BYTES);
        assert_eq!(effective_period(-1.0), crate::config::DEFAULT_SAMPLE_PERIOD_BYTES);
        assert_eq!(effective_period(f64::NAN), crate::config::DEFAULT_SAMPLE_PERIOD_BYTES);
        assert_eq!(effective_period(f64::INFINITY), crate::config::DEFAULT_SAMPLE_PERIOD_BYTES);
        assert_eq!(effective_period(4096.0), 4096.0);
    }
}
