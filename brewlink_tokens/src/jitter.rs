//! Spreading scheduled refresh times
//!
//! Many processes sharing one account would otherwise all refresh at the
//! moment their bundles turn stale.

use brewlink_clock::UnixTime;

/// Moves a scheduled time
pub trait JitterSource {
    /// The time to act instead of `time`
    fn jitter(&mut self, time: UnixTime) -> UnixTime;
}

/// Leaves every time where it is
#[derive(Debug)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&mut self, time: UnixTime) -> UnixTime {
        time
    }
}

#[cfg(feature = "rand")]
mod random {
    use brewlink_clock::{DurationSecs, UnixTime};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Moves times earlier by a uniformly random number of whole seconds
    ///
    /// A jittered time falls in `(time - max_jitter, time]`, so a refresh is
    /// never scheduled after the bundle turns stale.
    #[derive(Debug)]
    pub struct RandomEarlyJitter<R> {
        max_jitter: DurationSecs,
        rand_source: R,
    }

    impl RandomEarlyJitter<StdRng> {
        /// Draws from an entropy-seeded generator
        pub fn new(max_jitter: DurationSecs) -> Self {
            Self::with_rng(max_jitter, StdRng::from_entropy())
        }
    }

    impl<R: Rng> RandomEarlyJitter<R> {
        /// Draws from `rand_source`, for example a seeded generator in tests
        pub fn with_rng(max_jitter: DurationSecs, rand_source: R) -> Self {
            Self {
                max_jitter,
                rand_source,
            }
        }
    }

    impl<R: Rng> super::JitterSource for RandomEarlyJitter<R> {
        fn jitter(&mut self, time: UnixTime) -> UnixTime {
            if self.max_jitter.0 == 0 {
                return time;
            }

            let early = DurationSecs(self.rand_source.gen_range(0..self.max_jitter.0));
            time.saturating_sub(early)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::jitter::JitterSource;

        #[test]
        fn jitters_only_earlier_and_within_bound() {
            let mut jitter =
                RandomEarlyJitter::with_rng(DurationSecs(60), StdRng::seed_from_u64(7));
            let time = UnixTime(10_000);

            for _ in 0..200 {
                let jittered = jitter.jitter(time);
                assert!(jittered <= time);
                assert!(jittered > time - DurationSecs(60));
            }
        }

        #[test]
        fn zero_bound_is_identity() {
            let mut jitter = RandomEarlyJitter::new(DurationSecs(0));
            assert_eq!(jitter.jitter(UnixTime(5)), UnixTime(5));
        }
    }
}

#[cfg(feature = "rand")]
pub use random::RandomEarlyJitter;
