//! Error backoff handling
//!
//! Delays grow exponentially with the number of consecutive failures, are
//! capped, and are then spread by a random factor so that many clients
//! dropped by the same backend event do not retry in lockstep.

use std::time::Duration;

/// Configuration for how to manage backoff when an error is encountered
#[derive(Clone, Debug)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
    jitter_fraction: f64,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 1 second with a multiplier of 2, capped at
    /// 30 seconds, spread by ±50%.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_secs(1),
            max_error_delay: Duration::from_secs(30),
            multiplier: 2,
            jitter_fraction: 0.5,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// After the `n`th consecutive failure (counting from zero) the nominal
    /// delay is `initial_error_delay * multiplier^n`, capped at `max_error_delay`.
    /// No jitter is applied until one is set with [`with_jitter()`][Self::with_jitter()].
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
            jitter_fraction: 0.0,
        }
    }

    /// Spreads each delay uniformly within `±jitter_fraction` of its nominal value
    ///
    /// The fraction is clamped to `[0, 1]`.
    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction.clamp(0.0, 1.0);
        self
    }

    /// The jitter fraction in use
    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    /// The nominal delay after `attempt` prior consecutive failures, before jitter
    ///
    /// Never decreases as `attempt` grows.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_error_delay
            .checked_mul(factor)
            .unwrap_or(self.max_error_delay)
            .min(self.max_error_delay)
    }

    /// The largest delay this configuration can produce
    pub fn max_delay(&self) -> Duration {
        self.max_error_delay.mul_f64(1.0 + self.jitter_fraction)
    }

    fn jittered(&self, nominal: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 {
            return nominal;
        }

        nominal.mul_f64(sample_spread(self.jitter_fraction))
    }
}

#[cfg(feature = "rand")]
fn sample_spread(fraction: f64) -> f64 {
    use rand::Rng;

    rand::thread_rng().gen_range((1.0 - fraction)..=(1.0 + fraction))
}

#[cfg(not(feature = "rand"))]
fn sample_spread(_fraction: f64) -> f64 {
    1.0
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Duration)>;
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that counts consecutive failures
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    attempt: u32,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// The number of consecutive failures reported since the last success
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The configuration in use
    pub fn config(&self) -> &ErrorBackoffConfig {
        &self.config
    }

    /// Reports a success
    ///
    /// This resets the failure count.
    pub fn success(&mut self) {
        self.attempt = 0;
    }

    /// Reports a failure and returns the delay to wait before the next attempt
    pub fn error(&mut self) -> Duration {
        let nominal = self.config.nominal_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.config.jittered(nominal)
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}
