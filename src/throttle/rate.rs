use std::{
    fmt::{self, Debug},
    sync::Arc,
    time::Duration,
};

use super::Error;

/// Signature of a dynamic rate callback.
///
/// Returns the permitted admission rate in calls per second for the next
/// releaser decision. The callback is invoked fresh on every resolution,
/// which lets the rate track live feedback (e.g. downstream latency)
/// without rebuilding the throttle.
pub type RateFn = dyn Fn() -> f64 + Send + Sync + 'static;

/// Fixed admission rate used when the builder sets nothing else.
pub(crate) const DEFAULT_PER_SECOND: f64 = 3.0;

/// Where the permitted rate comes from.
#[derive(Clone)]
pub(crate) enum RateSource {
    Fixed(f64),
    Dynamic(Arc<RateFn>),
}

impl RateSource {
    /// Resolve the permitted rate in calls per second.
    ///
    /// Fails on a non-positive or non-finite rate. A fixed source is also
    /// validated once at build time; a dynamic source can only be checked
    /// here, at each resolution.
    pub(crate) fn per_second(&self) -> Result<f64, Error> {
        let rate = match self {
            Self::Fixed(rate) => *rate,
            Self::Dynamic(rate_fn) => rate_fn(),
        };

        if rate.is_finite() && rate > 0.0 {
            Ok(rate)
        } else {
            Err(Error::InvalidRate(rate))
        }
    }

    /// Resolve the current releaser period: `1 / rate`.
    pub(crate) fn period(&self) -> Result<Duration, Error> {
        let rate = self.per_second()?;

        Duration::try_from_secs_f64(1.0 / rate).map_err(|_| Error::InvalidRate(rate))
    }
}

impl Debug for RateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(rate) => f.debug_tuple("Fixed").field(rate).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fixed_rate_resolution() {
        let source = RateSource::Fixed(4.0);

        assert_eq!(source.per_second().unwrap(), 4.0);
        assert_eq!(source.period().unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn dynamic_rate_resolved_fresh_every_time() {
        let calls = Arc::new(AtomicUsize::new(0));

        let source = RateSource::Dynamic(Arc::new({
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                2.0
            }
        }));

        source.per_second().unwrap();
        source.period().unwrap();

        // period() resolves the rate exactly once more
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_positive_rates_are_rejected() {
        assert_eq!(
            RateSource::Fixed(0.0).per_second(),
            Err(Error::InvalidRate(0.0))
        );
        assert_eq!(
            RateSource::Fixed(-3.0).per_second(),
            Err(Error::InvalidRate(-3.0))
        );
        assert!(matches!(
            RateSource::Fixed(f64::NAN).per_second(),
            Err(Error::InvalidRate(_))
        ));
        assert!(matches!(
            RateSource::Fixed(f64::INFINITY).per_second(),
            Err(Error::InvalidRate(_))
        ));

        let source = RateSource::Dynamic(Arc::new(|| -1.0));
        assert_eq!(source.period(), Err(Error::InvalidRate(-1.0)));
    }

    #[test]
    fn period_is_reciprocal_of_rate() {
        assert_eq!(
            RateSource::Fixed(0.1).period().unwrap(),
            Duration::from_secs(10)
        );
        assert_eq!(
            RateSource::Fixed(1000.0).period().unwrap(),
            Duration::from_millis(1)
        );
    }
}
