use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, trace};

mod gate;
pub mod rate;

use gate::Gate;
use rate::{RateSource, DEFAULT_PER_SECOND};

pub use rate::RateFn;

/// Error type for throttle construction and admission.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The resolved admission rate is not a positive, finite number of
    /// calls per second. This is a configuration mistake of the caller and
    /// is never retried: once a dynamic rate resolves invalid, the whole
    /// throttle fails all further admissions with this error.
    #[error("admission rate must be a positive number of calls per second, got {0}")]
    InvalidRate(f64),

    /// An admission wait outlived the caller-supplied bound.
    #[error("no admission granted within {0:?}")]
    AdmissionTimeout(Duration),
}

/// Limiting how many calls may start per second, across any number of
/// concurrent caller threads.
pub struct Throttle {
    shared: Arc<Shared>,
}

/// State reachable from both callers and the releaser thread.
struct Shared {
    /// Interval bookkeeping, admission counters and releaser liveness.
    state: Mutex<State>,
    gate: Gate,
    rate: RateSource,
    name: String,
}

#[derive(Debug)]
struct State {
    /// Callers waiting for admission.
    pending: usize,
    /// Callers currently inside the wrapped operation.
    running: usize,
    /// Admissions granted since the current interval began.
    interval_admitted: u64,
    interval_start: Instant,
    /// Idle/active flag of the releaser state machine. Flipped only under
    /// this mutex: set by the guarded start, cleared by the loop itself
    /// when it decides to exit.
    releaser_active: bool,
    /// Handle of the most recently spawned releaser, reaped on respawn.
    releaser: Option<JoinHandle<()>>,
}

impl Throttle {
    /// Initialize a builder to create a throttle.
    pub fn builder() -> ThrottleBuilder {
        ThrottleBuilder::new()
    }

    /// Run a function once the throttle admits it.
    ///
    /// Blocks the current thread until the admission rate allows another
    /// call, then invokes `f` and hands back its result. The occupied
    /// admission slot is given back on every exit path, including a panic
    /// unwinding out of `f`.
    ///
    /// Fails only with a throttle-side error: a misconfigured rate
    /// ([`Error::InvalidRate`]). Failures of `f` itself are the caller's
    /// business and travel through untouched as the return value.
    ///
    /// # Example
    ///
    /// ```
    /// use pacegate::Throttle;
    /// use rayon::prelude::*;
    ///
    /// let throttle = Throttle::builder()
    ///     .per_second(50.0)
    ///     .build()
    ///     .unwrap();
    ///
    /// let ans: Vec<u32> = vec![3, 2, 1]
    ///     .into_par_iter()
    ///     .map(|x| {
    ///         // parallel callers block here until admitted
    ///         throttle.run(|| x + 1).unwrap()
    ///     })
    ///     .collect();
    ///
    /// assert_eq!(ans, vec![4, 3, 2]);
    /// ```
    pub fn run<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> T,
    {
        let running = self.request_admission(None)?;

        // occupying one admission slot until f is done
        let _admission = AdmissionGuard {
            shared: &self.shared,
        };

        debug!(throttle = %self.shared.name, running, "invoking wrapped operation");
        Ok(f())
    }

    /// Run a function, waiting at most `timeout` for admission.
    ///
    /// Behaves like [`run()`](Self::run), except the admission wait is
    /// bounded: once `timeout` expires without a slot, the pending
    /// registration is rolled back and [`Error::AdmissionTimeout`] is
    /// returned without invoking `f`. The wrapped operation itself is
    /// never interrupted once started.
    ///
    /// # Example
    ///
    /// ```
    /// use pacegate::{Error, Throttle};
    /// use std::time::Duration;
    ///
    /// // one admission every 10 seconds
    /// let throttle = Throttle::builder().per_second(0.1).build().unwrap();
    ///
    /// let ans = throttle.run_within(Duration::from_millis(50), || "done");
    ///
    /// assert_eq!(ans, Err(Error::AdmissionTimeout(Duration::from_millis(50))));
    /// ```
    pub fn run_within<F, T>(&self, timeout: Duration, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> T,
    {
        let running = self.request_admission(Some(timeout))?;

        let _admission = AdmissionGuard {
            shared: &self.shared,
        };

        debug!(throttle = %self.shared.name, running, "invoking wrapped operation");
        Ok(f())
    }

    /// Callers currently waiting for admission.
    pub fn pending_count(&self) -> usize {
        self.lock_state().pending
    }

    /// Whether any caller is waiting for admission.
    pub fn has_pending(&self) -> bool {
        self.lock_state().pending > 0
    }

    /// Callers currently inside the wrapped operation.
    pub fn running_count(&self) -> usize {
        self.lock_state().running
    }

    /// Admissions granted since the current interval began.
    pub fn interval_admitted_count(&self) -> u64 {
        self.lock_state().interval_admitted
    }

    /// When the current interval began.
    pub fn interval_start(&self) -> Instant {
        self.lock_state().interval_start
    }

    /// Time passed since the current interval began.
    pub fn interval_elapsed(&self) -> Duration {
        self.lock_state().interval_start.elapsed()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .expect("mutex impossible to be poison")
    }

    /// The blocking entry point: register as pending, make sure a releaser
    /// is pacing the gate, then wait to be let through.
    ///
    /// Returns the number of running callers after this admission.
    fn request_admission(&self, timeout: Option<Duration>) -> Result<usize, Error> {
        if let Some(err) = self.shared.gate.fault_error() {
            return Err(err);
        }

        {
            let mut state = self.lock_state();
            state.pending += 1;

            if state.running == 0 && state.pending == 1 {
                // the throttle was fully idle: a new interval begins with
                // this caller, and permits from abandoned waits are stale
                state.interval_admitted = 0;
                state.interval_start = Instant::now();
                self.shared.gate.drain();
                debug!(throttle = %self.shared.name, "new interval started");
            }

            Shared::ensure_releaser(&self.shared, &mut state);
        }

        if let Err(err) = self.shared.gate.await_admission(timeout) {
            let mut state = self.lock_state();
            state.pending -= 1;
            return Err(err);
        }

        let mut state = self.lock_state();
        state.pending -= 1;
        state.running += 1;
        state.interval_admitted += 1;
        trace!(
            throttle = %self.shared.name,
            pending = state.pending,
            running = state.running,
            admitted = state.interval_admitted,
            "admission granted"
        );
        Ok(state.running)
    }
}

impl Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("name", &self.shared.name)
            .field("rate", &self.shared.rate)
            .field("state", &self.shared.state)
            .finish()
    }
}

impl Shared {
    /// Start the releaser if the state machine is idle.
    ///
    /// Guarded by the state lock so two arriving callers cannot both spawn
    /// a loop racing on the same gate.
    fn ensure_releaser(shared: &Arc<Self>, state: &mut State) {
        if state.releaser_active {
            return;
        }

        // reap the previous loop, which already flipped itself idle
        if let Some(handle) = state.releaser.take() {
            let _ = handle.join();
        }

        let worker = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(format!("{}-releaser", shared.name))
            .spawn(move || worker.releaser_loop())
            .expect("failed to spawn releaser thread");

        state.releaser_active = true;
        state.releaser = Some(handle);
        debug!(throttle = %shared.name, "releaser started");
    }

    /// The releaser: wake every period, grant at most one admission when
    /// the interval's accrued allowance has room and somebody is pending,
    /// go idle once nobody is.
    ///
    /// The allowance is `floor(elapsed × rate)` against the interval's
    /// cumulative admitted count: quota accrues continuously with elapsed
    /// time instead of refilling in discrete windows. Granting one
    /// admission per tick, with the tick length itself derived from the
    /// current rate, bounds bursts to roughly one caller per period.
    fn releaser_loop(&self) {
        loop {
            let period = match self.rate.period() {
                Ok(period) => period,
                Err(err) => return self.abort_releaser(err),
            };

            // resolved again rather than reused from the period
            // computation: a dynamic source must see every decision
            let per_second = match self.rate.per_second() {
                Ok(rate) => rate,
                Err(err) => return self.abort_releaser(err),
            };

            {
                let state = self.state.lock().expect("mutex impossible to be poison");
                let elapsed = state.interval_start.elapsed();
                let allowed = (elapsed.as_secs_f64() * per_second) as u64;

                trace!(
                    throttle = %self.name,
                    pending = state.pending,
                    admitted = state.interval_admitted,
                    allowed,
                    "releaser tick"
                );

                if state.pending > 0 && state.interval_admitted < allowed {
                    drop(state);
                    trace!(throttle = %self.name, "releasing gate");
                    self.gate.admit();
                }
            }

            thread::sleep(period);

            let mut state = self.state.lock().expect("mutex impossible to be poison");
            if state.pending == 0 {
                state.releaser_active = false;
                drop(state);
                debug!(throttle = %self.name, "releaser terminated");
                return;
            }
        }
    }

    /// Configuration failure: fault the gate so waiters and later callers
    /// fail fast instead of starving, then go idle for good.
    fn abort_releaser(&self, err: Error) {
        debug!(throttle = %self.name, error = %err, "releaser stopped by invalid rate");
        self.gate.fault(err);

        let mut state = self.state.lock().expect("mutex impossible to be poison");
        state.releaser_active = false;
    }
}

/// Gives the admission slot back on drop, so the slot is released on every
/// exit path of the wrapped operation, including unwinding.
struct AdmissionGuard<'a> {
    shared: &'a Shared,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("mutex impossible to be poison");
        state.running = state.running.saturating_sub(1);
        trace!(
            throttle = %self.shared.name,
            running = state.running,
            "admission released"
        );
    }
}

/// Use to build a [`Throttle`].
///
/// Created by [`Throttle::builder()`] API.
#[derive(Clone)]
pub struct ThrottleBuilder {
    per_second: Option<f64>,
    rate_fn: Option<Arc<RateFn>>,
    name: String,
}

impl ThrottleBuilder {
    fn new() -> Self {
        Self {
            per_second: None,
            rate_fn: None,
            name: "throttle".to_string(),
        }
    }

    /// Set a fixed admission rate, in calls per second.
    ///
    /// The default value is `3.0`. Rejected at [`build()`](Self::build)
    /// unless positive and finite.
    ///
    /// # Example
    ///
    /// ```
    /// use pacegate::Throttle;
    ///
    /// // at most twice per second
    /// Throttle::builder().per_second(2.0);
    ///
    /// // at most once every 10 seconds
    /// Throttle::builder().per_second(0.1);
    /// ```
    pub fn per_second(&mut self, per_second: f64) -> &mut Self {
        self.per_second = Some(per_second);
        self
    }

    /// Set a dynamic rate source, resolved fresh before every releaser
    /// decision. Takes precedence over
    /// [`per_second()`](Self::per_second) whenever both are set.
    ///
    /// A resolution returning a non-positive or non-finite value stops the
    /// throttle: every waiting and future caller fails with
    /// [`Error::InvalidRate`].
    ///
    /// # Example
    ///
    /// ```
    /// use pacegate::Throttle;
    /// # fn downstream_latency_ms() -> f64 { 20.0 }
    ///
    /// // track downstream capacity instead of a fixed number
    /// Throttle::builder()
    ///     .rate_fn(|| 1000.0 / downstream_latency_ms());
    /// ```
    pub fn rate_fn<F>(&mut self, rate_fn: F) -> &mut Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.rate_fn = Some(Arc::new(rate_fn));
        self
    }

    /// Name carried in diagnostics and the releaser thread name, default
    /// `"throttle"`. Giving each instance its own name keeps their traces
    /// apart.
    pub fn name<S>(&mut self, name: S) -> &mut Self
    where
        S: Into<String>,
    {
        self.name = name.into();
        self
    }

    /// Create a new [`Throttle`] with current configuration.
    ///
    /// A fixed rate is validated here and fails with
    /// [`Error::InvalidRate`] when non-positive. A dynamic rate can only
    /// be validated when it runs.
    pub fn build(&mut self) -> Result<Throttle, Error> {
        let rate = match self.rate_fn.as_ref() {
            Some(rate_fn) => RateSource::Dynamic(Arc::clone(rate_fn)),
            None => {
                let source = RateSource::Fixed(self.per_second.unwrap_or(DEFAULT_PER_SECOND));
                source.per_second()?;
                source
            }
        };

        Ok(Throttle {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: 0,
                    running: 0,
                    interval_admitted: 0,
                    interval_start: Instant::now(),
                    releaser_active: false,
                    releaser: None,
                }),
                gate: Gate::new(),
                rate,
                name: self.name.clone(),
            }),
        })
    }
}

impl Debug for ThrottleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleBuilder")
            .field("per_second", &self.per_second)
            .field("dynamic", &self.rate_fn.is_some())
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::atomic::{AtomicBool, Ordering},
    };

    fn thread_pool(threads: usize) -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap()
    }

    #[test]
    fn build_with_invalid_fixed_rate() {
        assert_eq!(
            Throttle::builder().per_second(0.0).build().err(),
            Some(Error::InvalidRate(0.0)),
        );
        assert_eq!(
            Throttle::builder().per_second(-2.0).build().err(),
            Some(Error::InvalidRate(-2.0)),
        );
    }

    #[test]
    fn build_with_default_rate() {
        assert!(Throttle::builder().build().is_ok());
    }

    #[test]
    fn admissions_pace_out_at_fixed_rate() {
        let throttle = Throttle::builder().per_second(20.0).build().unwrap();
        let started = Instant::now();

        let admitted_at: Vec<Duration> = thread_pool(12).install(|| {
            use rayon::prelude::*;

            (0..10)
                .into_par_iter()
                .map(|_| throttle.run(|| started.elapsed()).unwrap())
                .collect()
        });

        assert_eq!(admitted_at.len(), 10);

        // 10 admissions at 20/s accrue over half a second
        let last = admitted_at.iter().max().unwrap();
        assert!(*last >= Duration::from_millis(400), "too fast: {last:?}");
        assert!(*last <= Duration::from_secs(3), "too slow: {last:?}");
    }

    #[test]
    fn ten_callers_at_two_per_second_accrue_over_five_seconds() {
        let throttle = Throttle::builder().per_second(2.0).build().unwrap();
        let started = Instant::now();

        let admitted_at: Vec<Duration> = thread_pool(12).install(|| {
            use rayon::prelude::*;

            (0..10)
                .into_par_iter()
                .map(|_| throttle.run(|| started.elapsed()).unwrap())
                .collect()
        });

        assert_eq!(admitted_at.len(), 10);

        let last = admitted_at.iter().max().unwrap();
        assert!(*last >= Duration::from_millis(4400), "too fast: {last:?}");
        assert!(*last <= Duration::from_secs(9), "too slow: {last:?}");
    }

    #[test]
    fn single_caller_at_low_rate_waits_one_full_period() {
        let throttle = Throttle::builder().per_second(0.1).build().unwrap();
        let started = Instant::now();

        throttle.run(|| ()).unwrap();

        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(9), "too fast: {waited:?}");
        assert!(waited <= Duration::from_secs(25), "too slow: {waited:?}");
    }

    #[test]
    fn dynamic_rate_is_resolved_every_decision() {
        // 1/s on the first resolution, 100/s afterwards: total throughput
        // must approach the higher rate, not stay at the initial one
        let first = AtomicBool::new(true);
        let throttle = Throttle::builder()
            .rate_fn(move || {
                if first.swap(false, Ordering::SeqCst) {
                    1.0
                } else {
                    100.0
                }
            })
            .build()
            .unwrap();

        let started = Instant::now();
        thread_pool(12).install(|| {
            use rayon::prelude::*;

            (0..10)
                .into_par_iter()
                .for_each(|_| throttle.run(|| ()).unwrap());
        });

        let took = started.elapsed();

        // the single 1-second tick dominates; at a constant 1/s this would
        // take at least 9 seconds
        assert!(took >= Duration::from_millis(900), "too fast: {took:?}");
        assert!(took <= Duration::from_millis(3500), "too slow: {took:?}");
    }

    #[test]
    fn running_count_stays_within_in_flight_callers() {
        let throttle = Arc::new(Throttle::builder().per_second(500.0).build().unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                thread::spawn(move || {
                    for _ in 0..5 {
                        throttle
                            .run(|| {
                                let running = throttle.running_count();
                                assert!(running >= 1);
                                assert!(running <= 8);
                                thread::sleep(Duration::from_millis(
                                    rand::random::<u64>() % 5,
                                ));
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(throttle.running_count(), 0);
        assert_eq!(throttle.pending_count(), 0);
    }

    #[test]
    fn releaser_goes_idle_then_serves_a_later_caller() {
        let throttle = Throttle::builder().per_second(50.0).build().unwrap();

        throttle.run(|| ()).unwrap();
        assert!(!throttle.has_pending());

        // well past one 20ms period: the releaser has wound down
        thread::sleep(Duration::from_millis(200));

        // a fresh caller must restart it; the bound turns a regression
        // into a test failure instead of a hang
        let ans = throttle.run_within(Duration::from_secs(5), || "again");
        assert_eq!(ans, Ok("again"));
    }

    #[test]
    fn slot_released_when_operation_fails() {
        let throttle = Throttle::builder().per_second(1000.0).build().unwrap();

        for _ in 0..5 {
            let ans = throttle.run(|| Err::<(), &str>("boom")).unwrap();
            assert_eq!(ans, Err("boom"));
        }

        assert_eq!(throttle.running_count(), 0);
    }

    #[test]
    fn slot_released_when_operation_panics() {
        let throttle = Throttle::builder().per_second(1000.0).build().unwrap();

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            throttle.run(|| panic!("kaboom")).unwrap();
        }));
        assert!(unwound.is_err());

        assert_eq!(throttle.running_count(), 0);

        // the throttle keeps working afterwards
        assert_eq!(throttle.run(|| 7).unwrap(), 7);
    }

    #[test]
    fn admission_wait_respects_timeout() {
        let throttle = Throttle::builder().per_second(0.1).build().unwrap();

        let timeout = Duration::from_millis(200);
        let ans = throttle.run_within(timeout, || ());

        assert_eq!(ans, Err(Error::AdmissionTimeout(timeout)));
        assert_eq!(throttle.pending_count(), 0);
        assert_eq!(throttle.running_count(), 0);
    }

    #[test]
    fn invalid_dynamic_rate_fails_waiters_fast() {
        let throttle = Arc::new(Throttle::builder().rate_fn(|| -1.0).build().unwrap());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                thread::spawn(move || throttle.run(|| ()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(Error::InvalidRate(-1.0)));
        }

        assert_eq!(throttle.pending_count(), 0);

        // the fault is permanent, later callers fail immediately
        assert_eq!(throttle.run(|| ()), Err(Error::InvalidRate(-1.0)));
    }

    #[test]
    fn interval_counters_reset_between_idle_periods() {
        let throttle = Throttle::builder().per_second(1000.0).build().unwrap();

        throttle.run(|| ()).unwrap();
        assert_eq!(throttle.interval_admitted_count(), 1);

        // the next fully-idle arrival opens a new interval
        throttle.run(|| ()).unwrap();
        assert_eq!(throttle.interval_admitted_count(), 1);
        assert!(throttle.interval_elapsed() < Duration::from_secs(1));

        let admitted = thread_pool(4).install(|| {
            use rayon::prelude::*;

            (0..3).into_par_iter().for_each(|_| {
                throttle
                    .run(|| thread::sleep(Duration::from_millis(10)))
                    .unwrap()
            });
            throttle.interval_admitted_count()
        });

        assert_eq!(admitted, 3);
    }
}
