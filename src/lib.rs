//! A call-rate throttle library designed for thread-based concurrency.
//!
//! # Concepts
//!
//! This crate contain two primary types: [`Throttle`] and [`ThrottlePool`].
//!
//! Each [`Throttle`] bounds how many calls of a protected operation may
//! *start* per second, no matter how many threads are calling it at once.
//! Callers just wrap the operation with [`Throttle::run()`]: the calling
//! thread blocks until the throttle admits it, runs the operation, and the
//! admission slot is given back when the operation finishes, even when it
//! fails or panics.
//!
//! On the other hand, [`ThrottlePool`] can automatic create [`Throttle`]
//! when corresponding `id` first time be used. User can treat `id` as some
//! kind of resource identity like hostname, IP address, etc.
//!
//! # How admissions are paced
//!
//! The first caller arriving at an idle throttle opens a new *interval* and
//! wakes a single background releaser. The releaser ticks once per
//! `1 / rate` and lets at most one waiting caller through per tick, as long
//! as the interval's cumulative admissions stay below the accrued allowance
//! `floor(elapsed × rate)`. Once nobody is waiting the releaser winds down;
//! the next caller restarts it.
//!
//! ```text
//! c: callers blocked in run(), a: admission, p = 1/rate
//!
//! callers:    c1 c2 c3 c4                  (all arrive at t=0)
//!
//! releaser:   |--p--|--p--|--p--|--p--|
//!                   a     a     a     a
//!                   c1    c2    c3    c4   (one admission per tick,
//!                                           while the accrual has room)
//! time pass ----->
//! ```
//!
//! Because allowance accrues continuously with elapsed time rather than
//! refilling in fixed windows, a caller admitted early in an interval never
//! pushes later callers a whole window back; they are admitted
//! proportionally sooner.
//!
//! The permitted rate is either a fixed `per_second` value or a
//! [`rate_fn`](ThrottleBuilder::rate_fn) callback resolved fresh before
//! every releaser decision, so the rate can follow live feedback (input vs.
//! output speed, downstream latency, ...) while callers keep blocking on
//! the same throttle.
//!
//! [`Throttle`] would not create threads for callers, but only block the
//! current one. User should create threads by themself and sync throttle to
//! all those threads, to control access speed entirely.
//!
//! # Examples
//!
//! ```rust
//! use pacegate::ThrottlePool;
//! use rayon::prelude::*;
//!
//! // Make sure we have enough of threads can be blocked.
//! // Here we use rayon as example but you can choice any thread implementation.
//! rayon::ThreadPoolBuilder::new()
//!     .num_threads(8)
//!     .build_global()
//!     .unwrap();
//!
//! // Create ThrottlePool.
//! //
//! // In here `id` is `bool` type for demonstration.
//! // If you're writing a web spider, type of `id` might should be `url::Host`.
//! let throttles: ThrottlePool<bool> = ThrottlePool::builder()
//!     .per_second(100.0) // at most 100 calls per second, per throttle
//!     .build()
//!     .unwrap();
//!
//! let mut all_added_one: Vec<i32> = vec![1, 2, 3, 4, 5, 6]
//!     .into_par_iter()
//!     .map(|x| {
//!         throttles
//!             .get(x >= 5)    // 5,6 in throttle `true` & 1,2,3,4 in throttle `false`
//!             .run(|| x + 1)  // here is the operation we want to throttling
//!             .unwrap()
//!     })
//!     .collect();
//!
//! assert_eq!(all_added_one, vec![2, 3, 4, 5, 6, 7]);
//! ```
//!
//! # Diagnostics
//!
//! Admission events and releaser lifecycle are emitted through
//! [`tracing`](https://docs.rs/tracing) at `debug`/`trace` level, tagged
//! with the throttle's [`name`](ThrottleBuilder::name). The crate never
//! installs a subscriber; wiring one up is the application's business.

mod throttle;
mod throttle_pool;

#[doc(inline)]
pub use throttle::{Error, RateFn, Throttle, ThrottleBuilder};

#[doc(inline)]
pub use throttle_pool::{ThrottlePool, ThrottlePoolBuilder};
