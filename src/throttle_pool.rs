use std::{
    collections::HashMap,
    fmt::{self, Debug},
    hash::Hash,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use crate::throttle::{Error, Throttle, ThrottleBuilder};

/// A [`Throttle`] pool to pace calls against multiple resources.
///
/// Every distinct `id` gets its own throttle with its own interval,
/// counters and releaser; a single throttle must never be shared across
/// unrelated operations, and the pool is the supported way to hold one per
/// resource.
///
/// See [module](crate) document for more detail.
pub struct ThrottlePool<K: Hash + Eq> {
    throttles: Mutex<HashMap<K, Arc<Throttle>>>,
    throttle_builder: ThrottleBuilder,
}

impl<K: Hash + Eq> ThrottlePool<K> {
    /// Start to create a `ThrottlePool` by [`ThrottlePoolBuilder`].
    pub fn builder() -> ThrottlePoolBuilder<K> {
        ThrottlePoolBuilder::default()
    }

    /// Get a throttle from pool, if not exists, create it.
    pub fn get(&self, id: K) -> Arc<Throttle> {
        Arc::clone(
            self.throttles
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .entry(id)
                .or_insert_with(|| {
                    Arc::new(
                        self.throttle_builder
                            .clone()
                            .build()
                            .expect("rate already validated when the pool was built"),
                    )
                }),
        )
    }
}

impl<K: Hash + Eq> Debug for ThrottlePool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(&format!("ThrottlePool<{}>", std::any::type_name::<K>()))
            .field("throttle_builder", &self.throttle_builder)
            .finish()
    }
}

/// Use to build a [`ThrottlePool`].
///
/// Created by [`ThrottlePool::builder()`] API.
pub struct ThrottlePoolBuilder<K: Hash + Eq> {
    throttle_builder: ThrottleBuilder,
    phantom: PhantomData<K>,
}

impl<K: Hash + Eq> Default for ThrottlePoolBuilder<K> {
    fn default() -> Self {
        Self {
            throttle_builder: Throttle::builder(),
            phantom: PhantomData,
        }
    }
}

impl<K: Hash + Eq> ThrottlePoolBuilder<K> {
    /// Set the fixed admission rate of throttles in this pool, in calls
    /// per second.
    pub fn per_second(&mut self, per_second: f64) -> &mut Self {
        self.throttle_builder.per_second(per_second);
        self
    }

    /// Set the dynamic rate source of throttles in this pool.
    ///
    /// All throttles share the one callback; it is resolved independently
    /// by each throttle's releaser.
    pub fn rate_fn<F>(&mut self, rate_fn: F) -> &mut Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.throttle_builder.rate_fn(rate_fn);
        self
    }

    /// Diagnostics name shared by throttles in this pool.
    pub fn name<S>(&mut self, name: S) -> &mut Self
    where
        S: Into<String>,
    {
        self.throttle_builder.name(name);
        self
    }

    /// Create a new [`ThrottlePool`] with current configuration.
    ///
    /// Fails with [`Error::InvalidRate`] when the fixed rate is
    /// non-positive, so a misconfigured pool is rejected up front rather
    /// than on first use.
    pub fn build(&self) -> Result<ThrottlePool<K>, Error> {
        let mut throttle_builder = self.throttle_builder.clone();

        // check the configuration can initialize throttles properly
        throttle_builder.build()?;

        Ok(ThrottlePool {
            throttles: Mutex::new(HashMap::new()),
            throttle_builder,
        })
    }
}

impl<K: Hash + Eq> Debug for ThrottlePoolBuilder<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(&format!(
            "ThrottlePoolBuilder<{}>",
            std::any::type_name::<K>()
        ))
        .field("throttle_builder", &self.throttle_builder)
        .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn run() {
        let throttles: ThrottlePool<u32> = ThrottlePool::builder()
            .per_second(1000.0)
            .build()
            .unwrap();

        let results: Vec<i32> = vec![1, 2, 3]
            .into_par_iter()
            .map(|x| throttles.get(1).run(|| x + 1).unwrap())
            .collect();

        assert_eq!(results, vec![2, 3, 4]);
    }

    #[test]
    fn same_id_shares_one_throttle() {
        let throttles: ThrottlePool<&str> = ThrottlePool::builder()
            .per_second(1000.0)
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(&throttles.get("a"), &throttles.get("a")));
        assert!(!Arc::ptr_eq(&throttles.get("a"), &throttles.get("b")));
    }

    #[test]
    fn invalid_rate_rejected_up_front() {
        let result: Result<ThrottlePool<u32>, _> =
            ThrottlePool::builder().per_second(0.0).build();

        assert_eq!(result.err(), Some(Error::InvalidRate(0.0)));
    }
}
