use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::CoreError;

use super::{PoolKey, TrafficClass};

type Factory<H> = Box<dyn Fn(&PoolKey) -> H + Send + Sync>;

/// Lazily created, cached pool handles keyed by [`PoolKey`].
pub struct PoolRouter<H> {
    factory: Factory<H>,
    pools: Mutex<HashMap<PoolKey, Arc<H>>>,
}

impl<H> fmt::Debug for PoolRouter<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRouter")
            .field("pools", &self.len())
            .finish_non_exhaustive()
    }
}

impl<H> PoolRouter<H> {
    /// `factory` opens a new pool the first time a key is seen.
    pub fn new(factory: impl Fn(&PoolKey) -> H + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Pool for `base` in `class`.
    pub fn resolve(&self, base: &str, class: TrafficClass) -> Result<Arc<H>, CoreError> {
        let key = PoolKey::new(base, class)?;
        Ok(self.resolve_key(&key))
    }

    /// Pool for an already normalized key.
    pub fn resolve_key(&self, key: &PoolKey) -> Arc<H> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(key) {
            return Arc::clone(pool);
        }
        debug!(pool = %key, "opening pool");
        let pool = Arc::new((self.factory)(key));
        pools.insert(key.clone(), Arc::clone(&pool));
        pool
    }

    pub fn len(&self) -> usize {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
