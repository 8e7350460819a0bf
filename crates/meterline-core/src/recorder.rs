//! Writes keyed samples to the store and the cache

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::SampleCache;
use crate::node::{SampleRecord, Scalar};
use crate::registry::Index;
use crate::rules::Derived;
use crate::store::{Store, StoreResult};

pub struct Recorder {
    store: Arc<dyn Store>,
    cache: Arc<SampleCache>,
}

impl Recorder {
    pub fn new(store: Arc<dyn Store>, cache: Arc<SampleCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<SampleCache> {
        &self.cache
    }

    /// Record one value under an element key.
    ///
    /// Keys known to the index are persisted; every key refreshes the cache.
    /// Returns whether the value was persisted.
    pub async fn record(
        &self,
        index: &Index,
        key: &str,
        value: Scalar,
        time: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let persisted = match index.element_ids.get(key) {
            Some(ids) => {
                let record = SampleRecord::new(ids.series(), time, value.clone());
                self.store.append_samples(&[record]).await?;
                true
            }
            None => {
                debug!(key = %key, "Key is not indexed, caching only");
                false
            }
        };
        self.cache.set(key, value, time);
        Ok(persisted)
    }

    /// Record every value produced by the rule engine
    pub async fn record_derived(&self, index: &Index, derived: &[Derived]) -> StoreResult<usize> {
        let mut persisted = 0;
        for d in derived {
            if self.record(index, &d.key, d.value.clone(), d.time).await? {
                persisted += 1;
            }
        }
        Ok(persisted)
    }

    /// Fill the cache with the latest stored value of every indexed DataItem
    pub async fn warm_start(&self, index: &Index, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut loaded = 0;
        for (key, series) in index.dataitems() {
            if let Some(latest) = self.store.latest_before(series, now).await? {
                self.cache.set(key, latest.value, latest.time);
                loaded += 1;
            }
        }
        info!(loaded, "Warmed sample cache from store");
        Ok(loaded)
    }
}
