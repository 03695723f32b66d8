use std::fmt;
use std::sync::Arc;

use moka::future::Cache;

use crate::error::Result;
use crate::resource::Resource;
use crate::CacheManager;

/// Implements [`CacheManager`] with [`moka`](https://github.com/moka-rs/moka)
/// as the backend, keeping whole [`Resource`] values in memory without a
/// serialization step.
///
/// Reads observe writes immediately and a key's value is replaced
/// atomically, which is all the engine requires of a back-end. Primary and
/// secondary (Vary) keys each occupy their own slot, so a response stored
/// under both counts twice against the capacity.
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
#[derive(Clone)]
pub struct MokaManager {
    resources: Arc<Cache<String, Resource>>,
}

impl fmt::Debug for MokaManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MokaManager")
            .field("resources", &self.resources.entry_count())
            .field("capacity", &self.resources.policy().max_capacity())
            .finish()
    }
}

impl Default for MokaManager {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MokaManager {
    /// Manager holding at most `max_resources` stored responses.
    pub fn new(max_resources: u64) -> Self {
        Self { resources: Arc::new(Cache::new(max_resources)) }
    }

    /// Wraps a pre-configured cache, for callers that want a time-to-live,
    /// a size-based weigher or an eviction listener.
    pub fn from_cache(cache: Cache<String, Resource>) -> Self {
        Self { resources: Arc::new(cache) }
    }

    /// Drops every stored response.
    pub async fn clear(&self) -> Result<()> {
        self.resources.invalidate_all();
        self.resources.run_pending_tasks().await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheManager for MokaManager {
    async fn retrieve(&self, key: &str) -> Result<Option<Resource>> {
        Ok(self.resources.get(key).await)
    }

    async fn store(&self, resource: Resource, keys: &[String]) -> Result<()> {
        for key in keys {
            self.resources.insert(key.clone(), resource.clone()).await;
        }
        self.resources.run_pending_tasks().await;
        Ok(())
    }

    async fn freshen(&self, resource: Resource, key: &str) -> Result<()> {
        if let Some(mut stored) = self.resources.get(key).await {
            stored.headers = resource.headers.clone();
            self.resources.insert(key.to_string(), stored).await;
            self.resources.run_pending_tasks().await;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.resources.invalidate(key).await;
        self.resources.run_pending_tasks().await;
        Ok(())
    }
}
