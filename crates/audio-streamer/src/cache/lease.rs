use std::sync::{Arc, Weak};

use super::CacheStore;
use crate::provider::FileProvider;

/// An open reference on a cache entry. The store keeps the provider alive while any lease
/// exists; dropping the last lease releases it.
pub struct ProviderLease {
    store: Arc<CacheStore>,
    identity: String,
    provider: Weak<FileProvider>,
}

impl ProviderLease {
    pub(crate) fn new(store: Arc<CacheStore>, identity: String, provider: Weak<FileProvider>) -> Self {
        Self {
            store,
            identity,
            provider,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Non-owning handle; consumers upgrade per use.
    pub fn provider(&self) -> Weak<FileProvider> {
        self.provider.clone()
    }

    pub fn upgrade(&self) -> Option<Arc<FileProvider>> {
        self.provider.upgrade()
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }
}

impl Drop for ProviderLease {
    fn drop(&mut self) {
        self.store.release(&self.identity);
    }
}
