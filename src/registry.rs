//! Provider registry
//!
//! Maps each [`Provider`] to a repository factory. This is the crate's sole
//! polymorphism point: every provider variant is fully encapsulated behind
//! the same [`Repository`] contract, dispatched through one lookup — no
//! runtime container, no reflection.

use crate::error::{Error, Result};
use crate::provider::Repository;
use crate::types::{DownloadRequest, Provider};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Constructor for a provider's repository, invoked once per admitted request
pub type RepositoryFactory =
    Arc<dyn Fn(&DownloadRequest) -> Result<Arc<dyn Repository>> + Send + Sync>;

/// Registry of provider repository factories
#[derive(Clone, Default)]
pub struct Registry {
    factories: Arc<RwLock<HashMap<Provider, RepositoryFactory>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for a provider
    pub fn register(&self, provider: Provider, factory: RepositoryFactory) {
        if let Ok(mut factories) = self.factories.write() {
            factories.insert(provider, factory);
        }
    }

    /// Whether a factory is registered for `provider`
    pub fn supports(&self, provider: Provider) -> bool {
        self.factories
            .read()
            .map(|f| f.contains_key(&provider))
            .unwrap_or(false)
    }

    /// Build a repository for the request's provider.
    ///
    /// Fails with [`Error::ProviderNotSupported`] when no factory is
    /// registered.
    pub fn create(&self, request: &DownloadRequest) -> Result<Arc<dyn Repository>> {
        let factory = self
            .factories
            .read()
            .ok()
            .and_then(|factories| factories.get(&request.provider).cloned())
            .ok_or(Error::ProviderNotSupported(request.provider))?;

        factory(request)
    }
}
