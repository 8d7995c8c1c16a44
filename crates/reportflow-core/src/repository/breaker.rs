//! Breaker state persistence port.
//!
//! Circuit breakers save every transition through this trait so an open
//! breaker survives a restart. `BoxBreakerStore` erases the concrete store
//! so one store can back every breaker in a registry.

use std::future::Future;

use futures_util::future::BoxFuture;
use reportflow_types::breaker::BreakerSnapshot;
use reportflow_types::error::RepositoryError;

pub trait BreakerStateStore: Send + Sync {
    fn load(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<BreakerSnapshot>, RepositoryError>> + Send;

    /// Upsert by breaker name.
    fn save(
        &self,
        snapshot: &BreakerSnapshot,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<BreakerSnapshot>, RepositoryError>> + Send;
}

/// Object-safe version of [`BreakerStateStore`] with boxed futures.
pub trait BreakerStateStoreDyn: Send + Sync {
    fn load_boxed<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<BreakerSnapshot>, RepositoryError>>;

    fn save_boxed<'a>(
        &'a self,
        snapshot: &'a BreakerSnapshot,
    ) -> BoxFuture<'a, Result<(), RepositoryError>>;

    fn list_boxed(&self) -> BoxFuture<'_, Result<Vec<BreakerSnapshot>, RepositoryError>>;
}

impl<T: BreakerStateStore> BreakerStateStoreDyn for T {
    fn load_boxed<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<BreakerSnapshot>, RepositoryError>> {
        Box::pin(self.load(name))
    }

    fn save_boxed<'a>(
        &'a self,
        snapshot: &'a BreakerSnapshot,
    ) -> BoxFuture<'a, Result<(), RepositoryError>> {
        Box::pin(self.save(snapshot))
    }

    fn list_boxed(&self) -> BoxFuture<'_, Result<Vec<BreakerSnapshot>, RepositoryError>> {
        Box::pin(self.list())
    }
}

/// Type-erased breaker store.
pub struct BoxBreakerStore {
    inner: Box<dyn BreakerStateStoreDyn>,
}

impl BoxBreakerStore {
    pub fn new<T: BreakerStateStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn load(&self, name: &str) -> Result<Option<BreakerSnapshot>, RepositoryError> {
        self.inner.load_boxed(name).await
    }

    pub async fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), RepositoryError> {
        self.inner.save_boxed(snapshot).await
    }

    pub async fn list(&self) -> Result<Vec<BreakerSnapshot>, RepositoryError> {
        self.inner.list_boxed().await
    }
}
