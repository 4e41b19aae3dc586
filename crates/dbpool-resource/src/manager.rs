//! The capability a pool uses to create, check and destroy resources

use std::hash::Hash;

use async_trait::async_trait;

/// Creates, refurbishes and destroys the resources of one pool
///
/// Resources are opaque to the pool; it only needs to tell them apart, so
/// they must be cheap handles with identity based equality. Every method
/// may fail. Failures are handled by the pool and never reach the caller
/// of `checkout`/`checkin`.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Resource: Clone + Eq + Hash + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a new resource
    async fn acquire(&self) -> Result<Self::Resource, Self::Error>;

    /// Prepare a resource right before it is handed to a caller
    ///
    /// A failure destroys the resource and the checkout is retried with
    /// another one.
    async fn refurbish_on_checkout(&self, _resource: &Self::Resource) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Reset a resource a caller has returned
    ///
    /// A failure destroys the resource instead of making it available.
    async fn refurbish_on_checkin(&self, _resource: &Self::Resource) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Health check of a resource sitting idle in the pool
    async fn refurbish_idle(&self, _resource: &Self::Resource) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Release a resource for good
    ///
    /// `checked_out` is true when the resource is destroyed while a caller
    /// may still hold it.
    async fn destroy(&self, resource: &Self::Resource, checked_out: bool) -> Result<(), Self::Error>;
}
