//! Resource provider abstraction layer
//!
//! One narrow trait per capability, so each can be mocked on its own:
//!
//! - [`KeyManagement`] - KMS key rings and crypto keys
//! - [`BucketStore`] - object storage buckets
//! - [`IdentityStore`] - service accounts
//! - [`PolicyStore`] - access policy documents on keys and buckets
//!
//! Lookups return `Ok(None)` for a resource that does not exist and an
//! error for everything else. Callers must never treat an error as absence.
//!
//! # Implementations
//!
//! - [`GcpProvider`] - Google Cloud REST APIs
//! - [`MemoryProvider`] - in-process state for tests and dry runs

pub mod gcp;
mod memory;

pub use gcp::GcpProvider;
pub use memory::MemoryProvider;

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::policy::{Policy, PolicyTarget};
use crate::resource::{
    Bucket, BucketName, CryptoKey, CryptoKeyName, KeyRing, KeyRingName, ServiceAccount,
    ServiceAccountEmail,
};
use crate::Result;

/// Key ring and crypto key operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyManagement: Send + Sync {
    /// Look up a key ring by name
    async fn get_key_ring(&self, name: &KeyRingName) -> Result<Option<KeyRing>>;

    /// Create a key ring. Returns `Error::AlreadyExists` if it exists.
    async fn create_key_ring(&self, name: &KeyRingName) -> Result<KeyRing>;

    /// Look up a crypto key by name
    async fn get_crypto_key(&self, name: &CryptoKeyName) -> Result<Option<CryptoKey>>;

    /// Create an encrypt/decrypt crypto key in its parent key ring
    async fn create_crypto_key(&self, name: &CryptoKeyName) -> Result<CryptoKey>;
}

/// Object storage bucket operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Look up a bucket by name
    async fn get_bucket(&self, name: &BucketName) -> Result<Option<Bucket>>;

    /// Create a bucket owned by `project` in `location`
    async fn create_bucket(&self, project: &str, name: &BucketName, location: &str)
        -> Result<Bucket>;
}

/// Service account operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up a service account by email
    async fn get_service_account(&self, email: &ServiceAccountEmail)
        -> Result<Option<ServiceAccount>>;

    /// Create a service account with the given id and display name
    async fn create_service_account(
        &self,
        project: &str,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount>;
}

/// Access policy read/write
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Read the current policy, including its etag
    async fn get_policy(&self, target: &PolicyTarget) -> Result<Policy>;

    /// Write a policy. Returns `Error::PolicyConflict` if the etag is stale.
    async fn set_policy(&self, target: &PolicyTarget, policy: &Policy) -> Result<Policy>;
}

/// The capabilities a bootstrap run needs
#[derive(Clone)]
pub struct Providers {
    /// KMS
    pub keys: Arc<dyn KeyManagement>,
    /// Object storage
    pub buckets: Arc<dyn BucketStore>,
    /// Service accounts
    pub identities: Arc<dyn IdentityStore>,
    /// Access policies
    pub policies: Arc<dyn PolicyStore>,
}

impl Providers {
    /// Use one implementation for every capability
    pub fn from_single<P>(provider: Arc<P>) -> Self
    where
        P: KeyManagement + BucketStore + IdentityStore + PolicyStore + 'static,
    {
        Self {
            keys: provider.clone(),
            buckets: provider.clone(),
            identities: provider.clone(),
            policies: provider,
        }
    }
}
