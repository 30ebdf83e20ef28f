//! In-memory resource provider
//!
//! Holds every resource in a single mutex-guarded map set. Creates reject
//! duplicates with `AlreadyExists`, crypto keys require their key ring, and
//! policy writes enforce etags exactly like the cloud APIs do. Used by the
//! test suite and by `provision --dry-run`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BucketStore, IdentityStore, KeyManagement, PolicyStore};
use crate::policy::{Policy, PolicyTarget};
use crate::resource::{
    Bucket, BucketName, CryptoKey, CryptoKeyName, KeyRing, KeyRingName, ResourceKind,
    ServiceAccount, ServiceAccountEmail, ENCRYPT_DECRYPT_PURPOSE,
};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    key_rings: BTreeMap<String, KeyRing>,
    crypto_keys: BTreeMap<String, CryptoKey>,
    buckets: BTreeMap<String, Bucket>,
    service_accounts: BTreeMap<String, ServiceAccount>,
    policies: HashMap<String, Policy>,
    creates: HashMap<ResourceKind, u32>,
    policy_writes: u32,
    next_etag: u64,
}

impl State {
    fn fresh_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("etag-{}", self.next_etag)
    }

    fn record_create(&mut self, kind: ResourceKind) {
        *self.creates.entry(kind).or_default() += 1;
    }

    fn init_policy(&mut self, resource: String) {
        let etag = self.fresh_etag();
        self.policies.insert(
            resource,
            Policy {
                version: Some(1),
                etag: Some(etag),
                ..Default::default()
            },
        );
    }
}

/// In-process provider implementing every capability trait
#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<State>,
}

impl MemoryProvider {
    /// Empty provider: no resources exist
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful creates of the given kind
    pub fn created(&self, kind: ResourceKind) -> u32 {
        self.state.lock().creates.get(&kind).copied().unwrap_or(0)
    }

    /// Number of successful creates across all kinds
    pub fn total_created(&self) -> u32 {
        self.state.lock().creates.values().sum()
    }

    /// Number of accepted policy writes
    pub fn policy_writes(&self) -> u32 {
        self.state.lock().policy_writes
    }

    /// Current policy on a resource, if the resource exists
    pub fn policy(&self, target: &PolicyTarget) -> Option<Policy> {
        self.state.lock().policies.get(&target.to_string()).cloned()
    }

    fn ensure_target_exists(state: &State, target: &PolicyTarget) -> Result<()> {
        let exists = match target {
            PolicyTarget::CryptoKey(name) => state.crypto_keys.contains_key(&name.to_string()),
            PolicyTarget::Bucket(name) => state.buckets.contains_key(name.as_str()),
        };
        if exists {
            Ok(())
        } else {
            Err(Error::provider_permanent(
                target.kind(),
                target.to_string(),
                "resource not found",
            ))
        }
    }
}

#[async_trait]
impl KeyManagement for MemoryProvider {
    async fn get_key_ring(&self, name: &KeyRingName) -> Result<Option<KeyRing>> {
        Ok(self.state.lock().key_rings.get(&name.to_string()).cloned())
    }

    async fn create_key_ring(&self, name: &KeyRingName) -> Result<KeyRing> {
        let mut state = self.state.lock();
        let key = name.to_string();
        if state.key_rings.contains_key(&key) {
            return Err(Error::already_exists(ResourceKind::KeyRing, key));
        }
        let ring = KeyRing { name: key.clone() };
        state.key_rings.insert(key, ring.clone());
        state.record_create(ResourceKind::KeyRing);
        Ok(ring)
    }

    async fn get_crypto_key(&self, name: &CryptoKeyName) -> Result<Option<CryptoKey>> {
        Ok(self.state.lock().crypto_keys.get(&name.to_string()).cloned())
    }

    async fn create_crypto_key(&self, name: &CryptoKeyName) -> Result<CryptoKey> {
        let mut state = self.state.lock();
        let key = name.to_string();
        if !state.key_rings.contains_key(&name.parent().to_string()) {
            return Err(Error::provider_permanent(
                ResourceKind::CryptoKey,
                key,
                format!("parent key ring {} not found", name.parent()),
            ));
        }
        if state.crypto_keys.contains_key(&key) {
            return Err(Error::already_exists(ResourceKind::CryptoKey, key));
        }
        let crypto_key = CryptoKey {
            name: key.clone(),
            purpose: ENCRYPT_DECRYPT_PURPOSE.to_string(),
        };
        state.crypto_keys.insert(key.clone(), crypto_key.clone());
        state.init_policy(key);
        state.record_create(ResourceKind::CryptoKey);
        Ok(crypto_key)
    }
}

#[async_trait]
impl BucketStore for MemoryProvider {
    async fn get_bucket(&self, name: &BucketName) -> Result<Option<Bucket>> {
        Ok(self.state.lock().buckets.get(name.as_str()).cloned())
    }

    async fn create_bucket(
        &self,
        _project: &str,
        name: &BucketName,
        location: &str,
    ) -> Result<Bucket> {
        let mut state = self.state.lock();
        if state.buckets.contains_key(name.as_str()) {
            return Err(Error::already_exists(ResourceKind::Bucket, name.as_str()));
        }
        let bucket = Bucket {
            name: name.to_string(),
            location: Some(location.to_string()),
        };
        state.buckets.insert(name.to_string(), bucket.clone());
        state.init_policy(PolicyTarget::Bucket(name.clone()).to_string());
        state.record_create(ResourceKind::Bucket);
        Ok(bucket)
    }
}

#[async_trait]
impl IdentityStore for MemoryProvider {
    async fn get_service_account(
        &self,
        email: &ServiceAccountEmail,
    ) -> Result<Option<ServiceAccount>> {
        Ok(self
            .state
            .lock()
            .service_accounts
            .get(email.as_str())
            .cloned())
    }

    async fn create_service_account(
        &self,
        project: &str,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount> {
        let email = ServiceAccountEmail::for_account(project, account_id)?;
        let mut state = self.state.lock();
        if state.service_accounts.contains_key(email.as_str()) {
            return Err(Error::already_exists(
                ResourceKind::ServiceAccount,
                email.as_str(),
            ));
        }
        let unique_id = format!("{:021}", state.service_accounts.len() + 1);
        let account = ServiceAccount {
            email: email.to_string(),
            display_name: display_name.to_string(),
            unique_id,
        };
        state
            .service_accounts
            .insert(email.to_string(), account.clone());
        state.record_create(ResourceKind::ServiceAccount);
        Ok(account)
    }
}

#[async_trait]
impl PolicyStore for MemoryProvider {
    async fn get_policy(&self, target: &PolicyTarget) -> Result<Policy> {
        let state = self.state.lock();
        Self::ensure_target_exists(&state, target)?;
        Ok(state
            .policies
            .get(&target.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn set_policy(&self, target: &PolicyTarget, policy: &Policy) -> Result<Policy> {
        let mut state = self.state.lock();
        Self::ensure_target_exists(&state, target)?;

        let key = target.to_string();
        let current_etag = state.policies.get(&key).and_then(|p| p.etag.clone());
        if current_etag != policy.etag {
            return Err(Error::policy_conflict(key));
        }

        let mut stored = policy.clone();
        stored.etag = Some(state.fresh_etag());
        state.policies.insert(key, stored.clone());
        state.policy_writes += 1;
        Ok(stored)
    }
}
