//! Provisioning orchestrator
//!
//! Drives one bootstrap run:
//!
//! 1. Generate the CA and the server certificate
//! 2. Ensure the key ring, then the crypto key inside it
//! 3. Ensure the storage bucket
//! 4. Ensure the service account
//! 5. Grant the service account its roles on the key and the bucket
//! 6. Assemble the Secret and ConfigMap
//!
//! Every ensure step looks the resource up first and creates it only when the
//! lookup reported genuine absence. A lookup that fails is retried while the
//! failure is transient and otherwise aborts the run; it is never read as
//! "not found". Creates are a single attempt. If a create loses a race with
//! another writer, the resource is re-read and reported as existing.

use std::future::Future;

use tracing::{info, warn};

use crate::config::BootstrapConfig;
use crate::manifest::{build_manifests, render_manifests, ManifestInputs};
use crate::pki::{CertificateAuthority, ServerCertificate};
use crate::policy::{GrantOutcome, PolicyBinder, PolicyTarget};
use crate::provider::Providers;
use crate::resource::{
    Bucket, BucketName, CryptoKey, CryptoKeyName, KeyRing, KeyRingName, LocationName,
    ResourceKind, ServiceAccount, ServiceAccountEmail, ENCRYPT_DECRYPT_PURPOSE,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{
    Error, Result, KMS_ENCRYPTER_DECRYPTER_ROLE, STORAGE_LEGACY_BUCKET_READER_ROLE,
    STORAGE_OBJECT_ADMIN_ROLE,
};

/// Roles granted on the crypto key
pub const CRYPTO_KEY_ROLES: &[&str] = &[KMS_ENCRYPTER_DECRYPTER_ROLE];

/// Roles granted on the bucket
pub const BUCKET_ROLES: &[&str] = &[
    STORAGE_OBJECT_ADMIN_ROLE,
    STORAGE_LEGACY_BUCKET_READER_ROLE,
];

/// Fully-qualified names of everything a run touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePlan {
    /// Project owning the resources
    pub project_id: String,
    /// Key ring
    pub key_ring: KeyRingName,
    /// Crypto key inside `key_ring`
    pub crypto_key: CryptoKeyName,
    /// Bucket
    pub bucket: BucketName,
    /// Bucket location
    pub bucket_location: String,
    /// Service account id
    pub service_account_id: String,
    /// Service account display name
    pub service_account_display_name: String,
    /// Service account email derived from id and project
    pub service_account_email: ServiceAccountEmail,
}

impl ResourcePlan {
    /// Derive every identifier from the configuration
    pub fn from_config(config: &BootstrapConfig) -> Result<Self> {
        let location = LocationName::new(&config.project_id, &config.location)?;
        let key_ring = location.key_ring(&config.key_ring_id)?;
        let crypto_key = key_ring.crypto_key(&config.crypto_key_id)?;

        Ok(Self {
            project_id: config.project_id.clone(),
            key_ring,
            crypto_key,
            bucket: BucketName::new(&config.bucket_name)?,
            bucket_location: config.bucket_location.clone(),
            service_account_id: config.service_account_id.clone(),
            service_account_display_name: config.service_account_display_name.clone(),
            service_account_email: ServiceAccountEmail::for_account(
                &config.project_id,
                &config.service_account_id,
            )?,
        })
    }
}

/// A resource together with whether this run created it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured<T> {
    /// Provider's descriptor
    pub resource: T,
    /// True if this run created the resource
    pub created: bool,
}

impl<T> Ensured<T> {
    fn existing(resource: T) -> Self {
        Self {
            resource,
            created: false,
        }
    }

    fn created(resource: T) -> Self {
        Self {
            resource,
            created: true,
        }
    }
}

/// CA certificate plus the server pair it signed
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// PEM CA certificate
    pub ca_cert_pem: String,
    /// Server certificate and key
    pub server: ServerCertificate,
}

/// Existence of one planned resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStatus {
    /// Resource kind
    pub kind: ResourceKind,
    /// Fully-qualified name
    pub name: String,
    /// Whether the resource exists
    pub exists: bool,
}

/// Outcome of a complete run
pub struct BootstrapReport {
    /// Project id
    pub project_id: String,
    /// Key ring
    pub key_ring: Ensured<KeyRing>,
    /// Crypto key
    pub crypto_key: Ensured<CryptoKey>,
    /// Bucket
    pub bucket: Ensured<Bucket>,
    /// Service account
    pub service_account: Ensured<ServiceAccount>,
    /// Grants on the key, then on the bucket
    pub grants: Vec<GrantOutcome>,
    /// Rendered Secret and ConfigMap
    pub manifest: String,
}

impl BootstrapReport {
    /// Number of resources this run created
    pub fn created_count(&self) -> usize {
        [
            self.key_ring.created,
            self.crypto_key.created,
            self.bucket.created,
            self.service_account.created,
        ]
        .into_iter()
        .filter(|created| *created)
        .count()
    }

    /// Human-readable summary of what was provisioned
    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            format!("Project ID: {}", self.project_id),
            format!("Storage Bucket Name: {}", self.bucket.resource.name),
            format!("Service account email: {}", self.service_account.resource.email),
            format!("KMS key ID: {}", self.crypto_key.resource.name),
        ]
    }
}

/// Runs the provisioning workflow against a set of providers
pub struct Bootstrapper {
    config: BootstrapConfig,
    plan: ResourcePlan,
    providers: Providers,
    lookup_retry: RetryConfig,
    binder: PolicyBinder,
}

impl Bootstrapper {
    /// Validate the configuration and derive the resource plan
    pub fn new(config: BootstrapConfig, providers: Providers) -> Result<Self> {
        config.validate()?;
        let plan = ResourcePlan::from_config(&config)?;
        let lookup_retry = RetryConfig::with_max_attempts(config.lookup_attempts);
        let binder = PolicyBinder::new(
            providers.policies.clone(),
            config.policy_write_attempts,
            lookup_retry.clone(),
        );

        Ok(Self {
            config,
            plan,
            providers,
            lookup_retry,
            binder,
        })
    }

    /// Replace the backoff used for lookups and policy reads
    pub fn with_lookup_retry(mut self, retry: RetryConfig) -> Self {
        self.binder = PolicyBinder::new(
            self.providers.policies.clone(),
            self.config.policy_write_attempts,
            retry.clone(),
        );
        self.lookup_retry = retry;
        self
    }

    /// Identifiers this run provisions
    pub fn plan(&self) -> &ResourcePlan {
        &self.plan
    }

    async fn ensure<T, L, LF, C, CF>(
        &self,
        kind: ResourceKind,
        resource: &str,
        lookup: L,
        create: C,
    ) -> Result<Ensured<T>>
    where
        L: Fn() -> LF,
        LF: Future<Output = Result<Option<T>>>,
        C: FnOnce() -> CF,
        CF: Future<Output = Result<T>>,
    {
        let operation = format!("get {}", kind);

        if let Some(existing) = retry_with_backoff(&self.lookup_retry, &operation, &lookup).await? {
            info!(%kind, resource, created = false, "Resource already exists");
            return Ok(Ensured::existing(existing));
        }

        match create().await {
            Ok(created) => {
                info!(%kind, resource, created = true, "Created resource");
                Ok(Ensured::created(created))
            }
            Err(Error::AlreadyExists { .. }) => {
                warn!(%kind, resource, "Resource appeared concurrently, re-reading");
                match retry_with_backoff(&self.lookup_retry, &operation, &lookup).await? {
                    Some(existing) => Ok(Ensured::existing(existing)),
                    None => Err(Error::provider_permanent(
                        kind,
                        resource,
                        "create reported the resource exists but lookup found nothing",
                    )),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Look up the key ring, creating it if absent
    pub async fn ensure_key_ring(&self) -> Result<Ensured<KeyRing>> {
        let keys = self.providers.keys.as_ref();
        let name = &self.plan.key_ring;
        self.ensure(
            ResourceKind::KeyRing,
            &name.to_string(),
            move || keys.get_key_ring(name),
            move || keys.create_key_ring(name),
        )
        .await
    }

    /// Look up the crypto key inside `key_ring`, creating it if absent
    pub async fn ensure_crypto_key(&self, key_ring: &KeyRing) -> Result<Ensured<CryptoKey>> {
        let name = &self.plan.crypto_key;
        if key_ring.name != name.parent().to_string() {
            return Err(Error::config(format!(
                "crypto key {} does not belong to key ring {}",
                name, key_ring.name
            )));
        }

        let keys = self.providers.keys.as_ref();
        let ensured = self
            .ensure(
                ResourceKind::CryptoKey,
                &name.to_string(),
                move || keys.get_crypto_key(name),
                move || keys.create_crypto_key(name),
            )
            .await?;

        let purpose = &ensured.resource.purpose;
        if !purpose.is_empty() && purpose != ENCRYPT_DECRYPT_PURPOSE {
            return Err(Error::provider_permanent(
                ResourceKind::CryptoKey,
                name.to_string(),
                format!(
                    "existing key has purpose {}, expected {}",
                    purpose, ENCRYPT_DECRYPT_PURPOSE
                ),
            ));
        }
        Ok(ensured)
    }

    /// Look up the bucket, creating it if absent
    pub async fn ensure_bucket(&self) -> Result<Ensured<Bucket>> {
        let buckets = self.providers.buckets.as_ref();
        let name = &self.plan.bucket;
        let project = self.plan.project_id.as_str();
        let location = self.plan.bucket_location.as_str();
        self.ensure(
            ResourceKind::Bucket,
            name.as_str(),
            move || buckets.get_bucket(name),
            move || buckets.create_bucket(project, name, location),
        )
        .await
    }

    /// Look up the service account, creating it if absent
    pub async fn ensure_service_account(&self) -> Result<Ensured<ServiceAccount>> {
        let identities = self.providers.identities.as_ref();
        let email = &self.plan.service_account_email;
        let project = self.plan.project_id.as_str();
        let account_id = self.plan.service_account_id.as_str();
        let display_name = self.plan.service_account_display_name.as_str();
        self.ensure(
            ResourceKind::ServiceAccount,
            email.as_str(),
            move || identities.get_service_account(email),
            move || identities.create_service_account(project, account_id, display_name),
        )
        .await
    }

    /// Create the CA and sign the server certificate for the configured SANs
    pub fn generate_tls(&self) -> Result<TlsMaterial> {
        let ca = CertificateAuthority::new(&self.config.ca_common_name)?;
        let sans = self.config.subject_alt_names();
        let server = ca.issue_server_certificate(&self.config.server_common_name, &sans)?;

        info!(
            dns_names = sans.dns_names.len(),
            ip_addresses = sans.ip_addresses.len(),
            "Generated CA and server certificate"
        );

        Ok(TlsMaterial {
            ca_cert_pem: ca.ca_cert_pem().to_string(),
            server,
        })
    }

    /// Run the full workflow. Any error aborts the run; nothing is rolled back.
    pub async fn run(&self) -> Result<BootstrapReport> {
        info!(
            project = %self.plan.project_id,
            key_ring = %self.plan.key_ring,
            bucket = %self.plan.bucket,
            "Starting bootstrap"
        );

        let tls = self.generate_tls()?;

        let key_ring = self.ensure_key_ring().await?;
        let crypto_key = self.ensure_crypto_key(&key_ring.resource).await?;
        let bucket = self.ensure_bucket().await?;
        let service_account = self.ensure_service_account().await?;

        let member = service_account.resource.email().member();
        let key_grant = self
            .binder
            .grant_roles(
                &PolicyTarget::CryptoKey(self.plan.crypto_key.clone()),
                &member,
                CRYPTO_KEY_ROLES,
            )
            .await?;
        let bucket_grant = self
            .binder
            .grant_roles(
                &PolicyTarget::Bucket(self.plan.bucket.clone()),
                &member,
                BUCKET_ROLES,
            )
            .await?;

        let inputs = ManifestInputs {
            name: self.config.manifest_name.clone(),
            namespace: self.config.namespace.clone(),
            ca_cert: tls.ca_cert_pem,
            server_cert: tls.server.cert_pem,
            server_key: tls.server.key_pem,
            api_addr: self.config.api_addr.clone(),
            bucket_name: bucket.resource.name.clone(),
            kms_key_id: crypto_key.resource.name.clone(),
        };
        let manifest = render_manifests(&build_manifests(&inputs))?;

        let report = BootstrapReport {
            project_id: self.plan.project_id.clone(),
            key_ring,
            crypto_key,
            bucket,
            service_account,
            grants: vec![key_grant, bucket_grant],
            manifest,
        };

        info!(created = report.created_count(), "Bootstrap complete");
        Ok(report)
    }

    /// Report which planned resources exist, without creating anything
    pub async fn inspect(&self) -> Result<Vec<ResourceStatus>> {
        let keys = self.providers.keys.as_ref();
        let buckets = self.providers.buckets.as_ref();
        let identities = self.providers.identities.as_ref();
        let plan = &self.plan;
        let retry = &self.lookup_retry;

        let key_ring = retry_with_backoff(retry, "get key ring", || {
            keys.get_key_ring(&plan.key_ring)
        })
        .await?;
        let crypto_key = retry_with_backoff(retry, "get crypto key", || {
            keys.get_crypto_key(&plan.crypto_key)
        })
        .await?;
        let bucket = retry_with_backoff(retry, "get bucket", || buckets.get_bucket(&plan.bucket))
            .await?;
        let service_account = retry_with_backoff(retry, "get service account", || {
            identities.get_service_account(&plan.service_account_email)
        })
        .await?;

        Ok(vec![
            ResourceStatus {
                kind: ResourceKind::KeyRing,
                name: plan.key_ring.to_string(),
                exists: key_ring.is_some(),
            },
            ResourceStatus {
                kind: ResourceKind::CryptoKey,
                name: plan.crypto_key.to_string(),
                exists: crypto_key.is_some(),
            },
            ResourceStatus {
                kind: ResourceKind::Bucket,
                name: plan.bucket.to_string(),
                exists: bucket.is_some(),
            },
            ResourceStatus {
                kind: ResourceKind::ServiceAccount,
                name: plan.service_account_email.to_string(),
                exists: service_account.is_some(),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{subject_alt_names, verify_server_cert};
    use crate::policy::Binding;
    use crate::provider::{
        MemoryProvider, MockBucketStore, MockIdentityStore, MockKeyManagement, MockPolicyStore,
    };
    use mockall::Sequence;
    use std::sync::Arc;
    use std::time::Duration;

    const PROJECT: &str = "tigerworks-kube";
    const BUCKET: &str = "vault-test-bucket";
    const RING: &str = "projects/tigerworks-kube/locations/global/keyRings/vault";

    fn config() -> BootstrapConfig {
        BootstrapConfig {
            project_id: PROJECT.to_string(),
            bucket_name: BUCKET.to_string(),
            ..Default::default()
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    fn with_keys(keys: MockKeyManagement) -> Bootstrapper {
        let providers = Providers {
            keys: Arc::new(keys),
            buckets: Arc::new(MockBucketStore::new()),
            identities: Arc::new(MockIdentityStore::new()),
            policies: Arc::new(MockPolicyStore::new()),
        };
        Bootstrapper::new(config(), providers)
            .unwrap()
            .with_lookup_retry(fast_retry())
    }

    fn in_memory(provider: Arc<MemoryProvider>) -> Bootstrapper {
        Bootstrapper::new(config(), Providers::from_single(provider))
            .unwrap()
            .with_lookup_retry(fast_retry())
    }

    fn ring() -> KeyRing {
        KeyRing {
            name: RING.to_string(),
        }
    }

    // =========================================================================
    // Ensure-or-create against mocked providers
    // =========================================================================

    #[tokio::test]
    async fn lookup_failure_never_creates() {
        let mut keys = MockKeyManagement::new();
        keys.expect_get_key_ring().times(1).returning(|name| {
            Err(Error::provider_permanent(
                ResourceKind::KeyRing,
                name.to_string(),
                "HTTP 403 Forbidden: permission denied",
            ))
        });
        keys.expect_create_key_ring().times(0);

        let err = with_keys(keys).ensure_key_ring().await.unwrap_err();
        assert!(matches!(err, Error::Provider { retryable: false, .. }));
    }

    #[tokio::test]
    async fn exhausted_transient_lookups_never_create() {
        let mut keys = MockKeyManagement::new();
        keys.expect_get_key_ring()
            .times(3)
            .returning(|_| Err(Error::timeout("get key ring")));
        keys.expect_create_key_ring().times(0);

        let err = with_keys(keys).ensure_key_ring().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn transient_lookup_failure_is_retried() {
        let mut seq = Sequence::new();
        let mut keys = MockKeyManagement::new();
        keys.expect_get_key_ring()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Err(Error::provider(ResourceKind::KeyRing, name.to_string(), "503")));
        keys.expect_get_key_ring()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(ring())));
        keys.expect_create_key_ring().times(0);

        let ensured = with_keys(keys).ensure_key_ring().await.unwrap();
        assert!(!ensured.created);
        assert_eq!(ensured.resource, ring());
    }

    #[tokio::test]
    async fn absent_key_ring_is_created_once() {
        let mut keys = MockKeyManagement::new();
        keys.expect_get_key_ring().times(1).returning(|_| Ok(None));
        keys.expect_create_key_ring()
            .withf(|name| name.to_string() == RING)
            .times(1)
            .returning(|name| {
                Ok(KeyRing {
                    name: name.to_string(),
                })
            });

        let ensured = with_keys(keys).ensure_key_ring().await.unwrap();
        assert!(ensured.created);
        assert_eq!(ensured.resource.name, RING);
    }

    #[tokio::test]
    async fn create_failure_is_not_retried() {
        let mut keys = MockKeyManagement::new();
        keys.expect_get_key_ring().times(1).returning(|_| Ok(None));
        keys.expect_create_key_ring()
            .times(1)
            .returning(|name| Err(Error::provider(ResourceKind::KeyRing, name.to_string(), "503")));

        let err = with_keys(keys).ensure_key_ring().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn lost_create_race_reports_existing() {
        let mut seq = Sequence::new();
        let mut keys = MockKeyManagement::new();
        keys.expect_get_key_ring()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        keys.expect_create_key_ring()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Err(Error::already_exists(ResourceKind::KeyRing, name.to_string())));
        keys.expect_get_key_ring()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(ring())));

        let ensured = with_keys(keys).ensure_key_ring().await.unwrap();
        assert!(!ensured.created);
        assert_eq!(ensured.resource, ring());
    }

    #[tokio::test]
    async fn crypto_key_requires_the_planned_ring() {
        let mut keys = MockKeyManagement::new();
        keys.expect_get_crypto_key().times(0);
        keys.expect_create_crypto_key().times(0);

        let other = KeyRing {
            name: "projects/tigerworks-kube/locations/global/keyRings/other".to_string(),
        };
        let err = with_keys(keys).ensure_crypto_key(&other).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn existing_key_with_wrong_purpose_is_rejected() {
        let mut keys = MockKeyManagement::new();
        keys.expect_get_crypto_key().times(1).returning(|name| {
            Ok(Some(CryptoKey {
                name: name.to_string(),
                purpose: "ASYMMETRIC_SIGN".to_string(),
            }))
        });
        keys.expect_create_crypto_key().times(0);

        let err = with_keys(keys).ensure_crypto_key(&ring()).await.unwrap_err();
        assert!(err.to_string().contains("ASYMMETRIC_SIGN"));
    }

    // =========================================================================
    // Full runs against the in-memory provider
    // =========================================================================

    #[tokio::test]
    async fn ensure_twice_creates_then_finds() {
        let provider = Arc::new(MemoryProvider::new());
        let bootstrapper = in_memory(provider.clone());

        let ring = bootstrapper.ensure_key_ring().await.unwrap();
        assert!(ring.created);
        assert!(!bootstrapper.ensure_key_ring().await.unwrap().created);

        assert!(bootstrapper.ensure_crypto_key(&ring.resource).await.unwrap().created);
        assert!(!bootstrapper.ensure_crypto_key(&ring.resource).await.unwrap().created);

        assert!(bootstrapper.ensure_bucket().await.unwrap().created);
        assert!(!bootstrapper.ensure_bucket().await.unwrap().created);

        assert!(bootstrapper.ensure_service_account().await.unwrap().created);
        assert!(!bootstrapper.ensure_service_account().await.unwrap().created);

        assert_eq!(provider.total_created(), 4);
    }

    #[tokio::test]
    async fn fresh_project_run_creates_everything() {
        let provider = Arc::new(MemoryProvider::new());
        let bootstrapper = in_memory(provider.clone());
        let report = bootstrapper.run().await.unwrap();

        assert_eq!(report.created_count(), 4);
        assert_eq!(report.grants.len(), 2);
        assert!(report.grants.iter().all(|g| g.written));
        assert_eq!(report.grants[1].added_roles.len(), 2);

        let member = report.service_account.resource.email().member();
        let key_policy = provider
            .policy(&PolicyTarget::CryptoKey(bootstrapper.plan().crypto_key.clone()))
            .unwrap();
        assert_eq!(key_policy.binding_count(KMS_ENCRYPTER_DECRYPTER_ROLE, &member), 1);
    }

    #[tokio::test]
    async fn second_run_creates_nothing_and_keeps_single_bindings() {
        let provider = Arc::new(MemoryProvider::new());
        let bootstrapper = in_memory(provider.clone());

        let first = bootstrapper.run().await.unwrap();
        let writes_after_first = provider.policy_writes();
        let second = bootstrapper.run().await.unwrap();

        assert_eq!(first.created_count(), 4);
        assert_eq!(second.created_count(), 0);
        assert!(second.grants.iter().all(|g| !g.written));
        assert_eq!(provider.policy_writes(), writes_after_first);
        assert_eq!(provider.total_created(), 4);

        let member = second.service_account.resource.email().member();
        let bucket_policy = provider
            .policy(&PolicyTarget::Bucket(BucketName::new(BUCKET).unwrap()))
            .unwrap();
        assert_eq!(bucket_policy.binding_count(STORAGE_OBJECT_ADMIN_ROLE, &member), 1);
        assert_eq!(
            bucket_policy.binding_count(STORAGE_LEGACY_BUCKET_READER_ROLE, &member),
            1
        );
    }

    #[tokio::test]
    async fn manifest_references_provisioned_resources() {
        let provider = Arc::new(MemoryProvider::new());
        let report = in_memory(provider).run().await.unwrap();

        assert!(report.manifest.contains("kind: Secret"));
        assert!(report.manifest.contains(&format!("gcs-bucket-name: {}", BUCKET)));
        assert!(report
            .manifest
            .contains(&format!("kms-key-id: {}/cryptoKeys/vault-init", RING)));
        assert!(report
            .manifest
            .contains("api-addr: https://vault.default.svc"));
    }

    #[tokio::test]
    async fn summary_lists_project_bucket_account_and_key() {
        let report = in_memory(Arc::new(MemoryProvider::new())).run().await.unwrap();
        assert_eq!(
            report.summary_lines(),
            vec![
                "Project ID: tigerworks-kube".to_string(),
                "Storage Bucket Name: vault-test-bucket".to_string(),
                "Service account email: vault-server@tigerworks-kube.iam.gserviceaccount.com"
                    .to_string(),
                format!("KMS key ID: {}/cryptoKeys/vault-init", RING),
            ]
        );
    }

    #[tokio::test]
    async fn existing_grants_from_other_members_survive() {
        let provider = Arc::new(MemoryProvider::new());
        let bootstrapper = in_memory(provider.clone());
        bootstrapper.ensure_bucket().await.unwrap();

        let target = PolicyTarget::Bucket(BucketName::new(BUCKET).unwrap());
        let mut policy = provider.policy(&target).unwrap();
        policy
            .bindings
            .push(Binding::new("roles/storage.legacyBucketOwner", ["projectOwner:tigerworks-kube"]));
        crate::provider::PolicyStore::set_policy(provider.as_ref(), &target, &policy)
            .await
            .unwrap();

        bootstrapper.run().await.unwrap();
        let policy = provider.policy(&target).unwrap();
        assert!(policy.has_member("roles/storage.legacyBucketOwner", "projectOwner:tigerworks-kube"));
    }

    #[tokio::test]
    async fn inspect_reports_existence_without_creating() {
        let provider = Arc::new(MemoryProvider::new());
        let bootstrapper = in_memory(provider.clone());

        let before = bootstrapper.inspect().await.unwrap();
        assert_eq!(before.len(), 4);
        assert!(before.iter().all(|s| !s.exists));
        assert_eq!(provider.total_created(), 0);

        bootstrapper.run().await.unwrap();
        let after = bootstrapper.inspect().await.unwrap();
        assert!(after.iter().all(|s| s.exists));
        assert_eq!(after[0].name, RING);
    }

    #[test]
    fn tls_material_chains_and_carries_configured_sans() {
        let bootstrapper = in_memory(Arc::new(MemoryProvider::new()));
        let tls = bootstrapper.generate_tls().unwrap();

        let result = verify_server_cert(&tls.server.cert_pem, &tls.ca_cert_pem).unwrap();
        assert!(result.valid, "{:?}", result.reason);
        assert_eq!(
            subject_alt_names(&tls.server.cert_pem).unwrap(),
            config().subject_alt_names()
        );
    }

    #[test]
    fn invalid_config_is_rejected_before_any_call() {
        let providers = Providers::from_single(Arc::new(MemoryProvider::new()));
        let result = Bootstrapper::new(BootstrapConfig::default(), providers);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
