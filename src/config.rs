//! Bootstrap configuration
//!
//! Loaded from a camelCase YAML file, then individual CLI flags override the
//! file values. Every field except the project id and bucket name has a
//! default, so a minimal file is two lines:
//!
//! ```yaml
//! projectId: tigerworks-kube
//! bucketName: vault-test-bucket
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pki::SubjectAltNames;
use crate::resource::{LocationName, ServiceAccountEmail};
use crate::{Error, Result};

/// Subject alternative names used when none are configured
pub const DEFAULT_SANS: &[&str] = &[
    "vault",
    "vault.default.svc.cluster.local",
    "localhost",
    "127.0.0.1",
];

/// Address the server advertises to clients
pub const DEFAULT_API_ADDR: &str = "https://vault.default.svc";

/// Name of both emitted manifest objects
pub const DEFAULT_MANIFEST_NAME: &str = "vault";

/// Output manifest file
pub const DEFAULT_OUTPUT: &str = "vault-config.yaml";

fn default_location() -> String {
    "global".to_string()
}

fn default_key_ring_id() -> String {
    "vault".to_string()
}

fn default_crypto_key_id() -> String {
    "vault-init".to_string()
}

fn default_bucket_location() -> String {
    "US".to_string()
}

fn default_service_account_id() -> String {
    "vault-server".to_string()
}

fn default_service_account_display_name() -> String {
    "Vault server".to_string()
}

fn default_subject_alt_names() -> Vec<String> {
    DEFAULT_SANS.iter().map(|s| s.to_string()).collect()
}

fn default_server_common_name() -> String {
    "server".to_string()
}

fn default_ca_common_name() -> String {
    "Vault Bootstrap CA".to_string()
}

fn default_api_addr() -> String {
    DEFAULT_API_ADDR.to_string()
}

fn default_manifest_name() -> String {
    DEFAULT_MANIFEST_NAME.to_string()
}

fn default_output() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT)
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_lookup_attempts() -> u32 {
    3
}

fn default_policy_write_attempts() -> u32 {
    3
}

/// Everything a bootstrap run needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    /// Project that owns every provisioned resource
    #[serde(default)]
    pub project_id: String,
    /// KMS location
    #[serde(default = "default_location")]
    pub location: String,
    /// Key ring id
    #[serde(default = "default_key_ring_id")]
    pub key_ring_id: String,
    /// Crypto key id
    #[serde(default = "default_crypto_key_id")]
    pub crypto_key_id: String,
    /// Storage bucket holding sealed data
    #[serde(default)]
    pub bucket_name: String,
    /// Bucket location
    #[serde(default = "default_bucket_location")]
    pub bucket_location: String,
    /// Service account id (local part of the email)
    #[serde(default = "default_service_account_id")]
    pub service_account_id: String,
    /// Service account display name
    #[serde(default = "default_service_account_display_name")]
    pub service_account_display_name: String,
    /// DNS names and IP addresses for the server certificate
    #[serde(default = "default_subject_alt_names")]
    pub subject_alt_names: Vec<String>,
    /// Server certificate common name
    #[serde(default = "default_server_common_name")]
    pub server_common_name: String,
    /// CA certificate common name
    #[serde(default = "default_ca_common_name")]
    pub ca_common_name: String,
    /// `api-addr` written to the config map
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    /// Name of the emitted Secret and ConfigMap
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    /// Namespace of the emitted objects; omitted when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Manifest output file
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Service account key file used to authenticate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Attempts for each existence check and policy read
    #[serde(default = "default_lookup_attempts")]
    pub lookup_attempts: u32,
    /// Read-merge-write cycles allowed per policy before giving up
    #[serde(default = "default_policy_write_attempts")]
    pub policy_write_attempts: u32,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            location: default_location(),
            key_ring_id: default_key_ring_id(),
            crypto_key_id: default_crypto_key_id(),
            bucket_name: String::new(),
            bucket_location: default_bucket_location(),
            service_account_id: default_service_account_id(),
            service_account_display_name: default_service_account_display_name(),
            subject_alt_names: default_subject_alt_names(),
            server_common_name: default_server_common_name(),
            ca_common_name: default_ca_common_name(),
            api_addr: default_api_addr(),
            manifest_name: default_manifest_name(),
            namespace: None,
            output: default_output(),
            credentials_file: None,
            request_timeout_secs: default_request_timeout_secs(),
            lookup_attempts: default_lookup_attempts(),
            policy_write_attempts: default_policy_write_attempts(),
        }
    }
}

/// Values supplied on the command line, applied over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// `--project`
    pub project_id: Option<String>,
    /// `--bucket`
    pub bucket_name: Option<String>,
    /// `--credentials`
    pub credentials_file: Option<PathBuf>,
    /// `--output`
    pub output: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    /// Load from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&contents)
    }

    /// Apply CLI overrides; unset flags leave the file value in place
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(project_id) = overrides.project_id {
            self.project_id = project_id;
        }
        if let Some(bucket_name) = overrides.bucket_name {
            self.bucket_name = bucket_name;
        }
        if let Some(credentials_file) = overrides.credentials_file {
            self.credentials_file = Some(credentials_file);
        }
        if let Some(output) = overrides.output {
            self.output = output;
        }
    }

    /// Check every field before any resource is touched
    pub fn validate(&self) -> Result<()> {
        if self.project_id.is_empty() {
            return Err(Error::config(
                "project id is required (set projectId or --project)",
            ));
        }
        if self.bucket_name.is_empty() {
            return Err(Error::config(
                "bucket name is required (set bucketName or --bucket)",
            ));
        }

        let location = LocationName::new(&self.project_id, &self.location)?;
        location
            .key_ring(&self.key_ring_id)?
            .crypto_key(&self.crypto_key_id)?;
        crate::resource::BucketName::new(&self.bucket_name)?;
        ServiceAccountEmail::for_account(&self.project_id, &self.service_account_id)?;

        if self.bucket_location.is_empty() {
            return Err(Error::config("bucket location must not be empty"));
        }
        if self.server_common_name.is_empty() || self.ca_common_name.is_empty() {
            return Err(Error::config("certificate common names must not be empty"));
        }
        if self.subject_alt_names().is_empty() {
            return Err(Error::config(
                "at least one subject alternative name is required",
            ));
        }
        if self.manifest_name.is_empty() {
            return Err(Error::config("manifest name must not be empty"));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::config("request timeout must be at least one second"));
        }
        if self.lookup_attempts == 0 || self.policy_write_attempts == 0 {
            return Err(Error::config("attempt counts must be at least 1"));
        }
        Ok(())
    }

    /// Configured SAN entries, classified into DNS names and IP addresses
    pub fn subject_alt_names(&self) -> SubjectAltNames {
        SubjectAltNames::from_entries(&self.subject_alt_names)
    }

    /// Timeout applied to every provider request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
