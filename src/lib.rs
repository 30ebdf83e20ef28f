//! unseal-bootstrap - cloud KMS auto-unseal bootstrap for a secrets server
//!
//! Provisions the cloud side of auto-unseal and the server's TLS trust root
//! in one idempotent run, then emits the Kubernetes objects the server
//! consumes.
//!
//! # Workflow
//!
//! - Generate a self-signed CA and a server certificate for the configured SANs
//! - Ensure a KMS key ring and an encrypt/decrypt crypto key
//! - Ensure a storage bucket for sealed data
//! - Ensure a service account and grant it roles on the key and the bucket
//! - Emit a Secret (TLS material) and a ConfigMap (addresses and ids)
//!
//! Re-running against an already provisioned project creates nothing and
//! leaves existing policy bindings untouched.
//!
//! # Modules
//!
//! - [`bootstrap`] - Provisioning orchestrator
//! - [`config`] - Run configuration and CLI overrides
//! - [`manifest`] - Secret and ConfigMap assembly and output
//! - [`pki`] - Certificate authority and server certificates
//! - [`policy`] - Set-union access policy grants with conflict retry
//! - [`provider`] - Resource provider traits and implementations
//! - [`resource`] - Hierarchical resource identifiers
//! - [`retry`] - Backoff for transient failures
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod manifest;
pub mod pki;
pub mod policy;
pub mod provider;
pub mod resource;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Roles
// =============================================================================

/// Lets the service account encrypt and decrypt with the crypto key
pub const KMS_ENCRYPTER_DECRYPTER_ROLE: &str = "roles/cloudkms.cryptoKeyEncrypterDecrypter";

/// Lets the service account read and write objects in the bucket
pub const STORAGE_OBJECT_ADMIN_ROLE: &str = "roles/storage.objectAdmin";

/// Lets the service account read bucket metadata
pub const STORAGE_LEGACY_BUCKET_READER_ROLE: &str = "roles/storage.legacyBucketReader";
