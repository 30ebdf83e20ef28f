//! Resource identifiers and descriptors
//!
//! Identifiers are hierarchical. A key ring name can only be produced from a
//! [`LocationName`], and a crypto key name only from a [`KeyRingName`], so a
//! child can never drift away from its nominal parent.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Purpose string for symmetric encrypt/decrypt keys
pub const ENCRYPT_DECRYPT_PURPOSE: &str = "ENCRYPT_DECRYPT";

/// The four resource kinds a bootstrap run provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// KMS key ring
    KeyRing,
    /// KMS crypto key
    CryptoKey,
    /// Object storage bucket
    Bucket,
    /// IAM service account
    ServiceAccount,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::KeyRing => "key ring",
            Self::CryptoKey => "crypto key",
            Self::Bucket => "bucket",
            Self::ServiceAccount => "service account",
        };
        f.pad(s)
    }
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::config(format!("{} must not be empty", what)));
    }
    if value.contains('/') || value.chars().any(char::is_whitespace) {
        return Err(Error::config(format!(
            "{} '{}' must not contain '/' or whitespace",
            what, value
        )));
    }
    Ok(())
}

/// `projects/{project}/locations/{location}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationName {
    project: String,
    location: String,
}

impl LocationName {
    /// Build a location name, validating both segments
    pub fn new(project: impl Into<String>, location: impl Into<String>) -> Result<Self> {
        let project = project.into();
        let location = location.into();
        validate_segment("project id", &project)?;
        validate_segment("location", &location)?;
        Ok(Self { project, location })
    }

    /// Project id
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Location id (e.g. `global`)
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Derive the key ring name under this location
    pub fn key_ring(&self, key_ring_id: &str) -> Result<KeyRingName> {
        validate_segment("key ring id", key_ring_id)?;
        Ok(KeyRingName {
            parent: self.clone(),
            id: key_ring_id.to_string(),
        })
    }
}

impl fmt::Display for LocationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/locations/{}", self.project, self.location)
    }
}

/// `projects/{project}/locations/{location}/keyRings/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRingName {
    parent: LocationName,
    id: String,
}

impl KeyRingName {
    /// Parent location
    pub fn parent(&self) -> &LocationName {
        &self.parent
    }

    /// Key ring id (last segment)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Derive the crypto key name under this key ring
    pub fn crypto_key(&self, key_id: &str) -> Result<CryptoKeyName> {
        validate_segment("crypto key id", key_id)?;
        Ok(CryptoKeyName {
            parent: self.clone(),
            id: key_id.to_string(),
        })
    }
}

impl fmt::Display for KeyRingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/keyRings/{}", self.parent, self.id)
    }
}

/// `{keyRing}/cryptoKeys/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CryptoKeyName {
    parent: KeyRingName,
    id: String,
}

impl CryptoKeyName {
    /// Parent key ring
    pub fn parent(&self) -> &KeyRingName {
        &self.parent
    }

    /// Crypto key id (last segment)
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CryptoKeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/cryptoKeys/{}", self.parent, self.id)
    }
}

/// Globally unique bucket name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketName(String);

impl BucketName {
    /// Validate and wrap a bucket name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment("bucket name", &name)?;
        Ok(Self(name))
    }

    /// Bucket name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `{account_id}@{project}.iam.gserviceaccount.com`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAccountEmail(String);

impl ServiceAccountEmail {
    /// Derive the email for a service account id in a project
    pub fn for_account(project: &str, account_id: &str) -> Result<Self> {
        validate_segment("service account id", account_id)?;
        validate_segment("project id", project)?;
        Ok(Self(format!(
            "{}@{}.iam.gserviceaccount.com",
            account_id, project
        )))
    }

    /// Wrap an email returned by the provider
    pub fn from_email(email: impl Into<String>) -> Self {
        Self(email.into())
    }

    /// Email as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Policy member string (`serviceAccount:{email}`)
    pub fn member(&self) -> String {
        format!("serviceAccount:{}", self.0)
    }
}

impl fmt::Display for ServiceAccountEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// KMS key ring as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRing {
    /// Fully-qualified key ring name
    pub name: String,
}

/// KMS crypto key as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoKey {
    /// Fully-qualified crypto key name, used as the KMS key id
    pub name: String,
    /// Key purpose, always `ENCRYPT_DECRYPT` for keys this tool creates
    #[serde(default)]
    pub purpose: String,
}

/// Storage bucket as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Bucket name
    pub name: String,
    /// Bucket location, if reported
    #[serde(default)]
    pub location: Option<String>,
}

/// IAM service account as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    /// Account email
    pub email: String,
    /// Human-readable display name
    #[serde(default)]
    pub display_name: String,
    /// Provider-assigned numeric id
    #[serde(default)]
    pub unique_id: String,
}

impl ServiceAccount {
    /// Email wrapped as a typed identifier
    pub fn email(&self) -> ServiceAccountEmail {
        ServiceAccountEmail::from_email(self.email.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_key_name_extends_its_key_ring() {
        let location = LocationName::new("p", "global").unwrap();
        let ring = location.key_ring("r").unwrap();
        let key = ring.crypto_key("k").unwrap();

        assert_eq!(ring.to_string(), "projects/p/locations/global/keyRings/r");
        assert_eq!(
            key.to_string(),
            "projects/p/locations/global/keyRings/r/cryptoKeys/k"
        );
        assert!(key.to_string().starts_with(&ring.to_string()));
        assert_eq!(key.parent(), &ring);
    }

    #[test]
    fn segments_with_slashes_are_rejected() {
        let location = LocationName::new("p", "global").unwrap();
        assert!(matches!(location.key_ring("a/b"), Err(Error::Config(_))));
        assert!(LocationName::new("", "global").is_err());
        assert!(BucketName::new("has space").is_err());
    }

    #[test]
    fn service_account_email_and_member() {
        let email = ServiceAccountEmail::for_account("tigerworks", "vault-sa").unwrap();
        assert_eq!(email.as_str(), "vault-sa@tigerworks.iam.gserviceaccount.com");
        assert_eq!(
            email.member(),
            "serviceAccount:vault-sa@tigerworks.iam.gserviceaccount.com"
        );
    }

    #[test]
    fn kind_display_is_human_readable() {
        assert_eq!(ResourceKind::CryptoKey.to_string(), "crypto key");
        assert_eq!(ResourceKind::ServiceAccount.to_string(), "service account");
    }
}
