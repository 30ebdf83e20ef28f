//! Access policy binding
//!
//! Grants are a set-union: a `(role, member)` pair already present in the
//! document is left alone, and the document is only written back when the
//! merge changed it. Writes carry the etag from the read in the same cycle;
//! a stale etag causes a fresh read-merge-write, up to a bounded number of
//! attempts.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::provider::PolicyStore;
use crate::resource::{BucketName, CryptoKeyName, ResourceKind};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// A single role binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    /// Role name, e.g. `roles/storage.objectAdmin`
    pub role: String,
    /// Principals holding the role
    #[serde(default)]
    pub members: Vec<String>,
    /// Fields this tool does not interpret (e.g. `condition`)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Binding {
    /// Unconditional binding of `role` to the given members
    pub fn new<I, S>(role: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role: role.into(),
            members: members.into_iter().map(Into::into).collect(),
            extra: Map::new(),
        }
    }

    /// Conditional bindings are never merged into
    pub fn is_conditional(&self) -> bool {
        self.extra.contains_key("condition")
    }
}

/// Access policy document with its concurrency token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Policy format version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    /// Opaque version token used for optimistic concurrency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Ordered role bindings
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Provider-specific fields carried through unchanged
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Policy {
    /// Whether `member` holds `role` through an unconditional binding
    pub fn has_member(&self, role: &str, member: &str) -> bool {
        self.bindings
            .iter()
            .filter(|b| b.role == role && !b.is_conditional())
            .any(|b| b.members.iter().any(|m| m == member))
    }

    /// Number of unconditional bindings granting `role` to `member`
    pub fn binding_count(&self, role: &str, member: &str) -> usize {
        self.bindings
            .iter()
            .filter(|b| b.role == role && !b.is_conditional())
            .filter(|b| b.members.iter().any(|m| m == member))
            .count()
    }

    /// Merge `(role, member)` into the document.
    ///
    /// Returns true when the document changed.
    pub fn grant(&mut self, role: &str, member: &str) -> bool {
        if self.has_member(role, member) {
            return false;
        }

        match self
            .bindings
            .iter_mut()
            .find(|b| b.role == role && !b.is_conditional())
        {
            Some(binding) => binding.members.push(member.to_string()),
            None => self.bindings.push(Binding::new(role, [member])),
        }
        true
    }
}

/// Resource whose access policy is being edited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyTarget {
    /// KMS crypto key
    CryptoKey(CryptoKeyName),
    /// Storage bucket
    Bucket(BucketName),
}

impl PolicyTarget {
    /// Resource kind of the target
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::CryptoKey(_) => ResourceKind::CryptoKey,
            Self::Bucket(_) => ResourceKind::Bucket,
        }
    }
}

impl fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CryptoKey(name) => write!(f, "{}", name),
            Self::Bucket(name) => write!(f, "projects/_/buckets/{}", name),
        }
    }
}

/// Result of granting roles on one resource
#[derive(Debug, Clone, PartialEq)]
pub struct GrantOutcome {
    /// Resource the roles were granted on
    pub target: String,
    /// Member that received the roles
    pub member: String,
    /// Roles that were not yet held and were added by this call
    pub added_roles: Vec<String>,
    /// Whether the policy was written back
    pub written: bool,
    /// Read-merge-write cycles used
    pub attempts: u32,
}

/// Applies role grants through a [`PolicyStore`]
#[derive(Clone)]
pub struct PolicyBinder {
    store: Arc<dyn PolicyStore>,
    write_attempts: u32,
    read_retry: RetryConfig,
}

impl PolicyBinder {
    /// Create a binder that re-reads up to `write_attempts` times on conflict
    pub fn new(store: Arc<dyn PolicyStore>, write_attempts: u32, read_retry: RetryConfig) -> Self {
        Self {
            store,
            write_attempts: write_attempts.max(1),
            read_retry,
        }
    }

    /// Grant a single role
    pub async fn grant_role(
        &self,
        target: &PolicyTarget,
        member: &str,
        role: &str,
    ) -> Result<GrantOutcome> {
        self.grant_roles(target, member, &[role]).await
    }

    /// Grant every role in `roles` to `member` in one read-modify-write cycle
    pub async fn grant_roles(
        &self,
        target: &PolicyTarget,
        member: &str,
        roles: &[&str],
    ) -> Result<GrantOutcome> {
        let store = self.store.as_ref();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let mut policy = retry_with_backoff(&self.read_retry, "get_policy", move || {
                store.get_policy(target)
            })
            .await?;

            let added_roles: Vec<String> = roles
                .iter()
                .filter(|role| policy.grant(role, member))
                .map(|role| role.to_string())
                .collect();

            if added_roles.is_empty() {
                debug!(resource = %target, member, "All roles already granted");
                return Ok(GrantOutcome {
                    target: target.to_string(),
                    member: member.to_string(),
                    added_roles,
                    written: false,
                    attempts: attempt,
                });
            }

            match store.set_policy(target, &policy).await {
                Ok(_) => {
                    info!(
                        resource = %target,
                        member,
                        roles = ?added_roles,
                        "Granted roles"
                    );
                    return Ok(GrantOutcome {
                        target: target.to_string(),
                        member: member.to_string(),
                        added_roles,
                        written: true,
                        attempts: attempt,
                    });
                }
                Err(Error::PolicyConflict { .. }) if attempt < self.write_attempts => {
                    warn!(
                        resource = %target,
                        attempt,
                        "Policy changed since it was read, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
