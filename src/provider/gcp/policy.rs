//! Access policies on crypto keys and buckets
//!
//! KMS wraps the written policy in a `{"policy": ...}` request and uses
//! `:getIamPolicy`/`:setIamPolicy` verbs. Storage reads and replaces the
//! bucket's `/iam` sub-resource directly.
//!
//! Reads ask for policy version 3 so conditional bindings come back intact
//! and survive the write.

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;

use super::GcpProvider;
use crate::policy::{Policy, PolicyTarget};
use crate::provider::PolicyStore;
use crate::resource::ResourceKind;
use crate::Result;

/// Highest policy version; lower versions drop binding conditions
const POLICY_VERSION: &str = "3";

#[derive(Serialize)]
struct SetIamPolicyRequest<'a> {
    policy: &'a Policy,
}

#[async_trait]
impl PolicyStore for GcpProvider {
    async fn get_policy(&self, target: &PolicyTarget) -> Result<Policy> {
        let resource = target.to_string();
        match target {
            PolicyTarget::CryptoKey(key) => {
                let url = format!("{}/{}:getIamPolicy", self.endpoints.kms, key);
                self.fetch(
                    ResourceKind::CryptoKey,
                    &resource,
                    &url,
                    &[("options.requestedPolicyVersion", POLICY_VERSION)],
                )
                .await
            }
            PolicyTarget::Bucket(bucket) => {
                let url = format!("{}/b/{}/iam", self.endpoints.storage, bucket);
                self.fetch(
                    ResourceKind::Bucket,
                    &resource,
                    &url,
                    &[("optionsRequestedPolicyVersion", POLICY_VERSION)],
                )
                .await
            }
        }
    }

    async fn set_policy(&self, target: &PolicyTarget, policy: &Policy) -> Result<Policy> {
        let resource = target.to_string();
        match target {
            PolicyTarget::CryptoKey(key) => {
                let url = format!("{}/{}:setIamPolicy", self.endpoints.kms, key);
                self.put_policy(
                    ResourceKind::CryptoKey,
                    &resource,
                    Method::POST,
                    &url,
                    &SetIamPolicyRequest { policy },
                )
                .await
            }
            PolicyTarget::Bucket(bucket) => {
                let url = format!("{}/b/{}/iam", self.endpoints.storage, bucket);
                self.put_policy(ResourceKind::Bucket, &resource, Method::PUT, &url, policy)
                    .await
            }
        }
    }
}
