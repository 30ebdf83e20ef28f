//! Cloud KMS key rings and crypto keys

use async_trait::async_trait;
use serde_json::json;

use super::GcpProvider;
use crate::provider::KeyManagement;
use crate::resource::{
    CryptoKey, CryptoKeyName, KeyRing, KeyRingName, ResourceKind, ENCRYPT_DECRYPT_PURPOSE,
};
use crate::Result;

#[async_trait]
impl KeyManagement for GcpProvider {
    async fn get_key_ring(&self, name: &KeyRingName) -> Result<Option<KeyRing>> {
        let resource = name.to_string();
        let url = format!("{}/{}", self.endpoints.kms, resource);
        self.lookup(ResourceKind::KeyRing, &resource, &url).await
    }

    async fn create_key_ring(&self, name: &KeyRingName) -> Result<KeyRing> {
        let resource = name.to_string();
        let url = format!("{}/{}/keyRings", self.endpoints.kms, name.parent());
        self.create(
            ResourceKind::KeyRing,
            &resource,
            &url,
            &[("keyRingId", name.id())],
            &json!({}),
        )
        .await
    }

    async fn get_crypto_key(&self, name: &CryptoKeyName) -> Result<Option<CryptoKey>> {
        let resource = name.to_string();
        let url = format!("{}/{}", self.endpoints.kms, resource);
        self.lookup(ResourceKind::CryptoKey, &resource, &url).await
    }

    async fn create_crypto_key(&self, name: &CryptoKeyName) -> Result<CryptoKey> {
        let resource = name.to_string();
        let url = format!("{}/{}/cryptoKeys", self.endpoints.kms, name.parent());
        self.create(
            ResourceKind::CryptoKey,
            &resource,
            &url,
            &[("cryptoKeyId", name.id())],
            &json!({ "purpose": ENCRYPT_DECRYPT_PURPOSE }),
        )
        .await
    }
}
