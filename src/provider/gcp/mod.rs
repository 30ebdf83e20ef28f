//! Google Cloud REST provider
//!
//! Talks to Cloud KMS, Cloud Storage and IAM over their JSON APIs. Every
//! request carries the client-wide timeout; a request that exceeds it
//! surfaces as [`Error::Timeout`], which callers may retry.
//!
//! Status handling:
//!
//! - 404 on a lookup is absence (`Ok(None)`)
//! - 409 on a create is [`Error::AlreadyExists`]
//! - 409 or 412 on a policy write is [`Error::PolicyConflict`]
//! - 408, 429 and 5xx are retryable provider errors
//! - any other non-success status is a permanent provider error

pub mod auth;
mod iam;
mod kms;
mod policy;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use auth::{ServiceAccountKey, ServiceAccountTokenSource, StaticTokenSource, TokenSource};

use crate::resource::ResourceKind;
use crate::{Error, Result};

/// Base URLs of the APIs this provider calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcpEndpoints {
    /// Cloud KMS, e.g. `https://cloudkms.googleapis.com/v1`
    pub kms: String,
    /// Cloud Storage JSON API, e.g. `https://storage.googleapis.com/storage/v1`
    pub storage: String,
    /// IAM, e.g. `https://iam.googleapis.com/v1`
    pub iam: String,
}

impl Default for GcpEndpoints {
    fn default() -> Self {
        Self {
            kms: "https://cloudkms.googleapis.com/v1".to_string(),
            storage: "https://storage.googleapis.com/storage/v1".to_string(),
            iam: "https://iam.googleapis.com/v1".to_string(),
        }
    }
}

impl GcpEndpoints {
    /// Serve every API from one host, keeping the production path layout
    pub fn single_host(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            kms: format!("{}/v1", base),
            storage: format!("{}/storage/v1", base),
            iam: format!("{}/v1", base),
        }
    }
}

/// What a request is trying to do, which decides how 409/412 are read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Read,
    Create,
    SetPolicy,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Pull the human-readable message out of a Google API error body
fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.message.is_empty() => {
            format!("HTTP {}: {}", status, envelope.error.message)
        }
        _ if body.trim().is_empty() => format!("HTTP {}", status),
        _ => format!("HTTP {}: {}", status, body.trim()),
    }
}

fn classify_status(
    kind: ResourceKind,
    resource: &str,
    intent: Intent,
    status: StatusCode,
    body: &str,
) -> Error {
    match (intent, status) {
        (Intent::Create, StatusCode::CONFLICT) => Error::already_exists(kind, resource),
        (Intent::SetPolicy, StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED) => {
            Error::policy_conflict(resource)
        }
        (_, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS) => {
            Error::provider(kind, resource, error_message(status, body))
        }
        (_, s) if s.is_server_error() => Error::provider(kind, resource, error_message(status, body)),
        _ => Error::provider_permanent(kind, resource, error_message(status, body)),
    }
}

/// Provider backed by the Google Cloud REST APIs
pub struct GcpProvider {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    endpoints: GcpEndpoints,
}

impl GcpProvider {
    /// Create a provider whose requests time out after `timeout`
    pub fn new(tokens: Arc<dyn TokenSource>, timeout: Duration) -> Result<Self> {
        let client = Self::http_client(timeout)?;
        Ok(Self {
            client,
            tokens,
            endpoints: GcpEndpoints::default(),
        })
    }

    /// Create a provider authenticated with a service account key
    pub fn from_service_account(key: ServiceAccountKey, timeout: Duration) -> Result<Self> {
        let client = Self::http_client(timeout)?;
        let tokens = ServiceAccountTokenSource::new(key, client.clone())?;
        Ok(Self {
            client,
            tokens: Arc::new(tokens),
            endpoints: GcpEndpoints::default(),
        })
    }

    /// Override the API base URLs
    pub fn with_endpoints(mut self, endpoints: GcpEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn http_client(timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))
    }

    async fn send(
        &self,
        kind: ResourceKind,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        let token = self.tokens.access_token().await?;
        request.bearer_auth(token).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(format!("{} {}", kind, resource))
            } else {
                Error::provider(kind, resource, format!("request failed: {}", e))
            }
        })
    }

    async fn decode<T: DeserializeOwned>(
        kind: ResourceKind,
        resource: &str,
        response: Response,
    ) -> Result<T> {
        response.json().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(format!("{} {}", kind, resource))
            } else {
                Error::provider_permanent(kind, resource, format!("invalid response: {}", e))
            }
        })
    }

    async fn failure(
        kind: ResourceKind,
        resource: &str,
        intent: Intent,
        response: Response,
    ) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(kind, resource, intent, status, &body)
    }

    /// GET a resource; 404 means it does not exist
    pub(crate) async fn lookup<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        resource: &str,
        url: &str,
    ) -> Result<Option<T>> {
        debug!(%kind, resource, url, "GET");
        let response = self.send(kind, resource, self.client.get(url)).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Self::decode(kind, resource, response).await.map(Some),
            _ => Err(Self::failure(kind, resource, Intent::Read, response).await),
        }
    }

    /// GET a resource that must exist
    pub(crate) async fn fetch<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        resource: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        debug!(%kind, resource, url, "GET");
        let request = self.client.get(url).query(query);
        let response = self.send(kind, resource, request).await?;

        if response.status().is_success() {
            Self::decode(kind, resource, response).await
        } else {
            Err(Self::failure(kind, resource, Intent::Read, response).await)
        }
    }

    /// Send a JSON body and decode the JSON reply
    #[allow(clippy::too_many_arguments)]
    async fn write<B, T>(
        &self,
        kind: ResourceKind,
        resource: &str,
        intent: Intent,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(%kind, resource, url, %method, "Write");
        let request = self.client.request(method, url).query(query).json(body);
        let response = self.send(kind, resource, request).await?;

        if response.status().is_success() {
            Self::decode(kind, resource, response).await
        } else {
            Err(Self::failure(kind, resource, intent, response).await)
        }
    }

    /// POST a create request; 409 means the resource already exists
    pub(crate) async fn create<B, T>(
        &self,
        kind: ResourceKind,
        resource: &str,
        url: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.write(kind, resource, Intent::Create, Method::POST, url, query, body)
            .await
    }

    /// Write a policy document; 409/412 mean the etag was stale
    pub(crate) async fn put_policy<B, T>(
        &self,
        kind: ResourceKind,
        resource: &str,
        method: Method,
        url: &str,
        body: &B,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.write(kind, resource, Intent::SetPolicy, method, url, &[], body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Policy, PolicyTarget};
    use crate::provider::{BucketStore, IdentityStore, KeyManagement, PolicyStore};
    use crate::resource::{BucketName, LocationName, ServiceAccountEmail};
    use auth::MockTokenSource;
    use mockito::Matcher;

    const TOKEN: &str = "ya29.test";

    fn provider(server: &mockito::Server) -> GcpProvider {
        GcpProvider::new(
            Arc::new(StaticTokenSource::new(TOKEN)),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_endpoints(GcpEndpoints::single_host(&server.url()))
    }

    fn ring_name() -> crate::resource::KeyRingName {
        LocationName::new("tigerworks", "global")
            .unwrap()
            .key_ring("vault")
            .unwrap()
    }

    #[test]
    fn google_error_message_is_extracted() {
        let body = r#"{"error":{"code":403,"message":"Permission denied on resource","status":"PERMISSION_DENIED"}}"#;
        let err = classify_status(
            ResourceKind::KeyRing,
            "projects/p/locations/global/keyRings/r",
            Intent::Read,
            StatusCode::FORBIDDEN,
            body,
        );
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Permission denied on resource"));
    }

    #[test]
    fn status_classification() {
        let kind = ResourceKind::Bucket;
        assert!(matches!(
            classify_status(kind, "b", Intent::Create, StatusCode::CONFLICT, ""),
            Error::AlreadyExists { .. }
        ));
        assert!(matches!(
            classify_status(kind, "b", Intent::SetPolicy, StatusCode::PRECONDITION_FAILED, ""),
            Error::PolicyConflict { .. }
        ));
        assert!(classify_status(kind, "b", Intent::Read, StatusCode::SERVICE_UNAVAILABLE, "")
            .is_retryable());
        assert!(classify_status(kind, "b", Intent::Read, StatusCode::TOO_MANY_REQUESTS, "")
            .is_retryable());
        assert!(!classify_status(kind, "b", Intent::Read, StatusCode::CONFLICT, "")
            .is_retryable());
    }

    #[tokio::test]
    async fn not_found_is_absence() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/projects/tigerworks/locations/global/keyRings/vault")
            .match_header("authorization", format!("Bearer {}", TOKEN).as_str())
            .with_status(404)
            .with_body(r#"{"error":{"code":404,"message":"KeyRing not found"}}"#)
            .create_async()
            .await;

        let ring = provider(&server).get_key_ring(&ring_name()).await.unwrap();
        assert!(ring.is_none());
    }

    #[tokio::test]
    async fn permission_denied_is_not_absence() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/projects/tigerworks/locations/global/keyRings/vault")
            .with_status(403)
            .with_body(r#"{"error":{"code":403,"message":"Permission denied"}}"#)
            .create_async()
            .await;

        let err = provider(&server)
            .get_key_ring(&ring_name())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { retryable: false, .. }));
    }

    #[tokio::test]
    async fn create_key_ring_conflict_is_already_exists() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/projects/tigerworks/locations/global/keyRings")
            .match_query(Matcher::UrlEncoded("keyRingId".into(), "vault".into()))
            .with_status(409)
            .with_body(r#"{"error":{"code":409,"message":"KeyRing already exists"}}"#)
            .create_async()
            .await;

        let err = provider(&server)
            .create_key_ring(&ring_name())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { kind: ResourceKind::KeyRing, .. }));
    }

    #[tokio::test]
    async fn create_crypto_key_sends_purpose() {
        let mut server = mockito::Server::new_async().await;
        let key = ring_name().crypto_key("vault-init").unwrap();
        let m = server
            .mock(
                "POST",
                "/v1/projects/tigerworks/locations/global/keyRings/vault/cryptoKeys",
            )
            .match_query(Matcher::UrlEncoded("cryptoKeyId".into(), "vault-init".into()))
            .match_body(Matcher::PartialJson(serde_json::json!({"purpose": "ENCRYPT_DECRYPT"})))
            .with_status(200)
            .with_body(format!(r#"{{"name":"{}","purpose":"ENCRYPT_DECRYPT"}}"#, key))
            .create_async()
            .await;

        let created = provider(&server).create_crypto_key(&key).await.unwrap();
        assert_eq!(created.name, key.to_string());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn get_bucket_and_create_bucket() {
        let mut server = mockito::Server::new_async().await;
        let _get = server
            .mock("GET", "/storage/v1/b/vault-test-bucket")
            .with_status(404)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/storage/v1/b")
            .match_query(Matcher::UrlEncoded("project".into(), "tigerworks".into()))
            .match_body(Matcher::Json(
                serde_json::json!({"name": "vault-test-bucket", "location": "US"}),
            ))
            .with_status(200)
            .with_body(r#"{"name":"vault-test-bucket","location":"US","kind":"storage#bucket"}"#)
            .create_async()
            .await;

        let gcp = provider(&server);
        let name = BucketName::new("vault-test-bucket").unwrap();
        assert!(gcp.get_bucket(&name).await.unwrap().is_none());
        let bucket = gcp.create_bucket("tigerworks", &name, "US").await.unwrap();
        assert_eq!(bucket.location.as_deref(), Some("US"));
        create.assert_async().await;
    }

    #[tokio::test]
    async fn service_account_lookup_and_create() {
        let mut server = mockito::Server::new_async().await;
        let email = ServiceAccountEmail::for_account("tigerworks", "vault-server").unwrap();
        let _get = server
            .mock(
                "GET",
                "/v1/projects/-/serviceAccounts/vault-server@tigerworks.iam.gserviceaccount.com",
            )
            .with_status(404)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/v1/projects/tigerworks/serviceAccounts")
            .match_body(Matcher::Json(serde_json::json!({
                "accountId": "vault-server",
                "serviceAccount": {"displayName": "Vault server"}
            })))
            .with_status(200)
            .with_body(
                r#"{"email":"vault-server@tigerworks.iam.gserviceaccount.com","displayName":"Vault server","uniqueId":"1234"}"#,
            )
            .create_async()
            .await;

        let gcp = provider(&server);
        assert!(gcp.get_service_account(&email).await.unwrap().is_none());
        let account = gcp
            .create_service_account("tigerworks", "vault-server", "Vault server")
            .await
            .unwrap();
        assert_eq!(account.email(), email);
        create.assert_async().await;
    }

    #[tokio::test]
    async fn bucket_policy_conflict_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("PUT", "/storage/v1/b/vault-test-bucket/iam")
            .with_status(412)
            .with_body(r#"{"error":{"code":412,"message":"Precondition Failed"}}"#)
            .create_async()
            .await;

        let target = PolicyTarget::Bucket(BucketName::new("vault-test-bucket").unwrap());
        let policy = Policy {
            etag: Some("CAE=".to_string()),
            ..Default::default()
        };
        let err = provider(&server)
            .set_policy(&target, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyConflict { .. }));
    }

    #[tokio::test]
    async fn crypto_key_policy_is_wrapped_on_write() {
        let mut server = mockito::Server::new_async().await;
        let key = ring_name().crypto_key("vault-init").unwrap();
        let path = format!("/v1/{}:setIamPolicy", key);
        let m = server
            .mock("POST", path.as_str())
            .match_body(Matcher::PartialJson(
                serde_json::json!({"policy": {"etag": "BwX1"}}),
            ))
            .with_status(200)
            .with_body(r#"{"version":1,"etag":"BwX2","bindings":[]}"#)
            .create_async()
            .await;

        let policy = Policy {
            etag: Some("BwX1".to_string()),
            ..Default::default()
        };
        let written = provider(&server)
            .set_policy(&PolicyTarget::CryptoKey(key), &policy)
            .await
            .unwrap();
        assert_eq!(written.etag.as_deref(), Some("BwX2"));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn policy_reads_request_conditional_bindings() {
        let mut server = mockito::Server::new_async().await;
        let key = ring_name().crypto_key("vault-init").unwrap();
        let key_path = format!("/v1/{}:getIamPolicy", key);
        let condition = r#"{"title":"expires","expression":"request.time < timestamp('2030-01-01T00:00:00Z')"}"#;
        let key_policy = server
            .mock("GET", key_path.as_str())
            .match_query(Matcher::UrlEncoded(
                "options.requestedPolicyVersion".into(),
                "3".into(),
            ))
            .with_status(200)
            .with_body(format!(
                r#"{{"version":3,"etag":"BwX1","bindings":[{{"role":"roles/viewer","members":["user:a@example.com"],"condition":{}}}]}}"#,
                condition
            ))
            .create_async()
            .await;
        let bucket_policy = server
            .mock("GET", "/storage/v1/b/vault-test-bucket/iam")
            .match_query(Matcher::UrlEncoded(
                "optionsRequestedPolicyVersion".into(),
                "3".into(),
            ))
            .with_status(200)
            .with_body(r#"{"kind":"storage#policy","version":3,"etag":"CAE=","bindings":[]}"#)
            .create_async()
            .await;

        let gcp = provider(&server);
        let policy = gcp
            .get_policy(&PolicyTarget::CryptoKey(key))
            .await
            .unwrap();
        assert_eq!(policy.version, Some(3));
        assert!(policy.bindings[0].is_conditional());

        let policy = gcp
            .get_policy(&PolicyTarget::Bucket(
                BucketName::new("vault-test-bucket").unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(policy.etag.as_deref(), Some("CAE="));
        assert_eq!(policy.extra["kind"], "storage#policy");

        key_policy.assert_async().await;
        bucket_policy.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/storage/v1/b/vault-test-bucket")
            .with_status(503)
            .create_async()
            .await;

        let err = provider(&server)
            .get_bucket(&BucketName::new("vault-test-bucket").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn token_failure_stops_the_request() {
        let server = mockito::Server::new_async().await;
        let mut tokens = MockTokenSource::new();
        tokens
            .expect_access_token()
            .times(1)
            .returning(|| Err(Error::credentials("token expired")));

        let gcp = GcpProvider::new(Arc::new(tokens), Duration::from_secs(5))
            .unwrap()
            .with_endpoints(GcpEndpoints::single_host(&server.url()));
        let err = gcp.get_key_ring(&ring_name()).await.unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
    }

    #[tokio::test]
    async fn lookup_retries_through_a_token_outage() {
        let mut server = mockito::Server::new_async().await;
        let ring = server
            .mock("GET", "/v1/projects/tigerworks/locations/global/keyRings/vault")
            .match_header("authorization", "Bearer ya29.test")
            .with_status(200)
            .with_body(r#"{"name":"projects/tigerworks/locations/global/keyRings/vault"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut seq = mockall::Sequence::new();
        let mut tokens = MockTokenSource::new();
        tokens
            .expect_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(Error::token_unavailable("HTTP 503")));
        tokens
            .expect_access_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(TOKEN.to_string()));

        let gcp = GcpProvider::new(Arc::new(tokens), Duration::from_secs(5))
            .unwrap()
            .with_endpoints(GcpEndpoints::single_host(&server.url()));
        let retry = crate::retry::RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        };
        let name = ring_name();
        let found = crate::retry::retry_with_backoff(&retry, "get key ring", || {
            gcp.get_key_ring(&name)
        })
        .await
        .unwrap();

        assert!(found.is_some());
        ring.assert_async().await;
    }

    #[test]
    fn single_host_keeps_api_paths() {
        let endpoints = GcpEndpoints::single_host("http://127.0.0.1:1234/");
        assert_eq!(endpoints.kms, "http://127.0.0.1:1234/v1");
        assert_eq!(endpoints.storage, "http://127.0.0.1:1234/storage/v1");
    }
}
