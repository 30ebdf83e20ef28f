//! Kubernetes manifests describing a finished bootstrap
//!
//! Exactly two documents are emitted, Secret first and ConfigMap second:
//!
//! - Secret: `ca.crt`, `server.crt`, `server.key`
//! - ConfigMap: `api-addr`, `gcs-bucket-name`, `kms-key-id`
//!
//! The rendered file contains private key material, so it is written with
//! owner-only permissions and swapped into place with a rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::Result;

/// Secret key holding the CA certificate
pub const CA_CERT_KEY: &str = "ca.crt";
/// Secret key holding the server certificate
pub const SERVER_CERT_KEY: &str = "server.crt";
/// Secret key holding the server private key
pub const SERVER_KEY_KEY: &str = "server.key";

/// ConfigMap key for the advertised API address
pub const API_ADDR_KEY: &str = "api-addr";
/// ConfigMap key for the storage bucket
pub const BUCKET_NAME_KEY: &str = "gcs-bucket-name";
/// ConfigMap key for the KMS crypto key id
pub const KMS_KEY_ID_KEY: &str = "kms-key-id";

const DOCUMENT_SEPARATOR: &str = "---\n";

/// Everything the two manifests carry
#[derive(Clone)]
pub struct ManifestInputs {
    /// Name of both objects
    pub name: String,
    /// Namespace of both objects, if any
    pub namespace: Option<String>,
    /// PEM CA certificate
    pub ca_cert: String,
    /// PEM server certificate
    pub server_cert: String,
    /// PEM server private key
    pub server_key: String,
    /// Address clients use to reach the server
    pub api_addr: String,
    /// Storage bucket name
    pub bucket_name: String,
    /// Fully-qualified KMS crypto key name
    pub kms_key_id: String,
}

impl std::fmt::Debug for ManifestInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestInputs")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("api_addr", &self.api_addr)
            .field("bucket_name", &self.bucket_name)
            .field("kms_key_id", &self.kms_key_id)
            .finish_non_exhaustive()
    }
}

/// One emitted document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    /// TLS material
    Secret(Secret),
    /// Server configuration values
    ConfigMap(ConfigMap),
}

impl Manifest {
    /// Kubernetes kind of the document
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Secret(_) => "Secret",
            Self::ConfigMap(_) => "ConfigMap",
        }
    }
}

fn metadata(inputs: &ManifestInputs) -> ObjectMeta {
    ObjectMeta {
        name: Some(inputs.name.clone()),
        namespace: inputs.namespace.clone(),
        ..Default::default()
    }
}

/// Assemble the Secret and ConfigMap, in that order
pub fn build_manifests(inputs: &ManifestInputs) -> Vec<Manifest> {
    let mut data = BTreeMap::new();
    data.insert(
        CA_CERT_KEY.to_string(),
        ByteString(inputs.ca_cert.as_bytes().to_vec()),
    );
    data.insert(
        SERVER_CERT_KEY.to_string(),
        ByteString(inputs.server_cert.as_bytes().to_vec()),
    );
    data.insert(
        SERVER_KEY_KEY.to_string(),
        ByteString(inputs.server_key.as_bytes().to_vec()),
    );

    let secret = Secret {
        metadata: metadata(inputs),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    };

    let config_map = ConfigMap {
        metadata: metadata(inputs),
        data: Some(BTreeMap::from([
            (API_ADDR_KEY.to_string(), inputs.api_addr.clone()),
            (BUCKET_NAME_KEY.to_string(), inputs.bucket_name.clone()),
            (KMS_KEY_ID_KEY.to_string(), inputs.kms_key_id.clone()),
        ])),
        ..Default::default()
    };

    vec![Manifest::Secret(secret), Manifest::ConfigMap(config_map)]
}

/// Serialize documents to YAML separated by `---`
pub fn render_manifests(manifests: &[Manifest]) -> Result<String> {
    let docs = manifests
        .iter()
        .map(serde_yaml::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(docs.join(DOCUMENT_SEPARATOR))
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string());
    path.with_file_name(format!(".{}.tmp", file_name))
}

async fn write_private(tmp: &Path, contents: &str) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(tmp).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    // An existing file keeps its mode across truncation, so force it again
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

/// Write rendered manifests to `path` with mode 0600, replacing it atomically.
///
/// The temporary file holds key material, so it is removed if any step fails.
pub async fn write_manifests(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path);
    let written = match write_private(&tmp, contents).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temporary manifest");
            }
        }
        return Err(e.into());
    }

    debug!(path = %path.display(), bytes = contents.len(), "Wrote manifests");
    Ok(())
}
