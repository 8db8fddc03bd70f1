//! File handling: descriptor normalisation, policy enforcement, and the
//! upload-ticket seam.
//!
//! The object/file storage backend itself is an external collaborator; the
//! broker only validates descriptors against the owning request's policy and
//! issues signed put/get URL pairs through [`FileStore`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use pxb_schemas::{BrokerError, FileDescriptor, FilePolicy, Result};

mod mime;
mod policy;

pub use mime::infer_mime;
pub use policy::enforce_policy;

/// Wire form of a file reference on response submission. `size` and `mime`
/// may be absent; normalisation fills them in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Normalise one uploaded-file reference: name and url are required, size is
/// never negative, MIME is inferred from the name when absent, and a sha256
/// must be 64 hex chars when present.
pub fn normalize(input: &FileInput) -> Result<FileDescriptor> {
    if input.name.trim().is_empty() {
        return Err(BrokerError::InvalidInput("file name is required".into()));
    }
    if input.url.trim().is_empty() {
        return Err(BrokerError::InvalidInput(format!(
            "file url is required: {}",
            input.name
        )));
    }
    let size = input.size.unwrap_or(0);
    if size < 0 {
        return Err(BrokerError::InvalidInput(format!(
            "file size must be >= 0: {}",
            input.name
        )));
    }
    if let Some(sha) = &input.sha256 {
        if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BrokerError::InvalidInput(format!(
                "sha256 must be 64 hex chars: {}",
                input.name
            )));
        }
    }
    let mime = match &input.mime {
        Some(m) if !m.trim().is_empty() => m.clone(),
        _ => infer_mime(&input.name).to_string(),
    };
    Ok(FileDescriptor {
        name: input.name.clone(),
        url: input.url.clone(),
        size,
        mime,
        sha256: input.sha256.clone(),
    })
}

/// Normalise a batch and enforce the request's policy over it.
pub fn normalize_and_check(
    policy: Option<&FilePolicy>,
    inputs: &[FileInput],
) -> Result<Vec<FileDescriptor>> {
    let files: Vec<FileDescriptor> = inputs.iter().map(normalize).collect::<Result<_>>()?;
    if let Some(policy) = policy {
        enforce_policy(policy, &files)?;
    }
    Ok(files)
}

// ---------------------------------------------------------------------------
// Upload tickets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUpload {
    pub put_url: String,
    pub get_url: String,
}

/// Pre-signed URL issuance, backend-agnostic.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn sign(&self, request_id: Uuid, name: &str) -> Result<SignedUpload>;
}

/// Local-disk flavour: uploads land under `root/<request>/<name>`, and the
/// issued URLs point at the configured base URL with a content-addressed
/// token derived from the signing secret.
pub struct LocalFileStore {
    root: PathBuf,
    base_url: String,
    secret: String,
}

impl LocalFileStore {
    pub fn new(
        root: impl Into<PathBuf>,
        base_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            secret: secret.into(),
        }
    }

    /// Where a signed upload lands on disk.
    pub fn blob_path(&self, request_id: Uuid, name: &str) -> PathBuf {
        self.root.join(request_id.to_string()).join(name)
    }

    fn token(&self, request_id: Uuid, name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(request_id.as_bytes());
        hasher.update(b"|");
        hasher.update(name.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn prepare_upload_dir(&self, request_id: Uuid) -> Result<()> {
        let dir: &Path = &self.root.join(request_id.to_string());
        std::fs::create_dir_all(dir).map_err(|e| {
            BrokerError::Internal(format!("prepare upload dir {}: {e}", dir.display()))
        })
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn sign(&self, request_id: Uuid, name: &str) -> Result<SignedUpload> {
        if name.trim().is_empty() || name.contains("..") || name.contains('/') {
            return Err(BrokerError::InvalidInput(format!(
                "invalid upload name: {name}"
            )));
        }
        self.prepare_upload_dir(request_id)?;
        let token = self.token(request_id, name);
        let base = self.base_url.trim_end_matches('/');
        Ok(SignedUpload {
            put_url: format!("{base}/{request_id}/{name}?op=put&token={token}"),
            get_url: format!("{base}/{request_id}/{name}?op=get&token={token}"),
        })
    }
}
