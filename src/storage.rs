use async_trait::async_trait;
use opendal::services::Fs;
use opendal::services::S3;
use opendal::Operator;

use crate::config::{AppConfig, StorageBackend};
use crate::digest::OciDigest;
use crate::error::{AppError, Result};
use crate::manifest::Descriptor;
use crate::verify::ExistenceChecker;

/// Opendal-backed store holding blobs by content digest, the per-repository
/// manifest revision registry, tag links and the referrer index files.
#[derive(Debug)]
pub struct Storage {
    operator: Operator,
}

impl Storage {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let operator = match config.storage.backend {
            StorageBackend::Fs => {
                let root = config.storage.fs_root.clone()
                    .ok_or_else(|| AppError::Config("Missing fs_root configuration".to_string()))?;

                let mut builder = Fs::default();
                builder.root(&root.to_string_lossy());

                Operator::new(builder)
                    .map_err(AppError::Storage)?
                    .finish()
            }
            StorageBackend::S3 => {
                let bucket = config.storage.s3_bucket.clone()
                    .ok_or_else(|| AppError::Config("Missing s3_bucket configuration".to_string()))?;
                let region = config.storage.s3_region.clone()
                    .ok_or_else(|| AppError::Config("Missing s3_region configuration".to_string()))?;

                let mut builder = S3::default();
                builder.bucket(&bucket);
                builder.region(&region);

                if let Some(endpoint) = &config.storage.s3_endpoint {
                    builder.endpoint(endpoint);
                }

                if let Some(access_key) = &config.storage.s3_access_key {
                    builder.access_key_id(access_key);
                }

                if let Some(secret_key) = &config.storage.s3_secret_key {
                    builder.secret_access_key(secret_key);
                }

                Operator::new(builder)
                    .map_err(AppError::Storage)?
                    .finish()
            }
        };

        Ok(Self { operator })
    }

    // Blob operations

    /// Persist content under its own digest, computed over the exact bytes
    /// given. Returns the descriptor of the stored content. Overwriting an
    /// existing blob rewrites identical bytes, so concurrent puts of the same
    /// content converge.
    pub async fn put_content(&self, media_type: &str, content: bytes::Bytes) -> Result<Descriptor> {
        let digest = OciDigest::from_bytes(&content);
        let size = content.len() as i64;

        let path = format!("blobs/{}", digest);
        self.operator.write(&path, content)
            .await
            .map_err(AppError::Storage)?;

        Ok(Descriptor::new(media_type, digest, size))
    }

    /// Seed path used by tests and upload completion: store content under a
    /// caller-supplied digest, which must match the bytes.
    pub async fn put_blob(&self, digest: &OciDigest, content: bytes::Bytes) -> Result<()> {
        let computed = OciDigest::from_bytes(&content);
        if &computed != digest {
            return Err(AppError::BadRequest(format!(
                "Digest mismatch: expected {}, got {}",
                digest, computed
            )));
        }

        let path = format!("blobs/{}", digest);
        self.operator.write(&path, content)
            .await
            .map_err(AppError::Storage)
    }

    pub async fn blob_exists(&self, digest: &OciDigest) -> Result<bool> {
        let path = format!("blobs/{}", digest);
        self.operator.is_exist(&path)
            .await
            .map_err(AppError::Storage)
    }

    /// Descriptor of a stored blob, or NotFound
    pub async fn stat_blob(&self, digest: &OciDigest) -> Result<Descriptor> {
        let path = format!("blobs/{}", digest);

        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::NotFound(format!("Blob not found: {}", digest)));
        }

        let metadata = self.operator.stat(&path)
            .await
            .map_err(AppError::Storage)?;

        Ok(Descriptor::new(
            "application/octet-stream",
            digest.clone(),
            metadata.content_length() as i64,
        ))
    }

    pub async fn get_blob(&self, digest: &OciDigest) -> Result<bytes::Bytes> {
        let path = format!("blobs/{}", digest);

        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::NotFound(format!("Blob not found: {}", digest)));
        }

        let data = self.operator.read(&path)
            .await
            .map_err(AppError::Storage)?;
        Ok(bytes::Bytes::from(data))
    }

    // Manifest revision operations
    //
    // Manifest bytes live in the blob store; a revision link marks a digest
    // as a manifest of the repository.

    pub async fn link_revision(&self, repository: &str, digest: &OciDigest) -> Result<()> {
        let path = format!("manifests/{}/revisions/{}", repository, digest);
        self.operator.write(&path, bytes::Bytes::new())
            .await
            .map_err(AppError::Storage)
    }

    pub async fn manifest_exists(&self, repository: &str, digest: &OciDigest) -> Result<bool> {
        let path = format!("manifests/{}/revisions/{}", repository, digest);
        self.operator.is_exist(&path)
            .await
            .map_err(AppError::Storage)
    }

    pub async fn get_manifest(&self, repository: &str, digest: &OciDigest) -> Result<bytes::Bytes> {
        if !self.manifest_exists(repository, digest).await? {
            return Err(AppError::ManifestUnknown(format!(
                "{}@{}", repository, digest
            )));
        }

        self.get_blob(digest).await
    }

    // Tag operations
    //
    // A tag is a named link file whose content is the digest it points at.

    pub async fn link_tag(&self, repository: &str, tag: &str, digest: &OciDigest) -> Result<()> {
        let path = format!("manifests/{}/tags/{}", repository, tag);
        self.operator.write(&path, bytes::Bytes::from(digest.to_string()))
            .await
            .map_err(AppError::Storage)
    }

    pub async fn resolve_tag(&self, repository: &str, tag: &str) -> Result<OciDigest> {
        let path = format!("manifests/{}/tags/{}", repository, tag);

        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::ManifestUnknown(format!("{}:{}", repository, tag)));
        }

        let data = self.operator.read(&path)
            .await
            .map_err(AppError::Storage)?;
        let raw = String::from_utf8(data)
            .map_err(|e| AppError::Internal(format!("Corrupt tag link {}: {}", path, e)))?;

        raw.trim().parse()
            .map_err(|e| AppError::Internal(format!("Corrupt tag link {}: {}", path, e)))
    }

    // Referrer index files
    //
    // One file per {subject, referrer} pair; rewriting the same pair is the
    // idempotence the index relies on.

    pub async fn put_referrer_entry(
        &self,
        repository: &str,
        subject: &OciDigest,
        referrer: &OciDigest,
        content: bytes::Bytes,
    ) -> Result<()> {
        let path = format!("referrers/{}/{}/{}", repository, subject, referrer);
        self.operator.write(&path, content)
            .await
            .map_err(AppError::Storage)
    }

    /// All entry files recorded for a subject, in file-name order so a fixed
    /// store state always lists deterministically.
    pub async fn list_referrer_entries(
        &self,
        repository: &str,
        subject: &OciDigest,
    ) -> Result<Vec<bytes::Bytes>> {
        let dir = format!("referrers/{}/{}/", repository, subject);

        if !self.operator.is_exist(&dir).await.map_err(AppError::Storage)? {
            return Ok(Vec::new());
        }

        let mut entries = self.operator.list(&dir)
            .await
            .map_err(AppError::Storage)?;
        entries.sort_by(|a, b| a.name().cmp(b.name()));

        let mut contents = Vec::new();
        for entry in entries {
            if entry.metadata().is_dir() {
                continue;
            }
            let path = format!("{}{}", dir, entry.name());
            let data = self.operator.read(&path)
                .await
                .map_err(AppError::Storage)?;
            contents.push(bytes::Bytes::from(data));
        }

        Ok(contents)
    }

    /// Existence checker scoped to one repository, handed to the dependency
    /// verifier
    pub fn checker<'a>(&'a self, repository: &'a str) -> RepositoryChecker<'a> {
        RepositoryChecker {
            storage: self,
            repository,
        }
    }
}

pub struct RepositoryChecker<'a> {
    storage: &'a Storage,
    repository: &'a str,
}

#[async_trait]
impl ExistenceChecker for RepositoryChecker<'_> {
    async fn blob_exists(&self, digest: &OciDigest) -> std::result::Result<bool, opendal::Error> {
        let path = format!("blobs/{}", digest);
        self.storage.operator.is_exist(&path).await
    }

    async fn manifest_exists(
        &self,
        digest: &OciDigest,
    ) -> std::result::Result<bool, opendal::Error> {
        let path = format!("manifests/{}/revisions/{}", self.repository, digest);
        self.storage.operator.is_exist(&path).await
    }
}
