use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::digest::OciDigest;
use crate::error::{AppError, Result};
use crate::manifest::{
    decode_manifest, DecodedManifest, MEDIA_TYPE_ARTIFACT_MANIFEST, MEDIA_TYPE_IMAGE_INDEX,
};
use crate::referrers::{ReferrerEntry, ReferrerIndex};
use crate::storage::Storage;
use crate::verify::verify;

/// Per-kind manifest write pipeline: decode, verify against the backing
/// store, persist the canonical bytes by content digest, then record one
/// referrer-index entry per subject.
///
/// Handlers hold no per-call state; `put` and `unmarshal` are safe to invoke
/// concurrently.
#[async_trait]
pub trait ManifestHandler: Send + Sync {
    /// Decode manifest bytes into this handler's kind
    fn unmarshal(&self, content: &[u8]) -> Result<DecodedManifest>;

    /// Verify and persist a decoded manifest, returning the digest of its
    /// canonical bytes. Nothing is stored when verification fails. If a
    /// referrer link fails after the content write, the manifest stays
    /// durable and the error propagates: silently swallowing it would leave
    /// the manifest permanently undiscoverable through referrer queries.
    async fn put(
        &self,
        manifest: &DecodedManifest,
        skip_dependency_verification: bool,
    ) -> Result<OciDigest>;
}

impl std::fmt::Debug for dyn ManifestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ManifestHandler")
    }
}

/// Handler for single-artifact manifests
pub struct ArtifactHandler {
    storage: Arc<Storage>,
    repository: String,
    referrers: ReferrerIndex,
}

impl ArtifactHandler {
    pub fn new(storage: Arc<Storage>, repository: impl Into<String>) -> Self {
        let repository = repository.into();
        let referrers = ReferrerIndex::new(Arc::clone(&storage), repository.clone());
        Self {
            storage,
            repository,
            referrers,
        }
    }
}

#[async_trait]
impl ManifestHandler for ArtifactHandler {
    fn unmarshal(&self, content: &[u8]) -> Result<DecodedManifest> {
        debug!("ArtifactHandler::unmarshal");
        Ok(decode_manifest(MEDIA_TYPE_ARTIFACT_MANIFEST, content)?)
    }

    async fn put(
        &self,
        manifest: &DecodedManifest,
        skip_dependency_verification: bool,
    ) -> Result<OciDigest> {
        debug!("ArtifactHandler::put");

        let DecodedManifest::Artifact(artifact) = manifest else {
            return Err(AppError::WrongManifestType {
                handler: "artifact",
            });
        };

        let checker = self.storage.checker(&self.repository);
        verify(manifest, &checker, skip_dependency_verification).await?;

        let (media_type, payload) = artifact.payload()?;
        let size = payload.len() as i64;

        let revision = self.storage.put_content(&media_type, payload).await?;
        self.storage
            .link_revision(&self.repository, &revision.digest)
            .await?;

        // Link this artifact as a referrer of each manifest it declares a
        // relationship to.
        for subject in artifact.subjects() {
            let entry = ReferrerEntry {
                subject: subject.digest,
                referrer: revision.digest.clone(),
                artifact_type: artifact.artifact_type().to_string(),
                media_type: media_type.clone(),
                size,
            };
            if let Err(err) = self.referrers.link_subject(&entry).await {
                error!("error linking referrer entry: {}", err);
                return Err(err);
            }
        }

        Ok(revision.digest)
    }
}

/// Handler for OCI index manifests
pub struct IndexHandler {
    storage: Arc<Storage>,
    repository: String,
    referrers: ReferrerIndex,
}

impl IndexHandler {
    pub fn new(storage: Arc<Storage>, repository: impl Into<String>) -> Self {
        let repository = repository.into();
        let referrers = ReferrerIndex::new(Arc::clone(&storage), repository.clone());
        Self {
            storage,
            repository,
            referrers,
        }
    }
}

#[async_trait]
impl ManifestHandler for IndexHandler {
    fn unmarshal(&self, content: &[u8]) -> Result<DecodedManifest> {
        debug!("IndexHandler::unmarshal");
        Ok(decode_manifest(MEDIA_TYPE_IMAGE_INDEX, content)?)
    }

    async fn put(
        &self,
        manifest: &DecodedManifest,
        skip_dependency_verification: bool,
    ) -> Result<OciDigest> {
        debug!("IndexHandler::put");

        let DecodedManifest::Index(index) = manifest else {
            return Err(AppError::WrongManifestType { handler: "index" });
        };

        let checker = self.storage.checker(&self.repository);
        verify(manifest, &checker, skip_dependency_verification).await?;

        let (media_type, payload) = index.payload()?;
        let size = payload.len() as i64;

        let revision = self.storage.put_content(&media_type, payload).await?;
        self.storage
            .link_revision(&self.repository, &revision.digest)
            .await?;

        // Link the index as a referrer of each indexed manifest. The entry is
        // keyed by the config object's media type: metadata queries filter on
        // the config identity, not on the index's own media type.
        let config_media_type = index
            .config()
            .map(|c| c.media_type.clone())
            .unwrap_or_default();
        for subject in index.subjects() {
            let entry = ReferrerEntry {
                subject: subject.digest,
                referrer: revision.digest.clone(),
                artifact_type: String::new(),
                media_type: config_media_type.clone(),
                size,
            };
            if let Err(err) = self.referrers.link_subject(&entry).await {
                error!("error linking referrer entry: {}", err);
                return Err(err);
            }
        }

        Ok(revision.digest)
    }
}

type HandlerCtor = fn(Arc<Storage>, String) -> Box<dyn ManifestHandler>;

fn new_artifact_handler(storage: Arc<Storage>, repository: String) -> Box<dyn ManifestHandler> {
    Box::new(ArtifactHandler::new(storage, repository))
}

fn new_index_handler(storage: Arc<Storage>, repository: String) -> Box<dyn ManifestHandler> {
    Box::new(IndexHandler::new(storage, repository))
}

/// Dispatch table from manifest media type to handler constructor. A new
/// manifest kind registers here and in the decoder table; call sites stay
/// unchanged.
const HANDLERS: &[(&str, HandlerCtor)] = &[
    (MEDIA_TYPE_ARTIFACT_MANIFEST, new_artifact_handler),
    (MEDIA_TYPE_IMAGE_INDEX, new_index_handler),
];

/// Select the handler registered for the given media type
pub fn handler_for(
    media_type: &str,
    storage: Arc<Storage>,
    repository: &str,
) -> Result<Box<dyn ManifestHandler>> {
    for (known, ctor) in HANDLERS {
        if *known == media_type {
            return Ok(ctor(storage, repository.to_string()));
        }
    }
    Err(AppError::Manifest(
        crate::manifest::ManifestError::UnsupportedMediaType(media_type.to_string()),
    ))
}
