use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Descriptor, ManifestError, MEDIA_TYPE_ARTIFACT_MANIFEST};

/// A single-artifact manifest: a typed bundle of blobs plus links to the
/// manifests it declares a relationship to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Media type of this manifest, if declared
    #[serde(default)]
    pub media_type: String,

    /// Type of the artifact this manifest describes
    #[serde(default)]
    pub artifact_type: String,

    /// Configuration object for the artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,

    /// Content the artifact carries, such as signature payloads
    #[serde(default)]
    pub blobs: Vec<Descriptor>,

    /// Manifests this artifact is linked to
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// Wraps [`Artifact`] with the exact bytes it was decoded from.
#[derive(Debug, Clone, Default)]
pub struct DeserializedArtifact {
    inner: Artifact,

    // canonical is the byte representation the manifest digest is computed
    // over; the parsed view above is never re-serialized onto the wire.
    canonical: Bytes,
}

impl DeserializedArtifact {
    /// Parse artifact manifest bytes, retaining them verbatim.
    ///
    /// A mediaType field that is present but not the artifact manifest media
    /// type is a hard failure: an unexpected container desynchronizes clients
    /// that dispatch on media type.
    pub fn decode(content: &[u8]) -> Result<Self, ManifestError> {
        let canonical = Bytes::copy_from_slice(content);
        let inner: Artifact = serde_json::from_slice(&canonical)?;

        if !inner.media_type.is_empty() && inner.media_type != MEDIA_TYPE_ARTIFACT_MANIFEST {
            return Err(ManifestError::MediaTypeMismatch {
                expected: MEDIA_TYPE_ARTIFACT_MANIFEST.to_string(),
                found: inner.media_type,
            });
        }

        Ok(Self { inner, canonical })
    }

    /// Declared media type, or the artifact manifest default when the source
    /// bytes omitted the field
    pub fn media_type(&self) -> &str {
        if self.inner.media_type.is_empty() {
            MEDIA_TYPE_ARTIFACT_MANIFEST
        } else {
            &self.inner.media_type
        }
    }

    /// Type of the artifact
    pub fn artifact_type(&self) -> &str {
        &self.inner.artifact_type
    }

    /// Canonical (media type, bytes) of this manifest
    pub fn payload(&self) -> Result<(String, Bytes), ManifestError> {
        if self.canonical.is_empty() {
            return Err(ManifestError::NotInitialized);
        }
        Ok((self.media_type().to_string(), self.canonical.clone()))
    }

    /// Blobs this artifact depends on: its blob list plus the config, if any
    pub fn dependencies(&self) -> Vec<Descriptor> {
        let mut blobs = self.inner.blobs.clone();
        if let Some(config) = &self.inner.config {
            blobs.push(config.clone());
        }
        blobs
    }

    /// Manifests this artifact declares a referrer relationship toward
    pub fn subjects(&self) -> Vec<Descriptor> {
        self.inner.manifests.clone()
    }
}
