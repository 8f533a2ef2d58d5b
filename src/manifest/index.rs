use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Descriptor, ManifestError, MEDIA_TYPE_IMAGE_INDEX};

/// An index manifest: a list of references to other manifests, such as
/// per-platform image variants, optionally carrying a config object that
/// describes the set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    /// Media type of this manifest, if declared
    #[serde(default)]
    pub media_type: String,

    /// Schema version of the index
    #[serde(default)]
    pub schema_version: i32,

    /// Configuration object linked to each indexed manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,

    /// The indexed manifests
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// Wraps [`OciIndex`] with the exact bytes it was decoded from.
#[derive(Debug, Clone, Default)]
pub struct DeserializedIndex {
    inner: OciIndex,

    // canonical is the byte representation the manifest digest is computed
    // over; the parsed view above is never re-serialized onto the wire.
    canonical: Bytes,
}

impl DeserializedIndex {
    /// Parse index manifest bytes, retaining them verbatim. A mediaType field
    /// that is present but not the image index media type is a hard failure.
    pub fn decode(content: &[u8]) -> Result<Self, ManifestError> {
        let canonical = Bytes::copy_from_slice(content);
        let inner: OciIndex = serde_json::from_slice(&canonical)?;

        if !inner.media_type.is_empty() && inner.media_type != MEDIA_TYPE_IMAGE_INDEX {
            return Err(ManifestError::MediaTypeMismatch {
                expected: MEDIA_TYPE_IMAGE_INDEX.to_string(),
                found: inner.media_type,
            });
        }

        Ok(Self { inner, canonical })
    }

    /// Declared media type, or the image index default when the source bytes
    /// omitted the field
    pub fn media_type(&self) -> &str {
        if self.inner.media_type.is_empty() {
            MEDIA_TYPE_IMAGE_INDEX
        } else {
            &self.inner.media_type
        }
    }

    /// Schema version declared by the index
    pub fn schema_version(&self) -> i32 {
        self.inner.schema_version
    }

    /// Config descriptor linked to each indexed manifest, if any
    pub fn config(&self) -> Option<&Descriptor> {
        self.inner.config.as_ref()
    }

    /// Canonical (media type, bytes) of this manifest
    pub fn payload(&self) -> Result<(String, Bytes), ManifestError> {
        if self.canonical.is_empty() {
            return Err(ManifestError::NotInitialized);
        }
        Ok((self.media_type().to_string(), self.canonical.clone()))
    }

    /// Manifests the index depends on
    pub fn dependencies(&self) -> Vec<Descriptor> {
        self.inner.manifests.clone()
    }

    /// Each indexed manifest is a subject of the referrer relationship the
    /// index declares
    pub fn subjects(&self) -> Vec<Descriptor> {
        self.inner.manifests.clone()
    }
}
