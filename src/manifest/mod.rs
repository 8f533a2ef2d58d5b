use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::OciDigest;

pub mod artifact;
pub mod index;

pub use artifact::DeserializedArtifact;
pub use index::DeserializedIndex;

/// Media type of a single-artifact manifest
pub const MEDIA_TYPE_ARTIFACT_MANIFEST: &str = "application/vnd.oci.artifact.manifest.v1+json";

/// Media type of an OCI image index
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Schema version expected of an index manifest carrying a config object
pub const INDEX_SCHEMA_VERSION: i32 = 3;

/// Error type for manifest decoding and re-emission
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Malformed manifest JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("If present, mediaType should be '{expected}' not '{found}'")]
    MediaTypeMismatch { expected: String, found: String },

    #[error("Unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    #[error("JSON representation not initialized")]
    NotInitialized,
}

/// Identifies a piece of content in the registry without containing it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,
    /// Digest of the referenced content
    pub digest: OciDigest,
    /// Size of the referenced content in bytes
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: OciDigest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: None,
            platform: None,
            urls: None,
        }
    }
}

/// Platform a referenced manifest applies to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A decoded manifest of one of the supported kinds.
///
/// The wrapped value retains the exact bytes it was decoded from; the digest
/// a manifest is later addressed by is computed over those bytes, never over
/// a re-serialization.
#[derive(Debug, Clone)]
pub enum DecodedManifest {
    Artifact(DeserializedArtifact),
    Index(DeserializedIndex),
}

impl DecodedManifest {
    /// Declared media type, or the kind's canonical default
    pub fn media_type(&self) -> &str {
        match self {
            DecodedManifest::Artifact(a) => a.media_type(),
            DecodedManifest::Index(i) => i.media_type(),
        }
    }

    /// Canonical (media type, bytes) pair for persistence
    pub fn payload(&self) -> Result<(String, bytes::Bytes), ManifestError> {
        match self {
            DecodedManifest::Artifact(a) => a.payload(),
            DecodedManifest::Index(i) => i.payload(),
        }
    }

    /// Descriptors this manifest requires to exist as blobs
    pub fn dependencies(&self) -> Vec<Descriptor> {
        match self {
            DecodedManifest::Artifact(a) => a.dependencies(),
            DecodedManifest::Index(i) => i.dependencies(),
        }
    }

    /// Descriptors this manifest declares a referrer relationship toward
    pub fn subjects(&self) -> Vec<Descriptor> {
        match self {
            DecodedManifest::Artifact(a) => a.subjects(),
            DecodedManifest::Index(i) => i.subjects(),
        }
    }
}

type DecodeFn = fn(&[u8]) -> Result<DecodedManifest, ManifestError>;

fn decode_artifact(content: &[u8]) -> Result<DecodedManifest, ManifestError> {
    DeserializedArtifact::decode(content).map(DecodedManifest::Artifact)
}

fn decode_index(content: &[u8]) -> Result<DecodedManifest, ManifestError> {
    DeserializedIndex::decode(content).map(DecodedManifest::Index)
}

/// Dispatch table from declared media type to decoder. Adding a manifest kind
/// is a registration here, not a change to call sites.
const DECODERS: &[(&str, DecodeFn)] = &[
    (MEDIA_TYPE_ARTIFACT_MANIFEST, decode_artifact),
    (MEDIA_TYPE_IMAGE_INDEX, decode_index),
];

/// Decode manifest bytes for the given media type
pub fn decode_manifest(media_type: &str, content: &[u8]) -> Result<DecodedManifest, ManifestError> {
    for (known, decode) in DECODERS {
        if *known == media_type {
            return decode(content);
        }
    }
    Err(ManifestError::UnsupportedMediaType(media_type.to_string()))
}

/// Determine the manifest kind from the body when the request declared no
/// usable media type. Prefers the embedded mediaType field, then falls back
/// to probing for kind-specific fields.
pub fn sniff_media_type(content: &[u8]) -> Result<&'static str, ManifestError> {
    let probe: serde_json::Value = serde_json::from_slice(content)?;

    if let Some(declared) = probe.get("mediaType").and_then(|v| v.as_str()) {
        if !declared.is_empty() {
            for (known, _) in DECODERS {
                if *known == declared {
                    return Ok(known);
                }
            }
            return Err(ManifestError::UnsupportedMediaType(declared.to_string()));
        }
    }

    if probe.get("artifactType").is_some() {
        return Ok(MEDIA_TYPE_ARTIFACT_MANIFEST);
    }
    if probe.get("schemaVersion").is_some() {
        return Ok(MEDIA_TYPE_IMAGE_INDEX);
    }

    Err(ManifestError::UnsupportedMediaType(
        "no media type declared or recognizable".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_rejects_unknown_media_type() {
        let err = decode_manifest("application/vnd.example.unknown+json", b"{}").unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedMediaType(_)));
    }

    #[test]
    fn sniffs_artifact_by_field() {
        let body = br#"{"artifactType":"example/sig","blobs":[],"manifests":[]}"#;
        assert_eq!(sniff_media_type(body).unwrap(), MEDIA_TYPE_ARTIFACT_MANIFEST);
    }

    #[test]
    fn sniffs_index_by_schema_version() {
        let body = br#"{"schemaVersion":3,"manifests":[]}"#;
        assert_eq!(sniff_media_type(body).unwrap(), MEDIA_TYPE_IMAGE_INDEX);
    }

    #[test]
    fn sniffing_prefers_declared_media_type() {
        let body = br#"{"mediaType":"application/vnd.oci.image.index.v1+json","artifactType":"x"}"#;
        assert_eq!(sniff_media_type(body).unwrap(), MEDIA_TYPE_IMAGE_INDEX);
    }

    #[test]
    fn sniffing_rejects_unknown_declared_media_type() {
        let body = br#"{"mediaType":"application/x-unknown"}"#;
        assert!(matches!(
            sniff_media_type(body).unwrap_err(),
            ManifestError::UnsupportedMediaType(_)
        ));
    }
}
