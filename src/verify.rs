use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::digest::OciDigest;
use crate::manifest::{DecodedManifest, INDEX_SCHEMA_VERSION};

/// Existence checks a manifest's declared references are verified against.
/// Implemented by the backing store, scoped to one repository.
#[async_trait]
pub trait ExistenceChecker: Send + Sync {
    async fn blob_exists(&self, digest: &OciDigest) -> Result<bool, opendal::Error>;
    async fn manifest_exists(&self, digest: &OciDigest) -> Result<bool, opendal::Error>;
}

/// One problem found while verifying a manifest
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("unknown blob: {0}")]
    BlobUnknown(OciDigest),

    #[error("unknown manifest revision: {0}")]
    ManifestUnknown(OciDigest),

    #[error("artifactType must not be empty")]
    ArtifactTypeEmpty,

    #[error("unrecognized index schema version {0}")]
    SchemaVersion(i32),

    // A checker failure is infrastructure trouble, not content invalidity;
    // kept distinct so callers can tell the two apart
    #[error("existence check failed for {digest}: {message}")]
    Checker { digest: OciDigest, message: String },
}

/// Aggregate of every problem found in one verification pass
#[derive(Debug, Default)]
pub struct VerificationErrors(Vec<VerificationError>);

impl VerificationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VerificationError> {
        self.0.iter()
    }
}

impl From<Vec<VerificationError>> for VerificationErrors {
    fn from(errs: Vec<VerificationError>) -> Self {
        Self(errs)
    }
}

impl fmt::Display for VerificationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manifest verification failed: ")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for VerificationErrors {}

/// Verify a manifest's structural integrity and, unless
/// `skip_dependency_verification` is set, that every declared reference
/// already exists in the backing store.
///
/// Failures are collected, not short-circuited: the returned aggregate names
/// every missing reference in one pass. With the skip flag set the checker is
/// never consulted.
pub async fn verify(
    manifest: &DecodedManifest,
    checker: &dyn ExistenceChecker,
    skip_dependency_verification: bool,
) -> Result<(), VerificationErrors> {
    let mut errs = Vec::new();

    match manifest {
        DecodedManifest::Artifact(artifact) => {
            if artifact.artifact_type().is_empty() {
                errs.push(VerificationError::ArtifactTypeEmpty);
            }

            if !skip_dependency_verification {
                // All referenced blobs must exist.
                for descriptor in artifact.dependencies() {
                    match checker.blob_exists(&descriptor.digest).await {
                        Ok(true) => {}
                        Ok(false) => errs.push(VerificationError::BlobUnknown(descriptor.digest)),
                        Err(err) => errs.push(VerificationError::Checker {
                            digest: descriptor.digest,
                            message: err.to_string(),
                        }),
                    }
                }

                // All manifests to link to must exist.
                for descriptor in artifact.subjects() {
                    match checker.manifest_exists(&descriptor.digest).await {
                        Ok(true) => {}
                        Ok(false) => {
                            errs.push(VerificationError::ManifestUnknown(descriptor.digest))
                        }
                        Err(err) => errs.push(VerificationError::Checker {
                            digest: descriptor.digest,
                            message: err.to_string(),
                        }),
                    }
                }
            }
        }
        DecodedManifest::Index(index) => {
            if index.schema_version() != INDEX_SCHEMA_VERSION {
                errs.push(VerificationError::SchemaVersion(index.schema_version()));
            }

            if !skip_dependency_verification {
                // Every indexed entry must exist as a manifest, not an
                // arbitrary blob.
                for descriptor in index.subjects() {
                    match checker.manifest_exists(&descriptor.digest).await {
                        Ok(true) => {}
                        Ok(false) => {
                            errs.push(VerificationError::ManifestUnknown(descriptor.digest))
                        }
                        Err(err) => errs.push(VerificationError::Checker {
                            digest: descriptor.digest,
                            message: err.to_string(),
                        }),
                    }
                }

                if let Some(config) = index.config() {
                    match checker.blob_exists(&config.digest).await {
                        Ok(true) => {}
                        Ok(false) => {
                            errs.push(VerificationError::BlobUnknown(config.digest.clone()))
                        }
                        Err(err) => errs.push(VerificationError::Checker {
                            digest: config.digest.clone(),
                            message: err.to_string(),
                        }),
                    }
                }
            }
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs.into())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::manifest::decode_manifest;
    use crate::manifest::{MEDIA_TYPE_ARTIFACT_MANIFEST, MEDIA_TYPE_IMAGE_INDEX};

    use super::*;

    #[derive(Default)]
    struct FakeChecker {
        blobs: HashSet<OciDigest>,
        manifests: HashSet<OciDigest>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExistenceChecker for FakeChecker {
        async fn blob_exists(&self, digest: &OciDigest) -> Result<bool, opendal::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.blobs.contains(digest))
        }

        async fn manifest_exists(&self, digest: &OciDigest) -> Result<bool, opendal::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.manifests.contains(digest))
        }
    }

    struct BrokenChecker;

    #[async_trait]
    impl ExistenceChecker for BrokenChecker {
        async fn blob_exists(&self, _digest: &OciDigest) -> Result<bool, opendal::Error> {
            Err(opendal::Error::new(
                opendal::ErrorKind::Unexpected,
                "backend down",
            ))
        }

        async fn manifest_exists(&self, _digest: &OciDigest) -> Result<bool, opendal::Error> {
            Err(opendal::Error::new(
                opendal::ErrorKind::Unexpected,
                "backend down",
            ))
        }
    }

    fn digest(n: u8) -> OciDigest {
        OciDigest::from_str(&format!("sha256:{}", hex::encode([n; 32]))).unwrap()
    }

    fn artifact_with_refs() -> DecodedManifest {
        let body = serde_json::to_vec(&serde_json::json!({
            "artifactType": "example/sig",
            "blobs": [
                {"mediaType": "application/octet-stream", "digest": digest(1).to_string(), "size": 1},
                {"mediaType": "application/octet-stream", "digest": digest(2).to_string(), "size": 2},
            ],
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": digest(3).to_string(), "size": 3},
            ],
        }))
        .unwrap();
        decode_manifest(MEDIA_TYPE_ARTIFACT_MANIFEST, &body).unwrap()
    }

    #[tokio::test]
    async fn reports_every_missing_reference() {
        let checker = FakeChecker::default();
        let err = verify(&artifact_with_refs(), &checker, false)
            .await
            .unwrap_err();
        // Two blobs and one manifest missing, nothing short-circuited
        assert_eq!(err.len(), 3);
    }

    #[tokio::test]
    async fn passes_when_all_references_exist() {
        let mut checker = FakeChecker::default();
        checker.blobs.insert(digest(1));
        checker.blobs.insert(digest(2));
        checker.manifests.insert(digest(3));
        verify(&artifact_with_refs(), &checker, false).await.unwrap();
    }

    #[tokio::test]
    async fn skip_never_touches_the_checker() {
        let checker = FakeChecker::default();
        verify(&artifact_with_refs(), &checker, true).await.unwrap();
        assert_eq!(checker.calls.load(Ordering::SeqCst), 0);

        // Even a checker that always errors cannot fail a skipped pass
        verify(&artifact_with_refs(), &BrokenChecker, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_artifact_type_fails_structurally() {
        let body = br#"{"artifactType":"","blobs":[],"manifests":[]}"#;
        let manifest = decode_manifest(MEDIA_TYPE_ARTIFACT_MANIFEST, body).unwrap();
        let err = verify(&manifest, &FakeChecker::default(), true)
            .await
            .unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(matches!(
            err.iter().next().unwrap(),
            VerificationError::ArtifactTypeEmpty
        ));
    }

    #[tokio::test]
    async fn wrong_index_schema_version_fails_structurally() {
        let body = br#"{"schemaVersion":2,"manifests":[]}"#;
        let manifest = decode_manifest(MEDIA_TYPE_IMAGE_INDEX, body).unwrap();
        let err = verify(&manifest, &FakeChecker::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err.iter().next().unwrap(),
            VerificationError::SchemaVersion(2)
        ));
    }

    #[tokio::test]
    async fn checker_failures_are_distinct_from_not_found() {
        let err = verify(&artifact_with_refs(), &BrokenChecker, false)
            .await
            .unwrap_err();
        assert_eq!(err.len(), 3);
        assert!(err
            .iter()
            .all(|e| matches!(e, VerificationError::Checker { .. })));
    }
}
