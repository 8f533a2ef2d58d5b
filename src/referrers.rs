use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::digest::OciDigest;
use crate::error::{AppError, Result};
use crate::storage::Storage;

/// One reverse-index record: `referrer` declared a relationship to `subject`.
/// Written exactly once per {subject, referrer} pair and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferrerEntry {
    pub subject: OciDigest,
    pub referrer: OciDigest,
    /// Artifact type declared by the referrer; empty for index manifests
    #[serde(default)]
    pub artifact_type: String,
    /// Media type the entry is keyed by: the referrer's own manifest media
    /// type for artifacts, its config object's media type for indexes
    #[serde(default)]
    pub media_type: String,
    /// Byte size of the referrer manifest
    #[serde(default)]
    pub size: i64,
}

/// Reverse lookup from a target digest to the manifests referring to it,
/// scoped to one repository.
#[derive(Debug, Clone)]
pub struct ReferrerIndex {
    storage: Arc<Storage>,
    repository: String,
}

impl ReferrerIndex {
    pub fn new(storage: Arc<Storage>, repository: impl Into<String>) -> Self {
        Self {
            storage,
            repository: repository.into(),
        }
    }

    /// Record one referrer entry. Keyed by {subject, referrer}, so repeating
    /// the call with identical arguments rewrites the same record and no
    /// duplicate becomes observable.
    pub async fn link_subject(&self, entry: &ReferrerEntry) -> Result<()> {
        debug!(
            subject = %entry.subject,
            referrer = %entry.referrer,
            "linking referrer"
        );

        let content = serde_json::to_vec(entry)?;
        self.storage
            .put_referrer_entry(
                &self.repository,
                &entry.subject,
                &entry.referrer,
                bytes::Bytes::from(content),
            )
            .await
    }

    /// Entries recorded for `subject`. A non-empty `artifact_type` restricts
    /// results to exact matches; no wildcarding. A subject nothing links to
    /// yields an empty list.
    pub async fn referrers(
        &self,
        subject: &OciDigest,
        artifact_type: &str,
    ) -> Result<Vec<ReferrerEntry>> {
        let mut results = Vec::new();
        for raw in self
            .storage
            .list_referrer_entries(&self.repository, subject)
            .await?
        {
            let entry: ReferrerEntry = serde_json::from_slice(&raw)?;
            if artifact_type.is_empty() || entry.artifact_type == artifact_type {
                results.push(entry);
            }
        }
        Ok(results)
    }

    /// Referrer digests for `subject` whose entry media type equals
    /// `media_type`. The filter is mandatory: unfiltered metadata queries are
    /// too broad to serve, so an empty filter fails before any index read.
    pub async fn referrer_metadata(
        &self,
        subject: &OciDigest,
        media_type: &str,
    ) -> Result<Vec<OciDigest>> {
        if media_type.is_empty() {
            return Err(AppError::MediaTypeUnspecified);
        }

        let mut digests = Vec::new();
        for raw in self
            .storage
            .list_referrer_entries(&self.repository, subject)
            .await?
        {
            let entry: ReferrerEntry = serde_json::from_slice(&raw)?;
            if entry.media_type == media_type {
                digests.push(entry.referrer);
            }
        }
        Ok(digests)
    }
}
