use serde::{Deserialize, Serialize};

use crate::digest::OciDigest;
use crate::manifest::Descriptor;

// Wire models of the referrer query API

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

/// Response of `GET /v2/{name}/referrers/{reference}`. Echoes back whichever
/// of tag or digest resolved the request; `links` is an empty list, never
/// absent, when nothing refers to the subject.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferrersResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<OciDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub links: Vec<Descriptor>,
    /// Reserved for cursor-based paging; callers must not assume it is
    /// populated
    pub next_link: String,
}

/// Response of `GET /v2/{name}/referrer-metadata/{reference}`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferrerMetadataResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<OciDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub referrer_metadata: Vec<OciDigest>,
    pub next_link: String,
}
