//! Documentation CRDs: Document and DocumentRevision

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Document is a versioned legal or policy document.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "documentation.miloapis.com",
    version = "v1alpha1",
    kind = "Document",
    namespaced,
    status = "DocumentStatus",
    printcolumn = r#"{"name":"Latest","type":"string","jsonPath":".status.latestRevisionRef.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSpec {
    /// Title
    pub title: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Document type (e.g. terms-of-service)
    #[serde(default)]
    pub document_type: String,
}

/// Pointer to the highest-versioned revision of a document
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatestRevisionRef {
    /// Revision name
    pub name: String,
    /// Revision namespace
    pub namespace: String,
    /// Revision version
    pub version: String,
    /// Revision effective date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Document status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatus {
    /// Ready condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Highest revision seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision_ref: Option<LatestRevisionRef>,
}

/// Reference from a revision to its document
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DocumentReference {
    /// Document name
    pub name: String,
    /// Document namespace
    pub namespace: String,
}

/// Revision body
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DocumentRevisionContent {
    /// Content format (markdown, html)
    pub format: String,
    /// Raw content
    pub data: String,
}

/// DocumentRevision is an immutable version of a Document.
///
/// Versions use `vMAJOR.MINOR.PATCH` and must strictly increase.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "documentation.miloapis.com",
    version = "v1alpha1",
    kind = "DocumentRevision",
    namespaced,
    status = "DocumentRevisionStatus",
    printcolumn = r#"{"name":"Document","type":"string","jsonPath":".spec.documentRef.name"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRevisionSpec {
    /// Document this revision belongs to
    pub document_ref: DocumentReference,
    /// Semantic version, `vMAJOR.MINOR.PATCH`
    pub version: String,
    /// Revision body
    pub content: DocumentRevisionContent,
    /// When the revision takes effect
    pub effective_date: DateTime<Utc>,
    /// Summary of changes from the previous revision
    #[serde(default)]
    pub changes_summary: String,
}

/// DocumentRevision status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRevisionStatus {
    /// Ready condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// SHA-256 of `spec.content.data`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_hash: String,
}
