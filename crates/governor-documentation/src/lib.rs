//! Documentation controllers for the governor
//!
//! - [`document_controller`]: records each Document's latest revision
//! - [`revision_controller`]: stamps revision content hashes
//! - [`admission`]: the revision version gate served by the webhook
//! - [`version`]: `vMAJOR.MINOR.PATCH` parsing and comparison

#![deny(missing_docs)]

pub mod admission;
pub mod client;
pub mod document_controller;
pub mod revision_controller;
pub mod version;

pub use admission::RevisionAdmission;
pub use client::{DocumentationContext, DocumentationKubeClient, DocumentationKubeClientImpl};
pub use document_controller::{document_for_revision, latest_revision};
pub use version::{is_version_higher, DocumentVersion, VersionError};
