//! Validating admission webhook for the governor
//!
//! Serves AdmissionReview requests for OrganizationMemberships (role checks
//! and the owner invariant) and DocumentRevisions (the version gate) over
//! HTTPS.

#![deny(missing_docs)]

pub mod error;
pub mod handlers;
pub mod server;

pub use error::WebhookError;
pub use handlers::{router, WebhookState};
pub use server::{serve, WebhookServerConfig};
