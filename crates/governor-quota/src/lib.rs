//! Quota controllers for the governor
//!
//! - [`claim_controller`]: grants or denies ResourceClaims
//! - [`grant_controller`]: activates ResourceGrants
//! - [`registration_controller`]: activates ResourceRegistrations
//!
//! The decision logic lives in [`evaluator`] and [`registration`] and is free
//! of I/O.

#![deny(missing_docs)]

pub mod claim_controller;
pub mod client;
pub mod evaluator;
pub mod grant_controller;
pub mod registration;
pub mod registration_controller;

pub use client::{QuotaContext, QuotaKubeClient, QuotaKubeClientImpl};
pub use evaluator::{applicable_limit, RequestEvaluation};
