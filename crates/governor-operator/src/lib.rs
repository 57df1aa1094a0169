//! Governor operator - wiring for the `governor` binary
//!
//! [`config`] turns flags and environment into settings, and
//! [`controller_runner`] builds the controller futures for each slice.

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
