//! Document revision versions
//!
//! Versions are written `vMAJOR.MINOR.PATCH` with exactly three numeric
//! segments. A new revision must carry a version strictly higher than the
//! latest one recorded on its Document.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Why a version string was rejected
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    /// The string does not start with `v`
    #[error("version must start with 'v'")]
    MissingPrefix,
    /// The string does not have exactly three segments
    #[error("version must have three segments")]
    SegmentCount,
    /// A segment is not a non-negative integer
    #[error("invalid segment {0:?}")]
    InvalidSegment(String),
}

/// A parsed `vMAJOR.MINOR.PATCH` version
///
/// Ordering compares major, then minor, then patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentVersion {
    /// Major segment
    pub major: u64,
    /// Minor segment
    pub minor: u64,
    /// Patch segment
    pub patch: u64,
}

impl FromStr for DocumentVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix('v').ok_or(VersionError::MissingPrefix)?;
        let segments: Vec<&str> = rest.split('.').collect();
        let [major, minor, patch] = segments.as_slice() else {
            return Err(VersionError::SegmentCount);
        };
        let parse = |segment: &str| {
            segment
                .parse::<u64>()
                .map_err(|_| VersionError::InvalidSegment(segment.to_string()))
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
            patch: parse(patch)?,
        })
    }
}

impl fmt::Display for DocumentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Whether `new` is strictly higher than `previous`; equal is not higher
pub fn is_version_higher(new: &str, previous: &str) -> Result<bool, VersionError> {
    let new: DocumentVersion = new.parse()?;
    let previous: DocumentVersion = previous.parse()?;
    Ok(new > previous)
}
