//! Admission verdicts shared by the validating webhooks

/// Outcome of an admission check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Request may proceed
    Allow,
    /// Request is rejected with a user-facing reason
    Deny(String),
}

impl Verdict {
    /// Reject with `reason`
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny(reason.into())
    }

    /// Whether the request is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Rejection reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(reason),
        }
    }
}
