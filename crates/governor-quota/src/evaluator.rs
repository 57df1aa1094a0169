//! Quota evaluation
//!
//! A request is granted when current usage plus the requested amount stays
//! within the applicable limit. Usage comes from the request's AllowanceBucket
//! (absent bucket means nothing is used yet); the limit is the sum of every
//! active grant bucket whose dimension selector matches the request.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use governor_common::crd::{
    conditions, is_condition_true, AllocationOutcome, Condition, ConditionStatus,
    ResourceClaimAllocationStatus, ResourceGrant, ResourceRequest,
};

/// Granted condition reason when every request fits
pub const REASON_GRANTED: &str = "Granted";
/// Granted condition reason when a request would exceed quota
pub const REASON_DENIED: &str = "Denied";
/// Granted condition reason when registrations are missing or inactive
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";

/// Allocation reason for a request that fits
pub const REASON_QUOTA_AVAILABLE: &str = "QuotaAvailable";
/// Allocation reason for a request that does not fit
pub const REASON_QUOTA_EXCEEDED: &str = "QuotaExceeded";

/// Sum of the active grant buckets applying to `request`
pub fn applicable_limit(grants: &[ResourceGrant], request: &ResourceRequest) -> i64 {
    let none = BTreeMap::new();
    let dimensions = request.dimensions.as_ref().unwrap_or(&none);
    grants
        .iter()
        .filter(|g| {
            g.status
                .as_ref()
                .is_some_and(|s| is_condition_true(&s.conditions, conditions::ACTIVE))
        })
        .flat_map(|g| g.spec.allowances.iter())
        .filter(|a| a.resource_type == request.resource_type)
        .flat_map(|a| a.buckets.iter())
        .filter(|b| b.dimension_selector.matches(dimensions))
        .map(|b| b.amount)
        .sum()
}

/// Outcome of evaluating one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestEvaluation {
    /// Requested resource type
    pub resource_type: String,
    /// Requested amount
    pub amount: i64,
    /// Usage recorded in the bucket before this request
    pub usage: i64,
    /// Applicable limit from active grants
    pub limit: i64,
    /// Bucket the request is counted against
    pub bucket: String,
}

impl RequestEvaluation {
    /// Evaluate `request` against `usage` and the applicable limit in `grants`
    pub fn new(
        request: &ResourceRequest,
        usage: i64,
        grants: &[ResourceGrant],
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: request.resource_type.clone(),
            amount: request.amount,
            usage,
            limit: applicable_limit(grants, request),
            bucket: bucket.into(),
        }
    }

    /// Whether the request fits within the limit
    pub fn granted(&self) -> bool {
        self.usage.saturating_add(self.amount) <= self.limit
    }

    /// Headroom before this request
    pub fn available(&self) -> i64 {
        self.limit - self.usage
    }

    /// Headroom left if this request is granted
    pub fn remaining(&self) -> i64 {
        self.available() - self.amount
    }

    /// Human-readable evaluation result
    pub fn message(&self) -> String {
        if self.granted() {
            format!(
                "Granted {} units of {} (current usage: {}, applicable limit: {}, available: {}, remaining: {})",
                self.amount,
                self.resource_type,
                self.usage,
                self.limit,
                self.available(),
                self.remaining()
            )
        } else {
            format!(
                "Denied {} units of {} - would exceed quota (current usage: {}, applicable limit: {}, available: {})",
                self.amount,
                self.resource_type,
                self.usage,
                self.limit,
                self.available()
            )
        }
    }

    /// Allocation status entry; `now` is used as the transition time
    pub fn allocation(&self, now: DateTime<Utc>) -> ResourceClaimAllocationStatus {
        let (status, reason, allocated) = if self.granted() {
            (AllocationOutcome::Granted, REASON_QUOTA_AVAILABLE, self.amount)
        } else {
            (AllocationOutcome::Denied, REASON_QUOTA_EXCEEDED, 0)
        };
        ResourceClaimAllocationStatus {
            resource_type: self.resource_type.clone(),
            status,
            reason: reason.to_string(),
            message: self.message(),
            allocated_amount: allocated,
            allocating_bucket: self.bucket.clone(),
            last_transition_time: now,
        }
    }
}

/// Carry `lastTransitionTime` over from `previous` for allocations whose
/// outcome did not change
pub fn merge_allocations(
    previous: &[ResourceClaimAllocationStatus],
    mut next: Vec<ResourceClaimAllocationStatus>,
) -> Vec<ResourceClaimAllocationStatus> {
    for (i, alloc) in next.iter_mut().enumerate() {
        if let Some(old) = previous.get(i) {
            if old.resource_type == alloc.resource_type && old.status == alloc.status {
                alloc.last_transition_time = old.last_transition_time;
            }
        }
    }
    next
}

/// `Granted` condition for a fully evaluated claim
pub fn claim_condition(granted: bool, generation: Option<i64>) -> Condition {
    let condition = if granted {
        Condition::new(
            conditions::GRANTED,
            ConditionStatus::True,
            REASON_GRANTED,
            "Claim granted due to quota availability",
        )
    } else {
        Condition::new(
            conditions::GRANTED,
            ConditionStatus::False,
            REASON_DENIED,
            "Claim denied as it would exceed the currently set quota limit.",
        )
    };
    condition.with_generation(generation)
}

/// `Granted` condition for a claim that failed validation
pub fn validation_failed_condition(error: &str, generation: Option<i64>) -> Condition {
    Condition::new(
        conditions::GRANTED,
        ConditionStatus::False,
        REASON_VALIDATION_FAILED,
        format!("Validation failed: {error}"),
    )
    .with_generation(generation)
}
