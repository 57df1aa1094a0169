//! AdmissionReview handlers
//!
//! Each handler decodes the review, dispatches on the operation to the
//! matching validator and turns the verdict into an AdmissionResponse. A
//! validator that fails to reach the cluster denies the request; the API
//! server's failure policy decides whether that blocks the user.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use governor_common::admission::Verdict;
use governor_common::crd::{DocumentRevision, OrganizationMembership};
use governor_documentation::RevisionAdmission;
use governor_membership::MembershipAdmission;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::Resource;
use tracing::{debug, error, info};

use crate::error::WebhookError;

/// Path serving OrganizationMembership validation
pub const MEMBERSHIP_PATH: &str =
    "/validate-resourcemanager-miloapis-com-v1alpha1-organizationmembership";

/// Path serving DocumentRevision validation
pub const REVISION_PATH: &str = "/validate-documentation-miloapis-com-v1alpha1-documentrevision";

/// Shared state for the webhook handlers
pub struct WebhookState {
    /// Membership role checks and the owner invariant
    pub memberships: MembershipAdmission,
    /// DocumentRevision version gate
    pub revisions: RevisionAdmission,
}

/// Build the webhook router
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MEMBERSHIP_PATH, post(validate_membership))
        .route(REVISION_PATH, post(validate_revision))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

type ReviewResult = Result<Json<AdmissionReview<DynamicObject>>, WebhookError>;

/// Validate an OrganizationMembership create, update or delete
pub async fn validate_membership(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<OrganizationMembership>>,
) -> ReviewResult {
    let request = decode(review)?;
    let validator = &state.memberships;

    let verdict = match request.operation {
        Operation::Create => validator.validate_create(object(&request)?).await,
        Operation::Update => {
            validator
                .validate_update(old_object(&request)?, object(&request)?)
                .await
        }
        Operation::Delete => validator.validate_delete(old_object(&request)?).await,
        Operation::Connect => Ok(Verdict::Allow),
    };

    Ok(Json(respond(&request, verdict).into_review()))
}

/// Validate a DocumentRevision create, update or delete
pub async fn validate_revision(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DocumentRevision>>,
) -> ReviewResult {
    let request = decode(review)?;
    let validator = &state.revisions;

    let verdict = match request.operation {
        Operation::Create => {
            validator
                .validate_create(object(&request)?, chrono::Utc::now())
                .await
        }
        Operation::Update => {
            validator
                .validate_update(old_object(&request)?, object(&request)?)
                .await
        }
        Operation::Delete => validator.validate_delete(old_object(&request)?).await,
        Operation::Connect => Ok(Verdict::Allow),
    };

    Ok(Json(respond(&request, verdict).into_review()))
}

fn decode<K: Resource>(review: AdmissionReview<K>) -> Result<AdmissionRequest<K>, WebhookError> {
    review.try_into().map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
        error!(error = %e, "failed to parse admission request");
        WebhookError::InvalidReview(e.to_string())
    })
}

fn object<K: Resource>(request: &AdmissionRequest<K>) -> Result<&K, WebhookError> {
    request.object.as_ref().ok_or_else(|| {
        WebhookError::InvalidReview(format!("{:?} request without object", request.operation))
    })
}

fn old_object<K: Resource>(request: &AdmissionRequest<K>) -> Result<&K, WebhookError> {
    request.old_object.as_ref().ok_or_else(|| {
        WebhookError::InvalidReview(format!("{:?} request without oldObject", request.operation))
    })
}

fn respond<K: Resource>(
    request: &AdmissionRequest<K>,
    verdict: governor_common::Result<Verdict>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    match verdict {
        Ok(Verdict::Allow) => {
            debug!(uid = %request.uid, name = %request.name, operation = ?request.operation, "admission allowed");
            response
        }
        Ok(Verdict::Deny(reason)) => {
            info!(
                uid = %request.uid,
                name = %request.name,
                operation = ?request.operation,
                reason = %reason,
                "admission denied"
            );
            response.deny(reason)
        }
        Err(e) => {
            error!(
                uid = %request.uid,
                name = %request.name,
                error = %e,
                "admission check failed"
            );
            response.deny(format!("admission check failed: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use governor_common::crd::{
        Document, DocumentReference, DocumentRevisionContent, DocumentRevisionSpec,
        DocumentRevisionStatus, DocumentSpec, DocumentStatus, LatestRevisionRef, MemberReference,
        Organization, OrganizationMembershipSpec, OrganizationReference, OrganizationSpec, Role,
        RoleReference, RoleSpec,
    };
    use governor_common::Result;
    use governor_documentation::DocumentationKubeClient;
    use governor_membership::{MembershipAdmissionClient, OwnerPolicy};
    use k8s_openapi::api::core::v1::Namespace;
    use kube::ResourceExt;
    use serde::Serialize;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    // =========================================================================
    // Fake Cluster
    // =========================================================================

    /// Every role, namespace and organization exists; memberships are fixed
    struct FakeOrg {
        memberships: Vec<OrganizationMembership>,
    }

    #[async_trait]
    impl MembershipAdmissionClient for FakeOrg {
        async fn list_memberships(&self, _namespace: &str) -> Result<Vec<OrganizationMembership>> {
            Ok(self.memberships.clone())
        }

        async fn get_membership(
            &self,
            name: &str,
            _namespace: &str,
        ) -> Result<Option<OrganizationMembership>> {
            Ok(self.memberships.iter().find(|m| m.name_any() == name).cloned())
        }

        async fn get_role(&self, name: &str, _namespace: &str) -> Result<Option<Role>> {
            Ok(Some(Role::new(name, RoleSpec::default())))
        }

        async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
            let mut ns = Namespace::default();
            ns.metadata.name = Some(name.to_string());
            Ok(Some(ns))
        }

        async fn get_organization(&self, name: &str) -> Result<Option<Organization>> {
            Ok(Some(Organization::new(name, OrganizationSpec::default())))
        }
    }

    /// A single Document "tos" whose latest revision is v1.0.0
    struct FakeDocs;

    #[async_trait]
    impl DocumentationKubeClient for FakeDocs {
        async fn get_document(&self, name: &str, _namespace: &str) -> Result<Option<Document>> {
            if name != "tos" {
                return Ok(None);
            }
            let mut doc = Document::new(name, DocumentSpec::default());
            doc.status = Some(DocumentStatus {
                conditions: vec![],
                latest_revision_ref: Some(LatestRevisionRef {
                    name: "tos-v1".into(),
                    namespace: "docs".into(),
                    version: "v1.0.0".into(),
                    published_at: None,
                }),
            });
            Ok(Some(doc))
        }

        async fn patch_document_status(
            &self,
            _name: &str,
            _namespace: &str,
            _status: &DocumentStatus,
        ) -> Result<()> {
            Ok(())
        }

        async fn patch_revision_status(
            &self,
            _name: &str,
            _namespace: &str,
            _status: &DocumentRevisionStatus,
        ) -> Result<()> {
            Ok(())
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn owner_role() -> RoleReference {
        RoleReference::new("organization-owner", Some("milo-system"))
    }

    fn membership(user: &str, roles: Vec<RoleReference>) -> OrganizationMembership {
        let mut m = OrganizationMembership::new(
            &format!("member-{user}"),
            OrganizationMembershipSpec {
                organization_ref: OrganizationReference { name: "acme".into() },
                user_ref: MemberReference { name: user.into() },
                roles,
            },
        );
        m.metadata.namespace = Some("organization-acme".into());
        m
    }

    fn revision(version: &str) -> DocumentRevision {
        let mut r = DocumentRevision::new(
            &format!("tos-{version}"),
            DocumentRevisionSpec {
                document_ref: DocumentReference {
                    name: "tos".into(),
                    namespace: "docs".into(),
                },
                version: version.into(),
                content: DocumentRevisionContent {
                    format: "markdown".into(),
                    data: "# Terms".into(),
                },
                effective_date: Utc::now() + Duration::days(7),
                changes_summary: String::new(),
            },
        );
        r.metadata.namespace = Some("docs".into());
        r
    }

    fn app(memberships: Vec<OrganizationMembership>) -> Router {
        router(Arc::new(WebhookState {
            memberships: MembershipAdmission::new(
                Arc::new(FakeOrg { memberships }),
                OwnerPolicy::new("organization-owner", "milo-system"),
            ),
            revisions: RevisionAdmission::new(Arc::new(FakeDocs)),
        }))
    }

    fn review<K: Serialize>(
        operation: &str,
        resource: &str,
        object: Option<&K>,
        old_object: Option<&K>,
    ) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1alpha1", "kind": resource},
                "resource": {"group": "", "version": "v1alpha1", "resource": resource},
                "name": "test",
                "operation": operation,
                "userInfo": {"username": "alice"},
                "object": object,
                "oldObject": old_object,
                "dryRun": false
            }
        })
    }

    async fn send(app: Router, path: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn allowed(body: &Value) -> bool {
        body["response"]["allowed"].as_bool().unwrap_or(false)
    }

    // =========================================================================
    // Membership Stories
    // =========================================================================

    /// Story: Deleting the last owner is denied with the remediation message
    #[tokio::test]
    async fn story_last_owner_delete_denied_over_http() {
        let alice = membership("alice", vec![owner_role()]);
        let body = review("DELETE", "organizationmemberships", None, Some(&alice));

        let (status, body) = send(app(vec![alice.clone()]), MEMBERSHIP_PATH, body).await;

        assert_eq!(status, StatusCode::OK);
        assert!(!allowed(&body));
        assert_eq!(body["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert!(body.to_string().contains("must have at least one owner"));
    }

    /// Story: Deleting an owner is fine once another owner exists
    #[tokio::test]
    async fn story_owner_delete_allowed_with_second_owner() {
        let alice = membership("alice", vec![owner_role()]);
        let bob = membership("bob", vec![owner_role()]);
        let body = review("DELETE", "organizationmemberships", None, Some(&alice));

        let (_, body) = send(app(vec![alice.clone(), bob]), MEMBERSHIP_PATH, body).await;

        assert!(allowed(&body));
    }

    /// Story: A create with a duplicated role is rejected
    #[tokio::test]
    async fn story_duplicate_role_create_denied() {
        let viewer = RoleReference::new("viewer", Some("organization-acme"));
        let carol = membership("carol", vec![viewer.clone(), viewer]);
        let body = review("CREATE", "organizationmemberships", Some(&carol), None);

        let (_, body) = send(app(vec![]), MEMBERSHIP_PATH, body).await;

        assert!(!allowed(&body));
        assert!(body.to_string().contains("duplicate role reference detected"));
    }

    // =========================================================================
    // DocumentRevision Stories
    // =========================================================================

    /// Story: The version gate runs behind the webhook
    #[tokio::test]
    async fn story_revision_version_gate_over_http() {
        let newer = revision("v1.0.1");
        let body = review("CREATE", "documentrevisions", Some(&newer), None);
        let (_, body) = send(app(vec![]), REVISION_PATH, body).await;
        assert!(allowed(&body));

        let older = revision("v0.9.0");
        let body = review("CREATE", "documentrevisions", Some(&older), None);
        let (_, body) = send(app(vec![]), REVISION_PATH, body).await;
        assert!(!allowed(&body));
        assert!(body
            .to_string()
            .contains("not higher than the latest referenced revision version"));
    }

    /// Story: Revisions cannot be deleted through the API
    #[tokio::test]
    async fn story_revision_delete_denied() {
        let rev = revision("v1.0.0");
        let body = review("DELETE", "documentrevisions", None, Some(&rev));

        let (_, body) = send(app(vec![]), REVISION_PATH, body).await;

        assert!(!allowed(&body));
        assert!(body.to_string().contains("delete is not supported"));
    }

    // =========================================================================
    // Malformed Requests
    // =========================================================================

    /// Story: A review without a request is a client error
    #[tokio::test]
    async fn story_review_without_request_is_bad_request() {
        let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});

        let (status, body) = send(app(vec![]), REVISION_PATH, body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid admission review"));
    }

    /// Story: A delete without the old object is a client error
    #[tokio::test]
    async fn story_delete_without_old_object_is_bad_request() {
        let body = review::<OrganizationMembership>("DELETE", "organizationmemberships", None, None);

        let (status, _) = send(app(vec![]), MEMBERSHIP_PATH, body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_responds() {
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = app(vec![]).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
