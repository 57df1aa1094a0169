//! Registry of the kinds the governor reads and writes
//!
//! Built once at startup from API discovery and shared across controllers via
//! `Arc<KindRegistry>`. Controllers whose kinds are not installed are skipped
//! instead of crash-looping on watch errors.

use dashmap::DashMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::discovery::{ApiResource, Discovery};
use kube::{Client, CustomResourceExt, Resource};
use tracing::{info, warn};

use crate::crd::{
    AllowanceBucket, Document, DocumentRevision, Organization, OrganizationMembership,
    PolicyBinding, Project, ProjectControlPlane, ResourceClaim, ResourceGrant,
    ResourceRegistration, Role, User,
};

/// Every kind known to the governor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GovernedKind {
    /// resourcemanager Organization
    Organization,
    /// resourcemanager Project
    Project,
    /// resourcemanager ProjectControlPlane
    ProjectControlPlane,
    /// resourcemanager OrganizationMembership
    OrganizationMembership,
    /// iam PolicyBinding
    PolicyBinding,
    /// iam Role
    Role,
    /// iam User
    User,
    /// quota ResourceClaim
    ResourceClaim,
    /// quota ResourceGrant
    ResourceGrant,
    /// quota AllowanceBucket
    AllowanceBucket,
    /// quota ResourceRegistration
    ResourceRegistration,
    /// documentation Document
    Document,
    /// documentation DocumentRevision
    DocumentRevision,
}

/// All GovernedKind variants for iteration
pub const ALL_GOVERNED_KINDS: &[GovernedKind] = &[
    GovernedKind::Organization,
    GovernedKind::Project,
    GovernedKind::ProjectControlPlane,
    GovernedKind::OrganizationMembership,
    GovernedKind::PolicyBinding,
    GovernedKind::Role,
    GovernedKind::User,
    GovernedKind::ResourceClaim,
    GovernedKind::ResourceGrant,
    GovernedKind::AllowanceBucket,
    GovernedKind::ResourceRegistration,
    GovernedKind::Document,
    GovernedKind::DocumentRevision,
];

impl GovernedKind {
    /// Compile-time API resource for the kind
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Organization => ApiResource::erase::<Organization>(&()),
            Self::Project => ApiResource::erase::<Project>(&()),
            Self::ProjectControlPlane => ApiResource::erase::<ProjectControlPlane>(&()),
            Self::OrganizationMembership => ApiResource::erase::<OrganizationMembership>(&()),
            Self::PolicyBinding => ApiResource::erase::<PolicyBinding>(&()),
            Self::Role => ApiResource::erase::<Role>(&()),
            Self::User => ApiResource::erase::<User>(&()),
            Self::ResourceClaim => ApiResource::erase::<ResourceClaim>(&()),
            Self::ResourceGrant => ApiResource::erase::<ResourceGrant>(&()),
            Self::AllowanceBucket => ApiResource::erase::<AllowanceBucket>(&()),
            Self::ResourceRegistration => ApiResource::erase::<ResourceRegistration>(&()),
            Self::Document => ApiResource::erase::<Document>(&()),
            Self::DocumentRevision => ApiResource::erase::<DocumentRevision>(&()),
        }
    }

    /// CustomResourceDefinition for the kind
    pub fn crd(&self) -> CustomResourceDefinition {
        match self {
            Self::Organization => Organization::crd(),
            Self::Project => Project::crd(),
            Self::ProjectControlPlane => ProjectControlPlane::crd(),
            Self::OrganizationMembership => OrganizationMembership::crd(),
            Self::PolicyBinding => PolicyBinding::crd(),
            Self::Role => Role::crd(),
            Self::User => User::crd(),
            Self::ResourceClaim => ResourceClaim::crd(),
            Self::ResourceGrant => ResourceGrant::crd(),
            Self::AllowanceBucket => AllowanceBucket::crd(),
            Self::ResourceRegistration => ResourceRegistration::crd(),
            Self::Document => Document::crd(),
            Self::DocumentRevision => DocumentRevision::crd(),
        }
    }

    /// API group of the kind
    pub fn group(&self) -> String {
        self.api_resource().group
    }

    /// Kind string of the kind
    pub fn kind_str(&self) -> String {
        self.api_resource().kind
    }

    /// Resolve a group/kind pair (e.g. from an admission request)
    pub fn from_group_kind(group: &str, kind: &str) -> Option<Self> {
        ALL_GOVERNED_KINDS.iter().copied().find(|k| {
            let ar = k.api_resource();
            ar.group == group && ar.kind == kind
        })
    }

    /// Resolve the kind of a typed resource
    pub fn of<K: Resource<DynamicType = ()>>() -> Option<Self> {
        Self::from_group_kind(&K::group(&()), &K::kind(&()))
    }
}

/// Cache of discovered API resources for the governed kinds.
///
/// Uses `DashMap` so controllers can resolve kinds concurrently while a lazy
/// re-discovery is filling in a late-installed CRD.
pub struct KindRegistry {
    client: Option<Client>,
    entries: DashMap<GovernedKind, ApiResource>,
}

impl KindRegistry {
    /// Run API discovery once and record every installed governed kind.
    pub async fn discover(client: Client) -> Self {
        let registry = Self {
            client: Some(client),
            entries: DashMap::new(),
        };
        registry.rediscover().await;
        info!(
            discovered = registry.entries.len(),
            total = ALL_GOVERNED_KINDS.len(),
            "kind registry populated via API discovery"
        );
        registry
    }

    /// Registry that trusts every kind to be installed at its compiled version.
    ///
    /// Used when discovery is unavailable and in tests.
    pub fn assume_installed() -> Self {
        let entries = DashMap::new();
        for kind in ALL_GOVERNED_KINDS {
            entries.insert(*kind, kind.api_resource());
        }
        Self {
            client: None,
            entries,
        }
    }

    /// Get the API resource for a kind, re-running discovery on a miss.
    pub async fn resolve(&self, kind: GovernedKind) -> Option<ApiResource> {
        if let Some(ar) = self.entries.get(&kind) {
            return Some(ar.clone());
        }
        info!(
            kind = %kind.kind_str(),
            group = %kind.group(),
            "kind missing at startup, attempting lazy discovery"
        );
        self.rediscover().await;
        self.entries.get(&kind).map(|r| r.clone())
    }

    /// Whether every listed kind was discovered
    pub fn has_all(&self, kinds: &[GovernedKind]) -> bool {
        kinds.iter().all(|k| self.entries.contains_key(k))
    }

    /// Kinds from `kinds` that are not installed
    pub fn missing(&self, kinds: &[GovernedKind]) -> Vec<GovernedKind> {
        kinds
            .iter()
            .filter(|k| !self.entries.contains_key(k))
            .copied()
            .collect()
    }

    async fn rediscover(&self) {
        let Some(client) = &self.client else {
            return;
        };
        let discovery = match Discovery::new(client.clone()).run().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "kind discovery failed");
                return;
            }
        };

        for kind in ALL_GOVERNED_KINDS {
            if self.entries.contains_key(kind) {
                continue;
            }
            let wanted = kind.api_resource();
            let found = discovery
                .groups()
                .filter(|g| g.name() == wanted.group)
                .flat_map(|g| g.resources_by_stability())
                .find(|(ar, _)| ar.kind == wanted.kind)
                .map(|(ar, _)| ar);
            match found {
                Some(ar) => {
                    self.entries.insert(*kind, ar);
                }
                None => warn!(
                    group = %wanted.group,
                    kind = %wanted.kind,
                    "kind not found in API discovery"
                ),
            }
        }
    }
}
