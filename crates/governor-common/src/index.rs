//! Secondary indexes over reflector stores
//!
//! Controllers map a change on one kind to the primary objects that depend on
//! it ("which memberships reference this user?"). Each lookup goes through a
//! typed [`IndexKey`] so the key format is decided in exactly one place.

use std::fmt;
use std::sync::Arc;

use kube::runtime::reflector::Store;
use kube::ResourceExt;

use crate::crd::{DocumentRevision, OrganizationMembership};

/// Key of a secondary index entry
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// Memberships whose `spec.userRef.name` equals the user
    MembershipByUser(String),
    /// Memberships whose `spec.organizationRef.name` equals the organization
    MembershipByOrganization(String),
    /// Revisions whose `spec.documentRef` points at the document
    RevisionByDocument {
        /// Document name
        name: String,
        /// Document namespace
        namespace: String,
    },
}

impl IndexKey {
    /// Render the key to the string stored in the index
    pub fn render(&self) -> String {
        match self {
            Self::MembershipByUser(user) => format!("membership-by-user:{user}"),
            Self::MembershipByOrganization(org) => format!("membership-by-organization:{org}"),
            Self::RevisionByDocument { name, namespace } => {
                format!("revision-by-document:{name}|{namespace}")
            }
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Keys a membership is indexed under
pub fn membership_keys(membership: &OrganizationMembership) -> Vec<IndexKey> {
    let mut keys = Vec::with_capacity(2);
    if !membership.spec.user_ref.name.is_empty() {
        keys.push(IndexKey::MembershipByUser(
            membership.spec.user_ref.name.clone(),
        ));
    }
    if !membership.spec.organization_ref.name.is_empty() {
        keys.push(IndexKey::MembershipByOrganization(
            membership.spec.organization_ref.name.clone(),
        ));
    }
    keys
}

/// Keys a document revision is indexed under
pub fn revision_keys(revision: &DocumentRevision) -> Vec<IndexKey> {
    let doc = &revision.spec.document_ref;
    if doc.name.is_empty() {
        return Vec::new();
    }
    let namespace = if doc.namespace.is_empty() {
        revision.namespace().unwrap_or_default()
    } else {
        doc.namespace.clone()
    };
    vec![IndexKey::RevisionByDocument {
        name: doc.name.clone(),
        namespace,
    }]
}

/// A secondary index evaluated over a reflector store.
///
/// The store is kept current by its reflector; the index re-derives keys on
/// every lookup so it never drifts from the cached objects.
pub struct StoreIndex<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    extract: fn(&K) -> Vec<IndexKey>,
}

impl<K> Clone for StoreIndex<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            extract: self.extract,
        }
    }
}

impl<K> StoreIndex<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
{
    /// Register an index over `store` using `extract` to derive keys
    pub fn new(store: Store<K>, extract: fn(&K) -> Vec<IndexKey>) -> Self {
        Self { store, extract }
    }

    /// All cached objects indexed under `key`
    pub fn lookup(&self, key: &IndexKey) -> Vec<Arc<K>> {
        let wanted = key.render();
        self.store
            .state()
            .into_iter()
            .filter(|obj| (self.extract)(obj).iter().any(|k| k.render() == wanted))
            .collect()
    }

    /// Whether the backing reflector has completed its initial list
    pub async fn wait_until_ready(&self) -> bool {
        self.store.wait_until_ready().await.is_ok()
    }
}

/// Index of memberships by user and organization
pub type MembershipIndex = StoreIndex<OrganizationMembership>;

/// Index of revisions by document
pub type RevisionIndex = StoreIndex<DocumentRevision>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        DocumentReference, DocumentRevisionContent, DocumentRevisionSpec, MemberReference,
        OrganizationMembershipSpec, OrganizationReference,
    };
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher::Event;

    fn membership(name: &str, user: &str, org: &str) -> OrganizationMembership {
        let mut m = OrganizationMembership::new(
            name,
            OrganizationMembershipSpec {
                organization_ref: OrganizationReference { name: org.into() },
                user_ref: MemberReference { name: user.into() },
                roles: vec![],
            },
        );
        m.metadata.namespace = Some(format!("organization-{org}"));
        m
    }

    fn revision(name: &str, doc: &str, doc_ns: &str) -> DocumentRevision {
        let mut r = DocumentRevision::new(
            name,
            DocumentRevisionSpec {
                document_ref: DocumentReference {
                    name: doc.into(),
                    namespace: doc_ns.into(),
                },
                version: "v1.0.0".into(),
                content: DocumentRevisionContent::default(),
                effective_date: chrono::Utc::now(),
                changes_summary: String::new(),
            },
        );
        r.metadata.namespace = Some("docs".into());
        r
    }

    fn store_of<K>(objects: Vec<K>) -> Store<K>
    where
        K: kube::Resource<DynamicType = ()> + Clone + 'static,
    {
        let mut writer = Writer::<K>::default();
        let store = writer.as_reader();
        writer.apply_watcher_event(&Event::Init);
        for obj in objects {
            writer.apply_watcher_event(&Event::InitApply(obj));
        }
        writer.apply_watcher_event(&Event::InitDone);
        store
    }

    #[test]
    fn keys_render_distinctly() {
        let user = IndexKey::MembershipByUser("acme".into());
        let org = IndexKey::MembershipByOrganization("acme".into());
        assert_ne!(user.render(), org.render());
        assert_eq!(
            IndexKey::RevisionByDocument {
                name: "tos".into(),
                namespace: "docs".into()
            }
            .render(),
            "revision-by-document:tos|docs"
        );
    }

    #[test]
    fn membership_index_finds_by_user_and_organization() {
        let index = StoreIndex::new(
            store_of(vec![
                membership("alice", "alice", "acme"),
                membership("bob", "bob", "acme"),
                membership("alice-globex", "alice", "globex"),
            ]),
            membership_keys,
        );

        let by_user = index.lookup(&IndexKey::MembershipByUser("alice".into()));
        assert_eq!(by_user.len(), 2);

        let by_org = index.lookup(&IndexKey::MembershipByOrganization("acme".into()));
        let mut names: Vec<_> = by_org.iter().map(|m| m.name_any()).collect();
        names.sort();
        assert_eq!(names, vec!["alice", "bob"]);

        assert!(index
            .lookup(&IndexKey::MembershipByUser("carol".into()))
            .is_empty());
    }

    #[test]
    fn revision_index_defaults_document_namespace() {
        let index = StoreIndex::new(
            store_of(vec![revision("tos-v1", "tos", ""), revision("pp-v1", "pp", "legal")]),
            revision_keys,
        );

        let tos = index.lookup(&IndexKey::RevisionByDocument {
            name: "tos".into(),
            namespace: "docs".into(),
        });
        assert_eq!(tos.len(), 1);

        let pp = index.lookup(&IndexKey::RevisionByDocument {
            name: "pp".into(),
            namespace: "legal".into(),
        });
        assert_eq!(pp.len(), 1);
    }

    #[tokio::test]
    async fn index_is_ready_only_after_initial_list() {
        let (store, mut writer) = kube::runtime::reflector::store::<OrganizationMembership>();
        let index = StoreIndex::new(store, membership_keys);

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            index.wait_until_ready(),
        )
        .await;
        assert!(pending.is_err(), "unsynced index must not report ready");

        writer.apply_watcher_event(&Event::Init);
        writer.apply_watcher_event(&Event::InitApply(membership("alice", "alice", "acme")));
        writer.apply_watcher_event(&Event::InitDone);
        assert!(index.wait_until_ready().await);
        assert_eq!(
            index
                .lookup(&IndexKey::MembershipByOrganization("acme".into()))
                .len(),
            1
        );
    }

    #[test]
    fn empty_references_are_not_indexed() {
        let m = membership("orphan", "", "");
        assert!(membership_keys(&m).is_empty());
    }
}
