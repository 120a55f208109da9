//! # Ownership Tracker
//!
//! Maps a change on any resource to reconcile requests for the APIManager that (directly or
//! through one known intermediate) owns it.
//!
//! The walk is a breadth-first search over owner references with an explicit depth bound.
//! Only an enumerated set of pass-through kinds is ever expanded, so the number of lookups
//! per event is bounded by the size of that set.

use crate::crd::APIManager;
use crate::store::{split_api_version, InMemoryStore};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube_runtime::reflector::{ObjectRef, Store};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// An intermediate owner kind the tracker may look through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassThrough {
    pub group: String,
    pub kind: String,
    /// Restrict to one named object of the kind
    pub name: Option<String>,
}

impl PassThrough {
    pub fn named(group: &str, kind: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            name: Some(name.to_string()),
        }
    }

    fn matches(&self, group: &str, reference: &OwnerReference) -> bool {
        self.group == group
            && self.kind == reference.kind
            && self.name.as_ref().is_none_or(|n| *n == reference.name)
    }
}

/// Synchronous owner lookup, usable from watch mappers
pub trait OwnerLookup {
    fn owner_references(
        &self,
        group: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Option<Vec<OwnerReference>>;
}

impl OwnerLookup for Store<Deployment> {
    fn owner_references(
        &self,
        group: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Option<Vec<OwnerReference>> {
        if group != "apps" || kind != "Deployment" {
            return None;
        }
        self.get(&ObjectRef::new(name).within(namespace))
            .and_then(|deployment| deployment.metadata.owner_references.clone())
    }
}

impl OwnerLookup for InMemoryStore {
    fn owner_references(
        &self,
        group: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Option<Vec<OwnerReference>> {
        self.find(group, kind, namespace, name)
            .and_then(|obj| obj.metadata.owner_references)
    }
}

/// Bounded owner-reference walk toward the managed resource
#[derive(Debug, Clone)]
pub struct OwnershipTracker {
    managed_group: String,
    managed_kind: String,
    pass_through: Vec<PassThrough>,
    max_depth: usize,
}

impl OwnershipTracker {
    pub fn new(managed_group: &str, managed_kind: &str) -> Self {
        Self {
            managed_group: managed_group.to_string(),
            managed_kind: managed_kind.to_string(),
            pass_through: Vec::new(),
            max_depth: 1,
        }
    }

    /// Tracker for APIManager, looking through the integration worker deployment
    pub fn for_apimanager() -> Self {
        Self::new(crate::constants::API_GROUP, crate::constants::APIMANAGER_KIND).with_pass_through(
            PassThrough::named("apps", "Deployment", crate::constants::ZYNC_QUE_DEPLOYMENT),
        )
    }

    #[must_use]
    pub fn with_pass_through(mut self, pass_through: PassThrough) -> Self {
        self.pass_through.push(pass_through);
        self
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Reconcile requests for the changed object; empty when nothing managed owns it
    pub fn requests_for(
        &self,
        meta: &ObjectMeta,
        lookup: &dyn OwnerLookup,
    ) -> Vec<ObjectRef<APIManager>> {
        let Some(namespace) = meta.namespace.as_deref() else {
            return Vec::new();
        };
        let mut requests: Vec<ObjectRef<APIManager>> = Vec::new();
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let mut frontier: VecDeque<(Vec<OwnerReference>, usize)> = VecDeque::new();
        frontier.push_back((meta.owner_references.clone().unwrap_or_default(), 0));

        while let Some((references, depth)) = frontier.pop_front() {
            for reference in references {
                let (group, _) = split_api_version(&reference.api_version);
                if group == self.managed_group && reference.kind == self.managed_kind {
                    let request = ObjectRef::new(&reference.name).within(namespace);
                    if !requests.contains(&request) {
                        requests.push(request);
                    }
                    continue;
                }
                if depth >= self.max_depth
                    || !self.pass_through.iter().any(|p| p.matches(group, &reference))
                    || !visited.insert((reference.kind.clone(), reference.name.clone()))
                {
                    continue;
                }
                match lookup.owner_references(group, &reference.kind, namespace, &reference.name) {
                    Some(parents) => frontier.push_back((parents, depth + 1)),
                    None => debug!(
                        "Pass-through owner {} {}/{} not found",
                        reference.kind, namespace, reference.name
                    ),
                }
            }
        }
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::to_dynamic;

    fn owner(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn meta(owners: Vec<OwnerReference>) -> ObjectMeta {
        ObjectMeta {
            name: Some("child".to_string()),
            namespace: Some("api".to_string()),
            owner_references: Some(owners),
            ..ObjectMeta::default()
        }
    }

    fn deployment(name: &str, owners: Vec<OwnerReference>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("api".to_string()),
                owner_references: Some(owners),
                ..ObjectMeta::default()
            },
            ..Deployment::default()
        }
    }

    #[test]
    fn test_direct_owner_yields_one_request() {
        let store = InMemoryStore::new();
        let tracker = OwnershipTracker::for_apimanager();
        let requests = tracker.requests_for(
            &meta(vec![owner("apps.apimanager.dev/v1alpha1", "APIManager", "prod")]),
            &store,
        );
        assert_eq!(requests, vec![ObjectRef::new("prod").within("api")]);
    }

    #[test]
    fn test_pass_through_deployment_is_followed_once() {
        let store = InMemoryStore::new();
        store
            .seed(
                to_dynamic(&deployment(
                    "zync-que",
                    vec![owner("apps.apimanager.dev/v1alpha1", "APIManager", "prod")],
                ))
                .unwrap(),
            )
            .unwrap();
        let tracker = OwnershipTracker::for_apimanager();
        let requests = tracker.requests_for(&meta(vec![owner("apps/v1", "Deployment", "zync-que")]), &store);
        assert_eq!(requests, vec![ObjectRef::new("prod").within("api")]);
    }

    #[test]
    fn test_unlisted_intermediate_is_ignored() {
        let store = InMemoryStore::new();
        store
            .seed(
                to_dynamic(&deployment(
                    "backend-worker",
                    vec![owner("apps.apimanager.dev/v1alpha1", "APIManager", "prod")],
                ))
                .unwrap(),
            )
            .unwrap();
        let tracker = OwnershipTracker::for_apimanager();
        let requests =
            tracker.requests_for(&meta(vec![owner("apps/v1", "Deployment", "backend-worker")]), &store);
        assert!(requests.is_empty());
    }

    #[test]
    fn test_depth_bound_stops_second_hop() {
        let store = InMemoryStore::new();
        // zync-que owned by another zync-que-like hop that is itself owned by the APIManager
        store
            .seed(
                to_dynamic(&deployment(
                    "zync-que",
                    vec![owner("apps/v1", "Deployment", "zync-que-parent")],
                ))
                .unwrap(),
            )
            .unwrap();
        store
            .seed(
                to_dynamic(&deployment(
                    "zync-que-parent",
                    vec![owner("apps.apimanager.dev/v1alpha1", "APIManager", "prod")],
                ))
                .unwrap(),
            )
            .unwrap();
        let tracker = OwnershipTracker::new("apps.apimanager.dev", "APIManager")
            .with_pass_through(PassThrough {
                group: "apps".to_string(),
                kind: "Deployment".to_string(),
                name: None,
            });
        let child = meta(vec![owner("apps/v1", "Deployment", "zync-que")]);
        assert!(tracker.requests_for(&child, &store).is_empty());

        let deeper = tracker.with_max_depth(2);
        assert_eq!(
            deeper.requests_for(&child, &store),
            vec![ObjectRef::new("prod").within("api")]
        );
    }

    #[test]
    fn test_foreign_group_is_discarded() {
        let store = InMemoryStore::new();
        let tracker = OwnershipTracker::for_apimanager();
        let requests = tracker.requests_for(
            &meta(vec![owner("apps.other.io/v1", "APIManager", "prod")]),
            &store,
        );
        assert!(requests.is_empty());
    }
}
