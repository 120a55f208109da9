//! # Ensure
//!
//! Create-or-mutate-or-delete primitive used by every step that owns resources.

use super::{ConvergenceClient, ObjectKey, PropagationPolicy, StoreError};
use kube::core::DynamicObject;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// How an existing object is brought toward its desired form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutator {
    /// Never touch an existing object (claims, jobs, secrets holding generated values)
    CreateOnly,
    /// Merge labels, annotations and owner references, and overlay the named top-level fields
    Merge(&'static [&'static str]),
}

impl Mutator {
    pub const MERGE_SPEC: Self = Self::Merge(&["spec"]);
    pub const MERGE_DATA: Self = Self::Merge(&["data", "stringData"]);

    /// Apply the mutation to `existing`; returns true when it changed
    pub fn apply(self, existing: &mut DynamicObject, desired: &DynamicObject) -> bool {
        let Self::Merge(fields) = self else {
            return false;
        };

        let mut changed = merge_map(&mut existing.metadata.labels, desired.metadata.labels.as_ref());
        changed |= merge_map(
            &mut existing.metadata.annotations,
            desired.metadata.annotations.as_ref(),
        );

        for owner in desired.metadata.owner_references.iter().flatten() {
            let refs = existing.metadata.owner_references.get_or_insert_with(Vec::new);
            if !refs.iter().any(|r| r.uid == owner.uid) {
                refs.push(owner.clone());
                changed = true;
            }
        }

        let serde_json::Value::Object(map) = &mut existing.data else {
            return changed;
        };
        for field in fields {
            let Some(wanted) = desired.data.get(*field) else {
                continue;
            };
            match map.get_mut(*field) {
                Some(current) => changed |= overlay(current, wanted),
                None => {
                    map.insert((*field).to_string(), wanted.clone());
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Overlay `desired` onto `current`, keeping fields only the server sets
///
/// Objects merge key by key. Arrays of equal length merge element-wise; otherwise they are
/// replaced. Returns true when `current` changed.
fn overlay(current: &mut serde_json::Value, desired: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (current, desired) {
        (Value::Object(current), Value::Object(desired)) => {
            let mut changed = false;
            for (key, value) in desired {
                match current.get_mut(key) {
                    Some(existing) => changed |= overlay(existing, value),
                    None => {
                        current.insert(key.clone(), value.clone());
                        changed = true;
                    }
                }
            }
            changed
        }
        (Value::Array(current), Value::Array(desired)) if current.len() == desired.len() => current
            .iter_mut()
            .zip(desired)
            .fold(false, |changed, (c, d)| overlay(c, d) | changed),
        (current, desired) => {
            if current == desired {
                false
            } else {
                *current = desired.clone();
                true
            }
        }
    }
}

fn merge_map(
    existing: &mut Option<BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> bool {
    let mut changed = false;
    for (k, v) in desired.into_iter().flatten() {
        let target = existing.get_or_insert_with(BTreeMap::new);
        if target.get(k) != Some(v) {
            target.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Desired state of one owned object
#[derive(Debug, Clone)]
pub enum Desired {
    Present {
        object: DynamicObject,
        mutator: Mutator,
    },
    /// The object must not exist
    Absent {
        key: ObjectKey,
        policy: PropagationPolicy,
    },
}

impl Desired {
    pub fn create_only(object: DynamicObject) -> Self {
        Self::Present {
            object,
            mutator: Mutator::CreateOnly,
        }
    }

    pub fn merged(object: DynamicObject, mutator: Mutator) -> Self {
        Self::Present { object, mutator }
    }
}

/// Result of an ensure call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Unchanged,
    Deleted,
    Absent,
}

impl EnsureOutcome {
    /// True when the call changed the store
    pub fn wrote(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }
}

/// Converge one object toward its desired state
pub async fn ensure(
    client: &dyn ConvergenceClient,
    desired: Desired,
) -> Result<EnsureOutcome, StoreError> {
    match desired {
        Desired::Present { object, mutator } => {
            let key = ObjectKey::for_object(&object)?;
            match client.get(&key).await? {
                None => match client.create(&object).await {
                    Ok(_) => {
                        info!("✅ Created {key}");
                        Ok(EnsureOutcome::Created)
                    }
                    // Lost a race with a previous attempt; the object is there now
                    Err(StoreError::AlreadyExists(_)) => {
                        debug!("{key} already exists");
                        Ok(EnsureOutcome::Unchanged)
                    }
                    Err(e) => Err(e),
                },
                Some(mut existing) => {
                    if mutator.apply(&mut existing, &object) {
                        client.update(&existing).await?;
                        info!("🔄 Updated {key}");
                        Ok(EnsureOutcome::Updated)
                    } else {
                        Ok(EnsureOutcome::Unchanged)
                    }
                }
            }
        }
        Desired::Absent { key, policy } => match client.get(&key).await? {
            Some(_) => {
                client.delete(&key, policy).await?;
                info!("🗑️ Deleted {key}");
                Ok(EnsureOutcome::Deleted)
            }
            None => Ok(EnsureOutcome::Absent),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{to_dynamic, InMemoryStore, WriteOp};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(value: &str) -> DynamicObject {
        to_dynamic(&ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("api".to_string()),
                ..ObjectMeta::default()
            },
            data: Some([("key".to_string(), value.to_string())].into()),
            ..ConfigMap::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_only_never_overwrites() {
        let store = InMemoryStore::new();
        let first = ensure(&store, Desired::create_only(config_map("one")))
            .await
            .unwrap();
        let second = ensure(&store, Desired::create_only(config_map("two")))
            .await
            .unwrap();
        assert_eq!(first, EnsureOutcome::Created);
        assert_eq!(second, EnsureOutcome::Unchanged);
        let cm: ConfigMap = store.typed("api", "settings").unwrap();
        assert_eq!(cm.data.unwrap()["key"], "one");
    }

    #[tokio::test]
    async fn test_merge_updates_only_on_difference() {
        let store = InMemoryStore::new();
        ensure(&store, Desired::merged(config_map("one"), Mutator::MERGE_DATA))
            .await
            .unwrap();
        let same = ensure(&store, Desired::merged(config_map("one"), Mutator::MERGE_DATA))
            .await
            .unwrap();
        let changed = ensure(&store, Desired::merged(config_map("two"), Mutator::MERGE_DATA))
            .await
            .unwrap();
        assert_eq!(same, EnsureOutcome::Unchanged);
        assert_eq!(changed, EnsureOutcome::Updated);
        assert_eq!(
            store.writes(),
            vec![
                WriteOp::Create("ConfigMap api/settings".to_string()),
                WriteOp::Update("ConfigMap api/settings".to_string()),
            ]
        );
    }

    #[test]
    fn test_overlay_keeps_server_populated_fields() {
        let mut existing = config_map("one");
        existing.data["data"]["defaulted"] = serde_json::json!("by-server");
        assert!(!Mutator::MERGE_DATA.apply(&mut existing, &config_map("one")));
        assert!(Mutator::MERGE_DATA.apply(&mut existing, &config_map("two")));
        assert_eq!(existing.data["data"]["defaulted"], "by-server");
        assert_eq!(existing.data["data"]["key"], "two");
    }

    #[tokio::test]
    async fn test_absent_deletes_existing() {
        let store = InMemoryStore::new();
        ensure(&store, Desired::create_only(config_map("one")))
            .await
            .unwrap();
        let key = ObjectKey::of::<ConfigMap>("api", "settings");
        let outcome = ensure(
            &store,
            Desired::Absent {
                key: key.clone(),
                policy: PropagationPolicy::Background,
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, EnsureOutcome::Deleted);
        assert!(store.snapshot(&key).is_none());
    }
}
