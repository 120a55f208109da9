//! # Requirements
//!
//! The requirements snapshot published by the subscription controller and the version
//! arithmetic used to evaluate it.
//!
//! The snapshot is a flat ConfigMap in the operator namespace. Its `resourceVersion` is the
//! token each APIManager records once it has evaluated the snapshot successfully.

use crate::constants::REQUIREMENTS_CONFIG_MAP;
use crate::store::{get_as, ConvergenceClient, StoreError};
use k8s_openapi::api::core::v1::ConfigMap;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*v?(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("version pattern is valid")
});

/// Component versions required by the operator version being installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementsSnapshot {
    pub values: BTreeMap<String, String>,
    /// `metadata.resourceVersion` of the ConfigMap
    pub token: String,
}

impl RequirementsSnapshot {
    /// Read the snapshot; `None` until it has been published
    pub async fn load(
        client: &dyn ConvergenceClient,
        operator_namespace: &str,
    ) -> Result<Option<Self>, StoreError> {
        let config_map: Option<ConfigMap> =
            get_as(client, operator_namespace, REQUIREMENTS_CONFIG_MAP).await?;
        Ok(config_map.as_ref().and_then(Self::from_config_map))
    }

    pub fn from_config_map(config_map: &ConfigMap) -> Option<Self> {
        let token = config_map.metadata.resource_version.clone()?;
        Some(Self {
            values: config_map.data.clone().unwrap_or_default(),
            token,
        })
    }

    /// A requirement value; empty values count as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// `major.minor.patch`; missing parts read as zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn parse(value: &str) -> Option<Self> {
        let captures = VERSION_PATTERN.captures(value)?;
        let part = |i: usize| {
            captures
                .get(i)
                .map_or(Some(0), |m| m.as_str().parse::<u64>().ok())
        };
        Some(Self {
            major: part(1)?,
            minor: part(2)?,
            patch: part(3)?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Whether `current` meets `required` (current >= required); `None` if either is unparsable
pub fn satisfies(required: &str, current: &str) -> Option<bool> {
    let required = Version::parse(required)?;
    let current = Version::parse(current)?;
    Some(current.cmp(&required) != Ordering::Less)
}

/// True when moving from `installed` to `running` skips at least one minor release
pub fn is_multi_minor_hop(installed: &str, running: &str) -> Option<bool> {
    let installed = Version::parse(installed)?;
    let running = Version::parse(running)?;
    Some(if running.major == installed.major {
        running.minor.saturating_sub(installed.minor) > 1
    } else {
        running.major > installed.major
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    #[test]
    fn test_version_parse_tolerates_partial_and_suffixes() {
        assert_eq!(
            Version::parse("8.0.32-log"),
            Some(Version {
                major: 8,
                minor: 0,
                patch: 32
            })
        );
        assert_eq!(Version::parse("v13").map(|v| v.to_string()), Some("13.0.0".to_string()));
        assert_eq!(Version::parse("latest"), None);
    }

    #[test]
    fn test_satisfies() {
        assert_eq!(satisfies("8.0.0", "8.0.32"), Some(true));
        assert_eq!(satisfies("8.0.0", "8.0.0"), Some(true));
        assert_eq!(satisfies("6.2.0", "5.0.7"), Some(false));
        assert_eq!(satisfies("6.2.0", "unknown"), None);
    }

    #[test]
    fn test_multi_minor_hop() {
        assert_eq!(is_multi_minor_hop("2.14.1", "2.15.0"), Some(false));
        assert_eq!(is_multi_minor_hop("2.13.0", "2.15.0"), Some(true));
        assert_eq!(is_multi_minor_hop("2.15.0", "2.15.0"), Some(false));
        assert_eq!(is_multi_minor_hop("1.9.0", "2.0.0"), Some(true));
    }

    #[test]
    fn test_multi_minor_hop_with_huge_installed_minor() {
        let installed = format!("2.{}.0", u64::MAX);
        assert_eq!(is_multi_minor_hop(&installed, "2.0.0"), Some(false));
        assert_eq!(is_multi_minor_hop("2.0.0", &installed), Some(true));
    }

    #[test]
    fn test_snapshot_uses_resource_version_as_token() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(REQUIREMENTS_CONFIG_MAP.to_string()),
                resource_version: Some("42".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                [
                    ("mysql_requirements".to_string(), "8.0.0".to_string()),
                    ("postgres_requirements".to_string(), " ".to_string()),
                ]
                .into(),
            ),
            ..ConfigMap::default()
        };
        let snapshot = RequirementsSnapshot::from_config_map(&cm).unwrap();
        assert_eq!(snapshot.token, "42");
        assert_eq!(snapshot.get("mysql_requirements"), Some("8.0.0"));
        assert_eq!(snapshot.get("postgres_requirements"), None);
    }
}
