//! # Constants
//!
//! Default values, annotation keys and well-known names shared by the controllers.

/// Field manager used for every write issued by the operator
pub const FIELD_MANAGER: &str = "apimanager-operator";

/// API group of the operator's custom resources
pub const API_GROUP: &str = "apps.apimanager.dev";

/// Kind of the managed resource
pub const APIMANAGER_KIND: &str = "APIManager";

// Annotations written on the managed resource
pub const OPERATOR_VERSION_ANNOTATION: &str = "apps.apimanager.dev/operator-version";
pub const RELEASE_VERSION_ANNOTATION: &str = "apps.apimanager.dev/release-version";
pub const CONFIRMED_REQUIREMENTS_ANNOTATION: &str =
    "apps.apimanager.dev/confirmed-requirements-version";

// Condition types and reasons
pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PREFLIGHTS: &str = "Preflights";
pub const CONDITION_WARNING: &str = "Warning";
pub const CONDITION_UPGRADEABLE: &str = "Upgradeable";

pub const REASON_DEPLOYMENTS_READY: &str = "DeploymentsReady";
pub const REASON_DEPLOYMENTS_NOT_READY: &str = "DeploymentsNotReady";
pub const REASON_ROUTES_NOT_READY: &str = "DefaultRoutesNotReady";
pub const REASON_MISSING_WATCHED_SECRETS: &str = "MissingWatchedSecrets";
pub const REASON_PREFLIGHTS_PASS: &str = "PreflightsPass";
pub const REASON_PREFLIGHTS_FAILED: &str = "PreflightsFailed";
pub const REASON_REQUIREMENTS_PENDING: &str = "RequirementsNotPublished";
pub const REASON_MULTI_MINOR_UPGRADE: &str = "MultiMinorUpgrade";
pub const REASON_APPROVED_UPGRADE: &str = "ApprovedUpgradeScenario";
pub const REASON_NO_UPGRADE_AVAILABLE: &str = "NoUpgradeAvailable";
pub const REASON_UPGRADE_REJECTED: &str = "UpgradeRejected";

// Requirements snapshot
pub const REQUIREMENTS_CONFIG_MAP: &str = "apimanager-operator-requirements";
pub const REQ_PLATFORM_VERSION: &str = "threescale_version_requirements";
pub const REQ_MYSQL_VERSION: &str = "mysql_requirements";
pub const REQ_POSTGRES_VERSION: &str = "postgres_requirements";
pub const REQ_SYSTEM_REDIS_VERSION: &str = "system_redis_requirements";
pub const REQ_BACKEND_REDIS_VERSION: &str = "backend_redis_requirements";

/// CSV annotation keys the requirements publisher copies into the snapshot
pub const CSV_REQUIREMENT_ANNOTATIONS: [(&str, &str); 5] = [
    (REQ_PLATFORM_VERSION, "apps.apimanager.dev/platform-version-requirements"),
    (REQ_MYSQL_VERSION, "apps.apimanager.dev/mysql-requirements"),
    (REQ_POSTGRES_VERSION, "apps.apimanager.dev/postgres-requirements"),
    (REQ_SYSTEM_REDIS_VERSION, "apps.apimanager.dev/system-redis-requirements"),
    (REQ_BACKEND_REDIS_VERSION, "apps.apimanager.dev/backend-redis-requirements"),
];

/// Label prefix selecting the consensus objects of an install plan
pub const OPERATOR_CONDITION_LABEL_PREFIX: &str = "operators.coreos.com";

/// Name of the integration deployment that owns tenant ingresses
pub const ZYNC_QUE_DEPLOYMENT: &str = "zync-que";

// Controller defaults
pub const DEFAULT_JOB_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_PREFLIGHT_RETRY_SECS: u64 = 600;
pub const DEFAULT_GATE_REQUEUE_SECS: u64 = 60;
pub const DEFAULT_INSTALL_PLAN_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_INSTALL_PLAN_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_CONFLICT_REQUEUE_SECS: u64 = 1;
pub const DEFAULT_STATUS_REQUEUE_SECS: u64 = 5;
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;
pub const DEFAULT_BACKUP_JOB_IMAGE: &str = "bitnami/kubectl:1.30";
pub const DEFAULT_RELEASE_VERSION: &str = "2.15.0";

// Server defaults
pub const DEFAULT_METRICS_PORT: u16 = 5000;
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Watcher timeout for controller streams (must stay below the API server's 295s limit)
pub const WATCH_TIMEOUT_SECS: u32 = 290;
