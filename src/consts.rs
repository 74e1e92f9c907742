use const_format::concatcp;

pub const FUNCTIONS_NAMESPACE_ENV_VAR: &str = "KUBELESS_FUNCTIONS_NAMESPACE";

pub const CONFIG_NAMESPACE_ENV_VAR: &str = "KUBELESS_NAMESPACE";
pub const CONFIG_DEFAULT_NAMESPACE: &str = "kubeless";

pub const CONFIG_NAME_ENV_VAR: &str = "KUBELESS_CONFIG";
pub const CONFIG_DEFAULT_NAME: &str = "kubeless-config";

pub const API_TIMEOUT_ENV_VAR: &str = "KUBELESS_API_TIMEOUT_SECS";
pub const API_DEFAULT_TIMEOUT_SECS: u64 = 30;

pub const MAX_RETRIES_ENV_VAR: &str = "KUBELESS_MAX_RETRIES";
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const BACKOFF_BASE_ENV_VAR: &str = "KUBELESS_BACKOFF_BASE_MS";
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5;

pub const BACKOFF_MAX_ENV_VAR: &str = "KUBELESS_BACKOFF_MAX_SECS";
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 1000;

pub const SERVICE_MONITOR_ENV_VAR: &str = "KUBELESS_ENABLE_SERVICE_MONITOR";

/// Keys of the controller config map.
pub const RUNTIME_IMAGES_KEY: &str = "runtime-images";
pub const DEPLOYMENT_DEFAULTS_KEY: &str = "deployment";

pub const FIELD_MANAGER: &str = "kubeless-controller";

pub const FUNCTION_LABEL: &str = "function";
pub const FUNCTION_PORT: i32 = 8080;
pub const FUNCTION_PORT_NAME: &str = "http-function-port";
pub const DEFAULT_FUNCTION_TIMEOUT: &str = "180";

pub const CRON_JOB_PREFIX: &str = "trigger-";
pub const CRON_JOB_PLURAL: &str = "cronjobs";
pub const CRON_JOB_IMAGE: &str = "busybox:1.36";

pub const SERVICE_MONITOR_GROUP: &str = "monitoring.coreos.com";
pub const SERVICE_MONITOR_VERSION: &str = "v1";
pub const SERVICE_MONITOR_API_VERSION: &str =
    concatcp!(SERVICE_MONITOR_GROUP, "/", SERVICE_MONITOR_VERSION);
pub const SERVICE_MONITOR_KIND: &str = "ServiceMonitor";
pub const SERVICE_MONITOR_PLURAL: &str = "servicemonitors";

pub const PREPARE_IMAGE: &str = "busybox:1.36";
pub const FUNCTION_VOLUME_PATH: &str = "/kubeless";
pub const SOURCE_VOLUME_PATH: &str = "/src";
