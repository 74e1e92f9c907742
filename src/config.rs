use crate::consts::{
    API_DEFAULT_TIMEOUT_SECS, CONFIG_DEFAULT_NAME, CONFIG_DEFAULT_NAMESPACE,
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_MAX_RETRIES,
};
use crate::controller::queue::Backoff;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// `None` watches Functions in every namespace.
    pub functions_namespace: Option<String>,
    pub config_namespace: String,
    pub config_name: String,
    pub api_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub enable_service_monitor: bool,
}

impl ControllerConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            functions_namespace: None,
            config_namespace: String::from(CONFIG_DEFAULT_NAMESPACE),
            config_name: String::from(CONFIG_DEFAULT_NAME),
            api_timeout: Duration::from_secs(API_DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            enable_service_monitor: false,
        }
    }
}
