use super::keys::InvalidKey;
use crate::crds::defs::BuildError;
use crate::runtime::RuntimeError;
use kube::Error as KubeError;
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum ApiError {
    #[error("Resource not found")]
    NotFound,
    #[error("Kubernetes error: {0}")]
    Kube(#[source] KubeError),
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to build resource: {0}")]
    Build(
        #[from]
        #[source]
        BuildError,
    ),
    #[error("Failed to serialize resource: {0}")]
    Serialization(
        #[from]
        #[source]
        serde_json::Error,
    ),
    #[error("Resource {0:?} is not served by the cluster")]
    NotDiscovered(String),
}

impl From<KubeError> for ApiError {
    fn from(error: KubeError) -> Self {
        match error {
            KubeError::Api(ref response) if response.code == 404 => ApiError::NotFound,
            error => ApiError::Kube(error),
        }
    }
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound)
    }
}

/// Treats a missing object as success.
pub fn ignore_not_found(result: Result<(), ApiError>) -> Result<(), ApiError> {
    match result {
        Err(error) if error.is_not_found() => Ok(()),
        result => result,
    }
}

#[derive(ThisError, Debug)]
pub enum EnsureError {
    #[error("Failed to get owner reference")]
    OwnerReference,
    #[error("Failed to load deployment defaults: {0}")]
    DeploymentDefaults(#[source] ApiError),
    #[error("Failed to parse deployment defaults: {0}")]
    ConfigParse(#[source] serde_yaml::Error),
    #[error("Failed to merge deployment defaults: {0}")]
    ConfigMerge(#[source] serde_json::Error),
    #[error("Failed to resolve runtime: {0}")]
    Runtime(#[source] RuntimeError),
    #[error("Config map error: {0}")]
    ConfigMap(#[source] ApiError),
    #[error("Service error: {0}")]
    Service(#[source] ApiError),
    #[error("Deployment error: {0}")]
    Deployment(#[source] ApiError),
    #[error("Failed to discover cron job group version: {0}")]
    Discovery(#[source] ApiError),
    #[error("Cron job error: {0}")]
    CronJob(#[source] ApiError),
    #[error("Service monitor error: {0}")]
    ServiceMonitor(#[source] ApiError),
    #[error("Autoscaler error: {0}")]
    Autoscaler(#[source] ApiError),
    #[error("Failed to delete autoscaler: {0}")]
    DeleteAutoscaler(#[source] DeleteError),
}

#[derive(ThisError, Debug)]
pub enum DeleteError {
    #[error("Failed to delete cron job: {0}")]
    CronJob(#[source] ApiError),
    #[error("Failed to delete deployment: {0}")]
    Deployment(#[source] ApiError),
    #[error("Failed to delete service: {0}")]
    Service(#[source] ApiError),
    #[error("Failed to delete config map: {0}")]
    ConfigMap(#[source] ApiError),
    #[error("Failed to delete autoscaler: {0}")]
    Autoscaler(#[source] ApiError),
    #[error("Failed to delete service monitor: {0}")]
    ServiceMonitor(#[source] ApiError),
}

#[derive(ThisError, Debug)]
pub enum ReconcileError {
    #[error("{0}")]
    InvalidKey(
        #[from]
        #[source]
        InvalidKey,
    ),
    #[error("Failed to delete resources: {0}")]
    Delete(#[source] DeleteError),
    #[error("Failed to ensure resources: {0}")]
    Ensure(#[source] EnsureError),
}

impl ReconcileError {
    /// A malformed key can never succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::InvalidKey(_))
    }
}
