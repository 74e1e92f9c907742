pub mod errors;
mod gc;
pub mod keys;
pub mod queue;
pub mod resources;
pub mod watch;

#[cfg(test)]
mod tests;

use crate::config::ControllerConfig;
use crate::crds::{
    defs::{Function, TriggerType},
    impls::cron_job_name,
};
use crate::runtime::{Langruntimes, RuntimeImage};
use errors::{ignore_not_found, ApiError, DeleteError, EnsureError, ReconcileError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keys::{owner_reference, split_key};
use kube::ResourceExt;
use queue::WorkQueue;
use resources::{FunctionResources, ManagedKind};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace_span, Instrument};
use watch::WatchSource;

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ControllerInner {
    source: Arc<dyn WatchSource>,
    resources: Arc<dyn FunctionResources>,
    runtimes: Langruntimes,
    queue: Arc<WorkQueue>,
    api_timeout: Duration,
    max_retries: u32,
}

impl ControllerInner {
    /// Bounds a platform call by the configured deadline.
    async fn call<T>(
        &self,
        future: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        tokio::time::timeout(self.api_timeout, future)
            .await
            .map_err(|_| ApiError::Timeout(self.api_timeout))?
    }

    async fn process_item(&self, key: &str) -> Result<(), ReconcileError> {
        let (namespace, name) = split_key(key)?;

        match self.source.get_by_key(key)? {
            None => {
                tracing::info!("Function is gone. Deleting resources.");

                self.delete(namespace, name)
                    .instrument(trace_span!("DeleteResources"))
                    .await
                    .map_err(ReconcileError::Delete)
            }
            Some(function) => {
                tracing::info!("Ensuring resources.");

                self.ensure(Function::clone(&function))
                    .instrument(trace_span!("EnsureResources"))
                    .await
                    .map_err(ReconcileError::Ensure)
            }
        }
    }

    /// Applies the retry policy to the outcome of one attempt.
    fn handle_result(&self, key: &str, result: Result<(), ReconcileError>) {
        match result {
            Ok(()) => {
                tracing::info!(%key, "Reconciliation successful.");
                self.queue.forget(key);
            }
            Err(error) if !error.is_retryable() => {
                tracing::error!(%key, %error, "Dropping invalid key.");
                self.queue.forget(key);
            }
            Err(error) => {
                let requeues = self.queue.num_requeues(key);

                if requeues < self.max_retries {
                    tracing::error!(%key, %error, requeues, "Reconciliation failed. Will retry.");
                    self.queue.add_rate_limited(key);
                } else {
                    tracing::error!(%key, %error, requeues, "Reconciliation failed. Giving up.");
                    self.queue.forget(key);
                }
            }
        }
    }

    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = self
            .process_item(&key)
            .instrument(trace_span!("ProcessItem", %key))
            .await;

        self.handle_result(&key, result);
        self.queue.done(&key);

        true
    }

    /// Deletes the object, a missing one counts as deleted.
    async fn delete_object(
        &self,
        kind: ManagedKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        ignore_not_found(self.call(self.resources.delete(kind, namespace, name)).await)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), DeleteError> {
        self.delete_cron_job(namespace, name)
            .instrument(trace_span!("DeleteCronJob"))
            .await
            .map_err(DeleteError::CronJob)?;

        self.delete_object(ManagedKind::Deployment, namespace, name)
            .await
            .map_err(DeleteError::Deployment)?;

        self.delete_object(ManagedKind::Service, namespace, name)
            .await
            .map_err(DeleteError::Service)?;

        self.delete_object(ManagedKind::ConfigMap, namespace, name)
            .await
            .map_err(DeleteError::ConfigMap)?;

        self.delete_autoscaler(namespace, name)
            .instrument(trace_span!("DeleteAutoscaler"))
            .await?;

        tracing::info!("Resources deleted.");

        Ok(())
    }

    /// Removes the trigger cron job under the `group/version` cron jobs are
    /// ensured with. Nothing to remove when the cluster serves no cron jobs.
    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let cron_job = cron_job_name(name);

        let api_version = match self.call(self.resources.cron_job_group_version()).await {
            Ok(api_version) => api_version,
            Err(ApiError::NotDiscovered(_)) => return Ok(()),
            Err(error) => return Err(error),
        };

        let exists = self
            .call(
                self.resources
                    .cron_job_exists(namespace, &cron_job, &api_version),
            )
            .await?;

        if exists {
            ignore_not_found(
                self.call(
                    self.resources
                        .delete_cron_job(namespace, &cron_job, &api_version),
                )
                .await,
            )?;
        }

        Ok(())
    }

    /// Removes the autoscaler and its service monitor, both may be absent.
    async fn delete_autoscaler(&self, namespace: &str, name: &str) -> Result<(), DeleteError> {
        self.delete_object(ManagedKind::Autoscaler, namespace, name)
            .await
            .map_err(DeleteError::Autoscaler)?;

        if self.resources.has_service_monitor_client() {
            self.delete_object(ManagedKind::ServiceMonitor, namespace, name)
                .await
                .map_err(DeleteError::ServiceMonitor)?;
        }

        Ok(())
    }

    async fn ensure(&self, mut function: Function) -> Result<(), EnsureError> {
        function.normalize_labels();

        self.merge_deployment_defaults(&mut function)
            .instrument(trace_span!("MergeDeploymentDefaults"))
            .await?;

        let owner = owner_reference(&function).ok_or(EnsureError::OwnerReference)?;

        let runtime = self
            .runtimes
            .resolve(&function.spec.runtime)
            .map_err(EnsureError::Runtime)?;

        self.ensure_config_map(&function, &owner, &runtime)
            .instrument(trace_span!("EnsureConfigMap"))
            .await
            .map_err(EnsureError::ConfigMap)?;

        self.ensure_service(&function, &owner)
            .instrument(trace_span!("EnsureService"))
            .await
            .map_err(EnsureError::Service)?;

        self.ensure_deployment(&function, &owner, &runtime)
            .instrument(trace_span!("EnsureDeployment"))
            .await
            .map_err(EnsureError::Deployment)?;

        if function.spec.trigger_type == TriggerType::Scheduled {
            self.ensure_cron_job(&function, &owner)
                .instrument(trace_span!("EnsureCronJob"))
                .await?;
        }

        self.ensure_autoscaling(&function, &owner)
            .instrument(trace_span!("EnsureAutoscaling"))
            .await?;

        tracing::info!("Resources ensured.");

        Ok(())
    }

    async fn merge_deployment_defaults(&self, function: &mut Function) -> Result<(), EnsureError> {
        let Some(defaults) = self
            .call(self.resources.deployment_defaults())
            .await
            .map_err(EnsureError::DeploymentDefaults)?
        else {
            return Ok(());
        };

        if defaults.trim().is_empty() {
            return Ok(());
        }

        let defaults: serde_json::Value =
            serde_yaml::from_str(&defaults).map_err(EnsureError::ConfigParse)?;

        function
            .merge_deployment_defaults(&defaults)
            .map_err(EnsureError::ConfigMerge)
    }

    async fn ensure_config_map(
        &self,
        function: &Function,
        owner: &OwnerReference,
        runtime: &RuntimeImage,
    ) -> Result<(), ApiError> {
        let config_map = function.to_config_map(owner, runtime)?;

        self.call(self.resources.ensure_config_map(config_map)).await
    }

    async fn ensure_service(
        &self,
        function: &Function,
        owner: &OwnerReference,
    ) -> Result<(), ApiError> {
        let service = function.to_service(owner)?;

        self.call(self.resources.ensure_service(service)).await
    }

    async fn ensure_deployment(
        &self,
        function: &Function,
        owner: &OwnerReference,
        runtime: &RuntimeImage,
    ) -> Result<(), ApiError> {
        let deployment = function.to_deployment(owner, runtime)?;

        self.call(self.resources.ensure_deployment(deployment)).await
    }

    async fn ensure_cron_job(
        &self,
        function: &Function,
        owner: &OwnerReference,
    ) -> Result<(), EnsureError> {
        let api_version = self
            .call(self.resources.cron_job_group_version())
            .await
            .map_err(EnsureError::Discovery)?;

        let cron_job = function
            .to_cron_job(owner)
            .map_err(|error| EnsureError::CronJob(error.into()))?;

        self.call(self.resources.ensure_cron_job(cron_job, &api_version))
            .await
            .map_err(EnsureError::CronJob)
    }

    /// Ensures the declared autoscaler, or removes a previous one when none is declared.
    async fn ensure_autoscaling(
        &self,
        function: &Function,
        owner: &OwnerReference,
    ) -> Result<(), EnsureError> {
        let name = function.name_any();

        if function.autoscaler_target().is_none() {
            let namespace = function.namespace().unwrap_or_default();

            return self
                .delete_autoscaler(&namespace, &name)
                .await
                .map_err(EnsureError::DeleteAutoscaler);
        }

        if function.has_object_metric() {
            if self.resources.has_service_monitor_client() {
                let service_monitor = function
                    .to_service_monitor(owner)
                    .map_err(|error| EnsureError::ServiceMonitor(error.into()))?;

                self.call(self.resources.ensure_service_monitor(service_monitor))
                    .await
                    .map_err(EnsureError::ServiceMonitor)?;
            } else {
                tracing::warn!(
                    %name,
                    "Autoscaler uses an object metric but no service monitor client is configured. Skipping service monitor."
                );
            }
        } else if self.resources.has_service_monitor_client() {
            let namespace = function.namespace().unwrap_or_default();

            self.delete_object(ManagedKind::ServiceMonitor, &namespace, &name)
                .await
                .map_err(EnsureError::ServiceMonitor)?;
        }

        let autoscaler = function
            .to_autoscaler(owner)
            .map_err(|error| EnsureError::Autoscaler(error.into()))?;

        self.call(self.resources.ensure_autoscaler(autoscaler))
            .await
            .map_err(EnsureError::Autoscaler)
    }
}

pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    pub fn new(
        source: Arc<dyn WatchSource>,
        resources: Arc<dyn FunctionResources>,
        runtimes: Langruntimes,
        queue: Arc<WorkQueue>,
        config: &ControllerConfig,
    ) -> Self {
        let inner = Arc::new(ControllerInner {
            source,
            resources,
            runtimes,
            queue,
            api_timeout: config.api_timeout,
            max_retries: config.max_retries,
        });

        Self { inner }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.inner.queue
    }

    /// Handles one key. Returns `false` once the queue is shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        self.inner.process_next_item().await
    }

    /// Runs the informer, waits for the cache to sync, sweeps orphans once and
    /// then reconciles keys until `shutdown` resolves and the queue is drained.
    pub async fn run<I, S>(self, informer: I, shutdown: S)
    where
        I: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Starting.");

        let informer = tokio::spawn(informer);

        let shutdown = tokio::spawn({
            let queue = self.inner.queue.clone();

            async move {
                shutdown.await;
                tracing::info!("Shutting down.");
                queue.shut_down();
            }
        });

        tracing::info!("Waiting for function cache to sync.");
        while !self.inner.source.has_synced() {
            if self.inner.queue.is_shutting_down() {
                break;
            }

            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }

        if !self.inner.queue.is_shutting_down() {
            let resource_version = self
                .inner
                .source
                .last_sync_resource_version()
                .unwrap_or_default();
            tracing::info!(%resource_version, "Ready.");

            self.inner
                .garbage_collect()
                .instrument(trace_span!("GarbageCollect"))
                .await;
        }

        while self.process_next_item().await {}

        informer.abort();
        shutdown.abort();

        tracing::info!("Terminated.");
    }
}
