use super::errors::{ApiError, DeleteError, EnsureError, ReconcileError};
use super::queue::WorkQueue;
use super::resources::{FunctionResources, ManagedKind, OwnedObject, SweptKind};
use super::watch::{EventDispatcher, FunctionCache, FunctionEventHandler, WatchSource};
use super::Controller;
use crate::config::ControllerConfig;
use crate::crds::{Function, TriggerType};
use crate::test_utils::{autoscaled_function, function, owner_reference, runtime_image, runtimes};
use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    autoscaling::v2::HorizontalPodAutoscaler,
    batch::v1::CronJob,
    core::v1::{ConfigMap, Service},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, ErrorResponse};
use kube::runtime::watcher;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type ObjectKey = (ManagedKind, String, String);

/// `(apiVersion, namespace, name)`
type CronJobKey = (String, String, String);

const CRON_JOB_API_VERSION: &str = "batch/v1";

/// In-memory cluster recording every object the controller writes.
#[derive(Default)]
struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    cron_jobs: Mutex<BTreeMap<CronJobKey, Value>>,
    mutations: AtomicUsize,
    deployment_defaults: Mutex<Option<String>>,
    service_monitor_client: bool,
    failing: AtomicBool,
    /// Remaining injected failures per call name.
    failures: Mutex<BTreeMap<String, usize>>,
    hanging: AtomicBool,
    calls: AtomicUsize,
}

fn internal_error() -> ApiError {
    ApiError::Kube(kube::Error::Api(ErrorResponse {
        status: String::from("Failure"),
        message: String::from("internal error"),
        reason: String::from("InternalError"),
        code: 500,
    }))
}

impl FakeCluster {
    fn with_service_monitor_client() -> Self {
        Self {
            service_monitor_client: true,
            ..Default::default()
        }
    }

    /// Fails the next `times` calls named `call`, e.g. `delete Service`.
    fn fail(&self, call: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(call.to_string(), times);
    }

    async fn enter(&self, call: &str) -> Result<(), ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(internal_error());
        }

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(call) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(internal_error());
            }
        }

        Ok(())
    }

    fn put<T: Serialize>(&self, kind: ManagedKind, object: &T) -> Result<(), ApiError> {
        let value = serde_json::to_value(object)?;
        let key = (kind, namespace_of(&value), name_of(&value));

        let mut objects = self.objects.lock().unwrap();
        if objects.get(&key) != Some(&value) {
            objects.insert(key, value);
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    fn get(&self, kind: ManagedKind, namespace: &str, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn cron_job(&self, namespace: &str, name: &str) -> Option<Value> {
        self.cron_jobs
            .lock()
            .unwrap()
            .get(&(
                CRON_JOB_API_VERSION.to_string(),
                namespace.to_string(),
                name.to_string(),
            ))
            .cloned()
    }

    fn kinds(&self) -> BTreeSet<ManagedKind> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .map(|(kind, _, _)| *kind)
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty() && self.cron_jobs.lock().unwrap().is_empty()
    }

    fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }
}

fn namespace_of(value: &Value) -> String {
    value["metadata"]["namespace"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn name_of(value: &Value) -> String {
    value["metadata"]["name"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl FunctionResources for FakeCluster {
    async fn deployment_defaults(&self) -> Result<Option<String>, ApiError> {
        self.enter("deployment_defaults").await?;
        Ok(self.deployment_defaults.lock().unwrap().clone())
    }

    async fn ensure_config_map(&self, config_map: ConfigMap) -> Result<(), ApiError> {
        self.enter("ensure ConfigMap").await?;
        self.put(ManagedKind::ConfigMap, &config_map)
    }

    async fn ensure_service(&self, service: Service) -> Result<(), ApiError> {
        self.enter("ensure Service").await?;
        self.put(ManagedKind::Service, &service)
    }

    async fn ensure_deployment(&self, deployment: Deployment) -> Result<(), ApiError> {
        self.enter("ensure Deployment").await?;
        self.put(ManagedKind::Deployment, &deployment)
    }

    async fn cron_job_group_version(&self) -> Result<String, ApiError> {
        self.enter("cron_job_group_version").await?;
        Ok(String::from(CRON_JOB_API_VERSION))
    }

    async fn ensure_cron_job(&self, cron_job: CronJob, api_version: &str) -> Result<(), ApiError> {
        self.enter("ensure CronJob").await?;

        let mut value = serde_json::to_value(&cron_job)?;
        value["apiVersion"] = Value::String(api_version.to_string());
        let key = (api_version.to_string(), namespace_of(&value), name_of(&value));

        let mut cron_jobs = self.cron_jobs.lock().unwrap();
        if cron_jobs.get(&key) != Some(&value) {
            cron_jobs.insert(key, value);
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    async fn cron_job_exists(
        &self,
        namespace: &str,
        name: &str,
        api_version: &str,
    ) -> Result<bool, ApiError> {
        self.enter("cron_job_exists").await?;

        Ok(self.cron_jobs.lock().unwrap().contains_key(&(
            api_version.to_string(),
            namespace.to_string(),
            name.to_string(),
        )))
    }

    async fn delete_cron_job(
        &self,
        namespace: &str,
        name: &str,
        api_version: &str,
    ) -> Result<(), ApiError> {
        self.enter("delete CronJob").await?;

        let removed = self.cron_jobs.lock().unwrap().remove(&(
            api_version.to_string(),
            namespace.to_string(),
            name.to_string(),
        ));

        match removed {
            Some(_) => {
                self.mutations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ApiError::NotFound),
        }
    }

    fn has_service_monitor_client(&self) -> bool {
        self.service_monitor_client
    }

    async fn ensure_service_monitor(
        &self,
        service_monitor: DynamicObject,
    ) -> Result<(), ApiError> {
        self.enter("ensure ServiceMonitor").await?;
        self.put(ManagedKind::ServiceMonitor, &service_monitor)
    }

    async fn ensure_autoscaler(&self, autoscaler: HorizontalPodAutoscaler) -> Result<(), ApiError> {
        self.enter("ensure HorizontalPodAutoscaler").await?;
        self.put(ManagedKind::Autoscaler, &autoscaler)
    }

    async fn delete(&self, kind: ManagedKind, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.enter(&format!("delete {kind}")).await?;

        let removed = self
            .objects
            .lock()
            .unwrap()
            .remove(&(kind, namespace.to_string(), name.to_string()));

        match removed {
            Some(_) => {
                self.mutations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ApiError::NotFound),
        }
    }

    async fn list_owned(&self, kind: SweptKind) -> Result<Vec<OwnedObject>, ApiError> {
        self.enter(&format!("list {kind}")).await?;

        let kind = ManagedKind::from(kind);
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((object_kind, _, _), _)| *object_kind == kind)
            .map(|((_, namespace, name), value)| OwnedObject {
                namespace: Some(namespace.clone()),
                name: name.clone(),
                owner_references: serde_json::from_value::<Vec<OwnerReference>>(
                    value["metadata"]["ownerReferences"].clone(),
                )
                .unwrap_or_default(),
            })
            .collect())
    }
}

struct NoopHandler;

impl FunctionEventHandler for NoopHandler {
    fn on_add(&self, _function: &Function) {}

    fn on_update(&self, _old: &Function, _new: &Function) {}

    fn on_delete(&self, _function: &Function) {}
}

struct Harness {
    cluster: Arc<FakeCluster>,
    dispatcher: EventDispatcher<NoopHandler>,
    cache: FunctionCache,
    queue: Arc<WorkQueue>,
    controller: Controller,
}

impl Harness {
    fn new(cluster: FakeCluster) -> Self {
        let config = ControllerConfig::default();
        let cluster = Arc::new(cluster);
        let queue = Arc::new(WorkQueue::new(config.backoff()));
        let (dispatcher, cache) = EventDispatcher::new(NoopHandler);

        let controller = Controller::new(
            Arc::new(cache.clone()),
            cluster.clone(),
            runtimes(),
            queue.clone(),
            &config,
        );

        Self {
            cluster,
            dispatcher,
            cache,
            queue,
            controller,
        }
    }

    fn apply(&mut self, function: Function) {
        self.dispatcher.dispatch(watcher::Event::Applied(function));
    }

    fn remove(&mut self, function: Function) {
        self.dispatcher.dispatch(watcher::Event::Deleted(function));
    }

    async fn reconcile(&self, key: &str) {
        self.queue.add(key);
        assert!(self.controller.process_next_item().await);
    }

    async fn process_item(&self, key: &str) -> Result<(), ReconcileError> {
        self.controller.inner.process_item(key).await
    }
}

#[tokio::test]
async fn ensure_creates_objects_and_reaches_fixed_point() {
    let mut harness = Harness::new(FakeCluster::default());
    harness.apply(function("ns", "hello"));

    harness.reconcile("ns/hello").await;

    assert_eq!(
        harness.cluster.kinds(),
        BTreeSet::from([
            ManagedKind::ConfigMap,
            ManagedKind::Service,
            ManagedKind::Deployment
        ])
    );
    let deployment = harness
        .cluster
        .get(ManagedKind::Deployment, "ns", "hello")
        .unwrap();
    assert_eq!(
        deployment["metadata"]["ownerReferences"][0]["uid"],
        "uid-hello"
    );
    assert_eq!(deployment["metadata"]["labels"]["function"], "hello");
    assert_eq!(harness.queue.num_requeues("ns/hello"), 0);

    let mutations = harness.cluster.mutations();
    harness.reconcile("ns/hello").await;

    assert_eq!(harness.cluster.mutations(), mutations);
}

#[tokio::test]
async fn scheduled_function_yields_exactly_four_objects() {
    let mut harness = Harness::new(FakeCluster::with_service_monitor_client());
    let mut scheduled = function("ns", "tick");
    scheduled.spec.trigger_type = TriggerType::Scheduled;
    scheduled.spec.schedule = String::from("*/1 * * * *");
    harness.apply(scheduled);

    harness.reconcile("ns/tick").await;

    assert_eq!(
        harness.cluster.kinds(),
        BTreeSet::from([
            ManagedKind::ConfigMap,
            ManagedKind::Service,
            ManagedKind::Deployment
        ])
    );
    assert_eq!(harness.cluster.cron_jobs.lock().unwrap().len(), 1);
    assert!(harness.cluster.cron_job("ns", "trigger-tick").is_some());
}

#[tokio::test]
async fn object_metric_creates_monitor_and_removal_deletes_both() {
    let mut harness = Harness::new(FakeCluster::with_service_monitor_client());
    harness.apply(autoscaled_function("ns", "scaled", "Object"));

    harness.reconcile("ns/scaled").await;

    assert!(harness
        .cluster
        .get(ManagedKind::Autoscaler, "ns", "scaled")
        .is_some());
    assert!(harness
        .cluster
        .get(ManagedKind::ServiceMonitor, "ns", "scaled")
        .is_some());

    harness.apply(function("ns", "scaled"));
    harness.reconcile("ns/scaled").await;

    assert!(harness
        .cluster
        .get(ManagedKind::Autoscaler, "ns", "scaled")
        .is_none());
    assert!(harness
        .cluster
        .get(ManagedKind::ServiceMonitor, "ns", "scaled")
        .is_none());
    assert!(harness
        .cluster
        .get(ManagedKind::Deployment, "ns", "scaled")
        .is_some());
}

#[tokio::test]
async fn resource_metric_creates_autoscaler_only() {
    let mut harness = Harness::new(FakeCluster::with_service_monitor_client());
    harness.apply(autoscaled_function("ns", "scaled", "Resource"));

    harness.reconcile("ns/scaled").await;

    assert!(harness.cluster.kinds().contains(&ManagedKind::Autoscaler));
    assert!(!harness.cluster.kinds().contains(&ManagedKind::ServiceMonitor));
}

#[tokio::test]
async fn object_metric_without_monitor_client_still_creates_autoscaler() {
    let mut harness = Harness::new(FakeCluster::default());
    harness.apply(autoscaled_function("ns", "scaled", "Object"));

    assert!(harness.process_item("ns/scaled").await.is_ok());

    assert!(harness.cluster.kinds().contains(&ManagedKind::Autoscaler));
    assert!(!harness.cluster.kinds().contains(&ManagedKind::ServiceMonitor));
}

#[tokio::test]
async fn deleting_function_without_sub_resources_succeeds() {
    let harness = Harness::new(FakeCluster::with_service_monitor_client());

    assert!(harness.process_item("ns/gone").await.is_ok());
}

#[tokio::test]
async fn deleted_function_loses_every_managed_object() {
    let mut harness = Harness::new(FakeCluster::with_service_monitor_client());
    let mut everything = autoscaled_function("ns", "full", "Object");
    everything.spec.trigger_type = TriggerType::Scheduled;
    everything.spec.schedule = String::from("0 * * * *");
    harness.apply(everything.clone());

    harness.reconcile("ns/full").await;
    assert_eq!(harness.cluster.kinds().len(), 5);
    assert!(harness.cluster.cron_job("ns", "trigger-full").is_some());

    harness.remove(everything);
    harness.reconcile("ns/full").await;

    assert!(harness.cluster.is_empty());
    assert_eq!(harness.queue.num_requeues("ns/full"), 0);
}

#[tokio::test]
async fn sweep_enqueues_orphans_and_reconciliation_removes_them() {
    let harness = Harness::new(FakeCluster::default());

    let orphan = function("ns", "orphan");
    let owner = owner_reference(&orphan);
    let cluster = &harness.cluster;
    cluster
        .put(
            ManagedKind::Deployment,
            &orphan.to_deployment(&owner, &runtime_image()).unwrap(),
        )
        .unwrap();
    cluster
        .put(ManagedKind::Service, &orphan.to_service(&owner).unwrap())
        .unwrap();
    cluster
        .put(
            ManagedKind::ConfigMap,
            &orphan.to_config_map(&owner, &runtime_image()).unwrap(),
        )
        .unwrap();

    let mut unrelated = ConfigMap::default();
    unrelated.metadata.name = Some(String::from("unrelated"));
    unrelated.metadata.namespace = Some(String::from("ns"));
    unrelated.metadata.owner_references = Some(vec![OwnerReference {
        api_version: String::from("apps/v1"),
        kind: String::from("ReplicaSet"),
        name: String::from("rs"),
        uid: String::from("uid-rs"),
        ..Default::default()
    }]);
    cluster.put(ManagedKind::ConfigMap, &unrelated).unwrap();

    let enqueued = harness.controller.inner.garbage_collect().await;

    assert_eq!(enqueued, 3);
    assert_eq!(harness.queue.len(), 1);

    assert!(harness.controller.process_next_item().await);

    assert_eq!(
        harness.cluster.kinds(),
        BTreeSet::from([ManagedKind::ConfigMap])
    );
    assert!(harness
        .cluster
        .get(ManagedKind::ConfigMap, "ns", "unrelated")
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn failing_key_is_dropped_after_six_attempts() {
    let harness = Harness::new(FakeCluster::default());
    harness.cluster.failing.store(true, Ordering::SeqCst);
    harness.queue.add("ns/broken");

    for attempt in 0..6 {
        assert!(harness.controller.process_next_item().await);
        assert_eq!(harness.cluster.calls.load(Ordering::SeqCst), attempt + 1);
    }

    assert_eq!(harness.queue.num_requeues("ns/broken"), 0);
    assert!(harness.queue.is_empty());
    assert!(
        tokio::time::timeout(Duration::from_secs(3600), harness.queue.get())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn invalid_key_is_dropped_without_retry() {
    let harness = Harness::new(FakeCluster::default());

    for key in ["no-namespace", "a/b/c"] {
        harness.reconcile(key).await;

        assert_eq!(harness.queue.num_requeues(key), 0);
        assert!(harness.queue.is_empty());
    }
    assert_eq!(harness.cluster.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unparsable_deployment_defaults_are_retried() {
    let mut harness = Harness::new(FakeCluster::default());
    *harness.cluster.deployment_defaults.lock().unwrap() = Some(String::from("spec: [unclosed"));
    harness.apply(function("ns", "hello"));

    assert!(matches!(
        harness.process_item("ns/hello").await,
        Err(ReconcileError::Ensure(EnsureError::ConfigParse(_)))
    ));

    harness.reconcile("ns/hello").await;
    assert_eq!(harness.queue.num_requeues("ns/hello"), 1);
    assert!(harness.cluster.is_empty());
}

#[tokio::test]
async fn deployment_defaults_are_merged_into_deployment() {
    let mut harness = Harness::new(FakeCluster::default());
    *harness.cluster.deployment_defaults.lock().unwrap() = Some(String::from(
        "metadata:\n  annotations:\n    team: platform\nspec:\n  replicas: 4\n",
    ));
    let mut hello = function("ns", "hello");
    hello.spec.deployment.spec = Some(DeploymentSpec::default());
    harness.apply(hello);

    harness.reconcile("ns/hello").await;

    let deployment = harness
        .cluster
        .get(ManagedKind::Deployment, "ns", "hello")
        .unwrap();
    assert_eq!(deployment["metadata"]["annotations"]["team"], "platform");
    assert_eq!(deployment["spec"]["replicas"], 4);
}

#[tokio::test]
async fn unknown_runtime_is_reported() {
    let mut harness = Harness::new(FakeCluster::default());
    let mut ruby = function("ns", "ruby");
    ruby.spec.runtime = String::from("ruby2.7");
    harness.apply(ruby);

    assert!(matches!(
        harness.process_item("ns/ruby").await,
        Err(ReconcileError::Ensure(EnsureError::Runtime(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn hanging_call_times_out() {
    let mut harness = Harness::new(FakeCluster::default());
    harness.cluster.hanging.store(true, Ordering::SeqCst);
    harness.apply(function("ns", "hello"));

    assert!(matches!(
        harness.process_item("ns/hello").await,
        Err(ReconcileError::Ensure(EnsureError::DeploymentDefaults(
            ApiError::Timeout(_)
        )))
    ));
}

#[tokio::test(start_paused = true)]
async fn run_sweeps_reconciles_and_stops_on_shutdown() {
    let mut harness = Harness::new(FakeCluster::default());
    harness
        .dispatcher
        .dispatch(watcher::Event::Restarted(vec![function("ns", "hello")]));
    harness.queue.add("ns/hello");
    assert!(harness.cache.has_synced());

    let Harness {
        cluster,
        controller,
        queue,
        ..
    } = harness;

    controller
        .run(std::future::pending(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

    assert!(queue.is_shutting_down());
    assert!(cluster
        .get(ManagedKind::Deployment, "ns", "hello")
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_cron_job_discovery_is_retried() {
    let mut harness = Harness::new(FakeCluster::default());
    let mut scheduled = function("ns", "tick");
    scheduled.spec.trigger_type = TriggerType::Scheduled;
    scheduled.spec.schedule = String::from("*/5 * * * *");
    harness.apply(scheduled);
    harness.cluster.fail("cron_job_group_version", 2);

    assert!(matches!(
        harness.process_item("ns/tick").await,
        Err(ReconcileError::Ensure(EnsureError::Discovery(_)))
    ));

    harness.reconcile("ns/tick").await;
    assert_eq!(harness.queue.num_requeues("ns/tick"), 1);
    assert!(harness.cluster.cron_job("ns", "trigger-tick").is_none());

    assert!(harness.controller.process_next_item().await);
    assert_eq!(harness.queue.num_requeues("ns/tick"), 0);
    assert!(harness.cluster.cron_job("ns", "trigger-tick").is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_delete_stops_and_retry_finishes_cleanup() {
    let mut harness = Harness::new(FakeCluster::with_service_monitor_client());
    let mut everything = autoscaled_function("ns", "full", "Object");
    everything.spec.trigger_type = TriggerType::Scheduled;
    everything.spec.schedule = String::from("0 * * * *");
    harness.apply(everything.clone());
    harness.reconcile("ns/full").await;

    harness.remove(everything);
    harness.cluster.fail("delete Service", 2);

    assert!(matches!(
        harness.process_item("ns/full").await,
        Err(ReconcileError::Delete(DeleteError::Service(_)))
    ));
    assert!(harness.cluster.cron_job("ns", "trigger-full").is_none());
    assert!(harness
        .cluster
        .get(ManagedKind::Deployment, "ns", "full")
        .is_none());
    assert_eq!(
        harness.cluster.kinds(),
        BTreeSet::from([
            ManagedKind::ConfigMap,
            ManagedKind::Service,
            ManagedKind::Autoscaler,
            ManagedKind::ServiceMonitor
        ])
    );

    harness.reconcile("ns/full").await;
    assert_eq!(harness.queue.num_requeues("ns/full"), 1);
    assert!(harness
        .cluster
        .get(ManagedKind::Service, "ns", "full")
        .is_some());

    assert!(harness.controller.process_next_item().await);
    assert!(harness.cluster.is_empty());
    assert_eq!(harness.queue.num_requeues("ns/full"), 0);
}

#[tokio::test]
async fn switching_to_resource_metric_removes_monitor() {
    let mut harness = Harness::new(FakeCluster::with_service_monitor_client());
    harness.apply(autoscaled_function("ns", "scaled", "Object"));
    harness.reconcile("ns/scaled").await;
    assert!(harness
        .cluster
        .get(ManagedKind::ServiceMonitor, "ns", "scaled")
        .is_some());

    harness.apply(autoscaled_function("ns", "scaled", "Resource"));
    harness.reconcile("ns/scaled").await;

    assert!(harness
        .cluster
        .get(ManagedKind::ServiceMonitor, "ns", "scaled")
        .is_none());
    assert!(harness
        .cluster
        .get(ManagedKind::Autoscaler, "ns", "scaled")
        .is_some());
}

#[tokio::test]
async fn sweep_skips_kinds_that_fail_to_list() {
    let harness = Harness::new(FakeCluster::default());
    let orphan = function("ns", "orphan");
    let owner = owner_reference(&orphan);
    harness
        .cluster
        .put(ManagedKind::Service, &orphan.to_service(&owner).unwrap())
        .unwrap();
    harness
        .cluster
        .put(
            ManagedKind::ConfigMap,
            &orphan.to_config_map(&owner, &runtime_image()).unwrap(),
        )
        .unwrap();
    harness.cluster.fail("list Service", 1);

    assert_eq!(harness.controller.inner.garbage_collect().await, 1);
    assert_eq!(harness.queue.len(), 1);
}
