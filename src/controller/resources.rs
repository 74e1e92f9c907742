use super::errors::ApiError;
use crate::consts::{
    CRON_JOB_PLURAL, DEPLOYMENT_DEFAULTS_KEY, FIELD_MANAGER, SERVICE_MONITOR_GROUP,
    SERVICE_MONITOR_KIND, SERVICE_MONITOR_PLURAL, SERVICE_MONITOR_VERSION,
};
use crate::crds::defs::BuildError;
use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        autoscaling::v2::HorizontalPodAutoscaler,
        batch::v1::CronJob,
        core::v1::{ConfigMap, Service},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Discovery,
    Api, Client as KubeClient, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::{Debug, Display};

/// Kinds of objects created on behalf of a Function, addressed under a fixed
/// `group/version`. Cron jobs are served under a discovered one and have their
/// own calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManagedKind {
    ConfigMap,
    Service,
    Deployment,
    Autoscaler,
    ServiceMonitor,
}

impl Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ManagedKind::ConfigMap => "ConfigMap",
            ManagedKind::Service => "Service",
            ManagedKind::Deployment => "Deployment",
            ManagedKind::Autoscaler => "HorizontalPodAutoscaler",
            ManagedKind::ServiceMonitor => "ServiceMonitor",
        };

        write!(f, "{kind}")
    }
}

/// Kinds listed by the orphan sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweptKind {
    Service,
    Deployment,
    ConfigMap,
}

impl SweptKind {
    pub const ALL: [SweptKind; 3] = [
        SweptKind::Service,
        SweptKind::Deployment,
        SweptKind::ConfigMap,
    ];
}

impl From<SweptKind> for ManagedKind {
    fn from(kind: SweptKind) -> Self {
        match kind {
            SweptKind::Service => ManagedKind::Service,
            SweptKind::Deployment => ManagedKind::Deployment,
            SweptKind::ConfigMap => ManagedKind::ConfigMap,
        }
    }
}

impl Display for SweptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&ManagedKind::from(*self), f)
    }
}

/// Identity and ownership of a listed object.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedObject {
    pub namespace: Option<String>,
    pub name: String,
    pub owner_references: Vec<OwnerReference>,
}

impl OwnedObject {
    fn from_resource<K: Resource>(resource: &K) -> Self {
        Self {
            namespace: resource.namespace(),
            name: resource.name_any(),
            owner_references: resource.owner_references().to_vec(),
        }
    }
}

/// Everything the reconciler needs from the cluster.
///
/// `ensure_*` creates the object when absent and converges it when present.
/// `delete` reports a missing object as [`ApiError::NotFound`].
#[async_trait]
pub trait FunctionResources: Send + Sync {
    /// Raw cluster-wide deployment defaults, if configured.
    async fn deployment_defaults(&self) -> Result<Option<String>, ApiError>;

    async fn ensure_config_map(&self, config_map: ConfigMap) -> Result<(), ApiError>;

    async fn ensure_service(&self, service: Service) -> Result<(), ApiError>;

    async fn ensure_deployment(&self, deployment: Deployment) -> Result<(), ApiError>;

    /// Preferred `group/version` the cluster serves cron jobs under.
    async fn cron_job_group_version(&self) -> Result<String, ApiError>;

    async fn ensure_cron_job(&self, cron_job: CronJob, api_version: &str) -> Result<(), ApiError>;

    async fn cron_job_exists(
        &self,
        namespace: &str,
        name: &str,
        api_version: &str,
    ) -> Result<bool, ApiError>;

    /// Addresses the cron job under `api_version`, as [`Self::ensure_cron_job`] does.
    async fn delete_cron_job(
        &self,
        namespace: &str,
        name: &str,
        api_version: &str,
    ) -> Result<(), ApiError>;

    fn has_service_monitor_client(&self) -> bool;

    async fn ensure_service_monitor(&self, service_monitor: DynamicObject)
        -> Result<(), ApiError>;

    async fn ensure_autoscaler(&self, autoscaler: HorizontalPodAutoscaler) -> Result<(), ApiError>;

    async fn delete(&self, kind: ManagedKind, namespace: &str, name: &str) -> Result<(), ApiError>;

    /// Lists every object of the kind across all namespaces.
    async fn list_owned(&self, kind: SweptKind) -> Result<Vec<OwnedObject>, ApiError>;
}

fn cron_job_resource(api_version: &str) -> ApiResource {
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));

    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(group, version, "CronJob"),
        CRON_JOB_PLURAL,
    )
}

pub struct KubeResources {
    client: KubeClient,
    config_namespace: String,
    config_name: String,
    service_monitor: Option<ApiResource>,
}

impl KubeResources {
    pub fn new(
        client: KubeClient,
        config_namespace: String,
        config_name: String,
        enable_service_monitor: bool,
    ) -> Self {
        let service_monitor = enable_service_monitor.then(|| {
            ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk(
                    SERVICE_MONITOR_GROUP,
                    SERVICE_MONITOR_VERSION,
                    SERVICE_MONITOR_KIND,
                ),
                SERVICE_MONITOR_PLURAL,
            )
        });

        Self {
            client,
            config_namespace,
            config_name,
            service_monitor,
        }
    }

    fn service_monitor_resource(&self) -> Result<&ApiResource, ApiError> {
        self.service_monitor
            .as_ref()
            .ok_or_else(|| ApiError::NotDiscovered(String::from(SERVICE_MONITOR_PLURAL)))
    }

    async fn ensure<K>(&self, object: K) -> Result<(), ApiError>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = object.namespace().ok_or(BuildError::Namespace)?;
        let name = object.name_any();
        let kind = K::kind(&Default::default()).to_string();
        let api = Api::<K>::namespaced(self.client.clone(), &namespace);

        match api.get_opt(&name).await? {
            None => {
                tracing::info!(%kind, %namespace, %name, "Creating.");
                api.create(&PostParams::default(), &object).await?;
            }
            Some(_) => {
                tracing::debug!(%kind, %namespace, %name, "Applying.");
                api.patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&object),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn ensure_dynamic(
        &self,
        object: DynamicObject,
        resource: &ApiResource,
    ) -> Result<(), ApiError> {
        let namespace = object.namespace().ok_or(BuildError::Namespace)?;
        let name = object.name_any();
        let kind = &resource.kind;
        let api = Api::<DynamicObject>::namespaced_with(self.client.clone(), &namespace, resource);

        match api.get_opt(&name).await? {
            None => {
                tracing::info!(%kind, %namespace, %name, "Creating.");
                api.create(&PostParams::default(), &object).await?;
            }
            Some(_) => {
                tracing::debug!(%kind, %namespace, %name, "Applying.");
                api.patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&object),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn delete_dynamic(
        &self,
        namespace: &str,
        name: &str,
        resource: &ApiResource,
    ) -> Result<(), ApiError> {
        let api = Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, resource);
        api.delete(name, &DeleteParams::default()).await?;

        tracing::info!(kind = %resource.kind, %namespace, %name, "Deleted.");

        Ok(())
    }

    async fn delete_typed<K>(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), ApiError>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned
            + Send
            + Sync
            + 'static,
        <K as Resource>::DynamicType: Default,
    {
        let api = Api::<K>::namespaced(self.client.clone(), namespace);
        api.delete(name, params).await?;

        tracing::info!(kind = %K::kind(&Default::default()), %namespace, %name, "Deleted.");

        Ok(())
    }

    async fn list_typed<K>(&self) -> Result<Vec<OwnedObject>, ApiError>
    where
        K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
        <K as Resource>::DynamicType: Default,
    {
        let api = Api::<K>::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        Ok(list.items.iter().map(OwnedObject::from_resource).collect())
    }
}

#[async_trait]
impl FunctionResources for KubeResources {
    async fn deployment_defaults(&self) -> Result<Option<String>, ApiError> {
        let api = Api::<ConfigMap>::namespaced(self.client.clone(), &self.config_namespace);

        let Some(config_map) = api.get_opt(&self.config_name).await? else {
            return Ok(None);
        };

        Ok(config_map
            .data
            .and_then(|mut data| data.remove(DEPLOYMENT_DEFAULTS_KEY)))
    }

    async fn ensure_config_map(&self, config_map: ConfigMap) -> Result<(), ApiError> {
        self.ensure(config_map).await
    }

    async fn ensure_service(&self, service: Service) -> Result<(), ApiError> {
        self.ensure(service).await
    }

    async fn ensure_deployment(&self, deployment: Deployment) -> Result<(), ApiError> {
        self.ensure(deployment).await
    }

    async fn cron_job_group_version(&self) -> Result<String, ApiError> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&["batch"])
            .run()
            .await?;

        let found = discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .find(|(resource, _)| resource.plural == CRON_JOB_PLURAL)
            .map(|(resource, _)| resource.api_version);

        found.ok_or_else(|| ApiError::NotDiscovered(String::from(CRON_JOB_PLURAL)))
    }

    async fn ensure_cron_job(&self, cron_job: CronJob, api_version: &str) -> Result<(), ApiError> {
        let resource = cron_job_resource(api_version);

        let mut value = serde_json::to_value(&cron_job)?;
        value["apiVersion"] = serde_json::Value::String(api_version.to_string());
        let object: DynamicObject = serde_json::from_value(value)?;

        self.ensure_dynamic(object, &resource).await
    }

    async fn cron_job_exists(
        &self,
        namespace: &str,
        name: &str,
        api_version: &str,
    ) -> Result<bool, ApiError> {
        let resource = cron_job_resource(api_version);
        let api = Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, &resource);

        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_cron_job(
        &self,
        namespace: &str,
        name: &str,
        api_version: &str,
    ) -> Result<(), ApiError> {
        let resource = cron_job_resource(api_version);

        self.delete_dynamic(namespace, name, &resource).await
    }

    fn has_service_monitor_client(&self) -> bool {
        self.service_monitor.is_some()
    }

    async fn ensure_service_monitor(
        &self,
        service_monitor: DynamicObject,
    ) -> Result<(), ApiError> {
        let resource = self.service_monitor_resource()?;

        self.ensure_dynamic(service_monitor, resource).await
    }

    async fn ensure_autoscaler(&self, autoscaler: HorizontalPodAutoscaler) -> Result<(), ApiError> {
        self.ensure(autoscaler).await
    }

    async fn delete(&self, kind: ManagedKind, namespace: &str, name: &str) -> Result<(), ApiError> {
        let params = DeleteParams::default();

        match kind {
            ManagedKind::ConfigMap => {
                self.delete_typed::<ConfigMap>(namespace, name, &params)
                    .await
            }
            ManagedKind::Service => self.delete_typed::<Service>(namespace, name, &params).await,
            ManagedKind::Deployment => {
                self.delete_typed::<Deployment>(namespace, name, &DeleteParams::background())
                    .await
            }
            ManagedKind::Autoscaler => {
                self.delete_typed::<HorizontalPodAutoscaler>(namespace, name, &params)
                    .await
            }
            ManagedKind::ServiceMonitor => {
                let resource = self.service_monitor_resource()?;

                self.delete_dynamic(namespace, name, resource).await
            }
        }
    }

    async fn list_owned(&self, kind: SweptKind) -> Result<Vec<OwnedObject>, ApiError> {
        match kind {
            SweptKind::ConfigMap => self.list_typed::<ConfigMap>().await,
            SweptKind::Service => self.list_typed::<Service>().await,
            SweptKind::Deployment => self.list_typed::<Deployment>().await,
        }
    }
}
