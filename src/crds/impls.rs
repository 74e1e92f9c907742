use super::defs::{BuildError, Function};
use crate::consts::{
    CRON_JOB_IMAGE, CRON_JOB_PREFIX, DEFAULT_FUNCTION_TIMEOUT, FUNCTION_LABEL, FUNCTION_PORT,
    FUNCTION_PORT_NAME, FUNCTION_VOLUME_PATH, PREPARE_IMAGE, SERVICE_MONITOR_API_VERSION,
    SERVICE_MONITOR_KIND, SOURCE_VOLUME_PATH,
};
use crate::runtime::RuntimeImage;
use crate::utils::{extend_map, merge_missing};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        autoscaling::v2::HorizontalPodAutoscaler,
        batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
            EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
            ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::{
    core::{DynamicObject, ObjectMeta},
    ResourceExt,
};
use serde_json::json;
use std::collections::BTreeMap;

impl Function {
    fn to_name(&self) -> String {
        self.name_any()
    }

    fn to_namespace(&self) -> Result<String, BuildError> {
        self.namespace().ok_or(BuildError::Namespace)
    }

    /// Guarantees the `function=<name>` label on this copy.
    pub fn normalize_labels(&mut self) {
        let name = self.to_name();
        self.labels_mut().insert(String::from(FUNCTION_LABEL), name);
    }

    pub fn to_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels().clone();
        labels.insert(String::from(FUNCTION_LABEL), self.to_name());
        labels
    }

    fn to_meta(&self, name: String, owner: &OwnerReference) -> Result<ObjectMeta, BuildError> {
        Ok(ObjectMeta {
            name: Some(name),
            namespace: Some(self.to_namespace()?),
            labels: Some(self.to_labels()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        })
    }

    /// Splits the handler `module.function`.
    fn to_handler_parts(&self) -> Result<(&str, &str), BuildError> {
        match self.spec.handler.split_once('.') {
            Some((module, function)) if !module.is_empty() && !function.is_empty() => {
                Ok((module, function))
            }
            _ => Err(BuildError::Handler(self.spec.handler.clone())),
        }
    }

    fn to_source_file_name(&self, runtime: &RuntimeImage) -> Result<String, BuildError> {
        let (module, _) = self.to_handler_parts()?;
        Ok(format!("{}{}", module, runtime.file_name_suffix))
    }

    fn to_deps_file_name<'a>(&self, runtime: &'a RuntimeImage) -> Option<&'a str> {
        if self.spec.deps.is_empty() {
            return None;
        }
        runtime.deps_file_name.as_deref()
    }

    fn to_timeout(&self) -> String {
        if self.spec.timeout.is_empty() {
            String::from(DEFAULT_FUNCTION_TIMEOUT)
        } else {
            self.spec.timeout.clone()
        }
    }

    fn to_function_volume_name(&self) -> String {
        self.to_name()
    }

    fn to_source_volume_name(&self) -> String {
        format!("{}-source", self.to_name())
    }

    fn to_function_volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.to_function_volume_name(),
            mount_path: String::from(FUNCTION_VOLUME_PATH),
            ..Default::default()
        }
    }

    fn to_volumes(&self) -> Vec<Volume> {
        vec![
            Volume {
                name: self.to_function_volume_name(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            Volume {
                name: self.to_source_volume_name(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(self.to_name()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]
    }

    fn to_scrape_annotations(&self) -> BTreeMap<String, String> {
        [
            ("prometheus.io/scrape", String::from("true")),
            ("prometheus.io/path", String::from("/metrics")),
            ("prometheus.io/port", FUNCTION_PORT.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (String::from(k), v))
        .collect()
    }

    fn to_env_vars(&self, runtime_id: &str) -> Result<Vec<EnvVar>, BuildError> {
        let (module, function) = self.to_handler_parts()?;

        Ok([
            ("FUNC_HANDLER", function.to_string()),
            ("MOD_NAME", module.to_string()),
            ("FUNC_TIMEOUT", self.to_timeout()),
            ("FUNC_RUNTIME", runtime_id.to_string()),
            ("FUNC_PORT", FUNCTION_PORT.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: String::from(name),
            value: Some(value),
            ..Default::default()
        })
        .collect())
    }

    fn to_liveness_probe(&self) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some(String::from("/healthz")),
                port: IntOrString::Int(FUNCTION_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(3),
            period_seconds: Some(30),
            ..Default::default()
        }
    }

    /// Fills the first container of the declared deployment with what the runtime needs.
    /// Anything the declaration already sets is kept.
    fn to_function_container(
        &self,
        mut container: Container,
        runtime: &RuntimeImage,
    ) -> Result<Container, BuildError> {
        container.name = self.to_name();

        if container.image.as_deref().map_or(true, str::is_empty) {
            container.image = Some(runtime.image.clone());
        }

        if container.command.is_none() {
            container.command = runtime.command.clone();
        }

        if container.ports.as_ref().map_or(true, Vec::is_empty) {
            container.ports = Some(vec![ContainerPort {
                name: Some(String::from(FUNCTION_PORT_NAME)),
                container_port: FUNCTION_PORT,
                protocol: Some(String::from("TCP")),
                ..Default::default()
            }]);
        }

        let mut env = container.env.take().unwrap_or_default();
        for var in self.to_env_vars(&self.spec.runtime)? {
            if !env.iter().any(|existing| existing.name == var.name) {
                env.push(var);
            }
        }
        container.env = Some(env);

        let mut volume_mounts = container.volume_mounts.take().unwrap_or_default();
        if !volume_mounts
            .iter()
            .any(|mount| mount.name == self.to_function_volume_name())
        {
            volume_mounts.push(self.to_function_volume_mount());
        }
        container.volume_mounts = Some(volume_mounts);

        if container.liveness_probe.is_none() {
            container.liveness_probe = Some(self.to_liveness_probe());
        }

        Ok(container)
    }

    /// Shell script copying the source out of the config map, decoding and verifying it.
    fn to_prepare_script(&self, runtime: &RuntimeImage) -> Result<String, BuildError> {
        let file = self.to_source_file_name(runtime)?;
        let source = format!("{SOURCE_VOLUME_PATH}/{file}");
        let target = format!("{FUNCTION_VOLUME_PATH}/{file}");

        let mut steps = vec![match self.spec.function_content_type.as_str() {
            content_type if content_type.starts_with("base64") => {
                format!("base64 -d < {source} > {target}")
            }
            "url" => format!("wget -qO {target} \"$(cat {source})\""),
            _ => format!("cp {source} {target}"),
        }];

        if let Some(checksum) = self.spec.checksum.strip_prefix("sha256:") {
            steps.push(format!("echo '{checksum}  {target}' | sha256sum -c"));
        }

        if let Some(deps) = self.to_deps_file_name(runtime) {
            steps.push(format!(
                "cp {SOURCE_VOLUME_PATH}/{deps} {FUNCTION_VOLUME_PATH}/{deps}"
            ));
        }

        Ok(steps.join(" && "))
    }

    fn to_init_containers(&self, runtime: &RuntimeImage) -> Result<Vec<Container>, BuildError> {
        let mut containers = vec![Container {
            name: String::from("prepare"),
            image: Some(String::from(PREPARE_IMAGE)),
            command: Some(vec![String::from("sh"), String::from("-c")]),
            args: Some(vec![self.to_prepare_script(runtime)?]),
            volume_mounts: Some(vec![
                self.to_function_volume_mount(),
                VolumeMount {
                    name: self.to_source_volume_name(),
                    mount_path: String::from(SOURCE_VOLUME_PATH),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }];

        if let (Some(_), Some(init_image), Some(install_command)) = (
            self.to_deps_file_name(runtime),
            runtime.init_image.as_ref(),
            runtime.install_command.as_ref(),
        ) {
            containers.push(Container {
                name: String::from("install"),
                image: Some(init_image.clone()),
                command: Some(vec![String::from("sh"), String::from("-c")]),
                args: Some(vec![install_command.clone()]),
                working_dir: Some(String::from(FUNCTION_VOLUME_PATH)),
                volume_mounts: Some(vec![self.to_function_volume_mount()]),
                ..Default::default()
            });
        }

        Ok(containers)
    }

    pub fn to_config_map(
        &self,
        owner: &OwnerReference,
        runtime: &RuntimeImage,
    ) -> Result<ConfigMap, BuildError> {
        let mut data = BTreeMap::new();
        data.insert(String::from("handler"), self.spec.handler.clone());
        data.insert(
            self.to_source_file_name(runtime)?,
            self.spec.function.clone(),
        );
        if let Some(deps) = self.to_deps_file_name(runtime) {
            data.insert(String::from(deps), self.spec.deps.clone());
        }

        Ok(ConfigMap {
            metadata: self.to_meta(self.to_name(), owner)?,
            data: Some(data),
            ..Default::default()
        })
    }

    pub fn to_service(&self, owner: &OwnerReference) -> Result<Service, BuildError> {
        let mut spec: ServiceSpec = self.spec.service.clone();

        spec.selector = Some(self.to_labels());

        if spec.ports.as_ref().map_or(true, Vec::is_empty) {
            spec.ports = Some(vec![ServicePort {
                name: Some(String::from(FUNCTION_PORT_NAME)),
                port: FUNCTION_PORT,
                target_port: Some(IntOrString::Int(FUNCTION_PORT)),
                protocol: Some(String::from("TCP")),
                ..Default::default()
            }]);
        }

        if spec.type_.is_none() {
            spec.type_ = Some(String::from("ClusterIP"));
        }

        Ok(Service {
            metadata: self.to_meta(self.to_name(), owner)?,
            spec: Some(spec),
            ..Default::default()
        })
    }

    /// Generates the deployment from the declared (already merged) deployment override.
    pub fn to_deployment(
        &self,
        owner: &OwnerReference,
        runtime: &RuntimeImage,
    ) -> Result<Deployment, BuildError> {
        let labels = self.to_labels();
        let declared = &self.spec.deployment;

        let mut metadata = self.to_meta(self.to_name(), owner)?;
        metadata.labels = Some(extend_map(declared.metadata.labels.as_ref(), &labels));
        metadata.annotations = declared.metadata.annotations.clone();

        let mut spec: DeploymentSpec = declared.spec.clone().unwrap_or_default();
        spec.replicas = spec.replicas.or(Some(1));
        spec.selector = LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        };

        let mut template_metadata = spec.template.metadata.take().unwrap_or_default();
        template_metadata.labels = Some(extend_map(template_metadata.labels.as_ref(), &labels));
        let mut annotations = self.to_scrape_annotations();
        annotations.extend(template_metadata.annotations.take().unwrap_or_default());
        template_metadata.annotations = Some(annotations);

        let mut pod_spec: PodSpec = spec.template.spec.take().unwrap_or_default();

        let function_container = self.to_function_container(
            pod_spec.containers.first().cloned().unwrap_or_default(),
            runtime,
        )?;
        match pod_spec.containers.first_mut() {
            Some(container) => *container = function_container,
            None => pod_spec.containers.push(function_container),
        }

        let mut init_containers = self.to_init_containers(runtime)?;
        init_containers.extend(pod_spec.init_containers.take().unwrap_or_default());
        pod_spec.init_containers = Some(init_containers);

        let mut volumes = pod_spec.volumes.take().unwrap_or_default();
        for volume in self.to_volumes() {
            if !volumes.iter().any(|existing| existing.name == volume.name) {
                volumes.push(volume);
            }
        }
        pod_spec.volumes = Some(volumes);

        spec.template = PodTemplateSpec {
            metadata: Some(template_metadata),
            spec: Some(pod_spec),
        };

        Ok(Deployment {
            metadata,
            spec: Some(spec),
            ..Default::default()
        })
    }

    /// Merges the cluster-wide deployment defaults into the declared deployment.
    /// Declared values win.
    pub fn merge_deployment_defaults(
        &mut self,
        defaults: &serde_json::Value,
    ) -> Result<(), serde_json::Error> {
        let mut declared = serde_json::to_value(&self.spec.deployment)?;
        merge_missing(&mut declared, defaults);
        self.spec.deployment = serde_json::from_value(declared)?;

        Ok(())
    }

    pub fn to_cron_job_name(&self) -> String {
        cron_job_name(&self.to_name())
    }

    pub fn to_cron_job(&self, owner: &OwnerReference) -> Result<CronJob, BuildError> {
        if self.spec.schedule.is_empty() {
            return Err(BuildError::Schedule);
        }

        let url = format!(
            "http://{}.{}.svc.cluster.local:{}",
            self.to_name(),
            self.to_namespace()?,
            FUNCTION_PORT
        );

        Ok(CronJob {
            metadata: self.to_meta(self.to_cron_job_name(), owner)?,
            spec: Some(CronJobSpec {
                schedule: self.spec.schedule.clone(),
                job_template: JobTemplateSpec {
                    metadata: None,
                    spec: Some(JobSpec {
                        template: PodTemplateSpec {
                            metadata: Some(ObjectMeta {
                                labels: Some(self.to_labels()),
                                ..Default::default()
                            }),
                            spec: Some(PodSpec {
                                containers: vec![Container {
                                    name: String::from("trigger"),
                                    image: Some(String::from(CRON_JOB_IMAGE)),
                                    args: Some(vec![
                                        String::from("wget"),
                                        String::from("-qO-"),
                                        url,
                                    ]),
                                    ..Default::default()
                                }],
                                restart_policy: Some(String::from("Never")),
                                ..Default::default()
                            }),
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    pub fn to_service_monitor(&self, owner: &OwnerReference) -> Result<DynamicObject, BuildError> {
        let metadata = self.to_meta(self.to_name(), owner)?;

        let service_monitor = json!({
            "apiVersion": SERVICE_MONITOR_API_VERSION,
            "kind": SERVICE_MONITOR_KIND,
            "metadata": metadata,
            "spec": {
                "selector": {
                    "matchLabels": { FUNCTION_LABEL: self.to_name() }
                },
                "endpoints": [
                    { "port": FUNCTION_PORT_NAME }
                ]
            }
        });

        Ok(serde_json::from_value(service_monitor)?)
    }

    /// The declared autoscaler, only if it names itself and a scale target.
    pub fn autoscaler_target(&self) -> Option<&HorizontalPodAutoscaler> {
        let autoscaler = &self.spec.horizontal_pod_autoscaler;

        let named = autoscaler
            .metadata
            .name
            .as_deref()
            .map_or(false, |name| !name.is_empty());
        let targeted = autoscaler
            .spec
            .as_ref()
            .map_or(false, |spec| !spec.scale_target_ref.name.is_empty());

        (named && targeted).then_some(autoscaler)
    }

    /// Whether any declared metric is of kind `Object`. An empty metric list is not.
    pub fn has_object_metric(&self) -> bool {
        self.spec
            .horizontal_pod_autoscaler
            .spec
            .as_ref()
            .and_then(|spec| spec.metrics.as_ref())
            .map_or(false, |metrics| {
                metrics.iter().any(|metric| metric.type_ == "Object")
            })
    }

    /// The autoscaler is always named after the function so deletion can find it by name.
    pub fn to_autoscaler(
        &self,
        owner: &OwnerReference,
    ) -> Result<HorizontalPodAutoscaler, BuildError> {
        let mut autoscaler = self.spec.horizontal_pod_autoscaler.clone();

        autoscaler.metadata.name = Some(self.to_name());
        autoscaler.metadata.namespace = Some(self.to_namespace()?);
        autoscaler.metadata.labels = Some(extend_map(
            autoscaler.metadata.labels.as_ref(),
            &self.to_labels(),
        ));
        autoscaler.metadata.owner_references = Some(vec![owner.clone()]);
        autoscaler.status = None;

        Ok(autoscaler)
    }
}

pub fn cron_job_name(function_name: &str) -> String {
    format!("{CRON_JOB_PREFIX}{function_name}")
}
