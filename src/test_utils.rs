use crate::controller::keys;
use crate::crds::{Function, FunctionSpec};
use crate::runtime::{Langruntimes, RuntimeImage, RuntimeInfo, RuntimeVersion};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

/// A persisted python Function whose handler module is named after it.
pub fn function(namespace: &str, name: &str) -> Function {
    let mut function = Function::new(
        name,
        FunctionSpec {
            handler: format!("{name}.handler"),
            function: String::from("def handler(event, context):\n    return 'hello'\n"),
            runtime: String::from("python3.8"),
            ..Default::default()
        },
    );
    function.metadata.namespace = Some(namespace.to_string());
    function.metadata.uid = Some(format!("uid-{name}"));
    function
}

pub fn autoscaled_function(namespace: &str, name: &str, metric_type: &str) -> Function {
    let mut function = function(namespace, name);
    function.spec.horizontal_pod_autoscaler = HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some(String::from("apps/v1")),
                kind: String::from("Deployment"),
                name: name.to_string(),
            },
            min_replicas: Some(1),
            max_replicas: 3,
            metrics: Some(vec![MetricSpec {
                type_: metric_type.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    function
}

pub fn runtimes() -> Langruntimes {
    Langruntimes::new(vec![RuntimeInfo {
        id: String::from("python"),
        versions: vec![RuntimeVersion {
            name: String::from("python38"),
            version: String::from("3.8"),
            runtime_image: String::from("kubeless/python:3.8"),
            init_image: Some(String::from("python:3.8")),
            install_command: Some(String::from(
                "pip install --prefix=/kubeless -r /kubeless/requirements.txt",
            )),
            command: None,
        }],
        dep_name: Some(String::from("requirements.txt")),
        file_name_suffix: String::from(".py"),
    }])
}

pub fn runtime_image() -> RuntimeImage {
    runtimes().resolve("python3.8").unwrap()
}

pub fn owner_reference(function: &Function) -> OwnerReference {
    keys::owner_reference(function).unwrap()
}
