use k8s_openapi::api::{
    apps::v1::Deployment, autoscaling::v2::HorizontalPodAutoscaler, core::v1::ServiceSpec,
};
use kube::CustomResource;
use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use super::embedded;
use crate::runtime::RuntimeError;

pub const GROUP: &str = "kubeless.io";
pub const KIND: &str = "Function";
pub const NAME: &str = "functions.kubeless.io";

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[kube(
    group = "kubeless.io",
    version = "v1beta1",
    kind = "Function",
    plural = "functions",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// handler is the entrypoint of the function, in the form `module.function`
    #[serde(default)]
    pub handler: String,

    /// function is the source code of the function
    #[serde(default)]
    pub function: String,

    /// functionContentType is how the source is encoded: `text`, `base64` or `url`
    #[serde(default, rename = "function-content-type")]
    pub function_content_type: String,

    #[serde(default)]
    pub checksum: String,

    /// runtime is the language/runtime identifier, e.g. `python3.8`
    #[serde(default)]
    pub runtime: String,

    /// timeout in seconds for a single invocation
    #[serde(default)]
    pub timeout: String,

    /// deps is the content of the runtime's dependency file
    #[serde(default)]
    pub deps: String,

    #[serde(default, rename = "type")]
    pub trigger_type: TriggerType,

    /// topic for `PubSub` functions
    #[serde(default)]
    pub topic: String,

    /// cron-like schedule for `Scheduled` functions
    #[serde(default)]
    pub schedule: String,

    /// how the function is exposed
    #[serde(default)]
    pub service: ServiceSpec,

    /// deployment shape override
    #[serde(default, deserialize_with = "embedded::deserialize")]
    pub deployment: Deployment,

    #[serde(default, deserialize_with = "embedded::deserialize_autoscaler")]
    pub horizontal_pod_autoscaler: HorizontalPodAutoscaler,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum TriggerType {
    #[default]
    #[serde(rename = "HTTP")]
    Http,
    PubSub,
    #[serde(alias = "Schedule")]
    Scheduled,
}

impl TriggerType {
    /// Every accepted spelling, aliases included.
    pub const NAMES: [&'static str; 4] = ["HTTP", "PubSub", "Scheduled", "Schedule"];
}

// The derived schema leaves out serde aliases, which the API server would then reject.
impl JsonSchema for TriggerType {
    fn schema_name() -> String {
        String::from("TriggerType")
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        Schema::Object(SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            enum_values: Some(Self::NAMES.iter().map(|name| (*name).into()).collect()),
            ..Default::default()
        })
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Http => write!(f, "HTTP"),
            TriggerType::PubSub => write!(f, "PubSub"),
            TriggerType::Scheduled => write!(f, "Scheduled"),
        }
    }
}

#[derive(ThisError, Debug)]
pub enum BuildError {
    #[error("Function has no namespace")]
    Namespace,
    #[error("Invalid handler {0:?}, expected `module.function`")]
    Handler(String),
    #[error("Scheduled function has no schedule")]
    Schedule,
    #[error("Failed to resolve runtime: {0}")]
    Runtime(
        #[from]
        #[source]
        RuntimeError,
    ),
    #[error("Failed to serialize resource: {0}")]
    Serialization(
        #[from]
        #[source]
        serde_json::Error,
    ),
}
