use crate::consts::RUNTIME_IMAGES_KEY;
use itertools::Itertools;
use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum RuntimeError {
    #[error("Config map has no {0:?} entry")]
    MissingEntry(&'static str),
    #[error("Failed to parse runtime config: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Invalid runtime identifier {0:?}")]
    Identifier(String),
    #[error("Runtime {id:?} is not supported. Available runtimes: {available}")]
    UnknownRuntime { id: String, available: String },
    #[error("Version {version:?} of runtime {id:?} is not supported. Available versions: {available}")]
    UnknownVersion {
        id: String,
        version: String,
        available: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub versions: Vec<RuntimeVersion>,
    #[serde(default)]
    pub dep_name: Option<String>,
    #[serde(default)]
    pub file_name_suffix: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersion {
    pub name: String,
    pub version: String,
    pub runtime_image: String,
    #[serde(default)]
    pub init_image: Option<String>,
    /// Shell command installing the deps file, run in the init image
    #[serde(default)]
    pub install_command: Option<String>,
    /// Overrides the image's entrypoint
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Everything the builders need to know about a function's runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeImage {
    pub image: String,
    pub init_image: Option<String>,
    pub install_command: Option<String>,
    pub command: Option<Vec<String>>,
    pub deps_file_name: Option<String>,
    pub file_name_suffix: String,
}

/// Runtimes supported by the cluster, loaded once from the controller config map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Langruntimes {
    runtimes: Vec<RuntimeInfo>,
}

impl Langruntimes {
    pub fn new(runtimes: Vec<RuntimeInfo>) -> Self {
        Self { runtimes }
    }

    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        let runtimes = serde_json::from_str(json).map_err(RuntimeError::Parse)?;
        Ok(Self::new(runtimes))
    }

    pub fn from_config_map(config_map: &ConfigMap) -> Result<Self, RuntimeError> {
        let json = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(RUNTIME_IMAGES_KEY))
            .ok_or(RuntimeError::MissingEntry(RUNTIME_IMAGES_KEY))?;

        Self::from_json(json)
    }

    pub fn runtimes(&self) -> &[RuntimeInfo] {
        &self.runtimes
    }

    /// Resolves an identifier like `python3.8` or `nodejs16`.
    pub fn resolve(&self, runtime: &str) -> Result<RuntimeImage, RuntimeError> {
        let (id, version) = split_runtime(runtime)?;

        let info = self
            .runtimes
            .iter()
            .find(|info| info.id == id)
            .ok_or_else(|| RuntimeError::UnknownRuntime {
                id: id.to_string(),
                available: self.runtimes.iter().map(|info| &info.id).join(", "),
            })?;

        let image_version = info
            .versions
            .iter()
            .find(|v| v.version == version)
            .ok_or_else(|| RuntimeError::UnknownVersion {
                id: id.to_string(),
                version: version.to_string(),
                available: info.versions.iter().map(|v| &v.version).join(", "),
            })?;

        Ok(RuntimeImage {
            image: image_version.runtime_image.clone(),
            init_image: image_version.init_image.clone(),
            install_command: image_version.install_command.clone(),
            command: image_version.command.clone(),
            deps_file_name: info.dep_name.clone().filter(|name| !name.is_empty()),
            file_name_suffix: info.file_name_suffix.clone(),
        })
    }
}

/// Splits `python3.8` into `("python", "3.8")` at the first digit.
fn split_runtime(runtime: &str) -> Result<(&str, &str), RuntimeError> {
    match runtime.find(|c: char| c.is_ascii_digit()) {
        Some(index) if index > 0 => Ok(runtime.split_at(index)),
        _ => Err(RuntimeError::Identifier(runtime.to_string())),
    }
}
