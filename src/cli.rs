use std::path::PathBuf;

use crate::{
    config::ControllerConfig,
    consts::{
        API_DEFAULT_TIMEOUT_SECS, API_TIMEOUT_ENV_VAR, BACKOFF_BASE_ENV_VAR, BACKOFF_MAX_ENV_VAR,
        CONFIG_DEFAULT_NAME, CONFIG_DEFAULT_NAMESPACE, CONFIG_NAMESPACE_ENV_VAR,
        CONFIG_NAME_ENV_VAR, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_SECS,
        DEFAULT_MAX_RETRIES, FUNCTIONS_NAMESPACE_ENV_VAR, MAX_RETRIES_ENV_VAR,
        SERVICE_MONITOR_ENV_VAR,
    },
};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the Kubeless functions controller
    #[clap(visible_alias = "r")]
    Run(RunArgs),
    /// Custom definition resource (CRD) commands
    #[clap(visible_alias = "c")]
    Crd {
        #[command(subcommand)]
        command: CrdCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// The namespace to watch for functions. All namespaces if not set
    #[clap(short = 'n', long, env = FUNCTIONS_NAMESPACE_ENV_VAR)]
    pub namespace: Option<String>,
    /// The namespace of the controller config map
    #[clap(long, env = CONFIG_NAMESPACE_ENV_VAR, default_value = CONFIG_DEFAULT_NAMESPACE)]
    pub config_namespace: String,
    /// The name of the controller config map
    #[clap(long, env = CONFIG_NAME_ENV_VAR, default_value = CONFIG_DEFAULT_NAME)]
    pub config_name: String,
    /// Deadline in seconds for every Kubernetes API call
    #[clap(long, env = API_TIMEOUT_ENV_VAR, default_value_t = API_DEFAULT_TIMEOUT_SECS)]
    pub api_timeout_secs: u64,
    /// How many times a failing function is retried before it is dropped
    #[clap(long, env = MAX_RETRIES_ENV_VAR, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    /// First retry delay in milliseconds
    #[clap(long, env = BACKOFF_BASE_ENV_VAR, default_value_t = DEFAULT_BACKOFF_BASE_MS)]
    pub backoff_base_ms: u64,
    /// Maximum retry delay in seconds
    #[clap(long, env = BACKOFF_MAX_ENV_VAR, default_value_t = DEFAULT_BACKOFF_MAX_SECS)]
    pub backoff_max_secs: u64,
    /// Manage Prometheus service monitors for autoscalers using object metrics
    #[clap(long, env = SERVICE_MONITOR_ENV_VAR)]
    pub enable_service_monitor: bool,
}

impl From<RunArgs> for ControllerConfig {
    fn from(args: RunArgs) -> Self {
        Self {
            functions_namespace: args.namespace.filter(|namespace| !namespace.is_empty()),
            config_namespace: args.config_namespace,
            config_name: args.config_name,
            api_timeout: Duration::from_secs(args.api_timeout_secs),
            max_retries: args.max_retries,
            backoff_base: Duration::from_millis(args.backoff_base_ms),
            backoff_max: Duration::from_secs(args.backoff_max_secs),
            enable_service_monitor: args.enable_service_monitor,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum CrdCommands {
    /// Writes the CRD to a file
    #[clap(visible_alias = "w")]
    Write {
        /// The path to the file to write the CRD to
        #[clap(short, long)]
        file: PathBuf,
    },
    /// Prints the CRD to stdout
    #[clap(visible_alias = "p")]
    Print {},
    /// Installs the CRD to the cluster
    #[clap(visible_alias = "in")]
    Install {},
    /// Uninstalls the CRD from the cluster
    #[clap(visible_alias = "un")]
    Uninstall {},
}
