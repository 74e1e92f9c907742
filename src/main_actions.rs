use crate::{
    config::ControllerConfig,
    controller::{
        queue::WorkQueue,
        resources::KubeResources,
        watch::{FunctionInformer, QueueEventHandler},
        Controller,
    },
    crds::defs::{Function, NAME},
    runtime::Langruntimes,
};
use anyhow::{Context, Ok, Result as AnyResult};
use either::Either::Left;
use k8s_openapi::{
    api::core::v1::ConfigMap,
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{
    api::PostParams,
    runtime::{conditions, wait::await_condition},
    Api, Client as KubeClient, CustomResourceExt, ResourceExt,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{trace_span, Instrument};

async fn load_runtimes(client: KubeClient, config: &ControllerConfig) -> AnyResult<Langruntimes> {
    let config_namespace = &config.config_namespace;
    let config_name = &config.config_name;

    tracing::info!(%config_namespace, %config_name, "Loading runtimes.");

    let api = Api::<ConfigMap>::namespaced(client, config_namespace);
    let config_map = api
        .get(config_name)
        .await
        .context("Failed to get controller config map")?;

    let runtimes =
        Langruntimes::from_config_map(&config_map).context("Failed to load runtimes")?;

    let count = runtimes.runtimes().len();
    tracing::info!(count, "Runtimes loaded.");

    Ok(runtimes)
}

pub async fn run_controller(config: ControllerConfig) -> AnyResult<()> {
    let client = KubeClient::try_default().await?;

    tracing::info!(?config, "Running with current config.");

    let runtimes = load_runtimes(client.clone(), &config)
        .instrument(trace_span!("LoadRuntimes"))
        .await?;

    let api = match config.functions_namespace {
        Some(ref namespace) => Api::<Function>::namespaced(client.clone(), namespace),
        None => Api::<Function>::all(client.clone()),
    };

    let resources = KubeResources::new(
        client,
        config.config_namespace.clone(),
        config.config_name.clone(),
        config.enable_service_monitor,
    );

    let queue = Arc::new(WorkQueue::new(config.backoff()));
    let (informer, cache) = FunctionInformer::new(api, QueueEventHandler::new(queue.clone()));

    let controller = Controller::new(
        Arc::new(cache),
        Arc::new(resources),
        runtimes,
        queue,
        &config,
    );

    controller
        .run(informer.run(), async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "Failed to listen for shutdown signal.");
            }
        })
        .await;

    Ok(())
}

pub fn generate_crd_yaml() -> AnyResult<String> {
    serde_yaml::to_string(&Function::crd()).context("Failed to generate crd")
}

pub fn print_crd() -> AnyResult<()> {
    println!("{}", generate_crd_yaml()?);
    Ok(())
}

pub async fn write_crd_to_file(path: PathBuf) -> AnyResult<()> {
    let crd = generate_crd_yaml()?;
    tokio::fs::write(path, crd)
        .await
        .context("Failed to write crd to file")?;
    Ok(())
}

pub async fn install_crd() -> AnyResult<()> {
    let client = KubeClient::try_default().await?;

    let api = Api::<CustomResourceDefinition>::all(client);
    let _ = api
        .create(&PostParams::default(), &Function::crd())
        .await?;

    await_condition(api, NAME, conditions::is_crd_established()).await?;

    tracing::info!(name = NAME, "Crd installed.");

    Ok(())
}

pub async fn uninstall_crd() -> AnyResult<()> {
    let client = KubeClient::try_default().await?;

    let api = Api::<CustomResourceDefinition>::all(client);

    let obj = api.delete(NAME, &Default::default()).await?;
    if let Left(o) = obj {
        match o.uid() {
            Some(uid) => {
                await_condition(api, NAME, conditions::is_deleted(&uid)).await?;
            }
            None => {
                tracing::warn!("Could not find crd's uid");
            }
        }
    }

    tracing::info!(name = NAME, "Crd uninstalled.");

    Ok(())
}
