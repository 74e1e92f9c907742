use clap::Parser;
use kubeless_functions_operato_rs::{
    cli::{Cli, Commands, CrdCommands},
    config::ControllerConfig,
    main_actions::{install_crd, print_crd, run_controller, uninstall_crd, write_crd_to_file},
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "kubeless_functions_operato_rs=info,kube=warn");
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_level(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_controller(ControllerConfig::from(args)).await?,
        Commands::Crd { command } => match command {
            CrdCommands::Write { file } => write_crd_to_file(file).await?,
            CrdCommands::Print {} => print_crd()?,
            CrdCommands::Install {} => install_crd().await?,
            CrdCommands::Uninstall {} => uninstall_crd().await?,
        },
    }

    Ok(())
}
