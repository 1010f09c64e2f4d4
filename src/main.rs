// file: src/main.rs
// version: 2.1.0
// guid: h8i9j0k1-l2m3-4567-8901-234567hijklm

//! Turing Pi provisioner - main entry point

use clap::Parser;
use tokio_util::sync::CancellationToken;
use turingpi_provisioner::{
    cli::{args::Cli, args::Commands, commands::*},
    container::{cancel_on_signal, cleanup_all, install_signal_handler, signal_received, SIGNAL_EXIT_CODE},
    logging,
    platform::SystemProbe,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        logging::init_json_logger()?;
    } else {
        logging::init_logger(cli.verbose, cli.quiet)?;
    }

    // Interrupt and terminate cancel the running command, wait for its
    // releases, remove our containers and exit with 130
    install_signal_handler();
    let cancel = CancellationToken::new();
    let scope = cancel_on_signal(&cancel);

    let result = match cli.command {
        Commands::Platform => platform_command(&SystemProbe::new()).await,
        Commands::Cache { remote, action } => {
            let config = logging::with_operation_span("load-config", || load_config(cli.config.as_deref()))?;
            logging::with_async_operation_span("cache", || cache_command(&config, remote, action, &cancel)).await
        }
        Commands::Deploy(args) => {
            let config = logging::with_operation_span("load-config", || load_config(cli.config.as_deref()))?;
            let node = args.node;
            logging::with_async_operation_span(&format!("deploy-node{}", node), || {
                deploy_command(config, args, &cancel)
            })
            .await
        }
    };

    drop(scope);
    cleanup_all().await;
    if signal_received() {
        std::process::exit(SIGNAL_EXIT_CODE);
    }
    result?;
    Ok(())
}
