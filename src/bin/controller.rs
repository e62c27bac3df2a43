//! Controller daemon binary

use clap::{Parser, Subcommand};
use ovs_control::clients::sim::SimCluster;
use ovs_control::{Controller, ControllerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ovs-controller")]
#[command(about = "Open vStorage volume-placement and metadata-safety controller")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller daemon
    Serve {
        /// Configuration file
        #[arg(long, default_value = ovs_control::common::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Bind address for the HTTP API (overrides the configuration file)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// DAL directory; serves the admin API and runs the checkups
        #[arg(long)]
        dal: Option<PathBuf>,

        /// Talk to an in-process simulated cluster instead of real hosts
        #[arg(long)]
        simulate: bool,
    },

    /// Print the effective configuration
    Config {
        #[arg(long, default_value = ovs_control::common::config::DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            dal,
            simulate,
        } => {
            let mut config = ControllerConfig::load(Some(&config))?;
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            // CLI has priority over the file
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if dal.is_some() {
                config.dal_path = dal;
            }
            let controller = if simulate {
                Controller::simulated(config, SimCluster::new())
            } else {
                Controller::new(config)
            };
            controller.serve().await?;
        }

        Commands::Config { config } => {
            let config = ControllerConfig::load(Some(&config))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
