//! provisord: the provisor daemon.
//!
//! Single binary that assembles the provisioning control plane:
//! - State store (redb)
//! - Node registry + health sweeper
//! - Instance ledger
//! - Orchestrator, restart recovery and reconciler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! provisord serve --config /etc/provisor/provisor.toml --port 8600
//! provisord check-config --config /etc/provisor/provisor.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use provisor_core::ProvisorConfig;

mod daemon;
mod node_channel;
mod settings;

use settings::Settings;

#[derive(Parser)]
#[command(name = "provisord", about = "provisor daemon", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Serve {
        /// Path to provisor.toml. Built-in defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides server.port).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides server.data_dir).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Answer node commands in memory instead of contacting nodes.
        #[arg(long)]
        simulate_nodes: bool,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,provisord=debug,provisor=debug"))?;
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            simulate_nodes,
        } => {
            let config = load_config(config.as_deref())?;
            let settings = Settings::from_config(&config)?
                .with_port(port)
                .with_data_dir(data_dir);
            daemon::run(settings, simulate_nodes).await
        }
        Command::CheckConfig { config } => {
            let config = ProvisorConfig::from_file(&config)?;
            Settings::from_config(&config)?;
            print!("{}", config.to_toml_string()?);
            eprintln!("configuration ok");
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<ProvisorConfig> {
    match path {
        Some(path) => ProvisorConfig::from_file(path),
        None => Ok(ProvisorConfig::default()),
    }
}
