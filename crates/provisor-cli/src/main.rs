//! provisorctl: command-line client for provisord.
//!
//! The test-harness verbs (`create-test`, `verify-test`) are matched first
//! and talk to the server named by `PROVISOR_SERVER`; everything else is
//! parsed by clap.

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use serde_json::{Map, Value, json};

mod client;
mod commands;
mod harness;

use client::ApiClient;
use commands::api::{capacity, parse_attribute, parse_option};
use commands::servicetest;
use harness::{CommandTable, Dispatch, HarnessAction};

const DEFAULT_SERVER: &str = "127.0.0.1:8600";

#[derive(Parser)]
#[command(
    name = "provisorctl",
    about = "provisor: service provisioning control plane",
    version,
    propagate_version = true,
)]
struct Cli {
    /// provisord address (host:port).
    #[arg(long, global = true, default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage service instances
    Instances {
        #[command(subcommand)]
        action: InstanceAction,
    },
    /// Inspect and announce nodes
    Nodes {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Create a binding on an instance
    Bind {
        id: String,
        /// Binding option as key=value (repeatable).
        #[arg(short = 'o', long = "option", value_parser = parse_option)]
        options: Vec<(String, String)>,
    },
    /// Revoke a binding
    Unbind { id: String, binding_id: String },
    /// List the bindings of an instance
    Bindings { id: String },
    /// Show instance and node counters
    Stats,
    /// Run a reconcile pass now
    Reconcile,
}

#[derive(Subcommand)]
enum InstanceAction {
    List,
    Get { id: String },
    /// Provision an instance.
    Provision {
        id: String,
        #[arg(long, default_value = "provisorctl")]
        requester: String,
        #[arg(long)]
        memory: Option<u64>,
        /// Extra capacity attribute as name=value (repeatable).
        #[arg(long = "attr", value_parser = parse_attribute)]
        attrs: Vec<(String, u64)>,
        /// Scoring strategy: available_memory or fewest_instances.
        #[arg(long)]
        strategy: Option<String>,
        /// Node to keep the instance off (repeatable).
        #[arg(long)]
        avoid: Vec<String>,
    },
    Unprovision { id: String },
}

#[derive(Subcommand)]
enum NodeAction {
    List,
    Get { id: String },
    /// Announce a node and its capacity.
    Register {
        id: String,
        address: String,
        #[arg(long)]
        memory: Option<u64>,
        #[arg(long = "attr", value_parser = parse_attribute)]
        attrs: Vec<(String, u64)>,
        /// Take over the identity even if a healthy node holds it.
        #[arg(long)]
        replace: bool,
    },
    /// Send a heartbeat, optionally reporting new capacity.
    Heartbeat {
        id: String,
        #[arg(long)]
        memory: Option<u64>,
        #[arg(long = "attr", value_parser = parse_attribute)]
        attrs: Vec<(String, u64)>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("provisorctl=info".parse()?),
        )
        .init();

    let table = CommandTable::with_service_tests();
    let args: Vec<String> = std::env::args().skip(1).collect();
    match table.dispatch(&args) {
        Dispatch::Run { action, args } => {
            let server = std::env::var("PROVISOR_SERVER").unwrap_or_else(|_| DEFAULT_SERVER.to_string());
            let app = args.first().map(String::as_str).unwrap_or_default();
            return run_harness(&ApiClient::new(server), action, app).await;
        }
        Dispatch::Usage(usage) => {
            eprintln!("Usage: {usage}");
            std::process::exit(2);
        }
        Dispatch::FallThrough => {}
    }

    let matches = Cli::command().after_help(table.help_section()).get_matches();
    let cli = Cli::from_arg_matches(&matches)?;
    let client = ApiClient::new(cli.server);

    match cli.command {
        Commands::Instances { action } => match action {
            InstanceAction::List => commands::api::get(&client, "/instances").await,
            InstanceAction::Get { id } => commands::api::get(&client, &format!("/instances/{id}")).await,
            InstanceAction::Provision {
                id,
                requester,
                memory,
                attrs,
                strategy,
                avoid,
            } => {
                let mut hints = Map::new();
                if let Some(strategy) = strategy {
                    hints.insert("strategy".into(), json!(strategy));
                }
                if !avoid.is_empty() {
                    hints.insert("avoid_nodes".into(), json!(avoid));
                }
                let body = json!({
                    "instance_id": id,
                    "requester": requester,
                    "profile": capacity(memory, &attrs),
                    "hints": Value::Object(hints),
                });
                commands::api::post(&client, "/instances", Some(body)).await
            }
            InstanceAction::Unprovision { id } => {
                commands::api::delete(&client, &format!("/instances/{id}")).await
            }
        },
        Commands::Nodes { action } => match action {
            NodeAction::List => commands::api::get(&client, "/nodes").await,
            NodeAction::Get { id } => commands::api::get(&client, &format!("/nodes/{id}")).await,
            NodeAction::Register {
                id,
                address,
                memory,
                attrs,
                replace,
            } => {
                let body = json!({
                    "node_id": id,
                    "address": address,
                    "capacity": capacity(memory, &attrs),
                    "replace": replace,
                });
                commands::api::post(&client, "/nodes", Some(body)).await
            }
            NodeAction::Heartbeat { id, memory, attrs } => {
                let body = (memory.is_some() || !attrs.is_empty())
                    .then(|| json!({ "capacity": capacity(memory, &attrs) }));
                commands::api::post(&client, &format!("/nodes/{id}/heartbeat"), body).await
            }
        },
        Commands::Bind { id, options } => {
            let options: Map<String, Value> = options.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            let body = json!({ "options": options });
            commands::api::post(&client, &format!("/instances/{id}/bindings"), Some(body)).await
        }
        Commands::Unbind { id, binding_id } => {
            commands::api::delete(&client, &format!("/instances/{id}/bindings/{binding_id}")).await
        }
        Commands::Bindings { id } => commands::api::get(&client, &format!("/instances/{id}/bindings")).await,
        Commands::Stats => commands::api::get(&client, "/stats").await,
        Commands::Reconcile => commands::api::post(&client, "/reconcile", None).await,
    }
}

async fn run_harness(client: &ApiClient, action: HarnessAction, app: &str) -> anyhow::Result<()> {
    let checks = match action {
        HarnessAction::CreateTest => {
            println!("Creating test services for {app} on {}", client.address());
            servicetest::create(client, app).await?
        }
        HarnessAction::VerifyTest => {
            println!("Verifying test services for {app} on {}", client.address());
            servicetest::verify(client, app).await?
        }
    };
    let failed = servicetest::print_report(&checks);
    if failed > 0 {
        anyhow::bail!("{failed} of {} service checks failed", checks.len());
    }
    Ok(())
}
