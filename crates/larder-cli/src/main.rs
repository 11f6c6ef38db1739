mod config;
mod stack;

use clap::{Parser, Subcommand};
use config::LarderConfig;
use larder_core::telemetry::init_tracing;
use larder_gateway::GatewayServer;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "larder", about = "Larder: agent dispatch and realtime delivery")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "larder.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Inspect registered agents
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Validate the config and agent registry, then exit
    Check,
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List registered agents
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = LarderConfig::load(&cli.config).await?;
    init_tracing(&config.logging.filter, config.logging.json)?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            let state = stack::build_state(&config)?;
            let _background =
                GatewayServer::spawn_background(&state, config.metrics.sample_interval());
            let app = GatewayServer::build(state);

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(addr = %addr, "Larder gateway listening");
            axum::serve(listener, app).await?;
        }
        Commands::Agents { action } => match action {
            AgentsAction::List => {
                let registry = config.build_registry()?;
                let default = registry.default_agent().map(|d| d.name.clone());
                println!("Registered agents:");
                for agent in registry.descriptors() {
                    let mut flags = Vec::new();
                    if default.as_deref() == Some(agent.name.as_str()) {
                        flags.push("default".to_string());
                    }
                    if agent.defaults.long_running {
                        flags.push("queued".to_string());
                    }
                    flags.push(format!("timeout {}s", agent.defaults.timeout.as_secs()));
                    println!("  {}: {} [{}]", agent.name, agent.description, flags.join(", "));
                    if !agent.aliases.is_empty() {
                        println!("    aliases: {}", agent.aliases.join(", "));
                    }
                }
                let intents = registry.intents();
                if !intents.is_empty() {
                    println!("\nIntents:");
                    for (intent, agent) in &intents {
                        println!("  {intent} -> {agent}");
                    }
                }
                println!("\nTotal: {} agent(s)", registry.len());
            }
        },
        Commands::Check => {
            let registry = stack::check(&config)?;
            println!(
                "{}: OK ({} agents, {:?} dispatch)",
                cli.config.display(),
                registry.len(),
                config.orchestrator.mode
            );
        }
    }

    Ok(())
}
