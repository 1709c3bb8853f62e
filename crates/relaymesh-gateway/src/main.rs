use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relaymesh_protocol::{ApiBridge, GateRelay, GatewayConfig, GatewayKeys};
use relaymesh_transport::{InterfaceRegistry, MemoryHub};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "relaymesh-gateway", about = "relaymesh Gateway daemon")]
struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Operator bridge address, overrides the configuration file.
    #[arg(long)]
    api_bridge: Option<String>,

    /// Key file, created on first start.
    #[arg(long)]
    keys: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Gateway until interrupted (default).
    Run,
    /// Print the values nodes of this deployment are built with.
    Keys,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::new(),
    };
    if let Some(address) = cli.api_bridge {
        config = config.api_bridge_address(address);
    }
    if let Some(keys) = cli.keys {
        config = config.keys_file(keys);
    }
    let keys = GatewayKeys::load_or_generate(&config.keys_file)
        .with_context(|| format!("loading keys from {}", config.keys_file.display()))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Keys => {
            let build = json!({
                "PublicSignature": keys.public_signature.to_hex(),
                "BroadcastKey": keys.broadcast_key.to_hex(),
            });
            println!("{}", serde_json::to_string_pretty(&build)?);
            Ok(())
        }
        Command::Run => run(config, keys).await,
    }
}

async fn run(config: GatewayConfig, keys: GatewayKeys) -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let mut registry = InterfaceRegistry::new();
    hub.register(&mut registry);

    let gate = GateRelay::new(&config, &keys, Arc::new(registry))?;
    let bridge = ApiBridge::bind(&config.api_bridge_address)
        .await
        .with_context(|| format!("binding the api bridge on {}", config.api_bridge_address))?;

    eprintln!("relaymesh-gateway v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Agent: {}", gate.agent_id());
    eprintln!("API bridge: {}", bridge.local_addr()?);

    let cancel = CancellationToken::new();
    let server = tokio::spawn(bridge.serve(gate.clone(), cancel.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    server.await?;
    gate.shutdown().await;
    gate.join().await;
    Ok(())
}
