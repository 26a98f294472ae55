use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use voxbus_client::{BusClient, RemoteClient, RemoteOptions};
use voxbus_core::config::Config;
use voxbus_core::{ClearOutcome, Decision, Priority, Proposal, SourceId, StateChange, StateKey};
use voxbus_gateway::{GatewayState, start_gateway};
use voxbus_state::{SnapshotFile, StateBus, snapshot};

mod logging;

#[derive(Parser)]
#[command(
    name = "voxbus",
    about = "Priority-gated shared state bus for voice assistant components",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Gateway WebSocket URL (default: from config)
    #[arg(long, global = true)]
    url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bus and its gateway
    Serve {
        /// Port to listen on (default: 6390)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print the current entry for a key
    Get { key: String },

    /// Propose a value for a key
    Propose {
        key: String,
        /// JSON value; anything that does not parse as JSON is sent as a string
        value: String,
        #[arg(long)]
        source: SourceId,
        #[arg(long, default_value_t = 0)]
        priority: Priority,
    },

    /// Clear a key
    Clear {
        key: String,
        #[arg(long, default_value = "system")]
        source: SourceId,
    },

    /// Stream changes for keys matching a glob pattern
    Watch {
        #[arg(default_value = "*")]
        pattern: String,
        /// Print current state before live changes
        #[arg(long)]
        replay: bool,
    },

    /// Rule set management
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum RulesAction {
    /// Validate the configured rules and print them
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose);

    let url = cli.url;
    let options = |config: &Config| remote_options(config, url.as_deref());

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Get { key } => {
            let client = RemoteClient::connect(options(&config)).await?;
            match client.get(&StateKey::new(key.clone())).await? {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => println!("{key}: not set"),
            }
        }
        Commands::Propose {
            key,
            value,
            source,
            priority,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            let client = RemoteClient::connect(options(&config)).await?;
            match client
                .propose(Proposal::new(key.as_str(), value, source, priority))
                .await?
            {
                Decision::Accepted { entry } => {
                    println!("accepted: {} v{}", entry.key, entry.version)
                }
                Decision::Rejected { reason } => println!("rejected: {reason}"),
            }
        }
        Commands::Clear { key, source } => {
            let client = RemoteClient::connect(options(&config)).await?;
            match client.clear(&StateKey::new(key.clone()), source).await? {
                ClearOutcome::Cleared { version } => println!("cleared: {key} v{version}"),
                ClearOutcome::NotSet => println!("{key}: not set"),
                ClearOutcome::Rejected { reason } => println!("rejected: {reason}"),
            }
        }
        Commands::Watch { pattern, replay } => {
            let client = RemoteClient::connect(options(&config)).await?;
            let mut stream = client.subscribe(&pattern, replay).await?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    next = stream.next() => match next {
                        Some(change) => print_change(&change)?,
                        None => break,
                    },
                }
            }
        }
        Commands::Rules {
            action: RulesAction::Check,
        } => rules_check(&config)?,
        Commands::Status => status(&config, &config_path, url.as_deref()).await?,
    }

    Ok(())
}

fn remote_options(config: &Config, url: Option<&str>) -> RemoteOptions {
    let mut options = RemoteOptions::from_config(config).with_client_id("voxbus-cli");
    if let Some(url) = url {
        options.url = url.to_string();
    }
    options
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        warn!("{w}");
    }
    if !errors.is_empty() {
        for e in &errors {
            error!("{e}");
        }
        anyhow::bail!("Invalid configuration ({} error(s))", errors.len());
    }

    let registry = config.registry()?;
    let bus_config = config.bus();
    let bus = Arc::new(StateBus::new(registry, bus_config.channel_capacity));
    info!(keys = bus.registry().len(), "Rule set loaded");

    let cancel = CancellationToken::new();
    let writer = match bus_config.snapshot_path() {
        Some(path) => {
            let file = SnapshotFile::new(path);
            snapshot::restore(&bus, &file).await?;
            Some(snapshot::spawn_writer(
                bus.clone(),
                file,
                Duration::from_millis(bus_config.snapshot_debounce_ms),
                cancel.clone(),
            ))
        }
        None => None,
    };

    let port = port.unwrap_or_else(|| config.gateway_port());
    let state = Arc::new(GatewayState::new(Arc::new(config), bus));
    let result = start_gateway(state, port).await;

    cancel.cancel();
    if let Some(writer) = writer {
        let _ = writer.await;
    }
    result
}

fn print_change(change: &StateChange) -> anyhow::Result<()> {
    match change {
        StateChange::Updated { entry } => println!(
            "{} v{} = {} ({} @ {})",
            entry.key,
            entry.version,
            serde_json::to_string(&entry.value)?,
            entry.source,
            entry.priority
        ),
        StateChange::Cleared {
            key,
            source,
            version,
            ..
        } => println!("{key} v{version} cleared by {source}"),
    }
    Ok(())
}

fn rules_check(config: &Config) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        println!("warning: {w}");
    }
    for e in &errors {
        println!("error: {e}");
    }

    let registry = config.registry()?;
    for (key, policy) in registry.iter() {
        let sources: Vec<&str> = policy.allowed_sources().iter().map(|s| s.as_str()).collect();
        let allow_if = policy
            .allow_if()
            .map(|v| format!(" allow_if={v}"))
            .unwrap_or_default();
        println!(
            "{key}: [{}] min_priority={}{allow_if}",
            sources.join(", "),
            policy.min_priority()
        );
    }

    if !errors.is_empty() {
        anyhow::bail!("{} error(s) in configuration", errors.len());
    }
    println!("{} rule(s) OK", registry.len());
    Ok(())
}

/// `/health` endpoint of the gateway serving `gateway_url`.
fn health_url(gateway_url: &str) -> anyhow::Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(gateway_url)
        .with_context(|| format!("Invalid gateway URL: {gateway_url}"))?;
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Unsupported gateway URL: {gateway_url}"))?;
    if url.host_str() == Some("0.0.0.0") {
        url.set_host(Some("127.0.0.1"))?;
    }
    url.set_path("/health");
    url.set_query(None);
    Ok(url)
}

async fn status(
    config: &Config,
    config_path: &std::path::Path,
    url: Option<&str>,
) -> anyhow::Result<()> {
    let gateway = url.map(str::to_string).unwrap_or_else(|| config.gateway_url());
    println!("voxbus v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Gateway: {gateway}");
    println!("Rules: {}", config.rules.len());

    let health_url = health_url(&gateway)?;
    let health = async { reqwest::get(health_url).await?.json::<serde_json::Value>().await };
    match tokio::time::timeout(Duration::from_secs(3), health).await {
        Ok(Ok(body)) => {
            println!("Status: running");
            println!("Connections: {}", body["connections"]);
            println!("Subscriptions: {}", body["subscriptions"]);
            println!("Changes published: {}", body["published"]);
        }
        _ => println!("Status: not running"),
    }
    Ok(())
}
