//! studio-relay CLI: run the relay, publish test events, watch a project.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use studio_relay::broker::{self, Publisher};
use studio_relay::config::Config;
use studio_relay::config::TierTable;
use studio_relay::config::secrets::redacted_url;
use studio_relay::dispatcher::TaskDispatcher;
use studio_relay::event::Envelope;
use studio_relay::model::{NodeId, ProjectId};
use studio_relay::relay::{PubSubRelay, RelaySettings};
use studio_relay::server::{self, AnyProject, AppState, DirectoryProjects, ProjectStore, ServerSettings};
use studio_relay::session::{self, SessionConfig};
use studio_relay::telemetry::{TelemetryConfig, init_telemetry};
use studio_relay::worker::{CommandWorker, SimulatedWorker, Worker};
use tracing::info;

#[derive(Parser)]
#[command(name = "studio-relay", about = "Real-time task and event relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server
    Serve {
        /// Listen address (overrides RELAY_BIND_ADDR)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Publish an event to a project channel, as a worker would
    Publish {
        /// Project id
        project: String,
        /// Envelope type, e.g. task.progress
        event_type: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Connect to a project socket and print events
    Watch {
        /// ws://host:port/ws/projects/<project>
        url: String,
        /// Only receive events for these nodes
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
    /// Print the quality tier table
    Tiers {
        /// Tier TOML file (defaults to RELAY_TIERS_FILE, else built-in)
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind } => cmd_serve(bind).await,
        Command::Publish {
            project,
            event_type,
            payload,
        } => cmd_publish(project, event_type, payload).await,
        Command::Watch { url, nodes } => cmd_watch(url, nodes).await,
        Command::Tiers { file } => cmd_tiers(file),
    }
}

async fn cmd_serve(bind: Option<SocketAddr>) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::new(
        config.otel_endpoint.clone(),
        config.log_level.clone(),
    ))?;

    info!(broker = %redacted_url(&config.broker_url), "connecting to broker");
    let broker = broker::connect(&config.broker_url).await?;
    let tiers = config.load_tiers()?;

    let worker: Arc<dyn Worker> = match &config.worker_command {
        Some(program) => {
            info!(program = %program.display(), "using command worker");
            Arc::new(CommandWorker::new(program))
        }
        None => {
            info!("using simulated worker");
            Arc::new(SimulatedWorker::default())
        }
    };
    let projects: Arc<dyn ProjectStore> = match &config.projects_root {
        Some(root) => Arc::new(DirectoryProjects::new(root)),
        None => Arc::new(AnyProject),
    };

    let (relay, registry) = PubSubRelay::start(Arc::clone(&broker), RelaySettings::default());
    let dispatcher = TaskDispatcher::new(tiers, worker, Publisher::new(broker));
    let state = AppState::new(
        registry,
        relay,
        dispatcher,
        projects,
        ServerSettings::from_config(&config),
    );

    let listener = tokio::net::TcpListener::bind(bind.unwrap_or(config.bind_addr)).await?;
    server::serve(listener, state, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await?;
    Ok(())
}

async fn cmd_publish(
    project: String,
    event_type: String,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let project_id = ProjectId::new(project)?;
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(&raw)?,
        None => json!({}),
    };
    let envelope: Envelope = serde_json::from_value(json!({
        "type": event_type,
        "projectId": project_id,
        "payload": payload,
    }))?;

    let broker = broker::connect(&config.broker_url).await?;
    Publisher::new(broker).publish(&envelope).await?;
    println!("published {} to project {project_id}", envelope.type_tag());
    Ok(())
}

async fn cmd_watch(url: String, nodes: Vec<String>) -> anyhow::Result<()> {
    let mut session = session::connect(SessionConfig::new(url));
    if !nodes.is_empty() {
        session.subscribe(nodes.into_iter().map(NodeId::new).collect())?;
    }
    let mut states = session.state_changes();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                eprintln!("[{state}]");
                if state.is_terminal() {
                    break;
                }
            }
            event = session.next_event() => match event {
                Some(envelope) => println!("{}", envelope.to_json()?),
                None => break,
            },
        }
    }

    session.close().await;
    Ok(())
}

fn cmd_tiers(file: Option<PathBuf>) -> anyhow::Result<()> {
    let file = file.or_else(|| std::env::var("RELAY_TIERS_FILE").ok().map(PathBuf::from));
    let table = match file {
        Some(path) => TierTable::load(&path)?,
        None => TierTable::builtin(),
    };

    println!(
        "{:<10}  {:>8}  {:>8}  {:>6}  OPTIMIZATIONS",
        "TIER", "VRAM_GB", "TIMEOUT", "STEPS"
    );
    println!("{}", "-".repeat(60));
    for (name, profile) in table.iter() {
        let marker = if name == table.default_tier() { "*" } else { "" };
        println!(
            "{:<10}  {:>8}  {:>7}s  {:>6}  {}",
            format!("{name}{marker}"),
            profile.max_vram_gb,
            profile.timeout_secs,
            profile.steps,
            profile.optimizations.join(",")
        );
    }
    Ok(())
}
