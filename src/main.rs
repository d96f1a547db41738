use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_core::event::EventBus;
use weft_core::types::{NodeState, RunOutcome, StateEvent, Value};
use weft_core::{ExecutionContext, Graph};
use weft_engine::{Dispatcher, GraphScheduler, RunLogger, RunReport};
use weft_nodes::HandlerRegistry;
use weft_queue::{spawn_workers, QueueBridge};
use weft_remote::{HttpPeer, PeerServer};

#[derive(Parser)]
#[command(name = "weft", version, about = "Reactive workflow graph engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "weft.toml", env = "WEFT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph file and stream node states
    Run {
        /// Graph file (.json or .toml)
        graph: PathBuf,
        /// Context value (KEY=VALUE, VALUE parsed as JSON when possible)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Cancel the run after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print emitted outputs
        #[arg(long)]
        outputs: bool,
    },
    /// Check a graph file without running it
    Validate {
        graph: PathBuf,
    },
    /// List node types and where they run
    Nodes,
    /// Consume queued jobs until interrupted
    Worker {
        /// Number of worker tasks (defaults to queue.workers)
        #[arg(long)]
        count: Option<usize>,
        /// Worker name prefix; keep it stable across restarts
        #[arg(long, default_value = "worker")]
        name: String,
    },
    /// Serve local node types to remote peers
    Serve {
        /// Listen address (defaults to remote.bind)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Drain and print dead-lettered jobs
    DeadLetters,
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            graph,
            set,
            timeout_ms,
            outputs,
        } => {
            let succeeded = run_graph(&config, &graph, &set, timeout_ms, outputs).await?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Validate { graph } => {
            let graph = Graph::load(&graph)?;
            graph.validate()?;
            dispatcher(&config, build_registry(&config)?)?.check_routable(&graph)?;
            println!(
                "ok: {} nodes, {} edges, sinks: {}",
                graph.nodes.len(),
                graph.edges.len(),
                graph.sinks().map(|n| n.id.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
        Commands::Nodes => {
            let registry = build_registry(&config)?;
            for def in registry.definitions() {
                println!("{:<16} {:<20} {}", def.node_type, def.route, def.description);
            }
            if config.queue.is_some() {
                println!("(any other type is queued)");
            }
        }
        Commands::Worker { count, name } => {
            let queue = config
                .queue
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("worker needs a [queue] section in the config"))?;
            let bridge = QueueBridge::connect(queue)?.with_retry(config.retry.clone());
            let registry = Arc::new(HandlerRegistry::with_builtins());
            let count = count.unwrap_or(queue.workers);

            let shutdown = CancellationToken::new();
            spawn_ctrl_c(shutdown.clone());
            info!(count, queue = %queue.name, "Starting queue workers");
            for handle in spawn_workers(&bridge, registry, &name, count, shutdown) {
                handle.await?;
            }
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.remote.bind.clone());
            // Only local handlers: a peer never forwards work further
            let dispatcher = Dispatcher::new(Arc::new(HandlerRegistry::with_builtins()))
                .with_retry(config.retry.clone());
            let server = PeerServer::with_state(
                bind,
                weft_remote::PeerState::new(Arc::new(dispatcher), config.engine.verbose_errors()),
            );
            let shutdown = CancellationToken::new();
            spawn_ctrl_c(shutdown.clone());
            server.run(shutdown).await?;
        }
        Commands::DeadLetters => {
            let queue = config
                .queue
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no [queue] section in the config"))?;
            let bridge = QueueBridge::connect(queue)?;
            let dead = bridge.drain_dead_letters().await?;
            if dead.is_empty() {
                println!("No dead-lettered jobs.");
            }
            for payload in dead {
                println!("{}", payload);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

/// Built-in handlers plus the node types configured peers serve.
fn build_registry(config: &AppConfig) -> anyhow::Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::with_builtins();
    for peer_config in &config.remote.peers {
        let peer = Arc::new(HttpPeer::from_config(peer_config)?);
        for node_type in &peer_config.node_types {
            registry.register_remote(node_type.clone(), peer.clone())?;
        }
        info!(peer = %peer_config.name, types = peer_config.node_types.len(), "Remote peer configured");
    }
    Ok(registry)
}

fn dispatcher(config: &AppConfig, registry: HandlerRegistry) -> anyhow::Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new(Arc::new(registry)).with_retry(config.retry.clone());
    if let Some(queue) = &config.queue {
        let bridge = QueueBridge::connect(queue)?.with_retry(config.retry.clone());
        dispatcher = dispatcher.with_queue(Arc::new(bridge));
    }
    Ok(dispatcher)
}

fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Interrupted, shutting down");
        token.cancel();
    });
}

/// Parse `--set` pairs; values that are not valid JSON are taken as strings.
fn parse_context(pairs: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got '{}'", pair))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

async fn run_graph(
    config: &AppConfig,
    path: &Path,
    set: &[String],
    timeout_ms: Option<u64>,
    show_outputs: bool,
) -> anyhow::Result<bool> {
    let graph = Graph::load(path)?;
    let mut engine = config.engine.clone();
    if timeout_ms.is_some() {
        engine.run_timeout_ms = timeout_ms;
    }

    let bus = Arc::new(EventBus::new(engine.event_capacity.max(16)));
    let scheduler = GraphScheduler::new(Arc::new(dispatcher(config, build_registry(config)?)?), engine)
        .with_event_bus(bus.clone());

    let ctx = ExecutionContext::new().with_values(parse_context(set)?);
    spawn_ctrl_c(ctx.cancel_token());

    let logger = config.log.enabled.then(|| {
        RunLogger::new(config.log.dir_path()).spawn(
            &bus,
            ctx.correlation_id().clone(),
            CancellationToken::new(),
        )
    });

    let handle = scheduler.execute(graph, &ctx)?;
    println!("run {}", handle.correlation_id());

    let (mut events, task) = handle.into_parts();
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => print_event(&event, show_outputs),
            Err(e) => eprintln!("error: {}", e),
        }
    }
    let report = task.await?;
    print_report(&report);

    if let Some(logger) = logger {
        if let Ok(Ok(Some(path))) = tokio::time::timeout(Duration::from_secs(5), logger).await {
            println!("log: {}", path.display());
        }
    }
    Ok(report.succeeded())
}

fn print_event(event: &StateEvent, show_outputs: bool) {
    let mut line = format!(
        "{} {:<16} #{:<3} {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.node_id,
        event.cycle,
        event.state
    );
    if let Some(error) = &event.error {
        line.push_str(&format!("  {}", error));
    }
    if show_outputs && event.state == NodeState::Emitting {
        if let Some(output) = &event.output {
            line.push_str(&format!("  {}", serde_json::to_string(output).unwrap_or_default()));
        }
    }
    println!("{}", line);
}

fn print_report(report: &RunReport) {
    println!();
    println!("{} in {}ms", report.outcome, report.elapsed_ms);
    for node in &report.nodes {
        let marker = if node.stalled { " (stalled)" } else { "" };
        println!(
            "  {:<16} {:<10} firings={}{}",
            node.id, node.state, node.firings, marker
        );
    }
    if report.outcome == RunOutcome::Deadlocked {
        println!("  raise engine.inactivity_timeout_ms if nodes are just slow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_context_values() {
        let values = parse_context(&[
            "limit=3".to_string(),
            "name=ada".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
            "empty=".to_string(),
        ])
        .unwrap();
        assert_eq!(values["limit"], json!(3));
        assert_eq!(values["name"], json!("ada"));
        assert_eq!(values["tags"], json!(["a", "b"]));
        assert_eq!(values["empty"], json!(""));
    }

    #[test]
    fn test_parse_context_rejects_missing_equals() {
        assert!(parse_context(&["oops".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "weft", "run", "g.toml", "--set", "a=1", "--timeout-ms", "500",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { graph, set, timeout_ms, .. } => {
                assert_eq!(graph, PathBuf::from("g.toml"));
                assert_eq!(set, vec!["a=1"]);
                assert_eq!(timeout_ms, Some(500));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_registry_routes_peer_types() {
        let config: AppConfig = toml::from_str(
            r#"
[[remote.peers]]
name = "gpu"
url = "http://127.0.0.1:18791"
node_types = ["image.resize"]
"#,
        )
        .unwrap();
        let registry = build_registry(&config).unwrap();
        let route = registry
            .definitions()
            .into_iter()
            .find(|d| d.node_type == "image.resize")
            .unwrap()
            .route;
        assert_eq!(route, "remote:gpu");
    }
}
