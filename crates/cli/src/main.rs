use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::stream::{FuturesUnordered, StreamExt};
use phasewatch_core::{ModuloNsPlanner, PodState, ResourceSource, ShardPlanner};
use phasewatch_kubehub::{EventRecorderNotifier, KubePodSource};
use phasewatch_store::{Fanout, LogFormat, LogNotifier, ShardedSource, WatchConfig, WatchLoop};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "phasewatch", version, about = "Report Pod phase transitions")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch; repeat for several (default: all namespaces)
    #[arg(long = "ns", global = true, action = ArgAction::Append)]
    namespaces: Vec<String>,

    /// Only pods matching this label selector
    #[arg(long = "label-selector", short = 'l', global = true)]
    label_selector: Option<String>,

    /// Explicit kubeconfig path (default: in-cluster, then ~/.kube/config)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Sink { Event, Log, Both }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch pods and report every phase change
    Watch {
        /// Split each namespace scope across N independent watch loops.
        /// Every shard holds its own API server watch over the whole scope and
        /// drops foreign namespaces locally, so N shards cost N watches.
        #[arg(long = "shards", default_value_t = 1)]
        shards: u16,
        /// Where transitions go
        #[arg(long = "sink", value_enum, default_value_t = Sink::Both)]
        sink: Sink,
        /// Treat creation events as observations
        #[arg(long = "include-created", action = ArgAction::SetTrue)]
        include_created: bool,
    },
    /// List current pods and their phases
    Ls,
}

fn init_tracing() {
    let env = std::env::var("PHASEWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries JSON transitions; keep logs on stderr
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PHASEWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PHASEWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// `None` means cluster-wide.
fn scopes(namespaces: &[String]) -> Vec<Option<String>> {
    if namespaces.is_empty() {
        vec![None]
    } else {
        let mut ns: Vec<String> = namespaces.iter().filter(|s| !s.is_empty()).cloned().collect();
        ns.sort();
        ns.dedup();
        ns.into_iter().map(Some).collect()
    }
}

fn loop_name(scope: Option<&str>, shard: u16, shards: u16) -> String {
    let base = scope.unwrap_or("all");
    if shards > 1 { format!("{}#{}", base, shard) } else { base.to_string() }
}

fn build_sink(sink: Sink, output: Output, client: &kube::Client) -> Fanout {
    let log = || {
        let fmt = match output { Output::Human => LogFormat::Human, Output::Json => LogFormat::Json };
        Arc::new(LogNotifier::new(fmt)) as Arc<dyn phasewatch_core::Notifier>
    };
    let event = || {
        let instance = std::env::var("POD_NAME").ok().or_else(|| std::env::var("HOSTNAME").ok());
        Arc::new(EventRecorderNotifier::new(client.clone(), "phasewatch", instance)) as Arc<dyn phasewatch_core::Notifier>
    };
    match sink {
        Sink::Log => Fanout::new().with(log()),
        Sink::Event => Fanout::new().with(event()),
        Sink::Both => Fanout::new().with(event()).with(log()),
    }
}

fn print_pods(mut pods: Vec<PodState>, output: Output) -> Result<()> {
    pods.sort_by(|a, b| a.identity.cmp(&b.identity));
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&pods)?),
        Output::Human => {
            let ns_w = pods.iter().map(|p| p.identity.namespace.len()).max().unwrap_or(0).max("NAMESPACE".len());
            let name_w = pods.iter().map(|p| p.identity.name.len()).max().unwrap_or(0).max("NAME".len());
            println!("{:<ns_w$}  {:<name_w$}  {:<9}  VERSION", "NAMESPACE", "NAME", "PHASE", ns_w = ns_w, name_w = name_w);
            for p in &pods {
                println!(
                    "{:<ns_w$}  {:<name_w$}  {:<9}  {}",
                    p.identity.namespace,
                    p.identity.name,
                    p.phase.as_str(),
                    p.version,
                    ns_w = ns_w,
                    name_w = name_w
                );
            }
        }
    }
    Ok(())
}

async fn run_ls(cli: &Cli, client: kube::Client) -> Result<()> {
    let mut pods = Vec::new();
    for scope in scopes(&cli.namespaces) {
        let source = KubePodSource::new(client.clone(), scope.as_deref()).with_label_selector(cli.label_selector.clone());
        let snap = source.list_current().await.with_context(|| format!("listing pods in {}", scope.as_deref().unwrap_or("all namespaces")))?;
        info!(ns = ?scope, pods = snap.items.len(), version = %snap.version, "ls complete");
        pods.extend(snap.items);
    }
    print_pods(pods, cli.output)
}

async fn run_watch(cli: &Cli, client: kube::Client, shards: u16, sink: Sink, include_created: bool) -> Result<()> {
    if shards == 0 {
        bail!("--shards must be at least 1");
    }
    let mut cfg = WatchConfig::from_env();
    cfg.observe_created |= include_created;
    let notifier = build_sink(sink, cli.output, &client);
    let planner: Arc<dyn ShardPlanner> = Arc::new(ModuloNsPlanner::new(shards as usize));
    info!(shards = planner.shards(), sinks = notifier.len(), observe_created = cfg.observe_created, "watch invoked");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received; shutting down");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
            }
        }
    });

    let mut pending = FuturesUnordered::new();
    for scope in scopes(&cli.namespaces) {
        for shard in 0..shards {
            let source = KubePodSource::new(client.clone(), scope.as_deref()).with_label_selector(cli.label_selector.clone());
            let source = ShardedSource::new(source, planner.clone(), shard);
            let name = loop_name(scope.as_deref(), shard, shards);
            let handle = WatchLoop::new(name.clone(), source, notifier.clone(), &cfg).spawn(cancel.clone());
            pending.push(async move { (name, handle.await) });
        }
    }

    let mut failure = None;
    while let Some((name, joined)) = pending.next().await {
        match joined {
            Ok(Ok(stats)) => info!(watch = %name, epochs = stats.epochs, resyncs = stats.resyncs, transitions = stats.transitions, "watch loop finished"),
            Ok(Err(e)) => {
                error!(watch = %name, error = %e, "watch loop failed");
                cancel.cancel();
                failure.get_or_insert_with(|| anyhow::anyhow!("watch {} failed: {}", name, e));
            }
            Err(e) => {
                error!(watch = %name, error = %e, "watch task aborted");
                cancel.cancel();
                failure.get_or_insert_with(|| anyhow::anyhow!("watch {} aborted: {}", name, e));
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = phasewatch_kubehub::client(cli.kubeconfig.as_deref()).await.context("connecting to cluster")?;
    match cli.command {
        Commands::Ls => run_ls(&cli, client).await,
        Commands::Watch { shards, sink, include_created } => run_watch(&cli, client, shards, sink, include_created).await,
    }
}
