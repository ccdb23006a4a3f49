use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use lookout_api::{Console, ConsoleHandle, EVENT_KIND};
use lookout_core::{Config, Resource, ResourceKey};
use lookout_kubehub::{discover, KindInfo, KubeTransport, SsarAccess};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

/// Kinds cached when `--kinds` is not given: workloads, their pods, and cluster events.
const DEFAULT_KINDS: &str = "Namespace,Node,Pod,ReplicaSet,Deployment,StatefulSet,DaemonSet,Job,CronJob,Service,Endpoints,Event";

#[derive(Parser, Debug)]
#[command(name = "lookoutctl", version, about = "Lookout cluster cache CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Only show objects in this namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Filter terms (`field:value`, `!field:value` or a bare value); repeatable
    #[arg(short = 'f', long = "filter", global = true, action = ArgAction::Append)]
    filters: Vec<String>,

    /// Comma-separated kinds to cache
    #[arg(long = "kinds", global = true, default_value = DEFAULT_KINDS, value_delimiter = ',')]
    kinds: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resource kinds
    Discover,
    /// List cached objects of a kind, or show one object with its pods and events
    Get {
        /// Kind, e.g. "Deployment"
        kind: String,
        name: Option<String>,
    },
    /// Print recent cluster events, or the events of one object and what it owns
    Events {
        /// Object key `Kind/namespace/name` (`~` for cluster-scoped objects)
        key: Option<String>,
    },
    /// Follow the cache and print +/~/- lines as objects change
    Watch {
        /// Limit output to one kind
        kind: Option<String>,
    },
    /// Suggest filter terms matching a query
    Suggest {
        query: String,
        #[arg(long = "limit", default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("LOOKOUT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LOOKOUT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid LOOKOUT_METRICS_ADDR; expected host:port");
        }
    }
}

fn print<T: Serialize>(output: Output, value: &T, human: impl FnOnce()) -> Result<()> {
    match output {
        Output::Human => human(),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// Pick one discovered entry per wanted kind, preferring the core group.
fn select_kinds(discovered: &[KindInfo], wanted: &[String]) -> Vec<KindInfo> {
    let mut out: Vec<KindInfo> = Vec::new();
    for want in wanted.iter().map(|w| w.trim()).filter(|w| !w.is_empty()) {
        let hit = discovered
            .iter()
            .filter(|k| k.kind.eq_ignore_ascii_case(want) || k.plural.eq_ignore_ascii_case(want))
            .min_by_key(|k| !k.group.is_empty());
        match hit {
            Some(k) if !out.iter().any(|o| o.kind == k.kind) => out.push(k.clone()),
            Some(_) => {}
            None => warn!(kind = %want, "kind not served by the cluster; skipped"),
        }
    }
    out
}

async fn open_console(cli: &Cli, extra: Option<&str>) -> Result<(Console, ConsoleHandle)> {
    let transport = KubeTransport::try_default().await.context("connecting to cluster")?;
    let client = transport.client();
    let discovered = discover(client.clone()).await.context("discovery")?;
    let mut wanted = cli.kinds.clone();
    wanted.extend(extra.map(|s| s.to_string()));
    let kinds = select_kinds(&discovered, &wanted);
    if kinds.is_empty() {
        bail!("none of the requested kinds are served: {}", wanted.join(","));
    }
    info!(kinds = kinds.len(), "starting console");
    let console = Console::start(Config::from_env(), Arc::new(transport), Arc::new(SsarAccess::new(client)), kinds);
    let handle = console.handle();
    if let Some(ns) = &cli.namespace {
        handle.set_global_filters(vec![format!("namespace:{}", ns)]).await?;
    }
    if !cli.filters.is_empty() {
        handle.set_filters(cli.filters.clone()).await?;
    }
    wait_for_first_sync(&handle).await;
    Ok((console, handle))
}

/// Wait for the initial full list to land (bounded by `LOOKOUT_WAIT_SECS`, default 8).
async fn wait_for_first_sync(handle: &ConsoleHandle) {
    let wait_secs = std::env::var("LOOKOUT_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
    let mut rx = handle.subscribe_revision();
    match tokio::time::timeout(Duration::from_secs(wait_secs), rx.wait_for(|rev| *rev > 0)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => warn!("console stopped before the first sync"),
        Err(_) => warn!(wait_secs, "timed out waiting for the first sync; output may be partial"),
    }
    for e in handle.errors() {
        warn!(class = ?e.class, retry = ?e.retry, "{}", e.message);
    }
}

fn render_age(r: &Resource) -> String {
    let Some(created) = r
        .metadata()
        .get("creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    else {
        return "-".to_string();
    };
    let mut secs = (Utc::now() - created.with_timezone(&Utc)).num_seconds().max(0);
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

#[derive(Serialize)]
struct Row<'a> {
    kind: &'a str,
    namespace: &'a str,
    name: &'a str,
    status: &'a str,
    age: String,
}

impl<'a> Row<'a> {
    fn of(r: &'a Resource) -> Self {
        Row { kind: &r.kind, namespace: r.key.scope(), name: &r.name, status: r.status_summary.as_str(), age: render_age(r) }
    }
}

fn print_rows(rows: &[Row<'_>]) {
    println!("{:<12} {:<24} {:<44} {:<12} AGE", "KIND", "NAMESPACE", "NAME", "STATUS");
    for row in rows {
        println!("{:<12} {:<24} {:<44} {:<12} {}", row.kind, row.namespace, row.name, row.status, row.age);
    }
}

async fn run_get(cli: &Cli, kind: &str, name: Option<&str>) -> Result<()> {
    let (mut console, handle) = open_console(cli, Some(kind)).await?;
    let view = handle.current();
    match name {
        None => {
            let mut items: Vec<&Arc<Resource>> = view.visible().filter(|r| r.kind.eq_ignore_ascii_case(kind)).collect();
            items.sort_by(|a, b| a.key.scope().cmp(b.key.scope()).then(a.name.cmp(&b.name)));
            let rows: Vec<Row<'_>> = items.iter().map(|r| Row::of(r)).collect();
            print(cli.output, &rows, || print_rows(&rows))?;
        }
        Some(name) => {
            let canonical = view.resources().find(|r| r.kind.eq_ignore_ascii_case(kind)).map(|r| r.kind.clone()).unwrap_or_else(|| kind.to_string());
            let selection = handle.select(&canonical, cli.namespace.as_deref(), name);
            if selection.resource.not_found {
                console.destroy();
                bail!("{} not found", selection.resource.key);
            }
            let events = handle.events_for(&selection.resource.key);

            #[derive(Serialize)]
            struct Detail<'a> {
                resource: &'a Resource,
                pods: Vec<Row<'a>>,
                events: &'a [Arc<lookout_api::ClusterEvent>],
            }
            let detail = Detail { resource: &selection.resource, pods: selection.pods.iter().map(|p| Row::of(p)).collect(), events: &events };
            print(cli.output, &detail, || {
                let r = &selection.resource;
                println!("{}  status={}  rv={}", r.key, r.status_summary.as_str(), r.resource_version);
                if !detail.pods.is_empty() {
                    println!();
                    print_rows(&detail.pods);
                }
                if !events.is_empty() {
                    println!();
                    print_events(&events);
                }
            })?;
        }
    }
    console.destroy();
    Ok(())
}

fn print_events(events: &[Arc<lookout_api::ClusterEvent>]) {
    for ev in events {
        let ts = ev.timestamp.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into());
        println!("{}  {:<8} {:<20} {}: {}", ts, ev.severity, ev.reason, ev.involved, ev.message);
    }
}

async fn run_events(cli: &Cli, key: Option<&str>) -> Result<()> {
    let (mut console, handle) = open_console(cli, Some(EVENT_KIND)).await?;
    let events = match key {
        Some(k) => {
            let key = ResourceKey::from_str(k)?;
            handle.events_for(&key)
        }
        None => handle.recent_events(),
    };
    print(cli.output, &events, || print_events(&events))?;
    console.destroy();
    Ok(())
}

async fn run_watch(cli: &Cli, kind: Option<&str>) -> Result<()> {
    let (mut console, handle) = open_console(cli, kind).await?;
    let mut rx = handle.subscribe_revision();
    let mut seen: HashMap<ResourceKey, String> = HashMap::new();
    let mut reported = 0usize;
    loop {
        let view = handle.current();
        let mut live: HashMap<ResourceKey, String> = HashMap::new();
        for r in view.visible().filter(|r| kind.map(|k| r.kind.eq_ignore_ascii_case(k)).unwrap_or(true)) {
            live.insert(r.key.clone(), r.resource_version.clone());
            match seen.get(&r.key) {
                None => println!("+ {} {}", r.key, r.status_summary.as_str()),
                Some(rv) if *rv != r.resource_version => println!("~ {} {}", r.key, r.status_summary.as_str()),
                Some(_) => {}
            }
        }
        for gone in seen.keys().filter(|k| !live.contains_key(*k)) {
            println!("- {}", gone);
        }
        seen = live;
        let errors = handle.errors();
        for e in errors.iter().skip(reported) {
            eprintln!("! {} (retry: {:?})", e.message, e.retry);
        }
        reported = errors.len();

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    warn!("console stopped; exiting watch loop");
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    console.destroy();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let transport = KubeTransport::try_default().await.context("connecting to cluster")?;
            let kinds = discover(transport.client()).await?;
            print(cli.output, &kinds, || {
                for k in &kinds {
                    let scope = if k.namespaced { "namespaced" } else { "cluster" };
                    let watch = if k.watchable { "" } else { " • no-watch" };
                    println!("{} • {} • {}{}", k.api_version(), k.kind, scope, watch);
                }
            })?;
        }
        Commands::Get { kind, name } => run_get(&cli, kind, name.as_deref()).await?,
        Commands::Events { key } => run_events(&cli, key.as_deref()).await?,
        Commands::Watch { kind } => run_watch(&cli, kind.as_deref()).await?,
        Commands::Suggest { query, limit } => {
            let (mut console, handle) = open_console(&cli, None).await?;
            let suggestions = handle.current().suggest(query, *limit);
            print(cli.output, &suggestions, || {
                for s in &suggestions {
                    println!("{:<40} {}", s.term, s.score);
                }
            })?;
            console.destroy();
        }
    }

    Ok(())
}
