//! keelctl: apply, preview and destroy sets of Kubernetes manifests tracked by
//! an inventory.

#![forbid(unsafe_code)]

mod manifest;
mod printer;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use keel_apply::{Applier, ApplierOptions, CollectorError, ConfigMapInventory, Destroyer, DestroyerOptions, EventStream, ResourceStateCollector};
use keel_core::client::{DryRunStrategy, PropagationPolicy, ResourceClient};
use keel_core::inventory::{InventoryClient, InventoryInfo, InventoryPolicy};
use keel_kubehub::{ClientStatusPoller, KubeResourceClient};
use keel_persist::SqliteInventory;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::printer::{Output, Printer};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Apply and prune manifest sets tracked by an inventory")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Where the inventory is kept
    #[arg(long = "backend", value_enum, global = true, default_value_t = Backend::Configmap, env = "KEEL_BACKEND")]
    backend: Backend,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Configmap,
    Sqlite,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Policy {
    MustMatch,
    AdoptIfNoInventory,
    AdoptAll,
}

impl From<Policy> for InventoryPolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::MustMatch => InventoryPolicy::MustMatch,
            Policy::AdoptIfNoInventory => InventoryPolicy::AdoptIfNoInventory,
            Policy::AdoptAll => InventoryPolicy::AdoptAll,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Propagation {
    Background,
    Foreground,
    Orphan,
}

impl From<Propagation> for PropagationPolicy {
    fn from(p: Propagation) -> Self {
        match p {
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct InventoryArgs {
    /// Inventory name
    #[arg(long = "inventory-name", env = "KEEL_INVENTORY_NAME")]
    name: String,
    /// Inventory namespace
    #[arg(long = "inventory-namespace", default_value = "default", env = "KEEL_INVENTORY_NAMESPACE")]
    namespace: String,
    /// Inventory id; read from the existing inventory or generated when omitted
    #[arg(long = "inventory-id", env = "KEEL_INVENTORY_ID")]
    id: Option<String>,
    /// Ownership rule for objects owned by another inventory or by none
    #[arg(long = "inventory-policy", value_enum, default_value_t = Policy::MustMatch)]
    policy: Policy,
}

#[derive(Args, Debug, Clone)]
struct ApplyArgs {
    /// Manifest files (multi-document YAML); `-` reads stdin
    #[arg(short = 'f', long = "filename", required = true)]
    files: Vec<String>,
    #[command(flatten)]
    inventory: InventoryArgs,
    /// Use server-side apply
    #[arg(long = "server-side")]
    server_side: bool,
    /// Take over conflicting fields under server-side apply
    #[arg(long = "force-conflicts")]
    force_conflicts: bool,
    #[arg(long = "field-manager", default_value = "keel")]
    field_manager: String,
    /// Keep objects that left the manifest set instead of pruning them
    #[arg(long = "no-prune")]
    no_prune: bool,
    /// Wait this long for applied objects to become Current (0 disables)
    #[arg(long = "reconcile-timeout", value_parser = parse_duration, default_value = "0s")]
    reconcile_timeout: Duration,
    /// Wait this long for pruned objects to disappear (0 disables)
    #[arg(long = "prune-timeout", value_parser = parse_duration, default_value = "0s")]
    prune_timeout: Duration,
    #[arg(long = "prune-propagation-policy", value_enum, default_value_t = Propagation::Background)]
    propagation: Propagation,
    #[arg(long = "poll-interval", value_parser = parse_duration, default_value = "2s")]
    poll_interval: Duration,
    /// Print status updates while waiting
    #[arg(long = "status-events")]
    status_events: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply manifests, then prune objects that left the set
    Apply(ApplyArgs),
    /// Show what apply would do without changing anything
    Preview {
        #[command(flatten)]
        apply: ApplyArgs,
        /// Send requests with the server dry-run flag instead of computing locally
        #[arg(long = "server")]
        server: bool,
    },
    /// Delete every object the inventory owns
    Destroy {
        #[command(flatten)]
        inventory: InventoryArgs,
        #[arg(long = "delete-timeout", value_parser = parse_duration, default_value = "0s")]
        delete_timeout: Duration,
        #[arg(long = "propagation-policy", value_enum, default_value_t = Propagation::Background)]
        propagation: Propagation,
        #[arg(long = "poll-interval", value_parser = parse_duration, default_value = "2s")]
        poll_interval: Duration,
        #[arg(long = "dry-run")]
        dry_run: bool,
        #[arg(long = "status-events")]
        status_events: bool,
    },
}

/// Durations like `500ms`, `30s`, `5m`, `1h`; a bare number is seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("invalid duration unit in {s:?} (expect ms, s, m or h)")),
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling run");
            token.cancel();
        }
    });
}

struct Backends {
    client: Arc<dyn ResourceClient>,
    inventory: Arc<dyn InventoryClient>,
    sqlite: Option<Arc<SqliteInventory>>,
}

async fn connect(backend: Backend, field_manager: &str) -> Result<Backends> {
    let client: Arc<dyn ResourceClient> = Arc::new(KubeResourceClient::try_default().await?);
    Ok(match backend {
        Backend::Configmap => Backends {
            inventory: Arc::new(ConfigMapInventory::new(client.clone()).with_field_manager(field_manager)),
            client,
            sqlite: None,
        },
        Backend::Sqlite => {
            let store = Arc::new(SqliteInventory::open_default()?);
            Backends { inventory: store.clone(), client, sqlite: Some(store) }
        }
    })
}

/// Resolve the inventory handle: explicit id, else the stored one, else a fresh id.
async fn inventory_info(args: &InventoryArgs, b: &Backends) -> Result<InventoryInfo> {
    if let Some(id) = &args.id {
        return Ok(InventoryInfo::new(&args.name, &args.namespace, id));
    }
    let stored = match &b.sqlite {
        Some(store) => store.lookup_id(&args.namespace, &args.name)?,
        None => {
            let probe = InventoryInfo::new(&args.name, &args.namespace, "");
            let live = b.client.get(&probe.identifier()).await.context("reading inventory object")?;
            live.as_ref().and_then(InventoryInfo::from_object).map(|inv| inv.id)
        }
    };
    let id = match stored {
        Some(id) => id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            info!(inventory = %args.name, id = %id, "no inventory found; using a new id");
            id
        }
    };
    Ok(InventoryInfo::new(&args.name, &args.namespace, id))
}

/// Print every event, then the summary; fail on a run error or any failed object.
async fn report(stream: EventStream, printer: &Printer) -> Result<()> {
    let collector = ResourceStateCollector::default();
    let listened = collector.listen(stream, |ev| printer.print(ev)).await;
    println!("{}", printer.summary(&collector.stats()));
    listened?;
    match collector.result() {
        Ok(()) => Ok(()),
        Err(CollectorError::Failed(e)) => Err(anyhow!(e)),
        Err(e) => Err(e.into()),
    }
}

async fn run_apply(output: Output, backend: Backend, args: ApplyArgs, dry_run: DryRunStrategy) -> Result<()> {
    let objects = manifest::load(&args.files)?;
    info!(objects = objects.len(), dry_run = ?dry_run, "keelctl: manifests loaded");
    let b = connect(backend, &args.field_manager).await?;
    let inv = inventory_info(&args.inventory, &b).await?;
    let applier = Applier::new(b.client.clone(), b.inventory.clone(), Arc::new(ClientStatusPoller::new(b.client.clone())));
    let opts = ApplierOptions {
        server_side_apply: args.server_side,
        force_conflicts: args.force_conflicts,
        field_manager: args.field_manager,
        reconcile_timeout: args.reconcile_timeout,
        poll_interval: args.poll_interval,
        emit_status_events: args.status_events,
        prune: !args.no_prune,
        dry_run,
        prune_propagation_policy: args.propagation.into(),
        prune_timeout: args.prune_timeout,
        inventory_policy: args.inventory.policy.into(),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let stream = applier.run(cancel, Some(inv), objects, opts)?;
    report(stream, &Printer::new(output, dry_run, args.status_events)).await
}

#[allow(clippy::too_many_arguments)]
async fn run_destroy(
    output: Output,
    backend: Backend,
    args: InventoryArgs,
    delete_timeout: Duration,
    propagation: Propagation,
    poll_interval: Duration,
    dry_run: bool,
    status_events: bool,
) -> Result<()> {
    let b = connect(backend, "keel").await?;
    let inv = inventory_info(&args, &b).await?;
    let dry_run = if dry_run { DryRunStrategy::Client } else { DryRunStrategy::None };
    let destroyer = Destroyer::new(b.client.clone(), b.inventory.clone(), Arc::new(ClientStatusPoller::new(b.client.clone())));
    let opts = DestroyerOptions {
        dry_run,
        propagation_policy: propagation.into(),
        delete_timeout,
        poll_interval,
        emit_status_events: status_events,
        inventory_policy: args.policy.into(),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let stream = destroyer.run(cancel, inv, opts)?;
    report(stream, &Printer::new(output, dry_run, status_events)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply(args) => run_apply(cli.output, cli.backend, args, DryRunStrategy::None).await,
        Commands::Preview { apply, server } => {
            let dry_run = if server { DryRunStrategy::Server } else { DryRunStrategy::Client };
            run_apply(cli.output, cli.backend, apply, dry_run).await
        }
        Commands::Destroy { inventory, delete_timeout, propagation, poll_interval, dry_run, status_events } => {
            run_destroy(cli.output, cli.backend, inventory, delete_timeout, propagation, poll_interval, dry_run, status_events).await
        }
    }
}
