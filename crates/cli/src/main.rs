use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use taller_core::{view, NoticeLevel, Order, OrderEvent, OrderId, OrderPatch, OrderPayload, OrderStatus, Services};
use taller_store::{spawn_sync, OrderStore, StoreConfig};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "tallerctl", version, about = "Workshop intake board")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite file holding the board
    #[arg(long = "db", global = true, env = "TALLER_DB_PATH")]
    db: Option<String>,

    /// Storage namespace
    #[arg(long = "ns", global = true, env = "TALLER_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List orders, newest first
    Ls {
        /// Only orders still on the shop floor
        #[arg(long = "active", action = ArgAction::SetTrue, conflicts_with = "completed")]
        active: bool,
        /// Only completed orders
        #[arg(long = "completed", action = ArgAction::SetTrue)]
        completed: bool,
        /// Match plate or client name
        #[arg(long = "filter")]
        filter: Option<String>,
    },
    /// Register a vehicle at reception
    Create {
        #[arg(long)]
        plate: String,
        #[arg(long)]
        model: String,
        #[arg(long = "client", default_value = "")]
        client: String,
        /// Requested service (repeatable)
        #[arg(long = "service")]
        services: Vec<String>,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Edit descriptive fields of an order
    Update {
        /// Order UUID or display number
        reference: String,
        #[arg(long)]
        plate: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long = "client")]
        client: Option<String>,
        /// Replaces the whole service list (repeatable)
        #[arg(long = "service")]
        services: Option<Vec<String>>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Delete an order
    Rm { reference: String },
    /// Move an order to waiting, working, parts or completed
    Status { reference: String, status: String },
    /// Mark an order completed
    Complete { reference: String },
    /// Show the status trail of an order
    History { reference: String },
    /// Shop-floor display: active orders, oldest first, refreshed on every change
    Watch,
}

fn init_tracing() {
    let env = std::env::var("TALLER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TALLER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TALLER_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut cfg = StoreConfig::from_env();
    if let Some(db) = cli.db.clone() { cfg.db_path = db; }
    if let Some(ns) = cli.namespace.clone() { cfg.namespace = ns; }
    debug!(db = %cfg.db_path, ns = %cfg.namespace, "opening store");
    let store = Arc::new(OrderStore::open(&cfg)?);
    let mut notices = store.subscribe_events();

    match cli.command {
        Commands::Ls { active, completed, filter } => {
            let snap = store.snapshot();
            let scoped: Vec<&Order> = if active {
                view::active(&snap.orders)
            } else if completed {
                view::completed(&snap.orders)
            } else {
                snap.orders.iter().collect()
            };
            let q = filter.unwrap_or_default();
            let rows: Vec<&Order> = scoped.into_iter().filter(|o| view::matches_filter(o, &q)).collect();
            match cli.output {
                Output::Human => print_table(&rows),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Create { plate, model, client, services, notes } => {
            let payload = OrderPayload {
                plate,
                model,
                client_name: client,
                services: services.into_iter().collect(),
                notes,
            }
            .normalize();
            payload.validate()?;
            let created = store.create(payload);
            flush_notices(&mut notices, cli.output);
            let order = created?;
            if cli.output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&order)?);
            }
        }
        Commands::Update { reference, plate, model, client, services, notes } => {
            let id = resolve(&store, &reference)?;
            let patch = OrderPatch {
                plate: plate.map(|p| p.trim().to_uppercase()),
                model: model.map(|m| m.trim().to_string()),
                client_name: client.map(|c| c.trim().to_string()),
                services: services.map(|s| s.into_iter().collect::<Services>()),
                notes: notes.map(|n| n.trim().to_string()),
            };
            if patch.is_empty() {
                bail!("nothing to update; pass at least one field");
            }
            let updated = store.update(id, patch);
            flush_notices(&mut notices, cli.output);
            if let (Some(order), Output::Json) = (updated, cli.output) {
                println!("{}", serde_json::to_string_pretty(&order)?);
            }
        }
        Commands::Rm { reference } => {
            let id = resolve(&store, &reference)?;
            store.delete(id);
            flush_notices(&mut notices, cli.output);
        }
        Commands::Status { reference, status } => {
            let id = resolve(&store, &reference)?;
            let status = OrderStatus::from_str(&status)?;
            let changed = store.change_status(id, status)?;
            flush_notices(&mut notices, cli.output);
            if let (Some(order), Output::Json) = (changed, cli.output) {
                println!("{}", serde_json::to_string_pretty(&order)?);
            }
        }
        Commands::Complete { reference } => {
            let id = resolve(&store, &reference)?;
            store.complete(id);
            flush_notices(&mut notices, cli.output);
        }
        Commands::History { reference } => {
            let id = resolve(&store, &reference)?;
            let order = store.get(id).ok_or_else(|| anyhow!("order {} vanished", reference))?;
            match cli.output {
                Output::Human => {
                    println!("#{} {} {}", order.display_id(), order.plate, order.model);
                    for entry in order.status_history() {
                        println!("  {}  {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S"), entry.status.label());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(order.status_history())?),
            }
        }
        Commands::Watch => watch(store, cfg.sync_interval, cli.output).await?,
    }
    Ok(())
}

async fn watch(store: Arc<OrderStore>, every: Duration, output: Output) -> Result<()> {
    info!(every_ms = every.as_millis() as u64, "display mode");
    let mut epoch = store.subscribe_epoch();
    let sync_handle = spawn_sync(Arc::clone(&store), every);
    let mut clock = tokio::time::interval(Duration::from_secs(30));
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            changed = epoch.changed() => {
                if changed.is_err() { break; }
            }
            _ = clock.tick() => {}
            _ = &mut ctrl_c => {
                info!("Ctrl-C received; leaving display mode");
                break;
            }
        }
        let snap = store.snapshot();
        let queue = view::display_queue(&snap.orders);
        match output {
            Output::Human => {
                println!("\n=== Taller: {} en taller ===", queue.len());
                print_table(&queue);
            }
            Output::Json => println!("{}", serde_json::to_string(&queue)?),
        }
    }
    sync_handle.abort();
    Ok(())
}

/// Accepts a UUID or a display number (`7`, `0007` or `#0007`).
fn resolve(store: &OrderStore, reference: &str) -> Result<OrderId> {
    let snap = store.snapshot();
    if let Ok(id) = reference.trim().parse::<OrderId>() {
        if snap.get(id).is_some() {
            return Ok(id);
        }
    }
    let key = reference.trim().trim_start_matches('#');
    let display = match key.parse::<u64>() {
        Ok(n) => taller_persist::format_display_id(n),
        Err(_) => key.to_string(),
    };
    snap.by_display_id(&display)
        .map(|o| o.id())
        .ok_or_else(|| anyhow!("no order matches {:?}", reference))
}

fn flush_notices(rx: &mut broadcast::Receiver<OrderEvent>, output: Output) {
    while let Ok(ev) = rx.try_recv() {
        match ev.level() {
            NoticeLevel::Error => eprintln!("error: {}", ev.message()),
            _ if output == Output::Human => println!("{}", ev.message()),
            _ => {}
        }
    }
}

fn print_table(rows: &[&Order]) {
    let now = taller_core::now_millis();
    println!("{:<6} {:<9} {:<14} {:<16} {:<20} {}", "ORDER", "PLATE", "MODEL", "CLIENT", "STATUS", "AGE");
    for o in rows {
        let marker = if view::is_new(o, now) { "*" } else { " " };
        println!(
            "{}{:<5} {:<9} {:<14} {:<16} {:<20} {}",
            marker,
            o.display_id(),
            o.plate,
            o.model,
            o.client_name,
            o.status().label(),
            render_age(now.signed_duration_since(o.created_at()).num_seconds()),
        );
    }
}

fn render_age(secs: i64) -> String {
    let mut secs = secs.max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
