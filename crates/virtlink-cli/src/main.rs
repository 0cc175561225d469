//! virtlink - connects the configured hosts and logs what happens on them.
//!
//! Runs against the simulated backend. Each connection gets a logging
//! subscriber and an inventory poller; once a connection is established the
//! first stopped domain is started so lifecycle events show up in the log.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use virtlink_core::impls::{MemorySettingsStore, SimulatedBackend};
use virtlink_core::model::{
    ClientConfig, ConnectionChange, ConnectionRecord, ConnectionSettings, Event, OverlapPolicy,
    ResourceType, SubscriptionId,
};
use virtlink_core::ports::SettingsStore;
use virtlink_core::{Connection, Dispatcher, RepeatingJob};

const DEMO_URL: &str = "test://localhost/system";

#[derive(Debug, Parser)]
#[command(name = "virtlink", version, about = "Virtualization connection monitor")]
struct Args {
    /// Client configuration (JSON). Without it a single demo connection is used.
    #[arg(long, env = "VIRTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Stop after this many seconds.
    #[arg(long, default_value_t = 10)]
    run_for_secs: u64,

    /// Connect every configured connection, not only autoconnect ones.
    #[arg(long)]
    all: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("virtlink=info,virtlink_core=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let Some(path) = path else {
        info!(url = DEMO_URL, "no --config given; using the demo connection");
        return Ok(ClientConfig {
            connections: vec![ConnectionRecord::new(
                DEMO_URL,
                ConnectionSettings {
                    name: "demo".into(),
                    description: "simulated host".into(),
                    autoconnect: true,
                },
            )],
            ..ClientConfig::default()
        });
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    ClientConfig::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

fn demo_backend() -> anyhow::Result<SimulatedBackend> {
    let backend = SimulatedBackend::new();
    backend.add_object(ResourceType::Domain, "web-01", true);
    backend.add_object(ResourceType::Domain, "db-01", false);
    backend.add_object(ResourceType::Network, "default", true);
    let pool = backend.add_object(ResourceType::Pool, "default", true);
    backend.add_volume(&pool, "web-01.qcow2", vec![0; 64 * 1024])?;
    backend.add_object(ResourceType::Secret, "iscsi-chap", false);
    Ok(backend)
}

/// Logs every event of `conn`; starts a stopped domain once connected.
fn watch(conn: &Connection) -> SubscriptionId {
    let this = conn.clone();
    conn.event_bus().register("cli-log", move |event: &Event| {
        info!(%event, "event");
        if event.connection_change() == Some(&ConnectionChange::Established) {
            start_first_stopped_domain(&this);
        }
    })
}

fn start_first_stopped_domain(conn: &Connection) {
    let target = conn.clone();
    let listed = conn.list_domains(
        |err| warn!(error = %err, "listing domains failed"),
        move |result| {
            let Some(stopped) = result
                .success()
                .and_then(|domains| domains.into_iter().find(|d| !d.active))
            else {
                return;
            };
            let started = target.domain(stopped.uuid).and_then(|domain| {
                let name = stopped.name.clone();
                domain.start(
                    move |err| warn!(domain = %name, error = %err, "start failed"),
                    |_| {},
                )
            });
            if let Err(err) = started {
                warn!(error = %err, "could not start domain");
            }
        },
    );
    if let Err(err) = listed {
        warn!(url = %conn.url(), error = %err, "listing domains skipped");
    }
}

fn start_poller(
    dispatcher: &Dispatcher,
    conn: &Connection,
    interval: Duration,
    policy: OverlapPolicy,
) -> RepeatingJob {
    let conn = conn.clone();
    RepeatingJob::start(
        dispatcher,
        Instant::now,
        move |_: Instant| report_inventory(&conn),
        interval,
        policy,
    )
}

fn report_inventory(conn: &Connection) {
    if !conn.is_connected() {
        return;
    }
    for kind in [
        ResourceType::Domain,
        ResourceType::Network,
        ResourceType::Pool,
        ResourceType::Secret,
    ] {
        let url = conn.url().to_string();
        let listed = conn.list(
            kind,
            move |err| warn!(%kind, error = %err, "inventory failed"),
            move |result| {
                if let Some(items) = result.success() {
                    info!(url = %url, %kind, count = items.len(), "inventory");
                }
            },
        );
        if let Err(err) = listed {
            warn!(url = %conn.url(), error = %err, "inventory skipped");
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = load_config(args.config.as_deref())?;
    let backend = demo_backend()?;
    let store: Rc<dyn SettingsStore> =
        Rc::new(MemorySettingsStore::with_connections(&config.connections)?);

    let dispatcher = Dispatcher::new();
    let connections = Connection::load_all(&dispatcher, Arc::new(backend), store)?;
    info!(count = connections.len(), "connections loaded");

    let mut subscriptions = Vec::with_capacity(connections.len());
    let mut pollers = Vec::with_capacity(connections.len());
    for conn in &connections {
        subscriptions.push(watch(conn));
        if args.all || conn.settings().autoconnect {
            conn.try_connect()?;
        }
        pollers.push(start_poller(
            &dispatcher,
            conn,
            config.poll_interval(),
            config.overlap_policy,
        ));
    }

    let shutdown = CancellationToken::new();
    let deadline = shutdown.clone();
    let run_for = Duration::from_secs(args.run_for_secs);
    tokio::spawn(async move {
        tokio::time::sleep(run_for).await;
        deadline.cancel();
    });
    dispatcher.serve(shutdown).await;

    for poller in &pollers {
        poller.stop();
    }
    for (conn, id) in connections.iter().zip(subscriptions) {
        if conn.is_connected() {
            conn.disconnect()?;
        }
        conn.event_bus().unregister(id)?;
    }
    // Let the close jobs report back.
    dispatcher.run_for(Duration::from_millis(200)).await;
    info!(pending = dispatcher.pending_jobs(), "stopped");
    Ok(())
}
