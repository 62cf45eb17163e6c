//! Seiswatch daemon.
//!
//! Runs the ingestion supervisor in the foreground, and, when configured, the
//! alarm cycle and the HTTP surface as background tasks. `Ctrl-C` closes the
//! upstream session and removes the buffers of the selected channels. A
//! background task that stops does the same and exits non-zero.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use seiswatch::alarm::{AlarmCycle, AlarmEngine, AlarmStore, CompletionWorkflow, ledger_path};
use seiswatch::api::{AppState, build_router};
use seiswatch::config::{self, Cli, Settings};
use seiswatch::health::{HealthSnapshotReader, SqliteHealthSource};
use seiswatch::model::SubscriptionSet;
use seiswatch::ring_buffer::RingBufferStore;
use seiswatch::seedlink::TcpUpstream;
use seiswatch::subscription::{SubscriptionWatcher, WatchEvent};
use seiswatch::supervisor::{ConnectionSupervisor, SupervisorSettings};
use seiswatch::tasks::BackgroundTasks;

/// Name of the health source, used for its states document.
const HEALTH_SOURCE_NAME: &str = "sohdb";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("seiswatch=info".parse()?))
        .init();

    let cli = Cli::parse();
    let settings = match Settings::from_cli(cli) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            return Err(e);
        }
    };

    info!(
        server = %settings.server,
        buffer_dir = %settings.buffer_dir.display(),
        capacity = settings.capacity(),
        sampling_rate = settings.sampling_rate,
        "Starting seiswatch"
    );

    let buffers = RingBufferStore::new(&settings.buffer_dir, settings.capacity());
    let alarms = Arc::new(Mutex::new(
        AlarmStore::open(ledger_path(&settings.log_dir, &settings.server)).await?,
    ));

    let mut background = BackgroundTasks::new();

    if let Some(db_url) = &settings.health_db {
        let source = SqliteHealthSource::connect(db_url, HEALTH_SOURCE_NAME).await?;
        let engine = AlarmEngine::new(config::load_baselines(&settings.stations_file)?);
        let cycle = AlarmCycle::new(
            HealthSnapshotReader::new(source),
            engine,
            alarms.clone(),
            settings
                .log_dir
                .join(format!("{HEALTH_SOURCE_NAME}_states.json")),
        );
        background.spawn("Alarm loop", cycle.run(settings.alarm_period));
    } else {
        warn!("No health database configured, alarm loop disabled");
    }

    if settings.api_port != 0 {
        let state = AppState {
            buffers: buffers.clone(),
            alarms: alarms.clone(),
            workflow: Arc::new(Mutex::new(CompletionWorkflow::new())),
            subscription_path: settings.subscription_path(),
            default_port: settings.default_port,
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "HTTP surface listening");
        background.spawn(
            "HTTP surface",
            axum::serve(listener, build_router(state)).into_future(),
        );
    }

    let supervisor_settings = SupervisorSettings {
        target_rate: settings.sampling_rate,
        ..SupervisorSettings::default()
    };
    let mut supervisor =
        ConnectionSupervisor::new(TcpUpstream::new(), buffers, supervisor_settings);

    let mut watcher = SubscriptionWatcher::new(settings.subscription_path(), settings.default_port);

    if let Some(window) = settings.window {
        let channels = match watcher.poll().await {
            WatchEvent::Changed(published) => published.channels,
            _ => Vec::new(),
        };
        if channels.is_empty() {
            warn!(path = %watcher.path().display(), "No channels to retrieve");
            return Ok(());
        }
        let set = SubscriptionSet::new(settings.server.clone(), channels);
        let summary = tokio::select! {
            summary = supervisor.run_retrieval(set, window) => summary?,
            e = background.failure() => {
                error!(error = %format!("{e:#}"), "Background task failed");
                supervisor.close().await?;
                return Err(e);
            }
        };
        background.shutdown();
        if !summary.complete {
            anyhow::bail!("retrieval ended before the server signalled the end of the range");
        }
        return Ok(());
    }

    // Seed the resource with the configured server so the session can start
    // before the dashboard publishes a channel list.
    if !watcher.path().exists() {
        let seed = SubscriptionSet::new(settings.server.clone(), Vec::new());
        SubscriptionWatcher::publish(watcher.path(), &seed).await?;
    }

    let outcome = tokio::select! {
        result = supervisor.run_live(&mut watcher) => {
            if let Err(e) = &result {
                error!(error = %e, "Ingestion stopped");
            }
            result.map_err(anyhow::Error::from)
        }
        e = background.failure() => {
            error!(error = %format!("{e:#}"), "Background task failed");
            Err(e)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    background.shutdown();
    supervisor.close().await?;
    outcome?;

    info!("Seiswatch stopped");
    Ok(())
}
