mod broker;
mod config;
mod db;
mod live;
mod mqtt;
mod router;
mod scheduler;
mod series;
mod state;
mod store;
mod telemetry;
mod web;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Settings;
use db::Db;
use live::{LiveStateCache, StalenessPolicy};
use router::TopicRouter;
use scheduler::ScheduleEngine;
use series::RollingSeriesStore;
use state::SystemState;
use telemetry::Telemetry;

/// Inbound messages buffered between the broker driver and the dispatcher.
const INBOUND_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let settings = Settings::from_env();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&settings.db_url).await?;
    db.migrate().await?;

    // ── Config file (seed devices, charts, schedules) ───────────────
    let cfg = config::load_or_default(&settings.config_path)?;
    config::apply(&cfg, &db).await?;
    let offset = cfg.schedule.offset()?;

    // The database is the source of truth for devices and charts.
    let devices = db.load_devices().await?;
    let charts = db.load_charts().await?;
    if devices.is_empty() {
        warn!("no devices configured in the database");
    }
    info!(devices = devices.len(), charts = charts.len(), "db ready");

    // ── Shared state (ephemeral, for the HTTP API) ──────────────────
    let shared = SystemState::shared();
    shared.write().record_system("hub started".to_string());

    // ── Broker ──────────────────────────────────────────────────────
    let (broker, eventloop) = broker::open(&settings.broker);
    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

    let mut state_rx = broker.watch_state();
    let state_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let s = *state_rx.borrow_and_update();
            state_shared.write().record_broker(s);
        }
    });

    info!(
        host = %settings.broker.host,
        port = settings.broker.port,
        client_id = %settings.broker.client_id,
        "connecting to broker"
    );
    broker.connect(eventloop, inbound_tx);

    // ── Telemetry wiring ────────────────────────────────────────────
    let router = Arc::new(TopicRouter::new(broker.clone()));
    let series = Arc::new(RollingSeriesStore::new(cfg.telemetry.series_capacity));
    let live = Arc::new(LiveStateCache::new(StalenessPolicy {
        environment: Some(time::Duration::seconds(
            cfg.telemetry.environment_stale_sec as i64,
        )),
        ..StalenessPolicy::default()
    }));
    let telemetry = Arc::new(Telemetry::new(
        Arc::clone(&router),
        Arc::clone(&series),
        Arc::clone(&live),
    ));

    telemetry
        .attach_environment(&cfg.telemetry.environment_topic)
        .await;
    for n in &cfg.nutrients {
        telemetry.attach_nutrient(&n.id, &n.topic).await;
    }
    telemetry.reload(&devices, &charts).await;

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        broker: broker.clone(),
        series,
        live,
        telemetry,
        db: db.clone(),
        heartbeat: Duration::from_secs(cfg.telemetry.heartbeat_sec),
    };
    let web_port = settings.web_port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────
    let store = Arc::new(db);
    let engine = ScheduleEngine::new(
        store.clone(),
        store.clone(),
        store,
        broker.clone(),
        Arc::clone(&shared),
        offset,
    );
    tokio::spawn(engine.run());

    // ── Inbound dispatch ────────────────────────────────────────────
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            msg = inbound_rx.recv() => {
                let Some(msg) = msg else {
                    warn!("broker driver stopped");
                    break;
                };
                router.dispatch(&msg.topic, &msg.payload);
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!("failed to listen for ctrl-c: {e}");
                }
                info!("shutdown requested");
                break;
            }
        }
    }

    shared.write().record_system("hub stopping".to_string());
    info!("hub stopped");
    Ok(())
}
