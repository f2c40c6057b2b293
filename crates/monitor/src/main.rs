mod config;
mod driver;
mod error;
mod plant;
mod reconcile;
mod router;
mod telemetry;
mod thresholds;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use driver::sim::Scenario;
use error::MonitorError;
use plant::PlantSet;
use router::{CommandRouter, Dispatched};
use telemetry::TelemetryLoop;
use thresholds::ThresholdStore;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Driver ──────────────────────────────────────────────────────
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let driver = driver::detect(&cfg.channels(), scenario);
    info!(kind = ?driver.kind, "driver selected");

    // ── Threshold store ─────────────────────────────────────────────
    let store = Arc::new(ThresholdStore::open(&cfg.threshold_file));
    match store.reload() {
        Ok(()) => info!(path = %store.path().display(), "threshold store loaded"),
        Err(e) => warn!("using configured calibration, threshold store unavailable: {e}"),
    }

    // ── Plants ──────────────────────────────────────────────────────
    let plants = Arc::new(PlantSet::from_config(
        &cfg.plants,
        &cfg.mqtt,
        cfg.pump_speed,
        &driver,
        &store,
    ));
    if plants.is_empty() {
        warn!("no plants configured; nothing will be published");
    }
    for (plant, topics) in plants.iter() {
        let cal = plant.calibration();
        info!(
            plant = %plant.name(),
            sensor_channel = plant.sensor_channel(),
            pump_channel = plant.pump_channel(),
            wet_point = cal.wet_point,
            dry_point = cal.dry_point,
            device_saturation = ?plant.device_saturation(),
            topic = %topics.telemetry,
            "plant ready"
        );
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
    if let Some(user) = &cfg.mqtt.username {
        mqttoptions.set_credentials(user, cfg.mqtt.password.clone().unwrap_or_default());
    }
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    let router = CommandRouter::new(&plants, Arc::clone(&store));

    // ── Telemetry loop ──────────────────────────────────────────────
    let telemetry = TelemetryLoop::new(Arc::clone(&plants), Arc::clone(&store), client.clone());
    tokio::spawn(telemetry::run(
        telemetry,
        Duration::from_secs(cfg.interval_sec),
        Duration::from_secs(cfg.startup_delay_sec),
    ));

    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        plants = plants.len(),
        "plant monitor started"
    );

    tokio::select! {
        _ = run_bus(eventloop, client, router) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for ctrl-c: {e}");
            }
            info!("shutting down");
        }
    }
    Ok(())
}

/// Drive the MQTT connection and route inbound commands. Never returns.
async fn run_bus(mut eventloop: EventLoop, client: AsyncClient, router: CommandRouter) {
    let filters: Vec<SubscribeFilter> = router
        .topics()
        .into_iter()
        .map(|t| SubscribeFilter::new(t.to_string(), QoS::AtLeastOnce))
        .collect();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match router.dispatch(&p.topic, &p.payload) {
                    // Detached; the blocking task logs its own outcome.
                    Ok(Dispatched::Watering(task) | Dispatched::StoringThreshold(task)) => {
                        drop(task)
                    }
                    Err(e @ MonitorError::MalformedCommand { .. }) => {
                        warn!("dropping command: {e}")
                    }
                    Err(e) => error!(topic = %p.topic, "command failed: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if filters.is_empty() {
                    continue;
                }
                // Subscribing from a separate task keeps this loop polling
                // while the request queue drains.
                let client = client.clone();
                let filters = filters.clone();
                tokio::spawn(async move {
                    let count = filters.len();
                    match client.subscribe_many(filters).await {
                        Ok(()) => info!(topics = count, "subscribed to command topics"),
                        Err(e) => error!("subscribe failed: {e}"),
                    }
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
