//! Periodic telemetry publisher with threshold reconciliation.
//!
//! ## Loop states
//!
//! ```text
//! INIT ──▶ POLLING ──[after publish]──▶ RECONCILING
//!             ▲                              │
//!             └──────────[next tick]─────────┘
//! ```
//!
//! INIT happens in `main` (plants built, calibration loaded, bus connected)
//! and in [`TelemetryLoop::new`], which captures the first store snapshot.
//! Each tick publishes every plant's reading, then diffs the store against
//! the previous snapshot and reapplies thresholds only to plants whose keys
//! changed.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, QoS};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::plant::PlantSet;
use crate::reconcile::changed_plants;
use crate::thresholds::{Snapshot, ThresholdStore};

pub struct TelemetryLoop {
    plants: Arc<PlantSet>,
    store: Arc<ThresholdStore>,
    mqtt: AsyncClient,
    /// Store contents as of the previous reconcile.
    baseline: Snapshot,
}

impl TelemetryLoop {
    pub fn new(plants: Arc<PlantSet>, store: Arc<ThresholdStore>, mqtt: AsyncClient) -> Self {
        let baseline = store.get_all().unwrap_or_else(|e| {
            warn!("threshold store unreadable at startup, starting from empty baseline: {e}");
            Snapshot::new()
        });
        Self {
            plants,
            store,
            mqtt,
            baseline,
        }
    }

    /// POLLING: queue one reading per plant. Returns how many were queued.
    ///
    /// Never waits on the bus: while the broker is unreachable the request
    /// queue fills up and further readings are dropped.
    pub fn publish(&self) -> usize {
        let mut sent = 0;
        for (plant, topics) in self.plants.iter() {
            let payload = plant.home_assistant_payload();
            match self.mqtt.try_publish(
                topics.telemetry.as_str(),
                QoS::AtLeastOnce,
                false,
                payload.clone().into_bytes(),
            ) {
                Ok(()) => {
                    debug!(plant = %plant.name(), topic = %topics.telemetry, %payload, "telemetry queued");
                    sent += 1;
                }
                Err(ClientError::TryRequest(_)) => {
                    warn!(plant = %plant.name(), "reading dropped, mqtt request queue unavailable")
                }
                Err(e) => error!(plant = %plant.name(), "failed to publish telemetry: {e}"),
            }
        }
        sent
    }

    /// RECONCILING: pick up external or remote threshold edits. Returns the
    /// names of the plants that were reconfigured.
    pub fn reconcile(&mut self) -> Vec<String> {
        let snapshot = match self.store.get_all() {
            Ok(s) => s,
            Err(e) => {
                warn!("skipping reconcile, keeping previous calibration: {e}");
                return Vec::new();
            }
        };

        let changed: Vec<String> = changed_plants(self.plants.names(), &self.baseline, &snapshot)
            .into_iter()
            .map(str::to_string)
            .collect();

        if !changed.is_empty() {
            if let Err(e) = self.store.reload() {
                warn!("skipping reconcile, reload failed: {e}");
                return Vec::new();
            }
            for name in &changed {
                if let Some(plant) = self.plants.get(name) {
                    plant.load_thresholds(&self.store);
                    let cal = plant.calibration();
                    info!(
                        plant = %name,
                        wet_point = cal.wet_point,
                        dry_point = cal.dry_point,
                        "calibration reloaded"
                    );
                }
            }
        }

        self.baseline = snapshot;
        changed
    }

    pub fn tick(&mut self) {
        self.publish();
        self.reconcile();
    }
}

/// Run the loop forever. Intended to be `tokio::spawn`-ed from main.
pub async fn run(mut telemetry: TelemetryLoop, interval: Duration, startup_delay: Duration) {
    // Sensors need a moment to produce their first pulse window.
    tokio::time::sleep(startup_delay).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        plants = telemetry.plants.len(),
        interval_sec = interval.as_secs_f64(),
        "telemetry loop started"
    );

    loop {
        ticker.tick().await;
        telemetry.tick();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
