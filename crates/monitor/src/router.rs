//! Inbound command routing: `<prefix>/<plant>/water` doses a pump,
//! `<prefix>/<plant>/{wet,dry}_point/set` persists a calibration point.
//!
//! Threshold commands only touch the durable store. The live plant picks the
//! value up on the next reconcile tick.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{MonitorError, Result};
use crate::plant::{Plant, PlantSet};
use crate::thresholds::{threshold_key, Point, ThresholdStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Water,
    SetPoint(Point),
}

/// Outcome of a successfully routed command. Both run on the blocking
/// pool; the handle resolves when the work ends and the task has logged it.
pub enum Dispatched {
    Watering(JoinHandle<Result<()>>),
    StoringThreshold(JoinHandle<Result<()>>),
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn payload_str<'a>(topic: &str, payload: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(payload)
        .map(str::trim)
        .map_err(|_| MonitorError::MalformedCommand {
            topic: topic.to_string(),
            reason: "payload is not UTF-8".to_string(),
        })
}

/// Parse a water payload: non-negative seconds as an ASCII float.
pub(crate) fn parse_seconds(topic: &str, payload: &[u8]) -> Result<f64> {
    let s = payload_str(topic, payload)?;
    match s.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
        _ => Err(MonitorError::MalformedCommand {
            topic: topic.to_string(),
            reason: format!("expected seconds, got {s:?}"),
        }),
    }
}

/// Extract a threshold payload. The value is stored verbatim; numeric
/// validation happens when it is applied to the plant.
pub(crate) fn parse_threshold<'a>(topic: &str, payload: &'a [u8]) -> Result<&'a str> {
    let s = payload_str(topic, payload)?;
    let reason = if s.is_empty() {
        "empty threshold value"
    } else if s.chars().any(char::is_control) {
        "threshold value contains control characters"
    } else {
        return Ok(s);
    };
    Err(MonitorError::MalformedCommand {
        topic: topic.to_string(),
        reason: reason.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct CommandRouter {
    routes: HashMap<String, (Arc<Plant>, Action)>,
    store: Arc<ThresholdStore>,
}

impl CommandRouter {
    /// Build the topic table once from the plant set.
    pub fn new(plants: &PlantSet, store: Arc<ThresholdStore>) -> Self {
        let mut routes = HashMap::new();
        for (plant, topics) in plants.iter() {
            routes.insert(topics.water.clone(), (Arc::clone(plant), Action::Water));
            routes.insert(
                topics.wet_point_set.clone(),
                (Arc::clone(plant), Action::SetPoint(Point::Wet)),
            );
            routes.insert(
                topics.dry_point_set.clone(),
                (Arc::clone(plant), Action::SetPoint(Point::Dry)),
            );
        }
        Self { routes, store }
    }

    /// Every topic to subscribe to, sorted.
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    pub fn resolve(&self, topic: &str) -> Option<(&Arc<Plant>, Action)> {
        self.routes.get(topic).map(|(p, a)| (p, *a))
    }

    /// Route one inbound message. Must be called from within a tokio
    /// runtime; pump doses and file writes are handed to the blocking pool
    /// so the bus keeps delivering while they run.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<Dispatched> {
        let (plant, action) =
            self.resolve(topic)
                .ok_or_else(|| MonitorError::MalformedCommand {
                    topic: topic.to_string(),
                    reason: "unknown topic".to_string(),
                })?;

        match action {
            Action::Water => {
                let secs = parse_seconds(topic, payload)?;
                let plant = Arc::clone(plant);
                debug!(plant = %plant.name(), secs, "water command received");
                let handle = tokio::task::spawn_blocking(move || {
                    let result = plant.water(secs);
                    match &result {
                        Ok(()) => info!(plant = %plant.name(), secs, "watering complete"),
                        Err(e @ MonitorError::PumpBusy { .. }) => {
                            warn!(plant = %plant.name(), "water command rejected: {e}")
                        }
                        Err(e) => error!(plant = %plant.name(), "watering failed: {e}"),
                    }
                    result
                });
                Ok(Dispatched::Watering(handle))
            }
            Action::SetPoint(point) => {
                let value = parse_threshold(topic, payload)?.to_string();
                let key = threshold_key(plant.name(), point);
                let store = Arc::clone(&self.store);
                let handle = tokio::task::spawn_blocking(move || {
                    let result = store.set(&key, &value);
                    match &result {
                        Ok(()) => info!(%key, %value, "threshold stored, applies on next reconcile"),
                        Err(e) => error!(%key, "threshold not stored: {e}"),
                    }
                    result
                });
                Ok(Dispatched::StoringThreshold(handle))
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::tests::{FakePump, FakeSensor};
    use crate::plant::{Calibration, PlantTopics};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<ThresholdStore>,
        pump: Arc<FakePump>,
        router: CommandRouter,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ThresholdStore::open(dir.path().join(".env")));
        let pump = FakePump::new();
        let plants = ["Monstera", "Fern"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let plant = Arc::new(Plant::new(
                    *name,
                    i as u8 + 1,
                    i as u8 + 1,
                    Calibration {
                        wet_point: 800.0,
                        dry_point: 100.0,
                    },
                    0.5,
                    FakeSensor::new(450.0),
                    pump.clone(),
                ));
                (plant, PlantTopics::new("plant_monitor", name))
            })
            .collect();
        let plants = PlantSet::new(plants);
        let router = CommandRouter::new(&plants, Arc::clone(&store));
        Fixture {
            _dir: dir,
            store,
            pump,
            router,
        }
    }

    async fn store_threshold(router: &CommandRouter, topic: &str, payload: &[u8]) -> Result<()> {
        match router.dispatch(topic, payload)? {
            Dispatched::StoringThreshold(handle) => handle.await.unwrap(),
            Dispatched::Watering(_) => panic!("expected threshold"),
        }
    }

    // -- Payload parsing ----------------------------------------------------

    #[test]
    fn parse_seconds_accepts_floats_with_whitespace() {
        assert_eq!(parse_seconds("t", b"2.5").unwrap(), 2.5);
        assert_eq!(parse_seconds("t", b" 10\n").unwrap(), 10.0);
        assert_eq!(parse_seconds("t", b"0").unwrap(), 0.0);
    }

    #[test]
    fn parse_seconds_rejects_garbage() {
        for bad in [&b"abc"[..], b"", b"-3", b"inf", b"NaN", b"\xff\xfe"] {
            assert!(
                matches!(
                    parse_seconds("t", bad),
                    Err(MonitorError::MalformedCommand { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn parse_threshold_keeps_text_verbatim() {
        assert_eq!(parse_threshold("t", b" 820 ").unwrap(), "820");
        assert_eq!(parse_threshold("t", b"abc").unwrap(), "abc");
        assert!(parse_threshold("t", b"  ").is_err());
    }

    #[test]
    fn parse_threshold_rejects_control_characters() {
        for bad in [&b"820\nCACTUS_DRY_POINT=999"[..], b"1\r2", b"7\x00"] {
            assert!(
                matches!(
                    parse_threshold("t", bad),
                    Err(MonitorError::MalformedCommand { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }

    // -- Topic table ----------------------------------------------------------

    #[test]
    fn routes_cover_every_plant_command_topic() {
        let f = fixture();
        assert_eq!(
            f.router.topics(),
            vec![
                "plant_monitor/fern/dry_point/set",
                "plant_monitor/fern/water",
                "plant_monitor/fern/wet_point/set",
                "plant_monitor/monstera/dry_point/set",
                "plant_monitor/monstera/water",
                "plant_monitor/monstera/wet_point/set",
            ]
        );
    }

    #[test]
    fn resolve_maps_topic_to_plant_and_action() {
        let f = fixture();
        let (plant, action) = f.router.resolve("plant_monitor/fern/wet_point/set").unwrap();
        assert_eq!(plant.name(), "Fern");
        assert_eq!(action, Action::SetPoint(Point::Wet));

        let (plant, action) = f.router.resolve("plant_monitor/monstera/water").unwrap();
        assert_eq!(plant.name(), "Monstera");
        assert_eq!(action, Action::Water);
    }

    #[test]
    fn resolve_unknown_topics() {
        let f = fixture();
        assert!(f.router.resolve("plant_monitor/cactus/water").is_none());
        assert!(f.router.resolve("plant_monitor/fern").is_none());
        assert!(f.router.resolve("").is_none());
    }

    // -- Dispatch -------------------------------------------------------------

    #[tokio::test]
    async fn unknown_topic_is_malformed() {
        let f = fixture();
        assert!(matches!(
            f.router.dispatch("plant_monitor/cactus/water", b"5"),
            Err(MonitorError::MalformedCommand { .. })
        ));
    }

    #[tokio::test]
    async fn water_command_doses_the_plant() {
        let f = fixture();
        match f.router.dispatch("plant_monitor/fern/water", b"1.5").unwrap() {
            Dispatched::Watering(handle) => handle.await.unwrap().unwrap(),
            Dispatched::StoringThreshold(_) => panic!("expected watering"),
        }
        assert_eq!(f.pump.doses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_water_payload_is_dropped() {
        let f = fixture();
        assert!(f.router.dispatch("plant_monitor/fern/water", b"lots").is_err());
        assert_eq!(f.pump.doses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn threshold_command_only_updates_the_store() {
        let f = fixture();
        let (plant, _) = f.router.resolve("plant_monitor/monstera/wet_point/set").unwrap();
        let before = plant.calibration();

        store_threshold(&f.router, "plant_monitor/monstera/wet_point/set", b"820")
            .await
            .unwrap();

        assert_eq!(f.store.get_all().unwrap()["MONSTERA_WET_POINT"], "820");
        assert_eq!(plant.calibration(), before);
    }

    #[tokio::test]
    async fn malformed_threshold_is_stored_verbatim() {
        let f = fixture();
        store_threshold(&f.router, "plant_monitor/fern/dry_point/set", b"abc")
            .await
            .unwrap();
        assert_eq!(f.store.get_all().unwrap()["FERN_DRY_POINT"], "abc");
    }

    #[tokio::test]
    async fn threshold_command_cannot_write_other_keys() {
        let f = fixture();
        assert!(matches!(
            f.router.dispatch(
                "plant_monitor/monstera/wet_point/set",
                b"820\nFERN_DRY_POINT=999"
            ),
            Err(MonitorError::MalformedCommand { .. })
        ));
        assert!(f.store.get_all().unwrap().is_empty());

        // Quotes are kept as part of the value for this key only.
        store_threshold(&f.router, "plant_monitor/monstera/wet_point/set", b"'820'")
            .await
            .unwrap();
        let snap = f.store.get_all().unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap["MONSTERA_WET_POINT"], "'820'");
    }

    #[tokio::test]
    async fn unreachable_store_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ThresholdStore::open(dir.path().join("gone").join(".env")));
        let plant = Arc::new(Plant::new(
            "Fern",
            1,
            1,
            Calibration {
                wet_point: 800.0,
                dry_point: 100.0,
            },
            0.5,
            FakeSensor::new(450.0),
            FakePump::new(),
        ));
        let plants = PlantSet::new(vec![(plant, PlantTopics::new("p", "Fern"))]);
        let router = CommandRouter::new(&plants, store);

        assert!(matches!(
            store_threshold(&router, "p/fern/wet_point/set", b"5").await,
            Err(MonitorError::ConfigUnreadable { .. })
        ));
    }
}
