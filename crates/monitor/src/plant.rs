//! Plant entities: one sensor channel, one pump channel, and a calibration
//! pair used to derive saturation from raw pulse-rate readings.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::Duration;

use serde::{Serialize, Serializer};
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, PlantEntry};
use crate::driver::{Driver, PumpPort, SensorPort};
use crate::error::{MonitorError, Result};
use crate::thresholds::{threshold_key, Point, ThresholdStore};

/// Raw values the sensor reports before it has a valid reading.
const NOT_READY: [f64; 2] = [0.0, 1.0];

const MOISTURE_DECIMALS: i32 = 6;
const SATURATION_DECIMALS: i32 = 3;

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn is_not_ready(raw: f64) -> bool {
    NOT_READY.contains(&raw)
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// A derived value, or the `"unknown"` symbol when it cannot be computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    Value(f64),
    Unknown,
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Measurement::Value(v) => serializer.serialize_f64(*v),
            Measurement::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measurement::Value(v) => write!(f, "{v}"),
            Measurement::Unknown => write!(f, "unknown"),
        }
    }
}

/// Telemetry payload for one plant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub moisture: Measurement,
    pub saturation: Measurement,
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Raw readings at 100% (`wet_point`) and 0% (`dry_point`) saturation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub wet_point: f64,
    pub dry_point: f64,
}

impl Calibration {
    pub fn range(&self) -> f64 {
        self.wet_point - self.dry_point
    }

    /// Saturation percentage for a raw reading, clamped to 0..=100 and
    /// rounded to 3 decimals. Unknown for the not-ready sentinel or a zero
    /// calibration range.
    pub fn saturation(&self, raw: f64) -> Measurement {
        let range = self.range();
        if is_not_ready(raw) || range == 0.0 || !raw.is_finite() {
            return Measurement::Unknown;
        }
        let pct = (100.0 * (raw - self.dry_point) / range).clamp(0.0, 100.0);
        Measurement::Value(round_to(pct, SATURATION_DECIMALS))
    }
}

/// Raw moisture rounded to 6 decimals, unknown for the not-ready sentinel.
pub fn moisture_from_raw(raw: f64) -> Measurement {
    if is_not_ready(raw) || !raw.is_finite() {
        Measurement::Unknown
    } else {
        Measurement::Value(round_to(raw, MOISTURE_DECIMALS))
    }
}

// ---------------------------------------------------------------------------
// Plant
// ---------------------------------------------------------------------------

/// MQTT topics derived from a plant's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlantTopics {
    pub telemetry: String,
    pub water: String,
    pub wet_point_set: String,
    pub dry_point_set: String,
}

impl PlantTopics {
    pub fn new(prefix: &str, name: &str) -> Self {
        let base = format!("{}/{}", prefix.trim_end_matches('/'), name.to_lowercase());
        Self {
            water: format!("{base}/water"),
            wet_point_set: format!("{base}/wet_point/set"),
            dry_point_set: format!("{base}/dry_point/set"),
            telemetry: base,
        }
    }
}

pub struct Plant {
    name: String,
    sensor_channel: u8,
    pump_channel: u8,
    pump_speed: f64,
    calibration: RwLock<Calibration>,
    /// Held for the duration of a dose.
    dosing: Mutex<()>,
    sensor: Arc<dyn SensorPort>,
    pump: Arc<dyn PumpPort>,
}

impl Plant {
    pub fn new(
        name: impl Into<String>,
        sensor_channel: u8,
        pump_channel: u8,
        calibration: Calibration,
        pump_speed: f64,
        sensor: Arc<dyn SensorPort>,
        pump: Arc<dyn PumpPort>,
    ) -> Self {
        sensor.set_wet_point(sensor_channel, calibration.wet_point);
        sensor.set_dry_point(sensor_channel, calibration.dry_point);
        Self {
            name: name.into(),
            sensor_channel,
            pump_channel,
            pump_speed,
            calibration: RwLock::new(calibration),
            dosing: Mutex::new(()),
            sensor,
            pump,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sensor_channel(&self) -> u8 {
        self.sensor_channel
    }

    pub fn pump_channel(&self) -> u8 {
        self.pump_channel
    }

    pub fn calibration(&self) -> Calibration {
        *self.calibration.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the raw sensor value. Failures are logged and reported as
    /// `None`, which callers surface as "unknown".
    fn raw(&self) -> Option<f64> {
        match self.sensor.read(self.sensor_channel) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(plant = %self.name, "sensor read failed: {e}");
                None
            }
        }
    }

    pub fn moisture(&self) -> Measurement {
        self.raw().map_or(Measurement::Unknown, moisture_from_raw)
    }

    pub fn saturation(&self) -> Measurement {
        match self.raw() {
            Some(raw) => self.calibration().saturation(raw),
            None => Measurement::Unknown,
        }
    }

    /// Saturation as reported by the device (0..=1, pre-rounded). For
    /// diagnostics only.
    pub fn device_saturation(&self) -> Option<f64> {
        self.sensor.device_saturation(self.sensor_channel).ok()
    }

    /// Both derived values from a single sensor sample.
    pub fn reading(&self) -> Reading {
        match self.raw() {
            Some(raw) => Reading {
                moisture: moisture_from_raw(raw),
                saturation: self.calibration().saturation(raw),
            },
            None => Reading {
                moisture: Measurement::Unknown,
                saturation: Measurement::Unknown,
            },
        }
    }

    /// JSON telemetry message `{"moisture": .., "saturation": ..}`.
    pub fn home_assistant_payload(&self) -> String {
        serde_json::to_string(&self.reading()).unwrap_or_else(|e| {
            error!(plant = %self.name, "failed to serialise reading: {e}");
            r#"{"moisture":"unknown","saturation":"unknown"}"#.to_string()
        })
    }

    /// Run the pump for `duration_secs`, blocking until the dose is done.
    /// A second call while a dose is running is rejected.
    pub fn water(&self, duration_secs: f64) -> Result<()> {
        let timeout = Duration::try_from_secs_f64(duration_secs)
            .map_err(|_| MonitorError::InvalidDuration(duration_secs))?;

        let _guard = match self.dosing.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err(MonitorError::PumpBusy {
                    plant: self.name.clone(),
                })
            }
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        info!(plant = %self.name, duration_secs, "watering");
        self.pump.dose(self.pump_channel, self.pump_speed, timeout)
    }

    pub fn set_wet_point(&self, value: f64) {
        self.update_calibration(Some(value), None);
    }

    pub fn set_dry_point(&self, value: f64) {
        self.update_calibration(None, Some(value));
    }

    /// Replace either or both points under a single write lock so readers
    /// never observe a mixed pair.
    pub fn update_calibration(&self, wet_point: Option<f64>, dry_point: Option<f64>) {
        let wet_point = wet_point.filter(|v| v.is_finite());
        let dry_point = dry_point.filter(|v| v.is_finite());
        if wet_point.is_none() && dry_point.is_none() {
            return;
        }

        let mut cal = self.calibration.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(wet) = wet_point {
            debug!(plant = %self.name, wet_point = wet, "setting wet point");
            cal.wet_point = wet;
            self.sensor.set_wet_point(self.sensor_channel, wet);
        }
        if let Some(dry) = dry_point {
            debug!(plant = %self.name, dry_point = dry, "setting dry point");
            cal.dry_point = dry;
            self.sensor.set_dry_point(self.sensor_channel, dry);
        }
    }

    /// Pull this plant's wet/dry points from the store's cached values.
    /// Missing keys keep the current point; unparsable values are logged
    /// and keep the current point.
    pub fn load_thresholds(&self, store: &ThresholdStore) {
        let wet = self.cached_point(store, Point::Wet);
        let dry = self.cached_point(store, Point::Dry);
        self.update_calibration(wet, dry);
    }

    fn cached_point(&self, store: &ThresholdStore, point: Point) -> Option<f64> {
        let key = threshold_key(&self.name, point);
        let raw = store.cached(&key)?;
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Some(v),
            _ => {
                error!(plant = %self.name, %key, value = %raw, "ignoring unparsable threshold");
                None
            }
        }
    }
}

impl fmt::Display for Plant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:\t{}", self.name, self.moisture())
    }
}

// ---------------------------------------------------------------------------
// PlantSet
// ---------------------------------------------------------------------------

/// The fixed set of plants managed by this process, built once at startup.
pub struct PlantSet {
    plants: Vec<(Arc<Plant>, PlantTopics)>,
}

impl PlantSet {
    pub fn new(plants: Vec<(Arc<Plant>, PlantTopics)>) -> Self {
        Self { plants }
    }

    /// Build every configured plant against the chosen driver, then apply
    /// any persisted thresholds.
    pub fn from_config(
        entries: &[PlantEntry],
        mqtt: &MqttConfig,
        pump_speed: f64,
        driver: &Driver,
        store: &ThresholdStore,
    ) -> Self {
        let plants = entries
            .iter()
            .map(|e| {
                let plant = Arc::new(Plant::new(
                    e.name.clone(),
                    e.sensor_channel,
                    e.pump_channel,
                    Calibration {
                        wet_point: e.wet_point,
                        dry_point: e.dry_point,
                    },
                    pump_speed,
                    Arc::clone(&driver.sensor),
                    Arc::clone(&driver.pump),
                ));
                plant.load_thresholds(store);
                let topics = PlantTopics::new(&mqtt.topic_prefix, &e.name);
                (plant, topics)
            })
            .collect();
        Self { plants }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Arc<Plant>, PlantTopics)> {
        self.plants.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Plant>> {
        self.plants
            .iter()
            .map(|(p, _)| p)
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.plants.iter().map(|(p, _)| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plants.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
