//! TOML config loading and validation for the static plant set, the MQTT
//! bus, and the telemetry loop.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;

/// Grow HAT style boards expose three sensor and three pump channels.
const MAX_CHANNEL: u8 = 3;

/// Vendor defaults for the pulse-rate moisture sensors.
const DEFAULT_WET_POINT: f64 = 0.7;
const DEFAULT_DRY_POINT: f64 = 27.6;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,
    #[serde(default = "default_startup_delay_sec")]
    pub startup_delay_sec: u64,
    #[serde(default = "default_threshold_file")]
    pub threshold_file: String,
    #[serde(default = "default_pump_speed")]
    pub pump_speed: f64,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_sec")]
    pub keep_alive_sec: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            topic_prefix: default_topic_prefix(),
            username: None,
            password: None,
            keep_alive_sec: default_keep_alive_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub name: String,
    pub sensor_channel: u8,
    pub pump_channel: u8,
    #[serde(default = "default_wet_point")]
    pub wet_point: f64,
    #[serde(default = "default_dry_point")]
    pub dry_point: f64,
}

fn default_interval_sec() -> u64 {
    30
}
fn default_startup_delay_sec() -> u64 {
    5
}
fn default_threshold_file() -> String {
    ".env".to_string()
}
fn default_pump_speed() -> f64 {
    0.5
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "plant-monitor".to_string()
}
fn default_topic_prefix() -> String {
    "plant_monitor".to_string()
}
fn default_keep_alive_sec() -> u64 {
    30
}
fn default_wet_point() -> f64 {
    DEFAULT_WET_POINT
}
fn default_dry_point() -> f64 {
    DEFAULT_DRY_POINT
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Plant names become topic segments and store keys.
fn is_safe_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Config {
    /// Validate the config. Returns every violation found, not just the
    /// first one.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_general(&mut errors);
        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_general(&self, errors: &mut Vec<String>) {
        if self.interval_sec == 0 {
            errors.push("interval_sec must be positive".to_string());
        }
        if !(self.pump_speed > 0.0 && self.pump_speed <= 1.0) {
            errors.push(format!(
                "pump_speed {} out of range (0.0, 1.0]",
                self.pump_speed
            ));
        }
        if self.threshold_file.trim().is_empty() {
            errors.push("threshold_file is empty".to_string());
        }
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if self.mqtt.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt.keep_alive_sec {} must be at least 5",
                self.mqtt.keep_alive_sec
            ));
        }
        if self.mqtt.topic_prefix.contains(['+', '#']) {
            errors.push(format!(
                "mqtt.topic_prefix '{}' must not contain wildcards",
                self.mqtt.topic_prefix
            ));
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<String> = HashSet::new();
        let mut seen_sensors: HashSet<u8> = HashSet::new();
        let mut seen_pumps: HashSet<u8> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.name.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !is_safe_name(&p.name) {
                errors.push(format!(
                    "{}: name may only contain letters, digits, '_' and '-'",
                    ctx()
                ));
            } else if !seen_names.insert(p.name.to_lowercase()) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            // ── Channels ────────────────────────────────────────
            if !(1..=MAX_CHANNEL).contains(&p.sensor_channel) {
                errors.push(format!(
                    "{}: sensor_channel {} out of range (1-{MAX_CHANNEL})",
                    ctx(),
                    p.sensor_channel
                ));
            } else if !seen_sensors.insert(p.sensor_channel) {
                errors.push(format!(
                    "{}: sensor_channel {} is already used by another plant",
                    ctx(),
                    p.sensor_channel
                ));
            }
            if !(1..=MAX_CHANNEL).contains(&p.pump_channel) {
                errors.push(format!(
                    "{}: pump_channel {} out of range (1-{MAX_CHANNEL})",
                    ctx(),
                    p.pump_channel
                ));
            } else if !seen_pumps.insert(p.pump_channel) {
                errors.push(format!(
                    "{}: pump_channel {} is already used by another plant",
                    ctx(),
                    p.pump_channel
                ));
            }

            // ── Calibration ─────────────────────────────────────
            if !p.wet_point.is_finite() || !p.dry_point.is_finite() {
                errors.push(format!("{}: wet_point and dry_point must be finite", ctx()));
            } else if p.wet_point == p.dry_point {
                errors.push(format!(
                    "{}: wet_point and dry_point are both {}, calibration range is zero",
                    ctx(),
                    p.wet_point
                ));
            }
        }
    }

    /// Every channel the driver needs to claim.
    pub fn channels(&self) -> Vec<u8> {
        let mut channels: Vec<u8> = self
            .plants
            .iter()
            .flat_map(|p| [p.sensor_channel, p.pump_channel])
            .collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    /// Apply deployment overrides from the environment.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = get("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = get("MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid MQTT_PORT: {port:?}"))?;
        }
        if let Some(user) = get("MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = get("MQTT_PASSWORD") {
            self.mqtt.password = Some(pass);
        }
        if let Some(path) = get("THRESHOLD_FILE") {
            self.threshold_file = path;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply env overrides to, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env(|k| env::var(k).ok().filter(|v| !v.is_empty()))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        plants = config.plants.len(),
        interval_sec = config.interval_sec,
        threshold_file = %config.threshold_file,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_plant() -> PlantEntry {
        PlantEntry {
            name: "Monstera".into(),
            sensor_channel: 1,
            pump_channel: 1,
            wet_point: DEFAULT_WET_POINT,
            dry_point: DEFAULT_DRY_POINT,
        }
    }

    fn valid_config() -> Config {
        let mut cfg: Config = toml::from_str("").unwrap();
        cfg.plants.push(valid_plant());
        cfg
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
interval_sec = 60
threshold_file = "/var/lib/plant-monitor/thresholds.env"
pump_speed = 0.7

[mqtt]
host = "broker.local"
topic_prefix = "home/plants"
username = "grow"

[[plants]]
name = "Monstera"
sensor_channel = 1
pump_channel = 1
wet_point = 750
dry_point = 100

[[plants]]
name = "Fern"
sensor_channel = 2
pump_channel = 2
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.interval_sec, 60);
        assert_eq!(config.pump_speed, 0.7);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.username.as_deref(), Some("grow"));
        assert_eq!(config.plants.len(), 2);
        assert_eq!(config.plants[0].wet_point, 750.0);
        assert_eq!(config.plants[1].dry_point, DEFAULT_DRY_POINT);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.interval_sec, 30);
        assert_eq!(config.startup_delay_sec, 5);
        assert_eq!(config.threshold_file, ".env");
        assert_eq!(config.mqtt.client_id, "plant-monitor");
        assert_eq!(config.mqtt.topic_prefix, "plant_monitor");
        assert!(config.plants.is_empty());
    }

    #[test]
    fn plant_missing_channel_fails_to_parse() {
        let toml_str = r#"
[[plants]]
name = "Monstera"
sensor_channel = 1
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    // -- Env overrides ----------------------------------------------------

    #[test]
    fn env_overrides_mqtt_and_store() {
        let vars: HashMap<&str, &str> = [
            ("MQTT_HOST", "10.0.0.2"),
            ("MQTT_PORT", "8883"),
            ("MQTT_PASSWORD", "s3cret"),
            ("THRESHOLD_FILE", "/tmp/t.env"),
        ]
        .into_iter()
        .collect();
        let mut cfg = valid_config();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.mqtt.host, "10.0.0.2");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.mqtt.password.as_deref(), Some("s3cret"));
        assert_eq!(cfg.mqtt.username, None);
        assert_eq!(cfg.threshold_file, "/tmp/t.env");
    }

    #[test]
    fn env_bad_port_rejected() {
        let mut cfg = valid_config();
        let err = cfg
            .apply_env(|k| (k == "MQTT_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid MQTT_PORT"));
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = valid_config();
        cfg.interval_sec = 0;
        assert_validation_err(&cfg, "interval_sec must be positive");
    }

    #[test]
    fn short_keep_alive_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.keep_alive_sec = 2;
        assert_validation_err(&cfg, "keep_alive_sec 2 must be at least 5");
    }

    #[test]
    fn pump_speed_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.pump_speed = 0.0;
        assert_validation_err(&cfg, "pump_speed 0 out of range");
        cfg.pump_speed = 1.5;
        assert_validation_err(&cfg, "pump_speed 1.5 out of range");
    }

    #[test]
    fn wildcard_prefix_rejected() {
        let mut cfg = valid_config();
        cfg.mqtt.topic_prefix = "plants/#".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.plants[0].name = " ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn unsafe_name_rejected() {
        let mut cfg = valid_config();
        cfg.plants[0].name = "spider/plant".into();
        assert_validation_err(&cfg, "may only contain");
    }

    #[test]
    fn duplicate_name_ignores_case() {
        let mut cfg = valid_config();
        cfg.plants.push(PlantEntry {
            name: "MONSTERA".into(),
            sensor_channel: 2,
            pump_channel: 2,
            ..valid_plant()
        });
        assert_validation_err(&cfg, "duplicate name");
    }

    #[test]
    fn channel_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.plants[0].sensor_channel = 0;
        cfg.plants[0].pump_channel = 4;
        assert_validation_err(&cfg, "sensor_channel 0 out of range");
        assert_validation_err(&cfg, "pump_channel 4 out of range");
    }

    #[test]
    fn shared_channels_rejected() {
        let mut cfg = valid_config();
        cfg.plants.push(PlantEntry {
            name: "Fern".into(),
            ..valid_plant()
        });
        assert_validation_err(&cfg, "sensor_channel 1 is already used");
        assert_validation_err(&cfg, "pump_channel 1 is already used");
    }

    #[test]
    fn zero_calibration_range_rejected() {
        let mut cfg = valid_config();
        cfg.plants[0].wet_point = 10.0;
        cfg.plants[0].dry_point = 10.0;
        assert_validation_err(&cfg, "calibration range is zero");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.interval_sec = 0;
        cfg.plants[0].name = "".into();
        cfg.plants[0].sensor_channel = 9;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("plants[0]: name is empty"), "got: {msg}");
    }

    #[test]
    fn channels_are_deduplicated() {
        let mut cfg = valid_config();
        cfg.plants.push(PlantEntry {
            name: "Fern".into(),
            sensor_channel: 3,
            pump_channel: 2,
            ..valid_plant()
        });
        assert_eq!(cfg.channels(), vec![1, 2, 3]);
    }

    #[test]
    fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[[plants]]\nname = \"Fern\"\nsensor_channel = 2\npump_channel = 2\n",
        )
        .unwrap();
        let cfg = load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.plants[0].name, "Fern");

        std::fs::write(
            &path,
            "[[plants]]\nname = \"Fern\"\nsensor_channel = 7\npump_channel = 2\n",
        )
        .unwrap();
        assert!(load(path.to_str().unwrap()).is_err());
    }
}
