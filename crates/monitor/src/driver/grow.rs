//! Grow HAT driver over Raspberry Pi GPIO (`rppal`).
//!
//! Each capacitive moisture sensor outputs a pulse train whose frequency
//! falls as the soil gets wetter. Falling edges are timestamped from an
//! interrupt and the reading is the pulse rate over the last second. Pumps
//! are driven with software PWM where the duty cycle is the dose speed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

use super::{PumpPort, SensorPort};
use crate::error::{self, MonitorError};

/// BCM pins of moisture channels 1..=3.
const MOISTURE_PINS: [u8; 3] = [23, 8, 25];
/// BCM pins of pump channels 1..=3.
const PUMP_PINS: [u8; 3] = [17, 27, 22];

const PUMP_PWM_HZ: f64 = 10_000.0;
const PULSE_WINDOW: Duration = Duration::from_secs(1);

/// Device-side calibration defaults, matching the sensor vendor's.
const DEFAULT_WET_POINT: f64 = 0.7;
const DEFAULT_DRY_POINT: f64 = 27.6;

fn bcm_pin(pins: &[u8; 3], channel: u8) -> Option<u8> {
    channel
        .checked_sub(1)
        .and_then(|i| pins.get(i as usize))
        .copied()
}

struct SensorChannel {
    /// Keeps the interrupt registered for the lifetime of the driver.
    _pin: Mutex<InputPin>,
    edges: Arc<Mutex<VecDeque<Instant>>>,
    started: Instant,
    /// (wet_point, dry_point)
    points: Mutex<(f64, f64)>,
}

impl SensorChannel {
    fn pulse_rate(&self) -> f64 {
        let now = Instant::now();
        if now.duration_since(self.started) < PULSE_WINDOW {
            return 0.0;
        }

        let mut edges = self.edges.lock().unwrap_or_else(PoisonError::into_inner);
        while edges
            .front()
            .is_some_and(|t| now.duration_since(*t) > PULSE_WINDOW)
        {
            edges.pop_front();
        }
        edges.len() as f64 / PULSE_WINDOW.as_secs_f64()
    }
}

pub struct GrowHat {
    sensors: HashMap<u8, SensorChannel>,
    pumps: HashMap<u8, Mutex<OutputPin>>,
}

impl GrowHat {
    /// Claim the moisture and pump pins for `channels` (1..=3).
    pub fn new(channels: &[u8]) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;
        let mut sensors = HashMap::new();
        let mut pumps = HashMap::new();

        for &channel in channels {
            let (Some(sensor_bcm), Some(pump_bcm)) =
                (bcm_pin(&MOISTURE_PINS, channel), bcm_pin(&PUMP_PINS, channel))
            else {
                anyhow::bail!("grow hat channel {channel} out of range (1-3)");
            };

            let edges = Arc::new(Mutex::new(VecDeque::new()));
            let mut pin = gpio
                .get(sensor_bcm)
                .with_context(|| format!("moisture pin {sensor_bcm} unavailable"))?
                .into_input();
            let sink = Arc::clone(&edges);
            pin.set_async_interrupt(Trigger::FallingEdge, move |_level| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(Instant::now());
            })
            .with_context(|| format!("failed to watch moisture pin {sensor_bcm}"))?;

            sensors.insert(
                channel,
                SensorChannel {
                    _pin: Mutex::new(pin),
                    edges,
                    started: Instant::now(),
                    points: Mutex::new((DEFAULT_WET_POINT, DEFAULT_DRY_POINT)),
                },
            );

            let mut pump = gpio
                .get(pump_bcm)
                .with_context(|| format!("pump pin {pump_bcm} unavailable"))?
                .into_output();
            pump.set_low();
            pumps.insert(channel, Mutex::new(pump));

            tracing::info!(channel, sensor_bcm, pump_bcm, "grow channel registered");
        }

        Ok(Self { sensors, pumps })
    }

    fn sensor(&self, channel: u8) -> error::Result<&SensorChannel> {
        self.sensors
            .get(&channel)
            .ok_or_else(|| MonitorError::SensorUnavailable {
                channel,
                reason: "channel not registered".to_string(),
            })
    }
}

impl SensorPort for GrowHat {
    fn read(&self, channel: u8) -> error::Result<f64> {
        Ok(self.sensor(channel)?.pulse_rate())
    }

    fn device_saturation(&self, channel: u8) -> error::Result<f64> {
        let sensor = self.sensor(channel)?;
        let (wet, dry) = *sensor.points.lock().unwrap_or_else(PoisonError::into_inner);
        let range = wet - dry;
        if range == 0.0 {
            return Ok(0.0);
        }
        let fraction = ((sensor.pulse_rate() - dry) / range).clamp(0.0, 1.0);
        Ok((fraction * 100.0).round() / 100.0)
    }

    fn set_wet_point(&self, channel: u8, value: f64) {
        if let Some(sensor) = self.sensors.get(&channel) {
            sensor.points.lock().unwrap_or_else(PoisonError::into_inner).0 = value;
        }
    }

    fn set_dry_point(&self, channel: u8, value: f64) {
        if let Some(sensor) = self.sensors.get(&channel) {
            sensor.points.lock().unwrap_or_else(PoisonError::into_inner).1 = value;
        }
    }
}

impl PumpPort for GrowHat {
    fn dose(&self, channel: u8, speed: f64, timeout: Duration) -> error::Result<()> {
        let pump = self
            .pumps
            .get(&channel)
            .ok_or_else(|| MonitorError::ActuationFailure {
                channel,
                reason: "channel not registered".to_string(),
            })?;
        let mut pin = pump.lock().unwrap_or_else(PoisonError::into_inner);

        pin.set_pwm_frequency(PUMP_PWM_HZ, speed.clamp(0.0, 1.0))
            .map_err(|e| MonitorError::ActuationFailure {
                channel,
                reason: e.to_string(),
            })?;

        thread::sleep(timeout);

        // Stop the pump even if clearing PWM failed.
        let cleared = pin.clear_pwm();
        pin.set_low();
        cleared.map_err(|e| MonitorError::ActuationFailure {
            channel,
            reason: e.to_string(),
        })
    }
}
