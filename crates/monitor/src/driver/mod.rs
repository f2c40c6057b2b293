//! Sensor and pump capabilities. The `gpio` feature gates the Grow HAT
//! driver; without it (or when GPIO is unavailable at runtime) the soil
//! simulator stands in for the hardware.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

#[cfg(feature = "gpio")]
pub mod grow;
pub mod sim;

/// Moisture sensor capability, addressed by channel.
pub trait SensorPort: Send + Sync {
    /// Raw moisture reading (pulses per second). `0` and `1` mean the
    /// device has not produced a valid reading yet.
    fn read(&self, channel: u8) -> Result<f64>;

    /// Saturation as computed and rounded by the device itself (0.0..=1.0).
    /// Must not advance the sequence returned by `read`.
    fn device_saturation(&self, channel: u8) -> Result<f64>;

    fn set_wet_point(&self, channel: u8, value: f64);

    fn set_dry_point(&self, channel: u8, value: f64);
}

/// Pump capability, addressed by channel.
pub trait PumpPort: Send + Sync {
    /// Run the pump at `speed` (0.0..=1.0) for `timeout`. Blocks until the
    /// dose has finished.
    fn dose(&self, channel: u8, speed: f64, timeout: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub enum DriverKind {
    Hardware,
    Simulated,
}

/// The selected driver, shared by every plant.
#[derive(Clone)]
pub struct Driver {
    pub kind: DriverKind,
    pub sensor: Arc<dyn SensorPort>,
    pub pump: Arc<dyn PumpPort>,
}

impl Driver {
    pub fn simulated(sim: sim::SimulatedDriver) -> Self {
        let sim = Arc::new(sim);
        Self {
            kind: DriverKind::Simulated,
            sensor: sim.clone(),
            pump: sim,
        }
    }
}

/// Pick the driver once at startup.
#[cfg(feature = "gpio")]
pub fn detect(channels: &[u8], scenario: sim::Scenario) -> Driver {
    match grow::GrowHat::new(channels) {
        Ok(hat) => {
            let hat = Arc::new(hat);
            tracing::info!(?channels, "grow hat driver initialised");
            Driver {
                kind: DriverKind::Hardware,
                sensor: hat.clone(),
                pump: hat,
            }
        }
        Err(e) => {
            tracing::warn!("gpio unavailable ({e:#}); falling back to simulated driver");
            Driver::simulated(sim::SimulatedDriver::new(scenario, channels))
        }
    }
}

/// Pick the driver once at startup.
#[cfg(not(feature = "gpio"))]
pub fn detect(channels: &[u8], scenario: sim::Scenario) -> Driver {
    tracing::info!(?channels, %scenario, "built without gpio; using simulated driver");
    Driver::simulated(sim::SimulatedDriver::new(scenario, channels))
}
