//! Simulated Grow-style moisture sensors and pumps for running off the Pi.
//!
//! Readings are pulse rates (Hz): dry soil pulses fast, wet soil slowly.
//! The simulator models:
//! - a random walk with mean reversion and a slow drying drift
//! - per-channel offsets and electronic noise
//! - occasional spikes
//! - the not-ready sentinel on the first read of each channel
//! - pumps that wet the soil in proportion to dose length

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{PumpPort, SensorPort};
use crate::error::{MonitorError, Result};

/// Pulse rate of saturated soil.
const SIM_RAW_WET: f64 = 3.0;
/// Pulse rate of bone-dry soil.
const SIM_RAW_DRY: f64 = 27.0;
/// Readings never fall below this, keeping them clear of the sentinel.
const SIM_FLOOR: f64 = 2.0;
/// Pulse-rate drop per second of dosing at full speed.
const WET_RATE_PER_SEC: f64 = 1.5;

/// Sample from N(0,1) via Irwin-Hall: sum of 12 uniforms minus 6.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Soil profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-range start drifting toward dry.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// Noisy with frequent spikes.
    Flaky,
    /// Starts near the wet end and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }

    fn profile(self) -> Profile {
        match self {
            Scenario::Drying => Profile {
                drift: 0.05,
                walk_sigma: 0.25,
                mean_reversion: 0.02,
                noise_sigma: 0.15,
                spike_prob: 0.03,
                spike_sigma: 3.0,
                start_frac: 0.5,
            },
            Scenario::Stable => Profile {
                drift: 0.005,
                walk_sigma: 0.1,
                mean_reversion: 0.05,
                noise_sigma: 0.07,
                spike_prob: 0.005,
                spike_sigma: 1.5,
                start_frac: 0.5,
            },
            Scenario::Flaky => Profile {
                drift: 0.03,
                walk_sigma: 0.4,
                mean_reversion: 0.02,
                noise_sigma: 0.35,
                spike_prob: 0.10,
                spike_sigma: 5.0,
                start_frac: 0.5,
            },
            Scenario::Wet => Profile {
                drift: 0.01,
                walk_sigma: 0.13,
                mean_reversion: 0.02,
                noise_sigma: 0.1,
                spike_prob: 0.02,
                spike_sigma: 2.5,
                start_frac: 0.2,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Profile {
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f64,
    spike_sigma: f64,
    /// 0.0 starts at the wet end, 1.0 at the dry end.
    start_frac: f64,
}

struct ChannelState {
    base: f64,
    offset: f64,
    noise_sigma: f64,
    ready: bool,
    /// Most recent value returned by `read`.
    last: f64,
    wet_point: f64,
    dry_point: f64,
}

pub struct SimulatedDriver {
    profile: Profile,
    channels: Mutex<HashMap<u8, ChannelState>>,
}

impl SimulatedDriver {
    pub fn new(scenario: Scenario, channels: &[u8]) -> Self {
        let profile = scenario.profile();
        let range = SIM_RAW_DRY - SIM_RAW_WET;
        let start = SIM_RAW_WET + profile.start_frac * range;

        let channels = channels
            .iter()
            .map(|&ch| {
                let state = ChannelState {
                    base: (start + gaussian(0.0, range * 0.03)).clamp(SIM_RAW_WET, SIM_RAW_DRY),
                    offset: gaussian(0.0, range * 0.02),
                    noise_sigma: profile.noise_sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3),
                    ready: false,
                    last: 0.0,
                    wet_point: SIM_RAW_WET,
                    dry_point: SIM_RAW_DRY,
                };
                (ch, state)
            })
            .collect();

        Self {
            profile,
            channels: Mutex::new(channels),
        }
    }

    fn with_channel<T>(&self, channel: u8, f: impl FnOnce(&mut ChannelState) -> T) -> Result<T> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get_mut(&channel)
            .map(f)
            .ok_or_else(|| MonitorError::SensorUnavailable {
                channel,
                reason: "no simulated sensor on this channel".to_string(),
            })
    }

    fn sample(&self, state: &mut ChannelState) -> f64 {
        let p = &self.profile;
        let centre = (SIM_RAW_DRY + SIM_RAW_WET) / 2.0;

        let pull = p.mean_reversion * (centre - state.base);
        let walk = gaussian(0.0, p.walk_sigma);
        state.base =
            (state.base + p.drift + pull + walk).clamp(SIM_RAW_WET - 0.5, SIM_RAW_DRY + 0.5);

        if !state.ready {
            state.ready = true;
            return 0.0;
        }

        let noise = gaussian(0.0, state.noise_sigma);
        let spike = if fastrand::f64() < p.spike_prob {
            gaussian(0.0, p.spike_sigma)
        } else {
            0.0
        };

        (state.base + state.offset + noise + spike).max(SIM_FLOOR)
    }
}

impl SensorPort for SimulatedDriver {
    fn read(&self, channel: u8) -> Result<f64> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let state = channels
            .get_mut(&channel)
            .ok_or_else(|| MonitorError::SensorUnavailable {
                channel,
                reason: "no simulated sensor on this channel".to_string(),
            })?;
        let raw = self.sample(state);
        state.last = raw;
        Ok(raw)
    }

    /// Derived from the last reading; does not advance the soil model.
    fn device_saturation(&self, channel: u8) -> Result<f64> {
        self.with_channel(channel, |s| {
            let range = s.wet_point - s.dry_point;
            if range == 0.0 {
                return 0.0;
            }
            let fraction = ((s.last - s.dry_point) / range).clamp(0.0, 1.0);
            (fraction * 100.0).round() / 100.0
        })
    }

    fn set_wet_point(&self, channel: u8, value: f64) {
        let _ = self.with_channel(channel, |s| s.wet_point = value);
    }

    fn set_dry_point(&self, channel: u8, value: f64) {
        let _ = self.with_channel(channel, |s| s.dry_point = value);
    }
}

impl PumpPort for SimulatedDriver {
    fn dose(&self, channel: u8, speed: f64, timeout: Duration) -> Result<()> {
        if !self.channels.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&channel) {
            return Err(MonitorError::ActuationFailure {
                channel,
                reason: "no simulated pump on this channel".to_string(),
            });
        }

        tracing::debug!(channel, speed, secs = timeout.as_secs_f64(), "[sim] pump on");
        thread::sleep(timeout);

        let wetting = WET_RATE_PER_SEC * speed.clamp(0.0, 1.0) * timeout.as_secs_f64();
        self.with_channel(channel, |s| {
            s.base = (s.base - wetting).max(SIM_RAW_WET - 0.5);
        })
        .map_err(|_| MonitorError::ActuationFailure {
            channel,
            reason: "simulated pump vanished".to_string(),
        })?;
        tracing::debug!(channel, "[sim] pump off");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn warmed(scenario: Scenario, channels: &[u8]) -> SimulatedDriver {
        let sim = SimulatedDriver::new(scenario, channels);
        for &ch in channels {
            sim.read(ch).unwrap();
        }
        sim
    }

    fn mean_reading(sim: &SimulatedDriver, channel: u8, n: usize) -> f64 {
        (0..n).map(|_| sim.read(channel).unwrap()).sum::<f64>() / n as f64
    }

    #[test]
    fn first_read_is_not_ready_sentinel() {
        let sim = SimulatedDriver::new(Scenario::Stable, &[1, 2]);
        assert_eq!(sim.read(1).unwrap(), 0.0);
        assert_eq!(sim.read(2).unwrap(), 0.0);
        assert!(sim.read(1).unwrap() >= SIM_FLOOR);
    }

    #[test]
    fn readings_stay_clear_of_sentinel() {
        let sim = warmed(Scenario::Flaky, &[1]);
        for _ in 0..500 {
            let v = sim.read(1).unwrap();
            assert!(v >= SIM_FLOOR, "reading fell into sentinel range: {v}");
        }
    }

    #[test]
    fn unknown_channel_is_unavailable() {
        let sim = SimulatedDriver::new(Scenario::Stable, &[1]);
        assert!(matches!(
            sim.read(3),
            Err(MonitorError::SensorUnavailable { channel: 3, .. })
        ));
    }

    #[test]
    fn unknown_pump_channel_fails_actuation() {
        let sim = SimulatedDriver::new(Scenario::Stable, &[1]);
        assert!(matches!(
            sim.dose(2, 0.5, Duration::from_millis(1)),
            Err(MonitorError::ActuationFailure { channel: 2, .. })
        ));
    }

    #[test]
    fn dosing_lowers_pulse_rate() {
        let sim = warmed(Scenario::Stable, &[1]);
        let before = mean_reading(&sim, 1, 20);

        for _ in 0..10 {
            sim.dose(1, 1.0, Duration::from_millis(200)).unwrap();
        }
        let after = mean_reading(&sim, 1, 20);

        assert!(
            after < before,
            "dosing should lower readings: before={before:.2} after={after:.2}"
        );
    }

    #[test]
    fn device_saturation_is_rounded_fraction() {
        let sim = warmed(Scenario::Stable, &[1]);
        for _ in 0..50 {
            sim.read(1).unwrap();
            let s = sim.device_saturation(1).unwrap();
            assert!((0.0..=1.0).contains(&s));
            assert_eq!((s * 100.0).round() / 100.0, s);
        }
    }

    #[test]
    fn device_saturation_does_not_consume_readings() {
        let sim = SimulatedDriver::new(Scenario::Stable, &[1]);
        for _ in 0..5 {
            sim.device_saturation(1).unwrap();
        }
        // The not-ready sentinel is still the first reading.
        assert_eq!(sim.read(1).unwrap(), 0.0);

        let raw = sim.read(1).unwrap();
        let expected = ((raw - SIM_RAW_DRY) / (SIM_RAW_WET - SIM_RAW_DRY)).clamp(0.0, 1.0);
        let s = sim.device_saturation(1).unwrap();
        assert_eq!(s, (expected * 100.0).round() / 100.0);
        assert_eq!(sim.device_saturation(1).unwrap(), s);
    }

    #[test]
    fn wet_scenario_starts_wetter_than_drying() {
        let wet = warmed(Scenario::Wet, &[1]);
        let avg = mean_reading(&wet, 1, 10);
        let midpoint = (SIM_RAW_DRY + SIM_RAW_WET) / 2.0;
        assert!(avg < midpoint, "wet scenario avg={avg:.2} mid={midpoint:.2}");
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy(" Flaky "), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
    }

    #[test]
    fn scenario_display_round_trips() {
        for s in [Scenario::Drying, Scenario::Stable, Scenario::Flaky, Scenario::Wet] {
            assert_eq!(Scenario::from_str_lossy(&s.to_string()), s);
        }
    }
}
