//! Stateful greenhouse simulator for local development.
//!
//! Models a small greenhouse controller:
//! - Temporal coherence via random walk with mean reversion
//! - Day/night cycle for temperature and light
//! - Soil drying, with a pump that switches on below 30 % and off above 45 %
//! - Fan and lamp driven by temperature and light
//! - Occasional spikes and dropped fields (sensor flakiness)

use serde::Serialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild spring greenhouse. Moderate noise, rare spikes.
    Temperate,
    /// Hot and dry: temperature regularly crosses 35 °C, soil dries fast.
    /// Exercises the hub's alert path.
    Heatwave,
    /// High noise, frequent spikes, and fields that go missing. Tests the
    /// hub's tolerance of partial payloads.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "heatwave" => Self::Heatwave,
            "flaky" => Self::Flaky,
            _ => Self::Temperate, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperate => write!(f, "temperate"),
            Self::Heatwave => write!(f, "heatwave"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

struct Profile {
    temp_center: f64,
    temp_swing: f64,
    noise: f64,
    soil_drying: f64,
    spike_prob: f32,
    drop_prob: f32,
}

impl Profile {
    fn of(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Temperate => Self {
                temp_center: 22.0,
                temp_swing: 4.0,
                noise: 1.0,
                soil_drying: 0.4,
                spike_prob: 0.01,
                drop_prob: 0.0,
            },
            Scenario::Heatwave => Self {
                temp_center: 33.0,
                temp_swing: 6.0,
                noise: 1.0,
                soil_drying: 1.2,
                spike_prob: 0.01,
                drop_prob: 0.0,
            },
            Scenario::Flaky => Self {
                temp_center: 22.0,
                temp_swing: 4.0,
                noise: 3.0,
                soil_drying: 0.4,
                spike_prob: 0.10,
                drop_prob: 0.10,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Mean-reverting walk
// ---------------------------------------------------------------------------

struct Walk {
    value: f64,
    sigma: f64,
    reversion: f64,
    min: f64,
    max: f64,
}

impl Walk {
    fn new(start: f64, sigma: f64, reversion: f64, min: f64, max: f64) -> Self {
        Self {
            value: start,
            sigma,
            reversion,
            min,
            max,
        }
    }

    /// Advance one tick toward `target`, adding `push` on top.
    fn step(&mut self, target: f64, push: f64) -> f64 {
        let pull = self.reversion * (target - self.value);
        self.value = (self.value + pull + push + gaussian(0.0, self.sigma)).clamp(self.min, self.max);
        self.value
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// One flat telemetry payload. Missing sensor fields are omitted.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soil: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_level: Option<f64>,
    pub pompe: &'static str,
    pub ventilateur: &'static str,
    pub lumiere: &'static str,
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub const PUMP_ON_BELOW: f64 = 30.0;
pub const PUMP_OFF_ABOVE: f64 = 45.0;
const FAN_ON_ABOVE: f64 = 30.0;
const FAN_OFF_BELOW: f64 = 27.0;
const LAMP_ON_BELOW: f64 = 150.0;
const LAMP_OFF_ABOVE: f64 = 300.0;

/// Stateful simulator producing one greenhouse payload per tick.
pub struct GreenhouseSim {
    profile: Profile,
    day_length_s: f64,

    temperature: Walk,
    humidity: Walk,
    soil: Walk,
    gas: Walk,
    co2: Walk,
    light: Walk,
    water_level: Walk,

    pump: bool,
    fan: bool,
    lamp: bool,
}

impl GreenhouseSim {
    /// `day_length_s` controls the day/night cycle length. Use 600 (10 min)
    /// for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, day_length_s: f64) -> Self {
        let profile = Profile::of(scenario);
        let sigma = profile.noise;
        Self {
            temperature: Walk::new(profile.temp_center, 0.3 * sigma, 0.2, -10.0, 55.0),
            humidity: Walk::new(60.0, 1.0 * sigma, 0.1, 0.0, 100.0),
            soil: Walk::new(40.0, 0.5 * sigma, 0.0, 0.0, 100.0),
            gas: Walk::new(400.0, 5.0 * sigma, 0.1, 0.0, 5000.0),
            co2: Walk::new(600.0, 10.0 * sigma, 0.1, 300.0, 5000.0),
            light: Walk::new(500.0, 20.0 * sigma, 0.3, 0.0, 100_000.0),
            water_level: Walk::new(80.0, 0.1, 0.0, 0.0, 100.0),
            profile,
            day_length_s: day_length_s.max(1.0),
            pump: false,
            fan: false,
            lamp: false,
        }
    }

    #[cfg(test)]
    pub fn pump_on(&self) -> bool {
        self.pump
    }

    /// Advance the simulation to `t_s` seconds (any monotonic clock) and
    /// produce the payload for this tick.
    pub fn tick(&mut self, t_s: f64) -> Snapshot {
        // 0 at midnight, 1 at noon.
        let phase = 2.0 * std::f64::consts::PI * t_s / self.day_length_s;
        let daylight = (0.5 - 0.5 * phase.cos()).clamp(0.0, 1.0);

        let temp_target = self.profile.temp_center + self.profile.temp_swing * (2.0 * daylight - 1.0);
        let temperature = self.temperature.step(temp_target, 0.0);

        // Warmer air holds less relative humidity; the fan dries it further.
        let hum_target = 75.0 - 1.2 * (temperature - 20.0) - if self.fan { 5.0 } else { 0.0 };
        let humidity = self.humidity.step(hum_target, 0.0);

        let watering = if self.pump && self.water_level.value > 0.0 { 2.5 } else { 0.0 };
        let soil = self.soil.step(0.0, watering - self.profile.soil_drying);

        let water_level = self
            .water_level
            .step(0.0, if watering > 0.0 { -0.1 } else { 0.08 });

        let gas = self.gas.step(400.0, 0.0);
        let co2_target = if self.fan { 500.0 } else { 700.0 } - 200.0 * daylight;
        let co2 = self.co2.step(co2_target, 0.0);

        let light_target = 20.0 + 900.0 * daylight + if self.lamp { 250.0 } else { 0.0 };
        let light = self.light.step(light_target, 0.0);

        // Actuators react to what was just measured.
        if soil < PUMP_ON_BELOW {
            self.pump = true;
        } else if soil > PUMP_OFF_ABOVE {
            self.pump = false;
        }
        if temperature > FAN_ON_ABOVE {
            self.fan = true;
        } else if temperature < FAN_OFF_BELOW {
            self.fan = false;
        }
        if light < LAMP_ON_BELOW {
            self.lamp = true;
        } else if light > LAMP_OFF_ABOVE {
            self.lamp = false;
        }

        Snapshot {
            temperature: self.emit(temperature, 5.0),
            humidity: self.emit(humidity, 10.0),
            soil: self.emit(soil, 10.0),
            gas: self.emit(gas, 150.0),
            co2: self.emit(co2, 300.0),
            light: self.emit(light, 200.0),
            water_level: self.emit(water_level, 10.0),
            pompe: on_off(self.pump),
            ventilateur: on_off(self.fan),
            lumiere: on_off(self.lamp),
        }
    }

    /// Reported value: true value plus an occasional spike, or nothing when
    /// the field drops out.
    fn emit(&self, value: f64, spike_sigma: f64) -> Option<f64> {
        if fastrand::f32() < self.profile.drop_prob {
            return None;
        }
        let spike = if fastrand::f32() < self.profile.spike_prob {
            gaussian(0.0, spike_sigma)
        } else {
            0.0
        };
        Some(round1(value + spike))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(sim: &mut GreenhouseSim, n: usize) -> Vec<Snapshot> {
        (0..n).map(|i| sim.tick(i as f64 * 60.0)).collect()
    }

    #[test]
    fn readings_within_physical_range() {
        fastrand::seed(7);
        let mut sim = GreenhouseSim::new(Scenario::Flaky, 3600.0);
        for s in run(&mut sim, 500) {
            if let Some(h) = s.humidity {
                assert!((-50.0..=150.0).contains(&h), "humidity out of range: {h}");
            }
            if let Some(t) = s.temperature {
                assert!((-40.0..=90.0).contains(&t), "temperature out of range: {t}");
            }
        }
    }

    #[test]
    fn temporal_coherence() {
        fastrand::seed(11);
        let mut sim = GreenhouseSim::new(Scenario::Temperate, 86_400.0);
        let temps: Vec<f64> = run(&mut sim, 100)
            .iter()
            .filter_map(|s| s.temperature)
            .collect();
        let max_jump = temps
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f64, f64::max);
        // Allow for rare spikes.
        assert!(max_jump < 15.0, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn pump_keeps_soil_within_hysteresis_band() {
        fastrand::seed(3);
        let mut sim = GreenhouseSim::new(Scenario::Heatwave, 600.0);
        let mut saw_pump = false;
        for _ in 0..200 {
            sim.tick(0.0);
            saw_pump |= sim.pump_on();
        }
        assert!(saw_pump, "pump should engage as soil dries");

        // Once regulated, true soil humidity stays near the band.
        for i in 0..200 {
            sim.tick(i as f64);
            let soil = sim.soil.value;
            assert!(
                (PUMP_ON_BELOW - 8.0..=PUMP_OFF_ABOVE + 8.0).contains(&soil),
                "soil drifted out of band: {soil}"
            );
        }
    }

    #[test]
    fn pump_raises_soil_humidity() {
        fastrand::seed(5);
        let mut sim = GreenhouseSim::new(Scenario::Temperate, 600.0);
        sim.soil.value = 20.0;
        sim.tick(0.0);
        assert!(sim.pump_on());

        let before = sim.soil.value;
        for _ in 0..5 {
            sim.tick(0.0);
        }
        assert!(sim.soil.value > before, "soil should rise while pumping");
    }

    #[test]
    fn heatwave_is_hotter_than_temperate() {
        fn mean_temp(scenario: Scenario) -> f64 {
            let mut sim = GreenhouseSim::new(scenario, 3600.0);
            let temps: Vec<f64> = run(&mut sim, 300).iter().filter_map(|s| s.temperature).collect();
            temps.iter().sum::<f64>() / temps.len() as f64
        }
        fastrand::seed(13);
        assert!(mean_temp(Scenario::Heatwave) > mean_temp(Scenario::Temperate) + 5.0);
    }

    #[test]
    fn flaky_scenario_drops_fields() {
        fastrand::seed(17);
        let mut sim = GreenhouseSim::new(Scenario::Flaky, 600.0);
        let missing = run(&mut sim, 200)
            .iter()
            .filter(|s| s.temperature.is_none())
            .count();
        assert!(missing > 0, "flaky scenario should drop some readings");
    }

    #[test]
    fn snapshot_serializes_flat() {
        fastrand::seed(19);
        let mut sim = GreenhouseSim::new(Scenario::Temperate, 600.0);
        let json = serde_json::to_value(sim.tick(0.0)).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 10);
        assert!(obj["temperature"].is_number());
        assert!(matches!(obj["pompe"].as_str(), Some("on" | "off")));
        assert!(obj.values().all(|v| !v.is_object() && !v.is_array()));
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("temperate"), Scenario::Temperate);
        assert_eq!(Scenario::from_str_lossy("HEATWAVE"), Scenario::Heatwave);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Temperate);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Temperate);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Temperate.to_string(), "temperate");
        assert_eq!(Scenario::Heatwave.to_string(), "heatwave");
        assert_eq!(Scenario::Flaky.to_string(), "flaky");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        // With n=5000 the std error is about 0.014, so ±0.15 is generous.
        assert!(mean.abs() < 0.15, "approx_std_normal mean should be near zero: {mean}");
    }
}
