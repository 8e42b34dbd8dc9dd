//! Threshold alerts on sensor readings.
//!
//! An alert fires when a reading crosses into a configured bound. It does
//! not fire again until the reading has returned inside the bound, so a
//! greenhouse sitting at 36 °C produces one alert, not one per message.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::telemetry::DeviceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "below" => Self::Below,
            _ => Self::Above,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bounds {
    pub above: Option<f64>,
    pub below: Option<f64>,
    /// Actuator payload key switched on when a bound is crossed.
    pub actuator: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Crossing {
    pub direction: Direction,
    pub threshold: f64,
    pub value: f64,
    pub actuator: Option<String>,
}

impl Crossing {
    pub fn message(&self, name: &str, unit: &str) -> String {
        format!(
            "{name} {}{unit} is {} threshold {}{unit}",
            self.value,
            self.direction.as_str(),
            self.threshold
        )
    }
}

pub struct AlertMonitor {
    bounds: HashMap<DeviceKey, Bounds>,
    breached: Mutex<HashSet<(DeviceKey, Direction)>>,
}

impl AlertMonitor {
    pub fn new(bounds: HashMap<DeviceKey, Bounds>) -> Self {
        Self {
            bounds,
            breached: Mutex::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::new(HashMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Feed one reading; returns the bounds it newly crossed.
    pub async fn evaluate(&self, device: DeviceKey, value: f64) -> Vec<Crossing> {
        let Some(b) = self.bounds.get(&device) else {
            return Vec::new();
        };

        let checks = [
            (Direction::Above, b.above, b.above.is_some_and(|t| value > t)),
            (Direction::Below, b.below, b.below.is_some_and(|t| value < t)),
        ];

        let mut breached = self.breached.lock().await;
        let mut crossings = Vec::new();
        for (direction, threshold, outside) in checks {
            let Some(threshold) = threshold else { continue };
            if outside {
                if breached.insert((device, direction)) {
                    crossings.push(Crossing {
                        direction,
                        threshold,
                        value,
                        actuator: b.actuator.clone(),
                    });
                }
            } else {
                breached.remove(&(device, direction));
            }
        }
        crossings
    }

    /// Forget that `(device, direction)` was crossed, so the next reading
    /// outside the bound fires again. Used when a crossing could not be
    /// recorded.
    pub async fn rearm(&self, device: DeviceKey, direction: Direction) {
        self.breached.lock().await.remove(&(device, direction));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> AlertMonitor {
        let mut bounds = HashMap::new();
        bounds.insert(
            DeviceKey::Temperature,
            Bounds {
                above: Some(35.0),
                below: Some(5.0),
                actuator: Some("ventilateur".into()),
            },
        );
        bounds.insert(
            DeviceKey::SoilHumidity,
            Bounds {
                below: Some(30.0),
                ..Bounds::default()
            },
        );
        AlertMonitor::new(bounds)
    }

    #[tokio::test]
    async fn inside_bounds_is_quiet() {
        let m = monitor();
        assert!(m.evaluate(DeviceKey::Temperature, 22.0).await.is_empty());
    }

    #[tokio::test]
    async fn crossing_fires_once() {
        let m = monitor();
        let c = m.evaluate(DeviceKey::Temperature, 36.0).await;
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].direction, Direction::Above);
        assert_eq!(c[0].threshold, 35.0);

        assert!(m.evaluate(DeviceKey::Temperature, 37.0).await.is_empty());
    }

    #[tokio::test]
    async fn returning_inside_rearms() {
        let m = monitor();
        assert_eq!(m.evaluate(DeviceKey::SoilHumidity, 25.0).await.len(), 1);
        assert!(m.evaluate(DeviceKey::SoilHumidity, 40.0).await.is_empty());
        assert_eq!(m.evaluate(DeviceKey::SoilHumidity, 20.0).await.len(), 1);
    }

    #[tokio::test]
    async fn threshold_value_itself_is_inside() {
        let m = monitor();
        assert!(m.evaluate(DeviceKey::Temperature, 35.0).await.is_empty());
        assert!(m.evaluate(DeviceKey::Temperature, 5.0).await.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_device_never_alerts() {
        let m = monitor();
        assert!(m.evaluate(DeviceKey::Gas, 10_000.0).await.is_empty());
        assert!(AlertMonitor::disabled()
            .evaluate(DeviceKey::Temperature, 99.0)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn crossing_carries_actuator() {
        let m = monitor();
        let c = m.evaluate(DeviceKey::Temperature, 40.0).await;
        assert_eq!(c[0].actuator.as_deref(), Some("ventilateur"));
        assert_eq!(m.evaluate(DeviceKey::SoilHumidity, 10.0).await[0].actuator, None);
    }

    #[tokio::test]
    async fn rearm_lets_the_same_excursion_fire_again() {
        let m = monitor();
        assert_eq!(m.evaluate(DeviceKey::Temperature, 36.0).await.len(), 1);
        m.rearm(DeviceKey::Temperature, Direction::Above).await;
        assert_eq!(m.evaluate(DeviceKey::Temperature, 36.5).await.len(), 1);
        assert!(m.evaluate(DeviceKey::Temperature, 37.0).await.is_empty());
    }

    #[test]
    fn message_mentions_value_and_threshold() {
        let c = Crossing {
            direction: Direction::Below,
            threshold: 30.0,
            value: 21.5,
            actuator: None,
        };
        assert_eq!(
            c.message("Humidité du sol", "%"),
            "Humidité du sol 21.5% is below threshold 30%"
        );
    }

    #[test]
    fn direction_db_round_trip() {
        assert_eq!(Direction::from_db(Direction::Below.as_str()), Direction::Below);
        assert_eq!(Direction::from_db(Direction::Above.as_str()), Direction::Above);
    }
}
