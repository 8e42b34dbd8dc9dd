//! Device payload parsing and the fixed key catalog.
//!
//! Every flat key the greenhouse controller reports is looked up in
//! [`CATALOG`] and turned into a [`Signal`] carrying its canonical name,
//! kind and unit. Keys that are not in the catalog, and catalog keys whose
//! value cannot be interpreted, pass through as [`SignalKind::Unknown`]
//! under their raw key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{IngestError, IngestResult};

// ---------------------------------------------------------------------------
// Kinds & catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Sensor,
    Actuator,
    Unknown,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Actuator => "actuator",
            Self::Unknown => "unknown",
        }
    }

    /// Decode the column value written by [`SignalKind::as_str`].
    pub fn from_db(s: &str) -> Self {
        match s {
            "sensor" => Self::Sensor,
            "actuator" => Self::Actuator,
            _ => Self::Unknown,
        }
    }
}

/// Every signal the controller firmware knows how to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    Temperature,
    AirHumidity,
    SoilHumidity,
    Gas,
    Co2,
    Light,
    WaterLevel,
    Pump,
    Fan,
    Lamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub name: &'static str,
    pub kind: SignalKind,
    pub unit: &'static str,
}

/// Payload key -> device signal. Several firmware revisions used different
/// spellings for the same signal, hence the aliases.
pub const CATALOG: &[(&str, DeviceKey)] = &[
    ("temperature", DeviceKey::Temperature),
    ("humidity", DeviceKey::AirHumidity),
    ("soil", DeviceKey::SoilHumidity),
    ("gas", DeviceKey::Gas),
    ("co2", DeviceKey::Co2),
    ("light", DeviceKey::Light),
    ("humidite", DeviceKey::SoilHumidity),
    ("thermique", DeviceKey::Temperature),
    ("luminosite", DeviceKey::Light),
    ("water_level", DeviceKey::WaterLevel),
    ("waterLevel", DeviceKey::WaterLevel),
    ("pompe", DeviceKey::Pump),
    ("pump", DeviceKey::Pump),
    ("pompe_irrigation", DeviceKey::Pump),
    ("ventilateur", DeviceKey::Fan),
    ("fan", DeviceKey::Fan),
    ("lumiere", DeviceKey::Lamp),
    ("lamp", DeviceKey::Lamp),
];

impl DeviceKey {
    pub const ALL: [DeviceKey; 10] = [
        Self::Temperature,
        Self::AirHumidity,
        Self::SoilHumidity,
        Self::Gas,
        Self::Co2,
        Self::Light,
        Self::WaterLevel,
        Self::Pump,
        Self::Fan,
        Self::Lamp,
    ];

    pub fn from_key(key: &str) -> Option<Self> {
        CATALOG
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, device)| *device)
    }

    /// Reverse lookup by canonical name ("Pompe", "CO2", ...).
    pub fn from_display_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.descriptor().name == name)
    }

    pub fn descriptor(self) -> Descriptor {
        use SignalKind::{Actuator, Sensor};
        let (name, kind, unit) = match self {
            Self::Temperature => ("Température", Sensor, "°C"),
            Self::AirHumidity => ("Humidité de l'air", Sensor, "%"),
            Self::SoilHumidity => ("Humidité du sol", Sensor, "%"),
            Self::Gas => ("Gaz", Sensor, "ppm"),
            Self::Co2 => ("CO2", Sensor, "ppm"),
            Self::Light => ("Luminosité", Sensor, "lux"),
            Self::WaterLevel => ("Niveau d'eau", Sensor, "%"),
            Self::Pump => ("Pompe", Actuator, ""),
            Self::Fan => ("Ventilateur", Actuator, ""),
            Self::Lamp => ("Lumière", Actuator, ""),
        };
        Descriptor { name, kind, unit }
    }
}

// ---------------------------------------------------------------------------
// Value normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorStatus {
    On,
    Off,
    Unknown,
}

/// Normalize the many ways firmware reports a relay state.
pub fn parse_actuator_status(raw: &Value) -> ActuatorStatus {
    match raw {
        Value::Bool(true) => ActuatorStatus::On,
        Value::Bool(false) => ActuatorStatus::Off,
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => ActuatorStatus::On,
            Some(v) if v == 0.0 => ActuatorStatus::Off,
            _ => ActuatorStatus::Unknown,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "yes" => ActuatorStatus::On,
            "off" | "false" | "0" | "no" => ActuatorStatus::Off,
            _ => ActuatorStatus::Unknown,
        },
        _ => ActuatorStatus::Unknown,
    }
}

/// Numbers are kept as sent; numeric strings are converted. Non-finite
/// values are rejected.
fn normalize_sensor_value(raw: &Value) -> Option<Value> {
    match raw {
        Value::Number(n) if n.as_f64().is_some_and(f64::is_finite) => Some(raw.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// One classified field of a device payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Key as it appeared in the payload.
    pub key: String,
    pub device: Option<DeviceKey>,
    pub name: String,
    pub kind: SignalKind,
    pub unit: String,
    pub value: Value,
}

impl Signal {
    fn unknown(key: &str, raw: &Value) -> Self {
        Self {
            key: key.to_string(),
            device: None,
            name: unknown_name(key),
            kind: SignalKind::Unknown,
            unit: String::new(),
            value: raw.clone(),
        }
    }

    pub fn numeric(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Actuator state, only for actuator signals.
    pub fn status(&self) -> Option<bool> {
        match self.kind {
            SignalKind::Actuator => self.value.as_bool(),
            _ => None,
        }
    }
}

/// Entity name for an unknown field. A raw key that spells a catalog name
/// must not land on that catalog entity.
fn unknown_name(key: &str) -> String {
    if DeviceKey::from_display_name(key).is_some() {
        format!("{key} (raw)")
    } else {
        key.to_string()
    }
}

/// Catalog keys first, then exact canonical names, which some controllers
/// send instead of the flat key.
pub fn classify(key: &str, raw: &Value) -> Signal {
    let Some(device) = DeviceKey::from_key(key).or_else(|| DeviceKey::from_display_name(key)) else {
        return Signal::unknown(key, raw);
    };
    let desc = device.descriptor();

    let value = match desc.kind {
        SignalKind::Sensor => normalize_sensor_value(raw),
        SignalKind::Actuator => match parse_actuator_status(raw) {
            ActuatorStatus::On => Some(Value::Bool(true)),
            ActuatorStatus::Off => Some(Value::Bool(false)),
            ActuatorStatus::Unknown => None,
        },
        SignalKind::Unknown => None,
    };

    match value {
        Some(value) => Signal {
            key: key.to_string(),
            device: Some(device),
            name: desc.name.to_string(),
            kind: desc.kind,
            unit: desc.unit.to_string(),
            value,
        },
        None => {
            tracing::warn!(key, value = %raw, "malformed field, storing as unknown");
            Signal::unknown(key, raw)
        }
    }
}

/// Parse a raw device message. Only a JSON object is accepted.
pub fn parse_payload(raw: &[u8]) -> IngestResult<Map<String, Value>> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(IngestError::InvalidPayload(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
        Err(e) => Err(IngestError::InvalidPayload(e.to_string())),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ===========================================================================
// Tests
// ===========================================================================
