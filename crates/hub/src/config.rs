//! TOML config file loading and validation for ingest tuning and
//! threshold alerts.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::alerts::Bounds;
use crate::telemetry::{DeviceKey, SignalKind};
use crate::throttle::{ThrottlePolicy, DEFAULT_INTERVAL, DEFAULT_MAX_LOGS};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub thresholds: Vec<ThresholdEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub log_interval_secs: u64,
    pub max_logs_per_window: u32,
    pub identity_cache_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            log_interval_secs: DEFAULT_INTERVAL.as_secs(),
            max_logs_per_window: DEFAULT_MAX_LOGS,
            identity_cache_capacity: 1024,
            broadcast_capacity: 256,
        }
    }
}

impl IngestSettings {
    pub fn policy(&self) -> ThrottlePolicy {
        ThrottlePolicy::new(
            Duration::from_secs(self.log_interval_secs),
            self.max_logs_per_window,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdEntry {
    /// Payload key from the catalog, e.g. "temperature" or "soil".
    pub key: String,
    pub above: Option<f64>,
    pub below: Option<f64>,
    /// Actuator payload key to switch on when the threshold is crossed,
    /// e.g. "pompe_irrigation".
    #[serde(default)]
    pub actuator: Option<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_ingest(&mut errors);
        self.validate_thresholds(&mut errors);

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

    fn validate_ingest(&self, errors: &mut Vec<String>) {
        let s = &self.ingest;
        if s.log_interval_secs == 0 {
            errors.push("ingest: log_interval_secs must be positive".into());
        }
        if s.max_logs_per_window == 0 {
            errors.push("ingest: max_logs_per_window must be at least 1".into());
        }
        if s.identity_cache_capacity == 0 {
            errors.push("ingest: identity_cache_capacity must be at least 1".into());
        }
        if s.broadcast_capacity == 0 {
            errors.push("ingest: broadcast_capacity must be at least 1".into());
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<DeviceKey> = HashSet::new();

        for (i, t) in self.thresholds.iter().enumerate() {
            let ctx = || {
                if t.key.is_empty() {
                    format!("thresholds[{i}]")
                } else {
                    format!("threshold '{}'", t.key)
                }
            };

            // ── Key ─────────────────────────────────────────────
            match DeviceKey::from_key(&t.key) {
                None => errors.push(format!("{}: key is not a known payload key", ctx())),
                Some(device) if device.descriptor().kind != SignalKind::Sensor => {
                    errors.push(format!("{}: key is not a sensor", ctx()));
                }
                // Aliases of one signal count as duplicates.
                Some(device) if !seen.insert(device) => {
                    errors.push(format!("{}: duplicate threshold for '{}'", ctx(), device.descriptor().name));
                }
                Some(_) => {}
            }

            // ── Bounds ──────────────────────────────────────────
            match (t.below, t.above) {
                (None, None) => errors.push(format!("{}: needs `above`, `below` or both", ctx())),
                (Some(below), Some(above)) if below >= above => errors.push(format!(
                    "{}: below ({below}) must be less than above ({above})",
                    ctx()
                )),
                _ => {}
            }
            for (field, v) in [("above", t.above), ("below", t.below)] {
                if v.is_some_and(|v| !v.is_finite()) {
                    errors.push(format!("{}: {field} must be a finite number", ctx()));
                }
            }

            // ── Action ──────────────────────────────────────────
            if let Some(actuator) = &t.actuator {
                match DeviceKey::from_key(actuator) {
                    Some(d) if d.descriptor().kind == SignalKind::Actuator => {}
                    _ => errors.push(format!(
                        "{}: actuator '{actuator}' is not a known actuator key",
                        ctx()
                    )),
                }
            }
        }
    }

    /// Threshold table keyed by device, for the alert monitor. Call after
    /// `validate`; entries with unknown keys are skipped.
    pub fn bounds(&self) -> HashMap<DeviceKey, Bounds> {
        self.thresholds
            .iter()
            .filter_map(|t| {
                DeviceKey::from_key(&t.key).map(|d| {
                    (
                        d,
                        Bounds {
                            above: t.above,
                            below: t.below,
                            actuator: t.actuator.clone(),
                        },
                    )
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }
    load(path)
}

// ===========================================================================
// Tests
// ===========================================================================
