//! Deployment settings from the environment, plus TOML config file loading,
//! validation, and database seeding for devices, charts, and schedules.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use time::macros::format_description;
use time::UtcOffset;

use crate::db::Db;
use crate::live::ENVIRONMENT_ID;
use crate::scheduler::{is_day_name, parse_clock};
use crate::store::{Action, Chart, Device, Schedule, ScheduleStatus};
use crate::telemetry::{HUMIDITY_SERIES, TEMPERATURE_SERIES};

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_sec: u64,
}

impl BrokerSettings {
    pub fn from_env() -> Self {
        Self {
            host: env_or("MQTT_HOST", "127.0.0.1"),
            port: env_parse("MQTT_PORT", 1883),
            client_id: env_or("MQTT_CLIENT_ID", "hydro-hub"),
            keep_alive_sec: 30,
        }
    }
}

/// Process-level knobs read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub db_url: String,
    pub config_path: String,
    pub web_port: u16,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            broker: BrokerSettings::from_env(),
            db_url: env_or("DB_URL", "sqlite:hydro.db?mode=rwc"),
            config_path: env_or("CONFIG_PATH", "config.toml"),
            web_port: env_parse("WEB_PORT", 8080),
        }
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub charts: Vec<ChartEntry>,
    #[serde(default)]
    pub nutrients: Vec<NutrientEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub environment_topic: String,
    pub series_capacity: usize,
    pub environment_stale_sec: u64,
    pub heartbeat_sec: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            environment_topic: "env/sensor".into(),
            series_capacity: crate::series::DEFAULT_CAPACITY,
            environment_stale_sec: 10,
            heartbeat_sec: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    /// Offset the schedule clock runs in, `+HH:MM` / `-HH:MM`.
    pub utc_offset: String,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            utc_offset: "+07:00".into(),
        }
    }
}

impl ScheduleSection {
    pub fn offset(&self) -> Result<UtcOffset> {
        let format = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
        UtcOffset::parse(self.utc_offset.trim(), format)
            .with_context(|| format!("bad utc_offset '{}' (use +HH:MM)", self.utc_offset))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartEntry {
    pub id: String,
    pub name: String,
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NutrientEntry {
    pub id: String,
    pub name: String,
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub device_ids: Vec<String>,
    pub time: String,
    pub days: Vec<String>,
    pub action: String,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "active".into()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Pushes `"{ctx}: duplicate id"` / `"{ctx}: id is empty"` for one entry.
fn check_id<'a>(
    id: &'a str,
    ctx: &str,
    seen: &mut HashSet<&'a str>,
    errors: &mut Vec<String>,
) {
    if id.trim().is_empty() {
        errors.push(format!("{ctx}: id is empty"));
    } else if !seen.insert(id) {
        errors.push(format!("{ctx}: duplicate id"));
    }
}

fn entry_ctx(section: &str, i: usize, id: &str) -> String {
    if id.is_empty() {
        format!("{section}[{i}]")
    } else {
        format!("{section} '{id}'")
    }
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_sections(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_topic_entries(&mut errors);
        self.validate_shared_ids(&mut errors);
        self.validate_schedules(&mut errors);

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

    fn validate_sections(&self, errors: &mut Vec<String>) {
        let t = &self.telemetry;
        if t.environment_topic.trim().is_empty() {
            errors.push("telemetry: environment_topic is empty".into());
        }
        if t.series_capacity == 0 {
            errors.push("telemetry: series_capacity must be positive".into());
        }
        if t.environment_stale_sec == 0 {
            errors.push("telemetry: environment_stale_sec must be positive".into());
        }
        if t.heartbeat_sec == 0 {
            errors.push("telemetry: heartbeat_sec must be positive".into());
        }
        if let Err(e) = self.schedule.offset() {
            errors.push(format!("schedule: {e}"));
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, d) in self.devices.iter().enumerate() {
            let ctx = entry_ctx("device", i, &d.id);
            check_id(&d.id, &ctx, &mut seen, errors);
            if d.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }
            if matches!(&d.topic, Some(t) if t.trim().is_empty()) {
                errors.push(format!("{ctx}: topic is empty (omit it instead)"));
            }
        }
    }

    fn validate_topic_entries(&self, errors: &mut Vec<String>) {
        let charts = self.charts.iter().map(|c| ("chart", &c.id, &c.topic));
        let nutrients = self.nutrients.iter().map(|n| ("nutrient", &n.id, &n.topic));

        // Charts and nutrients both own a series window keyed by id.
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, (section, id, topic)) in charts.chain(nutrients).enumerate() {
            let ctx = entry_ctx(section, i, id);
            check_id(id, &ctx, &mut seen, errors);
            if topic.trim().is_empty() {
                errors.push(format!("{ctx}: topic is empty"));
            }
        }
    }

    /// Devices, nutrients and the climate reading share live-state ids; the
    /// climate reading also owns two series windows.
    fn validate_shared_ids(&self, errors: &mut Vec<String>) {
        const RESERVED_SERIES: [&str; 2] = [TEMPERATURE_SERIES, HUMIDITY_SERIES];

        let nutrient_ids: HashSet<&str> = self.nutrients.iter().map(|n| n.id.as_str()).collect();
        for (i, d) in self.devices.iter().enumerate() {
            let ctx = entry_ctx("device", i, &d.id);
            if d.id == ENVIRONMENT_ID {
                errors.push(format!("{ctx}: id is reserved"));
            } else if nutrient_ids.contains(d.id.as_str()) {
                errors.push(format!("{ctx}: id is also used by a nutrient"));
            }
        }
        for (i, n) in self.nutrients.iter().enumerate() {
            if n.id == ENVIRONMENT_ID || RESERVED_SERIES.contains(&n.id.as_str()) {
                errors.push(format!("{}: id is reserved", entry_ctx("nutrient", i, &n.id)));
            }
        }
        for (i, c) in self.charts.iter().enumerate() {
            if RESERVED_SERIES.contains(&c.id.as_str()) {
                errors.push(format!("{}: id is reserved", entry_ctx("chart", i, &c.id)));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = entry_ctx("schedule", i, &s.id);
            check_id(&s.id, &ctx, &mut seen, errors);

            if s.device_ids.iter().all(|d| d.trim().is_empty()) {
                errors.push(format!("{ctx}: device_ids is empty"));
            }
            if parse_clock(&s.time).is_none() {
                errors.push(format!("{ctx}: time '{}' is not HH:MM", s.time));
            }
            if s.days.is_empty() {
                errors.push(format!("{ctx}: days is empty"));
            }
            for day in s.days.iter().filter(|d| !is_day_name(d)) {
                errors.push(format!("{ctx}: unknown day '{day}'"));
            }
            if let Err(e) = s.action.parse::<Action>() {
                errors.push(format!("{ctx}: {e}"));
            }
            if let Err(e) = s.status.parse::<ScheduleStatus>() {
                errors.push(format!("{ctx}: {e}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
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

/// Like [`load`], but a missing file yields the defaults so the hub can run
/// unconfigured. A present but invalid file is still an error.
pub fn load_or_default(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(%path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    load(path)
}

impl ScheduleEntry {
    fn to_schedule(&self) -> Result<Schedule> {
        Ok(Schedule {
            id: self.id.clone(),
            name: self.name.clone(),
            device_ids: self
                .device_ids
                .iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect(),
            time: self.time.trim().to_string(),
            days: self.days.iter().map(|d| d.trim().to_string()).collect(),
            action: self.action.parse()?,
            payload: self.payload.clone(),
            status: self.status.parse()?,
        })
    }
}

/// Upsert all devices, charts, and schedules from the config into the
/// database. Nutrients live only in the config.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for d in &config.devices {
        db.upsert_device(&Device {
            id: d.id.clone(),
            name: d.name.clone(),
            topic: d.topic.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert device '{}'", d.id))?;
    }

    for c in &config.charts {
        db.upsert_chart(&Chart {
            id: c.id.clone(),
            name: c.name.clone(),
            topic: c.topic.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert chart '{}'", c.id))?;
    }

    for s in &config.schedules {
        let schedule = s
            .to_schedule()
            .with_context(|| format!("invalid schedule '{}'", s.id))?;
        db.upsert_schedule(&schedule)
            .await
            .with_context(|| format!("failed to upsert schedule '{}'", s.id))?;
    }

    tracing::info!(
        devices = config.devices.len(),
        charts = config.charts.len(),
        nutrients = config.nutrients.len(),
        schedules = config.schedules.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
