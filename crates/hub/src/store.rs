//! Persistent-store contracts the core reads from and writes to, plus the
//! record types that cross them.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chart {
    pub id: String,
    pub name: String,
    pub topic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    On,
    Off,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    /// Command payload sent when a schedule stores none.
    pub fn default_payload(&self) -> &'static str {
        match self {
            Self::On => "1",
            Self::Off => "0",
        }
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            other => bail!("unknown action '{other}' (use on/off)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Inactive,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => bail!("unknown schedule status '{other}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub device_ids: Vec<String>,
    /// Wall-clock trigger, `HH:MM` 24h.
    pub time: String,
    /// Localized weekday names.
    pub days: Vec<String>,
    pub action: Action,
    pub payload: Option<String>,
    pub status: ScheduleStatus,
}

impl Schedule {
    pub fn command_payload(&self) -> String {
        match self.payload.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => self.action.default_payload().to_string(),
        }
    }

    pub fn runs_on(&self, day: &str) -> bool {
        self.days.iter().any(|d| d.trim().eq_ignore_ascii_case(day))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub schedule_id: String,
    pub device_id: String,
    pub outcome: Outcome,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>>;
    async fn find_by_topic(&self, topic: &str) -> Result<Option<Device>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Active schedules whose time equals `time` and whose days include `day`.
    async fn find_active_due_now(&self, time: &str, day: &str) -> Result<Vec<Schedule>>;
}

#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> Result<()>;
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(action: Action, payload: Option<&str>) -> Schedule {
        Schedule {
            id: "s1".into(),
            name: "Morning".into(),
            device_ids: vec!["d1".into()],
            time: "07:00".into(),
            days: vec!["Senin".into(), "Rabu".into()],
            action,
            payload: payload.map(str::to_string),
            status: ScheduleStatus::Active,
        }
    }

    #[test]
    fn payload_defaults_follow_action() {
        assert_eq!(schedule(Action::On, None).command_payload(), "1");
        assert_eq!(schedule(Action::Off, None).command_payload(), "0");
    }

    #[test]
    fn blank_payload_falls_back_to_default() {
        assert_eq!(schedule(Action::On, Some("  ")).command_payload(), "1");
    }

    #[test]
    fn stored_payload_wins() {
        assert_eq!(schedule(Action::Off, Some("STOP")).command_payload(), "STOP");
    }

    #[test]
    fn runs_on_is_case_insensitive() {
        let s = schedule(Action::On, None);
        assert!(s.runs_on("senin"));
        assert!(s.runs_on("Rabu"));
        assert!(!s.runs_on("Minggu"));
    }

    #[test]
    fn action_parsing() {
        assert_eq!("ON".parse::<Action>().unwrap(), Action::On);
        assert_eq!(" off ".parse::<Action>().unwrap(), Action::Off);
        assert!("toggle".parse::<Action>().is_err());
    }

    #[test]
    fn status_parsing() {
        assert_eq!(
            "Active".parse::<ScheduleStatus>().unwrap(),
            ScheduleStatus::Active
        );
        assert!("paused".parse::<ScheduleStatus>().is_err());
    }
}
