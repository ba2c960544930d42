//! Clock-driven schedule engine: once per wall-clock minute, publish the
//! command of every active schedule whose `HH:MM` and weekday match.
//!
//! ## Tick
//!
//! ```text
//! sleep to next minute ──▶ broker connected? ──no──▶ skip tick (logged)
//!                                │yes
//!                                ▼
//!            find_active_due_now(HH:MM, day)  ──err──▶ abort tick (logged)
//!                                │
//!                                ▼
//!        for each schedule × device: resolve topic ─▶ publish (QoS 1)
//!                                │
//!                                ▼
//!                 one ExecutionRecord per attempt
//! ```
//!
//! Matching is exact-minute equality, so a schedule fires once during its
//! minute. Minutes missed while the process was paused are not caught up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::QoS;
use time::{Date, OffsetDateTime, UtcOffset, Weekday};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerConnection;
use crate::state::SharedState;
use crate::store::{
    Device, DeviceRegistry, ExecutionLog, ExecutionRecord, Outcome, Schedule, ScheduleStore,
};

/// Added to the sleep so the wake-up lands inside the new minute.
const TICK_SLACK: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

pub const DAY_NAMES: [&str; 7] = ["Senin", "Selasa", "Rabu", "Kamis", "Jumat", "Sabtu", "Minggu"];

pub fn weekday_name(day: Weekday) -> &'static str {
    DAY_NAMES[day.number_days_from_monday() as usize]
}

pub fn is_day_name(s: &str) -> bool {
    DAY_NAMES.iter().any(|d| d.eq_ignore_ascii_case(s.trim()))
}

/// Parse a strict `HH:MM` 24h clock string.
pub fn parse_clock(s: &str) -> Option<(u8, u8)> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: u8 = h.parse().ok()?;
    let m: u8 = m.parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

pub fn format_clock(now: OffsetDateTime) -> String {
    format!("{:02}:{:02}", now.hour(), now.minute())
}

fn until_next_minute(now: OffsetDateTime) -> Duration {
    let into_minute =
        Duration::from_secs(now.second() as u64) + Duration::from_nanos(now.nanosecond() as u64);
    Duration::from_secs(60).saturating_sub(into_minute) + TICK_SLACK
}

/// Admits each wall-clock minute at most once.
#[derive(Debug, Default)]
struct MinuteGate {
    last: Option<(Date, u8, u8)>,
}

impl MinuteGate {
    fn admit(&mut self, now: OffsetDateTime) -> bool {
        let key = (now.date(), now.hour(), now.minute());
        if self.last == Some(key) {
            return false;
        }
        self.last = Some(key);
        true
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Broker was down; nothing was attempted.
    Skipped,
    Ran {
        schedules: usize,
        succeeded: usize,
        failed: usize,
    },
}

pub struct ScheduleEngine {
    schedules: Arc<dyn ScheduleStore>,
    devices: Arc<dyn DeviceRegistry>,
    log: Arc<dyn ExecutionLog>,
    broker: BrokerConnection,
    shared: SharedState,
    offset: UtcOffset,
}

impl ScheduleEngine {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        devices: Arc<dyn DeviceRegistry>,
        log: Arc<dyn ExecutionLog>,
        broker: BrokerConnection,
        shared: SharedState,
        offset: UtcOffset,
    ) -> Self {
        Self {
            schedules,
            devices,
            log,
            broker,
            shared,
            offset,
        }
    }

    /// Run the minute loop forever. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self) {
        info!(offset = ?self.offset, "scheduler started");
        self.shared
            .write()
            .record_scheduler(format!("scheduler started (utc offset {:?})", self.offset));

        let mut gate = MinuteGate::default();
        loop {
            tokio::time::sleep(until_next_minute(OffsetDateTime::now_utc())).await;

            let now = OffsetDateTime::now_utc().to_offset(self.offset);
            if !gate.admit(now) {
                continue;
            }

            if let Err(e) = self.tick(now).await {
                error!("schedule tick aborted: {e:#}");
                self.shared
                    .write()
                    .record_error(format!("schedule tick aborted: {e:#}"));
            }
        }
    }

    /// Evaluate the schedules due at `now` (already in local offset).
    ///
    /// Store read failures abort the tick and are returned. Per-device
    /// failures become error records and do not stop sibling devices.
    pub async fn tick(&self, now: OffsetDateTime) -> Result<TickOutcome> {
        let clock = format_clock(now);
        let day = weekday_name(now.weekday());

        if !self.broker.is_connected() {
            warn!(%clock, day, "broker not connected, skipping schedule tick");
            self.shared
                .write()
                .record_scheduler(format!("{day} {clock}: skipped, broker not connected"));
            return Ok(TickOutcome::Skipped);
        }

        let due = self
            .schedules
            .find_active_due_now(&clock, day)
            .await
            .context("failed to load due schedules")?;

        if due.is_empty() {
            debug!(%clock, day, "no schedules due");
            return Ok(TickOutcome::Ran {
                schedules: 0,
                succeeded: 0,
                failed: 0,
            });
        }

        let mut succeeded = 0;
        let mut failed = 0;

        for schedule in &due {
            let payload = schedule.command_payload();
            info!(
                schedule = %schedule.id,
                devices = schedule.device_ids.len(),
                action = schedule.action.as_str(),
                %payload,
                "schedule due"
            );

            let mut schedule_failed = 0;
            for device_id in &schedule.device_ids {
                let record = self.execute(schedule, device_id, &payload, now).await?;
                match record.outcome {
                    Outcome::Success => succeeded += 1,
                    Outcome::Error => {
                        failed += 1;
                        schedule_failed += 1;
                    }
                }
                if let Err(e) = self.log.append(&record).await {
                    error!(
                        schedule = %schedule.id,
                        device = %device_id,
                        "failed to write execution record: {e:#}"
                    );
                }
            }

            self.shared.write().record_scheduler(format!(
                "{}: {} at {day} {clock} ({} device(s), {schedule_failed} failed)",
                schedule.id,
                schedule.action.as_str(),
                schedule.device_ids.len(),
            ));
        }

        Ok(TickOutcome::Ran {
            schedules: due.len(),
            succeeded,
            failed,
        })
    }

    /// Resolve one device and publish to it. Only a registry read failure is
    /// an `Err`; everything else is captured in the returned record.
    async fn execute(
        &self,
        schedule: &Schedule,
        device_id: &str,
        payload: &str,
        now: OffsetDateTime,
    ) -> Result<ExecutionRecord> {
        let device = self
            .devices
            .find_by_id(device_id)
            .await
            .with_context(|| format!("device lookup failed for '{device_id}'"))?;

        let (outcome, detail) = match device {
            None => {
                warn!(schedule = %schedule.id, device = %device_id, "device not found");
                (Outcome::Error, format!("device '{device_id}' not found"))
            }
            Some(Device { topic, .. }) => match topic.filter(|t| !t.trim().is_empty()) {
                None => {
                    warn!(schedule = %schedule.id, device = %device_id, "device has no topic");
                    (Outcome::Error, format!("device '{device_id}' has no topic"))
                }
                Some(topic) => match self
                    .broker
                    .publish(&topic, payload.as_bytes().to_vec(), QoS::AtLeastOnce)
                    .await
                {
                    Ok(()) => {
                        info!(schedule = %schedule.id, device = %device_id, %topic, "command published");
                        self.shared.write().record_command(device_id, &topic, payload);
                        (Outcome::Success, format!("published '{payload}' to {topic}"))
                    }
                    Err(e) => {
                        error!(schedule = %schedule.id, device = %device_id, %topic, "publish failed: {e}");
                        (Outcome::Error, format!("publish to {topic} failed: {e}"))
                    }
                },
            },
        };

        Ok(ExecutionRecord {
            schedule_id: schedule.id.clone(),
            device_id: device_id.to_string(),
            outcome,
            timestamp: now,
            detail,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
