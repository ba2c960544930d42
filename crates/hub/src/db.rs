use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::warn;

use crate::scheduler::parse_clock;
use crate::store::{
    Chart, Device, DeviceRegistry, ExecutionLog, ExecutionRecord, Outcome, Schedule,
    ScheduleStatus, ScheduleStore,
};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct DeviceRow {
    id: String,
    name: String,
    topic: Option<String>,
}

impl From<DeviceRow> for Device {
    fn from(r: DeviceRow) -> Self {
        Device {
            id: r.id,
            name: r.name,
            topic: r.topic,
        }
    }
}

#[derive(FromRow)]
struct ChartRow {
    id: String,
    name: String,
    topic: String,
}

#[derive(FromRow)]
struct ScheduleRow {
    id: String,
    name: String,
    device_ids: String,
    time: String,
    days: String,
    action: String,
    payload: Option<String>,
    status: String,
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<Schedule> {
        let device_ids: Vec<String> = serde_json::from_str(&self.device_ids)
            .with_context(|| format!("device_ids is not a JSON string array: {}", self.device_ids))?;
        let days: Vec<String> = serde_json::from_str(&self.days)
            .with_context(|| format!("days is not a JSON string array: {}", self.days))?;
        if parse_clock(&self.time).is_none() {
            anyhow::bail!("time '{}' is not HH:MM", self.time);
        }
        Ok(Schedule {
            id: self.id,
            name: self.name,
            device_ids,
            time: self.time,
            days,
            action: self.action.parse()?,
            payload: self.payload,
            status: self.status.parse()?,
        })
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    schedule_id: String,
    device_id: String,
    outcome: String,
    detail: String,
    ts: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/hydro/hydro.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database,
        // so keep exactly one alive.
        let in_memory = db_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Devices
    // ----------------------------

    pub async fn upsert_device(&self, d: &Device) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (id, name, topic) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              topic=excluded.topic
            "#,
        )
        .bind(&d.id)
        .bind(&d.name)
        .bind(&d.topic)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn load_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>("SELECT id, name, topic FROM devices ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("load_devices failed")?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    // ----------------------------
    // Charts
    // ----------------------------

    pub async fn upsert_chart(&self, c: &Chart) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO charts (id, name, topic) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              topic=excluded.topic
            "#,
        )
        .bind(&c.id)
        .bind(&c.name)
        .bind(&c.topic)
        .execute(&self.pool)
        .await
        .context("upsert_chart failed")?;
        Ok(())
    }

    pub async fn load_charts(&self) -> Result<Vec<Chart>> {
        let rows = sqlx::query_as::<_, ChartRow>("SELECT id, name, topic FROM charts ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("load_charts failed")?;
        Ok(rows
            .into_iter()
            .map(|r| Chart {
                id: r.id,
                name: r.name,
                topic: r.topic,
            })
            .collect())
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn upsert_schedule(&self, s: &Schedule) -> Result<()> {
        let device_ids = serde_json::to_string(&s.device_ids)?;
        let days = serde_json::to_string(&s.days)?;
        sqlx::query(
            r#"
            INSERT INTO schedules (id, name, device_ids, time, days, action, payload, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              device_ids=excluded.device_ids,
              time=excluded.time,
              days=excluded.days,
              action=excluded.action,
              payload=excluded.payload,
              status=excluded.status
            "#,
        )
        .bind(&s.id)
        .bind(&s.name)
        .bind(device_ids)
        .bind(&s.time)
        .bind(days)
        .bind(s.action.as_str())
        .bind(&s.payload)
        .bind(s.status.as_str())
        .execute(&self.pool)
        .await
        .context("upsert_schedule failed")?;
        Ok(())
    }

    // ----------------------------
    // Execution log
    // ----------------------------

    /// Most recent execution records, newest first.
    pub async fn recent_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT schedule_id, device_id, outcome, detail, ts
            FROM execution_logs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_executions failed")?;

        Ok(rows
            .into_iter()
            .map(|r| ExecutionRecord {
                schedule_id: r.schedule_id,
                device_id: r.device_id,
                outcome: if r.outcome == "success" {
                    Outcome::Success
                } else {
                    Outcome::Error
                },
                timestamp: OffsetDateTime::from_unix_timestamp(r.ts)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                detail: r.detail,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Store contracts
// ---------------------------------------------------------------------------

#[async_trait]
impl DeviceRegistry for Db {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>("SELECT id, name, topic FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("find_by_id failed")?;
        Ok(row.map(Device::from))
    }

    async fn find_by_topic(&self, topic: &str) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT id, name, topic FROM devices WHERE topic = ? ORDER BY id LIMIT 1",
        )
        .bind(topic)
        .fetch_optional(&self.pool)
        .await
        .context("find_by_topic failed")?;
        Ok(row.map(Device::from))
    }
}

#[async_trait]
impl ScheduleStore for Db {
    async fn find_active_due_now(&self, time: &str, day: &str) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT id, name, device_ids, time, days, action, payload, status
            FROM schedules
            WHERE status = ? AND time = ?
            ORDER BY id
            "#,
        )
        .bind(ScheduleStatus::Active.as_str())
        .bind(time)
        .fetch_all(&self.pool)
        .await
        .context("find_active_due_now failed")?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_schedule() {
                Ok(s) if s.runs_on(day) => due.push(s),
                Ok(_) => {}
                Err(e) => warn!(schedule = %id, "skipping malformed schedule: {e:#}"),
            }
        }
        Ok(due)
    }
}

#[async_trait]
impl ExecutionLog for Db {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (schedule_id, device_id, outcome, detail, ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.schedule_id)
        .bind(&record.device_id)
        .bind(record.outcome.as_str())
        .bind(&record.detail)
        .bind(record.timestamp.unix_timestamp())
        .execute(&self.pool)
        .await
        .context("append execution record failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
