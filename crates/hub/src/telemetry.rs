//! Wires broker topics to the in-memory stores: parsers run inside router
//! handlers and feed the live cache and the rolling series.
//!
//! | source            | parser                | live cache          | series                      |
//! |-------------------|-----------------------|---------------------|-----------------------------|
//! | environment topic | `Suhu/Kelembaban`     | `environment`       | `temperature`, `humidity`   |
//! | nutrient topic    | number                | nutrient id         | nutrient id                 |
//! | device topic      | `1`/`0`, `ON`/`OFF`   | device id (`on`)    |                             |
//! | chart topic       | number                |                     | chart id                    |

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::live::{EntityKind, Fields, LiveStateCache, ENVIRONMENT_ID};
use crate::mqtt::{parse_device_status, parse_environment, parse_number};
use crate::router::{HandlerId, TopicRouter};
use crate::series::{RollingSeriesStore, SeriesPoint};
use crate::store::{Chart, Device};

pub const TEMPERATURE_SERIES: &str = "temperature";
pub const HUMIDITY_SERIES: &str = "humidity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    Environment,
    Nutrient,
    Device,
    Chart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    Added,
    Unchanged,
    Repointed,
    Detached,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub attached: Vec<String>,
    pub repointed: Vec<String>,
    pub detached: Vec<String>,
}

struct Attachment {
    topic: String,
    handler: HandlerId,
}

pub struct Telemetry {
    router: Arc<TopicRouter>,
    series: Arc<RollingSeriesStore>,
    live: Arc<LiveStateCache>,
    attachments: Mutex<HashMap<(Source, String), Attachment>>,
}

fn fields(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Fields::new(),
    }
}

impl Telemetry {
    pub fn new(
        router: Arc<TopicRouter>,
        series: Arc<RollingSeriesStore>,
        live: Arc<LiveStateCache>,
    ) -> Self {
        Self {
            router,
            series,
            live,
            attachments: Mutex::new(HashMap::new()),
        }
    }

    pub async fn attach_environment(&self, topic: &str) -> Attach {
        let live = Arc::clone(&self.live);
        let series = Arc::clone(&self.series);
        self.attach(Source::Environment, ENVIRONMENT_ID, topic, move |_, payload| {
            let reading = parse_environment(payload)?;
            let snap = live.update(
                ENVIRONMENT_ID,
                EntityKind::Environment,
                fields(json!({
                    "temperature": reading.temperature,
                    "humidity": reading.humidity,
                })),
            );
            let at = snap.last_update;
            series.append(
                TEMPERATURE_SERIES,
                SeriesPoint {
                    value: reading.temperature,
                    timestamp: at,
                },
            );
            series.append(
                HUMIDITY_SERIES,
                SeriesPoint {
                    value: reading.humidity,
                    timestamp: at,
                },
            );
            Ok(())
        })
        .await
    }

    pub async fn attach_nutrient(&self, id: &str, topic: &str) -> Attach {
        let live = Arc::clone(&self.live);
        let series = Arc::clone(&self.series);
        let nutrient = id.to_string();
        self.attach(Source::Nutrient, id, topic, move |_, payload| {
            let value = parse_number(payload)?;
            let snap = live.update(
                &nutrient,
                EntityKind::Nutrient,
                fields(json!({ "value": value })),
            );
            series.append(
                &nutrient,
                SeriesPoint {
                    value,
                    timestamp: snap.last_update,
                },
            );
            Ok(())
        })
        .await
    }

    /// Track a device's on/off status. A device without a topic is not
    /// tracked; if it had one before, its old attachment is removed.
    pub async fn attach_device(&self, device: &Device) -> Option<Attach> {
        let Some(topic) = device.topic.as_deref().filter(|t| !t.trim().is_empty()) else {
            debug!(device = %device.id, "device has no topic, not tracked");
            return self
                .detach(Source::Device, &device.id)
                .await
                .then_some(Attach::Detached);
        };

        let live = Arc::clone(&self.live);
        let id = device.id.clone();
        let outcome = self
            .attach(Source::Device, &device.id, topic, move |_, payload| {
                let on = parse_device_status(payload)?;
                live.update(&id, EntityKind::Device, fields(json!({ "on": on })));
                Ok(())
            })
            .await;
        Some(outcome)
    }

    pub async fn detach_device(&self, id: &str) -> bool {
        self.detach(Source::Device, id).await
    }

    pub async fn attach_chart(&self, chart: &Chart) -> Attach {
        let series = Arc::clone(&self.series);
        let id = chart.id.clone();
        self.attach(Source::Chart, &chart.id, &chart.topic, move |_, payload| {
            let value = parse_number(payload)?;
            series.append(&id, SeriesPoint::now(value));
            Ok(())
        })
        .await
    }

    /// Stop feeding the chart and drop its window.
    pub async fn detach_chart(&self, id: &str) -> bool {
        let detached = self.detach(Source::Chart, id).await;
        if detached {
            self.series.remove(id);
        }
        detached
    }

    /// Reconcile device and chart attachments with the given store contents:
    /// attach new ones, re-point changed topics, detach the ones that are gone.
    pub async fn reload(&self, devices: &[Device], charts: &[Chart]) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        for d in devices {
            match self.attach_device(d).await {
                Some(Attach::Added) => summary.attached.push(format!("device:{}", d.id)),
                Some(Attach::Repointed) => summary.repointed.push(format!("device:{}", d.id)),
                Some(Attach::Detached) => summary.detached.push(format!("device:{}", d.id)),
                Some(Attach::Unchanged) | None => {}
            }
        }
        for c in charts {
            match self.attach_chart(c).await {
                Attach::Added => summary.attached.push(format!("chart:{}", c.id)),
                Attach::Repointed => summary.repointed.push(format!("chart:{}", c.id)),
                Attach::Unchanged | Attach::Detached => {}
            }
        }

        let stale: Vec<(Source, String)> = {
            let attachments = self.attachments.lock().await;
            attachments
                .keys()
                .filter(|(source, id)| match source {
                    Source::Device => !devices.iter().any(|d| {
                        &d.id == id && d.topic.as_deref().is_some_and(|t| !t.trim().is_empty())
                    }),
                    Source::Chart => !charts.iter().any(|c| &c.id == id),
                    Source::Environment | Source::Nutrient => false,
                })
                .cloned()
                .collect()
        };
        for (source, id) in stale {
            let removed = match source {
                Source::Chart => self.detach_chart(&id).await,
                Source::Device => self.detach_device(&id).await,
                Source::Environment | Source::Nutrient => false,
            };
            if removed {
                let label = if source == Source::Chart { "chart" } else { "device" };
                summary.detached.push(format!("{label}:{id}"));
            }
        }

        summary.attached.sort();
        summary.repointed.sort();
        summary.detached.sort();
        info!(
            attached = summary.attached.len(),
            repointed = summary.repointed.len(),
            detached = summary.detached.len(),
            "topics reloaded"
        );
        summary
    }

    async fn attach<F>(&self, source: Source, id: &str, topic: &str, handler: F) -> Attach
    where
        F: Fn(&str, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut attachments = self.attachments.lock().await;
        let key = (source, id.to_string());

        let outcome = match attachments.remove(&key) {
            Some(existing) if existing.topic == topic => {
                attachments.insert(key, existing);
                return Attach::Unchanged;
            }
            Some(existing) => {
                self.router.unregister(&existing.topic, existing.handler).await;
                info!(?source, %id, from = %existing.topic, to = %topic, "topic re-pointed");
                Attach::Repointed
            }
            None => {
                info!(?source, %id, %topic, "topic attached");
                Attach::Added
            }
        };

        let handler = self.router.register(topic, handler).await;
        attachments.insert(
            key,
            Attachment {
                topic: topic.to_string(),
                handler,
            },
        );
        outcome
    }

    async fn detach(&self, source: Source, id: &str) -> bool {
        let mut attachments = self.attachments.lock().await;
        let Some(existing) = attachments.remove(&(source, id.to_string())) else {
            return false;
        };
        self.router.unregister(&existing.topic, existing.handler).await;
        info!(?source, %id, topic = %existing.topic, "topic detached");
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================
