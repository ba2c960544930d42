//! Latest-known values per entity, with freshness rules and push
//! subscriptions for SSE streams.
//!
//! Writers are the message-handling path only. Readers take snapshots and
//! never hold the lock while notifying listeners, so a listener may drop its
//! own [`Subscription`] from inside the callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};
use tracing::trace;

/// Entity id of the singleton greenhouse climate sensor.
pub const ENVIRONMENT_ID: &str = "environment";

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Environment,
    Device,
    Nutrient,
}

/// Maximum age per entity kind. `None` means the last value stays current
/// until superseded.
#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    pub environment: Option<Duration>,
    pub device: Option<Duration>,
    pub nutrient: Option<Duration>,
}

impl StalenessPolicy {
    pub fn threshold(&self, kind: EntityKind) -> Option<Duration> {
        match kind {
            EntityKind::Environment => self.environment,
            EntityKind::Device => self.device,
            EntityKind::Nutrient => self.nutrient,
        }
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            environment: Some(Duration::seconds(10)),
            device: None,
            nutrient: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub entity_id: String,
    pub kind: EntityKind,
    pub fields: Fields,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
}

struct LiveEntry {
    kind: EntityKind,
    fields: Fields,
    last_update: OffsetDateTime,
}

type Listener = Arc<dyn Fn(&LiveSnapshot) + Send + Sync>;
type Listeners = Mutex<Vec<(u64, Listener)>>;

pub struct LiveStateCache {
    policy: StalenessPolicy,
    entries: RwLock<HashMap<String, LiveEntry>>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
}

/// Deregisters its listener when dropped.
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
            trace!(listener = self.id, "live listener removed");
        }
    }
}

impl LiveStateCache {
    pub fn new(policy: StalenessPolicy) -> Self {
        Self {
            policy,
            entries: RwLock::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Merge `fields` into the entity and notify every subscriber.
    pub fn update(&self, entity_id: &str, kind: EntityKind, fields: Fields) -> LiveSnapshot {
        self.update_at(entity_id, kind, fields, OffsetDateTime::now_utc())
    }

    pub fn update_at(
        &self,
        entity_id: &str,
        kind: EntityKind,
        fields: Fields,
        now: OffsetDateTime,
    ) -> LiveSnapshot {
        let snapshot = {
            let mut entries = self.entries.write();
            let entry = entries
                .entry(entity_id.to_string())
                .or_insert_with(|| LiveEntry {
                    kind,
                    fields: Map::new(),
                    last_update: now,
                });
            entry.kind = kind;
            entry.fields.extend(fields);
            // Never move backwards, even if the wall clock does.
            entry.last_update = entry.last_update.max(now);

            LiveSnapshot {
                entity_id: entity_id.to_string(),
                kind,
                fields: entry.fields.clone(),
                last_update: entry.last_update,
            }
        };

        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
        snapshot
    }

    /// Current value, or `None` when unknown or older than the kind's
    /// staleness threshold.
    pub fn get(&self, entity_id: &str) -> Option<LiveSnapshot> {
        self.get_at(entity_id, OffsetDateTime::now_utc())
    }

    pub fn get_at(&self, entity_id: &str, now: OffsetDateTime) -> Option<LiveSnapshot> {
        let entries = self.entries.read();
        let entry = entries.get(entity_id)?;
        if let Some(max_age) = self.policy.threshold(entry.kind) {
            if now - entry.last_update > max_age {
                return None;
            }
        }
        Some(LiveSnapshot {
            entity_id: entity_id.to_string(),
            kind: entry.kind,
            fields: entry.fields.clone(),
            last_update: entry.last_update,
        })
    }

    /// Register a push listener. Dropping the returned handle stops further
    /// notifications.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LiveSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for LiveStateCache {
    fn default() -> Self {
        Self::new(StalenessPolicy::default())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
