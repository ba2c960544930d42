//! Bounded per-series history windows behind charts and sensor streams.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;
use time::OffsetDateTime;

pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SeriesPoint {
    pub fn now(value: f64) -> Self {
        Self {
            value,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Fixed-capacity FIFO windows keyed by series id (chart id or sensor id).
/// Windows are created on first append and live until [`remove`](Self::remove).
pub struct RollingSeriesStore {
    capacity: usize,
    windows: RwLock<HashMap<String, VecDeque<SeriesPoint>>>,
}

impl RollingSeriesStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push `point`, evicting the oldest one when the window is full.
    pub fn append(&self, series_id: &str, point: SeriesPoint) {
        let mut windows = self.windows.write();
        let window = windows
            .entry(series_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        if window.len() >= self.capacity {
            window.pop_front();
        }
        window.push_back(point);
    }

    /// Copy of the window, oldest first. Empty for unknown series.
    pub fn snapshot(&self, series_id: &str) -> Vec<SeriesPoint> {
        self.windows
            .read()
            .get(series_id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop a window entirely. Returns `true` if it existed.
    pub fn remove(&self, series_id: &str) -> bool {
        self.windows.write().remove(series_id).is_some()
    }

    pub fn series_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.windows.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for RollingSeriesStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn point(i: i64) -> SeriesPoint {
        SeriesPoint {
            value: i as f64,
            timestamp: datetime!(2024-01-01 00:00 UTC) + time::Duration::seconds(i),
        }
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let store = RollingSeriesStore::new(5);
        for i in 0..50 {
            store.append("chart-1", point(i));
            assert!(store.snapshot("chart-1").len() <= 5);
        }
    }

    #[test]
    fn overflow_keeps_last_points_in_arrival_order() {
        let store = RollingSeriesStore::new(3);
        for i in 0..7 {
            store.append("s", point(i));
        }
        let values: Vec<f64> = store.snapshot("s").iter().map(|p| p.value).collect();
        assert_eq!(values, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn under_capacity_keeps_everything() {
        let store = RollingSeriesStore::default();
        for i in 0..4 {
            store.append("s", point(i));
        }
        assert_eq!(store.snapshot("s"), (0..4).map(point).collect::<Vec<_>>());
    }

    #[test]
    fn series_are_independent() {
        let store = RollingSeriesStore::new(2);
        store.append("a", point(1));
        store.append("b", point(2));
        store.append("b", point(3));
        store.append("b", point(4));

        assert_eq!(store.snapshot("a").len(), 1);
        assert_eq!(store.snapshot("b"), vec![point(3), point(4)]);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let store = RollingSeriesStore::new(2);
        store.append("s", point(1));
        let before = store.snapshot("s");
        store.append("s", point(2));
        store.append("s", point(3));
        assert_eq!(before, vec![point(1)]);
    }

    #[test]
    fn remove_drops_window() {
        let store = RollingSeriesStore::new(2);
        store.append("chart-9", point(1));
        assert!(store.remove("chart-9"));
        assert!(store.snapshot("chart-9").is_empty());
        assert!(!store.remove("chart-9"));
        assert!(store.series_ids().is_empty());
    }

    #[test]
    fn unknown_series_is_empty() {
        let store = RollingSeriesStore::default();
        assert!(store.snapshot("missing").is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let store = RollingSeriesStore::new(0);
        store.append("s", point(1));
        store.append("s", point(2));
        assert_eq!(store.capacity(), 1);
        assert_eq!(store.snapshot("s"), vec![point(2)]);
    }

    #[test]
    fn point_serializes_rfc3339() {
        let json = serde_json::to_value(point(0)).unwrap();
        assert_eq!(json["value"], 0.0);
        assert_eq!(json["timestamp"], "2024-01-01T00:00:00Z");
    }
}
