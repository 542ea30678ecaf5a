use crate::error::MonitorError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Maximum samples retained per monitor; oldest evicted first.
pub const HISTORY_CAP: usize = 300;

/// One observation, serialized on the wire as `[timestamp, value]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
}

impl From<(f64, f64)> for Sample {
    fn from((timestamp, value): (f64, f64)) -> Self {
        Self { timestamp, value }
    }
}

impl From<Sample> for (f64, f64) {
    fn from(s: Sample) -> Self {
        (s.timestamp, s.value)
    }
}

/// Epoch seconds with fractional part, the timestamp unit of all samples.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Change notification pushed to observers on every sample or failure.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    pub key: String,
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<Sample>,
}

/// In-memory bounded history per monitor plus the observer broadcast.
///
/// Mutated from timer tasks, the stream worker, and reconfiguration
/// requests; one coarse lock is plenty at tens of monitors. Observer
/// delivery is fire-and-forget: a slow or absent observer never blocks
/// sample processing.
pub struct HistoryStore {
    buffers: RwLock<HashMap<String, VecDeque<Sample>>>,
    events: broadcast::Sender<MonitorEvent>,
}

impl HistoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            buffers: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Append a successful sample, trim to the cap, notify observers.
    pub fn record(&self, id: &str, timestamp: f64, value: f64) {
        let sample = Sample { timestamp, value };
        {
            let mut buffers = self.buffers.write();
            let buffer = buffers.entry(id.to_string()).or_default();
            buffer.push_back(sample);
            while buffer.len() > HISTORY_CAP {
                buffer.pop_front();
            }
        }
        debug!(monitor = id, value, "sample recorded");
        let _ = self.events.send(MonitorEvent {
            key: id.to_string(),
            success: true,
            error: None,
            result: Some(sample),
        });
    }

    /// Publish a failure without mutating history.
    pub fn record_failure(&self, id: &str, error: &MonitorError) {
        warn!(monitor = id, %error, "monitor failed");
        let _ = self.events.send(MonitorEvent {
            key: id.to_string(),
            success: false,
            error: Some(error.to_string()),
            result: None,
        });
    }

    pub fn history(&self, id: &str) -> Vec<Sample> {
        self.buffers
            .read()
            .get(id)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all_history(&self) -> BTreeMap<String, Vec<Sample>> {
        self.buffers
            .read()
            .iter()
            .map(|(id, b)| (id.clone(), b.iter().copied().collect()))
            .collect()
    }

    /// Empty one monitor's ring but keep the monitor known.
    pub fn clear(&self, id: &str) {
        if let Some(buffer) = self.buffers.write().get_mut(id) {
            buffer.clear();
        }
    }

    pub fn remove(&self, id: &str) {
        self.buffers.write().remove(id);
    }

    pub fn clear_all(&self) {
        self.buffers.write().clear();
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}
