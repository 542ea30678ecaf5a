use crate::history::{now_epoch, HistoryStore};
use crate::resolver;
use crate::transform::Transform;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Which side of the machine-control channel a line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Compiled pattern plus the monitor's optional post-transform.
pub struct PatternEntry {
    pub regex: Regex,
    pub transform: Option<Transform>,
}

/// The registered stream patterns, shared between the registry (which
/// installs and removes them) and the tap worker (which matches them).
#[derive(Default)]
pub struct PatternSet {
    inbound: RwLock<HashMap<String, PatternEntry>>,
    outbound: RwLock<HashMap<String, PatternEntry>>,
}

impl PatternSet {
    fn side(&self, direction: Direction) -> &RwLock<HashMap<String, PatternEntry>> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Register a monitor's pattern; an id lives on at most one side.
    pub fn register(&self, direction: Direction, id: &str, entry: PatternEntry) {
        let other = match direction {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        };
        self.side(other).write().remove(id);
        self.side(direction).write().insert(id.to_string(), entry);
    }

    pub fn unregister(&self, id: &str) {
        self.inbound.write().remove(id);
        self.outbound.write().remove(id);
    }

    pub fn clear(&self) {
        self.inbound.write().clear();
        self.outbound.write().clear();
    }

    /// Cheap check the hooks use to skip enqueueing when nobody listens.
    pub fn is_armed(&self, direction: Direction) -> bool {
        !self.side(direction).read().is_empty()
    }
}

enum TapEvent {
    Line {
        direction: Direction,
        text: String,
        timestamp: f64,
    },
    // Poison pill observed by the worker at shutdown.
    Shutdown,
}

/// Intercepts bidirectional protocol traffic and feeds matches through
/// the sample pipeline. A single worker drains the queue strictly in
/// arrival order, so stream-derived samples preserve input order.
pub struct StreamTap {
    sender: mpsc::UnboundedSender<TapEvent>,
    patterns: Arc<PatternSet>,
    worker: JoinHandle<()>,
}

impl StreamTap {
    pub fn spawn(patterns: Arc<PatternSet>, history: Arc<HistoryStore>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain_queue(receiver, patterns.clone(), history));
        Self {
            sender,
            patterns,
            worker,
        }
    }

    /// Hook for every line received from the machine-control channel.
    /// Pass-through: the line is returned unchanged to the caller.
    pub fn on_line_received<'a>(&self, line: &'a str) -> &'a str {
        if self.patterns.is_armed(Direction::Inbound) {
            let _ = self.sender.send(TapEvent::Line {
                direction: Direction::Inbound,
                text: line.to_string(),
                timestamp: now_epoch(),
            });
        }
        line
    }

    /// Hook for every command about to be sent. A fan-stop line is
    /// rewritten to the fan-to-zero form so percentage monitors observe a
    /// clean zero instead of missing data.
    pub fn on_line_about_to_send(&self, line: &str) {
        if !self.patterns.is_armed(Direction::Outbound) {
            return;
        }
        let text = if is_fan_stop(line) {
            "M106 S0".to_string()
        } else {
            line.to_string()
        };
        let _ = self.sender.send(TapEvent::Line {
            direction: Direction::Outbound,
            text,
            timestamp: now_epoch(),
        });
    }

    /// Stop the worker after the already-queued lines drain.
    pub fn shutdown(&self) {
        let _ = self.sender.send(TapEvent::Shutdown);
    }

    /// Wait for the worker to exit; used by orderly shutdown paths.
    pub async fn join(self) {
        let _ = self.worker.await;
    }
}

fn is_fan_stop(line: &str) -> bool {
    line.trim().split_whitespace().next() == Some("M107")
}

async fn drain_queue(
    mut receiver: mpsc::UnboundedReceiver<TapEvent>,
    patterns: Arc<PatternSet>,
    history: Arc<HistoryStore>,
) {
    info!("stream tap worker started");
    while let Some(event) = receiver.recv().await {
        match event {
            TapEvent::Shutdown => break,
            TapEvent::Line {
                direction,
                text,
                timestamp,
            } => dispatch_line(&patterns, &history, direction, &text, timestamp),
        }
    }
    info!("stream tap worker stopped");
}

/// Match one line against every registered pattern of its direction. A
/// match without a first capture group produces no sample; a capture that
/// fails to resolve is reported as that monitor's failure.
fn dispatch_line(
    patterns: &PatternSet,
    history: &HistoryStore,
    direction: Direction,
    text: &str,
    timestamp: f64,
) {
    let line = text.trim();
    let guard = patterns.side(direction).read();
    for (id, entry) in guard.iter() {
        let Some(captures) = entry.regex.captures(line) else {
            continue;
        };
        let Some(captured) = captures.get(1) else {
            debug!(monitor = id, "pattern matched without a capture group");
            continue;
        };
        match resolver::resolve_capture(captured.as_str(), entry.transform.as_ref()) {
            Ok(value) => history.record(id, timestamp, value),
            Err(e) => history.record_failure(id, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pattern: &str, transform: Option<&str>) -> PatternEntry {
        PatternEntry {
            regex: Regex::new(pattern).unwrap(),
            transform: transform.map(|t| Transform::parse(t).unwrap()),
        }
    }

    #[test]
    fn fan_stop_detection() {
        assert!(is_fan_stop("M107"));
        assert!(is_fan_stop("  M107  "));
        assert!(is_fan_stop("M107 P0"));
        assert!(!is_fan_stop("M106 S0"));
        assert!(!is_fan_stop("M1070"));
    }

    #[test]
    fn armed_only_with_registered_patterns() {
        let set = PatternSet::default();
        assert!(!set.is_armed(Direction::Inbound));
        set.register(Direction::Inbound, "m", entry("T:([0-9.]+)", None));
        assert!(set.is_armed(Direction::Inbound));
        assert!(!set.is_armed(Direction::Outbound));
        set.unregister("m");
        assert!(!set.is_armed(Direction::Inbound));
    }

    #[test]
    fn id_moves_between_sides() {
        let set = PatternSet::default();
        set.register(Direction::Inbound, "m", entry("a", None));
        set.register(Direction::Outbound, "m", entry("b", None));
        assert!(!set.is_armed(Direction::Inbound));
        assert!(set.is_armed(Direction::Outbound));
    }

    #[test]
    fn dispatch_records_captured_value() {
        let set = PatternSet::default();
        let history = HistoryStore::new();
        set.register(
            Direction::Outbound,
            "fan",
            entry("^M106.*?S([^ ]+)", Some("X/255*100")),
        );

        dispatch_line(&set, &history, Direction::Outbound, "M106 S128", 1.0);
        let samples = history.history("fan");
        assert_eq!(samples.len(), 1);
        assert!((samples[0].value - 50.196).abs() < 0.001);

        // Wrong direction: nothing recorded.
        dispatch_line(&set, &history, Direction::Inbound, "M106 S64", 2.0);
        assert_eq!(history.history("fan").len(), 1);
    }

    #[test]
    fn unparseable_capture_is_a_failure_not_a_sample() {
        let set = PatternSet::default();
        let history = HistoryStore::new();
        set.register(Direction::Inbound, "m", entry("^V=(\\S+)", None));
        dispatch_line(&set, &history, Direction::Inbound, "V=garbage", 1.0);
        assert!(history.history("m").is_empty());
    }

    #[tokio::test]
    async fn hooks_enqueue_and_worker_drains_in_order() {
        let patterns = Arc::new(PatternSet::default());
        let history = Arc::new(HistoryStore::new());
        patterns.register(
            Direction::Outbound,
            "fan",
            entry("^M106.*?S([^ ]+)", None),
        );

        let tap = StreamTap::spawn(patterns.clone(), history.clone());
        tap.on_line_about_to_send("M106 S10");
        tap.on_line_about_to_send("M106 S20");
        tap.on_line_about_to_send("M107");
        tap.shutdown();
        tap.join().await;

        let values: Vec<f64> = history.history("fan").iter().map(|s| s.value).collect();
        assert_eq!(values, vec![10.0, 20.0, 0.0]);
    }

    #[tokio::test]
    async fn received_hook_passes_line_through() {
        let patterns = Arc::new(PatternSet::default());
        let history = Arc::new(HistoryStore::new());
        let tap = StreamTap::spawn(patterns, history.clone());
        let line = "ok T:210.0 /210.0";
        assert_eq!(tap.on_line_received(line), line);
        // No inbound pattern registered, so nothing was enqueued.
        tap.shutdown();
        tap.join().await;
        assert!(history.all_history().is_empty());
    }
}
