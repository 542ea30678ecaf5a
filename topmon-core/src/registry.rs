use crate::catalog::MetricCatalog;
use crate::config::{ChangeAction, MonitorChange, MonitorConfig, MonitorSpec, SourceKind};
use crate::error::MonitorError;
use crate::history::{now_epoch, HistoryStore};
use crate::resolver;
use crate::tap::{Direction, PatternEntry, PatternSet};
use crate::transform::Transform;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

enum Binding {
    Scheduled { handle: JoinHandle<()> },
    Tapped,
}

struct ActiveMonitor {
    binding: Binding,
}

/// Owns the set of active monitors: one periodic task or one registered
/// stream pattern per live id, never both, never duplicates.
///
/// Install is an idempotent replace. Every install bumps the id's
/// generation; a timer firing whose generation is no longer current
/// discards its result instead of writing history under the new
/// configuration's assumptions.
pub struct MonitorRegistry {
    active: Mutex<HashMap<String, ActiveMonitor>>,
    generations: Arc<RwLock<HashMap<String, u64>>>,
    next_generation: AtomicU64,
    catalog: Arc<MetricCatalog>,
    history: Arc<HistoryStore>,
    patterns: Arc<PatternSet>,
    shell_timeout_secs: u64,
}

impl MonitorRegistry {
    pub fn new(
        catalog: Arc<MetricCatalog>,
        history: Arc<HistoryStore>,
        patterns: Arc<PatternSet>,
        shell_timeout_secs: u64,
    ) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            generations: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            catalog,
            history,
            patterns,
            shell_timeout_secs,
        }
    }

    /// Install or replace the monitor for `id`. Any existing timer or
    /// pattern registration for the id is stopped first.
    pub fn install(&self, id: &str, spec: &MonitorSpec) -> Result<(), MonitorError> {
        self.install_with(id, spec, false)
    }

    /// Replace with an optional history reset. The reset runs after the
    /// old binding is stopped and its generation dropped, so a late
    /// firing of the old task cannot repopulate the cleared ring.
    fn install_with(
        &self,
        id: &str,
        spec: &MonitorSpec,
        clear_history: bool,
    ) -> Result<(), MonitorError> {
        spec.validate()?;

        let mut active = self.active.lock();
        self.stop_locked(&mut active, id);
        if clear_history {
            self.history.clear(id);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.generations.write().insert(id.to_string(), generation);

        let binding = match spec.kind {
            SourceKind::Shell | SourceKind::Builtin => {
                let handle = tokio::spawn(poll_loop(
                    id.to_string(),
                    spec.clone(),
                    generation,
                    self.generations.clone(),
                    self.catalog.clone(),
                    self.history.clone(),
                    self.shell_timeout_secs,
                ));
                Binding::Scheduled { handle }
            }
            SourceKind::StreamIn | SourceKind::StreamOut => {
                let regex =
                    Regex::new(&spec.source).map_err(|e| MonitorError::BadPattern {
                        pattern: spec.source.clone(),
                        reason: e.to_string(),
                    })?;
                let transform = match &spec.post_calc {
                    Some(expr) => Some(Transform::parse(expr)?),
                    None => None,
                };
                let direction = if spec.kind == SourceKind::StreamIn {
                    Direction::Inbound
                } else {
                    Direction::Outbound
                };
                self.patterns
                    .register(direction, id, PatternEntry { regex, transform });
                Binding::Tapped
            }
        };

        info!(monitor = id, kind = ?spec.kind, "monitor installed");
        active.insert(id.to_string(), ActiveMonitor { binding });
        Ok(())
    }

    /// Stop the monitor and drop its history.
    pub fn remove(&self, id: &str) {
        let mut active = self.active.lock();
        self.stop_locked(&mut active, id);
        self.history.remove(id);
        info!(monitor = id, "monitor removed");
    }

    /// Stop everything, clear all history, and install the full set from
    /// the given configuration. Runs at startup and on bulk reload.
    pub fn rebuild_all(&self, config: &MonitorConfig) {
        info!(monitors = config.len(), "rebuilding all monitors");
        {
            let mut active = self.active.lock();
            let ids: Vec<String> = active.keys().cloned().collect();
            for id in ids {
                self.stop_locked(&mut active, &id);
            }
            self.history.clear_all();
        }
        for (id, spec) in config {
            if let Err(e) = self.install(id, spec) {
                warn!(monitor = %id, error = %e, "skipping monitor");
            }
        }
    }

    /// Apply the merger's change set against the new effective config.
    pub fn apply_changes(&self, changes: &[MonitorChange], config: &MonitorConfig) {
        for change in changes {
            match &change.action {
                ChangeAction::Removed => self.remove(&change.id),
                ChangeAction::Install { clear_history } => {
                    let Some(spec) = config.get(&change.id) else {
                        continue;
                    };
                    if let Err(e) = self.install_with(&change.id, spec, *clear_history) {
                        warn!(monitor = %change.id, error = %e, "install failed");
                    }
                }
            }
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.lock().contains_key(id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }

    /// Abort all periodic tasks and drop all pattern registrations.
    pub fn shutdown(&self) {
        let mut active = self.active.lock();
        for (_, monitor) in active.drain() {
            if let Binding::Scheduled { handle } = monitor.binding {
                handle.abort();
            }
        }
        self.patterns.clear();
        self.generations.write().clear();
    }

    fn stop_locked(&self, active: &mut HashMap<String, ActiveMonitor>, id: &str) {
        // The generation write waits for any in-flight tail holding the
        // read guard; after it, a late firing sees None and discards.
        self.generations.write().remove(id);
        if let Some(monitor) = active.remove(id) {
            match monitor.binding {
                Binding::Scheduled { handle } => handle.abort(),
                Binding::Tapped => self.patterns.unregister(id),
            }
        }
    }
}

/// Periodic sampling task: first sample immediately, then every
/// `interval_secs`, until aborted or superseded.
async fn poll_loop(
    id: String,
    spec: MonitorSpec,
    generation: u64,
    generations: Arc<RwLock<HashMap<String, u64>>>,
    catalog: Arc<MetricCatalog>,
    history: Arc<HistoryStore>,
    shell_timeout_secs: u64,
) {
    let mut ticker = interval(Duration::from_secs(spec.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let result = match spec.kind {
            SourceKind::Shell => resolver::resolve_shell(&spec.source, shell_timeout_secs).await,
            SourceKind::Builtin => resolver::resolve_builtin(&catalog, &spec.source),
            // Stream kinds never reach the poll loop.
            SourceKind::StreamIn | SourceKind::StreamOut => return,
        };
        let timestamp = now_epoch();

        // A replace or remove may have happened while the sample was in
        // flight; a stale result must not resurrect the old monitor. The
        // guard is held across the record so a concurrent stop cannot
        // clear history between the check and the write.
        {
            let current = generations.read();
            if current.get(&id).copied() != Some(generation) {
                return;
            }
            match result {
                Ok(value) => history.record(&id, timestamp, value),
                Err(e) => history.record_failure(&id, &e),
            }
        }
    }
}
