use crate::catalog::MetricCatalog;
use crate::config::{merge_config, MonitorConfig, MonitorPatch, MonitorSpec, SourceKind};
use crate::error::MonitorError;
use crate::history::{HistoryStore, MonitorEvent, Sample};
use crate::registry::MonitorRegistry;
use crate::resolver;
use crate::tap::{PatternSet, StreamTap};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// External settings backend: hands out the current effective monitor
/// configuration and persists full replacements.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> anyhow::Result<MonitorConfig>;
    fn store(&self, config: &MonitorConfig) -> anyhow::Result<()>;
}

/// Keeps the configuration in memory only. Useful for tests and for
/// hosts that persist settings themselves.
#[derive(Default)]
pub struct MemoryConfig {
    config: RwLock<MonitorConfig>,
}

impl ConfigSource for MemoryConfig {
    fn load(&self) -> anyhow::Result<MonitorConfig> {
        Ok(self.config.read().clone())
    }

    fn store(&self, config: &MonitorConfig) -> anyhow::Result<()> {
        *self.config.write() = config.clone();
        Ok(())
    }
}

/// Uniform result shape for the externally exposed operations.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl ApiResponse {
    fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            result: Some(result),
        }
    }

    fn fail(error: &MonitorError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            result: None,
        }
    }

    fn fail_msg(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            result: None,
        }
    }
}

/// Top-level wiring of catalog, registry, stream tap, and history, plus
/// the command surface exposed to external callers.
///
/// Construction spawns the tap worker, so this must be created inside a
/// Tokio runtime.
pub struct MonitorService {
    catalog: Arc<MetricCatalog>,
    config_source: Box<dyn ConfigSource>,
    history: Arc<HistoryStore>,
    registry: MonitorRegistry,
    tap: StreamTap,
    config: RwLock<MonitorConfig>,
    shell_timeout_secs: u64,
}

impl MonitorService {
    pub fn new(catalog: Arc<MetricCatalog>, config_source: Box<dyn ConfigSource>) -> Self {
        Self::with_timeout(catalog, config_source, resolver::DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(
        catalog: Arc<MetricCatalog>,
        config_source: Box<dyn ConfigSource>,
        shell_timeout_secs: u64,
    ) -> Self {
        let history = Arc::new(HistoryStore::new());
        let patterns = Arc::new(PatternSet::default());
        let tap = StreamTap::spawn(patterns.clone(), history.clone());
        let registry = MonitorRegistry::new(
            catalog.clone(),
            history.clone(),
            patterns,
            shell_timeout_secs,
        );
        Self {
            catalog,
            config_source,
            history,
            registry,
            tap,
            config: RwLock::new(MonitorConfig::new()),
            shell_timeout_secs,
        }
    }

    /// Detect platform probes, load (or seed) the configuration, and
    /// bring up the full monitor set.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.catalog.detect_cpu_temp().await;
        let mut config = self.config_source.load()?;
        if config.is_empty() {
            config = self.catalog.default_monitors();
            info!(monitors = config.len(), "seeding default monitor set");
            self.config_source.store(&config)?;
        }
        self.registry.rebuild_all(&config);
        *self.config.write() = config;
        info!("monitor service started");
        Ok(())
    }

    /// Ad-hoc resolution of a payload without installing anything.
    pub async fn test_command(&self, payload: &str, kind: SourceKind) -> ApiResponse {
        match kind {
            SourceKind::Shell => {
                if let Err(e) = resolver::locate_command(payload).await {
                    return ApiResponse::fail(&e);
                }
                match resolver::resolve_shell(payload, self.shell_timeout_secs).await {
                    Ok(value) => ApiResponse::ok(json!(value)),
                    Err(e) => ApiResponse::fail(&e),
                }
            }
            SourceKind::Builtin => match resolver::resolve_builtin(&self.catalog, payload) {
                Ok(value) => ApiResponse::ok(json!(value)),
                Err(e) => ApiResponse::fail(&e),
            },
            SourceKind::StreamIn | SourceKind::StreamOut => {
                ApiResponse::fail_msg("stream monitors have nothing to execute ad hoc")
            }
        }
    }

    /// The catalog contents plus the CPU-temperature probe candidates.
    pub async fn list_capabilities(&self, reload: bool) -> ApiResponse {
        if reload {
            self.catalog.reload().await;
        }
        ApiResponse::ok(json!({
            "metrics": self.catalog.metrics(),
            "cpu_temp_candidates": self.catalog.candidate_commands(),
            "cpu_temp_detected": self.catalog.cpu_temp_command(),
        }))
    }

    pub fn get_history(&self) -> ApiResponse {
        match serde_json::to_value(self.history.all_history()) {
            Ok(value) => ApiResponse::ok(value),
            Err(e) => ApiResponse::fail_msg(e.to_string()),
        }
    }

    pub fn history_for(&self, id: &str) -> Vec<Sample> {
        self.history.history(id)
    }

    /// The default spec new monitors start from in configuration tooling.
    pub fn default_template(&self) -> ApiResponse {
        match serde_json::to_value(MonitorSpec::default()) {
            Ok(value) => ApiResponse::ok(value),
            Err(e) => ApiResponse::fail_msg(e.to_string()),
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.config.read().clone()
    }

    /// Merge a patch batch, persist the effective configuration, and
    /// dispatch the resulting change set to the registry. Malformed
    /// patches reject only their own id.
    pub fn save_config(&self, patches: &BTreeMap<String, MonitorPatch>) -> ApiResponse {
        // One guard across merge, persist, and dispatch: concurrent
        // batches serialize, so the registry and the stored configuration
        // always agree and no batch overwrites another's monitors.
        let mut config = self.config.write();
        let outcome = merge_config(&config, patches);

        if let Err(e) = self.config_source.store(&outcome.config) {
            error!(error = %e, "failed to persist configuration");
            return ApiResponse::fail_msg(format!("failed to persist configuration: {e}"));
        }

        *config = outcome.config;
        self.registry.apply_changes(&outcome.changes, &config);

        let rejected: Vec<String> = outcome.rejected.iter().map(|e| e.to_string()).collect();
        ApiResponse {
            success: rejected.is_empty(),
            error: (!rejected.is_empty()).then(|| rejected.join("; ")),
            result: Some(json!({ "applied": outcome.changes.len(), "rejected": rejected })),
        }
    }

    /// Observer channel; delivery is best-effort broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.history.subscribe()
    }

    /// Protocol hook: a line received over the machine-control channel.
    pub fn on_line_received<'a>(&self, line: &'a str) -> &'a str {
        self.tap.on_line_received(line)
    }

    /// Protocol hook: a command about to be sent.
    pub fn on_line_about_to_send(&self, line: &str) {
        self.tap.on_line_about_to_send(line)
    }

    pub fn registry(&self) -> &MonitorRegistry {
        &self.registry
    }

    /// Stop all monitor tasks and poison-pill the tap worker.
    pub fn shutdown(&self) {
        info!("monitor service shutting down");
        self.registry.shutdown();
        self.tap.shutdown();
    }
}
