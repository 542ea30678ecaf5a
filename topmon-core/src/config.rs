use crate::error::MonitorError;
use crate::transform::Transform;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default polling cadence for newly created monitors.
pub const DEFAULT_INTERVAL_SECS: u64 = 25;

/// Where a monitor gets its samples from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A shell command whose stdout is a number.
    Shell,
    /// A built-in metric key resolved through the catalog.
    Builtin,
    /// A regex matched against inbound protocol lines.
    StreamIn,
    /// A regex matched against outbound protocol lines.
    StreamOut,
}

impl SourceKind {
    /// Polled kinds run on a periodic timer; the rest are stream-triggered.
    pub fn is_polled(&self) -> bool {
        matches!(self, SourceKind::Shell | SourceKind::Builtin)
    }
}

/// A single named monitor. The id is the key of the enclosing config map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSpec {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Command text, builtin metric key, or regex pattern.
    pub source: String,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Optional arithmetic applied to stream-captured values, e.g. "X/255*100".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_calc: Option<String>,
    /// Opaque presentation metadata, passed through unchanged.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub display: serde_json::Value,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl Default for MonitorSpec {
    fn default() -> Self {
        Self {
            kind: SourceKind::Shell,
            source: String::new(),
            interval_secs: DEFAULT_INTERVAL_SECS,
            post_calc: None,
            display: serde_json::Value::Null,
        }
    }
}

impl MonitorSpec {
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.source.trim().is_empty() {
            return Err(MonitorError::InvalidSpec {
                reason: "source must not be empty".into(),
            });
        }
        if self.kind.is_polled() && self.interval_secs < 1 {
            return Err(MonitorError::InvalidSpec {
                reason: "interval_secs must be at least 1".into(),
            });
        }
        if !self.kind.is_polled() {
            Regex::new(&self.source).map_err(|e| MonitorError::BadPattern {
                pattern: self.source.clone(),
                reason: e.to_string(),
            })?;
        }
        if let Some(expr) = &self.post_calc {
            Transform::parse(expr)?;
        }
        Ok(())
    }
}

/// The effective configuration: monitor id to spec.
pub type MonitorConfig = BTreeMap<String, MonitorSpec>;

/// A sparse overlay submitted by configuration tooling. The `delete` and
/// `new` markers are transient and never appear in a stored spec.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorPatch {
    #[serde(rename = "type")]
    pub kind: Option<SourceKind>,
    pub source: Option<String>,
    pub interval_secs: Option<u64>,
    pub post_calc: Option<String>,
    pub display: Option<serde_json::Value>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default, rename = "new")]
    pub is_new: bool,
}

/// What the registry must do for one monitor id after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeAction {
    Removed,
    Install { clear_history: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorChange {
    pub id: String,
    pub action: ChangeAction,
}

/// Result of reconciling a patch batch against the previous configuration.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The new effective configuration, ready to persist.
    pub config: MonitorConfig,
    /// Instructions for the registry. The merger never touches timers.
    pub changes: Vec<MonitorChange>,
    /// Per-id rejections; the rest of the batch still applies.
    pub rejected: Vec<MonitorError>,
}

/// Reconcile submitted patches against the previous effective configuration.
///
/// Per id: deletion drops the entry, `new` takes the patch as the full spec,
/// otherwise only keys present in the patch overlay the previous spec. A
/// rebuild is needed when kind, source, interval, or post_calc actually
/// changed; history is cleared only when kind or source changed.
pub fn merge_config(
    prev: &MonitorConfig,
    patches: &BTreeMap<String, MonitorPatch>,
) -> MergeOutcome {
    let mut config = prev.clone();
    let mut changes = Vec::new();
    let mut rejected = Vec::new();

    for (id, patch) in patches {
        if patch.delete {
            if config.remove(id).is_some() {
                changes.push(MonitorChange {
                    id: id.clone(),
                    action: ChangeAction::Removed,
                });
            }
            continue;
        }

        if patch.is_new {
            let spec = MonitorSpec {
                kind: patch.kind.unwrap_or(SourceKind::Shell),
                source: patch.source.clone().unwrap_or_default(),
                interval_secs: patch.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS),
                post_calc: patch.post_calc.clone(),
                display: patch.display.clone().unwrap_or(serde_json::Value::Null),
            };
            match spec.validate() {
                Ok(()) => {
                    config.insert(id.clone(), spec);
                    changes.push(MonitorChange {
                        id: id.clone(),
                        action: ChangeAction::Install {
                            clear_history: true,
                        },
                    });
                }
                Err(e) => rejected.push(MonitorError::BadPatch {
                    id: id.clone(),
                    reason: e.to_string(),
                }),
            }
            continue;
        }

        let Some(base) = prev.get(id) else {
            rejected.push(MonitorError::BadPatch {
                id: id.clone(),
                reason: "no previous monitor with this id".into(),
            });
            continue;
        };

        let mut merged = base.clone();
        if let Some(kind) = patch.kind {
            merged.kind = kind;
        }
        if let Some(source) = &patch.source {
            merged.source = source.clone();
        }
        if let Some(interval) = patch.interval_secs {
            merged.interval_secs = interval;
        }
        if let Some(expr) = &patch.post_calc {
            merged.post_calc = Some(expr.clone());
        }
        if let Some(display) = &patch.display {
            merged.display = display.clone();
        }

        if let Err(e) = merged.validate() {
            rejected.push(MonitorError::BadPatch {
                id: id.clone(),
                reason: e.to_string(),
            });
            continue;
        }

        let source_changed = merged.kind != base.kind || merged.source != base.source;
        let rebuild = source_changed
            || merged.interval_secs != base.interval_secs
            || merged.post_calc != base.post_calc;

        config.insert(id.clone(), merged);
        if rebuild {
            changes.push(MonitorChange {
                id: id.clone(),
                action: ChangeAction::Install {
                    clear_history: source_changed,
                },
            });
        }
    }

    MergeOutcome {
        config,
        changes,
        rejected,
    }
}
