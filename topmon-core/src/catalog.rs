use crate::config::{MonitorConfig, MonitorSpec, SourceKind};
use crate::resolver;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::Path;
use sysinfo::{Components, CpuRefreshKind, Disks, System};
use tracing::debug;

const MB: f64 = 1_048_576.0;

/// Pattern and transform for the default cooling-fan monitor.
pub const FAN_PATTERN: &str = "^M106.*?S([^ ]+)";
pub const FAN_TRANSFORM: &str = "X/255*100";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Cpu,
    Load,
    Memory,
    Swap,
    Disk,
    Sensor,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricInfo {
    pub key: String,
    pub description: String,
    pub category: MetricCategory,
}

impl MetricInfo {
    fn new(key: impl Into<String>, description: impl Into<String>, category: MetricCategory) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            category,
        }
    }
}

/// Host-specific metric probing. The core only ever consults this trait;
/// tests substitute a fixed table.
pub trait CapabilityProvider: Send + Sync {
    fn list_metrics(&self) -> Vec<MetricInfo>;
    /// Current value for a key, or None when the key is unknown or the
    /// sensor has nothing to report. Never panics.
    fn probe(&self, key: &str) -> Option<f64>;
}

/// A CPU-temperature shell probe that may work on this platform.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateCommand {
    pub command: String,
    pub label: String,
    /// Filesystem path that must exist before the command is worth trying.
    pub requires: String,
}

/// The first candidate that exists and produced a parseable float.
#[derive(Debug, Clone, Serialize)]
pub struct CpuTempCommand {
    pub command: String,
    pub label: String,
    pub sample: f64,
}

/// Registry of built-in metrics plus the platform CPU-temperature probes.
///
/// Entries never mutate spontaneously; `reload` is an explicit on-demand
/// operation driven by configuration tooling, never by the scheduler.
pub struct MetricCatalog {
    provider: Box<dyn CapabilityProvider>,
    metrics: RwLock<Vec<MetricInfo>>,
    candidates: RwLock<Vec<CandidateCommand>>,
    cpu_temp: RwLock<Option<CpuTempCommand>>,
}

impl MetricCatalog {
    pub fn new(provider: Box<dyn CapabilityProvider>) -> Self {
        let metrics = provider.list_metrics();
        Self {
            provider,
            metrics: RwLock::new(metrics),
            candidates: RwLock::new(cpu_temp_candidates()),
            cpu_temp: RwLock::new(None),
        }
    }

    pub fn metrics(&self) -> Vec<MetricInfo> {
        self.metrics.read().clone()
    }

    pub fn probe(&self, key: &str) -> Option<f64> {
        self.provider.probe(key)
    }

    pub fn candidate_commands(&self) -> Vec<CandidateCommand> {
        self.candidates.read().clone()
    }

    pub fn cpu_temp_command(&self) -> Option<CpuTempCommand> {
        self.cpu_temp.read().clone()
    }

    /// Re-enumerate host capabilities and re-run CPU-temperature detection.
    pub async fn reload(&self) {
        *self.metrics.write() = self.provider.list_metrics();
        *self.candidates.write() = cpu_temp_candidates();
        self.detect_cpu_temp().await;
    }

    /// Try each candidate in priority order; the first whose probe path
    /// exists and whose output parses as a float wins.
    pub async fn detect_cpu_temp(&self) -> Option<CpuTempCommand> {
        let candidates = self.candidates.read().clone();
        for candidate in candidates {
            if !Path::new(&candidate.requires).exists() {
                debug!(requires = %candidate.requires, "cpu temp candidate not present");
                continue;
            }
            match resolver::resolve_shell(&candidate.command, resolver::DEFAULT_TIMEOUT_SECS).await {
                Ok(sample) => {
                    let found = CpuTempCommand {
                        command: candidate.command,
                        label: candidate.label,
                        sample,
                    };
                    *self.cpu_temp.write() = Some(found.clone());
                    return Some(found);
                }
                Err(e) => debug!(label = %candidate.label, error = %e, "cpu temp candidate failed"),
            }
        }
        *self.cpu_temp.write() = None;
        None
    }

    /// The suggested first-run monitor set: the detected CPU-temperature
    /// command (when one won) and the cooling-fan stream monitor.
    pub fn default_monitors(&self) -> MonitorConfig {
        let mut config = MonitorConfig::new();
        if let Some(cpu) = self.cpu_temp_command() {
            config.insert(
                "cu0".to_string(),
                MonitorSpec {
                    kind: SourceKind::Shell,
                    source: cpu.command,
                    display: serde_json::json!({
                        "name": "CPU temperature",
                        "label": "CPU:",
                        "icon": "fas fa-thermometer-full",
                        "is_temp": true,
                        "color_change_level": 80,
                        "show_unit": true,
                    }),
                    ..MonitorSpec::default()
                },
            );
        }
        config.insert(
            "cu1".to_string(),
            MonitorSpec {
                kind: SourceKind::StreamOut,
                source: FAN_PATTERN.to_string(),
                post_calc: Some(FAN_TRANSFORM.to_string()),
                display: serde_json::json!({
                    "name": "Cooling fan speed",
                    "label": "F:",
                    "icon": "fas fa-fan",
                    "is_temp": false,
                    "unit": "%",
                    "wait_for_print": true,
                }),
                ..MonitorSpec::default()
            },
        );
        config
    }
}

/// Build the platform's CPU-temperature probe list in priority order.
#[cfg(target_os = "linux")]
fn cpu_temp_candidates() -> Vec<CandidateCommand> {
    let mut candidates = Vec::new();

    for path in ["/opt/vc/bin/vcgencmd", "/usr/bin/vcgencmd"] {
        candidates.push(CandidateCommand {
            command: format!("{path} measure_temp|cut -d \"=\" -f2|cut -d\"'\" -f1"),
            label: format!("CPU vcgencmd ({path})"),
            requires: path.to_string(),
        });
    }
    candidates.push(CandidateCommand {
        command: "/usr/bin/acpi -t |cut -d \",\" -f2| cut -d\" \" -f2".to_string(),
        label: "CPU ACPI".to_string(),
        requires: "/usr/bin/acpi".to_string(),
    });

    // Thermal zones whose type names the CPU, millidegrees scaled to C.
    if let Ok(entries) = std::fs::read_dir("/sys/class/thermal") {
        for entry in entries.flatten() {
            let zone = entry.path();
            let Ok(kind) = std::fs::read_to_string(zone.join("type")) else {
                continue;
            };
            let temp = zone.join("temp");
            if kind.to_lowercase().contains("cpu") && temp.is_file() {
                let temp = temp.display().to_string();
                candidates.push(CandidateCommand {
                    command: format!("awk '{{print $0/1000}}' {temp}"),
                    label: "CPU thermal zone".to_string(),
                    requires: temp,
                });
            }
        }
    }

    // DS18B20 1-wire sensors with a valid CRC reading.
    if let Ok(entries) = std::fs::read_dir("/sys/bus/w1/devices") {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("28-") {
                continue;
            }
            let slave = entry.path().join("w1_slave");
            let Ok(content) = std::fs::read_to_string(&slave) else {
                continue;
            };
            if content.contains("YES") {
                let slave = slave.display().to_string();
                candidates.push(CandidateCommand {
                    command: format!(
                        "awk -F'[ =]' '$10==\"t\"{{printf(\"%.2f\\n\",$11/1000)}}' {slave}"
                    ),
                    label: format!("DS18B20 sensor ({name})"),
                    requires: slave,
                });
            }
        }
    }

    candidates
}

#[cfg(not(target_os = "linux"))]
fn cpu_temp_candidates() -> Vec<CandidateCommand> {
    Vec::new()
}

/// sysinfo-backed capability provider: CPU, load, memory, swap,
/// per-partition disk usage, and per-sensor temperatures.
pub struct SysinfoProvider {
    system: Mutex<System>,
}

impl SysinfoProvider {
    pub fn new() -> Self {
        let mut system = System::new();
        // First usage reading is always zero; warm it up so the first
        // scheduled probe reports something real.
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityProvider for SysinfoProvider {
    fn list_metrics(&self) -> Vec<MetricInfo> {
        use MetricCategory::*;
        let mut list = vec![
            MetricInfo::new("cpup", "CPU usage %", Cpu),
            MetricInfo::new("cpuf", "CPU frequency in MHz", Cpu),
            MetricInfo::new("loadavg1", "Average system load last 1 minute", Load),
            MetricInfo::new("loadavg5", "Average system load last 5 minutes", Load),
            MetricInfo::new("loadavg15", "Average system load last 15 minutes", Load),
            MetricInfo::new("memtotal", "Total physical memory (exclusive swap) in MB", Memory),
            MetricInfo::new("memavail", "Total available memory in MB", Memory),
            MetricInfo::new("memused", "Memory used in MB", Memory),
            MetricInfo::new("memfree", "Memory not being used at all in MB", Memory),
            MetricInfo::new("memp", "Memory used %", Memory),
            MetricInfo::new("swaptotal", "Total swap memory in MB", Swap),
            MetricInfo::new("swapused", "Used swap memory in MB", Swap),
            MetricInfo::new("swapfree", "Free swap memory in MB", Swap),
            MetricInfo::new("swapperc", "Swap used %", Swap),
        ];

        let disks = Disks::new_with_refreshed_list();
        for (i, disk) in disks.list().iter().enumerate() {
            let mount = disk.mount_point().display();
            list.push(MetricInfo::new(
                format!("diskfree_{i}"),
                format!("Disk free \"{mount}\" in MB"),
                Disk,
            ));
            list.push(MetricInfo::new(
                format!("disktotal_{i}"),
                format!("Disk total \"{mount}\" in MB"),
                Disk,
            ));
            list.push(MetricInfo::new(
                format!("diskused_{i}"),
                format!("Disk used \"{mount}\" in MB"),
                Disk,
            ));
            list.push(MetricInfo::new(
                format!("diskperc_{i}"),
                format!("Disk used % \"{mount}\""),
                Disk,
            ));
        }

        let components = Components::new_with_refreshed_list();
        for (i, component) in components.list().iter().enumerate() {
            list.push(MetricInfo::new(
                format!("temp_{i}"),
                format!("Temperature {}", component.label()),
                Sensor,
            ));
        }

        list
    }

    fn probe(&self, key: &str) -> Option<f64> {
        match key {
            "cpup" => {
                let mut sys = self.system.lock();
                sys.refresh_cpu_specifics(CpuRefreshKind::everything());
                Some(sys.global_cpu_usage() as f64)
            }
            "cpuf" => {
                let mut sys = self.system.lock();
                sys.refresh_cpu_specifics(CpuRefreshKind::everything());
                sys.cpus().first().map(|c| c.frequency() as f64)
            }
            "loadavg1" => Some(System::load_average().one),
            "loadavg5" => Some(System::load_average().five),
            "loadavg15" => Some(System::load_average().fifteen),
            "memtotal" | "memavail" | "memused" | "memfree" | "memp" => {
                let mut sys = self.system.lock();
                sys.refresh_memory();
                let total = sys.total_memory() as f64;
                match key {
                    "memtotal" => Some(total / MB),
                    "memavail" => Some(sys.available_memory() as f64 / MB),
                    "memused" => Some(sys.used_memory() as f64 / MB),
                    "memfree" => Some(sys.free_memory() as f64 / MB),
                    _ if total > 0.0 => Some(sys.used_memory() as f64 / total * 100.0),
                    _ => None,
                }
            }
            "swaptotal" | "swapused" | "swapfree" | "swapperc" => {
                let mut sys = self.system.lock();
                sys.refresh_memory();
                let total = sys.total_swap() as f64;
                match key {
                    "swaptotal" => Some(total / MB),
                    "swapused" => Some(sys.used_swap() as f64 / MB),
                    "swapfree" => Some(sys.free_swap() as f64 / MB),
                    _ if total > 0.0 => Some(sys.used_swap() as f64 / total * 100.0),
                    _ => None,
                }
            }
            _ if key.starts_with("disk") => {
                let (which, index) = key.split_once('_')?;
                let index: usize = index.parse().ok()?;
                let disks = Disks::new_with_refreshed_list();
                let disk = disks.list().get(index)?;
                let total = disk.total_space() as f64;
                let free = disk.available_space() as f64;
                match which {
                    "diskfree" => Some(free / MB),
                    "disktotal" => Some(total / MB),
                    "diskused" => Some((total - free) / MB),
                    "diskperc" if total > 0.0 => Some((total - free) / total * 100.0),
                    _ => None,
                }
            }
            _ if key.starts_with("temp_") => {
                let index: usize = key.strip_prefix("temp_")?.parse().ok()?;
                let components = Components::new_with_refreshed_list();
                components.list().get(index).map(|c| c.temperature() as f64)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_provider_lists_static_keys() {
        let provider = SysinfoProvider::new();
        let metrics = provider.list_metrics();
        for key in ["cpup", "loadavg1", "memtotal", "swapperc"] {
            assert!(metrics.iter().any(|m| m.key == key), "missing {key}");
        }
    }

    #[test]
    fn unknown_key_probes_to_none() {
        let provider = SysinfoProvider::new();
        assert!(provider.probe("nonsense").is_none());
        assert!(provider.probe("diskfree_9999").is_none());
    }

    #[test]
    fn memory_probe_reports_something() {
        let provider = SysinfoProvider::new();
        assert!(provider.probe("memtotal").unwrap() > 0.0);
        let pct = provider.probe("memp").unwrap();
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    fn default_monitors_always_include_fan() {
        let catalog = MetricCatalog::new(Box::new(SysinfoProvider::new()));
        let config = catalog.default_monitors();
        let fan = &config["cu1"];
        assert_eq!(fan.kind, SourceKind::StreamOut);
        assert_eq!(fan.source, FAN_PATTERN);
        assert_eq!(fan.post_calc.as_deref(), Some(FAN_TRANSFORM));
    }
}
