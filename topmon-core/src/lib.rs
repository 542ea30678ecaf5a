pub mod catalog;
pub mod config;
pub mod error;
pub mod history;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod tap;
pub mod transform;


pub use catalog::{
    CandidateCommand, CapabilityProvider, CpuTempCommand, MetricCatalog, MetricCategory,
    MetricInfo, SysinfoProvider,
};
pub use config::{
    merge_config, ChangeAction, MergeOutcome, MonitorChange, MonitorConfig, MonitorPatch,
    MonitorSpec, SourceKind,
};
pub use error::MonitorError;
pub use history::{HistoryStore, MonitorEvent, Sample, HISTORY_CAP};
pub use registry::MonitorRegistry;
pub use service::{ApiResponse, ConfigSource, MemoryConfig, MonitorService};
pub use tap::{Direction, PatternSet, StreamTap};
pub use transform::Transform;
