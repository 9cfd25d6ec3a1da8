//! Typed configuration with validation and hot reload.
//!
//! Configuration is declarative YAML. Validation failures are fatal at
//! startup; on hot reload a bad file is rejected with a warning and the
//! last good configuration stays active.

use crate::admission::AdmissionConfig;
use crate::error::{Result, RightsizerError};
use crate::executor::ExecutorConfig;
use crate::history::HistoryConfig;
use crate::policy::Rule;
use crate::recommend::{EngineConfig, ResourceTuning};
use crate::resources::{parse_cpu_milli, parse_mem_bytes};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How often the watcher polls the config file for changes
const WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// Namespace include/exclude lists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceSelector {
    /// Namespaces to reconcile; empty means all
    pub include: Vec<String>,
    /// Namespaces never reconciled
    pub exclude: Vec<String>,
}

impl NamespaceSelector {
    /// Whether a namespace is eligible for reconciliation
    pub fn allows(&self, namespace: &str) -> bool {
        if self.exclude.iter().any(|ns| ns == namespace) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|ns| ns == namespace)
    }
}

/// Global request/limit bounds, quantity strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bounds {
    /// Smallest allowed CPU request
    pub min_cpu_request: String,
    /// Smallest allowed memory request
    pub min_mem_request: String,
    /// Largest allowed CPU limit
    pub max_cpu_limit: String,
    /// Largest allowed memory limit
    pub max_mem_limit: String,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min_cpu_request: "10m".into(),
            min_mem_request: "16Mi".into(),
            max_cpu_limit: "8".into(),
            max_mem_limit: "16Gi".into(),
        }
    }
}

/// Optional behaviours, all off by default
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureGates {
    /// Align container resize policy to NotRequired before patching
    pub update_resize_policy: bool,
    /// Allow mutations that raise the pod QoS class
    pub allow_qos_upgrade: bool,
    /// Allow mutations that lower the pod QoS class
    pub allow_qos_downgrade: bool,
}

/// Default sizing strategy feeding the recommendation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyConfig {
    /// CPU utilization below which the container is scaled down
    pub cpu_min_util: f64,
    /// CPU utilization above which the container is scaled up
    pub cpu_max_util: f64,
    /// Memory utilization below which the container is scaled down
    pub mem_min_util: f64,
    /// Memory utilization above which the container is scaled up
    pub mem_max_util: f64,
    /// Multiplier applied to p95 when scaling down
    pub down_buffer: f64,
    /// Multiplier applied to p95 when scaling up
    pub up_buffer: f64,
    /// CPU limit as a multiple of the request
    pub cpu_limit_multiplier: f64,
    /// Memory limit as a multiple of the request
    pub mem_limit_multiplier: f64,
    /// Minimum history depth before any decision
    pub min_samples_for_decision: usize,
    /// Sample count at which data confidence saturates
    pub target_sample_count: usize,
    /// Proposals below this confidence are withheld
    pub confidence_threshold: f64,
    /// History window in days
    pub lookback_days: u64,
    /// Mean throttle percentage that forces a CPU upscale
    pub throttle_upscale_percent: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            cpu_min_util: 0.2,
            cpu_max_util: 0.8,
            mem_min_util: 0.3,
            mem_max_util: 0.85,
            down_buffer: 1.1,
            up_buffer: 1.2,
            cpu_limit_multiplier: 1.5,
            mem_limit_multiplier: 1.25,
            min_samples_for_decision: 12,
            target_sample_count: 100,
            confidence_threshold: 0.7,
            lookback_days: 7,
            throttle_upscale_percent: 25.0,
        }
    }
}

/// History store sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistorySettings {
    /// Cap on points per container series
    pub max_points_per_container: usize,
    /// Samples older than this many days are pruned
    pub retention_days: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { max_points_per_container: 2016, retention_days: 7 }
    }
}

/// Metrics backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSettings {
    /// Provider name; external backends are injected at startup
    pub provider: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { provider: "simulated".into() }
    }
}

/// Top-level rightsizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RightsizerConfig {
    /// Master switch; a disabled instance ticks but does nothing
    pub enabled: bool,
    /// Log and audit intended changes, never mutate
    pub dry_run: bool,
    /// Seconds between reconciliation ticks
    pub resize_interval_secs: u64,
    /// Deadline for each remote call, seconds
    pub op_timeout_secs: u64,
    /// How long to wait for a resize to be observed, seconds
    pub resize_timeout_secs: u64,
    /// Grace given to in-flight mutations on shutdown, seconds
    pub shutdown_grace_secs: u64,
    /// Minimum seconds between two mutations of the same container
    pub cooldown_secs: u64,
    /// Pods younger than this are not touched, seconds
    pub min_pod_age_secs: u64,
    /// Pods with this many restarts are not touched
    pub max_restart_count: u32,
    /// Consecutive failures that open the circuit for a container
    pub failure_circuit_threshold: u32,
    /// Seconds after which the failure circuit closes again
    pub failure_circuit_reset_secs: u64,
    /// Cluster-wide cap on in-flight mutations
    pub max_concurrent_mutations: usize,
    /// Namespace selection
    pub namespaces: NamespaceSelector,
    /// Global bounds
    pub bounds: Bounds,
    /// Maximum per-mutation fractional change before a safety warning
    pub safety_threshold: f64,
    /// Escalate safety-threshold violations to errors
    pub strict_safety: bool,
    /// Feature gates
    pub feature_gates: FeatureGates,
    /// Default sizing strategy
    pub strategy: StrategyConfig,
    /// History store sizing
    pub history: HistorySettings,
    /// Metrics backend selection
    pub metrics: MetricsSettings,
    /// Audit log file; absent disables the file sink
    pub audit_log_path: Option<PathBuf>,
    /// Policy rules; the built-in defaults load when empty
    pub rules: Vec<Rule>,
}

impl Default for RightsizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            resize_interval_secs: 30,
            op_timeout_secs: 10,
            resize_timeout_secs: 30,
            shutdown_grace_secs: 20,
            cooldown_secs: 300,
            min_pod_age_secs: 60,
            max_restart_count: 5,
            failure_circuit_threshold: 3,
            failure_circuit_reset_secs: 3600,
            max_concurrent_mutations: 3,
            namespaces: NamespaceSelector::default(),
            bounds: Bounds::default(),
            safety_threshold: 0.5,
            strict_safety: false,
            feature_gates: FeatureGates::default(),
            strategy: StrategyConfig::default(),
            history: HistorySettings::default(),
            metrics: MetricsSettings::default(),
            audit_log_path: None,
            rules: Vec::new(),
        }
    }
}

impl RightsizerConfig {
    /// Seconds between reconciliation ticks
    pub fn resize_interval(&self) -> Duration {
        Duration::from_secs(self.resize_interval_secs)
    }

    /// Deadline for each remote call
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    /// Deadline for one whole tick
    pub fn tick_deadline(&self) -> Duration {
        self.resize_interval() * 2
    }

    /// Minimum time between two mutations of the same container
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Grace given to in-flight mutations on shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Minimum pod age before reconciliation
    pub fn min_pod_age(&self) -> Duration {
        Duration::from_secs(self.min_pod_age_secs)
    }

    /// Window after which the failure circuit closes again
    pub fn failure_circuit_reset(&self) -> Duration {
        Duration::from_secs(self.failure_circuit_reset_secs)
    }

    /// History window consulted by the engine
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.strategy.lookback_days * 24 * 3600)
    }

    /// Engine configuration derived from the strategy section
    pub fn engine_config(&self) -> EngineConfig {
        let s = &self.strategy;
        EngineConfig {
            cpu: ResourceTuning {
                min_util: s.cpu_min_util,
                max_util: s.cpu_max_util,
                down_buffer: s.down_buffer,
                up_buffer: s.up_buffer,
                limit_multiplier: s.cpu_limit_multiplier,
                limit_additive: 0,
            },
            mem: ResourceTuning {
                min_util: s.mem_min_util,
                max_util: s.mem_max_util,
                down_buffer: s.down_buffer,
                up_buffer: s.up_buffer,
                limit_multiplier: s.mem_limit_multiplier,
                limit_additive: 0,
            },
            min_samples_for_decision: s.min_samples_for_decision,
            target_sample_count: s.target_sample_count,
            confidence_threshold: s.confidence_threshold,
            lookback: self.lookback(),
            throttle_upscale_percent: s.throttle_upscale_percent,
        }
    }

    /// Admission configuration; fails on unparseable bounds
    pub fn admission_config(&self) -> Result<AdmissionConfig> {
        Ok(AdmissionConfig {
            min_cpu_request_milli: parse_cpu_milli(&self.bounds.min_cpu_request)?,
            min_mem_request_bytes: parse_mem_bytes(&self.bounds.min_mem_request)?,
            max_cpu_limit_milli: parse_cpu_milli(&self.bounds.max_cpu_limit)?,
            max_mem_limit_bytes: parse_mem_bytes(&self.bounds.max_mem_limit)?,
            safety_threshold: self.safety_threshold,
            strict_safety: self.strict_safety,
            allow_qos_upgrade: self.feature_gates.allow_qos_upgrade,
            allow_qos_downgrade: self.feature_gates.allow_qos_downgrade,
        })
    }

    /// Executor configuration
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            resize_timeout: Duration::from_secs(self.resize_timeout_secs),
            poll_interval: Duration::from_secs(1),
            op_timeout: self.op_timeout(),
            update_resize_policy: self.feature_gates.update_resize_policy,
            dry_run: self.dry_run,
        }
    }

    /// History store configuration
    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            max_points_per_container: self.history.max_points_per_container,
            retention: Duration::from_secs(self.history.retention_days * 24 * 3600),
        }
    }

    /// Validate the configuration. Any error here is fatal: the scheduler
    /// refuses to start (or keeps the previous configuration on reload).
    pub fn validate(&self) -> Result<()> {
        let admission = self.admission_config()?;
        if admission.min_cpu_request_milli > admission.max_cpu_limit_milli {
            return Err(RightsizerError::config(format!(
                "minCpuRequest {} exceeds maxCpuLimit {}",
                self.bounds.min_cpu_request, self.bounds.max_cpu_limit
            )));
        }
        if admission.min_mem_request_bytes > admission.max_mem_limit_bytes {
            return Err(RightsizerError::config(format!(
                "minMemRequest {} exceeds maxMemLimit {}",
                self.bounds.min_mem_request, self.bounds.max_mem_limit
            )));
        }
        if self.resize_interval_secs == 0 {
            return Err(RightsizerError::config("resizeInterval must be positive"));
        }
        if self.op_timeout_secs == 0 {
            return Err(RightsizerError::config("opTimeout must be positive"));
        }
        if self.max_concurrent_mutations == 0 {
            return Err(RightsizerError::config("maxConcurrentMutations must be positive"));
        }
        if !(0.0..=1.0).contains(&self.strategy.confidence_threshold) {
            return Err(RightsizerError::config("confidenceThreshold must be within [0, 1]"));
        }
        for (name, value) in [
            ("cpuMinUtil", self.strategy.cpu_min_util),
            ("cpuMaxUtil", self.strategy.cpu_max_util),
            ("memMinUtil", self.strategy.mem_min_util),
            ("memMaxUtil", self.strategy.mem_max_util),
        ] {
            if value <= 0.0 {
                return Err(RightsizerError::config(format!("{} must be positive", name)));
            }
        }
        if self.strategy.cpu_min_util >= self.strategy.cpu_max_util
            || self.strategy.mem_min_util >= self.strategy.mem_max_util
        {
            return Err(RightsizerError::config("minUtil must be below maxUtil"));
        }
        if self.history.max_points_per_container == 0 {
            return Err(RightsizerError::config("maxPointsPerContainer must be positive"));
        }
        // rule action quantities must parse; regex problems only disable
        // the rule at compile time
        for rule in &self.rules {
            let a = &rule.actions;
            for value in [&a.set_cpu_request, &a.set_cpu_limit, &a.min_cpu, &a.max_cpu] {
                if let Some(value) = value {
                    parse_cpu_milli(value)?;
                }
            }
            for value in [&a.set_mem_request, &a.set_mem_limit, &a.min_mem, &a.max_mem] {
                if let Some(value) = value {
                    parse_mem_bytes(value)?;
                }
            }
        }
        Ok(())
    }

    /// Load and validate a configuration file
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: RightsizerConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

/// Holds the active configuration and hot-reloads it from disk.
pub struct ConfigManager {
    path: Option<PathBuf>,
    current: Arc<ArcSwap<RightsizerConfig>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigManager {
    /// Load the file at `path` and start from it
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = RightsizerConfig::load_from_path(&path)?;
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Ok(Self {
            path: Some(path),
            current: Arc::new(ArcSwap::from_pointee(config)),
            last_modified: Mutex::new(modified),
        })
    }

    /// Start from an in-memory configuration, no file watching
    pub fn from_config(config: RightsizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: None,
            current: Arc::new(ArcSwap::from_pointee(config)),
            last_modified: Mutex::new(None),
        })
    }

    /// Shared handle to the active configuration
    pub fn handle(&self) -> Arc<ArcSwap<RightsizerConfig>> {
        Arc::clone(&self.current)
    }

    /// Current configuration snapshot
    pub fn current(&self) -> Arc<RightsizerConfig> {
        self.current.load_full()
    }

    /// Reload the file if it changed on disk. A file that fails to parse
    /// or validate is rejected and the last good configuration stays
    /// active. Returns whether a new configuration was applied.
    pub fn reload_if_changed(&self) -> bool {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return false,
        };
        let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(err) => {
                warn!(%err, path = %path.display(), "config file unreadable, keeping last good");
                return false;
            }
        };
        {
            let mut last = self.last_modified.lock();
            if *last == Some(modified) {
                return false;
            }
            *last = Some(modified);
        }
        match RightsizerConfig::load_from_path(&path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration reloaded");
                self.current.store(Arc::new(config));
                true
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "config reload rejected, keeping last good");
                false
            }
        }
    }

    /// Background task polling the file for changes
    pub fn spawn_watcher(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.reload_if_changed();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        RightsizerConfig::default().validate().unwrap();
    }

    #[test]
    fn min_above_max_is_fatal() {
        let mut config = RightsizerConfig::default();
        config.bounds.min_cpu_request = "10".into();
        config.bounds.max_cpu_limit = "2".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unparseable_bound_is_fatal() {
        let mut config = RightsizerConfig::default();
        config.bounds.min_mem_request = "plenty".into();
        assert!(matches!(
            config.validate(),
            Err(RightsizerError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn yaml_roundtrip_with_partial_file() {
        let yaml = r#"
dryRun: true
resizeIntervalSecs: 15
namespaces:
  exclude: ["kube-system"]
bounds:
  minCpuRequest: "25m"
rules:
  - name: batch-skip
    priority: 50
    selectors:
      workloadKinds: ["Job"]
    actions:
      skip: true
"#;
        let config: RightsizerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert!(config.dry_run);
        assert_eq!(config.resize_interval_secs, 15);
        assert_eq!(config.bounds.min_cpu_request, "25m");
        // untouched fields keep their defaults
        assert_eq!(config.cooldown_secs, 300);
        assert_eq!(config.rules.len(), 1);
        assert!(!config.namespaces.allows("kube-system"));
        assert!(config.namespaces.allows("default"));
    }

    #[test]
    fn reload_keeps_last_good_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "resizeIntervalSecs: 45\n").unwrap();
        let manager = ConfigManager::from_path(&path).unwrap();
        assert_eq!(manager.current().resize_interval_secs, 45);

        // write garbage with a newer mtime
        std::thread::sleep(Duration::from_millis(20));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "resizeIntervalSecs: 0").unwrap();
        drop(file);
        filetime_bump(&path);
        assert!(!manager.reload_if_changed());
        assert_eq!(manager.current().resize_interval_secs, 45);

        // a good file is picked up
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(&path, "resizeIntervalSecs: 60\n").unwrap();
        filetime_bump(&path);
        assert!(manager.reload_if_changed());
        assert_eq!(manager.current().resize_interval_secs, 60);
    }

    // ensure the watcher sees a new mtime even on coarse-grained filesystems
    fn filetime_bump(path: &Path) {
        let file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.set_modified(SystemTime::now()).unwrap();
    }
}
