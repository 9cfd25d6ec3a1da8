//! Bounded in-memory metrics history with stats, percentile and trend
//! queries.
//!
//! One series per container identity, ordered by timestamp. Queries never
//! fail; missing data yields `None` or zeros.

use crate::cluster::WorkloadId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One observed usage sample for a container
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricSample {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// CPU usage in millicores
    pub cpu_milli: u64,
    /// Memory usage in bytes
    pub mem_bytes: u64,
    /// Fraction of CPU periods throttled, 0-100
    pub cpu_throttle_percent: f64,
}

/// Distribution summary of one resource over a window
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    /// Smallest observed value
    pub min: f64,
    /// Largest observed value
    pub max: f64,
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation
    pub stddev: f64,
    /// Median
    pub p50: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
}

/// Stats for one container over a window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryStats {
    /// Number of samples in the window
    pub count: usize,
    /// CPU distribution, millicores
    pub cpu: ResourceStats,
    /// Memory distribution, bytes
    pub mem: ResourceStats,
    /// Mean throttle percentage
    pub throttle_avg: f64,
}

/// Direction of a fitted usage trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    /// Normalized slope above +0.01/s
    Increasing,
    /// Normalized slope below -0.01/s
    Decreasing,
    /// Slope within the stable band
    Stable,
}

/// Least-squares fit of one resource over a window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceTrend {
    /// Fitted slope in units per second
    pub slope_per_sec: f64,
    /// Coefficient of determination of the fit
    pub r_squared: f64,
    /// Coarse direction from the slope thresholds
    pub direction: TrendDirection,
    /// Confidence, `r_squared` clamped to [0, 1]
    pub confidence: f64,
}

/// Trend of CPU and memory over a window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Trend {
    /// CPU trend, millicores per second
    pub cpu: ResourceTrend,
    /// Memory trend, bytes per second
    pub mem: ResourceTrend,
}

/// Sizing and retention of the store
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Cap on points per container series; oldest 10% dropped on overflow
    pub max_points_per_container: usize,
    /// Samples older than this are removed by `prune`
    pub retention: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_points_per_container: 2016, // 7 days at 5m resolution
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

type Series = Arc<RwLock<Vec<MetricSample>>>;

/// Bounded per-container time-series store
pub struct HistoryStore {
    config: HistoryConfig,
    series: RwLock<HashMap<WorkloadId, Series>>,
}

impl HistoryStore {
    /// New empty store
    pub fn new(config: HistoryConfig) -> Self {
        Self { config, series: RwLock::new(HashMap::new()) }
    }

    fn series_for(&self, id: &WorkloadId) -> Series {
        if let Some(existing) = self.series.read().get(id) {
            return Arc::clone(existing);
        }
        let mut map = self.series.write();
        Arc::clone(
            map.entry(id.clone())
                .or_insert_with(|| Arc::new(RwLock::new(Vec::new()))),
        )
    }

    /// Append a sample. On overflow of `max_points_per_container` the
    /// oldest 10% of the series (at least one point) is dropped.
    pub fn record(&self, id: &WorkloadId, sample: MetricSample) {
        let series = self.series_for(id);
        let mut points = series.write();
        points.push(sample);
        if points.len() > self.config.max_points_per_container {
            let drop = (points.len() / 10).max(1);
            points.drain(0..drop);
            debug!(container = %id, dropped = drop, "history series overflowed");
        }
    }

    fn window_samples(&self, id: &WorkloadId, window: Duration) -> Vec<MetricSample> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(window.as_millis() as i64);
        let map = self.series.read();
        match map.get(id) {
            Some(series) => series
                .read()
                .iter()
                .filter(|s| s.timestamp > cutoff)
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Distribution stats over the window, or `None` if it holds no samples
    pub fn stats(&self, id: &WorkloadId, window: Duration) -> Option<HistoryStats> {
        let samples = self.window_samples(id, window);
        if samples.is_empty() {
            return None;
        }
        let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_milli as f64).collect();
        let mem: Vec<f64> = samples.iter().map(|s| s.mem_bytes as f64).collect();
        let throttle_avg =
            samples.iter().map(|s| s.cpu_throttle_percent).sum::<f64>() / samples.len() as f64;
        Some(HistoryStats {
            count: samples.len(),
            cpu: resource_stats(&cpu),
            mem: resource_stats(&mem),
            throttle_avg,
        })
    }

    /// Linear-interpolated percentile of CPU and memory independently.
    /// Returns `(0, 0)` when the window holds no samples.
    pub fn percentile(&self, id: &WorkloadId, window: Duration, p: f64) -> (f64, f64) {
        let samples = self.window_samples(id, window);
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        let p = p.clamp(0.0, 100.0);
        let mut cpu: Vec<f64> = samples.iter().map(|s| s.cpu_milli as f64).collect();
        let mut mem: Vec<f64> = samples.iter().map(|s| s.mem_bytes as f64).collect();
        cpu.sort_by(|a, b| a.total_cmp(b));
        mem.sort_by(|a, b| a.total_cmp(b));
        (percentile_of_sorted(&cpu, p), percentile_of_sorted(&mem, p))
    }

    /// Least-squares trend over the window. Requires at least two samples.
    pub fn trend(&self, id: &WorkloadId, window: Duration) -> Option<Trend> {
        let samples = self.window_samples(id, window);
        if samples.len() < 2 {
            return None;
        }
        let origin = samples[0].timestamp;
        let xs: Vec<f64> = samples
            .iter()
            .map(|s| (s.timestamp - origin).num_milliseconds() as f64 / 1000.0)
            .collect();
        let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_milli as f64).collect();
        let mem: Vec<f64> = samples.iter().map(|s| s.mem_bytes as f64).collect();
        Some(Trend {
            cpu: fit_trend(&xs, &cpu),
            mem: fit_trend(&xs, &mem),
        })
    }

    /// Remove samples older than the retention period and delete empty
    /// series. Returns the number of samples removed.
    pub fn prune(&self) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::milliseconds(self.config.retention.as_millis() as i64);
        let mut removed = 0;
        let mut empty: Vec<WorkloadId> = Vec::new();
        {
            let map = self.series.read();
            for (id, series) in map.iter() {
                let mut points = series.write();
                let before = points.len();
                points.retain(|s| s.timestamp >= cutoff);
                removed += before - points.len();
                if points.is_empty() {
                    empty.push(id.clone());
                }
            }
        }
        if !empty.is_empty() {
            let mut map = self.series.write();
            for id in &empty {
                // re-check under the write lock, a sample may have landed
                if map.get(id).map_or(false, |s| s.read().is_empty()) {
                    map.remove(id);
                }
            }
        }
        if removed > 0 {
            info!(removed, "pruned metric history");
        }
        removed
    }

    /// Number of tracked container series
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Number of samples currently held for a container
    pub fn sample_count(&self, id: &WorkloadId) -> usize {
        self.series
            .read()
            .get(id)
            .map(|s| s.read().len())
            .unwrap_or(0)
    }

    /// Background task calling [`HistoryStore::prune`] every 24 hours
    pub fn spawn_prune_task(
        store: Arc<HistoryStore>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
            interval.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        store.prune();
                    }
                }
            }
        })
    }
}

fn resource_stats(values: &[f64]) -> ResourceStats {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    ResourceStats {
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean,
        stddev: variance.sqrt(),
        p50: percentile_of_sorted(&sorted, 50.0),
        p95: percentile_of_sorted(&sorted, 95.0),
        p99: percentile_of_sorted(&sorted, 99.0),
    }
}

fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let frac = rank - lower as f64;
    sorted[lower] * (1.0 - frac) + sorted[upper] * frac
}

fn fit_trend(xs: &[f64], ys: &[f64]) -> ResourceTrend {
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys.iter()) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x) * (x - mean_x);
        var_y += (y - mean_y) * (y - mean_y);
    }
    let slope = if var_x == 0.0 { 0.0 } else { cov / var_x };
    let r_squared = if var_x == 0.0 || var_y == 0.0 {
        0.0
    } else {
        (cov * cov) / (var_x * var_y)
    };
    let direction = if slope > 0.01 {
        TrendDirection::Increasing
    } else if slope < -0.01 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };
    ResourceTrend {
        slope_per_sec: slope,
        r_squared,
        direction,
        confidence: r_squared.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WorkloadKind;

    fn id() -> WorkloadId {
        WorkloadId {
            namespace: "default".into(),
            kind: WorkloadKind::Deployment,
            name: "web".into(),
            container: "app".into(),
        }
    }

    fn sample(age_secs: i64, cpu: u64, mem: u64) -> MetricSample {
        MetricSample {
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
            cpu_milli: cpu,
            mem_bytes: mem,
            cpu_throttle_percent: 0.0,
        }
    }

    #[test]
    fn stats_mean_matches_arithmetic_mean() {
        let store = HistoryStore::new(HistoryConfig::default());
        let values: Vec<u64> = (1..=100).collect();
        for (i, v) in values.iter().enumerate() {
            store.record(&id(), sample(200 - i as i64, *v, *v * 1024));
        }
        let stats = store.stats(&id(), Duration::from_secs(3600)).unwrap();
        let expected = values.iter().sum::<u64>() as f64 / values.len() as f64;
        assert_eq!(stats.count, 100);
        assert!((stats.cpu.mean - expected).abs() < 1e-9);
        assert!((stats.mem.mean - expected * 1024.0).abs() < 1e-9);
    }

    #[test]
    fn stats_none_without_samples() {
        let store = HistoryStore::new(HistoryConfig::default());
        assert!(store.stats(&id(), Duration::from_secs(60)).is_none());
        assert_eq!(store.percentile(&id(), Duration::from_secs(60), 95.0), (0.0, 0.0));
    }

    #[test]
    fn percentile_monotonic_and_interpolated() {
        let store = HistoryStore::new(HistoryConfig::default());
        for (i, v) in [10u64, 20, 30, 40].iter().enumerate() {
            store.record(&id(), sample(100 - i as i64, *v, *v));
        }
        let window = Duration::from_secs(3600);
        let (p50, _) = store.percentile(&id(), window, 50.0);
        let (p95, _) = store.percentile(&id(), window, 95.0);
        let (p99, _) = store.percentile(&id(), window, 99.0);
        assert!((p50 - 25.0).abs() < 1e-9);
        assert!(p50 <= p95 && p95 <= p99);
        assert!((p99 - (30.0 + 0.97 * 10.0)).abs() < 1e-9);
    }

    #[test]
    fn overflow_drops_oldest_tenth() {
        let store = HistoryStore::new(HistoryConfig {
            max_points_per_container: 100,
            retention: Duration::from_secs(86400),
        });
        for i in 0..101u64 {
            store.record(&id(), sample(1000 - i as i64, i, i));
        }
        // 101 points overflowed, 10 dropped
        assert_eq!(store.sample_count(&id()), 91);
        let stats = store.stats(&id(), Duration::from_secs(86400)).unwrap();
        assert!((stats.cpu.min - 10.0).abs() < 1e-9);
    }

    #[test]
    fn trend_detects_growth() {
        let store = HistoryStore::new(HistoryConfig::default());
        // 1 milli per second of growth
        for i in 0..60i64 {
            store.record(&id(), sample(60 - i, (100 + i) as u64, 1 << 20));
        }
        let trend = store.trend(&id(), Duration::from_secs(3600)).unwrap();
        assert_eq!(trend.cpu.direction, TrendDirection::Increasing);
        assert!((trend.cpu.slope_per_sec - 1.0).abs() < 0.05);
        assert!(trend.cpu.confidence > 0.99);
        assert_eq!(trend.mem.direction, TrendDirection::Stable);
    }

    #[test]
    fn trend_requires_two_points() {
        let store = HistoryStore::new(HistoryConfig::default());
        store.record(&id(), sample(1, 100, 100));
        assert!(store.trend(&id(), Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn prune_removes_expired_and_empty_series() {
        let store = HistoryStore::new(HistoryConfig {
            max_points_per_container: 1000,
            retention: Duration::from_secs(3600),
        });
        store.record(&id(), sample(7200, 10, 10));
        store.record(&id(), sample(10, 20, 20));
        assert_eq!(store.prune(), 1);
        assert_eq!(store.sample_count(&id()), 1);

        let other = WorkloadId { name: "old".into(), ..id() };
        store.record(&other, sample(7200, 10, 10));
        store.prune();
        assert_eq!(store.series_count(), 1);
    }
}
