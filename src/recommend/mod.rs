//! Recommendation engine: turns usage history and the current allocation
//! into a proposed requests/limits pair with a confidence and a rationale.
//!
//! CPU and memory are decided independently. A resource is only moved when
//! the history is deep enough, the confidence clears the threshold and the
//! observed utilization leaves the target band.

use crate::cluster::WorkloadId;
use crate::history::{HistoryStats, ResourceStats};
use crate::resources::{
    format_cpu_milli, format_mem_bytes, round_cpu_milli, round_mem_bytes, ResourceDimension,
    ResourceSpec, ScaleDirection,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Per-resource tuning of the decision rules
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceTuning {
    /// Utilization below which the resource is scaled down
    pub min_util: f64,
    /// Utilization above which the resource is scaled up
    pub max_util: f64,
    /// Multiplier applied to p95 when scaling down
    pub down_buffer: f64,
    /// Multiplier applied to p95 when scaling up
    pub up_buffer: f64,
    /// Limit = max(request * limit_multiplier, request + limit_additive)
    pub limit_multiplier: f64,
    /// Additive slack between request and limit, native units
    pub limit_additive: u64,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// CPU tuning
    pub cpu: ResourceTuning,
    /// Memory tuning
    pub mem: ResourceTuning,
    /// Minimum samples before any decision is made
    pub min_samples_for_decision: usize,
    /// Sample count at which data confidence saturates
    pub target_sample_count: usize,
    /// Proposals below this confidence are withheld
    pub confidence_threshold: f64,
    /// History window consulted for stats and percentiles
    pub lookback: Duration,
    /// Mean throttle percentage above which CPU is scaled up regardless of
    /// utilization
    pub throttle_upscale_percent: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu: ResourceTuning {
                min_util: 0.2,
                max_util: 0.8,
                down_buffer: 1.1,
                up_buffer: 1.2,
                limit_multiplier: 1.5,
                limit_additive: 0,
            },
            mem: ResourceTuning {
                min_util: 0.3,
                max_util: 0.85,
                down_buffer: 1.1,
                up_buffer: 1.2,
                limit_multiplier: 1.25,
                limit_additive: 0,
            },
            min_samples_for_decision: 12,
            target_sample_count: 100,
            confidence_threshold: 0.7,
            lookback: Duration::from_secs(7 * 24 * 3600),
            throttle_upscale_percent: 25.0,
        }
    }
}

/// A proposed resource change for one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Container identity within its parent workload
    pub workload: WorkloadId,
    /// Pod the container currently runs in
    pub pod_name: String,
    /// UID of that pod
    pub pod_uid: String,
    /// Allocation at decision time
    pub current: ResourceSpec,
    /// Proposed allocation
    pub proposed: ResourceSpec,
    /// Overall direction of the change
    pub direction: ScaleDirection,
    /// Decision confidence in [0, 1]
    pub confidence: f64,
    /// Human-readable rationale
    pub reason: String,
    /// Policy rules applied after the engine ran, in application order
    pub rules_applied: Vec<String>,
}

impl Proposal {
    /// A no-change proposal with the given reason
    pub fn none(
        workload: WorkloadId,
        pod_name: &str,
        pod_uid: &str,
        current: ResourceSpec,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            workload,
            pod_name: pod_name.to_string(),
            pod_uid: pod_uid.to_string(),
            current,
            proposed: current,
            direction: ScaleDirection::None,
            confidence: 0.0,
            reason: reason.into(),
            rules_applied: Vec::new(),
        }
    }

    /// Whether the proposal changes anything
    pub fn is_actionable(&self) -> bool {
        self.direction != ScaleDirection::None && self.proposed != self.current
    }

    /// Direction label covering both resources, for annotations
    pub fn optimization_type(&self) -> &'static str {
        let up = request_increased(&self.current, &self.proposed);
        let down = request_decreased(&self.current, &self.proposed);
        match (up, down) {
            (true, true) => "both",
            (true, false) => "up",
            (false, true) => "down",
            (false, false) => "none",
        }
    }
}

/// Overall direction of a change between two specs, judged on requests.
pub fn direction_of(current: &ResourceSpec, proposed: &ResourceSpec) -> ScaleDirection {
    if request_increased(current, proposed) {
        ScaleDirection::Up
    } else if request_decreased(current, proposed) {
        ScaleDirection::Down
    } else {
        ScaleDirection::None
    }
}

fn request_increased(current: &ResourceSpec, proposed: &ResourceSpec) -> bool {
    [ResourceDimension::Cpu, ResourceDimension::Memory].iter().any(|d| {
        matches!(
            (current.pair(*d).0, proposed.pair(*d).0),
            (Some(c), Some(p)) if p > c
        )
    })
}

fn request_decreased(current: &ResourceSpec, proposed: &ResourceSpec) -> bool {
    [ResourceDimension::Cpu, ResourceDimension::Memory].iter().any(|d| {
        matches!(
            (current.pair(*d).0, proposed.pair(*d).0),
            (Some(c), Some(p)) if p < c
        )
    })
}

/// Derive the proposed limit for a request.
///
/// A resource currently running with request == limit keeps that equality so
/// the pod's QoS shape survives the resize; otherwise the limit is the
/// configured multiple of the request with the additive slack as a floor.
pub fn derive_limit(
    dim: ResourceDimension,
    request: u64,
    current: &ResourceSpec,
    tuning: &ResourceTuning,
) -> u64 {
    let (cur_request, cur_limit) = current.pair(dim);
    if let (Some(r), Some(l)) = (cur_request, cur_limit) {
        if r == l {
            return request;
        }
    }
    let raw = (request as f64 * tuning.limit_multiplier)
        .max(request as f64 + tuning.limit_additive as f64);
    let rounded = match dim {
        ResourceDimension::Cpu => round_cpu_milli(raw),
        ResourceDimension::Memory => round_mem_bytes(raw),
    };
    rounded.max(request)
}

struct ResourceDecision {
    target_request: Option<u64>,
    confidence: f64,
    note: String,
}

/// The recommendation engine
#[derive(Debug, Clone)]
pub struct RecommendationEngine {
    config: EngineConfig,
}

impl RecommendationEngine {
    /// New engine with the given configuration
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compute a proposal for one container.
    pub fn recommend(
        &self,
        workload: WorkloadId,
        pod_name: &str,
        pod_uid: &str,
        current: ResourceSpec,
        stats: Option<&HistoryStats>,
    ) -> Proposal {
        let stats = match stats {
            Some(s) if s.count >= self.config.min_samples_for_decision => s,
            _ => {
                return Proposal::none(workload, pod_name, pod_uid, current, "insufficient history")
            }
        };

        let cpu = self.decide(
            ResourceDimension::Cpu,
            current.cpu_request,
            &stats.cpu,
            stats.count,
            stats.throttle_avg,
        );
        let mem = self.decide(
            ResourceDimension::Memory,
            current.mem_request,
            &stats.mem,
            stats.count,
            0.0,
        );

        let mut proposed = current;
        if let Some(target) = cpu.target_request {
            let limit = derive_limit(ResourceDimension::Cpu, target, &current, &self.config.cpu);
            proposed.set_pair(ResourceDimension::Cpu, Some(target), Some(limit));
        }
        if let Some(target) = mem.target_request {
            let limit = derive_limit(ResourceDimension::Memory, target, &current, &self.config.mem);
            proposed.set_pair(ResourceDimension::Memory, Some(target), Some(limit));
        }

        let direction = direction_of(&current, &proposed);

        let confidence = cpu.confidence.min(mem.confidence);
        let reason = format!("cpu: {}; memory: {}", cpu.note, mem.note);
        debug!(container = %workload, %direction, confidence, "recommendation computed");

        Proposal {
            workload,
            pod_name: pod_name.to_string(),
            pod_uid: pod_uid.to_string(),
            current,
            proposed,
            direction,
            confidence,
            reason,
            rules_applied: Vec::new(),
        }
    }

    fn decide(
        &self,
        dim: ResourceDimension,
        current_request: Option<u64>,
        stats: &ResourceStats,
        count: usize,
        throttle_avg: f64,
    ) -> ResourceDecision {
        let tuning = match dim {
            ResourceDimension::Cpu => &self.config.cpu,
            ResourceDimension::Memory => &self.config.mem,
        };
        let fmt: fn(u64) -> String = match dim {
            ResourceDimension::Cpu => format_cpu_milli,
            ResourceDimension::Memory => format_mem_bytes,
        };
        let round: fn(f64) -> u64 = match dim {
            ResourceDimension::Cpu => round_cpu_milli,
            ResourceDimension::Memory => round_mem_bytes,
        };

        let current = match current_request {
            Some(c) if c > 0 => c,
            _ => {
                return ResourceDecision {
                    target_request: None,
                    confidence: 0.0,
                    note: "no current request".into(),
                }
            }
        };

        let data_confidence = (count as f64 / self.config.target_sample_count as f64).min(1.0);
        let variance_confidence = if stats.mean <= 0.0 {
            0.0
        } else {
            1.0 / (1.0 + stats.stddev / stats.mean)
        };
        let confidence = 0.6 * data_confidence + 0.4 * variance_confidence;
        if confidence < self.config.confidence_threshold {
            return ResourceDecision {
                target_request: None,
                confidence,
                note: format!("low confidence ({:.2})", confidence),
            };
        }

        let utilization = stats.max / current as f64;
        let throttled = throttle_avg > self.config.throttle_upscale_percent;
        let describe = |verdict: &str| {
            format!(
                "current={} p95={} max={} util={:.2} -> {}",
                fmt(current),
                fmt(round(stats.p95)),
                fmt(round(stats.max)),
                utilization,
                verdict
            )
        };

        if utilization < tuning.min_util {
            // The stability floor keeps post-resize utilization at or below
            // max_util so the next evaluation lands inside the band.
            let target = (stats.p95 * tuning.down_buffer)
                .max(stats.max * 0.5)
                .max(stats.max / tuning.max_util);
            let target = round(target);
            if target >= current {
                return ResourceDecision {
                    target_request: None,
                    confidence,
                    note: describe("hold"),
                };
            }
            return ResourceDecision {
                target_request: Some(target),
                confidence,
                note: describe(&format!("down to {}", fmt(target))),
            };
        }

        if utilization > tuning.max_util || throttled {
            let mut target = stats.p95 * tuning.up_buffer;
            if throttled {
                // observed usage is capped by the limit while throttled, so
                // the percentile target is lifted relative to the current
                // allocation instead
                target = target.max(current as f64 * tuning.up_buffer);
            }
            let target = round(target.min(current as f64 * 1.5));
            if target <= current {
                return ResourceDecision {
                    target_request: None,
                    confidence,
                    note: describe("hold"),
                };
            }
            let verdict = if throttled && utilization <= tuning.max_util {
                format!("up to {} (throttled {:.0}%)", fmt(target), throttle_avg)
            } else {
                format!("up to {}", fmt(target))
            };
            return ResourceDecision {
                target_request: Some(target),
                confidence,
                note: describe(&verdict),
            };
        }

        ResourceDecision {
            target_request: None,
            confidence,
            note: describe("within target band"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WorkloadKind;
    use crate::resources::BYTES_PER_MIB;

    fn id() -> WorkloadId {
        WorkloadId {
            namespace: "default".into(),
            kind: WorkloadKind::Deployment,
            name: "web".into(),
            container: "app".into(),
        }
    }

    fn stats(cpu: ResourceStats, mem: ResourceStats, count: usize) -> HistoryStats {
        HistoryStats { count, cpu, mem, throttle_avg: 0.0 }
    }

    fn flat(mean: f64, max: f64, p95: f64) -> ResourceStats {
        ResourceStats {
            min: mean * 0.9,
            max,
            mean,
            stddev: mean * 0.02,
            p50: mean,
            p95,
            p99: max,
        }
    }

    fn engine() -> RecommendationEngine {
        RecommendationEngine::new(EngineConfig::default())
    }

    #[test]
    fn downscales_underused_cpu() {
        let current = ResourceSpec {
            cpu_request: Some(500),
            cpu_limit: Some(1000),
            mem_request: Some(256 * BYTES_PER_MIB),
            mem_limit: Some(512 * BYTES_PER_MIB),
        };
        let mib = BYTES_PER_MIB as f64;
        let s = stats(
            flat(85.0, 90.0, 80.0),
            flat(128.0 * mib, 130.0 * mib, 129.0 * mib),
            100,
        );
        let p = engine().recommend(id(), "web-1", "uid-1", current, Some(&s));
        assert_eq!(p.direction, ScaleDirection::Down);
        // max(p95*1.1, max*0.5, max/max_util) = max(88, 45, 112.5) = 112.5
        assert_eq!(p.proposed.cpu_request, Some(113));
        assert_eq!(p.proposed.cpu_limit, Some(170));
        assert!(p.confidence >= 0.7);
        assert!(p.reason.contains("down to 113m"));
    }

    #[test]
    fn upscales_overused_memory() {
        let mib = BYTES_PER_MIB as f64;
        let current = ResourceSpec {
            cpu_request: Some(500),
            cpu_limit: Some(1000),
            mem_request: Some(256 * BYTES_PER_MIB),
            mem_limit: Some(512 * BYTES_PER_MIB),
        };
        // utilization 260/256 > 0.85, p95 = 240Mi
        let s = stats(
            flat(250.0, 300.0, 280.0),
            flat(235.0 * mib, 260.0 * mib, 240.0 * mib),
            100,
        );
        let p = engine().recommend(id(), "web-1", "uid-1", current, Some(&s));
        assert_eq!(p.direction, ScaleDirection::Up);
        // min(240Mi * 1.2, 256Mi * 1.5) = 288Mi, limit 288Mi * 1.25 = 360Mi
        assert_eq!(p.proposed.mem_request, Some(288 * BYTES_PER_MIB));
        assert_eq!(p.proposed.mem_limit, Some(360 * BYTES_PER_MIB));
    }

    #[test]
    fn insufficient_history_blocks_decision() {
        let current = ResourceSpec { cpu_request: Some(500), ..Default::default() };
        let s = stats(flat(85.0, 90.0, 80.0), flat(1.0, 1.0, 1.0), 5);
        let p = engine().recommend(id(), "web-1", "uid-1", current, Some(&s));
        assert_eq!(p.direction, ScaleDirection::None);
        assert_eq!(p.reason, "insufficient history");

        let p = engine().recommend(id(), "web-1", "uid-1", current, None);
        assert_eq!(p.reason, "insufficient history");
    }

    #[test]
    fn low_confidence_blocks_decision() {
        let current = ResourceSpec {
            cpu_request: Some(500),
            cpu_limit: Some(1000),
            ..Default::default()
        };
        // half the target sample count caps data confidence at 0.5
        let s = stats(flat(85.0, 90.0, 80.0), flat(0.0, 0.0, 0.0), 50);
        let p = engine().recommend(id(), "web-1", "uid-1", current, Some(&s));
        assert_eq!(p.direction, ScaleDirection::None);
        assert!(p.reason.contains("low confidence"));
    }

    #[test]
    fn recommendation_is_idempotent_after_apply() {
        let mib = BYTES_PER_MIB as f64;
        let current = ResourceSpec::new(500, 1000, 256 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        let s = stats(
            flat(85.0, 90.0, 80.0),
            flat(235.0 * mib, 260.0 * mib, 240.0 * mib),
            100,
        );
        let eng = engine();
        let first = eng.recommend(id(), "web-1", "uid-1", current, Some(&s));
        assert!(first.is_actionable());

        let second = eng.recommend(id(), "web-1", "uid-1", first.proposed, Some(&s));
        assert_eq!(second.direction, ScaleDirection::None);
        assert!(!second.is_actionable());
    }

    #[test]
    fn guaranteed_shape_is_preserved() {
        let current = ResourceSpec::new(500, 500, 512 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        let mib = BYTES_PER_MIB as f64;
        let s = stats(
            flat(85.0, 90.0, 80.0),
            flat(300.0 * mib, 400.0 * mib, 380.0 * mib),
            100,
        );
        let p = engine().recommend(id(), "web-1", "uid-1", current, Some(&s));
        assert_eq!(p.direction, ScaleDirection::Down);
        // request == limit on the way in stays equal on the way out
        assert_eq!(p.proposed.cpu_request, p.proposed.cpu_limit);
    }

    #[test]
    fn throttling_forces_cpu_upscale() {
        let current = ResourceSpec {
            cpu_request: Some(500),
            cpu_limit: Some(1000),
            ..Default::default()
        };
        let mut s = stats(flat(280.0, 300.0, 280.0), flat(0.0, 0.0, 0.0), 100);
        s.throttle_avg = 40.0;
        // utilization 0.6 is inside the band, throttling still scales up
        let p = engine().recommend(id(), "web-1", "uid-1", current, Some(&s));
        assert_eq!(p.direction, ScaleDirection::Up);
        // lifted relative to the current allocation: 500m * 1.2
        assert_eq!(p.proposed.cpu_request, Some(600));
        assert!(p.reason.contains("throttled"));
    }

    #[test]
    fn cpu_never_proposed_below_one_milli() {
        let current = ResourceSpec {
            cpu_request: Some(100),
            cpu_limit: Some(200),
            ..Default::default()
        };
        let s = stats(flat(0.4, 0.5, 0.4), flat(0.0, 0.0, 0.0), 100);
        let p = engine().recommend(id(), "web-1", "uid-1", current, Some(&s));
        if let Some(r) = p.proposed.cpu_request {
            assert!(r >= 1);
        }
    }
}
