//! Policy engine: matches workloads to rules and post-processes proposals.
//!
//! Rules are evaluated in descending priority order (name as tie-break).
//! For each matching rule the actions compose as: skip, fixed overrides,
//! multipliers, then min/max clamps. Any rule that cannot be compiled
//! (bad regex, bad schedule, bad timezone) is disabled with one warning
//! per reload.

use crate::cluster::{PodSnapshot, WorkloadKind};
use crate::error::Result;
use crate::recommend::{derive_limit, direction_of, EngineConfig, Proposal};
use crate::resources::{
    parse_cpu_milli, parse_mem_bytes, round_cpu_milli, round_mem_bytes, QosClass,
    ResourceDimension,
};
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Inclusive wall-clock range, not wrapping midnight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start of the range, `HH:MM`
    pub start: String,
    /// End of the range, `HH:MM`
    pub end: String,
}

/// When a rule is active
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Active weekdays, e.g. `mon` or `monday`; empty means every day
    #[serde(default)]
    pub weekdays: Vec<String>,
    /// Active time ranges; empty means all day
    #[serde(default)]
    pub time_ranges: Vec<TimeRange>,
    /// `UTC` (default) or a fixed offset such as `+02:00`
    #[serde(default)]
    pub timezone: Option<String>,
}

/// What a rule matches on. Empty selectors match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selectors {
    /// Exact namespace set membership
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// All listed label pairs must be present on the pod
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// All listed annotation pairs must be present on the pod
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Full-match regex on the pod name
    #[serde(default)]
    pub pod_name_regex: Option<String>,
    /// Exact container name; empty means any
    #[serde(default)]
    pub container_name: Option<String>,
    /// Pod QoS class
    #[serde(default)]
    pub qos_class: Option<QosClass>,
    /// Parent workload kinds
    #[serde(default)]
    pub workload_kinds: Vec<WorkloadKind>,
}

/// What a matching rule does to a proposal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleActions {
    /// Terminate evaluation and skip the container
    #[serde(default)]
    pub skip: bool,
    /// Multiplier applied to the proposed CPU request
    #[serde(default)]
    pub cpu_multiplier: Option<f64>,
    /// Multiplier applied to the proposed memory request
    #[serde(default)]
    pub mem_multiplier: Option<f64>,
    /// Fixed CPU request override, quantity string
    #[serde(default)]
    pub set_cpu_request: Option<String>,
    /// Fixed CPU limit override, quantity string
    #[serde(default)]
    pub set_cpu_limit: Option<String>,
    /// Fixed memory request override, quantity string
    #[serde(default)]
    pub set_mem_request: Option<String>,
    /// Fixed memory limit override, quantity string
    #[serde(default)]
    pub set_mem_limit: Option<String>,
    /// Lower clamp on the proposed CPU request
    #[serde(default)]
    pub min_cpu: Option<String>,
    /// Upper clamp on the proposed CPU request
    #[serde(default)]
    pub max_cpu: Option<String>,
    /// Lower clamp on the proposed memory request
    #[serde(default)]
    pub min_mem: Option<String>,
    /// Upper clamp on the proposed memory request
    #[serde(default)]
    pub max_mem: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// One policy rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Rule name, unique, used as priority tie-break
    pub name: String,
    /// Higher priority wins
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules never match
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Matching conditions
    #[serde(default)]
    pub selectors: Selectors,
    /// Active window, always active when absent
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Actions applied to the proposal
    #[serde(default)]
    pub actions: RuleActions,
}

/// Result of running the policy engine over one proposal
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    /// The post-processed proposal
    pub proposal: Proposal,
    /// Set when a skip action terminated evaluation
    pub skip: Option<String>,
}

struct CompiledSchedule {
    weekdays: Vec<Weekday>,
    ranges: Vec<(NaiveTime, NaiveTime)>,
    tz: FixedOffset,
}

struct CompiledRule {
    rule: Rule,
    regex: Option<Regex>,
    schedule: Option<CompiledSchedule>,
    set_cpu_request: Option<u64>,
    set_cpu_limit: Option<u64>,
    set_mem_request: Option<u64>,
    set_mem_limit: Option<u64>,
    min_cpu: Option<u64>,
    max_cpu: Option<u64>,
    min_mem: Option<u64>,
    max_mem: Option<u64>,
    disabled: bool,
}

/// The policy engine, compiled from an ordered rule set
pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
    engine_config: EngineConfig,
}

impl PolicyEngine {
    /// Rules loaded when no rules are configured: skip system namespaces.
    pub fn default_rules() -> Vec<Rule> {
        vec![Rule {
            name: "skip-system-namespaces".into(),
            priority: 200,
            enabled: true,
            selectors: Selectors {
                namespaces: vec![
                    "kube-system".into(),
                    "kube-public".into(),
                    "kube-node-lease".into(),
                ],
                ..Default::default()
            },
            schedule: None,
            actions: RuleActions { skip: true, ..Default::default() },
        }]
    }

    /// Compile a rule set.
    ///
    /// Unparseable quantities in actions are fatal; bad regexes and bad
    /// schedules disable the offending rule with a warning.
    pub fn compile(rules: Vec<Rule>, engine_config: EngineConfig) -> Result<Self> {
        let rules = if rules.is_empty() { Self::default_rules() } else { rules };
        let mut compiled: Vec<CompiledRule> = Vec::with_capacity(rules.len());
        for rule in rules {
            compiled.push(Self::compile_rule(rule)?);
        }
        compiled.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then_with(|| a.rule.name.cmp(&b.rule.name))
        });
        Ok(Self { rules: compiled, engine_config })
    }

    fn compile_rule(rule: Rule) -> Result<CompiledRule> {
        let mut disabled = !rule.enabled;

        let regex = match &rule.selectors.pod_name_regex {
            Some(pattern) => match Regex::new(&format!("^(?:{})$", pattern)) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(rule = %rule.name, %err, "invalid pod name regex, rule disabled");
                    disabled = true;
                    None
                }
            },
            None => None,
        };

        let schedule = match &rule.schedule {
            Some(schedule) => match compile_schedule(schedule) {
                Ok(compiled) => Some(compiled),
                Err(err) => {
                    warn!(rule = %rule.name, %err, "invalid schedule, rule disabled");
                    disabled = true;
                    None
                }
            },
            None => None,
        };

        let a = &rule.actions;
        let parse_cpu = |v: &Option<String>| -> Result<Option<u64>> {
            v.as_deref().map(parse_cpu_milli).transpose()
        };
        let parse_mem = |v: &Option<String>| -> Result<Option<u64>> {
            v.as_deref().map(parse_mem_bytes).transpose()
        };

        Ok(CompiledRule {
            set_cpu_request: parse_cpu(&a.set_cpu_request)?,
            set_cpu_limit: parse_cpu(&a.set_cpu_limit)?,
            set_mem_request: parse_mem(&a.set_mem_request)?,
            set_mem_limit: parse_mem(&a.set_mem_limit)?,
            min_cpu: parse_cpu(&a.min_cpu)?,
            max_cpu: parse_cpu(&a.max_cpu)?,
            min_mem: parse_mem(&a.min_mem)?,
            max_mem: parse_mem(&a.max_mem)?,
            regex,
            schedule,
            disabled,
            rule,
        })
    }

    /// Number of enabled rules
    pub fn active_rule_count(&self) -> usize {
        self.rules.iter().filter(|r| !r.disabled).count()
    }

    /// Run the rule set over a proposal.
    pub fn evaluate(
        &self,
        pod: &PodSnapshot,
        container_name: &str,
        proposal: Proposal,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        let mut proposal = proposal;
        for compiled in &self.rules {
            if compiled.disabled || !self.matches(compiled, pod, container_name, now) {
                continue;
            }
            if compiled.rule.actions.skip {
                proposal.rules_applied.push(compiled.rule.name.clone());
                debug!(rule = %compiled.rule.name, pod = %pod.key(), "policy skip");
                return PolicyDecision {
                    skip: Some(compiled.rule.name.clone()),
                    proposal,
                };
            }
            self.apply_actions(compiled, &mut proposal);
            proposal.rules_applied.push(compiled.rule.name.clone());
        }
        // a rule may have flipped or cancelled the engine's direction
        proposal.direction = direction_of(&proposal.current, &proposal.proposed);
        PolicyDecision { proposal, skip: None }
    }

    fn matches(
        &self,
        compiled: &CompiledRule,
        pod: &PodSnapshot,
        container_name: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let s = &compiled.rule.selectors;
        if !s.namespaces.is_empty() && !s.namespaces.contains(&pod.namespace) {
            return false;
        }
        if !s.labels.iter().all(|(k, v)| pod.labels.get(k) == Some(v)) {
            return false;
        }
        if !s.annotations.iter().all(|(k, v)| pod.annotations.get(k) == Some(v)) {
            return false;
        }
        if let Some(re) = &compiled.regex {
            if !re.is_match(&pod.name) {
                return false;
            }
        }
        if let Some(container) = s.container_name.as_deref() {
            if !container.is_empty() && container != container_name {
                return false;
            }
        }
        if let Some(qos) = s.qos_class {
            if pod.qos_class() != qos {
                return false;
            }
        }
        if !s.workload_kinds.is_empty() {
            let kind = pod
                .owner
                .as_ref()
                .map(|o| o.kind)
                .unwrap_or(WorkloadKind::Pod);
            if !s.workload_kinds.contains(&kind) {
                return false;
            }
        }
        if let Some(schedule) = &compiled.schedule {
            if !schedule_matches(schedule, now) {
                return false;
            }
        }
        true
    }

    fn apply_actions(&self, compiled: &CompiledRule, proposal: &mut Proposal) {
        let spec = &mut proposal.proposed;

        // fixed overrides
        if let Some(v) = compiled.set_cpu_request {
            spec.cpu_request = Some(v);
        }
        if let Some(v) = compiled.set_cpu_limit {
            spec.cpu_limit = Some(v);
        }
        if let Some(v) = compiled.set_mem_request {
            spec.mem_request = Some(v);
        }
        if let Some(v) = compiled.set_mem_limit {
            spec.mem_limit = Some(v);
        }

        // multipliers on the request, limit re-derived
        if let Some(mult) = compiled.rule.actions.cpu_multiplier {
            if let Some(request) = spec.cpu_request {
                let scaled = round_cpu_milli(request as f64 * mult);
                let limit = derive_limit(
                    ResourceDimension::Cpu,
                    scaled,
                    &proposal.current,
                    &self.engine_config.cpu,
                );
                spec.cpu_request = Some(scaled);
                spec.cpu_limit = Some(limit);
            }
        }
        if let Some(mult) = compiled.rule.actions.mem_multiplier {
            if let Some(request) = spec.mem_request {
                let scaled = round_mem_bytes(request as f64 * mult);
                let limit = derive_limit(
                    ResourceDimension::Memory,
                    scaled,
                    &proposal.current,
                    &self.engine_config.mem,
                );
                spec.mem_request = Some(scaled);
                spec.mem_limit = Some(limit);
            }
        }

        // clamps on the request, limit lifted to stay consistent
        if let Some(request) = spec.cpu_request {
            let mut clamped = request;
            if let Some(min) = compiled.min_cpu {
                clamped = clamped.max(min);
            }
            if let Some(max) = compiled.max_cpu {
                clamped = clamped.min(max);
            }
            spec.cpu_request = Some(clamped);
            if let Some(limit) = spec.cpu_limit {
                spec.cpu_limit = Some(limit.max(clamped));
            }
        }
        if let Some(request) = spec.mem_request {
            let mut clamped = request;
            if let Some(min) = compiled.min_mem {
                clamped = clamped.max(min);
            }
            if let Some(max) = compiled.max_mem {
                clamped = clamped.min(max);
            }
            spec.mem_request = Some(clamped);
            if let Some(limit) = spec.mem_limit {
                spec.mem_limit = Some(limit.max(clamped));
            }
        }
    }
}

fn compile_schedule(schedule: &Schedule) -> std::result::Result<CompiledSchedule, String> {
    let mut weekdays = Vec::with_capacity(schedule.weekdays.len());
    for name in &schedule.weekdays {
        weekdays.push(parse_weekday(name)?);
    }
    let mut ranges = Vec::with_capacity(schedule.time_ranges.len());
    for range in &schedule.time_ranges {
        let start = NaiveTime::parse_from_str(&range.start, "%H:%M")
            .map_err(|_| format!("invalid time {:?}", range.start))?;
        let end = NaiveTime::parse_from_str(&range.end, "%H:%M")
            .map_err(|_| format!("invalid time {:?}", range.end))?;
        if end < start {
            return Err(format!("range {}-{} wraps midnight", range.start, range.end));
        }
        ranges.push((start, end));
    }
    let tz = parse_timezone(schedule.timezone.as_deref())?;
    Ok(CompiledSchedule { weekdays, ranges, tz })
}

fn parse_weekday(name: &str) -> std::result::Result<Weekday, String> {
    match name.to_ascii_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        other => Err(format!("unknown weekday {:?}", other)),
    }
}

fn parse_timezone(tz: Option<&str>) -> std::result::Result<FixedOffset, String> {
    let utc = FixedOffset::east_opt(0).ok_or("offset out of range")?;
    let tz = match tz {
        None | Some("") | Some("UTC") | Some("utc") => return Ok(utc),
        Some(tz) => tz,
    };
    let (sign, rest) = if let Some(rest) = tz.strip_prefix('+') {
        (1i32, rest)
    } else if let Some(rest) = tz.strip_prefix('-') {
        (-1i32, rest)
    } else {
        return Err(format!("unknown timezone {:?}", tz));
    };
    let mut parts = rest.split(':');
    let hours: i32 = parts
        .next()
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| format!("unknown timezone {:?}", tz))?;
    let minutes: i32 = match parts.next() {
        Some(m) => m.parse().map_err(|_| format!("unknown timezone {:?}", tz))?,
        None => 0,
    };
    if hours > 23 || minutes > 59 {
        return Err(format!("unknown timezone {:?}", tz));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("unknown timezone {:?}", tz))
}

fn schedule_matches(schedule: &CompiledSchedule, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&schedule.tz);
    if !schedule.weekdays.is_empty() && !schedule.weekdays.contains(&local.weekday()) {
        return false;
    }
    if !schedule.ranges.is_empty() {
        // truncate to the minute so an end bound of 17:00 covers the
        // whole final minute
        let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0)
            .unwrap_or_else(|| local.time());
        if !schedule.ranges.iter().any(|(start, end)| *start <= time && time <= *end) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ContainerInfo, OwnerRef, PodPhase, WorkloadId};
    use crate::resources::{ResourceSpec, ScaleDirection, BYTES_PER_MIB};
    use chrono::TimeZone;

    fn pod(namespace: &str, name: &str) -> PodSnapshot {
        PodSnapshot {
            namespace: namespace.into(),
            name: name.into(),
            uid: "uid-1".into(),
            node_name: Some("node-1".into()),
            phase: PodPhase::Running,
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            annotations: HashMap::new(),
            owner: Some(OwnerRef { kind: WorkloadKind::Deployment, name: "web".into() }),
            containers: vec![ContainerInfo {
                name: "app".into(),
                resources: ResourceSpec::new(500, 1000, 256 * BYTES_PER_MIB, 512 * BYTES_PER_MIB),
                restart_count: 0,
            }],
            started_at: Some(Utc::now()),
            resize_status: None,
        }
    }

    fn proposal(pod: &PodSnapshot) -> Proposal {
        let current = pod.containers[0].resources;
        let mut proposed = current;
        proposed.cpu_request = Some(200);
        proposed.cpu_limit = Some(300);
        Proposal {
            workload: WorkloadId {
                namespace: pod.namespace.clone(),
                kind: WorkloadKind::Deployment,
                name: "web".into(),
                container: "app".into(),
            },
            pod_name: pod.name.clone(),
            pod_uid: pod.uid.clone(),
            current,
            proposed,
            direction: ScaleDirection::Down,
            confidence: 0.9,
            reason: "test".into(),
            rules_applied: Vec::new(),
        }
    }

    fn engine(rules: Vec<Rule>) -> PolicyEngine {
        PolicyEngine::compile(rules, EngineConfig::default()).unwrap()
    }

    #[test]
    fn default_rules_skip_system_namespaces() {
        let engine = engine(Vec::new());
        let system_pod = pod("kube-system", "coredns-abc");
        let decision = engine.evaluate(&system_pod, "app", proposal(&system_pod), Utc::now());
        assert_eq!(decision.skip.as_deref(), Some("skip-system-namespaces"));

        let default_pod = pod("default", "web-1");
        let decision = engine.evaluate(&default_pod, "app", proposal(&default_pod), Utc::now());
        assert!(decision.skip.is_none());
    }

    #[test]
    fn higher_priority_rule_wins_skip() {
        let rules = vec![
            Rule {
                name: "boost".into(),
                priority: 10,
                enabled: true,
                selectors: Selectors::default(),
                schedule: None,
                actions: RuleActions { cpu_multiplier: Some(2.0), ..Default::default() },
            },
            Rule {
                name: "freeze".into(),
                priority: 100,
                enabled: true,
                selectors: Selectors::default(),
                schedule: None,
                actions: RuleActions { skip: true, ..Default::default() },
            },
        ];
        let engine = engine(rules);
        let pod = pod("default", "web-1");
        let decision = engine.evaluate(&pod, "app", proposal(&pod), Utc::now());
        assert_eq!(decision.skip.as_deref(), Some("freeze"));
        assert_eq!(decision.proposal.rules_applied, vec!["freeze".to_string()]);
    }

    #[test]
    fn actions_compose_in_order() {
        let rules = vec![Rule {
            name: "shape".into(),
            priority: 10,
            enabled: true,
            selectors: Selectors::default(),
            schedule: None,
            actions: RuleActions {
                set_cpu_request: Some("400m".into()),
                cpu_multiplier: Some(2.0),
                max_cpu: Some("600m".into()),
                ..Default::default()
            },
        }];
        let engine = engine(rules);
        let pod = pod("default", "web-1");
        let decision = engine.evaluate(&pod, "app", proposal(&pod), Utc::now());
        // set 400m, doubled to 800m, clamped to 600m
        assert_eq!(decision.proposal.proposed.cpu_request, Some(600));
        let limit = decision.proposal.proposed.cpu_limit.unwrap();
        assert!(limit >= 600);
        assert_eq!(decision.proposal.direction, ScaleDirection::Up);
    }

    #[test]
    fn invalid_regex_disables_rule() {
        let rules = vec![Rule {
            name: "broken".into(),
            priority: 10,
            enabled: true,
            selectors: Selectors {
                pod_name_regex: Some("([unclosed".into()),
                ..Default::default()
            },
            schedule: None,
            actions: RuleActions { skip: true, ..Default::default() },
        }];
        let engine = engine(rules);
        assert_eq!(engine.active_rule_count(), 0);
        let pod = pod("default", "web-1");
        let decision = engine.evaluate(&pod, "app", proposal(&pod), Utc::now());
        assert!(decision.skip.is_none());
    }

    #[test]
    fn regex_is_full_match() {
        let rules = vec![Rule {
            name: "exact".into(),
            priority: 10,
            enabled: true,
            selectors: Selectors {
                pod_name_regex: Some("web-\\d+".into()),
                ..Default::default()
            },
            schedule: None,
            actions: RuleActions { skip: true, ..Default::default() },
        }];
        let engine = engine(rules);
        let matching = pod("default", "web-1");
        assert!(engine.evaluate(&matching, "app", proposal(&matching), Utc::now()).skip.is_some());
        // prefix alone must not match
        let other = pod("default", "web-1-canary");
        assert!(engine.evaluate(&other, "app", proposal(&other), Utc::now()).skip.is_none());
    }

    #[test]
    fn selector_combination_must_all_match() {
        let rules = vec![Rule {
            name: "narrow".into(),
            priority: 10,
            enabled: true,
            selectors: Selectors {
                namespaces: vec!["default".into()],
                labels: HashMap::from([("app".to_string(), "web".to_string())]),
                workload_kinds: vec![WorkloadKind::Deployment],
                qos_class: Some(QosClass::Burstable),
                ..Default::default()
            },
            schedule: None,
            actions: RuleActions { skip: true, ..Default::default() },
        }];
        let engine = engine(rules);
        let matching = pod("default", "web-1");
        assert!(engine.evaluate(&matching, "app", proposal(&matching), Utc::now()).skip.is_some());

        let mut wrong_label = pod("default", "web-2");
        wrong_label.labels.insert("app".into(), "api".into());
        assert!(engine
            .evaluate(&wrong_label, "app", proposal(&wrong_label), Utc::now())
            .skip
            .is_none());
    }

    #[test]
    fn schedule_matches_in_timezone() {
        let rules = vec![Rule {
            name: "office-hours".into(),
            priority: 10,
            enabled: true,
            selectors: Selectors::default(),
            schedule: Some(Schedule {
                weekdays: vec!["mon".into()],
                time_ranges: vec![TimeRange { start: "09:00".into(), end: "17:00".into() }],
                timezone: Some("+02:00".into()),
            }),
            actions: RuleActions { skip: true, ..Default::default() },
        }];
        let engine = engine(rules);
        let pod = pod("default", "web-1");

        // Monday 2025-06-02 08:30 UTC is 10:30 at +02:00
        let inside = Utc.with_ymd_and_hms(2025, 6, 2, 8, 30, 0).unwrap();
        assert!(engine.evaluate(&pod, "app", proposal(&pod), inside).skip.is_some());

        // Monday 22:00 UTC is Tuesday 00:00 at +02:00
        let outside = Utc.with_ymd_and_hms(2025, 6, 2, 22, 0, 0).unwrap();
        assert!(engine.evaluate(&pod, "app", proposal(&pod), outside).skip.is_none());
    }

    #[test]
    fn unparseable_action_quantity_is_fatal() {
        let rules = vec![Rule {
            name: "bad".into(),
            priority: 10,
            enabled: true,
            selectors: Selectors::default(),
            schedule: None,
            actions: RuleActions { min_cpu: Some("lots".into()), ..Default::default() },
        }];
        assert!(PolicyEngine::compile(rules, EngineConfig::default()).is_err());
    }
}
