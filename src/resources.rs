//! Resource quantities, container resource specs and QoS derivation.
//!
//! CPU is carried as whole millicores, memory as bytes. Arithmetic rounds
//! deterministically: CPU to the nearest millicore with a floor of 1m,
//! memory up to a whole mebibyte.

use crate::error::{Result, RightsizerError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Millicores per CPU core
pub const MILLIS_PER_CORE: u64 = 1000;
/// Bytes per mebibyte
pub const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Parse a CPU quantity string into millicores.
///
/// Accepts `"250m"`, whole cores (`"2"`) and fractional cores (`"0.5"`).
pub fn parse_cpu_milli(value: &str) -> Result<u64> {
    let s = value.trim();
    if s.is_empty() {
        return Err(RightsizerError::quantity(value, "empty CPU quantity"));
    }
    if let Some(num) = s.strip_suffix('m') {
        let milli: f64 = num
            .parse()
            .map_err(|_| RightsizerError::quantity(value, "not a number"))?;
        if milli < 0.0 {
            return Err(RightsizerError::quantity(value, "negative CPU quantity"));
        }
        return Ok(milli.round() as u64);
    }
    let cores: f64 = s
        .parse()
        .map_err(|_| RightsizerError::quantity(value, "not a number"))?;
    if cores < 0.0 {
        return Err(RightsizerError::quantity(value, "negative CPU quantity"));
    }
    Ok((cores * MILLIS_PER_CORE as f64).round() as u64)
}

/// Parse a memory quantity string into bytes.
///
/// Accepts binary suffixes (`Ki`, `Mi`, `Gi`, `Ti`), decimal suffixes
/// (`K`, `M`, `G`, `T`) and plain byte counts.
pub fn parse_mem_bytes(value: &str) -> Result<u64> {
    let s = value.trim();
    if s.is_empty() {
        return Err(RightsizerError::quantity(value, "empty memory quantity"));
    }
    let (num_part, multiplier): (&str, u64) = if let Some(n) = s.strip_suffix("Ki") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix("Mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("Gi") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("Ti") {
        (n, 1024u64.pow(4))
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1000)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1_000_000_000)
    } else if let Some(n) = s.strip_suffix('T') {
        (n, 1_000_000_000_000)
    } else {
        (s, 1)
    };
    let amount: f64 = num_part
        .parse()
        .map_err(|_| RightsizerError::quantity(value, "not a number"))?;
    if amount < 0.0 {
        return Err(RightsizerError::quantity(value, "negative memory quantity"));
    }
    Ok((amount * multiplier as f64).round() as u64)
}

/// Round a computed CPU value to a whole millicore, never below 1m.
pub fn round_cpu_milli(value: f64) -> u64 {
    let rounded = value.round();
    if rounded < 1.0 {
        1
    } else {
        rounded as u64
    }
}

/// Round a computed memory value up to a whole mebibyte, never below 1Mi.
pub fn round_mem_bytes(value: f64) -> u64 {
    let mib = (value / BYTES_PER_MIB as f64).ceil();
    if mib < 1.0 {
        BYTES_PER_MIB
    } else {
        mib as u64 * BYTES_PER_MIB
    }
}

/// Canonical CPU display form, always in millicores.
pub fn format_cpu_milli(milli: u64) -> String {
    format!("{}m", milli)
}

/// Canonical memory display form, in mebibytes when whole, bytes otherwise.
pub fn format_mem_bytes(bytes: u64) -> String {
    if bytes > 0 && bytes % BYTES_PER_MIB == 0 {
        format!("{}Mi", bytes / BYTES_PER_MIB)
    } else {
        format!("{}", bytes)
    }
}

/// The resource dimension a check or proposal refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceDimension {
    /// CPU in millicores
    Cpu,
    /// Memory in bytes
    Memory,
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Requests and limits for one container. Any field may be absent.
///
/// CPU fields are millicores, memory fields are bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU request in millicores
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cpu_request: Option<u64>,
    /// CPU limit in millicores
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cpu_limit: Option<u64>,
    /// Memory request in bytes
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mem_request: Option<u64>,
    /// Memory limit in bytes
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mem_limit: Option<u64>,
}

impl ResourceSpec {
    /// A spec with all four fields populated
    pub fn new(cpu_request: u64, cpu_limit: u64, mem_request: u64, mem_limit: u64) -> Self {
        Self {
            cpu_request: Some(cpu_request),
            cpu_limit: Some(cpu_limit),
            mem_request: Some(mem_request),
            mem_limit: Some(mem_limit),
        }
    }

    /// Whether any request or limit is declared
    pub fn declares_any(&self) -> bool {
        self.cpu_request.is_some()
            || self.cpu_limit.is_some()
            || self.mem_request.is_some()
            || self.mem_limit.is_some()
    }

    /// `(request, limit)` pair for a dimension
    pub fn pair(&self, dim: ResourceDimension) -> (Option<u64>, Option<u64>) {
        match dim {
            ResourceDimension::Cpu => (self.cpu_request, self.cpu_limit),
            ResourceDimension::Memory => (self.mem_request, self.mem_limit),
        }
    }

    /// Set the `(request, limit)` pair for a dimension
    pub fn set_pair(&mut self, dim: ResourceDimension, request: Option<u64>, limit: Option<u64>) {
        match dim {
            ResourceDimension::Cpu => {
                self.cpu_request = request;
                self.cpu_limit = limit;
            }
            ResourceDimension::Memory => {
                self.mem_request = request;
                self.mem_limit = limit;
            }
        }
    }

    /// `request <= limit` holds for every dimension where both are present
    pub fn request_within_limit(&self) -> bool {
        let cpu_ok = match (self.cpu_request, self.cpu_limit) {
            (Some(r), Some(l)) => r <= l,
            _ => true,
        };
        let mem_ok = match (self.mem_request, self.mem_limit) {
            (Some(r), Some(l)) => r <= l,
            _ => true,
        };
        cpu_ok && mem_ok
    }

    /// Human-readable one-line summary used in logs and rationale strings
    pub fn describe(&self) -> String {
        fn opt(v: Option<u64>, f: fn(u64) -> String) -> String {
            v.map(f).unwrap_or_else(|| "-".to_string())
        }
        format!(
            "cpu={}/{} mem={}/{}",
            opt(self.cpu_request, format_cpu_milli),
            opt(self.cpu_limit, format_cpu_milli),
            opt(self.mem_request, format_mem_bytes),
            opt(self.mem_limit, format_mem_bytes),
        )
    }
}

/// Quality-of-service class derived from a pod's aggregate resource spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    /// Every container has request == limit > 0 for every resource it declares
    Guaranteed,
    /// Anything between Guaranteed and BestEffort
    Burstable,
    /// No container declares any request or limit
    BestEffort,
}

impl QosClass {
    /// Ordering rank, higher is a stronger guarantee
    pub fn rank(&self) -> u8 {
        match self {
            Self::BestEffort => 0,
            Self::Burstable => 1,
            Self::Guaranteed => 2,
        }
    }
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guaranteed => write!(f, "Guaranteed"),
            Self::Burstable => write!(f, "Burstable"),
            Self::BestEffort => write!(f, "BestEffort"),
        }
    }
}

/// Compute the pod QoS class from all of its containers.
pub fn pod_qos_class(containers: &[ResourceSpec]) -> QosClass {
    if containers.iter().all(|c| !c.declares_any()) {
        return QosClass::BestEffort;
    }
    let guaranteed = containers.iter().all(|c| {
        [ResourceDimension::Cpu, ResourceDimension::Memory]
            .iter()
            .all(|dim| match c.pair(*dim) {
                (None, None) => true,
                (Some(r), Some(l)) => r == l && r > 0,
                _ => false,
            })
    });
    if guaranteed {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}

/// Which way a proposal moves the allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    /// At least one request increases
    Up,
    /// At least one request decreases, none increases
    Down,
    /// No change proposed
    None,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::None => write!(f, "none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cpu_forms() {
        assert_eq!(parse_cpu_milli("250m").unwrap(), 250);
        assert_eq!(parse_cpu_milli("2").unwrap(), 2000);
        assert_eq!(parse_cpu_milli("0.5").unwrap(), 500);
        assert_eq!(parse_cpu_milli(" 100m ").unwrap(), 100);
        assert!(parse_cpu_milli("abc").is_err());
        assert!(parse_cpu_milli("-1").is_err());
        assert!(parse_cpu_milli("").is_err());
    }

    #[test]
    fn parse_mem_forms() {
        assert_eq!(parse_mem_bytes("512Mi").unwrap(), 512 * BYTES_PER_MIB);
        assert_eq!(parse_mem_bytes("1Gi").unwrap(), 1024 * BYTES_PER_MIB);
        assert_eq!(parse_mem_bytes("128974848").unwrap(), 128974848);
        assert_eq!(parse_mem_bytes("1K").unwrap(), 1000);
        assert_eq!(parse_mem_bytes("4Ki").unwrap(), 4096);
        assert!(parse_mem_bytes("12Xi").is_err());
        assert!(parse_mem_bytes("-5Mi").is_err());
    }

    #[test]
    fn rounding_rules() {
        assert_eq!(round_cpu_milli(164.6), 165);
        assert_eq!(round_cpu_milli(0.2), 1);
        assert_eq!(round_mem_bytes(1.0), BYTES_PER_MIB);
        // partial mebibytes round up
        assert_eq!(round_mem_bytes(BYTES_PER_MIB as f64 + 1.0), 2 * BYTES_PER_MIB);
        assert_eq!(round_mem_bytes(288.0 * BYTES_PER_MIB as f64), 288 * BYTES_PER_MIB);
    }

    #[test]
    fn formatting() {
        assert_eq!(format_cpu_milli(250), "250m");
        assert_eq!(format_mem_bytes(512 * BYTES_PER_MIB), "512Mi");
        assert_eq!(format_mem_bytes(1000), "1000");
    }

    #[test]
    fn qos_guaranteed() {
        let c = ResourceSpec::new(500, 500, 512 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        assert_eq!(pod_qos_class(&[c]), QosClass::Guaranteed);
    }

    #[test]
    fn qos_burstable_on_unequal_limit() {
        let c = ResourceSpec::new(500, 1000, 512 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        assert_eq!(pod_qos_class(&[c]), QosClass::Burstable);
    }

    #[test]
    fn qos_burstable_on_request_without_limit() {
        let c = ResourceSpec {
            cpu_request: Some(100),
            ..Default::default()
        };
        assert_eq!(pod_qos_class(&[c]), QosClass::Burstable);
    }

    #[test]
    fn qos_best_effort() {
        assert_eq!(
            pod_qos_class(&[ResourceSpec::default(), ResourceSpec::default()]),
            QosClass::BestEffort
        );
    }

    #[test]
    fn request_within_limit_check() {
        let ok = ResourceSpec::new(100, 200, 100, 200);
        assert!(ok.request_within_limit());
        let bad = ResourceSpec {
            cpu_request: Some(300),
            cpu_limit: Some(200),
            ..Default::default()
        };
        assert!(!bad.request_within_limit());
    }
}
