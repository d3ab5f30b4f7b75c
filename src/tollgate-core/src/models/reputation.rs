use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub const MIN_SCORE: u8 = 0;
pub const MAX_SCORE: u8 = 100;
pub const NEUTRAL_SCORE: u8 = 50;

/// Age after which an assessment must be recomputed.
pub const STALE_AFTER_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Malicious,
    Suspicious,
    Unknown,
    Clean,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=20 => RiskLevel::Malicious,
            21..=40 => RiskLevel::Suspicious,
            41..=70 => RiskLevel::Unknown,
            _ => RiskLevel::Clean,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Malicious => "MALICIOUS",
            RiskLevel::Suspicious => "SUSPICIOUS",
            RiskLevel::Unknown => "UNKNOWN",
            RiskLevel::Clean => "CLEAN",
        };
        f.write_str(s)
    }
}

/// Clamp any intermediate score into 0..=100.
pub fn clamp_score(raw: i64) -> u8 {
    raw.clamp(MIN_SCORE as i64, MAX_SCORE as i64) as u8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpReputation {
    pub ip: IpAddr,
    pub score: u8,
    pub risk: RiskLevel,
    pub assessed_at: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

impl IpReputation {
    pub fn new(ip: IpAddr, raw_score: i64, details: BTreeMap<String, Value>) -> Self {
        let score = clamp_score(raw_score);
        Self { ip, score, risk: RiskLevel::from_score(score), assessed_at: Utc::now(), details }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.assessed_at > ChronoDuration::seconds(STALE_AFTER_SECS)
    }

    pub fn is_degraded(&self) -> bool {
        self.details.get("degraded").and_then(Value::as_bool).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    Ddos,
    BruteForce,
    #[serde(untagged)]
    Other(String),
}

impl ViolationType {
    pub fn as_str(&self) -> &str {
        match self {
            ViolationType::SqlInjection => "sql_injection",
            ViolationType::Xss => "xss",
            ViolationType::PathTraversal => "path_traversal",
            ViolationType::CommandInjection => "command_injection",
            ViolationType::Ddos => "ddos",
            ViolationType::BruteForce => "brute_force",
            ViolationType::Other(name) => name,
        }
    }

    /// Built-in score penalty; unknown types cost 10.
    pub fn default_penalty(&self) -> u8 {
        match self {
            ViolationType::SqlInjection => 20,
            ViolationType::Xss => 15,
            ViolationType::PathTraversal => 25,
            ViolationType::CommandInjection => 30,
            ViolationType::Ddos => 20,
            ViolationType::BruteForce => 15,
            ViolationType::Other(_) => 10,
        }
    }
}

impl FromStr for ViolationType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Ok(match normalized.as_str() {
            "sql_injection" | "sqli" => ViolationType::SqlInjection,
            "xss" => ViolationType::Xss,
            "path_traversal" => ViolationType::PathTraversal,
            "command_injection" => ViolationType::CommandInjection,
            "ddos" => ViolationType::Ddos,
            "brute_force" => ViolationType::BruteForce,
            _ => ViolationType::Other(normalized),
        })
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a CIDR block to an ISO country code for the built-in geo resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoRange {
    pub cidr: IpNet,
    pub country: String,
}

fn def_neutral() -> u8 {
    NEUTRAL_SCORE
}
fn def_cache_ttl() -> u64 {
    300
}
fn def_cache_capacity() -> u64 {
    100_000
}
fn def_score_ttl() -> u64 {
    3600
}
fn def_list_ttl() -> u64 {
    30 * 24 * 3600
}
fn def_timeout_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationSettings {
    #[serde(default = "def_neutral")]
    pub neutral_score: u8,
    /// Local cache lifetime, seconds.
    #[serde(default = "def_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Upper bound on locally cached assessments.
    #[serde(default = "def_cache_capacity")]
    pub cache_capacity: u64,
    /// Freshness window of a persisted running score, seconds.
    #[serde(default = "def_score_ttl")]
    pub score_ttl_secs: u64,
    /// Lifetime of whitelist/blacklist scores, seconds.
    #[serde(default = "def_list_ttl")]
    pub list_ttl_secs: u64,
    #[serde(default = "def_list_ttl")]
    pub violation_window_secs: u64,
    #[serde(default = "def_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default)]
    pub malicious_ranges: Vec<IpNet>,
    /// Country code to score adjustment; values are clamped to +/-20.
    #[serde(default)]
    pub country_risk: HashMap<String, i32>,
    #[serde(default)]
    pub geo: Vec<GeoRange>,
    /// Violation name to penalty, overriding the built-in table.
    #[serde(default)]
    pub penalties: HashMap<String, u8>,
}

impl Default for ReputationSettings {
    fn default() -> Self {
        Self {
            neutral_score: def_neutral(),
            cache_ttl_secs: def_cache_ttl(),
            cache_capacity: def_cache_capacity(),
            score_ttl_secs: def_score_ttl(),
            list_ttl_secs: def_list_ttl(),
            violation_window_secs: def_list_ttl(),
            store_timeout_ms: def_timeout_ms(),
            malicious_ranges: Vec::new(),
            country_risk: HashMap::new(),
            geo: Vec::new(),
            penalties: HashMap::new(),
        }
    }
}

impl ReputationSettings {
    pub fn penalty_for(&self, violation: &ViolationType) -> u8 {
        self.penalties
            .get(violation.as_str())
            .copied()
            .unwrap_or_else(|| violation.default_penalty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn risk_tiers() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Malicious);
        assert_eq!(RiskLevel::from_score(20), RiskLevel::Malicious);
        assert_eq!(RiskLevel::from_score(21), RiskLevel::Suspicious);
        assert_eq!(RiskLevel::from_score(40), RiskLevel::Suspicious);
        assert_eq!(RiskLevel::from_score(70), RiskLevel::Unknown);
        assert_eq!(RiskLevel::from_score(71), RiskLevel::Clean);
    }

    #[test]
    fn violation_names() {
        assert_eq!("sql_injection".parse::<ViolationType>().unwrap(), ViolationType::SqlInjection);
        assert_eq!("Command-Injection".parse::<ViolationType>().unwrap(), ViolationType::CommandInjection);
        let other: ViolationType = "credential_stuffing".parse().unwrap();
        assert_eq!(other.default_penalty(), 10);
        assert_eq!(other.to_string(), "credential_stuffing");
        let json: ViolationType = serde_json::from_str("\"xss\"").unwrap();
        assert_eq!(json, ViolationType::Xss);
    }

    #[test]
    fn configured_penalties_override_defaults() {
        let mut settings = ReputationSettings::default();
        settings.penalties.insert("xss".into(), 40);
        assert_eq!(settings.penalty_for(&ViolationType::Xss), 40);
        assert_eq!(settings.penalty_for(&ViolationType::PathTraversal), 25);
    }

    #[test]
    fn staleness() {
        let mut rep = IpReputation::new("1.2.3.4".parse().unwrap(), 60, BTreeMap::new());
        assert!(!rep.is_stale(Utc::now()));
        rep.assessed_at = Utc::now() - ChronoDuration::seconds(STALE_AFTER_SECS + 1);
        assert!(rep.is_stale(Utc::now()));
    }

    proptest! {
        #[test]
        fn scores_always_clamped(raw in any::<i64>()) {
            let rep = IpReputation::new("10.1.1.1".parse().unwrap(), raw, BTreeMap::new());
            prop_assert!(rep.score <= MAX_SCORE);
            prop_assert_eq!(rep.risk, RiskLevel::from_score(rep.score));
        }
    }
}
