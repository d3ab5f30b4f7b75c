use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;
use tollgate_errors::{GatewayError, GatewayResult};

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+(\.\d+)*$").expect("version pattern compiles"));

/// Whether `raw` looks like `vMAJOR[.MINOR...]`.
pub fn is_version_string(raw: &str) -> bool {
    VERSION_PATTERN.is_match(raw)
}

/// Numeric components of a version string, e.g. `v1.2.0` -> `[1, 2, 0]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionNumber(Vec<u64>);

impl VersionNumber {
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        if !is_version_string(raw) {
            return Err(GatewayError::validation(format!(
                "version `{raw}` does not match vMAJOR[.MINOR...]"
            )));
        }
        let parts = raw[1..]
            .split('.')
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| GatewayError::validation(format!("version component `{p}` is too large")))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self(parts))
    }

    pub fn major(&self) -> u64 {
        self.0.first().copied().unwrap_or(0)
    }

    /// Missing minor components read as 0.
    pub fn minor(&self) -> u64 {
        self.0.get(1).copied().unwrap_or(0)
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

impl Ord for VersionNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for VersionNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionStatus {
    #[default]
    Draft,
    Active,
    Deprecated,
    Retired,
}

impl VersionStatus {
    fn rank(self) -> u8 {
        match self {
            VersionStatus::Draft => 0,
            VersionStatus::Active => 1,
            VersionStatus::Deprecated => 2,
            VersionStatus::Retired => 3,
        }
    }

    /// Lifecycle only moves forward.
    pub fn can_transition_to(self, next: VersionStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VersionStatus::Draft => "DRAFT",
            VersionStatus::Active => "ACTIVE",
            VersionStatus::Deprecated => "DEPRECATED",
            VersionStatus::Retired => "RETIRED",
        };
        f.write_str(s)
    }
}

fn def_stable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiVersion {
    pub version: String,
    #[serde(default)]
    pub status: VersionStatus,
    #[serde(default = "def_stable")]
    pub stable: bool,
    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprecation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprecation_reason: Option<String>,
    #[serde(default)]
    pub sunset_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retirement_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allowed_clients: Vec<String>,
    #[serde(default)]
    pub blocked_clients: Vec<String>,
}

impl ApiVersion {
    pub fn new(version: impl Into<String>, release_date: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            status: VersionStatus::Draft,
            stable: true,
            release_date: Some(release_date),
            deprecation_date: None,
            deprecation_reason: None,
            sunset_date: None,
            retirement_date: None,
            allowed_clients: Vec::new(),
            blocked_clients: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: VersionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn unstable(mut self) -> Self {
        self.stable = false;
        self
    }

    /// Client filter only; lifecycle is checked by [`ApiVersion::is_servable`].
    pub fn accepts_client(&self, client_type: &str) -> bool {
        if self.blocked_clients.iter().any(|c| c == client_type) {
            return false;
        }
        self.allowed_clients.is_empty() || self.allowed_clients.iter().any(|c| c == client_type)
    }

    /// ACTIVE or DEPRECATED versions still serve traffic.
    pub fn is_servable(&self) -> bool {
        matches!(self.status, VersionStatus::Active | VersionStatus::Deprecated)
    }

    pub fn is_accessible_to(&self, client_type: &str) -> bool {
        self.is_servable() && self.accepts_client(client_type)
    }

    pub fn is_past_sunset(&self, now: DateTime<Utc>) -> bool {
        self.sunset_date.is_some_and(|s| now > s)
    }
}

/// A handler registration under one API version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRoute {
    pub method: String,
    pub path: String,
    pub handler: String,
    #[serde(default)]
    pub priority: i32,
}

impl ApiRoute {
    pub fn new(method: &str, path: impl Into<String>, handler: impl Into<String>, priority: i32) -> Self {
        Self { method: method.to_ascii_uppercase(), path: path.into(), handler: handler.into(), priority }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityLevel {
    Compatible,
    BackwardCompatible,
    Breaking,
}

impl fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompatibilityLevel::Compatible => "COMPATIBLE",
            CompatibilityLevel::BackwardCompatible => "BACKWARD_COMPATIBLE",
            CompatibilityLevel::Breaking => "BREAKING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiChange {
    pub description: String,
    #[serde(default)]
    pub breaking: bool,
}

impl ApiChange {
    pub fn breaking(description: impl Into<String>) -> Self {
        Self { description: description.into(), breaking: true }
    }

    pub fn additive(description: impl Into<String>) -> Self {
        Self { description: description.into(), breaking: false }
    }
}

/// Outcome of a breaking-change check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CompatibilityReport {
    pub(crate) fn finish(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { valid: errors.is_empty(), errors, warnings }
    }
}
