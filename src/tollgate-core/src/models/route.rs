use crate::models::events::{RouteEvent, RouteEventKind};
use chrono::{DateTime, Utc};
use http::{Method, Uri};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tollgate_errors::{GatewayError, GatewayResult};
use uuid::Uuid;

/// Business key of a route: `[a-zA-Z0-9_-]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteId(String);

impl RouteId {
    pub fn parse(raw: impl Into<String>) -> GatewayResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(GatewayError::validation("route id must not be empty"));
        }
        if let Some(bad) = raw.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
            return Err(GatewayError::validation(format!(
                "route id `{raw}` contains invalid character `{bad}`"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RouteId {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RouteId> for String {
    fn from(id: RouteId) -> Self {
        id.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteStatus {
    Draft,
    #[default]
    Active,
    Inactive,
    Archived,
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteStatus::Draft => "DRAFT",
            RouteStatus::Active => "ACTIVE",
            RouteStatus::Inactive => "INACTIVE",
            RouteStatus::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

fn def_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    #[serde(default = "def_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.requests_per_window == 0 {
            return Err(GatewayError::validation("rate limit requests_per_window must be positive"));
        }
        if self.window_secs == 0 {
            return Err(GatewayError::validation("rate limit window_secs must be positive"));
        }
        Ok(())
    }
}

fn def_open_secs() -> u64 {
    30
}
fn def_half_open() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(default = "def_open_secs")]
    pub open_secs: u64,
    #[serde(default = "def_half_open")]
    pub half_open_requests: u32,
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.failure_threshold == 0 {
            return Err(GatewayError::validation("circuit breaker failure_threshold must be positive"));
        }
        if self.half_open_requests == 0 {
            return Err(GatewayError::validation("circuit breaker half_open_requests must be positive"));
        }
        Ok(())
    }
}

pub const MAX_RETRY_ATTEMPTS: u32 = 10;

fn def_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default = "def_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default)]
    pub retry_on: Vec<u16>,
}

impl RetryConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.max_attempts == 0 || self.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(GatewayError::validation(format!(
                "retry max_attempts must be within 1..={MAX_RETRY_ATTEMPTS}"
            )));
        }
        if let Some(code) = self.retry_on.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(GatewayError::validation(format!("retry_on contains invalid status {code}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

fn def_method() -> String {
    "*".into()
}
fn def_enabled() -> bool {
    true
}

/// Input of [`GatewayRoute::create`]; also the shape of seeded routes in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRoute {
    pub route_id: String,
    pub path_pattern: String,
    pub target_uri: String,
    #[serde(default = "def_method")]
    pub method: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "def_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub status: RouteStatus,
    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,
    #[serde(default)]
    pub blocked_roles: BTreeSet<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl NewRoute {
    pub fn new(route_id: impl Into<String>, path_pattern: impl Into<String>, target_uri: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            path_pattern: path_pattern.into(),
            target_uri: target_uri.into(),
            method: def_method(),
            priority: 0,
            enabled: true,
            status: RouteStatus::Active,
            allowed_roles: BTreeSet::new(),
            blocked_roles: BTreeSet::new(),
            rate_limit: None,
            circuit_breaker: None,
            retry: None,
        }
    }
}

/// Partial update applied by [`GatewayRoute::update`]; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteChanges {
    pub path_pattern: Option<String>,
    pub target_uri: Option<String>,
    pub method: Option<String>,
    pub priority: Option<i32>,
    pub allowed_roles: Option<BTreeSet<String>>,
    pub blocked_roles: Option<BTreeSet<String>>,
}

const STANDARD_METHODS: [Method; 9] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
    Method::TRACE,
    Method::CONNECT,
];

/// Normalizes a method name to upper case; `*` stands for any method.
pub fn normalize_method(raw: &str) -> GatewayResult<String> {
    let upper = raw.trim().to_ascii_uppercase();
    if upper == "*" {
        return Ok(upper);
    }
    match Method::from_bytes(upper.as_bytes()) {
        Ok(m) if STANDARD_METHODS.contains(&m) => Ok(upper),
        _ => Err(GatewayError::validation(format!("unsupported HTTP method `{raw}`"))),
    }
}

fn validate_path_pattern(pattern: &str) -> GatewayResult<()> {
    if pattern.trim().is_empty() {
        return Err(GatewayError::validation("path pattern must not be empty"));
    }
    if !pattern.starts_with('/') {
        return Err(GatewayError::validation(format!("path pattern `{pattern}` must start with `/`")));
    }
    Ok(())
}

fn validate_target_uri(target: &str) -> GatewayResult<()> {
    if target.trim().is_empty() {
        return Err(GatewayError::validation("target uri must not be empty"));
    }
    target
        .parse::<Uri>()
        .map(|_| ())
        .map_err(|e| GatewayError::validation(format!("target uri `{target}` is invalid: {e}")))
}

fn validate_roles(allowed: &BTreeSet<String>, blocked: &BTreeSet<String>) -> GatewayResult<()> {
    if allowed.iter().chain(blocked.iter()).any(|r| r.trim().is_empty()) {
        return Err(GatewayError::validation("role names must not be blank"));
    }
    if let Some(both) = allowed.intersection(blocked).next() {
        return Err(GatewayError::validation(format!("role `{both}` is both allowed and blocked")));
    }
    Ok(())
}

/// A routing rule and its policies.
///
/// All state changes go through the intention-revealing operations below.
/// Each successful operation bumps `version`, stamps the audit fields and
/// appends a [`RouteEvent`] that stays pending until the owning transaction
/// boundary takes it with [`GatewayRoute::take_events`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRoute {
    id: Uuid,
    route_id: RouteId,
    path_pattern: String,
    target_uri: String,
    method: String,
    enabled: bool,
    priority: i32,
    allowed_roles: BTreeSet<String>,
    blocked_roles: BTreeSet<String>,
    rate_limit: Option<RateLimitConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    retry: Option<RetryConfig>,
    status: RouteStatus,
    audit: AuditInfo,
    version: u64,
    #[serde(skip)]
    persisted_version: u64,
    #[serde(skip)]
    pending_events: Vec<RouteEvent>,
}

impl GatewayRoute {
    pub fn create(new: NewRoute, actor: &str) -> GatewayResult<Self> {
        let route_id = RouteId::parse(new.route_id)?;
        validate_path_pattern(&new.path_pattern)?;
        validate_target_uri(&new.target_uri)?;
        let method = normalize_method(&new.method)?;
        validate_roles(&new.allowed_roles, &new.blocked_roles)?;
        if new.status == RouteStatus::Archived {
            return Err(GatewayError::validation("a route cannot be created archived"));
        }
        if let Some(cfg) = &new.rate_limit {
            cfg.validate()?;
        }
        if let Some(cfg) = &new.circuit_breaker {
            cfg.validate()?;
        }
        if let Some(cfg) = &new.retry {
            cfg.validate()?;
        }

        let now = Utc::now();
        let mut route = Self {
            id: Uuid::new_v4(),
            route_id,
            path_pattern: new.path_pattern,
            target_uri: new.target_uri,
            method,
            enabled: new.enabled,
            priority: new.priority,
            allowed_roles: new.allowed_roles,
            blocked_roles: new.blocked_roles,
            rate_limit: new.rate_limit,
            circuit_breaker: new.circuit_breaker,
            retry: new.retry,
            status: new.status,
            audit: AuditInfo {
                created_by: actor.to_string(),
                created_at: now,
                updated_by: actor.to_string(),
                updated_at: now,
            },
            version: 0,
            persisted_version: 0,
            pending_events: Vec::new(),
        };
        let kind = RouteEventKind::RouteCreated {
            path_pattern: route.path_pattern.clone(),
            target_uri: route.target_uri.clone(),
            method: route.method.clone(),
        };
        route.record(kind, actor);
        Ok(route)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn route_id(&self) -> &RouteId {
        &self.route_id
    }
    pub fn path_pattern(&self) -> &str {
        &self.path_pattern
    }
    pub fn target_uri(&self) -> &str {
        &self.target_uri
    }
    pub fn method(&self) -> &str {
        &self.method
    }
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    pub fn priority(&self) -> i32 {
        self.priority
    }
    pub fn allowed_roles(&self) -> &BTreeSet<String> {
        &self.allowed_roles
    }
    pub fn blocked_roles(&self) -> &BTreeSet<String> {
        &self.blocked_roles
    }
    pub fn rate_limit(&self) -> Option<&RateLimitConfig> {
        self.rate_limit.as_ref()
    }
    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerConfig> {
        self.circuit_breaker.as_ref()
    }
    pub fn retry(&self) -> Option<&RetryConfig> {
        self.retry.as_ref()
    }
    pub fn status(&self) -> RouteStatus {
        self.status
    }
    pub fn audit(&self) -> &AuditInfo {
        &self.audit
    }
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version this route had when it was last loaded from or saved to a repository.
    pub fn persisted_version(&self) -> u64 {
        self.persisted_version
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted_version = self.version;
    }

    pub fn pending_events(&self) -> &[RouteEvent] {
        &self.pending_events
    }

    pub fn take_events(&mut self) -> Vec<RouteEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Whether the route serves traffic at all.
    pub fn is_routable(&self) -> bool {
        self.enabled && self.status == RouteStatus::Active
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.method == "*" || self.method == method.as_str()
    }

    pub fn update(&mut self, changes: RouteChanges, actor: &str) -> GatewayResult<RouteEvent> {
        self.ensure_not_archived("update")?;
        let mut changed = Vec::new();

        let path_pattern = match changes.path_pattern {
            Some(p) => {
                validate_path_pattern(&p)?;
                p
            }
            None => self.path_pattern.clone(),
        };
        let target_uri = match changes.target_uri {
            Some(t) => {
                validate_target_uri(&t)?;
                t
            }
            None => self.target_uri.clone(),
        };
        let method = match changes.method {
            Some(m) => normalize_method(&m)?,
            None => self.method.clone(),
        };
        let allowed = changes.allowed_roles.unwrap_or_else(|| self.allowed_roles.clone());
        let blocked = changes.blocked_roles.unwrap_or_else(|| self.blocked_roles.clone());
        validate_roles(&allowed, &blocked)?;
        let priority = changes.priority.unwrap_or(self.priority);

        if path_pattern != self.path_pattern {
            changed.push("path_pattern");
        }
        if target_uri != self.target_uri {
            changed.push("target_uri");
        }
        if method != self.method {
            changed.push("method");
        }
        if priority != self.priority {
            changed.push("priority");
        }
        if allowed != self.allowed_roles {
            changed.push("allowed_roles");
        }
        if blocked != self.blocked_roles {
            changed.push("blocked_roles");
        }
        if changed.is_empty() {
            return Err(GatewayError::conflict(format!(
                "update of route `{}` changes nothing",
                self.route_id
            )));
        }

        self.path_pattern = path_pattern;
        self.target_uri = target_uri;
        self.method = method;
        self.priority = priority;
        self.allowed_roles = allowed;
        self.blocked_roles = blocked;
        let changed_fields = changed.into_iter().map(String::from).collect();
        Ok(self.record(RouteEventKind::RouteUpdated { changed_fields }, actor))
    }

    pub fn enable(&mut self, actor: &str) -> GatewayResult<RouteEvent> {
        self.ensure_not_archived("enable")?;
        if self.enabled {
            return Err(GatewayError::conflict(format!("route `{}` is already enabled", self.route_id)));
        }
        self.enabled = true;
        Ok(self.record(RouteEventKind::RouteEnabled, actor))
    }

    pub fn disable(&mut self, actor: &str) -> GatewayResult<RouteEvent> {
        if !self.enabled {
            return Err(GatewayError::conflict(format!("route `{}` is already disabled", self.route_id)));
        }
        self.enabled = false;
        Ok(self.record(RouteEventKind::RouteDisabled, actor))
    }

    pub fn archive(&mut self, actor: &str) -> GatewayResult<RouteEvent> {
        self.ensure_not_archived("archive")?;
        let previous_status = self.status;
        self.status = RouteStatus::Archived;
        self.enabled = false;
        Ok(self.record(RouteEventKind::RouteArchived { previous_status }, actor))
    }

    /// DRAFT or INACTIVE to ACTIVE.
    pub fn activate(&mut self, actor: &str) -> GatewayResult<RouteEvent> {
        self.ensure_not_archived("activate")?;
        if self.status == RouteStatus::Active {
            return Err(GatewayError::conflict(format!("route `{}` is already active", self.route_id)));
        }
        let from = self.status;
        self.status = RouteStatus::Active;
        Ok(self.record(RouteEventKind::RouteStatusChanged { from, to: RouteStatus::Active }, actor))
    }

    /// ACTIVE to INACTIVE.
    pub fn deactivate(&mut self, actor: &str) -> GatewayResult<RouteEvent> {
        self.ensure_not_archived("deactivate")?;
        if self.status != RouteStatus::Active {
            return Err(GatewayError::conflict(format!(
                "route `{}` is {} and cannot be deactivated",
                self.route_id, self.status
            )));
        }
        self.status = RouteStatus::Inactive;
        Ok(self.record(
            RouteEventKind::RouteStatusChanged { from: RouteStatus::Active, to: RouteStatus::Inactive },
            actor,
        ))
    }

    pub fn update_rate_limit(&mut self, config: Option<RateLimitConfig>, actor: &str) -> GatewayResult<RouteEvent> {
        self.ensure_not_archived("update rate limit of")?;
        if let Some(cfg) = &config {
            cfg.validate()?;
        }
        if config == self.rate_limit {
            return Err(self.unchanged("rate limit"));
        }
        self.rate_limit = config.clone();
        Ok(self.record(RouteEventKind::RateLimitUpdated { config }, actor))
    }

    pub fn update_circuit_breaker(
        &mut self,
        config: Option<CircuitBreakerConfig>,
        actor: &str,
    ) -> GatewayResult<RouteEvent> {
        self.ensure_not_archived("update circuit breaker of")?;
        if let Some(cfg) = &config {
            cfg.validate()?;
        }
        if config == self.circuit_breaker {
            return Err(self.unchanged("circuit breaker"));
        }
        self.circuit_breaker = config.clone();
        Ok(self.record(RouteEventKind::CircuitBreakerUpdated { config }, actor))
    }

    pub fn update_retry_policy(&mut self, config: Option<RetryConfig>, actor: &str) -> GatewayResult<RouteEvent> {
        self.ensure_not_archived("update retry policy of")?;
        if let Some(cfg) = &config {
            cfg.validate()?;
        }
        if config == self.retry {
            return Err(self.unchanged("retry policy"));
        }
        self.retry = config.clone();
        Ok(self.record(RouteEventKind::RetryPolicyUpdated { config }, actor))
    }

    /// Role check for an inbound caller.
    ///
    /// A caller without roles passes only when no role is blocked. A blocked
    /// role always denies; a non-empty allow list needs at least one match.
    pub fn is_access_allowed(&self, user_roles: &[String]) -> bool {
        if !self.is_routable() {
            return false;
        }
        if user_roles.is_empty() {
            return self.blocked_roles.is_empty();
        }
        if user_roles.iter().any(|r| self.blocked_roles.contains(r)) {
            return false;
        }
        if !self.allowed_roles.is_empty() {
            return user_roles.iter().any(|r| self.allowed_roles.contains(r));
        }
        true
    }

    fn ensure_not_archived(&self, action: &str) -> GatewayResult<()> {
        if self.status == RouteStatus::Archived {
            return Err(GatewayError::conflict(format!(
                "cannot {action} route `{}`: it is archived",
                self.route_id
            )));
        }
        Ok(())
    }

    fn unchanged(&self, what: &str) -> GatewayError {
        GatewayError::conflict(format!("{what} of route `{}` is already set to that value", self.route_id))
    }

    fn record(&mut self, kind: RouteEventKind, actor: &str) -> RouteEvent {
        self.version += 1;
        self.audit.updated_by = actor.to_string();
        self.audit.updated_at = Utc::now();
        let event = RouteEvent::new(self.id, self.route_id.clone(), self.version, actor, kind);
        self.pending_events.push(event.clone());
        event
    }
}
