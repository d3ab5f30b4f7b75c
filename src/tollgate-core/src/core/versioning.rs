use crate::core::notify::{DeprecationNotice, DeprecationNotifier, LogNotifier};
use crate::models::route::normalize_method;
use crate::models::version::{
    ApiChange, ApiRoute, ApiVersion, CompatibilityLevel, CompatibilityReport, VersionNumber, VersionStatus,
    is_version_string,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::cmp::Reverse;
use std::sync::Arc;
use tollgate_errors::{GatewayError, GatewayResult};
use tracing::{debug, info, warn};

/// Registry of published API versions, their lifecycle and their routes.
pub struct VersionManager {
    versions: DashMap<String, ApiVersion>,
    routes: DashMap<String, Vec<ApiRoute>>,
    compatibility: DashMap<(String, String), CompatibilityLevel>,
    clients: DashSet<String>,
    notifier: Arc<dyn DeprecationNotifier>,
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new(Arc::new(LogNotifier))
    }
}

impl VersionManager {
    pub fn new(notifier: Arc<dyn DeprecationNotifier>) -> Self {
        Self {
            versions: DashMap::new(),
            routes: DashMap::new(),
            compatibility: DashMap::new(),
            clients: DashSet::new(),
            notifier,
        }
    }

    pub fn register_version(&self, version: ApiVersion) -> GatewayResult<()> {
        if !is_version_string(&version.version) {
            return Err(GatewayError::validation(format!(
                "version `{}` does not match vMAJOR[.MINOR...]",
                version.version
            )));
        }
        if version.release_date.is_none() {
            return Err(GatewayError::validation(format!("version `{}` has no release date", version.version)));
        }
        if version.status == VersionStatus::Retired {
            return Err(GatewayError::validation(format!(
                "version `{}` cannot be registered as retired",
                version.version
            )));
        }
        match self.versions.entry(version.version.clone()) {
            Entry::Occupied(_) => Err(GatewayError::conflict(format!(
                "version `{}` is already registered",
                version.version
            ))),
            Entry::Vacant(slot) => {
                info!(version = %version.version, status = %version.status, "api version registered");
                slot.insert(version);
                Ok(())
            }
        }
    }

    pub fn get_version(&self, version: &str) -> Option<ApiVersion> {
        self.versions.get(version).map(|v| v.value().clone())
    }

    /// All versions, oldest first.
    pub fn versions(&self) -> Vec<ApiVersion> {
        let mut all: Vec<ApiVersion> = self.versions.iter().map(|v| v.value().clone()).collect();
        all.sort_by(|a, b| a.release_date.cmp(&b.release_date).then_with(|| a.version.cmp(&b.version)));
        all
    }

    /// True when no version has been registered; requests are then unversioned.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn register_client(&self, client_id: impl Into<String>) {
        self.clients.insert(client_id.into());
    }

    pub fn activate_version(&self, version: &str) -> GatewayResult<()> {
        let mut entry = self
            .versions
            .get_mut(version)
            .ok_or_else(|| GatewayError::not_found(format!("version `{version}`")))?;
        if entry.status != VersionStatus::Draft {
            return Err(GatewayError::conflict(format!(
                "version `{version}` is {} and cannot be activated",
                entry.status
            )));
        }
        entry.status = VersionStatus::Active;
        info!(%version, "api version activated");
        Ok(())
    }

    /// Marks an ACTIVE version deprecated and notifies its clients.
    pub async fn deprecate_version(
        &self,
        version: &str,
        reason: &str,
        sunset_date: DateTime<Utc>,
    ) -> GatewayResult<DeprecationNotice> {
        if reason.trim().is_empty() {
            return Err(GatewayError::validation("deprecation reason must not be empty"));
        }
        let notice = {
            let mut entry = self
                .versions
                .get_mut(version)
                .ok_or_else(|| GatewayError::not_found(format!("version `{version}`")))?;
            if entry.status != VersionStatus::Active {
                return Err(GatewayError::conflict(format!(
                    "version `{version}` is {} and cannot be deprecated",
                    entry.status
                )));
            }
            let now = Utc::now();
            entry.status = VersionStatus::Deprecated;
            entry.deprecation_date = Some(now);
            entry.deprecation_reason = Some(reason.to_string());
            entry.sunset_date = Some(sunset_date);

            let mut recipients: Vec<String> = self.clients.iter().map(|c| c.key().clone()).collect();
            recipients.extend(entry.allowed_clients.iter().cloned());
            recipients.sort();
            recipients.dedup();
            DeprecationNotice {
                version: version.to_string(),
                reason: reason.to_string(),
                sunset_date,
                recipients,
                issued_at: now,
            }
        };
        info!(%version, sunset = %sunset_date, "api version deprecated");

        if let Err(e) = self.notifier.notify(&notice).await {
            warn!(%version, error = %e, "deprecation notice could not be delivered");
        }
        Ok(notice)
    }

    /// Retires a version and drops every route registered under it.
    pub fn retire_version(&self, version: &str) -> GatewayResult<()> {
        let mut entry = self
            .versions
            .get_mut(version)
            .ok_or_else(|| GatewayError::not_found(format!("version `{version}`")))?;
        if !entry.status.can_transition_to(VersionStatus::Retired) {
            return Err(GatewayError::conflict(format!("version `{version}` is already retired")));
        }
        entry.status = VersionStatus::Retired;
        entry.retirement_date = Some(Utc::now());
        let dropped = self.routes.remove(version).map(|(_, r)| r.len()).unwrap_or(0);
        info!(%version, dropped_routes = dropped, "api version retired");
        Ok(())
    }

    pub fn register_route(&self, version: &str, route: ApiRoute) -> GatewayResult<()> {
        let method = normalize_method(&route.method)?;
        if route.handler.trim().is_empty() {
            return Err(GatewayError::validation("route handler must not be empty"));
        }
        // hold the version entry so a concurrent retire cannot slip in between
        let entry = self
            .versions
            .get(version)
            .ok_or_else(|| GatewayError::not_found(format!("version `{version}`")))?;
        if entry.status == VersionStatus::Retired {
            return Err(GatewayError::conflict(format!("version `{version}` is retired")));
        }
        if !path_has_version_prefix(&route.path, version) {
            return Err(GatewayError::validation(format!(
                "route path `{}` is not under `/{version}`",
                route.path
            )));
        }

        let route = ApiRoute { method, ..route };
        let mut list = self.routes.entry(version.to_string()).or_default();
        if list.iter().any(|r| r.method == route.method && r.path == route.path) {
            return Err(GatewayError::conflict(format!(
                "{} {} is already registered under `{version}`",
                route.method, route.path
            )));
        }
        let at = list.partition_point(|r| r.priority >= route.priority);
        debug!(%version, method = %route.method, path = %route.path, priority = route.priority, "api route registered");
        list.insert(at, route);
        Ok(())
    }

    /// Routes of a version, highest priority first; empty for unknown or retired versions.
    pub fn routes_for_version(&self, version: &str) -> Vec<ApiRoute> {
        self.routes.get(version).map(|r| r.value().clone()).unwrap_or_default()
    }

    pub fn set_compatibility(&self, from: &str, to: &str, level: CompatibilityLevel) -> GatewayResult<()> {
        for v in [from, to] {
            if !self.versions.contains_key(v) {
                return Err(GatewayError::not_found(format!("version `{v}`")));
            }
        }
        self.compatibility.insert((from.to_string(), to.to_string()), level);
        Ok(())
    }

    pub fn compatibility(&self, from: &str, to: &str) -> Option<CompatibilityLevel> {
        self.compatibility.get(&(from.to_string(), to.to_string())).map(|l| *l)
    }

    /// Latest ACTIVE and stable version by release date.
    pub fn latest_stable(&self) -> Option<ApiVersion> {
        self.versions
            .iter()
            .filter(|v| v.status == VersionStatus::Active && v.stable)
            .max_by_key(|v| (v.release_date, VersionNumber::parse(&v.version).ok()))
            .map(|v| v.value().clone())
    }

    /// Picks the version to serve for a request.
    ///
    /// An exact accessible match wins. Otherwise the accessible versions with
    /// the same major number are ranked stable first, then by minor, then by
    /// full version. Anything else falls back to the latest stable version.
    pub fn best_version(&self, requested: Option<&str>, client_type: &str) -> Option<ApiVersion> {
        let Some(requested) = requested else {
            return self.latest_stable();
        };
        if let Some(exact) = self.versions.get(requested) {
            if exact.is_accessible_to(client_type) {
                return Some(exact.value().clone());
            }
        }
        let Ok(wanted) = VersionNumber::parse(requested) else {
            debug!(%requested, "unparseable version requested, using latest stable");
            return self.latest_stable();
        };

        let mut candidates: Vec<(ApiVersion, VersionNumber)> = self
            .versions
            .iter()
            .filter(|v| v.is_accessible_to(client_type))
            .filter_map(|v| {
                let number = VersionNumber::parse(&v.version).ok()?;
                (number.major() == wanted.major()).then(|| (v.value().clone(), number))
            })
            .collect();
        candidates.sort_by_key(|(v, n)| (Reverse(v.stable), Reverse(n.minor()), Reverse(n.clone())));
        match candidates.into_iter().next() {
            Some((v, _)) => Some(v),
            None => self.latest_stable(),
        }
    }

    /// Checks a set of changes between two versions against the declared compatibility.
    pub fn validate_breaking_changes(
        &self,
        from: &str,
        to: &str,
        changes: &[ApiChange],
    ) -> GatewayResult<CompatibilityReport> {
        let source = self
            .get_version(from)
            .ok_or_else(|| GatewayError::not_found(format!("version `{from}`")))?;
        if !self.versions.contains_key(to) {
            return Err(GatewayError::not_found(format!("version `{to}`")));
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let breaking = changes.iter().filter(|c| c.breaking).count();
        if breaking > 0 {
            match self.compatibility(from, to) {
                Some(CompatibilityLevel::Compatible) => errors.push(format!(
                    "{from} -> {to} is declared COMPATIBLE but {breaking} breaking change(s) were submitted"
                )),
                Some(level) => warnings.push(format!(
                    "{breaking} breaking change(s) from {from} to {to} (declared {level})"
                )),
                None => warnings.push(format!(
                    "{breaking} breaking change(s) from {from} to {to} with no declared compatibility"
                )),
            }
        }

        if source.status == VersionStatus::Deprecated {
            let now = Utc::now();
            match source.sunset_date {
                Some(sunset) if source.is_past_sunset(now) => {
                    errors.push(format!("{from} is deprecated and past its sunset date {sunset}"))
                }
                Some(sunset) => warnings.push(format!("{from} is deprecated, sunset on {sunset}")),
                None => warnings.push(format!("{from} is deprecated")),
            }
        }

        Ok(CompatibilityReport::finish(errors, warnings))
    }
}

fn path_has_version_prefix(path: &str, version: &str) -> bool {
    let under = |prefix: &str| path == prefix || path.starts_with(&format!("{prefix}/"));
    if under(&format!("/{version}")) {
        return true;
    }
    match VersionNumber::parse(version) {
        Ok(n) => under(&format!("/v{}", n.major())),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::notify::ChannelNotifier;
    use chrono::{Duration, TimeZone};

    fn date(month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap()
    }

    fn active(version: &str, month: u32) -> ApiVersion {
        ApiVersion::new(version, date(month)).with_status(VersionStatus::Active)
    }

    #[test]
    fn registration_validates_input() {
        let vm = VersionManager::default();
        assert!(matches!(vm.register_version(active("1.0", 1)), Err(GatewayError::Validation(_))));
        let mut undated = active("v1.0", 1);
        undated.release_date = None;
        assert!(matches!(vm.register_version(undated), Err(GatewayError::Validation(_))));
        vm.register_version(active("v1.0", 1)).unwrap();
        assert!(matches!(vm.register_version(active("v1.0", 2)), Err(GatewayError::StateConflict(_))));
    }

    #[test]
    fn lifecycle_is_forward_only() {
        let vm = VersionManager::default();
        vm.register_version(ApiVersion::new("v2.0", date(1))).unwrap();
        vm.activate_version("v2.0").unwrap();
        assert!(matches!(vm.activate_version("v2.0"), Err(GatewayError::StateConflict(_))));
        vm.retire_version("v2.0").unwrap();
        assert!(matches!(vm.retire_version("v2.0"), Err(GatewayError::StateConflict(_))));
        assert!(matches!(vm.activate_version("v9"), Err(GatewayError::NotFound(_))));
    }

    #[test]
    fn routes_are_ordered_by_priority() {
        let vm = VersionManager::default();
        vm.register_version(active("v1.2", 1)).unwrap();
        vm.register_route("v1.2", ApiRoute::new("get", "/v1.2/users", "users.list", 1)).unwrap();
        vm.register_route("v1.2", ApiRoute::new("GET", "/v1/users/{id}", "users.get", 10)).unwrap();
        vm.register_route("v1.2", ApiRoute::new("POST", "/v1.2/users", "users.create", 1)).unwrap();
        let handlers: Vec<_> = vm.routes_for_version("v1.2").into_iter().map(|r| r.handler).collect();
        assert_eq!(handlers, vec!["users.get", "users.list", "users.create"]);

        assert!(matches!(
            vm.register_route("v1.2", ApiRoute::new("GET", "/v1.2/users", "dup", 0)),
            Err(GatewayError::StateConflict(_))
        ));
        assert!(matches!(
            vm.register_route("v1.2", ApiRoute::new("GET", "/v2/users", "x", 0)),
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            vm.register_route("v1.2", ApiRoute::new("GET", "/v1.20/users", "x", 0)),
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            vm.register_route("v3", ApiRoute::new("GET", "/v3/users", "x", 0)),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn retired_versions_reject_routes() {
        let vm = VersionManager::default();
        vm.register_version(active("v1", 1)).unwrap();
        vm.register_route("v1", ApiRoute::new("GET", "/v1/a", "a", 0)).unwrap();
        vm.retire_version("v1").unwrap();
        assert!(vm.routes_for_version("v1").is_empty());
        assert!(matches!(
            vm.register_route("v1", ApiRoute::new("GET", "/v1/b", "b", 0)),
            Err(GatewayError::StateConflict(_))
        ));
    }

    #[test]
    fn best_version_prefers_stable_then_minor() {
        let vm = VersionManager::default();
        vm.register_version(active("v1.0.0", 1)).unwrap();
        vm.register_version(active("v1.1.0", 2)).unwrap();
        vm.register_version(active("v1.2.0", 3).unstable()).unwrap();
        vm.register_version(active("v2.0.0", 4).unstable()).unwrap();

        assert_eq!(vm.best_version(Some("v1"), "web").unwrap().version, "v1.1.0");
        assert_eq!(vm.best_version(Some("v1.2.0"), "web").unwrap().version, "v1.2.0");
        // no stable v2 release, the unstable one is still the only v2 candidate
        assert_eq!(vm.best_version(Some("v2"), "web").unwrap().version, "v2.0.0");
        assert_eq!(vm.best_version(Some("v7"), "web").unwrap().version, "v1.1.0");
        assert_eq!(vm.best_version(Some("latest"), "web").unwrap().version, "v1.1.0");
        assert_eq!(vm.best_version(None, "web").unwrap().version, "v1.1.0");
    }

    #[test]
    fn best_version_respects_client_lists() {
        let vm = VersionManager::default();
        vm.register_version(active("v1.0", 1)).unwrap();
        let mut mobile_only = active("v1.1", 2);
        mobile_only.allowed_clients.push("mobile".into());
        vm.register_version(mobile_only).unwrap();
        vm.register_version(ApiVersion::new("v1.5", date(3))).unwrap();

        assert_eq!(vm.best_version(Some("v1.1"), "web").unwrap().version, "v1.0");
        assert_eq!(vm.best_version(Some("v1.1"), "mobile").unwrap().version, "v1.1");
        // drafts are never served
        assert_eq!(vm.best_version(Some("v1.5"), "mobile").unwrap().version, "v1.1");
    }

    #[tokio::test]
    async fn deprecation_notifies_clients() {
        let (notifier, mut rx) = ChannelNotifier::new(4);
        let vm = VersionManager::new(Arc::new(notifier));
        let mut v = active("v1", 1);
        v.allowed_clients = vec!["web".into(), "partner-a".into()];
        vm.register_version(v).unwrap();
        vm.register_client("partner-b");
        vm.register_client("web");

        assert!(matches!(
            vm.deprecate_version("v1", " ", Utc::now()).await,
            Err(GatewayError::Validation(_))
        ));
        let sunset = Utc::now() + Duration::days(90);
        let notice = vm.deprecate_version("v1", "replaced by v2", sunset).await.unwrap();
        assert_eq!(notice.recipients, vec!["partner-a", "partner-b", "web"]);
        assert_eq!(rx.recv().await.unwrap(), notice);

        let stored = vm.get_version("v1").unwrap();
        assert_eq!(stored.status, VersionStatus::Deprecated);
        assert_eq!(stored.sunset_date, Some(sunset));
        assert!(matches!(
            vm.deprecate_version("v1", "again", sunset).await,
            Err(GatewayError::StateConflict(_))
        ));
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_fail_deprecation() {
        let (notifier, rx) = ChannelNotifier::new(1);
        drop(rx);
        let vm = VersionManager::new(Arc::new(notifier));
        vm.register_version(active("v1", 1)).unwrap();
        assert!(vm.deprecate_version("v1", "eol", Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn breaking_change_validation() {
        let vm = VersionManager::default();
        vm.register_version(active("v1.0.0", 1)).unwrap();
        vm.register_version(active("v2.0.0", 2)).unwrap();
        let changes = [ApiChange::breaking("removed /orders"), ApiChange::additive("added /carts")];

        let report = vm.validate_breaking_changes("v1.0.0", "v2.0.0", &changes).unwrap();
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);

        vm.set_compatibility("v1.0.0", "v2.0.0", CompatibilityLevel::Breaking).unwrap();
        assert!(vm.validate_breaking_changes("v1.0.0", "v2.0.0", &changes).unwrap().valid);

        vm.set_compatibility("v1.0.0", "v2.0.0", CompatibilityLevel::Compatible).unwrap();
        let report = vm.validate_breaking_changes("v1.0.0", "v2.0.0", &changes).unwrap();
        assert!(!report.valid);
        assert!(report.errors[0].contains("COMPATIBLE"));

        let additive = [ApiChange::additive("new field")];
        assert!(vm.validate_breaking_changes("v1.0.0", "v2.0.0", &additive).unwrap().valid);

        vm.deprecate_version("v1.0.0", "old", Utc::now() - Duration::days(1)).await.unwrap();
        let report = vm.validate_breaking_changes("v1.0.0", "v2.0.0", &additive).unwrap();
        assert!(!report.valid);
        assert!(report.errors[0].contains("sunset"));

        assert!(matches!(
            vm.validate_breaking_changes("v1.0.0", "v9", &additive),
            Err(GatewayError::NotFound(_))
        ));
    }
}
