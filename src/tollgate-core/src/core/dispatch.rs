use crate::core::catalog::RouteCatalog;
use crate::core::reputation::ReputationScorer;
use crate::core::routes::RouteMatch;
use crate::core::versioning::VersionManager;
use crate::core::waf::WafEngine;
use crate::models::reputation::{RiskLevel, ViolationType};
use crate::models::request::RequestContext;
use crate::models::version::{VersionNumber, VersionStatus, is_version_string};
use http::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const VERSION_HEADER: &str = "x-api-version";
pub const CLIENT_TYPE_HEADER: &str = "x-client-type";
pub const DEFAULT_CLIENT_TYPE: &str = "web";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub route_id: String,
    pub target_uri: String,
    pub params: Vec<(String, String)>,
    pub api_version: Option<String>,
    pub client_type: String,
    pub score: u8,
    pub risk: RiskLevel,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    MaliciousClient,
    WafViolation { rule_id: String, violation: ViolationType },
    VersionUnavailable { requested: String },
    RouteNotFound,
    MethodNotAllowed { allowed: Vec<String> },
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Denial {
    pub status: u16,
    pub reason: DenyReason,
    pub message: String,
}

impl Denial {
    fn new(status: StatusCode, reason: DenyReason, message: impl Into<String>) -> Self {
        Self { status: status.as_u16(), reason, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow(Admission),
    Deny(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

/// Runs one request through reputation, WAF, version and route policy.
pub struct Dispatcher {
    scorer: Arc<ReputationScorer>,
    waf: Arc<WafEngine>,
    versions: Arc<VersionManager>,
    catalog: Arc<RouteCatalog>,
}

impl Dispatcher {
    pub fn new(
        scorer: Arc<ReputationScorer>,
        waf: Arc<WafEngine>,
        versions: Arc<VersionManager>,
        catalog: Arc<RouteCatalog>,
    ) -> Self {
        Self { scorer, waf, versions, catalog }
    }

    #[instrument(skip_all, fields(method = %ctx.method, path = %ctx.path, ip = %ctx.client_ip))]
    pub async fn dispatch(&self, ctx: &RequestContext) -> Decision {
        let reputation = self.scorer.check_reputation(ctx.client_ip).await;
        if reputation.risk == RiskLevel::Malicious {
            info!(score = reputation.score, "client denied by reputation");
            return Decision::Deny(Denial::new(
                StatusCode::FORBIDDEN,
                DenyReason::MaliciousClient,
                format!("client reputation {} is too low", reputation.score),
            ));
        }

        if let Some(finding) = self.waf.inspect(ctx) {
            let score = self.scorer.report_violation(ctx.client_ip, &finding.violation).await;
            debug!(?score, "violation recorded");
            return Decision::Deny(Denial::new(
                StatusCode::FORBIDDEN,
                DenyReason::WafViolation { rule_id: finding.rule_id.clone(), violation: finding.violation.clone() },
                format!("request blocked by rule {} in {}", finding.rule_id, finding.location),
            ));
        }

        let mut warnings = Vec::new();
        let client_type = ctx.header(CLIENT_TYPE_HEADER).unwrap_or(DEFAULT_CLIENT_TYPE).to_string();
        // `/v1/...` wins over the version header
        let in_path = path_version(&ctx.path);
        let requested = in_path.clone().or_else(|| header_version(ctx));
        let served = self.versions.best_version(requested.as_deref(), &client_type);

        // routes under /vN/ belong to major N; never admit them under another major
        if let Some(req) = in_path.filter(|_| !self.versions.is_empty()) {
            let matches_major = served.as_ref().is_some_and(|v| same_major(&req, &v.version));
            if !matches_major {
                info!(requested = %req, served = ?served.as_ref().map(|v| &v.version), "path version unavailable");
                return Decision::Deny(Denial::new(
                    StatusCode::GONE,
                    DenyReason::VersionUnavailable { requested: req.clone() },
                    format!("api version {req} is not available"),
                ));
            }
        }

        let api_version = match served {
            Some(version) => {
                if let Some(req) = &requested {
                    if *req != version.version {
                        warnings.push(format!("requested {req}, serving {}", version.version));
                    }
                }
                if version.status == VersionStatus::Deprecated {
                    let sunset = version
                        .sunset_date
                        .map(|d| format!(", sunset on {}", d.format("%Y-%m-%d")))
                        .unwrap_or_default();
                    warnings.push(format!("{} is deprecated{sunset}", version.version));
                }
                Some(version.version)
            }
            None => None,
        };

        let (route, params) = match self.catalog.resolve(&ctx.method, &ctx.path) {
            RouteMatch::Found { route, params } => (route, params),
            RouteMatch::MethodNotAllowed { allowed } => {
                let message = format!("{} not allowed, use one of {}", ctx.method, allowed.join(", "));
                return Decision::Deny(Denial::new(
                    StatusCode::METHOD_NOT_ALLOWED,
                    DenyReason::MethodNotAllowed { allowed },
                    message,
                ));
            }
            RouteMatch::NotFound => {
                return Decision::Deny(Denial::new(
                    StatusCode::NOT_FOUND,
                    DenyReason::RouteNotFound,
                    format!("no route for {}", ctx.path),
                ));
            }
        };

        if !route.is_access_allowed(&ctx.roles) {
            info!(route = %route.route_id(), "access denied by role policy");
            return Decision::Deny(Denial::new(
                StatusCode::FORBIDDEN,
                DenyReason::AccessDenied,
                format!("roles do not grant access to route {}", route.route_id()),
            ));
        }

        if reputation.is_degraded() {
            warnings.push("reputation store degraded, neutral score applied".to_string());
        }

        Decision::Allow(Admission {
            route_id: route.route_id().to_string(),
            target_uri: route.target_uri().to_string(),
            params,
            api_version,
            client_type,
            score: reputation.score,
            risk: reputation.risk,
            warnings,
        })
    }
}

/// Leading `/vN[.M...]` segment of the path, if any.
fn path_version(path: &str) -> Option<String> {
    let first = path.trim_start_matches('/').split('/').next().unwrap_or_default();
    is_version_string(first).then(|| first.to_string())
}

fn header_version(ctx: &RequestContext) -> Option<String> {
    ctx.header(VERSION_HEADER).map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn same_major(a: &str, b: &str) -> bool {
    match (VersionNumber::parse(a), VersionNumber::parse(b)) {
        (Ok(a), Ok(b)) => a.major() == b.major(),
        _ => false,
    }
}
