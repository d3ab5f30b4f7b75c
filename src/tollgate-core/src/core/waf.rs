use crate::models::reputation::ViolationType;
use crate::models::request::RequestContext;
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tollgate_errors::{GatewayError, GatewayResult};
use tracing::warn;

const INSPECTED_HEADERS: [&str; 3] = ["user-agent", "referer", "cookie"];

const DEFAULT_RULES: &[(&str, ViolationType, &str)] = &[
    ("sqli-union-select", ViolationType::SqlInjection, r"(?i)\bunion\b(\s+all)?\s+\bselect\b"),
    ("sqli-tautology", ViolationType::SqlInjection, r#"(?i)['"]\s*(or|and)\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#),
    ("sqli-stacked", ViolationType::SqlInjection, r"(?i);\s*(drop|delete|truncate|alter|insert|update)\s+\w+"),
    ("sqli-comment", ViolationType::SqlInjection, r#"(?i)['"]\s*(--|#|/\*)"#),
    ("xss-script-tag", ViolationType::Xss, r"(?i)<\s*/?\s*script\b"),
    ("xss-event-handler", ViolationType::Xss, r"(?i)<[^>]*\bon[a-z]+\s*="),
    ("xss-js-uri", ViolationType::Xss, r"(?i)javascript\s*:"),
    ("traversal-dotdot", ViolationType::PathTraversal, r"(\.\./|\.\.\\|/\.\.$)"),
    ("traversal-sensitive-file", ViolationType::PathTraversal, r"(?i)/(etc/(passwd|shadow)|proc/self/)"),
    (
        "cmd-chained",
        ViolationType::CommandInjection,
        r"(?i)(;|\|\|?|&&|`|\$\()\s*(cat|ls|rm|wget|curl|bash|sh|nc|whoami|id|uname)\b",
    ),
];

/// A configured detection rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WafRuleConfig {
    pub id: String,
    pub violation: ViolationType,
    pub pattern: String,
}

fn def_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafSettings {
    #[serde(default = "def_enabled")]
    pub enabled: bool,
    /// Extra rules, evaluated after the built-in set.
    #[serde(default)]
    pub rules: Vec<WafRuleConfig>,
    /// Path prefixes that skip inspection, matched on whole segments.
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

impl Default for WafSettings {
    fn default() -> Self {
        Self { enabled: true, rules: Vec::new(), exclude_paths: Vec::new() }
    }
}

#[derive(Debug, Clone)]
struct WafRule {
    id: String,
    violation: ViolationType,
    regex: Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WafFinding {
    pub rule_id: String,
    pub violation: ViolationType,
    /// `path`, `query` or `header:<name>`.
    pub location: String,
}

/// Regex-based request inspection.
#[derive(Debug, Clone)]
pub struct WafEngine {
    enabled: bool,
    rules: Vec<WafRule>,
    exclude_paths: Vec<String>,
}

impl WafEngine {
    pub fn new(settings: &WafSettings) -> GatewayResult<Self> {
        let builtin = DEFAULT_RULES.iter().map(|(id, violation, pattern)| (id.to_string(), violation.clone(), *pattern));
        let configured = settings.rules.iter().map(|r| (r.id.clone(), r.violation.clone(), r.pattern.as_str()));

        let rules = builtin
            .chain(configured)
            .map(|(id, violation, pattern)| {
                let regex = Regex::new(pattern)
                    .map_err(|e| GatewayError::validation(format!("waf rule `{id}` does not compile: {e}")))?;
                Ok(WafRule { id, violation, regex })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self { enabled: settings.enabled, rules, exclude_paths: settings.exclude_paths.clone() })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Returns the first rule hit, looking at path, query and selected headers.
    pub fn inspect(&self, ctx: &RequestContext) -> Option<WafFinding> {
        if !self.enabled || self.exclude_paths.iter().any(|p| is_under(&ctx.path, p)) {
            return None;
        }

        let mut targets: Vec<(String, String)> = vec![("path".to_string(), decode(&ctx.path, false))];
        if let Some(query) = &ctx.query {
            targets.push(("query".to_string(), decode(query, true)));
        }
        for name in INSPECTED_HEADERS {
            if let Some(value) = ctx.header(name) {
                targets.push((format!("header:{name}"), decode(value, false)));
            }
        }

        for (location, text) in &targets {
            if let Some(rule) = self.rules.iter().find(|r| r.regex.is_match(text)) {
                warn!(
                    ip = %ctx.client_ip,
                    rule = %rule.id,
                    violation = %rule.violation,
                    %location,
                    "waf rule matched"
                );
                return Some(WafFinding {
                    rule_id: rule.id.clone(),
                    violation: rule.violation.clone(),
                    location: location.clone(),
                });
            }
        }
        None
    }
}

/// Percent-decodes twice so that double-encoded payloads are seen in clear.
fn decode(raw: &str, form: bool) -> String {
    let once = percent_decode_str(raw).decode_utf8_lossy().into_owned();
    let twice = percent_decode_str(&once).decode_utf8_lossy().into_owned();
    if form { twice.replace('+', " ") } else { twice }
}

/// `path` equals `prefix` or sits below it on a segment boundary.
fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
