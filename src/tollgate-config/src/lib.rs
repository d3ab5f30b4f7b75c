use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tollgate_core::{
    ApiRoute, ApiVersion, CompatibilityLevel, NewRoute, ReputationSettings, RouteCatalog, VersionManager,
    WafSettings,
};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCfg {
    #[serde(default = "def_name")]
    pub name: String,
    #[serde(default = "def_logging")]
    pub logging_mode: String,
    /// plain | pretty | json
    #[serde(default = "def_format")]
    pub log_format: String,
}
fn def_name() -> String {
    "tollgate".into()
}
fn def_logging() -> String {
    "info".into()
}
fn def_format() -> String {
    "plain".into()
}

impl Default for GatewayCfg {
    fn default() -> Self {
        Self { name: def_name(), logging_mode: def_logging(), log_format: def_format() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracingCfg {
    #[serde(default)]
    pub otlp_endpoint: String,
    #[serde(default)]
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCfg {
    #[serde(default = "def_engine")]
    pub engine: String, // memory | lmdb
    #[serde(default)]
    pub path: String,
}
fn def_engine() -> String {
    "memory".into()
}

impl Default for MemoryCfg {
    fn default() -> Self {
        Self { engine: def_engine(), path: String::new() }
    }
}

/// A version to register at startup, with the routes it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSeed {
    #[serde(flatten)]
    pub version: ApiVersion,
    #[serde(default)]
    pub routes: Vec<ApiRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilitySeed {
    pub from: String,
    pub to: String,
    pub level: CompatibilityLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub gateway: GatewayCfg,
    #[serde(default)]
    pub tracing: TracingCfg,
    #[serde(default)]
    pub memory: MemoryCfg,
    #[serde(default)]
    pub reputation: ReputationSettings,
    #[serde(default)]
    pub waf: WafSettings,
    /// Client ids that receive deprecation notices.
    #[serde(default)]
    pub clients: Vec<String>,
    #[serde(default)]
    pub versions: Vec<VersionSeed>,
    #[serde(default)]
    pub compatibility: Vec<CompatibilitySeed>,
    #[serde(default)]
    pub routes: Vec<NewRoute>,
}

impl FileConfig {
    pub fn service_name(&self) -> &str {
        if self.tracing.service_name.is_empty() { &self.gateway.name } else { &self.tracing.service_name }
    }

    pub fn otlp_endpoint(&self) -> Option<&str> {
        Some(self.tracing.otlp_endpoint.as_str()).filter(|e| !e.is_empty())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<FileConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let cfg = match ext {
        "yaml" | "yml" => serde_yml::from_str(&content).with_context(|| format!("parse yaml {}", path.display()))?,
        "json" => serde_json::from_str(&content).with_context(|| format!("parse json {}", path.display()))?,
        "toml" => toml::from_str(&content).with_context(|| format!("parse toml {}", path.display()))?,
        _ => return Err(anyhow!("Unknown config extension: {}", path.display())),
    };
    debug!(path = %path.display(), "config loaded");
    Ok(cfg)
}

/// Registers configured versions, their routes, clients and the compatibility matrix.
pub fn seed_versions(manager: &VersionManager, cfg: &FileConfig) -> Result<()> {
    for client in &cfg.clients {
        manager.register_client(client.clone());
    }
    for seed in &cfg.versions {
        let name = seed.version.version.clone();
        manager.register_version(seed.version.clone()).with_context(|| format!("register version {name}"))?;
        for route in &seed.routes {
            manager
                .register_route(&name, route.clone())
                .with_context(|| format!("register {} {} under {name}", route.method, route.path))?;
        }
    }
    for entry in &cfg.compatibility {
        manager
            .set_compatibility(&entry.from, &entry.to, entry.level)
            .with_context(|| format!("compatibility {} -> {}", entry.from, entry.to))?;
    }
    info!(versions = cfg.versions.len(), "api versions seeded");
    Ok(())
}

pub fn seed_routes(catalog: &RouteCatalog, cfg: &FileConfig, actor: &str) -> Result<()> {
    for route in &cfg.routes {
        catalog
            .create_route(route.clone(), actor)
            .with_context(|| format!("create route {}", route.route_id))?;
    }
    info!(routes = cfg.routes.len(), "gateway routes seeded");
    Ok(())
}
