use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use http::Method;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tollgate_config::{FileConfig, load_config, seed_routes, seed_versions};
use tollgate_core::{
    ApiChange, BroadcastPublisher, CLIENT_TYPE_HEADER, Dispatcher, LogNotifier, ReputationScorer, RequestContext,
    RouteCatalog, VERSION_HEADER, VersionManager, ViolationType, WafEngine,
};
use tollgate_memory::{KvStore, Memory};
use tracing::info;

const SEED_ACTOR: &str = "config";
const DEFAULT_LMDB_PATH: &str = "./data/tollgate";

#[derive(Parser, Debug)]
#[command(version, about = "Tollgate - route, version and IP reputation policy engine")]
struct Args {
    /// Path to config file (yaml/json/toml)
    #[arg(short, long, default_value = "./config.yaml")]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score a client address
    CheckIp { ip: IpAddr },
    /// Record a security violation for an address
    Report { ip: IpAddr, violation: String },
    Whitelist { ip: IpAddr },
    Blacklist { ip: IpAddr },
    /// Pick the API version to serve
    BestVersion {
        #[arg(long)]
        requested: Option<String>,
        #[arg(long, default_value = "web")]
        client: String,
    },
    /// Check submitted changes between two versions
    ValidateChanges {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long = "breaking")]
        breaking: Vec<String>,
        #[arg(long = "additive")]
        additive: Vec<String>,
    },
    Versions,
    Routes,
    /// Run one request through the full policy chain
    Dispatch {
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        ip: IpAddr,
        #[arg(long = "role")]
        roles: Vec<String>,
        #[arg(long)]
        client: Option<String>,
        #[arg(long)]
        api_version: Option<String>,
    },
}

struct Gateway {
    scorer: Arc<ReputationScorer>,
    versions: Arc<VersionManager>,
    catalog: Arc<RouteCatalog>,
    dispatcher: Dispatcher,
}

impl Gateway {
    fn assemble(cfg: &FileConfig) -> Result<Self> {
        let store: Arc<dyn KvStore> = if cfg.memory.engine == "lmdb" {
            let path = if cfg.memory.path.is_empty() { DEFAULT_LMDB_PATH } else { cfg.memory.path.as_str() };
            Arc::new(Memory::open_lmdb(path).with_context(|| format!("open lmdb at {path}"))?)
        } else {
            Arc::new(Memory::memory())
        };

        let scorer = Arc::new(ReputationScorer::new(store, cfg.reputation.clone()));
        let versions = Arc::new(VersionManager::new(Arc::new(LogNotifier)));
        seed_versions(&versions, cfg)?;
        let catalog = Arc::new(RouteCatalog::new(Arc::new(BroadcastPublisher::default())));
        seed_routes(&catalog, cfg, SEED_ACTOR)?;
        let waf = Arc::new(WafEngine::new(&cfg.waf).context("build waf rules")?);

        let dispatcher = Dispatcher::new(scorer.clone(), waf, versions.clone(), catalog.clone());
        Ok(Self { scorer, versions, catalog, dispatcher })
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = load_config(&args.config)?;
    tollgate_tracing::init(
        cfg.service_name(),
        cfg.otlp_endpoint(),
        &cfg.gateway.logging_mode,
        tollgate_tracing::LogFormat::parse(&cfg.gateway.log_format),
    )?;
    let gateway = Gateway::assemble(&cfg)?;
    info!(name = %cfg.gateway.name, engine = %cfg.memory.engine, "tollgate ready");

    match args.command {
        Command::CheckIp { ip } => print(&gateway.scorer.check_reputation(ip).await)?,
        Command::Report { ip, violation } => {
            let violation: ViolationType = violation.parse()?;
            let score = gateway.scorer.report_violation(ip, &violation).await;
            print(&serde_json::json!({ "ip": ip, "violation": violation, "score": score }))?;
        }
        Command::Whitelist { ip } => {
            gateway.scorer.whitelist_ip(ip).await?;
            print(&gateway.scorer.check_reputation(ip).await)?;
        }
        Command::Blacklist { ip } => {
            gateway.scorer.blacklist_ip(ip).await?;
            print(&gateway.scorer.check_reputation(ip).await)?;
        }
        Command::BestVersion { requested, client } => {
            print(&gateway.versions.best_version(requested.as_deref(), &client))?
        }
        Command::ValidateChanges { from, to, breaking, additive } => {
            let changes: Vec<ApiChange> = breaking
                .into_iter()
                .map(ApiChange::breaking)
                .chain(additive.into_iter().map(ApiChange::additive))
                .collect();
            print(&gateway.versions.validate_breaking_changes(&from, &to, &changes)?)?
        }
        Command::Versions => print(&gateway.versions.versions())?,
        Command::Routes => print(&gateway.catalog.routes())?,
        Command::Dispatch { method, path, ip, roles, client, api_version } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid method {method}"))?;
            let mut ctx = RequestContext::new(method, &path, ip).with_roles(roles);
            if let Some(client) = client {
                ctx = ctx.with_header(CLIENT_TYPE_HEADER, &client);
            }
            if let Some(version) = api_version {
                ctx = ctx.with_header(VERSION_HEADER, &version);
            }
            print(&gateway.dispatcher.dispatch(&ctx).await)?
        }
    }
    Ok(())
}
