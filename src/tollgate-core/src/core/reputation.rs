use crate::core::cache::TtlCache;
use crate::models::reputation::{
    GeoRange, IpReputation, MAX_SCORE, MIN_SCORE, ReputationSettings, ViolationType, clamp_score,
};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tollgate_errors::{GatewayError, GatewayResult};
use tollgate_memory::KvStore;
use tracing::{debug, info, warn};

const MALICIOUS_RANGE_PENALTY: i64 = 50;
const PRIVATE_PENALTY: i64 = 10;
const PER_VIOLATION_PENALTY: i64 = 5;
const MAX_VIOLATION_PENALTY: i64 = 40;
const MAX_COUNTRY_ADJUSTMENT: i64 = 20;

pub fn score_key(ip: &IpAddr) -> String {
    format!("ip:reputation:{ip}")
}

pub fn violations_key(ip: &IpAddr) -> String {
    format!("ip:violations:{ip}")
}

/// Looks up the country an address is registered in.
pub trait GeoResolver: Send + Sync {
    fn country_of(&self, ip: &IpAddr) -> Option<String>;
}

/// Resolves countries from a static CIDR table; the most specific block wins.
#[derive(Debug, Clone, Default)]
pub struct CidrGeoResolver {
    ranges: Vec<GeoRange>,
}

impl CidrGeoResolver {
    pub fn new(mut ranges: Vec<GeoRange>) -> Self {
        ranges.sort_by(|a, b| b.cidr.prefix_len().cmp(&a.cidr.prefix_len()));
        Self { ranges }
    }
}

impl GeoResolver for CidrGeoResolver {
    fn country_of(&self, ip: &IpAddr) -> Option<String> {
        self.ranges.iter().find(|r| r.cidr.contains(ip)).map(|r| r.country.clone())
    }
}

fn is_private_or_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return mapped.is_private() || mapped.is_loopback() || mapped.is_link_local();
            }
            // fc00::/7 unique local
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Scores client addresses from a persisted running score plus fresh heuristics.
///
/// Assessments are cached locally for `cache_ttl_secs`, at most
/// `cache_capacity` of them; the persisted score
/// lives in the [`KvStore`] under `ip:reputation:<ip>` and the violation
/// counter under `ip:violations:<ip>`. Every store round-trip is bounded by
/// `store_timeout_ms`. A slow or failing store never fails a check: the
/// neutral score is used and the result is flagged `degraded` and not cached.
pub struct ReputationScorer {
    store: Arc<dyn KvStore>,
    cache: TtlCache<IpAddr, IpReputation>,
    geo: Arc<dyn GeoResolver>,
    settings: ReputationSettings,
}

impl ReputationScorer {
    pub fn new(store: Arc<dyn KvStore>, settings: ReputationSettings) -> Self {
        let geo = Arc::new(CidrGeoResolver::new(settings.geo.clone()));
        Self::with_geo(store, settings, geo)
    }

    pub fn with_geo(store: Arc<dyn KvStore>, settings: ReputationSettings, geo: Arc<dyn GeoResolver>) -> Self {
        Self {
            store,
            cache: TtlCache::new(Duration::from_secs(settings.cache_ttl_secs), settings.cache_capacity),
            geo,
            settings,
        }
    }

    pub fn settings(&self) -> &ReputationSettings {
        &self.settings
    }

    pub async fn check_reputation(&self, ip: IpAddr) -> IpReputation {
        let now = Utc::now();
        if let Some(cached) = self.cache.get(&ip) {
            if !cached.is_stale(now) {
                debug!(%ip, score = cached.score, "reputation cache hit");
                return cached;
            }
        }

        let mut details = BTreeMap::new();
        let mut degraded = false;

        let base = match self.bounded("get score", self.store.get(&score_key(&ip))).await {
            Ok(Some(raw)) => match raw.parse::<i64>() {
                Ok(v) => i64::from(clamp_score(v)),
                Err(_) => {
                    warn!(%ip, value = %raw, "stored reputation is not an integer, using neutral score");
                    self.settings.neutral_score as i64
                }
            },
            Ok(None) => {
                let neutral = self.settings.neutral_score;
                let seeded = self
                    .bounded(
                        "seed score",
                        self.store.set_if_absent(
                            &score_key(&ip),
                            &neutral.to_string(),
                            Duration::from_secs(self.settings.score_ttl_secs),
                        ),
                    )
                    .await;
                match seeded {
                    Ok(true) => neutral as i64,
                    // a concurrent writer got there first
                    Ok(false) => match self.stored_score(ip).await {
                        Ok(Some(current)) => i64::from(current),
                        _ => neutral as i64,
                    },
                    Err(e) => {
                        warn!(%ip, error = %e, "could not persist neutral reputation");
                        degraded = true;
                        neutral as i64
                    }
                }
            }
            Err(e) => {
                warn!(%ip, error = %e, "reputation store degraded, using neutral score");
                degraded = true;
                self.settings.neutral_score as i64
            }
        };
        details.insert("base_score".to_string(), json!(base));
        let mut score = base;

        if self.settings.malicious_ranges.iter().any(|net| net.contains(&ip)) {
            score -= MALICIOUS_RANGE_PENALTY;
            details.insert("malicious_range".to_string(), Value::Bool(true));
        }

        if is_private_or_loopback(&ip) {
            score -= PRIVATE_PENALTY;
            details.insert("private_network".to_string(), Value::Bool(true));
        }

        let violations = match self.bounded("get violations", self.store.get(&violations_key(&ip))).await {
            Ok(raw) => raw.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0).max(0),
            Err(e) => {
                warn!(%ip, error = %e, "violation counter unavailable");
                degraded = true;
                0
            }
        };
        if violations > 0 {
            score -= (violations.saturating_mul(PER_VIOLATION_PENALTY)).min(MAX_VIOLATION_PENALTY);
            details.insert("violations".to_string(), json!(violations));
        }

        if let Some(country) = self.geo.country_of(&ip) {
            if let Some(risk) = self.settings.country_risk.get(&country) {
                let adjustment = i64::from(*risk).clamp(-MAX_COUNTRY_ADJUSTMENT, MAX_COUNTRY_ADJUSTMENT);
                score += adjustment;
                details.insert("country_adjustment".to_string(), json!(adjustment));
            }
            details.insert("country".to_string(), Value::String(country));
        }

        if degraded {
            details.insert("degraded".to_string(), Value::Bool(true));
        }

        let reputation = IpReputation::new(ip, score, details);
        if degraded {
            warn!(%ip, score = reputation.score, "degraded reputation assessment");
        } else {
            self.cache.insert(ip, reputation.clone());
        }
        reputation
    }

    /// Records a violation and lowers the persisted score by the type's penalty.
    ///
    /// Returns the new persisted score, or `None` when the store could not be
    /// updated. The cached assessment is invalidated either way.
    pub async fn report_violation(&self, ip: IpAddr, violation: &ViolationType) -> Option<u8> {
        self.cache.remove(&ip);

        let vkey = violations_key(&ip);
        match self.bounded("incr violations", self.store.incr(&vkey)).await {
            Ok(count) => {
                let window = Duration::from_secs(self.settings.violation_window_secs);
                if let Err(e) = self.bounded("expire violations", self.store.expire(&vkey, window)).await {
                    warn!(%ip, error = %e, "could not refresh violation window");
                }
                debug!(%ip, count, "violation counted");
            }
            Err(e) => warn!(%ip, error = %e, "could not count violation"),
        }

        let skey = score_key(&ip);
        let current = match self.bounded("get score", self.store.get(&skey)).await {
            Ok(raw) => raw
                .and_then(|v| v.parse::<i64>().ok())
                .map(clamp_score)
                .unwrap_or(self.settings.neutral_score),
            Err(e) => {
                warn!(%ip, error = %e, violation = %violation, "reputation store degraded, score unchanged");
                return None;
            }
        };

        let penalty = self.settings.penalty_for(violation);
        let next = current.saturating_sub(penalty);
        let floor = Duration::from_secs(self.settings.score_ttl_secs);
        let ttl = match self.bounded("ttl score", self.store.ttl(&skey)).await {
            Ok(Some(remaining)) => remaining.max(floor),
            _ => floor,
        };

        let written = self
            .bounded("set score", self.store.set_with_ttl(&skey, &next.to_string(), ttl))
            .await;
        self.cache.remove(&ip);
        match written {
            Ok(()) => {
                info!(%ip, violation = %violation, penalty, score = next, "violation reported");
                Some(next)
            }
            Err(e) => {
                warn!(%ip, error = %e, "could not persist lowered reputation");
                None
            }
        }
    }

    pub async fn whitelist_ip(&self, ip: IpAddr) -> GatewayResult<()> {
        self.force_score(ip, MAX_SCORE, "whitelisted").await
    }

    pub async fn blacklist_ip(&self, ip: IpAddr) -> GatewayResult<()> {
        self.force_score(ip, MIN_SCORE, "blacklisted").await
    }

    /// The persisted running score, without heuristics.
    pub async fn stored_score(&self, ip: IpAddr) -> GatewayResult<Option<u8>> {
        let raw = self.bounded("get score", self.store.get(&score_key(&ip))).await?;
        Ok(raw.and_then(|v| v.parse::<i64>().ok()).map(clamp_score))
    }

    pub async fn violation_count(&self, ip: IpAddr) -> GatewayResult<u64> {
        let raw = self.bounded("get violations", self.store.get(&violations_key(&ip))).await?;
        Ok(raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0))
    }

    pub fn invalidate(&self, ip: &IpAddr) {
        self.cache.remove(ip);
    }

    async fn force_score(&self, ip: IpAddr, score: u8, action: &str) -> GatewayResult<()> {
        let ttl = Duration::from_secs(self.settings.list_ttl_secs);
        let result = self
            .bounded("set score", self.store.set_with_ttl(&score_key(&ip), &score.to_string(), ttl))
            .await;
        self.cache.remove(&ip);
        result?;
        info!(%ip, score, "ip {action}");
        Ok(())
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let limit = Duration::from_millis(self.settings.store_timeout_ms);
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(GatewayError::degraded(format!("{op}: {e:#}"))),
            Err(_) => Err(GatewayError::degraded(format!("{op}: timed out after {}ms", limit.as_millis()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::reputation::RiskLevel;
    use tollgate_memory::Memory;

    fn scorer(settings: ReputationSettings) -> (Arc<Memory>, ReputationScorer) {
        let store = Arc::new(Memory::memory());
        let scorer = ReputationScorer::new(store.clone(), settings);
        (store, scorer)
    }

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn private_detection() {
        for p in ["10.0.0.1", "192.168.1.4", "127.0.0.1", "169.254.0.9", "::1", "fd00::1", "::ffff:10.1.2.3"] {
            assert!(is_private_or_loopback(&ip(p)), "{p}");
        }
        for p in ["8.8.8.8", "2001:4860::8888", "::ffff:8.8.8.8"] {
            assert!(!is_private_or_loopback(&ip(p)), "{p}");
        }
    }

    #[test]
    fn most_specific_geo_range_wins() {
        let geo = CidrGeoResolver::new(vec![
            GeoRange { cidr: "10.0.0.0/8".parse().unwrap(), country: "AA".into() },
            GeoRange { cidr: "10.1.0.0/16".parse().unwrap(), country: "BB".into() },
        ]);
        assert_eq!(geo.country_of(&ip("10.1.2.3")).as_deref(), Some("BB"));
        assert_eq!(geo.country_of(&ip("10.2.2.3")).as_deref(), Some("AA"));
        assert_eq!(geo.country_of(&ip("11.0.0.1")), None);
    }

    #[tokio::test]
    async fn unknown_public_ip_is_neutral_and_seeded() {
        let (store, scorer) = scorer(ReputationSettings::default());
        let rep = scorer.check_reputation(ip("203.0.113.7")).await;
        assert_eq!(rep.score, 50);
        assert_eq!(rep.risk, RiskLevel::Unknown);
        assert_eq!(store.get("ip:reputation:203.0.113.7").await.unwrap().as_deref(), Some("50"));
        let ttl = store.ttl("ip:reputation:203.0.113.7").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn heuristics_stack_and_clamp() {
        let mut settings = ReputationSettings::default();
        settings.malicious_ranges.push("198.51.100.0/24".parse().unwrap());
        settings.geo.push(GeoRange { cidr: "198.51.100.0/24".parse().unwrap(), country: "ZZ".into() });
        settings.country_risk.insert("ZZ".into(), -45);
        let (store, scorer) = scorer(settings);
        store.set_with_ttl("ip:violations:198.51.100.9", "3", Duration::from_secs(60)).await.unwrap();

        let rep = scorer.check_reputation(ip("198.51.100.9")).await;
        // 50 - 50 - 15 - 20 clamps to 0
        assert_eq!(rep.score, 0);
        assert_eq!(rep.risk, RiskLevel::Malicious);
        assert_eq!(rep.details["country_adjustment"], json!(-20));
        assert_eq!(rep.details["violations"], json!(3));
        assert!(!rep.is_degraded());
    }

    #[tokio::test]
    async fn out_of_range_stored_scores_are_clamped_first() {
        let mut settings = ReputationSettings::default();
        settings.malicious_ranges.push("10.9.0.0/16".parse().unwrap());
        let (store, scorer) = scorer(settings);
        store.set_with_ttl("ip:reputation:10.9.0.1", &i64::MIN.to_string(), Duration::from_secs(60)).await.unwrap();
        let rep = scorer.check_reputation(ip("10.9.0.1")).await;
        assert_eq!(rep.score, 0);
        assert_eq!(rep.details["base_score"], json!(0));

        store.set_with_ttl("ip:reputation:203.0.113.6", "500", Duration::from_secs(60)).await.unwrap();
        let rep = scorer.check_reputation(ip("203.0.113.6")).await;
        assert_eq!(rep.score, 100);
        assert_eq!(rep.details["base_score"], json!(100));
    }

    /// Reports a miss on the first score read while another writer already holds the key.
    struct LateSeedStore {
        inner: Memory,
        missed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl KvStore for LateSeedStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            if key.starts_with("ip:reputation:") && !self.missed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get(key).await
        }
        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }
        async fn incr(&self, key: &str) -> anyhow::Result<i64> {
            self.inner.incr(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
            self.inner.expire(key, ttl).await
        }
        async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
            self.inner.ttl(key).await
        }
        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn seeding_never_overwrites_a_lowered_score() {
        let target = ip("203.0.113.8");
        let inner = Memory::memory();
        inner.set_with_ttl(&score_key(&target), "15", Duration::from_secs(60)).await.unwrap();
        let store = Arc::new(LateSeedStore { inner, missed: std::sync::atomic::AtomicBool::new(false) });
        let scorer = ReputationScorer::new(store.clone(), ReputationSettings::default());

        let rep = scorer.check_reputation(target).await;
        assert_eq!(rep.score, 15);
        assert!(!rep.is_degraded());
        assert_eq!(store.inner.get(&score_key(&target)).await.unwrap().as_deref(), Some("15"));
    }

    #[tokio::test]
    async fn private_ip_is_penalized() {
        let (_, scorer) = scorer(ReputationSettings::default());
        let rep = scorer.check_reputation(ip("192.168.0.10")).await;
        assert_eq!(rep.score, 40);
        assert_eq!(rep.risk, RiskLevel::Suspicious);
    }

    #[tokio::test]
    async fn violation_penalty_is_capped() {
        let (store, scorer) = scorer(ReputationSettings::default());
        store.set_with_ttl("ip:reputation:203.0.113.1", "90", Duration::from_secs(60)).await.unwrap();
        store.set_with_ttl("ip:violations:203.0.113.1", "20", Duration::from_secs(60)).await.unwrap();
        let rep = scorer.check_reputation(ip("203.0.113.1")).await;
        assert_eq!(rep.score, 50);
    }

    #[tokio::test]
    async fn results_are_cached_until_invalidated() {
        let (store, scorer) = scorer(ReputationSettings::default());
        let target = ip("203.0.113.2");
        assert_eq!(scorer.check_reputation(target).await.score, 50);
        store.set_with_ttl(&score_key(&target), "95", Duration::from_secs(60)).await.unwrap();
        assert_eq!(scorer.check_reputation(target).await.score, 50);
        scorer.invalidate(&target);
        assert_eq!(scorer.check_reputation(target).await.score, 95);
    }

    #[tokio::test]
    async fn cache_holds_at_most_capacity_assessments() {
        let settings = ReputationSettings { cache_capacity: 32, ..ReputationSettings::default() };
        let (_, scorer) = scorer(settings);
        for i in 0..1_000u32 {
            let addr = IpAddr::from(std::net::Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, (i >> 16) as u16, i as u16));
            scorer.check_reputation(addr).await;
        }
        assert!(scorer.cache.len() <= 32);
    }

    #[tokio::test]
    async fn whitelist_and_blacklist_force_scores() {
        let (store, scorer) = scorer(ReputationSettings::default());
        let target = ip("203.0.113.3");
        scorer.check_reputation(target).await;
        scorer.blacklist_ip(target).await.unwrap();
        let rep = scorer.check_reputation(target).await;
        assert_eq!(rep.score, 0);
        assert_eq!(rep.risk, RiskLevel::Malicious);
        let ttl = store.ttl(&score_key(&target)).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(29 * 24 * 3600));

        scorer.whitelist_ip(target).await.unwrap();
        assert_eq!(scorer.check_reputation(target).await.score, 100);
        assert_eq!(scorer.stored_score(target).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn report_violation_applies_penalties() {
        let (store, scorer) = scorer(ReputationSettings::default());
        let target = ip("203.0.113.4");
        assert_eq!(scorer.report_violation(target, &ViolationType::Xss).await, Some(35));
        assert_eq!(scorer.report_violation(target, &"unknown_thing".parse().unwrap()).await, Some(25));
        assert_eq!(scorer.report_violation(target, &ViolationType::CommandInjection).await, Some(0));
        assert_eq!(scorer.violation_count(target).await.unwrap(), 3);
        assert!(store.ttl(&violations_key(&target)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn report_violation_keeps_longer_ttl() {
        let (store, scorer) = scorer(ReputationSettings::default());
        let target = ip("203.0.113.5");
        scorer.whitelist_ip(target).await.unwrap();
        assert_eq!(scorer.report_violation(target, &ViolationType::BruteForce).await, Some(85));
        let ttl = store.ttl(&score_key(&target)).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(7 * 24 * 3600));
    }
}
