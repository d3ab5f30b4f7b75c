use anyhow::anyhow;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tollgate_core::{ReputationScorer, ReputationSettings, RiskLevel, ViolationType, score_key};
use tollgate_memory::{KvStore, Memory};

/// Store that never answers in time.
struct SlowStore {
    calls: AtomicUsize,
}

#[async_trait]
impl KvStore for SlowStore {
    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Some("99".into()))
    }
    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<bool> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(true)
    }
    async fn incr(&self, _key: &str) -> anyhow::Result<i64> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(1)
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> anyhow::Result<bool> {
        Ok(true)
    }
    async fn ttl(&self, _key: &str) -> anyhow::Result<Option<Duration>> {
        Ok(None)
    }
    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Store whose backend is gone.
struct BrokenStore;

#[async_trait]
impl KvStore for BrokenStore {
    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        Err(anyhow!("connection refused"))
    }
    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
        Err(anyhow!("connection refused"))
    }
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<bool> {
        Err(anyhow!("connection refused"))
    }
    async fn incr(&self, _key: &str) -> anyhow::Result<i64> {
        Err(anyhow!("connection refused"))
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> anyhow::Result<bool> {
        Err(anyhow!("connection refused"))
    }
    async fn ttl(&self, _key: &str) -> anyhow::Result<Option<Duration>> {
        Err(anyhow!("connection refused"))
    }
    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        Err(anyhow!("connection refused"))
    }
}

fn ip(raw: &str) -> IpAddr {
    raw.parse().unwrap()
}

fn memory_scorer() -> (Arc<Memory>, ReputationScorer) {
    let store = Arc::new(Memory::memory());
    (store.clone(), ReputationScorer::new(store, ReputationSettings::default()))
}

#[tokio::test]
async fn two_sql_injections_cost_forty_points() {
    let (store, scorer) = memory_scorer();
    let target = ip("203.0.113.20");
    store.set_with_ttl(&score_key(&target), "70", Duration::from_secs(3600)).await.unwrap();

    scorer.report_violation(target, &ViolationType::SqlInjection).await;
    let after = scorer.report_violation(target, &ViolationType::SqlInjection).await;
    assert_eq!(after, Some(30));
    assert_eq!(scorer.stored_score(target).await.unwrap(), Some(30));
    assert_eq!(scorer.violation_count(target).await.unwrap(), 2);

    // two violations also weigh on the live assessment: 30 - 10
    let rep = scorer.check_reputation(target).await;
    assert_eq!(rep.score, 20);
    assert_eq!(rep.risk, RiskLevel::Malicious);
}

#[tokio::test]
async fn sql_injections_clamp_at_zero() {
    let (store, scorer) = memory_scorer();
    let target = ip("203.0.113.21");
    store.set_with_ttl(&score_key(&target), "25", Duration::from_secs(3600)).await.unwrap();
    scorer.report_violation(target, &ViolationType::SqlInjection).await;
    assert_eq!(scorer.report_violation(target, &ViolationType::SqlInjection).await, Some(0));
}

#[tokio::test]
async fn command_injection_costs_exactly_thirty() {
    let (store, scorer) = memory_scorer();
    let target = ip("203.0.113.22");
    store.set_with_ttl(&score_key(&target), "85", Duration::from_secs(3600)).await.unwrap();
    assert_eq!(scorer.report_violation(target, &ViolationType::CommandInjection).await, Some(55));

    let low = ip("203.0.113.23");
    store.set_with_ttl(&score_key(&low), "12", Duration::from_secs(3600)).await.unwrap();
    assert_eq!(scorer.report_violation(low, &ViolationType::CommandInjection).await, Some(0));
}

#[tokio::test]
async fn report_invalidates_cached_assessment() {
    let (_, scorer) = memory_scorer();
    let target = ip("203.0.113.24");
    assert_eq!(scorer.check_reputation(target).await.score, 50);
    scorer.report_violation(target, &ViolationType::PathTraversal).await;
    // 50 - 25 stored, minus 5 for the single violation
    assert_eq!(scorer.check_reputation(target).await.score, 20);
}

#[tokio::test]
async fn slow_store_falls_back_to_neutral_within_bound() {
    let store = Arc::new(SlowStore { calls: AtomicUsize::new(0) });
    let scorer = ReputationScorer::new(store.clone(), ReputationSettings::default());

    let started = Instant::now();
    let rep = scorer.check_reputation(ip("203.0.113.30")).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(rep.score, 50);
    assert!(rep.is_degraded());

    // degraded results are not cached
    scorer.check_reputation(ip("203.0.113.30")).await;
    assert_eq!(store.calls.load(Ordering::SeqCst), 4);

    assert_eq!(scorer.report_violation(ip("203.0.113.30"), &ViolationType::Ddos).await, None);
}

#[tokio::test]
async fn broken_store_never_fails_a_check() {
    let scorer = ReputationScorer::new(Arc::new(BrokenStore), ReputationSettings::default());
    let rep = scorer.check_reputation(ip("10.20.30.40")).await;
    assert_eq!(rep.score, 40);
    assert!(rep.is_degraded());
    assert_eq!(scorer.report_violation(ip("10.20.30.40"), &ViolationType::Xss).await, None);

    let err = scorer.whitelist_ip(ip("10.20.30.40")).await.unwrap_err();
    assert_eq!(err.code(), "dependency_degraded");
}

#[tokio::test]
async fn lmdb_store_keeps_scores_across_scorers() {
    let dir = tempfile::tempdir().unwrap();
    let target = ip("203.0.113.40");
    {
        let store = Arc::new(Memory::open_lmdb(dir.path()).unwrap());
        let scorer = ReputationScorer::new(store, ReputationSettings::default());
        scorer.blacklist_ip(target).await.unwrap();
    }
    let store = Arc::new(Memory::open_lmdb(dir.path()).unwrap());
    let scorer = ReputationScorer::new(store, ReputationSettings::default());
    let rep = scorer.check_reputation(target).await;
    assert_eq!(rep.score, 0);
    assert_eq!(rep.risk, RiskLevel::Malicious);
}

#[tokio::test]
async fn concurrent_checks_stay_in_range() {
    let (_, scorer) = memory_scorer();
    let scorer = Arc::new(scorer);
    let mut handles = Vec::new();
    for i in 0..32u8 {
        let scorer = scorer.clone();
        handles.push(tokio::spawn(async move {
            let target: IpAddr = format!("203.0.113.{}", i % 4).parse().unwrap();
            if i % 3 == 0 {
                scorer.report_violation(target, &ViolationType::BruteForce).await;
            }
            scorer.check_reputation(target).await
        }));
    }
    for handle in handles {
        let rep = handle.await.unwrap();
        assert!(rep.score <= 100);
        assert_eq!(rep.risk, RiskLevel::from_score(rep.score));
    }
}
