//! End-to-end pipeline tests against a real on-disk SQLite database.
//!
//! Strategies are scripted fakes; everything below them (orchestrator,
//! cache, credential rotation, artifact store) is the real thing.

use async_trait::async_trait;
use manifest_fix::ArtifactStore;
use resolvers::{CredentialPool, ResolveMethod, ResolverError, StrategyResolver};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vod_relay::database::repositories::{CredentialRepository, ParseCacheRepository};
use vod_relay::database::{DbPool, WritePool, init_pool, init_write_pool, run_migrations};
use vod_relay::orchestrator::{Orchestrator, ResolveError};

struct TestDb {
    _dir: TempDir,
    read: DbPool,
    write: WritePool,
}

/// In-memory SQLite gives each pool its own database, so tests use a file.
async fn test_db() -> TestDb {
    let dir = TempDir::new().unwrap();
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("test.db").to_string_lossy()
    );
    let read = init_pool(&url).await.unwrap();
    let write = init_write_pool(&url).await.unwrap();
    run_migrations(&read).await.unwrap();
    TestDb {
        _dir: dir,
        read,
        write,
    }
}

struct FakeStrategy {
    method: ResolveMethod,
    delay_ms: u64,
    manifest: Option<String>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StrategyResolver for FakeStrategy {
    fn method(&self) -> ResolveMethod {
        self.method
    }

    async fn resolve(
        &self,
        _video_url: &str,
        token: &CancellationToken,
    ) -> Result<String, ResolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        if token.is_cancelled() {
            return Err(ResolverError::Cancelled);
        }
        self.manifest.clone().ok_or(ResolverError::NoManifestFound)
    }
}

fn strategy(
    method: ResolveMethod,
    delay_ms: u64,
    manifest: Option<&str>,
) -> (Arc<dyn StrategyResolver>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (
        Arc::new(FakeStrategy {
            method,
            delay_ms,
            manifest: manifest.map(str::to_owned),
            calls: calls.clone(),
        }),
        calls,
    )
}

fn orchestrator(
    db: &TestDb,
    artifact_dir: &TempDir,
    strategies: Vec<Arc<dyn StrategyResolver>>,
) -> Orchestrator {
    let cache = ParseCacheRepository::new(db.read.clone(), db.write.clone(), 7200);
    let artifacts = Arc::new(
        ArtifactStore::new(
            reqwest::Client::new(),
            artifact_dir.path(),
            "http://localhost:8000/api/v1/m3u8",
        )
        .unwrap(),
    );
    Orchestrator::new(strategies, cache, artifacts, Duration::from_millis(100))
}

/// Seed an artifact so store_manifest never needs the network. The URL
/// carries an embedded cache hash that becomes the content id.
fn seeded_manifest_url(artifact_dir: &TempDir, hash32: &str) -> String {
    let file = format!("manifest_{}_20250101000000.m3u8", &hash32[..16]);
    std::fs::write(artifact_dir.path().join(file), "#EXTM3U\n").unwrap();
    format!("https://cache.example.com/Cache/qq/{hash32}.m3u8")
}

#[tokio::test]
async fn migrations_create_the_expected_tables() {
    let db = test_db().await;
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
    )
    .fetch_all(&db.read)
    .await
    .unwrap();
    for expected in ["credentials", "pool_state", "parse_cache"] {
        assert!(tables.iter().any(|t| t == expected), "missing {expected}");
    }
}

#[tokio::test]
async fn resolution_is_cached_and_second_call_skips_strategies() {
    let db = test_db().await;
    let dir = TempDir::new().unwrap();
    let manifest = seeded_manifest_url(&dir, "0123456789abcdef0123456789abcdef");
    let (s1, calls) = strategy(ResolveMethod::PaidKey, 5, Some(&manifest));
    let orch = orchestrator(&db, &dir, vec![s1]);

    let first = orch.resolve("https://video.example.com/v/1").await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.method, ResolveMethod::PaidKey);
    assert_eq!(
        first.manifest_ref,
        "http://localhost:8000/api/v1/m3u8/0123456789abcdef"
    );

    let second = orch.resolve("https://video.example.com/v/1").await.unwrap();
    assert!(second.cached);
    assert_eq!(second.manifest_ref, first.manifest_ref);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn trailing_slash_variants_share_one_cache_entry() {
    let db = test_db().await;
    let dir = TempDir::new().unwrap();
    let manifest = seeded_manifest_url(&dir, "aaaa567890abcdefaaaa567890abcdef");
    let (s1, calls) = strategy(ResolveMethod::PaidKey, 5, Some(&manifest));
    let orch = orchestrator(&db, &dir, vec![s1]);

    orch.resolve("https://video.example.com/v/2").await.unwrap();
    let hit = orch.resolve("https://video.example.com/v/2/").await.unwrap();
    assert!(hit.cached);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_url_fails_without_touching_strategies() {
    let db = test_db().await;
    let dir = TempDir::new().unwrap();
    let (s1, calls) = strategy(ResolveMethod::PaidKey, 5, Some("https://m.example.com/x.m3u8"));
    let orch = orchestrator(&db, &dir, vec![s1]);

    let err = orch.resolve("definitely not a url").await;
    assert!(matches!(err, Err(ResolveError::InvalidUrl(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn slow_first_strategy_loses_to_second_and_loser_writes_nothing() {
    let db = test_db().await;
    let dir = TempDir::new().unwrap();
    let winner = seeded_manifest_url(&dir, "bbbb567890abcdefbbbb567890abcdef");
    let (s1, _) = strategy(ResolveMethod::PaidKey, 500, Some("https://slow.example.com/x.m3u8"));
    let (s2, _) = strategy(ResolveMethod::SharedParam, 20, Some(&winner));
    let orch = orchestrator(&db, &dir, vec![s1, s2]);

    let resolution = orch.resolve("https://video.example.com/v/3").await.unwrap();
    assert_eq!(resolution.method, ResolveMethod::SharedParam);

    // Whatever the slow loser produces after cancellation, the cached entry
    // is the winner's.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let hit = orch.resolve("https://video.example.com/v/3").await.unwrap();
    assert!(hit.cached);
    assert_eq!(hit.manifest_ref, resolution.manifest_ref);
    assert_eq!(hit.method, ResolveMethod::SharedParam);
}

#[tokio::test]
async fn all_strategies_failing_is_exhaustion() {
    let db = test_db().await;
    let dir = TempDir::new().unwrap();
    let (s1, _) = strategy(ResolveMethod::PaidKey, 5, None);
    let (s2, _) = strategy(ResolveMethod::SharedParam, 5, None);
    let (s3, _) = strategy(ResolveMethod::Derived, 5, None);
    let orch = orchestrator(&db, &dir, vec![s1, s2, s3]);

    let err = orch.resolve("https://video.example.com/v/4").await;
    assert!(matches!(err, Err(ResolveError::Exhausted)));
}

#[tokio::test]
async fn credential_rotation_wraps_and_skips_expired() {
    let db = test_db().await;
    let repo = CredentialRepository::new(db.read.clone(), db.write.clone());

    repo.insert("u1", "k1", None, None).await.unwrap();
    repo.insert("u2", "k2", None, None).await.unwrap();
    repo.insert("u3", "k3", Some("backup"), None).await.unwrap();
    // Already expired; rotation must never return it.
    repo.insert("dead", "k0", None, Some(chrono::Utc::now() - chrono::Duration::hours(1)))
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let credential = repo.next().await.unwrap();
        seen.push(credential.client_id);
    }
    assert_eq!(seen, vec!["u1", "u2", "u3", "u1"]);
    assert!(!seen.contains(&"dead".to_string()));

    assert_eq!(repo.active_count().await.unwrap(), 3);
    assert_eq!(repo.deactivate_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn empty_credential_pool_yields_none() {
    let db = test_db().await;
    let repo = CredentialRepository::new(db.read.clone(), db.write.clone());
    assert!(repo.next().await.is_none());
}

#[tokio::test]
async fn concurrent_rotation_hands_out_distinct_credentials() {
    let db = test_db().await;
    let repo = Arc::new(CredentialRepository::new(db.read.clone(), db.write.clone()));
    for i in 0..8 {
        repo.insert(&format!("u{i}"), &format!("k{i}"), None, None)
            .await
            .unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let repo = repo.clone();
        tasks.spawn(async move { repo.next().await.unwrap().client_id });
    }
    let mut ids = Vec::new();
    while let Some(id) = tasks.join_next().await {
        ids.push(id.unwrap());
    }
    ids.sort();
    ids.dedup();
    // One full rotation: eight callers, eight distinct credentials.
    assert_eq!(ids.len(), 8);
}

#[tokio::test]
async fn cache_replacement_resets_hit_count() {
    let db = test_db().await;
    let cache = ParseCacheRepository::new(db.read.clone(), db.write.clone(), 7200);

    cache
        .put("https://v.example.com/1", "http://localhost/a.m3u8", "paid_key")
        .await
        .unwrap();
    cache.get("https://v.example.com/1").await.unwrap();
    let entry = cache.get("https://v.example.com/1").await.unwrap().unwrap();
    assert_eq!(entry.hit_count, 2);

    cache
        .put("https://v.example.com/1", "http://localhost/b.m3u8", "derived")
        .await
        .unwrap();
    let replaced = cache.get("https://v.example.com/1").await.unwrap().unwrap();
    assert_eq!(replaced.manifest_ref, "http://localhost/b.m3u8");
    assert_eq!(replaced.method, "derived");
    assert_eq!(replaced.hit_count, 1);
}

#[tokio::test]
async fn expired_cache_entries_are_misses_and_purgeable() {
    let db = test_db().await;
    // Zero TTL: everything is born expired.
    let cache = ParseCacheRepository::new(db.read.clone(), db.write.clone(), 0);

    cache
        .put("https://v.example.com/2", "http://localhost/a.m3u8", "paid_key")
        .await
        .unwrap();
    assert!(cache.get("https://v.example.com/2").await.unwrap().is_none());
    assert_eq!(cache.purge_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn cache_entry_lifetime_is_fixed_at_write_time() {
    let db = test_db().await;
    let short = ParseCacheRepository::new(db.read.clone(), db.write.clone(), 0);
    let long = ParseCacheRepository::new(db.read.clone(), db.write.clone(), 7200);

    // Born expired; a reader configured with a longer TTL cannot revive it.
    short
        .put("https://v.example.com/3", "http://localhost/a.m3u8", "paid_key")
        .await
        .unwrap();
    assert!(long.get("https://v.example.com/3").await.unwrap().is_none());

    // Written with a long lifetime; a zero-TTL reader cannot expire it early.
    long.put("https://v.example.com/4", "http://localhost/b.m3u8", "derived")
        .await
        .unwrap();
    let entry = short.get("https://v.example.com/4").await.unwrap().unwrap();
    assert_eq!(entry.expires_at, entry.created_at + 7200 * 1000);
    assert_eq!(short.purge_expired().await.unwrap(), 1);
}
