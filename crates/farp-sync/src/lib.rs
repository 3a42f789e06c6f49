//! Aggregator and scheduler: per-user sync passes over all configured
//! sources, due-user sweeps, and the optional in-process cron driver.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, Utc};
use farp_adapters::{
    AdapterContext, AdapterError, FetchOutcome, SourceAdapter, SourceClient, SourceClientConfig,
};
use farp_core::{stats, sync_cadence, FacultyProfile, Source, StatisticsSnapshot, SyncSchedule};
use farp_store::{PortfolioStore, StoreError};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "farp-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on each individual adapter call.
    pub adapter_timeout: Duration,
    /// Margin on top of the adapter timeout for the whole pass (adapters run
    /// concurrently, so the pass bound is not additive).
    pub sync_margin: Duration,
    /// Pause between users within one sweep.
    pub sweep_delay: Duration,
    pub scheduler_enabled: bool,
    pub sweep_cron: String,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(20),
            sync_margin: Duration::from_secs(5),
            sweep_delay: Duration::from_secs(2),
            scheduler_enabled: false,
            sweep_cron: "0 0 2 * * Sun".to_string(),
            user_agent: "farp-sync/0.1".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            adapter_timeout: env_secs("FARP_ADAPTER_TIMEOUT_SECS")
                .unwrap_or(defaults.adapter_timeout),
            sync_margin: env_secs("FARP_SYNC_MARGIN_SECS").unwrap_or(defaults.sync_margin),
            sweep_delay: env_millis("FARP_SWEEP_DELAY_MS").unwrap_or(defaults.sweep_delay),
            scheduler_enabled: std::env::var("FARP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sweep_cron: std::env::var("FARP_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            user_agent: std::env::var("FARP_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

/// What initiated a sync pass. Scheduled passes anchor the next due time to
/// the original due time; manual and setup passes anchor to the trigger time,
/// so a manual sync absorbs the next scheduled one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Scheduled { due_at: DateTime<Utc> },
    Manual,
    InitialSetup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Updated { records: usize },
    Skipped,
    Failed { retryable: bool, reason: String },
}

/// Per-source breakdown of one sync pass. Partial success is the normal,
/// non-error case.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub sources: BTreeMap<Source, SourceStatus>,
    pub records_written: usize,
    pub snapshot: StatisticsSnapshot,
}

impl SyncOutcome {
    fn summary_line(&self) -> String {
        let mut updated = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        for status in self.sources.values() {
            match status {
                SourceStatus::Updated { .. } => updated += 1,
                SourceStatus::Skipped => skipped += 1,
                SourceStatus::Failed { .. } => failed += 1,
            }
        }
        format!("updated={updated} skipped={skipped} failed={failed}")
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("faculty profile not found for user {0}")]
    ProfileNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("all configured sources failed for user {user_id}")]
    AllSourcesFailed { user_id: String, retryable: bool },
    #[error("sync pass timed out for user {0}")]
    Timeout(String),
}

impl SyncError {
    pub fn retryable(&self) -> bool {
        match self {
            SyncError::ProfileNotFound(_) => false,
            SyncError::Store(_) | SyncError::Timeout(_) => true,
            SyncError::AllSourcesFailed { retryable, .. } => *retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SweepSummary {
    pub started_at: DateTime<Utc>,
    pub due: usize,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerHealth {
    pub status: &'static str,
    pub enabled_users: usize,
    pub due_users: usize,
    pub checked_at: DateTime<Utc>,
}

/// Aggregator + scheduler over an injected store and adapter set.
pub struct SyncService {
    store: PortfolioStore,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    client: SourceClient,
    config: SyncConfig,
    in_flight: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SyncService {
    pub fn new(
        store: PortfolioStore,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        config: SyncConfig,
    ) -> anyhow::Result<Self> {
        let client = SourceClient::new(SourceClientConfig {
            timeout: config.adapter_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .context("building source client")?;
        Ok(Self {
            store,
            adapters,
            client,
            config,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &PortfolioStore {
        &self.store
    }

    /// Single-flight guard: at most one in-flight pass per user, so manual
    /// and scheduled triggers for the same user are mutually exclusive.
    async fn user_guard(&self, user_id: &str) -> Arc<Semaphore> {
        let mut map = self.in_flight.lock().await;
        map.entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Run one full sync pass for one user: fetch all configured sources
    /// concurrently, merge records, recompute statistics, advance the
    /// schedule.
    pub async fn sync_user(
        &self,
        user_id: &str,
        trigger: SyncTrigger,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        let guard = self.user_guard(user_id).await;
        let _permit = guard.acquire().await.expect("semaphore not closed");

        let pass_bound = self.config.adapter_timeout + self.config.sync_margin;
        match tokio::time::timeout(pass_bound, self.run_pass(user_id, trigger, now)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(user_id.to_string())),
        }
    }

    async fn run_pass(
        &self,
        user_id: &str,
        trigger: SyncTrigger,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, SyncError> {
        let profile = self
            .store
            .profile(user_id)
            .await?
            .ok_or_else(|| SyncError::ProfileNotFound(user_id.to_string()))?;

        let run_id = Uuid::new_v4();
        let ctx = AdapterContext {
            run_id,
            fetched_at: now,
        };
        info!(user_id, %run_id, "starting sync pass");

        let fetches = self.adapters.iter().map(|adapter| {
            let external_id = profile
                .external_ids
                .for_source(adapter.source())
                .map(str::to_string);
            async move {
                let source = adapter.source();
                let outcome = match tokio::time::timeout(
                    self.config.adapter_timeout,
                    adapter.fetch(&self.client, &ctx, external_id.as_deref()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::Transient(format!("{source} fetch timed out"))),
                };
                (source, outcome)
            }
        });
        // Join barrier: statistics must never run against a partially-updated
        // record set from the same pass.
        let results = join_all(fetches).await;

        let mut sources = BTreeMap::new();
        let mut records_written = 0usize;
        for (source, outcome) in results {
            match outcome {
                Ok(FetchOutcome::Skipped) => {
                    sources.insert(source, SourceStatus::Skipped);
                }
                Ok(FetchOutcome::Fetched(records)) => {
                    let count = records.len();
                    for fetched in records {
                        let record = fetched.into_source_record(user_id, source, now);
                        self.store.put_record(&record).await?;
                    }
                    records_written += count;
                    sources.insert(source, SourceStatus::Updated { records: count });
                }
                Err(err) => {
                    warn!(
                        user_id,
                        source = %source,
                        error = %err,
                        "source fetch failed; cached records left untouched"
                    );
                    sources.insert(
                        source,
                        SourceStatus::Failed {
                            retryable: err.retryable(),
                            reason: err.to_string(),
                        },
                    );
                }
            }
        }

        let configured = sources
            .values()
            .filter(|s| !matches!(s, SourceStatus::Skipped))
            .count();
        let failed = sources
            .values()
            .filter(|s| matches!(s, SourceStatus::Failed { .. }))
            .count();
        if configured > 0 && failed == configured {
            // Complete loss of every configured source is the one adapter
            // failure that escalates to a sync-level error; retryability
            // follows whether any source is worth retrying.
            let retryable = sources
                .values()
                .any(|s| matches!(s, SourceStatus::Failed { retryable: true, .. }));
            return Err(SyncError::AllSourcesFailed {
                user_id: user_id.to_string(),
                retryable,
            });
        }

        let records = self.store.records(user_id).await?;
        let snapshot = stats::compute_snapshot(&records, now.year());
        self.store.put_stats(user_id, &snapshot).await?;

        let mut profile = profile;
        profile.last_sync_at = Some(now);
        profile.updated_at = now;
        self.store.put_profile(&profile).await?;

        let outcome = SyncOutcome {
            run_id,
            user_id: user_id.to_string(),
            started_at: now,
            sources,
            records_written,
            snapshot,
        };
        self.advance_schedule(&profile, trigger, &outcome, now).await?;

        info!(user_id, %run_id, records_written, "sync pass complete");
        Ok(outcome)
    }

    async fn advance_schedule(
        &self,
        profile: &FacultyProfile,
        trigger: SyncTrigger,
        outcome: &SyncOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Scheduled passes advance from the original due time, not from
        // completion time, so slow runs never drift the cadence.
        let anchor = match trigger {
            SyncTrigger::Scheduled { due_at } => due_at,
            SyncTrigger::Manual | SyncTrigger::InitialSetup => now,
        };

        let mut schedule = match self.store.schedule(&profile.user_id).await? {
            Some(schedule) => schedule,
            None => {
                if !profile.external_ids.any() {
                    return Ok(());
                }
                SyncSchedule {
                    user_id: profile.user_id.clone(),
                    enabled: true,
                    next_due_at: anchor,
                    last_run_at: None,
                    last_outcome: None,
                }
            }
        };
        schedule.next_due_at = anchor + sync_cadence();
        schedule.last_run_at = Some(now);
        schedule.last_outcome = Some(outcome.summary_line());
        self.store.put_schedule(&schedule).await
    }

    /// Process every due user, strictly sequentially, with a pause between
    /// users. One user's failure never aborts the sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary, StoreError> {
        let schedules = self.store.schedules().await?;
        let due: Vec<SyncSchedule> = schedules
            .into_iter()
            .filter(|s| s.enabled && s.next_due_at <= now)
            .collect();
        info!(due = due.len(), "starting due-user sweep");

        let mut summary = SweepSummary {
            started_at: now,
            due: due.len(),
            synced: 0,
            failed: 0,
        };
        for (index, schedule) in due.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.sweep_delay).await;
            }
            let trigger = SyncTrigger::Scheduled {
                due_at: schedule.next_due_at,
            };
            match self.sync_user(&schedule.user_id, trigger, now).await {
                Ok(_) => summary.synced += 1,
                Err(err) => {
                    error!(
                        user_id = %schedule.user_id,
                        error = %err,
                        "scheduled sync failed; continuing sweep"
                    );
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    pub async fn scheduler_health(&self, now: DateTime<Utc>) -> Result<SchedulerHealth, StoreError> {
        let schedules = self.store.schedules().await?;
        Ok(SchedulerHealth {
            status: "ok",
            enabled_users: schedules.iter().filter(|s| s.enabled).count(),
            due_users: schedules
                .iter()
                .filter(|s| s.enabled && s.next_due_at <= now)
                .count(),
            checked_at: now,
        })
    }
}

/// Optional in-process driver for the sweep. The sweep itself stays an
/// ordinary method, so any external timer can drive it instead.
pub async fn build_cron_driver(service: Arc<SyncService>) -> anyhow::Result<Option<JobScheduler>> {
    if !service.config.scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating cron driver")?;
    let cron = service.config.sweep_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let service = service.clone();
        Box::pin(async move {
            match service.sweep(Utc::now()).await {
                Ok(summary) => info!(
                    due = summary.due,
                    synced = summary.synced,
                    failed = summary.failed,
                    "scheduled sweep complete"
                ),
                Err(err) => error!(error = %err, "scheduled sweep failed"),
            }
        })
    })
    .with_context(|| format!("creating sweep job for cron {cron}"))?;
    scheduler.add(job).await.context("adding sweep job")?;
    Ok(Some(scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use farp_adapters::FetchedRecord;
    use farp_core::{ExternalIds, RecordKind};
    use farp_store::{MemoryStore, RecordStore};
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone)]
    enum Behavior {
        Records(Vec<FetchedRecord>),
        Fail { retryable: bool },
        Hang,
    }

    struct ScriptedAdapter {
        source: Source,
        behavior: StdMutex<Behavior>,
    }

    impl ScriptedAdapter {
        fn new(source: Source, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                source,
                behavior: StdMutex::new(behavior),
            })
        }

        fn set(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source(&self) -> Source {
            self.source
        }

        async fn fetch(
            &self,
            _client: &SourceClient,
            _ctx: &AdapterContext,
            external_id: Option<&str>,
        ) -> Result<FetchOutcome, AdapterError> {
            if external_id.is_none() {
                return Ok(FetchOutcome::Skipped);
            }
            let behavior = self.behavior.lock().unwrap().clone();
            match behavior {
                Behavior::Records(records) => Ok(FetchOutcome::Fetched(records)),
                Behavior::Fail { retryable } => Err(if retryable {
                    AdapterError::Transient("scripted transient failure".to_string())
                } else {
                    AdapterError::Permanent("scripted permanent failure".to_string())
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    unreachable!("hang behavior should always be timed out")
                }
            }
        }
    }

    /// Store wrapper that fails writes under one key prefix.
    struct FailingPuts {
        inner: MemoryStore,
        fail_prefix: &'static str,
    }

    #[async_trait]
    impl RecordStore for FailingPuts {
        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
            if key.starts_with(self.fail_prefix) {
                return Err(StoreError::Unavailable("injected write failure".to_string()));
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
            self.inner.scan_prefix(prefix).await
        }
    }

    fn fetched(stable_key: &str, citations: u32, year: i32) -> FetchedRecord {
        FetchedRecord {
            stable_key: stable_key.to_string(),
            title: format!("Title {stable_key}"),
            year,
            citations,
            kind: RecordKind::Journal,
            venue_scope: None,
            venue: Some("Sample Journal".to_string()),
            authors: vec!["Faculty Name".to_string()],
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            adapter_timeout: Duration::from_millis(100),
            sync_margin: Duration::from_secs(5),
            sweep_delay: Duration::ZERO,
            ..SyncConfig::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 5, 9, 0, 0).single().unwrap()
    }

    fn profile(user_id: &str, ids: ExternalIds) -> FacultyProfile {
        FacultyProfile {
            user_id: user_id.to_string(),
            faculty_id: "100200".to_string(),
            name: "Dr. Example".to_string(),
            email: "100200@example.edu".to_string(),
            department: Some("CSE".to_string()),
            designation: None,
            research_area: None,
            external_ids: ids,
            profile_setup_complete: true,
            created_at: now() - chrono::Duration::days(30),
            updated_at: now() - chrono::Duration::days(30),
            last_sync_at: None,
        }
    }

    fn scholar_ids() -> ExternalIds {
        ExternalIds {
            google_scholar_id: Some("gs-user-1".to_string()),
            ..ExternalIds::default()
        }
    }

    async fn service_with(
        store: Arc<dyn RecordStore>,
        adapters: Vec<Arc<ScriptedAdapter>>,
    ) -> SyncService {
        let adapters = adapters
            .into_iter()
            .map(|a| a as Arc<dyn SourceAdapter>)
            .collect();
        SyncService::new(PortfolioStore::new(store), adapters, test_config()).expect("service")
    }

    #[tokio::test]
    async fn sync_writes_records_snapshot_and_bookkeeping() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![
                fetched("k1", 10, 2026),
                fetched("k2", 5, 2025),
                fetched("k3", 3, 2024),
            ]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();

        let outcome = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();

        assert_eq!(outcome.records_written, 3);
        assert_eq!(outcome.snapshot.publications.total, 3);
        assert_eq!(outcome.snapshot.citations.total, 18);
        assert_eq!(outcome.snapshot.citations.h_index, 2);
        assert_eq!(outcome.snapshot.citations.i10_index, 1);
        assert_eq!(
            outcome.sources.get(&Source::GoogleScholar),
            Some(&SourceStatus::Updated { records: 3 })
        );

        let stored = service.store().stats("u1").await.unwrap();
        assert_eq!(stored, Some(outcome.snapshot));
        let updated = service.store().profile("u1").await.unwrap().unwrap();
        assert_eq!(updated.last_sync_at, Some(now()));
        let schedule = service.store().schedule("u1").await.unwrap().unwrap();
        assert_eq!(schedule.next_due_at, now() + sync_cadence());
    }

    #[tokio::test]
    async fn sync_twice_is_idempotent() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 10, 2026), fetched("k2", 5, 2025)]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();

        let first = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();
        let second = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();

        assert_eq!(first.snapshot, second.snapshot);
        assert_eq!(service.store().records("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refetch_overwrites_in_place_by_stable_key() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![
                fetched("k1", 10, 2026),
                fetched("k2", 5, 2025),
                fetched("k3", 3, 2024),
            ]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter.clone()]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();
        service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();

        adapter.set(Behavior::Records(vec![
            fetched("k1", 12, 2026),
            fetched("k2", 5, 2025),
            fetched("k3", 3, 2024),
        ]));
        let outcome = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();

        assert_eq!(outcome.snapshot.publications.total, 3);
        assert_eq!(outcome.snapshot.citations.total, 20);
        assert_eq!(outcome.snapshot.citations.h_index, 2);
        assert_eq!(service.store().records("u1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn partial_failure_keeps_stale_records_and_reports_success() {
        let scholar = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 10, 2026), fetched("k2", 5, 2025)]),
        );
        let scopus = ScriptedAdapter::new(
            Source::Scopus,
            Behavior::Records(vec![fetched("s1", 7, 2026)]),
        );
        let ids = ExternalIds {
            google_scholar_id: Some("gs-user-1".to_string()),
            scopus_id: Some("1234567890".to_string()),
            ..ExternalIds::default()
        };
        let service = service_with(
            Arc::new(MemoryStore::new()),
            vec![scholar.clone(), scopus.clone()],
        )
        .await;
        service.store().put_profile(&profile("u1", ids)).await.unwrap();
        service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();

        // Scholar goes down; its previously-cached records must survive.
        scholar.set(Behavior::Fail { retryable: true });
        scopus.set(Behavior::Records(vec![
            fetched("s1", 9, 2026),
            fetched("s2", 1, 2025),
        ]));
        let outcome = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();

        assert!(matches!(
            outcome.sources.get(&Source::GoogleScholar),
            Some(SourceStatus::Failed { retryable: true, .. })
        ));
        assert_eq!(
            outcome.sources.get(&Source::Scopus),
            Some(&SourceStatus::Updated { records: 2 })
        );
        // 2 stale scholar records + 2 fresh scopus records.
        assert_eq!(outcome.snapshot.publications.total, 4);
        assert_eq!(outcome.snapshot.citations.total, 10 + 5 + 9 + 1);
    }

    #[tokio::test]
    async fn adapter_timeout_is_a_transient_failure() {
        let scholar = ScriptedAdapter::new(Source::GoogleScholar, Behavior::Hang);
        let scopus = ScriptedAdapter::new(
            Source::Scopus,
            Behavior::Records(vec![fetched("s1", 2, 2026)]),
        );
        let ids = ExternalIds {
            google_scholar_id: Some("gs-user-1".to_string()),
            scopus_id: Some("1234567890".to_string()),
            ..ExternalIds::default()
        };
        let service = service_with(Arc::new(MemoryStore::new()), vec![scholar, scopus]).await;
        service.store().put_profile(&profile("u1", ids)).await.unwrap();

        let outcome = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();
        assert!(matches!(
            outcome.sources.get(&Source::GoogleScholar),
            Some(SourceStatus::Failed { retryable: true, .. })
        ));
        assert_eq!(outcome.snapshot.publications.total, 1);
    }

    #[tokio::test]
    async fn all_configured_sources_failing_is_an_error_and_advances_nothing() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Fail { retryable: true },
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();
        let prior_due = now() - chrono::Duration::days(1);
        service
            .store()
            .put_schedule(&SyncSchedule {
                user_id: "u1".to_string(),
                enabled: true,
                next_due_at: prior_due,
                last_run_at: None,
                last_outcome: None,
            })
            .await
            .unwrap();

        let err = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AllSourcesFailed { .. }));
        assert!(err.retryable());

        let schedule = service.store().schedule("u1").await.unwrap().unwrap();
        assert_eq!(schedule.next_due_at, prior_due);
        let profile = service.store().profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.last_sync_at, None);
    }

    #[tokio::test]
    async fn store_write_failure_fails_the_pass_and_advances_nothing() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 4, 2026)]),
        );
        let store = Arc::new(FailingPuts {
            inner: MemoryStore::new(),
            fail_prefix: "stats:",
        });
        let service = service_with(store, vec![adapter]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();

        let err = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert!(err.retryable());

        let profile = service.store().profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.last_sync_at, None);
        assert!(service.store().schedule("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unconfigured_sources_are_skipped_and_no_schedule_is_created() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 4, 2026)]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter]).await;
        service
            .store()
            .put_profile(&profile("u1", ExternalIds::default()))
            .await
            .unwrap();

        let outcome = service
            .sync_user("u1", SyncTrigger::InitialSetup, now())
            .await
            .unwrap();
        assert_eq!(
            outcome.sources.get(&Source::GoogleScholar),
            Some(&SourceStatus::Skipped)
        );
        assert_eq!(outcome.snapshot, StatisticsSnapshot::default());
        assert!(service.store().schedule("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_advances_next_due_by_one_week_from_prior_due_time() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 4, 2026)]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();
        let prior_due = now() - chrono::Duration::days(3);
        service
            .store()
            .put_schedule(&SyncSchedule {
                user_id: "u1".to_string(),
                enabled: true,
                next_due_at: prior_due,
                last_run_at: None,
                last_outcome: None,
            })
            .await
            .unwrap();

        let summary = service.sweep(now()).await.unwrap();
        assert_eq!(summary.due, 1);
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed, 0);

        let schedule = service.store().schedule("u1").await.unwrap().unwrap();
        // Anchored to the prior due time, not to "now".
        assert_eq!(schedule.next_due_at, prior_due + sync_cadence());
        assert_eq!(schedule.last_run_at, Some(now()));
    }

    #[tokio::test]
    async fn sweep_skips_disabled_and_not_yet_due_users() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 4, 2026)]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter]).await;
        for (user, enabled, due_offset_days) in
            [("u1", false, -1i64), ("u2", true, 2), ("u3", true, -1)]
        {
            service.store().put_profile(&profile(user, scholar_ids())).await.unwrap();
            service
                .store()
                .put_schedule(&SyncSchedule {
                    user_id: user.to_string(),
                    enabled,
                    next_due_at: now() + chrono::Duration::days(due_offset_days),
                    last_run_at: None,
                    last_outcome: None,
                })
                .await
                .unwrap();
        }

        let summary = service.sweep(now()).await.unwrap();
        assert_eq!(summary.due, 1);
        assert_eq!(summary.synced, 1);
        assert!(service.store().stats("u3").await.unwrap().is_some());
        assert!(service.store().stats("u1").await.unwrap().is_none());
        assert!(service.store().stats("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_user_failing_does_not_stop_the_sweep() {
        let scholar = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 4, 2026)]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![scholar]).await;

        // u1 is due but has no profile, so its pass fails; u2 syncs normally.
        service
            .store()
            .put_schedule(&SyncSchedule {
                user_id: "u1".to_string(),
                enabled: true,
                next_due_at: now() - chrono::Duration::days(1),
                last_run_at: None,
                last_outcome: None,
            })
            .await
            .unwrap();
        service.store().put_profile(&profile("u2", scholar_ids())).await.unwrap();
        service
            .store()
            .put_schedule(&SyncSchedule {
                user_id: "u2".to_string(),
                enabled: true,
                next_due_at: now() - chrono::Duration::days(1),
                last_run_at: None,
                last_outcome: None,
            })
            .await
            .unwrap();

        let summary = service.sweep(now()).await.unwrap();
        assert_eq!(summary.due, 2);
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed, 1);
        assert!(service.store().stats("u2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn manual_sync_absorbs_the_next_scheduled_run() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 4, 2026)]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();
        service
            .store()
            .put_schedule(&SyncSchedule {
                user_id: "u1".to_string(),
                enabled: true,
                next_due_at: now() + chrono::Duration::days(2),
                last_run_at: None,
                last_outcome: None,
            })
            .await
            .unwrap();

        service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap();
        let schedule = service.store().schedule("u1").await.unwrap().unwrap();
        assert_eq!(schedule.next_due_at, now() + sync_cadence());
    }

    #[tokio::test]
    async fn concurrent_syncs_for_one_user_serialize_without_duplication() {
        let adapter = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Records(vec![fetched("k1", 10, 2026), fetched("k2", 5, 2025)]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![adapter]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();

        let (a, b) = tokio::join!(
            service.sync_user("u1", SyncTrigger::Manual, now()),
            service.sync_user("u1", SyncTrigger::Manual, now()),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(service.store().records("u1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sole_configured_source_permanent_failure_is_surfaced() {
        let scholar = ScriptedAdapter::new(
            Source::GoogleScholar,
            Behavior::Fail { retryable: false },
        );
        let scopus = ScriptedAdapter::new(
            Source::Scopus,
            Behavior::Records(vec![fetched("s1", 2, 2026)]),
        );
        let service = service_with(Arc::new(MemoryStore::new()), vec![scholar, scopus]).await;
        service.store().put_profile(&profile("u1", scholar_ids())).await.unwrap();

        // Only scholar is configured and it fails permanently; the loss of
        // every configured source escalates, and it is not worth retrying.
        let err = service
            .sync_user("u1", SyncTrigger::Manual, now())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AllSourcesFailed { .. }));
        assert!(!err.retryable());
    }
}
