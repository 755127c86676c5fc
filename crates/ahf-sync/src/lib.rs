//! Pull cycle orchestration.
//!
//! One cycle pages through a realm's auctions, normalizes each page as it
//! arrives, finalizes and hashes the snapshot, then commits it through the
//! storage sink. Independent realms run as separate cycles.

pub mod config;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahf_adapters::{check_skip_rate, normalize_page, NormalizeError, DEFAULT_SKIP_THRESHOLD};
use ahf_api::{
    ApiClient, ApiContext, ApiError, AuctionSource, BackoffPolicy, ListingPages, RetryDisposition,
    DEFAULT_MAX_PAGES,
};
use ahf_core::{
    ConnectedRealm, ErrorKind, FileLocation, Region, RunKey, SkipReason, SnapshotBuilder,
    COMMODITIES_REALM_ID,
};
use ahf_storage::{
    JsonFileLedger, LocalSnapshotStore, SnapshotSink, SnapshotStore, StorageBackend, StorageError,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigLayer, FeederConfig};

pub const CRATE_NAME: &str = "ahf-sync";

/// Concurrent connected realm detail requests during a metadata refresh.
pub const REALM_METADATA_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Started,
    Paging,
    Normalizing,
    Finalizing,
    Committing,
    Done,
    Failed,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Started => "started",
            CycleState::Paging => "paging",
            CycleState::Normalizing => "normalizing",
            CycleState::Finalizing => "finalizing",
            CycleState::Committing => "committing",
            CycleState::Done => "done",
            CycleState::Failed => "failed",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one remote call, as seen by the retry loop.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retryable(ApiError),
    Fatal(ApiError),
}

impl<T> From<Result<T, ApiError>> for Attempt<T> {
    fn from(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(err) => match err.disposition() {
                RetryDisposition::Retryable => Attempt::Retryable(err),
                RetryDisposition::NonRetryable => Attempt::Fatal(err),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CyclePolicy {
    /// Retries of the same page; `max_retries` bounds consecutive failures.
    pub page_backoff: BackoffPolicy,
    pub skip_threshold: f64,
    /// Pages one listing may span before the cycle fails as schema drift.
    pub max_pages: usize,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        Self {
            page_backoff: BackoffPolicy::default(),
            skip_threshold: DEFAULT_SKIP_THRESHOLD,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("pull cycle cancelled")]
    Cancelled,
    #[error("pull cycle aborted: {0}")]
    Aborted(String),
}

impl CycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CycleError::Api(err) => err.kind(),
            CycleError::Normalize(_) => ErrorKind::SchemaDrift,
            CycleError::Storage(err) => err.kind(),
            CycleError::Cancelled => ErrorKind::Cancelled,
            CycleError::Aborted(_) => ErrorKind::Permanent,
        }
    }
}

/// A cycle that ended in `FAILED`. Nothing was recorded for it.
#[derive(Debug)]
pub struct CycleFailure {
    pub region: Region,
    pub realm_id: u32,
    pub failed_in: CycleState,
    pub error: CycleError,
    pub anomaly_count: usize,
    pub pages_fetched: usize,
    pub transitions: Vec<CycleState>,
}

impl CycleFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    fn aborted(region: Region, realm_id: u32, reason: impl Into<String>) -> Self {
        Self {
            region,
            realm_id,
            failed_in: CycleState::Started,
            error: CycleError::Aborted(reason.into()),
            anomaly_count: 0,
            pages_fetched: 0,
            transitions: vec![CycleState::Started, CycleState::Failed],
        }
    }
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure for {}/{} while {}: {} ({} skipped records, {} pages)",
            self.kind(),
            self.region,
            self.realm_id,
            self.failed_in,
            self.error,
            self.anomaly_count,
            self.pages_fetched
        )
    }
}

impl std::error::Error for CycleFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub key: RunKey,
    pub location: FileLocation,
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
    pub listing_count: usize,
    pub skipped_count: usize,
    pub pages: usize,
    pub skip_breakdown: BTreeMap<SkipReason, usize>,
    pub byte_size: usize,
    /// True when an identical snapshot was already recorded and nothing was written.
    pub deduplicated: bool,
    pub transitions: Vec<CycleState>,
}

/// States a cycle has entered, in first-entry order.
struct CycleTrace {
    region: Region,
    realm_id: u32,
    states: Vec<CycleState>,
}

impl CycleTrace {
    fn new(region: Region, realm_id: u32) -> Self {
        Self {
            region,
            realm_id,
            states: vec![CycleState::Started],
        }
    }

    fn enter(&mut self, state: CycleState) {
        if !self.states.contains(&state) {
            debug!(state = %state, "pull cycle state");
            self.states.push(state);
        }
    }

    fn current(&self) -> CycleState {
        self.states.last().copied().unwrap_or(CycleState::Started)
    }

    fn fail(mut self, error: CycleError, anomaly_count: usize, pages_fetched: usize) -> CycleFailure {
        let failed_in = self.current();
        self.states.push(CycleState::Failed);
        CycleFailure {
            region: self.region,
            realm_id: self.realm_id,
            failed_in,
            error,
            anomaly_count,
            pages_fetched,
            transitions: self.states,
        }
    }
}

#[derive(Debug)]
pub struct RealmResult {
    pub realm_id: u32,
    pub result: Result<CycleOutcome, CycleFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub written: usize,
    pub deduplicated: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn of(results: &[RealmResult]) -> Self {
        let mut summary = Self::default();
        for entry in results {
            match &entry.result {
                Ok(outcome) if outcome.deduplicated => summary.deduplicated += 1,
                Ok(_) => summary.written += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

/// Which realms one run pulls.
#[derive(Debug, Clone, Default)]
pub struct PullPlan {
    pub realms: Vec<u32>,
    /// Pull every connected realm reported by the API instead of `realms`.
    pub all_realms: bool,
    pub include_commodities: bool,
    /// Refresh the connected realm table before pulling auctions.
    pub include_realm_metadata: bool,
    pub max_concurrent: usize,
}

impl PullPlan {
    pub fn from_config(config: &FeederConfig) -> Self {
        Self {
            realms: config.realms.clone(),
            all_realms: false,
            include_commodities: config.include_commodities,
            include_realm_metadata: config.include_realm_metadata,
            max_concurrent: config.max_concurrent_realms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RealmMetadataOutcome {
    pub realms: Vec<ConnectedRealm>,
    /// Ids listed in the index whose detail endpoint answered 404.
    pub missing: Vec<u32>,
    /// `None` when the region reported no realms and nothing was written.
    pub location: Option<FileLocation>,
}

#[derive(Clone)]
pub struct Feeder {
    source: Arc<dyn AuctionSource>,
    sink: SnapshotSink,
    policy: CyclePolicy,
    clock: fn() -> DateTime<Utc>,
}

impl Feeder {
    pub fn new(source: Arc<dyn AuctionSource>, sink: SnapshotSink, policy: CyclePolicy) -> Self {
        Self {
            source,
            sink,
            policy,
            clock: Utc::now,
        }
    }

    /// Replaces the clock that stamps `captured_at`.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn region(&self) -> Region {
        self.source.region()
    }

    pub fn sink(&self) -> &SnapshotSink {
        &self.sink
    }

    pub fn policy(&self) -> CyclePolicy {
        self.policy
    }

    /// Runs one full pull cycle for `realm_id`.
    ///
    /// Cancellation is observed while paging, including backoff sleeps. Once
    /// the commit starts it runs to completion.
    pub async fn run_cycle(
        &self,
        realm_id: u32,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CycleFailure> {
        let region = self.source.region();
        let span = info_span!("pull_cycle", cycle_id = %Uuid::new_v4(), %region, realm_id);
        self.cycle(region, realm_id, cancel).instrument(span).await
    }

    async fn cycle(
        &self,
        region: Region,
        realm_id: u32,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CycleFailure> {
        let mut trace = CycleTrace::new(region, realm_id);
        let mut builder = SnapshotBuilder::new(region, realm_id, (self.clock)());
        let mut pages =
            ListingPages::new(Arc::clone(&self.source), realm_id).with_max_pages(self.policy.max_pages);
        let backoff = self.policy.page_backoff;
        let mut consecutive_failures = 0usize;

        trace.enter(CycleState::Paging);
        loop {
            let fetched = pages.pages_fetched();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(pages = fetched, "pull cycle cancelled while paging");
                    return Err(trace.fail(CycleError::Cancelled, builder.skipped_count(), fetched));
                }
                next = pages.next_page() => next,
            };
            let Some(result) = next else {
                break;
            };

            match Attempt::from(result) {
                Attempt::Success(page) => {
                    consecutive_failures = 0;
                    trace.enter(CycleState::Normalizing);
                    normalize_page(&mut builder, &page.records);
                }
                Attempt::Retryable(err) => {
                    consecutive_failures += 1;
                    if consecutive_failures > backoff.max_retries {
                        warn!(attempts = consecutive_failures, error = %err, "page fetch retries exhausted");
                        return Err(trace.fail(err.into(), builder.skipped_count(), fetched));
                    }
                    let delay = backoff.jittered_delay(consecutive_failures - 1);
                    warn!(
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying page fetch"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(pages = fetched, "pull cycle cancelled during backoff");
                            return Err(trace.fail(CycleError::Cancelled, builder.skipped_count(), fetched));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Attempt::Fatal(err) => {
                    if err.kind() == ErrorKind::SchemaDrift {
                        error!(kind = %err.kind(), error = %err, pages = fetched, "page fetch failed");
                    } else {
                        warn!(kind = %err.kind(), error = %err, "page fetch failed");
                    }
                    return Err(trace.fail(err.into(), builder.skipped_count(), fetched));
                }
            }
        }

        trace.enter(CycleState::Finalizing);
        let pages_fetched = pages.pages_fetched();
        let snapshot = builder.finalize();
        let breakdown = snapshot.skip_breakdown();
        if let Err(err) = check_skip_rate(
            snapshot.listings.len(),
            snapshot.skipped.len(),
            self.policy.skip_threshold,
            breakdown.clone(),
        ) {
            error!(
                skipped = snapshot.skipped.len(),
                listings = snapshot.listings.len(),
                threshold = self.policy.skip_threshold,
                breakdown = ?breakdown,
                "schema drift: skip rate above threshold, discarding snapshot"
            );
            return Err(trace.fail(err.into(), snapshot.skipped.len(), pages_fetched));
        }

        trace.enter(CycleState::Committing);
        let stored = match self.sink.write(&snapshot).await {
            Ok(stored) => stored,
            Err(err) => {
                if err.kind() == ErrorKind::Conflict {
                    warn!(error = %err, "lost commit race for bucket");
                } else {
                    error!(error = %err, "snapshot commit failed");
                }
                return Err(trace.fail(err.into(), snapshot.skipped.len(), pages_fetched));
            }
        };

        trace.enter(CycleState::Done);
        info!(
            key = %stored.record.key,
            location = %stored.location(),
            listings = snapshot.listings.len(),
            skipped = snapshot.skipped.len(),
            pages = pages_fetched,
            deduplicated = stored.deduplicated,
            "pull cycle done"
        );
        Ok(CycleOutcome {
            location: stored.record.file.clone(),
            key: stored.record.key,
            content_hash: snapshot.content_hash,
            captured_at: snapshot.captured_at,
            listing_count: snapshot.listings.len(),
            skipped_count: snapshot.skipped.len(),
            pages: pages_fetched,
            skip_breakdown: breakdown,
            byte_size: stored.byte_size,
            deduplicated: stored.deduplicated,
            transitions: trace.states,
        })
    }

    /// Runs independent realm cycles, at most `max_concurrent` at a time.
    ///
    /// Results come back in the order of `realm_ids`. A failed realm never
    /// stops the others.
    pub async fn run_many(
        &self,
        realm_ids: &[u32],
        max_concurrent: usize,
        cancel: &CancellationToken,
    ) -> Vec<RealmResult> {
        let region = self.source.region();
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();
        for (index, &realm_id) in realm_ids.iter().enumerate() {
            let feeder = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => feeder.run_cycle(realm_id, &cancel).await,
                    Err(_) => Err(CycleFailure::aborted(region, realm_id, "concurrency limiter closed")),
                };
                (index, result)
            });
        }

        let mut slots = realm_ids.iter().map(|_| None).collect::<Vec<_>>();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => error!(error = %err, "realm pull task did not complete"),
            }
        }

        realm_ids
            .iter()
            .zip(slots)
            .map(|(&realm_id, slot)| RealmResult {
                realm_id,
                result: slot.unwrap_or_else(|| {
                    Err(CycleFailure::aborted(region, realm_id, "pull task panicked"))
                }),
            })
            .collect()
    }

    /// Expands a plan into concrete realm ids, asking the API when it says `all_realms`.
    pub async fn resolve_realms(&self, plan: &PullPlan) -> Result<Vec<u32>, ApiError> {
        let mut realms = if plan.all_realms {
            self.source.connected_realm_ids().await?
        } else {
            plan.realms.clone()
        };
        if plan.include_commodities && !realms.contains(&COMMODITIES_REALM_ID) {
            realms.push(COMMODITIES_REALM_ID);
        }
        Ok(realms)
    }

    /// Fetches detail for every connected realm in the region and replaces
    /// the realm metadata table. Ids upstream no longer knows are left out.
    pub async fn refresh_realm_metadata(
        &self,
        max_concurrent: usize,
        cancel: &CancellationToken,
    ) -> Result<RealmMetadataOutcome, CycleError> {
        let region = self.source.region();
        let span = info_span!("realm_metadata", %region);
        async {
            let ids = self.source.connected_realm_ids().await?;
            let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
            let mut tasks = JoinSet::new();
            for realm_id in ids {
                let source = Arc::clone(&self.source);
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Err(CycleError::Aborted("concurrency limiter closed".to_string()));
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(CycleError::Cancelled),
                        detail = source.connected_realm(realm_id) => {
                            detail.map(|found| (realm_id, found)).map_err(CycleError::from)
                        }
                    }
                });
            }

            let mut realms = Vec::new();
            let mut missing = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok((_, Some(realm)))) => realms.push(realm),
                    Ok(Ok((realm_id, None))) => missing.push(realm_id),
                    Ok(Err(err)) => {
                        warn!(kind = %err.kind(), error = %err, "realm metadata refresh failed");
                        return Err(err);
                    }
                    Err(err) => {
                        return Err(CycleError::Aborted(format!(
                            "realm metadata task did not complete: {err}"
                        )))
                    }
                }
            }
            realms.sort_by_key(|realm| realm.id);
            missing.sort_unstable();
            if !missing.is_empty() {
                warn!(?missing, "connected realms listed in the index were not found");
            }

            let location = self.sink.write_realm_metadata(region, &realms).await?;
            Ok(RealmMetadataOutcome {
                realms,
                missing,
                location,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn run_plan(
        &self,
        plan: &PullPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<RealmResult>, ApiError> {
        if plan.include_realm_metadata {
            // Auction pulls do not depend on the realm table, so a failed refresh is only logged.
            if let Err(err) = self.refresh_realm_metadata(REALM_METADATA_CONCURRENCY, cancel).await {
                error!(kind = %err.kind(), error = %err, "connected realm metadata not refreshed");
            }
        }
        let realms = self.resolve_realms(plan).await?;
        if realms.is_empty() {
            warn!("pull plan resolved to no realms");
        }
        let results = self.run_many(&realms, plan.max_concurrent, cancel).await;
        log_results(&results);
        Ok(results)
    }
}

pub fn log_results(results: &[RealmResult]) {
    for entry in results {
        if let Err(failure) = &entry.result {
            warn!(
                realm_id = entry.realm_id,
                kind = %failure.kind(),
                anomalies = failure.anomaly_count,
                error = %failure.error,
                "realm pull failed"
            );
        }
    }
    let summary = RunSummary::of(results);
    info!(
        written = summary.written,
        deduplicated = summary.deduplicated,
        failed = summary.failed,
        "pull run finished"
    );
}

/// Opens the configured store. Local stores are swept of leftover staging files first.
pub async fn open_store(backend: &StorageBackend) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    match backend {
        StorageBackend::Local { root } => {
            let store = LocalSnapshotStore::new(root.clone());
            let swept = store
                .sweep_staging()
                .await
                .with_context(|| format!("sweeping staging files under {}", root.display()))?;
            if swept > 0 {
                info!(swept, root = %root.display(), "removed interrupted snapshot writes");
            }
            Ok(Arc::new(store))
        }
        other => other.open().context("opening object store"),
    }
}

/// Wires the API client, store and ledger described by `config`.
pub async fn build_feeder(config: &FeederConfig) -> anyhow::Result<Feeder> {
    let context = ApiContext::new(config.rate_limit);
    let client = ApiClient::new(config.api_config(), config.credentials()?, context)?;
    let store = open_store(&config.storage).await?;
    let ledger = JsonFileLedger::open(&config.ledger_path)
        .await
        .with_context(|| format!("opening ledger {}", config.ledger_path.display()))?;
    let sink = SnapshotSink::new(store, Arc::new(ledger), config.sink_options());
    Ok(Feeder::new(Arc::new(client), sink, config.cycle_policy()))
}

/// Cron-driven pulls. Every run is a tracked task, so shutdown can wait for
/// commits that are already under way.
pub struct FeederScheduler {
    scheduler: JobScheduler,
    tracker: TaskTracker,
    feeder: Feeder,
    plan: PullPlan,
    cancel: CancellationToken,
}

impl FeederScheduler {
    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.start().await.context("starting scheduler")
    }

    /// Pulls currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Runs the plan once now, outside the cron cadence.
    pub fn trigger(&self) -> JoinHandle<()> {
        spawn_tracked_run(
            &self.tracker,
            self.feeder.clone(),
            self.plan.clone(),
            self.cancel.clone(),
        )
    }

    /// Stops firing new runs, then waits for in-flight ones to finish.
    ///
    /// Cancel the token first so running cycles stop paging; a cycle already
    /// committing still completes its write and ledger record.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.scheduler.shutdown().await.context("stopping scheduler")?;
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(in_flight = self.tracker.len(), "waiting for in-flight pulls");
        }
        self.tracker.wait().await;
        Ok(())
    }
}

fn spawn_tracked_run(
    tracker: &TaskTracker,
    feeder: Feeder,
    plan: PullPlan,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tracker.spawn(async move {
        if cancel.is_cancelled() {
            return;
        }
        info!("scheduled pull triggered");
        if let Err(err) = feeder.run_plan(&plan, &cancel).await {
            error!(error = %err, "scheduled pull could not resolve realms");
        }
    })
}

/// Builds a scheduler that runs `plan` on every tick of `cron` (six-field, with seconds).
pub async fn build_scheduler(
    feeder: Feeder,
    plan: PullPlan,
    cron: &str,
    cancel: CancellationToken,
) -> anyhow::Result<FeederScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let tracker = TaskTracker::new();
    let job = {
        let tracker = tracker.clone();
        let feeder = feeder.clone();
        let plan = plan.clone();
        let cancel = cancel.clone();
        Job::new_async(cron, move |_uuid, _l| {
            let run = spawn_tracked_run(&tracker, feeder.clone(), plan.clone(), cancel.clone());
            Box::pin(async move {
                if let Err(err) = run.await {
                    error!(error = %err, "scheduled pull task did not complete");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?
    };
    scheduler.add(job).await.context("adding scheduler job")?;
    Ok(FeederScheduler {
        scheduler,
        tracker,
        feeder,
        plan,
        cancel,
    })
}
