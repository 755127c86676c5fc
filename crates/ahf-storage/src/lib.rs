//! Durable, idempotent snapshot storage: parquet encoding, content-addressed
//! paths, atomic publish and the run ledger.

use std::path::PathBuf;
use std::sync::Arc;

use ahf_core::{
    BucketGranularity, ConnectedRealm, ErrorKind, FileLocation, Region, RunKey, RunRecord, Snapshot,
};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub mod encode;
pub mod ledger;
pub mod store;

pub use encode::{
    encode_connected_realms, encode_snapshot, realm_schema, snapshot_schema, CompressionCodec,
    ParquetOptions,
};
pub use ledger::{JsonFileLedger, LedgerError, Recorded, RunLedger};
pub use store::{LocalSnapshotStore, ObjectSnapshotStore, SnapshotStore, StorageBackend};

pub const CRATE_NAME: &str = "ahf-storage";

/// Hex characters of the content hash used to disambiguate file names.
const PATH_HASH_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("parquet encoding failed: {0}")]
    Encode(String),
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object store: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("invalid storage path `{0}`")]
    InvalidPath(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Ledger(LedgerError::Conflict { .. }) => ErrorKind::Conflict,
            _ => ErrorKind::Storage,
        }
    }
}

/// Deterministic destination of a snapshot file.
///
/// The bucket start fixes the directory and timestamp; the hash prefix keeps
/// different contents for the same bucket apart.
pub fn snapshot_path(snapshot: &Snapshot, granularity: BucketGranularity) -> String {
    let start = granularity.bucket_start(snapshot.captured_at);
    let date = start.format("%Y-%m-%d");
    let hour = start.format("%H");
    let stamp = start.format("%Y%m%dT%H%M%SZ");
    let hash = snapshot
        .content_hash
        .get(..PATH_HASH_LEN)
        .unwrap_or(snapshot.content_hash.as_str());
    if snapshot.is_commodities() {
        format!(
            "{}/auctions/{date}/{hour}/commodities/commodities_{stamp}_{hash}.parquet",
            snapshot.region
        )
    } else {
        format!(
            "{}/auctions/{date}/{hour}/realm_{}/auctions_{stamp}_{hash}.parquet",
            snapshot.region, snapshot.realm_id
        )
    }
}

/// Connected realm reference table for a region, replaced on every refresh.
pub fn realm_metadata_path(region: Region) -> String {
    format!("{region}/global/connected_realms.parquet")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SinkOptions {
    pub granularity: BucketGranularity,
    pub parquet: ParquetOptions,
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub record: RunRecord,
    pub byte_size: usize,
    pub deduplicated: bool,
}

impl StoredSnapshot {
    pub fn location(&self) -> &FileLocation {
        &self.record.file
    }
}

enum Slot {
    Free(RunKey),
    Recorded(RunRecord),
}

#[derive(Clone)]
pub struct SnapshotSink {
    store: Arc<dyn SnapshotStore>,
    ledger: Arc<dyn RunLedger>,
    options: SinkOptions,
}

impl SnapshotSink {
    pub fn new(store: Arc<dyn SnapshotStore>, ledger: Arc<dyn RunLedger>, options: SinkOptions) -> Self {
        Self {
            store,
            ledger,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    pub fn options(&self) -> SinkOptions {
        self.options
    }

    /// First ledger slot for this snapshot's bucket: either an existing record
    /// with the same content, or the lowest free revision.
    async fn claim_slot(&self, snapshot: &Snapshot) -> Result<Slot, StorageError> {
        let base = snapshot.run_key(self.options.granularity);
        let mut revision = 0u32;
        loop {
            let candidate = base.with_revision(revision);
            match self.ledger.lookup(&candidate).await? {
                Some(existing) if existing.content_hash == snapshot.content_hash => {
                    return Ok(Slot::Recorded(existing))
                }
                Some(_) => revision = revision.saturating_add(1),
                None => return Ok(Slot::Free(candidate)),
            }
        }
    }

    /// Writes a finalized snapshot and records it in the ledger.
    ///
    /// An identical snapshot already recorded for the bucket is a no-op that
    /// returns the existing location. A losing concurrent writer gets
    /// [`ErrorKind::Conflict`] and its file is removed.
    pub async fn write(&self, snapshot: &Snapshot) -> Result<StoredSnapshot, StorageError> {
        let span = info_span!(
            "snapshot_write",
            region = %snapshot.region,
            realm_id = snapshot.realm_id,
            hash = %snapshot.content_hash
        );
        async {
            let key = match self.claim_slot(snapshot).await? {
                Slot::Free(key) => key,
                Slot::Recorded(existing) => {
                    info!(key = %existing.key, location = %existing.file, "identical snapshot already recorded");
                    return Ok(StoredSnapshot {
                        record: existing,
                        byte_size: 0,
                        deduplicated: true,
                    });
                }
            };

            let relative = snapshot_path(snapshot, self.options.granularity);
            let (file, byte_size) = if self.store.exists(&relative).await? {
                // Left by an earlier attempt that died before recording.
                (self.store.location(&relative), 0)
            } else {
                // A concurrent identical pull may have committed since the slot was claimed.
                if let Some(existing) = self.ledger.lookup(&key).await? {
                    if existing.content_hash == snapshot.content_hash {
                        info!(key = %existing.key, location = %existing.file, "identical snapshot committed concurrently");
                        return Ok(StoredSnapshot {
                            record: existing,
                            byte_size: 0,
                            deduplicated: true,
                        });
                    }
                }
                let bytes = encode_snapshot(snapshot, &key.bucket, self.options.parquet)?;
                let len = bytes.len();
                (self.store.put_atomic(&relative, bytes).await?, len)
            };

            let record = RunRecord {
                key,
                content_hash: snapshot.content_hash.clone(),
                file,
                written_at: Utc::now(),
                listing_count: snapshot.listings.len(),
            };

            match self.ledger.record(record.clone()).await {
                Ok(Recorded::Inserted) => {}
                Ok(Recorded::AlreadyPresent(existing)) => {
                    if existing.file.relative_path != relative {
                        self.discard(&relative).await;
                    }
                    info!(key = %existing.key, location = %existing.file, "identical snapshot recorded concurrently");
                    return Ok(StoredSnapshot {
                        record: *existing,
                        byte_size: 0,
                        deduplicated: true,
                    });
                }
                Err(err) => {
                    let keep = matches!(
                        &err,
                        LedgerError::Conflict { existing, .. } if existing.file.relative_path == relative
                    );
                    if !keep {
                        self.discard(&relative).await;
                    }
                    return Err(err.into());
                }
            }

            info!(key = %record.key, location = %record.file, bytes = byte_size, "snapshot committed");
            Ok(StoredSnapshot {
                record,
                byte_size,
                deduplicated: false,
            })
        }
        .instrument(span)
        .await
    }

    async fn discard(&self, relative: &str) {
        if let Err(cleanup) = self.store.delete(relative).await {
            warn!(path = %relative, error = %cleanup, "failed to discard unrecorded snapshot file");
        }
    }

    /// Replaces the region's connected realm table. Nothing is written for an
    /// empty list, so a failed index fetch never blanks the previous table.
    pub async fn write_realm_metadata(
        &self,
        region: Region,
        realms: &[ConnectedRealm],
    ) -> Result<Option<FileLocation>, StorageError> {
        if realms.is_empty() {
            info!(%region, "no connected realm metadata to write");
            return Ok(None);
        }
        let relative = realm_metadata_path(region);
        let bytes = encode_connected_realms(realms, self.options.parquet)?;
        let len = bytes.len();
        let location = self.store.put_atomic(&relative, bytes).await?;
        info!(%region, realms = realms.len(), bytes = len, location = %location, "connected realm metadata written");
        Ok(Some(location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahf_core::{AuctionListing, Region, SnapshotBuilder, TimeLeft};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use tempfile::tempdir;
    use tokio::sync::Barrier;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, minute, 0).single().unwrap()
    }

    fn snapshot(realm_id: u32, minute: u32, buyouts: &[i64]) -> Snapshot {
        let mut builder = SnapshotBuilder::new(Region::Eu, realm_id, at(minute));
        for (i, buyout) in buyouts.iter().enumerate() {
            builder.push_listing(AuctionListing {
                auction_id: i as i64 + 1,
                item_id: 19019,
                quantity: 1,
                unit_price: None,
                buyout: Some(*buyout),
                bid: None,
                time_left: TimeLeft::Long,
                bonus_lists: vec![],
                modifiers: vec![],
            });
        }
        builder.finalize()
    }

    async fn local_sink(root: &std::path::Path) -> SnapshotSink {
        let ledger = JsonFileLedger::open(root.join("ledger.json")).await.unwrap();
        SnapshotSink::new(
            Arc::new(LocalSnapshotStore::new(root.join("data"))),
            Arc::new(ledger),
            SinkOptions::default(),
        )
    }

    #[test]
    fn paths_are_deterministic_per_bucket_and_content() {
        let a = snapshot(1305, 5, &[100]);
        let b = snapshot(1305, 55, &[100]);
        let path = snapshot_path(&a, BucketGranularity::Hour);
        assert_eq!(path, snapshot_path(&b, BucketGranularity::Hour));
        assert!(path.starts_with("eu/auctions/2024-01-15/14/realm_1305/auctions_20240115T140000Z_"));
        assert!(path.ends_with(&format!("{}.parquet", &a.content_hash[..16])));

        let commodities = snapshot(0, 5, &[100]);
        assert!(snapshot_path(&commodities, BucketGranularity::Hour)
            .starts_with("eu/auctions/2024-01-15/14/commodities/commodities_20240115T140000Z_"));
    }

    #[tokio::test]
    async fn identical_rewrite_is_a_noop_returning_the_first_location() {
        let dir = tempdir().unwrap();
        let sink = local_sink(dir.path()).await;

        let first = sink.write(&snapshot(1305, 5, &[100, 200])).await.unwrap();
        let second = sink.write(&snapshot(1305, 40, &[200, 100])).await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.location(), second.location());
        assert_eq!(sink.ledger().records().await.unwrap().len(), 1);
        assert_eq!(sink.store().list("eu").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_content_gets_a_new_file_and_revision() {
        let dir = tempdir().unwrap();
        let sink = local_sink(dir.path()).await;

        let first = sink.write(&snapshot(1305, 5, &[100, 200])).await.unwrap();
        let second = sink.write(&snapshot(1305, 6, &[100, 201])).await.unwrap();

        assert_ne!(first.location(), second.location());
        assert_eq!(first.record.key.revision, 0);
        assert_eq!(second.record.key.revision, 1);
        assert_eq!(sink.ledger().records().await.unwrap().len(), 2);
        assert_eq!(sink.store().list("eu").await.unwrap().len(), 2);
    }

    /// Holds every lookup until both writers have looked, forcing them to race.
    struct RacingLedger {
        inner: JsonFileLedger,
        barrier: Barrier,
    }

    #[async_trait]
    impl RunLedger for RacingLedger {
        async fn lookup(&self, key: &RunKey) -> Result<Option<RunRecord>, LedgerError> {
            let found = self.inner.lookup(key).await;
            self.barrier.wait().await;
            found
        }

        async fn record(&self, record: RunRecord) -> Result<Recorded, LedgerError> {
            self.inner.record(record).await
        }

        async fn records(&self) -> Result<Vec<RunRecord>, LedgerError> {
            self.inner.records().await
        }
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_record_and_no_orphan() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(RacingLedger {
            inner: JsonFileLedger::open(dir.path().join("ledger.json")).await.unwrap(),
            barrier: Barrier::new(2),
        });
        let store = Arc::new(LocalSnapshotStore::new(dir.path().join("data")));
        let sink = SnapshotSink::new(store.clone(), ledger.clone(), SinkOptions::default());

        let a = snapshot(1305, 5, &[100]);
        let b = snapshot(1305, 6, &[101]);
        let (ra, rb) = tokio::join!(sink.write(&a), sink.write(&b));

        let (winner, loser) = match (ra, rb) {
            (Ok(w), Err(l)) => (w, l),
            (Err(l), Ok(w)) => (w, l),
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        assert_eq!(loser.kind(), ErrorKind::Conflict);
        assert_eq!(ledger.records().await.unwrap().len(), 1);
        assert_eq!(
            store.list("eu").await.unwrap(),
            vec![winner.location().relative_path.clone()]
        );
    }

    #[tokio::test]
    async fn object_store_sink_commits_through_single_put() {
        let dir = tempdir().unwrap();
        let ledger = JsonFileLedger::open(dir.path().join("ledger.json")).await.unwrap();
        let store = Arc::new(ObjectSnapshotStore::new(
            Arc::new(object_store::memory::InMemory::new()),
            "memory://bucket",
        ));
        let sink = SnapshotSink::new(store.clone(), Arc::new(ledger), SinkOptions::default());

        let stored = sink.write(&snapshot(3674, 1, &[5, 6, 7])).await.unwrap();
        assert!(stored.location().uri.starts_with("memory://bucket/eu/auctions/"));
        assert!(stored.byte_size > 0);
        assert!(store.exists(&stored.location().relative_path).await.unwrap());
    }

    /// Answers the first `stale` lookups with `None`, as a writer that read the
    /// ledger before another writer's commit would see it.
    struct StaleLedger {
        inner: Arc<JsonFileLedger>,
        stale: usize,
        lookups: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RunLedger for StaleLedger {
        async fn lookup(&self, key: &RunKey) -> Result<Option<RunRecord>, LedgerError> {
            let n = self.lookups.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < self.stale {
                return Ok(None);
            }
            self.inner.lookup(key).await
        }

        async fn record(&self, record: RunRecord) -> Result<Recorded, LedgerError> {
            self.inner.record(record).await
        }

        async fn records(&self) -> Result<Vec<RunRecord>, LedgerError> {
            self.inner.records().await
        }
    }

    #[tokio::test]
    async fn identical_commit_seen_only_at_record_time_is_deduplicated() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(JsonFileLedger::open(dir.path().join("ledger.json")).await.unwrap());
        let store = Arc::new(LocalSnapshotStore::new(dir.path().join("data")));
        let winner = SnapshotSink::new(store.clone(), ledger.clone(), SinkOptions::default());
        let first = winner.write(&snapshot(1305, 5, &[100])).await.unwrap();

        let late = SnapshotSink::new(
            store.clone(),
            Arc::new(StaleLedger {
                inner: ledger.clone(),
                stale: usize::MAX,
                lookups: Default::default(),
            }),
            SinkOptions::default(),
        );
        let second = late.write(&snapshot(1305, 20, &[100])).await.unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.record, first.record);
        assert_eq!(ledger.records().await.unwrap().len(), 1);
        assert_eq!(
            store.list("eu").await.unwrap(),
            vec![first.location().relative_path.clone()]
        );
    }

    #[tokio::test]
    async fn identical_commit_before_upload_skips_the_upload() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(JsonFileLedger::open(dir.path().join("ledger.json")).await.unwrap());
        let store = Arc::new(LocalSnapshotStore::new(dir.path().join("data")));
        let winner = SnapshotSink::new(store.clone(), ledger.clone(), SinkOptions::default());
        let first = winner.write(&snapshot(1305, 5, &[100])).await.unwrap();
        // Pretend the winner's file is not visible yet to the second writer.
        store.delete(&first.location().relative_path).await.unwrap();

        let late = SnapshotSink::new(
            store.clone(),
            Arc::new(StaleLedger {
                inner: ledger.clone(),
                stale: 1,
                lookups: Default::default(),
            }),
            SinkOptions::default(),
        );
        let second = late.write(&snapshot(1305, 20, &[100])).await.unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.byte_size, 0);
        assert_eq!(second.record, first.record);
        assert!(store.list("eu").await.unwrap().is_empty());
    }

    fn realm(id: u32, name: &str) -> ConnectedRealm {
        ConnectedRealm {
            id,
            realm_names: vec![name.to_string()],
            realm_slugs: vec![name.to_lowercase()],
            status: "UP".to_string(),
            population: "HIGH".to_string(),
            has_queue: false,
        }
    }

    #[tokio::test]
    async fn realm_metadata_is_replaced_in_place_and_skipped_when_empty() {
        let dir = tempdir().unwrap();
        let sink = local_sink(dir.path()).await;

        assert!(sink.write_realm_metadata(Region::Eu, &[]).await.unwrap().is_none());
        assert!(sink.store().list("eu").await.unwrap().is_empty());

        let first = sink
            .write_realm_metadata(Region::Eu, &[realm(1305, "Kazzak")])
            .await
            .unwrap()
            .unwrap();
        let second = sink
            .write_realm_metadata(Region::Eu, &[realm(1305, "Kazzak"), realm(3674, "Draenor")])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.relative_path, "eu/global/connected_realms.parquet");
        assert_eq!(
            sink.store().list("eu").await.unwrap(),
            vec!["eu/global/connected_realms.parquet".to_string()]
        );
        assert!(sink.ledger().records().await.unwrap().is_empty());
    }
}
