//! Persisted record of committed snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ahf_core::{RunKey, RunRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LEDGER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("run {key} already recorded with hash {existing_hash}, refusing {attempted_hash}")]
    Conflict {
        key: String,
        existing_hash: String,
        attempted_hash: String,
        existing: Box<RunRecord>,
    },
    #[error("ledger i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger file {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Result of a successful [`RunLedger::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Inserted,
    /// The key already held this hash; carries the record that was kept.
    AlreadyPresent(Box<RunRecord>),
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn lookup(&self, key: &RunKey) -> Result<Option<RunRecord>, LedgerError>;

    /// Records a committed run under `record.key`.
    ///
    /// Recording the same hash twice keeps the first record and reports it as
    /// [`Recorded::AlreadyPresent`]. A different hash under an occupied key
    /// fails with [`LedgerError::Conflict`].
    async fn record(&self, record: RunRecord) -> Result<Recorded, LedgerError>;

    async fn records(&self) -> Result<Vec<RunRecord>, LedgerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    schema_version: u32,
    runs: BTreeMap<String, RunRecord>,
}

impl Default for LedgerFile {
    fn default() -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            runs: BTreeMap::new(),
        }
    }
}

/// JSON file ledger. All mutations go through one lock, so writes for the
/// same key are serialized within a process.
#[derive(Debug)]
pub struct JsonFileLedger {
    path: PathBuf,
    state: Mutex<LedgerFile>,
}

impl JsonFileLedger {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => {
                let file: LedgerFile =
                    serde_json::from_slice(&bytes).map_err(|e| LedgerError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                if file.schema_version != LEDGER_SCHEMA_VERSION {
                    return Err(LedgerError::Corrupt {
                        path,
                        reason: format!("unsupported schema_version {}", file.schema_version),
                    });
                }
                file
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LedgerFile::default(),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };
        debug!(path = %path.display(), runs = state.runs.len(), "opened run ledger");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &LedgerFile) -> Result<(), LedgerError> {
        let io = |source: std::io::Error| LedgerError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| LedgerError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(io)?;

        let tmp = parent.join(format!(".ledger.{}.tmp", Uuid::new_v4()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp)
                .await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(io(err));
        }
        Ok(())
    }
}

#[async_trait]
impl RunLedger for JsonFileLedger {
    async fn lookup(&self, key: &RunKey) -> Result<Option<RunRecord>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.runs.get(&key.ledger_id()).cloned())
    }

    async fn record(&self, record: RunRecord) -> Result<Recorded, LedgerError> {
        let id = record.key.ledger_id();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.runs.get(&id) {
            if existing.content_hash == record.content_hash {
                return Ok(Recorded::AlreadyPresent(Box::new(existing.clone())));
            }
            warn!(key = %id, existing = %existing.content_hash, attempted = %record.content_hash, "ledger conflict");
            return Err(LedgerError::Conflict {
                key: id,
                existing_hash: existing.content_hash.clone(),
                attempted_hash: record.content_hash,
                existing: Box::new(existing.clone()),
            });
        }

        state.runs.insert(id.clone(), record);
        if let Err(err) = self.persist(&state).await {
            state.runs.remove(&id);
            return Err(err);
        }
        Ok(Recorded::Inserted)
    }

    async fn records(&self) -> Result<Vec<RunRecord>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.runs.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahf_core::{FileLocation, Region};
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(revision: u32, hash: &str) -> RunRecord {
        RunRecord {
            key: RunKey {
                region: Region::Eu,
                realm_id: 1305,
                bucket: "2024-01-15T14".to_string(),
                revision,
            },
            content_hash: hash.to_string(),
            file: FileLocation {
                relative_path: format!("eu/x_{hash}.parquet"),
                uri: format!("/tmp/eu/x_{hash}.parquet"),
            },
            written_at: Utc::now(),
            listing_count: 3,
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/ledger.json");
        let ledger = JsonFileLedger::open(&path).await.unwrap();
        ledger.record(record(0, "aaa")).await.unwrap();

        let reopened = JsonFileLedger::open(&path).await.unwrap();
        let found = reopened.lookup(&record(0, "aaa").key).await.unwrap().unwrap();
        assert_eq!(found.content_hash, "aaa");
        assert_eq!(reopened.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_hash_is_idempotent_and_different_hash_conflicts() {
        let dir = tempdir().unwrap();
        let ledger = JsonFileLedger::open(dir.path().join("ledger.json")).await.unwrap();
        let first = record(0, "aaa");
        assert_eq!(ledger.record(first.clone()).await.unwrap(), Recorded::Inserted);
        match ledger.record(record(0, "aaa")).await.unwrap() {
            Recorded::AlreadyPresent(kept) => assert_eq!(*kept, first),
            Recorded::Inserted => panic!("same hash was inserted twice"),
        }

        let err = ledger.record(record(0, "bbb")).await.unwrap_err();
        match err {
            LedgerError::Conflict { existing, .. } => assert_eq!(existing.content_hash, "aaa"),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(ledger.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_ledger_is_reported_not_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(
            JsonFileLedger::open(&path).await,
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn no_staging_files_remain_after_writes() {
        let dir = tempdir().unwrap();
        let ledger = JsonFileLedger::open(dir.path().join("ledger.json")).await.unwrap();
        ledger.record(record(0, "aaa")).await.unwrap();
        ledger.record(record(1, "bbb")).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["ledger.json".to_string()]);
    }
}
