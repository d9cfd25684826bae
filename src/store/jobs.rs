//! Persistent job status store.
//!
//! The service is the source of truth for batch state; this store only keeps
//! job ids (plus a little context) so jobs survive a restart. State is written
//! atomically (write-then-rename) with a backup copy of the previous file.

use crate::batch::{BatchJob, JobState};
use crate::models::{CodebookError, LabelMode, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STORE_FILE: &str = "jobs.json";
const BACKUP_FILE: &str = "jobs.backup.json";
const TEMP_FILE: &str = "jobs.tmp.json";

/// What we remember about a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub mode: LabelMode,
    pub model: String,
    pub item_count: usize,
    /// Name of the input dataset, for display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Last state observed via refresh; a hint only
    pub last_state: JobState,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Record a freshly submitted job.
    pub fn for_job(job: &BatchJob, model: &str, dataset: Option<String>) -> Self {
        let now = Utc::now();
        let mode = job
            .manifest
            .first()
            .map_or(LabelMode::Single, |r| r.label_set.mode());
        Self {
            job_id: job.job_id.clone(),
            mode,
            model: model.to_string(),
            item_count: job.manifest.len(),
            dataset,
            submitted_at: job.created_at.unwrap_or(now),
            last_state: job.state,
            updated_at: now,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    jobs: BTreeMap<String, JobRecord>,
}

/// File-backed store of batch job records.
pub struct JobStore {
    dir: PathBuf,
    path: PathBuf,
    backup_path: PathBuf,
    data: StoreFile,
}

impl JobStore {
    /// Open (or create) the store in `dir`.
    ///
    /// A corrupt store file falls back to the backup copy.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| CodebookError::io("creating job store dir", e))?;

        let path = dir.join(STORE_FILE);
        let backup_path = dir.join(BACKUP_FILE);

        let data = if path.exists() {
            match Self::read(&path) {
                Ok(data) => data,
                Err(e) if backup_path.exists() => {
                    warn!(error = %e, "Job store unreadable, restoring from backup");
                    Self::read(&backup_path)?
                }
                Err(e) => return Err(e),
            }
        } else {
            StoreFile::default()
        };

        debug!(dir = %dir.display(), jobs = data.jobs.len(), "Job store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            path,
            backup_path,
            data,
        })
    }

    fn read(path: &Path) -> Result<StoreFile> {
        let file = File::open(path).map_err(|e| CodebookError::io("opening job store", e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| CodebookError::ParseError(format!("Invalid job store {}: {e}", path.display())))
    }

    fn save(&self) -> Result<()> {
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| CodebookError::io("backing up job store", e))?;
        }

        let temp_path = self.dir.join(TEMP_FILE);
        let file =
            File::create(&temp_path).map_err(|e| CodebookError::io("creating temp job store", e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.data)
            .map_err(|e| CodebookError::Internal(format!("Serializing job store: {e}")))?;

        fs::rename(&temp_path, &self.path)
            .map_err(|e| CodebookError::io("renaming job store", e))?;
        Ok(())
    }

    /// Insert or replace a record.
    pub fn upsert(&mut self, record: JobRecord) -> Result<()> {
        info!(job_id = %record.job_id, state = %record.last_state, "Recording batch job");
        self.data.jobs.insert(record.job_id.clone(), record);
        self.save()
    }

    /// Update the cached state of a known job. Returns false for unknown ids.
    pub fn update_state(&mut self, job_id: &str, state: JobState) -> Result<bool> {
        let Some(record) = self.data.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if record.last_state == state {
            return Ok(true);
        }
        record.last_state = state;
        record.updated_at = Utc::now();
        self.save()?;
        Ok(true)
    }

    pub fn remove(&mut self, job_id: &str) -> Result<Option<JobRecord>> {
        let removed = self.data.jobs.remove(job_id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn get(&self, job_id: &str) -> Option<&JobRecord> {
        self.data.jobs.get(job_id)
    }

    /// All records, newest submission first.
    pub fn records(&self) -> Vec<&JobRecord> {
        let mut records: Vec<_> = self.data.jobs.values().collect();
        records.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        records
    }

    /// Records whose last known state is not terminal.
    pub fn ongoing(&self) -> Vec<&JobRecord> {
        self.records()
            .into_iter()
            .filter(|r| !r.last_state.is_terminal())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, state: JobState, age_mins: i64) -> JobRecord {
        let at = Utc::now() - Duration::minutes(age_mins);
        JobRecord {
            job_id: id.to_string(),
            mode: LabelMode::Single,
            model: "gpt-4o-mini".to_string(),
            item_count: 10,
            dataset: Some("reviews.jsonl".to_string()),
            submitted_at: at,
            last_state: state,
            updated_at: at,
        }
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = JobStore::open(dir.path()).unwrap();
            store.upsert(record("batch_a", JobState::Validating, 5)).unwrap();
            store.upsert(record("batch_b", JobState::Completed, 1)).unwrap();
        }

        let store = JobStore::open(dir.path()).unwrap();
        let ids: Vec<_> = store.records().iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, ["batch_b", "batch_a"]);
        assert_eq!(store.ongoing().len(), 1);
        assert_eq!(store.get("batch_a").unwrap().item_count, 10);
    }

    #[test]
    fn test_update_and_remove() {
        let dir = TempDir::new().unwrap();
        let mut store = JobStore::open(dir.path()).unwrap();
        store.upsert(record("batch_a", JobState::InProgress, 0)).unwrap();

        assert!(store.update_state("batch_a", JobState::Completed).unwrap());
        assert!(!store.update_state("missing", JobState::Completed).unwrap());
        assert!(store.ongoing().is_empty());

        assert!(store.remove("batch_a").unwrap().is_some());
        assert!(store.remove("batch_a").unwrap().is_none());
        assert!(JobStore::open(dir.path()).unwrap().records().is_empty());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = JobStore::open(dir.path()).unwrap();
            store.upsert(record("batch_a", JobState::InProgress, 0)).unwrap();
            // Second save copies the first file to the backup.
            store.upsert(record("batch_b", JobState::InProgress, 0)).unwrap();
        }
        fs::write(dir.path().join(STORE_FILE), "{ truncated").unwrap();

        let store = JobStore::open(dir.path()).unwrap();
        assert!(store.get("batch_a").is_some());
    }
}
