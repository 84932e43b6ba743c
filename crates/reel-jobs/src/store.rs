//! Job snapshot stores: in-memory and JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use reel_core::{Job, JobId, JobStore, Result};

/// Store that keeps snapshots in process memory only.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing records.
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: RwLock::new(jobs.into_iter().map(|job| (job.id, job)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn remove(&self, ids: &[JobId]) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        for id in ids {
            jobs.remove(id);
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }
}

/// On-disk document written by [`JsonFileJobStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotDocument {
    version: u32,
    jobs: Vec<Job>,
}

const SNAPSHOT_VERSION: u32 = 1;

/// Store that mirrors every record into a single JSON document.
///
/// Each write serializes the whole document to a sibling temp file and
/// renames it over the target, so a crash mid-write leaves the previous
/// snapshot intact.
pub struct JsonFileJobStore {
    path: PathBuf,
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl JsonFileJobStore {
    /// Open a snapshot file, loading its records if it exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let jobs = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => HashMap::new(),
            Ok(bytes) => {
                let doc: SnapshotDocument = serde_json::from_slice(&bytes)?;
                doc.jobs.into_iter().map(|job| (job.id, job)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(
            subsystem = "jobs",
            component = "store",
            path = %path.display(),
            jobs = jobs.len(),
            "Opened job snapshot file"
        );

        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, jobs: &HashMap<JobId, Job>) -> Result<()> {
        let mut records: Vec<Job> = jobs.values().cloned().collect();
        records.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));

        let doc = SnapshotDocument {
            version: SNAPSHOT_VERSION,
            jobs: records,
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            subsystem = "jobs",
            component = "store",
            path = %self.path.display(),
            jobs = doc.jobs.len(),
            "Wrote job snapshot"
        );
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonFileJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id, job.clone());
        self.write(&jobs).await
    }

    async fn remove(&self, ids: &[JobId]) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        for id in ids {
            jobs.remove(id);
        }
        if jobs.len() == before {
            return Ok(());
        }
        self.write(&jobs).await
    }

    async fn load_all(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::{JobSpec, JobStatus};
    use serde_json::json;

    fn job(topic: &str) -> Job {
        let spec = JobSpec {
            brief: json!({ "topic": topic }),
            plan: json!({}),
            voice: json!({}),
            render: json!({}),
        };
        Job::new(reel_core::new_v7(), spec, 10, 3, None)
    }

    #[tokio::test]
    async fn test_memory_store_save_remove() {
        let store = MemoryJobStore::new();
        let a = job("a");
        let b = job("b");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        assert_eq!(store.len().await, 2);

        store.remove(&[a.id]).await.unwrap();
        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, b.id);
    }

    #[tokio::test]
    async fn test_memory_store_upsert_replaces() {
        let store = MemoryJobStore::new();
        let mut a = job("a");
        store.save(&a).await.unwrap();
        a.status = JobStatus::Completed;
        store.save(&a).await.unwrap();
        assert_eq!(store.get(a.id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileJobStore::open(dir.path().join("jobs.json"))
            .await
            .unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.json");

        let a = job("a");
        let b = job("b");
        {
            let store = JsonFileJobStore::open(&path).await.unwrap();
            store.save(&a).await.unwrap();
            store.save(&b).await.unwrap();
            store.remove(&[a.id]).await.unwrap();
        }

        let reopened = JsonFileJobStore::open(&path).await.unwrap();
        let all = reopened.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, b.id);
        assert_eq!(all[0].spec.brief["topic"], "b");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let err = JsonFileJobStore::open(&path).await.err().unwrap();
        assert!(matches!(err, reel_core::Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_file_store_blank_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        tokio::fs::write(&path, b"\n").await.unwrap();
        let store = JsonFileJobStore::open(&path).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
