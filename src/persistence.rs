use crate::error::PersistError;
use crate::scheduler::{Schedule, iso_timestamp};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const KEY_PREFIX: &str = "train_schedule_";
const OFFLINE_SUFFIX: &str = "_offline";

/// Remote receiver of finished schedules.
pub trait ScheduleSink: Send + Sync {
    fn publish<'a>(&'a self, schedule: &'a Schedule) -> BoxFuture<'a, Result<(), PersistError>>;
}

pub struct RemoteResultsSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RemoteResultsSink {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: format!("{}/api/optimization/results", base_url.trim_end_matches('/')),
            timeout,
        }
    }
}

impl ScheduleSink for RemoteResultsSink {
    fn publish<'a>(&'a self, schedule: &'a Schedule) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(schedule)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(PersistError::Status(status));
            }

            Ok(())
        })
    }
}

/// `train_schedule_2025-01-01T10-00-00-000Z`, with `_offline` appended when the remote sink was unreachable.
pub fn schedule_key(saved_at: DateTime<Utc>, offline: bool) -> String {
    let stamp = iso_timestamp(saved_at).replace([':', '.'], "-");
    let mut key = format!("{}{}", KEY_PREFIX, stamp);
    if offline {
        key.push_str(OFFLINE_SUFFIX);
    }
    key
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SavedSchedule {
    pub key: String,
    pub timestamp: String,
    pub schedule: Schedule,
}

/// Directory of JSON files, one per key.
#[derive(Clone, Debug)]
pub struct LocalScheduleStore {
    dir: PathBuf,
}

macro_rules! io_err {
    ($path:expr, $err:expr) => {
        PersistError::Io {
            path: $path.to_path_buf(),
            source: $err,
        }
    };
}

impl LocalScheduleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn save(&self, key: &str, schedule: &Schedule) -> Result<PathBuf, PersistError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err!(self.dir, e))?;

        let file_path = self.path_for(key);
        let temp_file_path = self.dir.join(format!("{}.json.tmp", key));

        let file = File::create(&temp_file_path).map_err(|e| io_err!(temp_file_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, schedule)?;
        writer.flush().map_err(|e| io_err!(temp_file_path, e))?;
        drop(writer);

        fs::rename(&temp_file_path, &file_path).map_err(|e| io_err!(file_path, e))?;

        Ok(file_path)
    }

    pub fn load(&self, key: &str) -> Result<Option<Schedule>, PersistError> {
        let file_path = self.path_for(key);
        if !file_path.exists() {
            return Ok(None);
        }

        let file = File::open(&file_path).map_err(|e| io_err!(file_path, e))?;
        let schedule = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(schedule))
    }

    /// Every readable saved schedule, newest generation first. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<SavedSchedule>, PersistError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err!(self.dir, e)),
        };

        let mut saved = vec![];

        for entry in entries {
            let entry = entry.map_err(|e| io_err!(self.dir, e))?;
            let file_name = entry.file_name();
            let Some(key) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .filter(|key| key.starts_with(KEY_PREFIX))
            else {
                continue;
            };

            match self.load(key) {
                Ok(Some(schedule)) => {
                    let timestamp = DateTime::from_timestamp(schedule.now_epoch_s, 0)
                        .map(iso_timestamp)
                        .unwrap_or_default();
                    saved.push(SavedSchedule {
                        key: key.to_string(),
                        timestamp,
                        schedule,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to parse saved schedule {}: {}", key, e),
            }
        }

        saved.sort_by(|a, b| b.schedule.now_epoch_s.cmp(&a.schedule.now_epoch_s));
        Ok(saved)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub remote_delivered: bool,
    pub local_key: Option<String>,
}

/// Remote sink first, local store second; neither failure stops the other or the cycle.
pub struct Persister {
    remote: Arc<dyn ScheduleSink>,
    local: LocalScheduleStore,
}

impl Persister {
    pub fn new(remote: Arc<dyn ScheduleSink>, local: LocalScheduleStore) -> Self {
        Self { remote, local }
    }

    pub fn local_store(&self) -> &LocalScheduleStore {
        &self.local
    }

    pub async fn persist(&self, schedule: &Schedule, saved_at: DateTime<Utc>) -> PersistReport {
        let remote_delivered = match self.remote.publish(schedule).await {
            Ok(()) => {
                info!("Optimization results sent to API server");
                true
            }
            Err(e) => {
                error!("Failed to send results to API: {}", e);
                false
            }
        };

        let key = schedule_key(saved_at, !remote_delivered);
        let store = self.local.clone();
        let save_key = key.clone();
        let owned = schedule.clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&save_key, &owned)).await;

        let local_key = match saved {
            Ok(Ok(path)) => {
                info!("Schedule saved locally as {}", path.display());
                Some(key)
            }
            Ok(Err(e)) => {
                error!("Failed to save schedule locally: {}", e);
                None
            }
            Err(e) => {
                error!("Local save task failed: {}", e);
                None
            }
        };

        PersistReport {
            remote_delivered,
            local_key,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{RecordingSink, temp_store};
    use super::*;
    use crate::scheduler::{HORIZON_S, ScheduleAction, ScheduleEntry};
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    fn schedule_at(now_epoch_s: i64) -> Schedule {
        Schedule {
            now_epoch_s,
            horizon_s: HORIZON_S,
            snapshot_trains_considered: 1,
            schedule: [(
                "T1".to_string(),
                ScheduleEntry {
                    target_section: "SEC_1".to_string(),
                    entry_offset_s: 0,
                    entry_epoch_s: now_epoch_s,
                    action: ScheduleAction::Proceed,
                    priority: 3,
                    status: "Running".to_string(),
                },
            )]
            .into_iter()
            .collect(),
            strategy: None,
        }
    }

    #[test]
    fn key_replaces_colons_and_dots() {
        let saved_at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 5).unwrap();
        assert_eq!(
            schedule_key(saved_at, false),
            "train_schedule_2025-03-14T09-30-05-000Z"
        );
        assert_eq!(
            schedule_key(saved_at, true),
            "train_schedule_2025-03-14T09-30-05-000Z_offline"
        );
    }

    #[tokio::test]
    async fn both_sinks_written_when_remote_is_up() {
        let sink = Arc::new(RecordingSink::default());
        let persister = Persister::new(sink.clone(), temp_store());
        let saved_at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 5).unwrap();

        let report = persister.persist(&schedule_at(100), saved_at).await;

        assert!(report.remote_delivered);
        assert_eq!(
            report.local_key.as_deref(),
            Some("train_schedule_2025-03-14T09-30-05-000Z")
        );
        assert_eq!(sink.published.load(Ordering::SeqCst), 1);
        assert_eq!(
            persister
                .local_store()
                .load("train_schedule_2025-03-14T09-30-05-000Z")
                .unwrap(),
            Some(schedule_at(100))
        );
    }

    #[tokio::test]
    async fn remote_failure_still_saves_offline_copy() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let persister = Persister::new(sink.clone(), temp_store());
        let saved_at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 5).unwrap();

        let report = persister.persist(&schedule_at(100), saved_at).await;

        assert!(!report.remote_delivered);
        assert_eq!(
            report.local_key.as_deref(),
            Some("train_schedule_2025-03-14T09-30-05-000Z_offline")
        );
    }

    #[tokio::test]
    async fn local_failure_does_not_block_remote() {
        let blocker = std::env::temp_dir().join(format!("railflow-file-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let persister = Persister::new(sink.clone(), LocalScheduleStore::new(&blocker));

        let report = persister.persist(&schedule_at(100), Utc::now()).await;

        assert!(report.remote_delivered);
        assert_eq!(report.local_key, None);
        assert_eq!(sink.published.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn list_sorts_newest_first_and_skips_garbage() {
        let store = temp_store();
        store.save("train_schedule_a", &schedule_at(100)).unwrap();
        store.save("train_schedule_b", &schedule_at(300)).unwrap();
        store.save("train_schedule_c_offline", &schedule_at(200)).unwrap();
        std::fs::write(store.dir().join("train_schedule_bad.json"), b"{oops").unwrap();
        std::fs::write(store.dir().join("unrelated.json"), b"{}").unwrap();

        let saved = store.list().unwrap();

        assert_eq!(
            saved.iter().map(|s| s.key.as_str()).collect::<Vec<_>>(),
            vec!["train_schedule_b", "train_schedule_c_offline", "train_schedule_a"]
        );
        assert_eq!(saved[2].timestamp, "1970-01-01T00:01:40.000Z");
    }

    #[test]
    fn list_of_missing_directory_is_empty() {
        assert!(temp_store().list().unwrap().is_empty());
    }
}
