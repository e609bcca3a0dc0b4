//! Job persistence across service restarts

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::uws::job::Job;
use crate::uws::UwsError;

/// Outcome of a full restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub jobs_restored: usize,
    pub jobs_total: usize,
    pub owners_restored: usize,
    pub owners_total: usize,
}

impl RestoreReport {
    /// A report disagreeing with itself disables the backup feature
    pub fn is_consistent(&self) -> bool {
        self.jobs_restored <= self.jobs_total && self.owners_restored <= self.owners_total
    }

    /// Everything that was persisted came back
    pub fn is_complete(&self) -> bool {
        self.jobs_restored == self.jobs_total && self.owners_restored == self.owners_total
    }
}

/// Persistence collaborator
///
/// `save_owner` runs after any mutating action on that owner's jobs;
/// `restore_all` runs once at service initialization.
#[async_trait]
pub trait JobBackup: Send + Sync {
    async fn save_all(&self, grouped: &[(Option<String>, Vec<Job>)]) -> Result<(), UwsError>;

    async fn save_owner(&self, owner: Option<&str>, jobs: &[Job]) -> Result<(), UwsError>;

    async fn restore_all(&self) -> Result<(Vec<Job>, RestoreReport), UwsError>;
}

/// Per-owner JSON snapshot files under `<dir>/backup/`
pub struct FileBackup {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct OwnerSnapshot {
    owner: Option<String>,
    jobs: Vec<serde_json::Value>,
}

impl FileBackup {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: storage_dir.into().join("backup"),
        }
    }

    fn owner_file(&self, owner: Option<&str>) -> PathBuf {
        let key = match owner {
            Some(name) => {
                let sanitized: String = name
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                    .collect();
                format!("owner_{}", sanitized)
            }
            None => "anonymous".to_string(),
        };
        self.dir.join(format!("{}.json", key))
    }

    async fn write_snapshot(&self, owner: Option<&str>, jobs: &[Job]) -> Result<(), UwsError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UwsError::Persist(format!("Cannot create backup directory: {}", e)))?;

        let snapshot = OwnerSnapshot {
            owner: owner.map(String::from),
            jobs: jobs
                .iter()
                .map(|job| serde_json::to_value(job))
                .collect::<Result<_, _>>()
                .map_err(|e| UwsError::Persist(format!("Cannot serialize jobs: {}", e)))?,
        };

        let path = self.owner_file(owner);
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| UwsError::Persist(format!("Cannot serialize snapshot: {}", e)))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| UwsError::Persist(format!("Cannot write {}: {}", path.display(), e)))?;

        debug!(
            "Saved {} job(s) for {}",
            jobs.len(),
            owner.unwrap_or("anonymous")
        );
        Ok(())
    }
}

#[async_trait]
impl JobBackup for FileBackup {
    async fn save_all(&self, grouped: &[(Option<String>, Vec<Job>)]) -> Result<(), UwsError> {
        for (owner, jobs) in grouped {
            self.write_snapshot(owner.as_deref(), jobs).await?;
        }
        Ok(())
    }

    async fn save_owner(&self, owner: Option<&str>, jobs: &[Job]) -> Result<(), UwsError> {
        self.write_snapshot(owner, jobs).await
    }

    async fn restore_all(&self) -> Result<(Vec<Job>, RestoreReport), UwsError> {
        let mut report = RestoreReport {
            jobs_restored: 0,
            jobs_total: 0,
            owners_restored: 0,
            owners_total: 0,
        };
        let mut jobs = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // No backup directory yet: an empty, consistent restore
            Err(_) => return Ok((jobs, report)),
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            report.owners_total += 1;

            let body = match tokio::fs::read(&path).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Cannot read backup file {}: {}", path.display(), e);
                    continue;
                }
            };
            let snapshot: OwnerSnapshot = match serde_json::from_slice(&body) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Malformed backup file {}: {}", path.display(), e);
                    continue;
                }
            };

            report.owners_restored += 1;
            report.jobs_total += snapshot.jobs.len();
            for value in snapshot.jobs {
                match serde_json::from_value::<Job>(value) {
                    Ok(job) => {
                        report.jobs_restored += 1;
                        jobs.push(job);
                    }
                    Err(e) => {
                        warn!("Skipping unreadable job in {}: {}", path.display(), e);
                    }
                }
            }
        }

        Ok((jobs, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::params::TapParams;

    fn make_job(id: &str, owner: Option<&str>) -> Job {
        Job::new(id, "async", owner.map(String::from), TapParams::default(), 600, 3600)
    }

    #[tokio::test]
    async fn test_save_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path());

        backup
            .save_owner(Some("alice"), &[make_job("a1", Some("alice"))])
            .await
            .unwrap();
        backup
            .save_owner(None, &[make_job("n1", None), make_job("n2", None)])
            .await
            .unwrap();

        let (jobs, report) = backup.restore_all().await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(report.jobs_restored, 3);
        assert_eq!(report.jobs_total, 3);
        assert_eq!(report.owners_restored, 2);
        assert_eq!(report.owners_total, 2);
        assert!(report.is_complete());

        let restored = jobs.iter().find(|j| j.id == "a1").unwrap();
        assert_eq!(restored.owner.as_deref(), Some("alice"));
        assert_eq!(restored.execution_duration, 600);
    }

    #[tokio::test]
    async fn test_restore_with_no_backup_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path().join("nothing-here"));
        let (jobs, report) = backup.restore_all().await.unwrap();
        assert!(jobs.is_empty());
        assert_eq!(report.owners_total, 0);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_malformed_file_degrades_report() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path());
        backup
            .save_owner(Some("bob"), &[make_job("b1", Some("bob"))])
            .await
            .unwrap();

        // Corrupt a second snapshot by hand
        tokio::fs::write(dir.path().join("backup/owner_mallory.json"), b"{not json")
            .await
            .unwrap();

        let (jobs, report) = backup.restore_all().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(report.owners_total, 2);
        assert_eq!(report.owners_restored, 1);
        assert!(!report.is_complete());
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn test_save_owner_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileBackup::new(dir.path());

        backup
            .save_owner(Some("carol"), &[make_job("c1", Some("carol"))])
            .await
            .unwrap();
        backup.save_owner(Some("carol"), &[]).await.unwrap();

        let (jobs, report) = backup.restore_all().await.unwrap();
        assert!(jobs.is_empty());
        assert_eq!(report.owners_total, 1);
    }
}
