use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::services::transfer::TransferProcess;

/// Lifecycle of a file handled by the stager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Unknown,
    ToBeStaged,
    Staging,
    Staged,
    Released,
    ErrorStaging,
    ToBeReplicated,
    Replicating,
    Replicated,
    ErrorReplication,
}

impl FileStatus {
    /// A transfer subprocess is attached and still owned by the record.
    pub fn is_in_flight(self) -> bool {
        matches!(self, FileStatus::Staging | FileStatus::Replicating)
    }

    pub fn is_error(self) -> bool {
        matches!(self, FileStatus::ErrorStaging | FileStatus::ErrorReplication)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStatus::Unknown => "unknown",
            FileStatus::ToBeStaged => "to_be_staged",
            FileStatus::Staging => "staging",
            FileStatus::Staged => "staged",
            FileStatus::Released => "released",
            FileStatus::ErrorStaging => "error_staging",
            FileStatus::ToBeReplicated => "to_be_replicated",
            FileStatus::Replicating => "replicating",
            FileStatus::Replicated => "replicated",
            FileStatus::ErrorReplication => "error_replication",
        };
        f.write_str(s)
    }
}

/// Where a file goes when the preferred location is short on space.
///
/// Ordered so that `None < SharedDir < Replication`; a record only ever moves
/// forward through this order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    #[default]
    None,
    SharedDir,
    Replication,
}

impl FallbackStrategy {
    /// The next level up, saturating at `Replication`.
    pub fn next(self) -> Self {
        match self {
            FallbackStrategy::None => FallbackStrategy::SharedDir,
            FallbackStrategy::SharedDir | FallbackStrategy::Replication => {
                FallbackStrategy::Replication
            }
        }
    }
}

/// Tracked state for one remote file, keyed by its normalized handle.
pub struct FileRecord {
    pub status: FileStatus,
    fallback: FallbackStrategy,
    /// Source handed to the transfer tool (rewrites applied).
    pub in_path: String,
    /// Local staging path, or the replica handle once replicated.
    pub out_path: String,
    pub original_size: Option<u64>,
    pub observed_size: Option<u64>,
    pub stdout_log: Option<PathBuf>,
    pub stderr_log: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome of the transfer, kept after release.
    pub outcome: Option<FileStatus>,
    pub(crate) process: Option<Box<dyn TransferProcess>>,
}

impl FileRecord {
    pub fn new(in_path: String) -> Self {
        Self {
            status: FileStatus::ToBeStaged,
            fallback: FallbackStrategy::None,
            in_path,
            out_path: String::new(),
            original_size: None,
            observed_size: None,
            stdout_log: None,
            stderr_log: None,
            started_at: None,
            finished_at: None,
            outcome: None,
            process: None,
        }
    }

    pub fn is_replica(&self) -> bool {
        self.fallback == FallbackStrategy::Replication
    }

    /// Sets a terminal transfer status and stamps the finish time.
    pub fn resolve(&mut self, status: FileStatus) {
        self.status = status;
        self.outcome = Some(status);
        self.finished_at = Some(Utc::now());
        self.process = None;
    }

    pub fn fallback(&self) -> FallbackStrategy {
        self.fallback
    }

    /// Moves the fallback strategy one level up and returns the new level.
    pub fn escalate(&mut self) -> FallbackStrategy {
        self.fallback = self.fallback.next();
        self.fallback
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.id())
    }

    pub fn snapshot(&self, name: &str) -> FileReport {
        let duration_secs = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };
        FileReport {
            name: name.to_string(),
            status: self.status,
            outcome: self.outcome,
            fallback: self.fallback,
            out_path: self.out_path.clone(),
            original_size: self.original_size,
            observed_size: self.observed_size,
            duration_secs,
        }
    }
}

impl fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRecord")
            .field("status", &self.status)
            .field("fallback", &self.fallback)
            .field("in_path", &self.in_path)
            .field("out_path", &self.out_path)
            .field("original_size", &self.original_size)
            .field("observed_size", &self.observed_size)
            .field("pid", &self.pid())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub name: String,
    pub status: FileStatus,
    pub outcome: Option<FileStatus>,
    pub fallback: FallbackStrategy,
    pub out_path: String,
    pub original_size: Option<u64>,
    pub observed_size: Option<u64>,
    pub duration_secs: Option<f64>,
}

/// End-of-job staging report.
#[derive(Debug, Clone, Serialize)]
pub struct StagingSummary {
    pub generated_at: DateTime<Utc>,
    pub pending: Vec<String>,
    pub files: Vec<FileReport>,
    pub staged_files: u64,
    pub staged_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_only_escalates() {
        let mut record = FileRecord::new("remote/a".to_string());
        assert_eq!(record.fallback(), FallbackStrategy::None);
        assert_eq!(record.escalate(), FallbackStrategy::SharedDir);
        assert_eq!(record.escalate(), FallbackStrategy::Replication);
        assert_eq!(record.escalate(), FallbackStrategy::Replication);
        assert!(record.is_replica());
    }

    #[test]
    fn test_status_flags() {
        assert!(FileStatus::Staging.is_in_flight());
        assert!(FileStatus::Replicating.is_in_flight());
        assert!(!FileStatus::Staged.is_in_flight());
        assert!(FileStatus::ErrorReplication.is_error());
        assert!(!FileStatus::Released.is_error());
        assert_eq!(FileStatus::ErrorStaging.to_string(), "error_staging");
    }

    #[test]
    fn test_snapshot_duration() {
        let mut record = FileRecord::new("remote/a".to_string());
        let start = Utc::now();
        record.started_at = Some(start);
        record.finished_at = Some(start + chrono::Duration::milliseconds(1500));
        let report = record.snapshot("a");
        assert_eq!(report.duration_secs, Some(1.5));
        assert_eq!(report.status, FileStatus::ToBeStaged);
    }
}
