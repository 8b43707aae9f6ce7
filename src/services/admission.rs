use crate::models::{FallbackStrategy, FileRecord};
use std::io;
use std::path::{Path, PathBuf};

/// Free-space query for a candidate staging directory.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, dir: &Path) -> io::Result<u64>;
}

/// Asks the filesystem (`statvfs`) via `fs2`.
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, dir: &Path) -> io::Result<u64> {
        fs2::available_space(dir)
    }
}

/// Outcome of admission control for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Copy to this directory.
    Copy { dir: PathBuf },
    /// No directory has room: replicate remote-to-remote instead.
    Replicate,
}

/// Picks where a file can go, escalating the record's fallback strategy
/// until a directory has room or replication is the only option left.
///
/// An unknown remote size or an unreadable directory counts as "no room".
pub fn admit(
    record: &mut FileRecord,
    remote_size: Option<u64>,
    tmpdir: &Path,
    fallback_dir: Option<&Path>,
    probe: &dyn SpaceProbe,
) -> Admission {
    loop {
        let candidate = match record.fallback() {
            FallbackStrategy::Replication => return Admission::Replicate,
            FallbackStrategy::None => Some(tmpdir),
            FallbackStrategy::SharedDir => fallback_dir,
        };

        match candidate {
            Some(dir) if has_room(dir, remote_size, probe) => {
                return Admission::Copy {
                    dir: dir.to_path_buf(),
                };
            }
            Some(dir) => {
                tracing::info!(
                    "Not enough space in {} for {}",
                    dir.display(),
                    record.in_path
                );
            }
            None => {
                tracing::info!("No shared fallback directory configured");
            }
        }

        let next = record.escalate();
        tracing::info!("Switching {} to fallback strategy {:?}", record.in_path, next);
    }
}

fn has_room(dir: &Path, remote_size: Option<u64>, probe: &dyn SpaceProbe) -> bool {
    let available = match probe.available_space(dir) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(
                "Directory {} not available or no permission to write: {}",
                dir.display(),
                e
            );
            return false;
        }
    };
    let Some(needed) = remote_size else {
        return false;
    };
    tracing::info!(
        "Available disk space in {}: {} MB, necessary: {} MB",
        dir.display(),
        available / (1024 * 1024),
        needed / (1024 * 1024)
    );
    needed < available
}
