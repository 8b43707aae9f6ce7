use crate::config::StagerConfig;
use crate::error::Result;
use crate::models::{FileRecord, FileStatus, StagingSummary};
use crate::services::admission::{self, Admission, FsSpaceProbe, SpaceProbe};
use crate::services::transfer::{
    CommandTransferExecutor, KillOutcome, TransferExecutor, TransferExit, TransferLogs,
    read_error_tail,
};
use crate::services::watchdog::{self, WatchdogArgs};
use crate::utils::path::{
    normalize_handle, rewrite_source, staging_filename, transfer_log_paths,
};
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Picks the usable replica among those listed after a replication.
pub type ReplicaSelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

const ERROR_TAIL_LINES: usize = 5;

/// Prefetches an ordered list of remote files ahead of a sequential consumer.
///
/// Files wait in a FIFO queue until admitted; admission starts a transfer
/// subprocess, keeping at most `pipe_depth` transfers running unless the
/// consumer asks for a file out of turn. Every scheduling decision happens on
/// `&mut self`; the transfers themselves run as independent processes.
pub struct Stager {
    config: Arc<StagerConfig>,
    executor: Arc<dyn TransferExecutor>,
    space: Arc<dyn SpaceProbe>,
    replica_selector: ReplicaSelector,
    tmpdir: PathBuf,
    base_tmpdir: PathBuf,
    pending: VecDeque<String>,
    records: BTreeMap<String, FileRecord>,
    watchdog_submitted: bool,
}

impl Stager {
    /// Creates the session tmpdir and uses the configured command-line tools.
    pub fn new(config: StagerConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let executor = Arc::new(CommandTransferExecutor::new(config.clone()));
        Ok(Self::with_executor(config, executor))
    }

    pub fn with_executor(config: Arc<StagerConfig>, executor: Arc<dyn TransferExecutor>) -> Self {
        let (tmpdir, base_tmpdir) = config.create_session_tmpdir();
        if let Some(dir) = &config.fallback_dir {
            tracing::info!("📁 Shared fallback dir set to {}", dir.display());
        }
        let replica_selector = default_replica_selector(config.replica_destination.clone());
        Self {
            config,
            executor,
            space: Arc::new(FsSpaceProbe),
            replica_selector,
            tmpdir,
            base_tmpdir,
            pending: VecDeque::new(),
            records: BTreeMap::new(),
            watchdog_submitted: false,
        }
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    pub fn with_replica_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.replica_selector = Arc::new(selector);
        self
    }

    pub fn config(&self) -> &StagerConfig {
        &self.config
    }

    pub fn tmpdir(&self) -> &Path {
        &self.tmpdir
    }

    pub fn base_tmpdir(&self) -> &Path {
        &self.base_tmpdir
    }

    fn log_dir(&self) -> &Path {
        self.config.log_dir.as_deref().unwrap_or(&self.tmpdir)
    }

    /// Key a handle is tracked under.
    pub fn normalize(&self, raw: &str) -> String {
        normalize_handle(
            raw,
            &self.config.in_prefix,
            &self.config.out_prefix,
            &self.config.prefix_fixups,
        )
    }

    pub fn pending_files(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn tracked_files(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn record(&self, raw: &str) -> Option<&FileRecord> {
        self.records.get(&self.normalize(raw))
    }

    fn is_tracked(&self, key: &str) -> bool {
        self.records.contains_key(key) || self.pending.iter().any(|k| k == key)
    }

    /// Number of transfers currently running.
    pub fn in_flight(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status.is_in_flight())
            .count()
    }

    /// Another unreleased file already staged (or staging) to `dest`.
    fn local_owner(&self, key: &str, dest: &Path) -> Option<&str> {
        self.records
            .iter()
            .find(|(other, record)| {
                other.as_str() != key
                    && !record.is_replica()
                    && record.status != FileStatus::Released
                    && Path::new(&record.out_path) == dest
            })
            .map(|(other, _)| other.as_str())
    }

    /// Local name the file has (or will have) once staged.
    pub fn tmp_filename(&self, raw: &str) -> PathBuf {
        let key = self.normalize(raw);
        match self.records.get(&key) {
            Some(record) if !record.out_path.is_empty() && !record.is_replica() => {
                PathBuf::from(&record.out_path)
            }
            _ => staging_filename(&self.tmpdir, &key),
        }
    }

    /// Queues a file for staging. Already-tracked files are ignored.
    pub async fn enqueue(&mut self, raw: &str) {
        let key = self.normalize(raw);
        tracing::debug!("enqueue() : <{}>", key);
        if !self.is_tracked(&key) {
            self.pending.push_back(key);
        }
        self.admit_next(false).await;
    }

    /// Polls every running transfer without blocking and resolves the ones
    /// that have exited.
    pub async fn refresh(&mut self) {
        let mut finished = Vec::new();
        for (key, record) in self.records.iter_mut() {
            if !record.status.is_in_flight() {
                continue;
            }
            let Some(process) = record.process.as_mut() else {
                continue;
            };
            match process.try_wait() {
                Ok(Some(exit)) => finished.push((key.clone(), exit)),
                Ok(None) => {}
                Err(e) => tracing::warn!("Polling transfer of {} failed: {}", key, e),
            }
        }
        for (key, exit) in finished {
            self.finish(&key, exit).await;
        }
    }

    /// Admits queued files while fewer than `pipe_depth` transfers run.
    /// With `force`, the head of the queue is admitted regardless.
    pub async fn admit_next(&mut self, force: bool) {
        self.refresh().await;
        self.ensure_watchdog();

        loop {
            if self.pending.is_empty() {
                break;
            }
            if !force && self.in_flight() >= self.config.pipe_depth {
                break;
            }
            let Some(key) = self.pending.pop_front() else {
                break;
            };
            if force {
                tracing::debug!("admit_next() : forcing stage of <{}>", key);
            }
            self.start(key).await;
            if force {
                break;
            }
        }
    }

    async fn start(&mut self, key: String) {
        tracing::debug!("admit_next() : Now staging <{}>", key);
        let mut record = FileRecord::new(rewrite_source(&key, &self.config.source_rewrites));

        tracing::info!("Checking file size for: {}", record.in_path);
        let remote_size = match self.executor.remote_size(&record.in_path).await {
            Ok(size) => Some(size),
            Err(e) => {
                tracing::error!("Checking file size of {} failed: {}", record.in_path, e);
                None
            }
        };
        record.original_size = remote_size;

        let admission = admission::admit(
            &mut record,
            remote_size,
            &self.tmpdir,
            self.config.fallback_dir.as_deref(),
            self.space.as_ref(),
        );
        record.started_at = Some(Utc::now());

        match admission {
            Admission::Copy { dir } => {
                let dest = staging_filename(&dir, &key);
                if let Some(owner) = self.local_owner(&key, &dest) {
                    tracing::warn!(
                        "⚠️ {} stages to {}, which still holds {}; the copies overwrite each other",
                        key,
                        dest.display(),
                        owner
                    );
                }
                let (stdout, stderr) = transfer_log_paths(self.log_dir(), &dest);
                let logs = TransferLogs { stdout, stderr };
                record.out_path = dest.to_string_lossy().into_owned();
                match self.executor.spawn_copy(&record.in_path, &dest, &logs) {
                    Ok(process) => {
                        tracing::info!(pid = ?process.id(), "📥 Staging {} -> {}", key, dest.display());
                        record.process = Some(process);
                        record.status = FileStatus::Staging;
                    }
                    Err(e) => {
                        tracing::error!("Failed to start staging of {}: {:#}", key, e);
                        record.resolve(FileStatus::ErrorStaging);
                    }
                }
                record.stdout_log = Some(logs.stdout);
                record.stderr_log = Some(logs.stderr);
            }
            Admission::Replicate => {
                record.status = FileStatus::ToBeReplicated;
                let marker = staging_filename(self.log_dir(), &key);
                let (stdout, stderr) = transfer_log_paths(self.log_dir(), &marker);
                let logs = TransferLogs { stdout, stderr };
                match self.executor.spawn_replicate(&record.in_path, &logs) {
                    Ok(process) => {
                        tracing::info!(pid = ?process.id(), "🔁 Replicating {}", key);
                        record.process = Some(process);
                        record.status = FileStatus::Replicating;
                    }
                    Err(e) => {
                        tracing::error!("Failed to start replication of {}: {:#}", key, e);
                        record.resolve(FileStatus::ErrorReplication);
                    }
                }
                record.stdout_log = Some(logs.stdout);
                record.stderr_log = Some(logs.stderr);
            }
        }

        self.records.insert(key, record);
    }

    /// Turns an exited transfer into its final status.
    async fn finish(&mut self, key: &str, exit: TransferExit) {
        let executor = self.executor.clone();
        let selector = self.replica_selector.clone();
        let Some(record) = self.records.get_mut(key) else {
            return;
        };
        match record.status {
            FileStatus::Staging => resolve_copy(key, record, exit).await,
            FileStatus::Replicating => {
                resolve_replication(key, record, exit, executor.as_ref(), &selector).await
            }
            _ => {}
        }
    }

    /// Blocks until `raw` is resolved, staging it immediately if it is not
    /// queued or running yet. Failures are logged; the caller falls back to
    /// the original location.
    pub async fn get_file(&mut self, raw: &str) -> FileStatus {
        let key = self.normalize(raw);
        tracing::debug!("get_file() : {}", key);

        self.refresh().await;

        if !self.is_tracked(&key) {
            tracing::debug!("get_file() : {} not found. Start immediate staging.", key);
            self.pending.push_front(key.clone());
        }

        if let Some(pos) = self.pending.iter().position(|k| *k == key) {
            if let Some(k) = self.pending.remove(pos) {
                self.pending.push_front(k);
            }
            tracing::debug!("get_file() : {}. Forced staging.", key);
            self.admit_next(true).await;
        }

        let waited = match self.records.get_mut(&key) {
            Some(record) if record.status.is_in_flight() => {
                tracing::info!("⏳ Waiting till <{}> has finished {}", key, record.status);
                match record.process.as_mut() {
                    Some(process) => Some(process.wait().await),
                    None => None,
                }
            }
            _ => None,
        };
        match waited {
            Some(Ok(exit)) => self.finish(&key, exit).await,
            Some(Err(e)) => {
                tracing::error!("Waiting for transfer of {} failed: {:#}", key, e);
                if let Some(record) = self.records.get_mut(&key) {
                    let failed = if record.is_replica() {
                        FileStatus::ErrorReplication
                    } else {
                        FileStatus::ErrorStaging
                    };
                    record.resolve(failed);
                }
            }
            None => {}
        }

        let status = self.peek_status(&key);
        match status {
            FileStatus::Staged => tracing::info!("✅ <{}> finished staging", key),
            FileStatus::Replicated => tracing::info!("✅ <{}> finished replicating", key),
            s if s.is_error() => tracing::error!(
                "Staging/replicating of <{}> failed. Giving up. Original file location will be used.",
                key
            ),
            _ => {}
        }

        self.admit_next(false).await;
        status
    }

    /// Drops a consumed file: cancels its transfer if still running and
    /// deletes the local copy. Releasing twice is a no-op.
    pub async fn release_file(&mut self, raw: &str) {
        let key = self.normalize(raw);
        self.refresh().await;

        if let Some(pos) = self.pending.iter().position(|k| *k == key) {
            self.pending.remove(pos);
            return;
        }

        self.release_key(&key).await;
        self.admit_next(false).await;
    }

    async fn release_key(&mut self, key: &str) {
        let keep_logfiles = self.config.keep_logfiles;
        let Some(record) = self.records.get_mut(key) else {
            return;
        };
        if record.status == FileStatus::Released {
            return;
        }
        tracing::debug!("release_file() : {}", key);

        if let Some(mut process) = record.process.take() {
            match process.kill().await {
                Ok(KillOutcome::Killed) => tracing::info!("Kill signal sent for {}", key),
                Ok(KillOutcome::AlreadyGone) => {
                    tracing::debug!("Transfer of {} already finished", key)
                }
                Err(e) => tracing::warn!("Could not kill transfer of {}: {:#}", key, e),
            }
            if record.outcome.is_none() {
                record.finished_at = Some(Utc::now());
            }
        }

        if !record.is_replica() && !record.out_path.is_empty() {
            if let Ok(meta) = tokio::fs::metadata(&record.out_path).await {
                record.observed_size.get_or_insert(meta.len());
            }
            remove_if_exists(Path::new(&record.out_path)).await;
        }
        if !keep_logfiles {
            for log in [record.stdout_log.as_deref(), record.stderr_log.as_deref()]
                .into_iter()
                .flatten()
            {
                remove_if_exists(log).await;
            }
        }

        record.status = FileStatus::Released;
    }

    /// Releases everything and forgets all files.
    pub async fn release_all(&mut self) {
        self.pending.clear();
        let keys: Vec<String> = self.records.keys().cloned().collect();
        for key in keys {
            self.release_key(&key).await;
        }
        self.records.clear();
    }

    pub async fn status_of(&mut self, raw: &str, refresh: bool) -> FileStatus {
        if refresh {
            self.refresh().await;
        }
        let key = self.normalize(raw);
        self.peek_status(&key)
    }

    fn peek_status(&self, key: &str) -> FileStatus {
        if self.pending.iter().any(|k| k == key) {
            return FileStatus::ToBeStaged;
        }
        self.records
            .get(key)
            .map(|r| r.status)
            .unwrap_or(FileStatus::Unknown)
    }

    /// Handle the consumer should open instead of `raw`, if staging succeeded.
    pub fn local_handle(&self, raw: &str) -> Option<String> {
        let record = self.records.get(&self.normalize(raw))?;
        match record.status {
            FileStatus::Staged => Some(format!("{}{}", self.config.out_prefix, record.out_path)),
            FileStatus::Replicated => Some(format!("{}{}", self.config.in_prefix, record.out_path)),
            _ => None,
        }
    }

    pub fn summary(&self) -> StagingSummary {
        let files: Vec<_> = self
            .records
            .iter()
            .map(|(name, record)| record.snapshot(name))
            .collect();
        let (staged_files, staged_bytes) = files
            .iter()
            .filter(|f| f.outcome == Some(FileStatus::Staged))
            .fold((0, 0), |(n, bytes), f| {
                (n + 1, bytes + f.observed_size.unwrap_or(0))
            });
        StagingSummary {
            generated_at: Utc::now(),
            pending: self.pending.iter().cloned().collect(),
            files,
            staged_files,
            staged_bytes,
        }
    }

    /// Logs the summary, releases every file and removes the session tmpdir.
    pub async fn shutdown(&mut self) -> StagingSummary {
        self.refresh().await;
        let summary = self.summary();
        for file in &summary.files {
            tracing::info!("Status <{}> : {}", file.name, file.status);
        }
        tracing::info!(
            "📊 Successfully staged {} MB over {} files",
            summary.staged_bytes / (1024 * 1024),
            summary.staged_files
        );

        self.release_all().await;
        if self.tmpdir != self.base_tmpdir {
            if let Err(e) = tokio::fs::remove_dir(&self.tmpdir).await {
                tracing::debug!("Keeping {}: {}", self.tmpdir.display(), e);
            }
        }
        summary
    }

    fn ensure_watchdog(&mut self) {
        if self.watchdog_submitted {
            return;
        }
        self.watchdog_submitted = true;
        let Some(command) = self.config.watchdog_command.as_deref() else {
            return;
        };
        let args = WatchdogArgs {
            parent_pid: std::process::id(),
            tmpdir: self.tmpdir.clone(),
            base_tmpdir: self.base_tmpdir.clone(),
            keep_logfiles: self.config.keep_logfiles,
            interval: self.config.watchdog_interval,
        };
        match watchdog::spawn_watchdog(command, &args) {
            Ok(pid) => tracing::info!("🐕 Watchdog {} started (pid {})", command, pid),
            Err(e) => tracing::error!(
                "❌ Failed to start watchdog, orphaned staged files will not be cleaned up: {}",
                e
            ),
        }
    }
}

/// Accepts the replica on `destination`, or any replica when none is set.
pub fn default_replica_selector(destination: Option<String>) -> ReplicaSelector {
    match destination {
        Some(dest) if !dest.is_empty() => Arc::new(move |replica: &str| replica.contains(&dest)),
        _ => Arc::new(|_: &str| true),
    }
}

async fn resolve_copy(key: &str, record: &mut FileRecord, exit: TransferExit) {
    if !exit.success() {
        let detail = match record.stderr_log.as_deref() {
            Some(log) => read_error_tail(log, ERROR_TAIL_LINES).await,
            None => None,
        };
        tracing::error!(
            "Copy of {} failed ({:?}): {}",
            key,
            exit,
            detail.unwrap_or_default()
        );
        record.resolve(FileStatus::ErrorStaging);
        return;
    }

    match tokio::fs::metadata(&record.out_path).await {
        Ok(meta) => {
            let local = meta.len();
            record.observed_size = Some(local);
            tracing::info!(
                "Local file size: {}, original file size: {:?}",
                local,
                record.original_size
            );
            match record.original_size {
                Some(original) if original > local => {
                    tracing::error!(
                        "{} only partially staged ({} of {} bytes), probably due to lack of free disk space",
                        key,
                        local,
                        original
                    );
                    record.resolve(FileStatus::ErrorStaging);
                }
                _ => record.resolve(FileStatus::Staged),
            }
        }
        Err(e) => {
            tracing::error!("{} does not exist on local storage: {}", record.out_path, e);
            record.resolve(FileStatus::ErrorStaging);
        }
    }
}

async fn resolve_replication(
    key: &str,
    record: &mut FileRecord,
    exit: TransferExit,
    executor: &dyn TransferExecutor,
    selector: &ReplicaSelector,
) {
    if !exit.success() {
        let detail = match record.stderr_log.as_deref() {
            Some(log) => read_error_tail(log, ERROR_TAIL_LINES).await,
            None => None,
        };
        tracing::error!(
            "Replication of {} failed ({:?}): {}",
            key,
            exit,
            detail.unwrap_or_default()
        );
        record.resolve(FileStatus::ErrorReplication);
        return;
    }

    match executor.list_replicas(&record.in_path).await {
        Ok(replicas) => match replicas.into_iter().find(|r| selector(r.as_str())) {
            Some(replica) => {
                tracing::info!("Local replica found: {}", replica);
                record.out_path = replica;
                record.resolve(FileStatus::Replicated);
            }
            None => {
                tracing::error!("No usable replica of {} listed", key);
                record.resolve(FileStatus::ErrorReplication);
            }
        },
        Err(e) => {
            tracing::error!("Listing replicas of {} failed: {:#}", key, e);
            record.resolve(FileStatus::ErrorReplication);
        }
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!("Could not remove file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::admission::tests::FixedSpace;
    use crate::services::transfer::TransferProcess;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    type Slot = Arc<Mutex<Option<TransferExit>>>;

    /// A transfer the test finishes by filling its slot.
    struct ManualProcess {
        slot: Slot,
    }

    #[async_trait]
    impl TransferProcess for ManualProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        fn try_wait(&mut self) -> anyhow::Result<Option<TransferExit>> {
            Ok(*self.slot.lock().unwrap())
        }

        async fn wait(&mut self) -> anyhow::Result<TransferExit> {
            loop {
                let done = *self.slot.lock().unwrap();
                if let Some(exit) = done {
                    return Ok(exit);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn kill(&mut self) -> anyhow::Result<KillOutcome> {
            let mut slot = self.slot.lock().unwrap();
            if slot.is_some() {
                return Ok(KillOutcome::AlreadyGone);
            }
            *slot = Some(TransferExit::Signaled(9));
            Ok(KillOutcome::Killed)
        }
    }

    #[derive(Default)]
    struct ManualExecutor {
        sizes: HashMap<String, u64>,
        /// Bytes written to the destination when a copy starts.
        written: HashMap<String, usize>,
        slots: Mutex<HashMap<String, Slot>>,
        replicas: Vec<String>,
    }

    impl ManualExecutor {
        fn complete(&self, source: &str, exit: TransferExit) {
            let slots = self.slots.lock().unwrap();
            *slots[source].lock().unwrap() = Some(exit);
        }

        fn process_for(&self, source: &str) -> Box<dyn TransferProcess> {
            let slot: Slot = Arc::new(Mutex::new(None));
            self.slots
                .lock()
                .unwrap()
                .insert(source.to_string(), slot.clone());
            Box::new(ManualProcess { slot })
        }
    }

    #[async_trait]
    impl TransferExecutor for ManualExecutor {
        async fn remote_size(&self, source: &str) -> anyhow::Result<u64> {
            self.sizes
                .get(source)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no such file"))
        }

        fn spawn_copy(
            &self,
            source: &str,
            dest: &Path,
            _logs: &TransferLogs,
        ) -> anyhow::Result<Box<dyn TransferProcess>> {
            let n = self.written.get(source).copied().unwrap_or(0);
            std::fs::write(dest, vec![0u8; n])?;
            Ok(self.process_for(source))
        }

        fn spawn_replicate(
            &self,
            source: &str,
            _logs: &TransferLogs,
        ) -> anyhow::Result<Box<dyn TransferProcess>> {
            Ok(self.process_for(source))
        }

        async fn list_replicas(&self, _source: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.replicas.clone())
        }
    }

    fn setup(
        executor: Arc<ManualExecutor>,
        pipe_depth: usize,
        space: Option<HashMap<PathBuf, u64>>,
    ) -> (tempfile::TempDir, Stager) {
        let base = tempfile::tempdir().unwrap();
        let config = StagerConfig {
            pipe_depth,
            base_tmpdir: base.path().to_path_buf(),
            session_id: 7,
            replica_destination: Some("se.example.org".to_string()),
            ..StagerConfig::development()
        };
        let mut stager = Stager::with_executor(Arc::new(config), executor);
        if let Some(space) = space {
            stager = stager.with_space_probe(Arc::new(FixedSpace(space)));
        }
        (base, stager)
    }

    fn executor(files: &[(&str, u64)]) -> ManualExecutor {
        ManualExecutor {
            sizes: files.iter().map(|(f, s)| (f.to_string(), *s)).collect(),
            written: files.iter().map(|(f, s)| (f.to_string(), *s as usize)).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pipe_depth_bounds_admission() {
        let exec = Arc::new(executor(&[("A", 4), ("B", 4), ("C", 4)]));
        let (_base, mut stager) = setup(exec.clone(), 1, None);

        for f in ["A", "B", "C"] {
            stager.enqueue(f).await;
        }
        assert_eq!(stager.status_of("A", true).await, FileStatus::Staging);
        assert_eq!(stager.status_of("B", true).await, FileStatus::ToBeStaged);
        assert_eq!(stager.pending_files().collect::<Vec<_>>(), vec!["B", "C"]);

        exec.complete("A", TransferExit::Exited(0));
        assert_eq!(stager.get_file("A").await, FileStatus::Staged);
        assert_eq!(stager.status_of("B", false).await, FileStatus::Staging);
        assert!(stager.tmp_filename("A").ends_with("tcf_A"));
        assert_eq!(stager.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_out_of_turn_fetch_bypasses_depth() {
        let exec = Arc::new(executor(&[("A", 1), ("D", 1)]));
        let (_base, mut stager) = setup(exec.clone(), 1, None);
        stager.enqueue("A").await;

        // D is not queued: it is admitted at once even though A occupies the pipe.
        let handle = tokio::spawn(async move {
            let status = stager.get_file("D").await;
            (stager, status)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        exec.complete("D", TransferExit::Exited(0));
        let (mut stager, status) = handle.await.unwrap();
        assert_eq!(status, FileStatus::Staged);
        assert!(stager.local_handle("D").is_some());
        assert_eq!(stager.status_of("A", true).await, FileStatus::Staging);
    }

    #[tokio::test]
    async fn test_partial_transfer_is_an_error() {
        let mut exec = executor(&[("P", 100)]);
        exec.written.insert("P".to_string(), 10);
        let exec = Arc::new(exec);
        let (_base, mut stager) = setup(exec.clone(), 1, None);

        stager.enqueue("P").await;
        exec.complete("P", TransferExit::Exited(0));
        assert_eq!(stager.get_file("P").await, FileStatus::ErrorStaging);
        assert!(stager.local_handle("P").is_none());
    }

    #[tokio::test]
    async fn test_release_kills_and_is_idempotent() {
        let exec = Arc::new(executor(&[("A", 3)]));
        let (_base, mut stager) = setup(exec.clone(), 1, None);
        stager.enqueue("A").await;
        let local = stager.tmp_filename("A");
        assert!(local.exists());

        stager.release_file("A").await;
        assert_eq!(stager.status_of("A", true).await, FileStatus::Released);
        assert!(!local.exists());

        stager.release_file("A").await;
        assert_eq!(stager.status_of("A", false).await, FileStatus::Released);
    }

    #[tokio::test]
    async fn test_release_of_pending_file_drops_it() {
        let exec = Arc::new(executor(&[("A", 1), ("B", 1)]));
        let (_base, mut stager) = setup(exec.clone(), 1, None);
        stager.enqueue("A").await;
        stager.enqueue("B").await;
        stager.release_file("B").await;
        assert_eq!(stager.status_of("B", false).await, FileStatus::Unknown);
    }

    #[tokio::test]
    async fn test_shared_dir_fallback() {
        let shared = tempfile::tempdir().unwrap();
        let exec = Arc::new(executor(&[("E", 500)]));
        let base = tempfile::tempdir().unwrap();
        let config = StagerConfig {
            base_tmpdir: base.path().to_path_buf(),
            fallback_dir: Some(shared.path().to_path_buf()),
            session_id: 8,
            ..StagerConfig::development()
        };
        let stager = Stager::with_executor(Arc::new(config), exec.clone());
        let space = HashMap::from([
            (stager.tmpdir().to_path_buf(), 100),
            (shared.path().to_path_buf(), 10_000),
        ]);
        let mut stager = stager.with_space_probe(Arc::new(FixedSpace(space)));

        stager.enqueue("E").await;
        let record = stager.record("E").unwrap();
        assert_eq!(record.fallback(), crate::models::FallbackStrategy::SharedDir);
        assert!(record.out_path.starts_with(&*shared.path().to_string_lossy()));
    }

    #[tokio::test]
    async fn test_same_basename_is_reported_as_owned() {
        let exec = Arc::new(executor(&[("/r1/x.dst", 2), ("/r2/x.dst", 2)]));
        let (_base, mut stager) = setup(exec.clone(), 2, None);

        stager.enqueue("/r1/x.dst").await;
        let dest = stager.tmp_filename("/r2/x.dst");
        assert_eq!(dest, stager.tmp_filename("/r1/x.dst"));
        assert_eq!(stager.local_owner("/r2/x.dst", &dest), Some("/r1/x.dst"));
        assert_eq!(stager.local_owner("/r1/x.dst", &dest), None);

        stager.release_file("/r1/x.dst").await;
        assert_eq!(stager.local_owner("/r2/x.dst", &dest), None);
    }

    #[tokio::test]
    async fn test_transfer_logs_follow_log_dir() {
        let logs = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let config = StagerConfig {
            base_tmpdir: base.path().to_path_buf(),
            log_dir: Some(logs.path().to_path_buf()),
            keep_logfiles: true,
            session_id: 9,
            ..StagerConfig::development()
        };
        let exec = Arc::new(executor(&[("A", 1)]));
        let mut stager = Stager::with_executor(Arc::new(config), exec);

        stager.enqueue("A").await;
        let record = stager.record("A").unwrap();
        assert_eq!(
            record.stderr_log.as_deref(),
            Some(logs.path().join("tcf_A.err").as_path())
        );
        assert!(record.out_path.starts_with(&*stager.tmpdir().to_string_lossy()));
    }

    #[tokio::test]
    async fn test_replication_when_no_space() {
        let mut exec = executor(&[("R", 1_000)]);
        exec.replicas = vec![
            "srm://other.example.net/R".to_string(),
            "srm://se.example.org/R".to_string(),
        ];
        let exec = Arc::new(exec);
        let (_base, mut stager) = setup(exec.clone(), 1, Some(HashMap::new()));

        stager.enqueue("R").await;
        assert_eq!(stager.status_of("R", false).await, FileStatus::Replicating);
        exec.complete("R", TransferExit::Exited(0));
        assert_eq!(stager.get_file("R").await, FileStatus::Replicated);
        assert_eq!(
            stager.local_handle("R").as_deref(),
            Some("srm://se.example.org/R")
        );
    }

    #[tokio::test]
    async fn test_replication_without_matching_replica_fails() {
        let mut exec = executor(&[("R", 1_000)]);
        exec.replicas = vec!["srm://other.example.net/R".to_string()];
        let exec = Arc::new(exec);
        let (_base, mut stager) = setup(exec.clone(), 1, Some(HashMap::new()));

        stager.enqueue("R").await;
        exec.complete("R", TransferExit::Exited(0));
        assert_eq!(stager.get_file("R").await, FileStatus::ErrorReplication);
    }
}
