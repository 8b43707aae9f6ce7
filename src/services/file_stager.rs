use crate::error::{Result, StagerError};
use crate::models::{FileStatus, StagingSummary};
use crate::services::stager::Stager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sequential consumer view over a [`Stager`].
///
/// The consumer hands over its whole input list once, then walks it with
/// [`advance`](Self::advance). Each step releases the previous file (unless
/// releasing is disabled) and blocks until the next one is staged.
pub struct FileStagerService {
    stager: Arc<Mutex<Stager>>,
    release_files: bool,
    files: Vec<String>,
    cursor: usize,
    current: Option<String>,
}

impl FileStagerService {
    pub fn new(stager: Arc<Mutex<Stager>>, release_files: bool) -> Self {
        Self {
            stager,
            release_files,
            files: Vec::new(),
            cursor: 0,
            current: None,
        }
    }

    pub fn stager(&self) -> Arc<Mutex<Stager>> {
        self.stager.clone()
    }

    /// Replaces the input list and queues every file for prefetching.
    pub async fn set_file_list<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self.cursor = 0;
        self.current = None;

        let mut stager = self.stager.lock().await;
        for file in &self.files {
            stager.enqueue(file).await;
        }
        tracing::info!("📋 {} files queued for staging", self.files.len());
    }

    /// Local names the input files will have once staged, in input order.
    pub async fn output_collection(&self) -> Vec<PathBuf> {
        let stager = self.stager.lock().await;
        self.files.iter().map(|f| stager.tmp_filename(f)).collect()
    }

    /// Moves to the next input file. Returns the file and its final status,
    /// or `None` at the end of the list.
    pub async fn advance(&mut self) -> Option<(String, FileStatus)> {
        let mut stager = self.stager.lock().await;
        if let Some(prev) = self.current.take() {
            if self.release_files {
                stager.release_file(&prev).await;
            }
        }

        let next = self.files.get(self.cursor)?.clone();
        self.cursor += 1;
        let status = stager.get_file(&next).await;
        self.current = Some(next.clone());
        Some((next, status))
    }

    /// Handle the consumer should open for `file`.
    pub async fn get_local_path(&self, file: &str) -> Result<String> {
        let mut stager = self.stager.lock().await;
        match stager.status_of(file, false).await {
            FileStatus::Unknown => Err(StagerError::UnknownFile(file.to_string())),
            _ => stager.local_handle(file).ok_or_else(|| StagerError::NotStaged {
                dataset: file.to_string(),
            }),
        }
    }

    /// Handle for `file`, or `file` itself when no local copy exists.
    pub async fn resolve_path(&self, file: &str) -> String {
        match self.get_local_path(file).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("{}. Using the original location.", e);
                file.to_string()
            }
        }
    }

    /// Releases everything and returns the job's staging summary.
    pub async fn finalize(&mut self) -> StagingSummary {
        self.current = None;
        self.stager.lock().await.shutdown().await
    }
}
