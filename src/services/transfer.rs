use crate::config::{StagerConfig, ToolCommand};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};

/// How a transfer subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferExit {
    Exited(i32),
    Signaled(i32),
}

impl TransferExit {
    pub fn success(self) -> bool {
        self == TransferExit::Exited(0)
    }
}

impl From<ExitStatus> for TransferExit {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return TransferExit::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return TransferExit::Signaled(signal);
            }
        }
        TransferExit::Exited(-1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    /// The process had already exited; nothing to cancel.
    AlreadyGone,
}

/// Handle to one running transfer.
#[async_trait]
pub trait TransferProcess: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// Non-blocking poll. `None` while still running.
    fn try_wait(&mut self) -> Result<Option<TransferExit>>;

    /// Blocks until the process exits.
    async fn wait(&mut self) -> Result<TransferExit>;

    /// Kills the process and reaps it.
    async fn kill(&mut self) -> Result<KillOutcome>;
}

/// Where a spawned transfer writes its stdout/stderr.
#[derive(Debug, Clone)]
pub struct TransferLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// The external transfer backend.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Size in bytes of the remote file.
    async fn remote_size(&self, source: &str) -> Result<u64>;

    /// Starts copying `source` to the local path `dest`.
    fn spawn_copy(
        &self,
        source: &str,
        dest: &Path,
        logs: &TransferLogs,
    ) -> Result<Box<dyn TransferProcess>>;

    /// Starts a remote-to-remote replication of `source`.
    fn spawn_replicate(&self, source: &str, logs: &TransferLogs)
    -> Result<Box<dyn TransferProcess>>;

    /// Lists the known replicas of `source`. Runs synchronously to completion.
    async fn list_replicas(&self, source: &str) -> Result<Vec<String>>;
}

/// [`TransferProcess`] over a tokio child.
pub struct ChildProcess {
    child: Child,
    exit: Option<TransferExit>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child, exit: None }
    }
}

#[async_trait]
impl TransferProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<TransferExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let status = self.child.try_wait()?;
        self.exit = status.map(TransferExit::from);
        Ok(self.exit)
    }

    async fn wait(&mut self) -> Result<TransferExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = TransferExit::from(self.child.wait().await?);
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn kill(&mut self) -> Result<KillOutcome> {
        if self.try_wait()?.is_some() {
            return Ok(KillOutcome::AlreadyGone);
        }
        match self.child.start_kill() {
            Ok(()) => {
                let exit = TransferExit::from(self.child.wait().await?);
                self.exit = Some(exit);
                Ok(KillOutcome::Killed)
            }
            // Exited between the poll and the signal.
            Err(e)
                if e.kind() == std::io::ErrorKind::InvalidInput
                    || e.raw_os_error() == Some(libc::ESRCH) =>
            {
                let _ = self.try_wait();
                Ok(KillOutcome::AlreadyGone)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Runs the configured command-line tools (`lcg-cp`, `lcg-rep`, ...).
pub struct CommandTransferExecutor {
    config: Arc<StagerConfig>,
}

impl CommandTransferExecutor {
    pub fn new(config: Arc<StagerConfig>) -> Self {
        Self { config }
    }

    fn command(&self, tool: &ToolCommand) -> Command {
        let mut cmd = Command::new(&tool.program);
        cmd.args(tool.render_args(&self.config.tool_context()));
        cmd.stdin(Stdio::null());
        cmd
    }

    fn spawn_logged(
        &self,
        mut cmd: Command,
        program: &str,
        logs: &TransferLogs,
    ) -> Result<Box<dyn TransferProcess>> {
        let stdout = File::create(&logs.stdout)
            .with_context(|| format!("creating log {}", logs.stdout.display()))?;
        let stderr = File::create(&logs.stderr)
            .with_context(|| format!("creating log {}", logs.stderr.display()))?;
        cmd.stdout(stdout).stderr(stderr);
        let child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", program))?;
        tracing::debug!(pid = ?child.id(), "Spawned {}", program);
        Ok(Box::new(ChildProcess::new(child)))
    }

    /// Runs a tool to completion and returns its stdout.
    async fn run_to_completion(&self, tool: &ToolCommand, source: &str) -> Result<String> {
        let output = self
            .command(tool)
            .arg(source)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("running {}", tool.program))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} {} failed ({:?}): {}",
                tool.program,
                source,
                TransferExit::from(output.status),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TransferExecutor for CommandTransferExecutor {
    async fn remote_size(&self, source: &str) -> Result<u64> {
        let stdout = self.run_to_completion(&self.config.size_tool, source).await?;
        parse_size_output(&stdout)
            .ok_or_else(|| anyhow!("Unexpected size output for {}: {}", source, stdout.trim()))
    }

    fn spawn_copy(
        &self,
        source: &str,
        dest: &Path,
        logs: &TransferLogs,
    ) -> Result<Box<dyn TransferProcess>> {
        let tool = &self.config.copy_tool;
        let mut cmd = self.command(tool);
        cmd.arg(source)
            .arg(format!("{}{}", self.config.out_prefix, dest.display()));
        self.spawn_logged(cmd, &tool.program, logs)
    }

    fn spawn_replicate(
        &self,
        source: &str,
        logs: &TransferLogs,
    ) -> Result<Box<dyn TransferProcess>> {
        let tool = &self.config.replicate_tool;
        let mut cmd = self.command(tool);
        cmd.arg(source);
        self.spawn_logged(cmd, &tool.program, logs)
    }

    async fn list_replicas(&self, source: &str) -> Result<Vec<String>> {
        let stdout = self
            .run_to_completion(&self.config.list_replicas_tool, source)
            .await?;
        Ok(stdout.split_whitespace().map(str::to_string).collect())
    }
}

/// Accepts either a bare byte count or an `ls -l` style line
/// (`perms links owner group size ...`).
pub fn parse_size_output(output: &str) -> Option<u64> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    if let Ok(size) = line.parse() {
        return Some(size);
    }
    line.split_whitespace().nth(4)?.parse().ok()
}

/// Last non-empty lines of a transfer's stderr log, for error reports.
pub async fn read_error_tail(path: &Path, max_lines: usize) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(max_lines);
    Some(lines[start..].join(" | "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_output() {
        assert_eq!(parse_size_output("1048576\n"), Some(1_048_576));
        assert_eq!(
            parse_size_output("-rw-r--r--   1 101  2688   2147483648 Jul  7 13:56 lfn:/grid/x.dst\n"),
            Some(2_147_483_648)
        );
        assert_eq!(parse_size_output(""), None);
        assert_eq!(parse_size_output("no such file"), None);
    }

    #[test]
    fn test_exit_success() {
        assert!(TransferExit::Exited(0).success());
        assert!(!TransferExit::Exited(1).success());
        assert!(!TransferExit::Signaled(9).success());
    }

    #[tokio::test]
    async fn test_child_process_kill_after_exit_is_already_gone() {
        let child = Command::new("true").spawn().unwrap();
        let mut process = ChildProcess::new(child);
        assert_eq!(process.wait().await.unwrap(), TransferExit::Exited(0));
        assert_eq!(process.kill().await.unwrap(), KillOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_child_process_kill_running() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut process = ChildProcess::new(child);
        assert!(process.try_wait().unwrap().is_none());
        assert_eq!(process.kill().await.unwrap(), KillOutcome::Killed);
        assert_eq!(
            process.try_wait().unwrap(),
            Some(TransferExit::Signaled(libc::SIGKILL))
        );
    }

    #[tokio::test]
    async fn test_read_error_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tcf_x.err");
        tokio::fs::write(&path, "first\n\nsecond\nthird\n").await.unwrap();
        assert_eq!(
            read_error_tail(&path, 2).await.as_deref(),
            Some("second | third")
        );
        assert!(read_error_tail(&dir.path().join("missing"), 2).await.is_none());
    }
}
