use crate::error::{Result, StagerError};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables probed, in order, for the base temporary directory.
pub const TMPDIR_ENV_VARS: &[&str] = &["WORKDIR", "EDG_WL_SCRATCH", "OSG_WN_TMP", "TMPDIR"];

pub const FALLBACK_TMPDIR: &str = "/tmp";

/// An external tool invocation: program plus argument templates.
///
/// Arguments may contain `{vo}`, `{streams}`, `{timeout}` and `{dest}`
/// placeholders which are filled in per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Values substituted into [`ToolCommand`] argument templates.
#[derive(Debug, Clone, Default)]
pub struct ToolContext<'a> {
    pub vo: &'a str,
    pub streams: u32,
    pub timeout_secs: u64,
    pub dest: &'a str,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Splits a command line on whitespace: first word is the program.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let program = words.next()?.to_string();
        Some(Self {
            program,
            args: words.map(str::to_string).collect(),
        })
    }

    pub fn render_args(&self, ctx: &ToolContext<'_>) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{vo}", ctx.vo)
                    .replace("{streams}", &ctx.streams.to_string())
                    .replace("{timeout}", &ctx.timeout_secs.to_string())
                    .replace("{dest}", ctx.dest)
            })
            .collect()
    }
}

/// Stager configuration. Built once before staging starts and shared read-only.
#[derive(Debug, Clone)]
pub struct StagerConfig {
    /// Maximum number of concurrent transfers (default: 1)
    pub pipe_depth: usize,

    /// Protocol marker stripped from input handles (default: "gfal:")
    pub in_prefix: String,

    /// Protocol marker added to local handles (default: "file:")
    pub out_prefix: String,

    /// Root for local staging; the session directory is created below it
    pub base_tmpdir: PathBuf,

    /// Shared directory used when local space is insufficient
    pub fallback_dir: Option<PathBuf>,

    /// Directory for per-transfer stdout/stderr logs (default: session tmpdir).
    ///
    /// The watchdog only cleans the session tmpdir. Logs written elsewhere
    /// survive a crash of the stager and have to be removed by the caller.
    pub log_dir: Option<PathBuf>,

    /// Keep per-transfer logs after release (default: false)
    pub keep_logfiles: bool,

    /// Delete consumed files as soon as the next one is requested (default: true)
    pub release_files: bool,

    /// Parallel streams per transfer (default: 1)
    pub parallel_streams: u32,

    /// Timeout handed to the transfer tool (default: 500 s)
    pub transfer_timeout: Duration,

    /// Virtual organization passed to the grid tools (default: "lhcb")
    pub vo: String,

    /// Malformed protocol prefix -> corrected prefix
    pub prefix_fixups: BTreeMap<String, String>,

    /// First-occurrence rewrites applied to the source handed to the tools
    pub source_rewrites: Vec<(String, String)>,

    pub copy_tool: ToolCommand,
    pub replicate_tool: ToolCommand,
    pub list_replicas_tool: ToolCommand,
    pub size_tool: ToolCommand,

    /// Storage element that replications target; also selects the replica
    pub replica_destination: Option<String>,

    /// Watchdog executable; `None` disables crash cleanup
    pub watchdog_command: Option<String>,

    /// Liveness poll interval of the watchdog (default: 10 s)
    pub watchdog_interval: Duration,

    /// Identifier for the session tmpdir (default: current pid)
    pub session_id: u32,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            pipe_depth: 1,
            in_prefix: "gfal:".to_string(),
            out_prefix: "file:".to_string(),
            base_tmpdir: default_base_tmpdir(|k| env::var(k).ok()),
            fallback_dir: None,
            log_dir: None,
            keep_logfiles: false,
            release_files: true,
            parallel_streams: 1,
            transfer_timeout: Duration::from_secs(500),
            vo: "lhcb".to_string(),
            prefix_fixups: default_prefix_fixups(),
            source_rewrites: vec![
                ("LFN:".to_string(), "lfn:".to_string()),
                ("lfn:/lhcb".to_string(), "lfn:/grid/lhcb".to_string()),
            ],
            copy_tool: ToolCommand::new(
                "lcg-cp",
                &["--vo", "{vo}", "-n", "{streams}", "--sendreceive-timeout", "{timeout}"],
            ),
            replicate_tool: ToolCommand::new(
                "lcg-rep",
                &[
                    "--vo",
                    "{vo}",
                    "-n",
                    "{streams}",
                    "--sendreceive-timeout",
                    "{timeout}",
                    "-d",
                    "{dest}",
                ],
            ),
            list_replicas_tool: ToolCommand::new("lcg-lr", &["--vo", "{vo}"]),
            size_tool: ToolCommand::new("gfal-ls", &["-l"]),
            replica_destination: None,
            watchdog_command: Some("stager_watchdog".to_string()),
            watchdog_interval: Duration::from_secs(10),
            session_id: std::process::id(),
        }
    }
}

impl StagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let flag = |key: &str, fallback: bool| {
            lookup(key)
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(fallback)
        };
        let tool = |key: &str, fallback: ToolCommand| {
            lookup(key)
                .and_then(|v| ToolCommand::parse(&v))
                .unwrap_or(fallback)
        };

        let mut prefix_fixups = default.prefix_fixups.clone();
        if let Some(extra) = lookup("STAGER_PREFIX_FIXUPS") {
            // "bad=>good,bad2=>good2"
            for pair in extra.split(',') {
                if let Some((from, to)) = pair.split_once("=>") {
                    prefix_fixups
                        .entry(from.trim().to_string())
                        .or_insert_with(|| to.trim().to_string());
                }
            }
        }

        Self {
            pipe_depth: lookup("STAGER_PIPE_DEPTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.pipe_depth),

            in_prefix: lookup("STAGER_IN_PREFIX").unwrap_or(default.in_prefix),

            out_prefix: lookup("STAGER_OUT_PREFIX").unwrap_or(default.out_prefix),

            base_tmpdir: lookup("STAGER_BASE_TMPDIR")
                .map(|v| trim_trailing_slashes(&v))
                .unwrap_or_else(|| default_base_tmpdir(&lookup)),

            fallback_dir: lookup("STAGER_FALLBACK_DIR").map(PathBuf::from),

            log_dir: lookup("STAGER_LOG_DIR").map(PathBuf::from),

            keep_logfiles: flag("STAGER_KEEP_LOGFILES", default.keep_logfiles),

            release_files: flag("STAGER_RELEASE_FILES", default.release_files),

            parallel_streams: lookup("STAGER_PARALLEL_STREAMS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.parallel_streams),

            transfer_timeout: lookup("STAGER_TRANSFER_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.transfer_timeout),

            vo: lookup("STAGER_VO").unwrap_or(default.vo),

            prefix_fixups,

            source_rewrites: default.source_rewrites,

            copy_tool: tool("STAGER_COPY_COMMAND", default.copy_tool),
            replicate_tool: tool("STAGER_REPLICATE_COMMAND", default.replicate_tool),
            list_replicas_tool: tool("STAGER_LIST_REPLICAS_COMMAND", default.list_replicas_tool),
            size_tool: tool("STAGER_SIZE_COMMAND", default.size_tool),

            replica_destination: lookup("STAGER_REPLICA_DESTINATION"),

            watchdog_command: match lookup("STAGER_WATCHDOG_COMMAND") {
                Some(v) if v.is_empty() || v == "none" => None,
                Some(v) => Some(v),
                None => default.watchdog_command,
            },

            watchdog_interval: lookup("STAGER_WATCHDOG_INTERVAL")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.watchdog_interval),

            session_id: default.session_id,
        }
    }

    /// Local tools only: plain `cp`/`stat`, no grid flags, no watchdog.
    pub fn development() -> Self {
        Self {
            in_prefix: String::new(),
            out_prefix: String::new(),
            source_rewrites: Vec::new(),
            copy_tool: ToolCommand::new("cp", &[]),
            replicate_tool: ToolCommand::new("false", &[]),
            list_replicas_tool: ToolCommand::new("echo", &[]),
            size_tool: ToolCommand::new("stat", &["-c", "%s"]),
            watchdog_command: None,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipe_depth == 0 {
            return Err(StagerError::InvalidConfig(
                "pipe_depth must be at least 1".to_string(),
            ));
        }
        if self.parallel_streams == 0 {
            return Err(StagerError::InvalidConfig(
                "parallel_streams must be at least 1".to_string(),
            ));
        }
        for (name, tool) in [
            ("copy", &self.copy_tool),
            ("replicate", &self.replicate_tool),
            ("list-replicas", &self.list_replicas_tool),
            ("size", &self.size_tool),
        ] {
            if tool.program.trim().is_empty() {
                return Err(StagerError::InvalidConfig(format!(
                    "{} tool has no program",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn tool_context(&self) -> ToolContext<'_> {
        ToolContext {
            vo: &self.vo,
            streams: self.parallel_streams,
            timeout_secs: self.transfer_timeout.as_secs(),
            dest: self.replica_destination.as_deref().unwrap_or(""),
        }
    }

    /// `<base_tmpdir>/<user>_pID<session_id>`
    pub fn session_tmpdir(&self) -> PathBuf {
        let user = env::var("USER").unwrap_or_else(|_| "stager".to_string());
        self.base_tmpdir
            .join(format!("{}_pID{}", user, self.session_id))
    }

    /// Creates the process-unique session directory.
    ///
    /// Returns `(tmpdir, base_tmpdir)`. When the session directory cannot be
    /// created the environment-derived base is used directly for both.
    pub fn create_session_tmpdir(&self) -> (PathBuf, PathBuf) {
        let dir = self.session_tmpdir();
        match create_private_dir(&dir) {
            Ok(()) => {
                tracing::info!("📁 Tmpdir set to {}", dir.display());
                (dir, self.base_tmpdir.clone())
            }
            Err(e) => {
                let base = default_base_tmpdir(|k| env::var(k).ok());
                tracing::warn!(
                    "No permission to write in temporary directory {} ({}). Switching to {}",
                    self.base_tmpdir.display(),
                    e,
                    base.display()
                );
                (base.clone(), base)
            }
        }
    }
}

pub fn default_prefix_fixups() -> BTreeMap<String, String> {
    [
        ("lfn/", "lfn:/"),
        ("srm/", "srm:/"),
        ("sfn/", "sfn:/"),
        ("gsiftp/", "gsiftp:/"),
        ("rfio/", "rfio:/"),
        ("http/", "http:/"),
        ("file/", "file:/"),
        ("ftp/", "ftp:/"),
        ("FID:", "guid:"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// First of `WORKDIR`, `EDG_WL_SCRATCH`, `OSG_WN_TMP`, `TMPDIR` that is set,
/// else `/tmp`.
pub fn default_base_tmpdir<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    TMPDIR_ENV_VARS
        .iter()
        .find_map(|var| lookup(var).filter(|v| !v.is_empty()))
        .map(|v| trim_trailing_slashes(&v))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_TMPDIR))
}

fn trim_trailing_slashes(dir: &str) -> PathBuf {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    match builder.create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}
