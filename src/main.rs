use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use file_stager::{FileStagerService, Stager, StagerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Prefetches remote files to local disk ahead of a sequential consumer.
#[derive(Parser, Debug)]
#[command(name = "file-stager", version, about)]
struct Cli {
    /// Files to process, in order
    files: Vec<String>,

    /// Read additional files from PATH, one per line (`#` starts a comment)
    #[arg(long, value_name = "PATH")]
    file_list: Option<PathBuf>,

    /// Maximum number of concurrent transfers
    #[arg(long)]
    pipe_depth: Option<usize>,

    /// Directory the per-session staging directory is created in
    #[arg(long)]
    base_tmpdir: Option<PathBuf>,

    /// Shared directory used when the local disk is full
    #[arg(long)]
    fallback_dir: Option<PathBuf>,

    /// Parallel streams per transfer
    #[arg(long)]
    parallel_streams: Option<u32>,

    /// Keep transfer log files after release
    #[arg(long)]
    keep_logfiles: bool,

    /// Do not delete staged files once processed
    #[arg(long)]
    no_release: bool,

    /// Command run for each file; `{}` is replaced with the local path
    #[arg(long, value_name = "CMD")]
    exec: Option<String>,

    /// Print the staging summary as JSON on exit
    #[arg(long)]
    summary_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut StagerConfig) {
        if let Some(depth) = self.pipe_depth {
            config.pipe_depth = depth;
        }
        if let Some(dir) = &self.base_tmpdir {
            config.base_tmpdir = dir.clone();
        }
        if let Some(dir) = &self.fallback_dir {
            config.fallback_dir = Some(dir.clone());
        }
        if let Some(streams) = self.parallel_streams {
            config.parallel_streams = streams;
        }
        if self.keep_logfiles {
            config.keep_logfiles = true;
        }
        if self.no_release {
            config.release_files = false;
        }
    }

    async fn collect_files(&self) -> anyhow::Result<Vec<String>> {
        let mut files = self.files.clone();
        if let Some(path) = &self.file_list {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading file list {}", path.display()))?;
            files.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }
        Ok(files)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "file_stager=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let files = cli.collect_files().await?;

    let mut config = StagerConfig::from_env();
    cli.apply(&mut config);
    info!(
        "🚀 Starting file stager: {} files, pipe depth {}, base tmpdir {}",
        files.len(),
        config.pipe_depth,
        config.base_tmpdir.display()
    );

    let release_files = config.release_files;
    let stager = Stager::new(config)?;
    let mut service = FileStagerService::new(Arc::new(Mutex::new(stager)), release_files);

    let mut failures = 0usize;
    tokio::select! {
        result = process(&mut service, &files, cli.exec.as_deref(), &mut failures) => result?,
        _ = shutdown_signal() => {}
    }

    let summary = service.finalize().await;
    if cli.summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    info!("🛑 File stager finished.");
    if failures > 0 {
        error!("❌ {} commands failed", failures);
        std::process::exit(1);
    }
    Ok(())
}

async fn process(
    service: &mut FileStagerService,
    files: &[String],
    exec: Option<&str>,
    failures: &mut usize,
) -> anyhow::Result<()> {
    service.set_file_list(files.iter().cloned()).await;

    while let Some((file, _status)) = service.advance().await {
        let path = service.resolve_path(&file).await;
        let Some(template) = exec else {
            println!("{}", path);
            continue;
        };

        let command = template.replace("{}", &path);
        info!("▶️  Running: {}", command);
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .status()
            .await
            .with_context(|| format!("running {}", command))?;
        if !status.success() {
            warn!("Command for {} exited with {}", file, status);
            *failures += 1;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, releasing staged files...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, releasing staged files...");
        },
    }
}
