use clap::Parser;
use dotenvy::dotenv;
use file_stager::services::watchdog::{self, DEFAULT_POLL_INTERVAL, WatchdogArgs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Removes a stager's staged files once the stager process is gone.
#[derive(Parser, Debug)]
#[command(name = "stager_watchdog", version)]
struct Cli {
    /// Pid of the stager to monitor
    parent_pid: u32,

    /// Session staging directory to clean up
    tmpdir: PathBuf,

    /// Base directory; never removed
    base_tmpdir: PathBuf,

    /// 1 keeps transfer log files
    #[arg(default_value = "0")]
    keep_logfiles: String,

    #[arg(long, hide = true, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    interval_secs: u64,
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stager_watchdog=info,file_stager=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let args = WatchdogArgs {
        parent_pid: cli.parent_pid,
        tmpdir: cli.tmpdir,
        base_tmpdir: cli.base_tmpdir,
        keep_logfiles: cli.keep_logfiles.trim() == "1",
        interval: Duration::from_secs(cli.interval_secs.max(1)),
    };

    watchdog::run_watchdog(&args).await;
    info!("🐕 Watchdog done.");
}
