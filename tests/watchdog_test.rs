use file_stager::services::watchdog::{self, WatchdogArgs, is_pid_alive};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Pid of a process that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

fn session_dir(base: &TempDir) -> std::path::PathBuf {
    let tmpdir = base.path().join("tester_pID4242");
    std::fs::create_dir(&tmpdir).unwrap();
    for name in ["tcf_a.dst", "tcf_a.dst.out", "tcf_a.dst.err", "tcf_b.dst"] {
        std::fs::write(tmpdir.join(name), b"payload").unwrap();
    }
    tmpdir
}

#[tokio::test]
async fn test_dead_parent_triggers_cleanup() {
    let base = tempfile::tempdir().unwrap();
    let tmpdir = session_dir(&base);
    let pid = dead_pid();
    assert!(!is_pid_alive(pid));

    let args = WatchdogArgs {
        parent_pid: pid,
        tmpdir: tmpdir.clone(),
        base_tmpdir: base.path().to_path_buf(),
        keep_logfiles: false,
        interval: Duration::from_millis(10),
    };
    let report = tokio::time::timeout(Duration::from_secs(5), watchdog::run_watchdog(&args))
        .await
        .unwrap();

    assert_eq!(report.removed.len(), 4);
    assert!(report.removed_dir);
    assert!(!tmpdir.exists());
    assert!(base.path().exists());
}

#[tokio::test]
async fn test_keep_logfiles_spares_logs() {
    let base = tempfile::tempdir().unwrap();
    let tmpdir = session_dir(&base);

    let args = WatchdogArgs {
        parent_pid: dead_pid(),
        tmpdir: tmpdir.clone(),
        base_tmpdir: base.path().to_path_buf(),
        keep_logfiles: true,
        interval: Duration::from_millis(10),
    };
    let report = watchdog::run_watchdog(&args).await;

    assert_eq!(report.removed.len(), 2);
    assert_eq!(report.kept.len(), 2);
    assert!(!report.removed_dir);
    assert!(tmpdir.join("tcf_a.dst.out").exists());
    assert!(tmpdir.join("tcf_a.dst.err").exists());
    assert!(!tmpdir.join("tcf_a.dst").exists());
}

#[tokio::test]
async fn test_detached_watchdog_outlives_and_cleans_after_parent() {
    let base = tempfile::tempdir().unwrap();
    let tmpdir = session_dir(&base);

    let mut parent = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let args = WatchdogArgs {
        parent_pid: parent.id().unwrap(),
        tmpdir: tmpdir.clone(),
        base_tmpdir: base.path().to_path_buf(),
        keep_logfiles: false,
        interval: Duration::from_secs(1),
    };
    let watchdog_pid =
        watchdog::spawn_watchdog(env!("CARGO_BIN_EXE_stager_watchdog"), &args).unwrap();
    assert!(is_pid_alive(watchdog_pid));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(tmpdir.join("tcf_b.dst").exists());

    parent.kill().await.unwrap();
    assert!(wait_until_gone(&tmpdir, Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_sigterm_cleans_up_while_parent_lives() {
    let base = tempfile::tempdir().unwrap();
    let tmpdir = session_dir(&base);

    let args = WatchdogArgs {
        parent_pid: std::process::id(),
        tmpdir: tmpdir.clone(),
        base_tmpdir: base.path().to_path_buf(),
        keep_logfiles: false,
        interval: Duration::from_secs(1),
    };
    let watchdog_pid =
        watchdog::spawn_watchdog(env!("CARGO_BIN_EXE_stager_watchdog"), &args).unwrap();

    // Give the watchdog time to install its SIGTERM handler.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(tmpdir.join("tcf_a.dst").exists());

    let rc = unsafe { libc::kill(watchdog_pid as i32, libc::SIGTERM) };
    assert_eq!(rc, 0);

    assert!(wait_until_gone(&tmpdir, Duration::from_secs(10)).await);
    assert!(is_pid_alive(std::process::id()));
    assert!(base.path().exists());
}

async fn wait_until_gone(path: &Path, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}
