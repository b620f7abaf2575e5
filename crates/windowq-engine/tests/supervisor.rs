//! Tests for launching and classifying real job processes.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::tempdir;
use windowq_engine::Config;
use windowq_engine::WindowDescriptor;
use windowq_engine::WindowId;
use windowq_engine::ledger::TerminalStatus;
use windowq_engine::supervisor::ActiveJob;
use windowq_engine::supervisor::EnvironmentSnapshot;
use windowq_engine::supervisor::LaunchError;
use windowq_engine::supervisor::LocalSupervisor;
use windowq_engine::supervisor::Outcome;
use windowq_engine::supervisor::Supervisor;

fn supervisor() -> LocalSupervisor {
    let mut config = Config::default();
    config.supervisor.launch_grace_ms = 100;
    config.supervisor.cleanup = vec!["*.cpt".to_string()];

    let env: EnvironmentSnapshot = [
        ("PATH", std::env::var("PATH").unwrap_or_default()),
        ("WINDOWQ_TEST_VALUE", "snapshot".to_string()),
    ]
    .into_iter()
    .collect();

    LocalSupervisor::new(&config, env).unwrap()
}

fn window(dir: &Path, script: &str) -> WindowDescriptor {
    fs::write(dir.join("run.sh"), format!("#!/bin/sh\n{script}")).unwrap();
    WindowDescriptor::new(WindowId::new("lig", "bound", "vdw", 0), dir)
}

async fn wait_for_outcome(supervisor: &LocalSupervisor, job: &mut ActiveJob) -> TerminalStatus {
    for _ in 0..200 {
        if let Outcome::Terminal(status) = supervisor.poll_outcome(job) {
            return status;
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    panic!("job did not exit");
}

async fn launch(supervisor: &LocalSupervisor, window: WindowDescriptor, device: u32) -> ActiveJob {
    let handle = supervisor.launch(&window, device).await.unwrap();
    ActiveJob {
        window,
        device,
        handle,
        started: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn successful_job() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("prod.log"), "Finished mdrun\n").unwrap();
    fs::write(dir.path().join("state.cpt"), "").unwrap();
    fs::write(dir.path().join("topol.top"), "").unwrap();

    let window = window(
        dir.path(),
        "echo \"device=$CUDA_VISIBLE_DEVICES value=$WINDOWQ_TEST_VALUE home=$HOME\"\nsleep \
         0.5\necho 'Finished mdrun' > prod.log\n",
    );

    let supervisor = supervisor();
    let mut job = launch(&supervisor, window, 3).await;

    // Stale outputs are removed before launch; inputs are kept
    assert!(!dir.path().join("prod.log").exists());
    assert!(!dir.path().join("state.cpt").exists());
    assert!(dir.path().join("topol.top").exists());

    // The entry point was made executable
    let mode = fs::metadata(dir.path().join("run.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(mode & 0o111, 0);

    assert_eq!(
        supervisor.poll_outcome(&mut job),
        Outcome::Running,
        "job should still be running"
    );
    assert_eq!(
        wait_for_outcome(&supervisor, &mut job).await,
        TerminalStatus::Success
    );

    let log = fs::read_to_string(dir.path().join("windowq.log")).unwrap();
    assert_eq!(log, "device=3 value=snapshot home=\n");
}

#[tokio::test]
async fn incomplete_and_failed_jobs() {
    let dir = tempdir().unwrap();
    let supervisor = supervisor();

    let window_ = window(
        dir.path(),
        "echo 'step 100' > prod.log\nsleep 0.3\nexit 0\n",
    );
    let mut job = launch(&supervisor, window_, 0).await;
    assert_eq!(
        wait_for_outcome(&supervisor, &mut job).await,
        TerminalStatus::Incomplete
    );

    let window_ = window(dir.path(), "sleep 0.3\nexit 0\n");
    let mut job = launch(&supervisor, window_, 0).await;
    assert_eq!(
        wait_for_outcome(&supervisor, &mut job).await,
        TerminalStatus::Failed,
        "the previous artifact must not be reused"
    );
}

#[tokio::test]
async fn early_exit_is_a_launch_error() {
    let dir = tempdir().unwrap();
    let window = window(dir.path(), "echo 'Finished mdrun' > prod.log\nexit 0\n");

    match supervisor().launch(&window, 0).await {
        Err(e @ LaunchError::ExitedEarly { .. }) => assert!(e.pid().is_some_and(|p| p > 0)),
        r => panic!("unexpected result {r:?}"),
    }
}

#[tokio::test]
async fn missing_entry_point() {
    let dir = tempdir().unwrap();
    let window = WindowDescriptor::new(WindowId::new("lig", "bound", "vdw", 0), dir.path());

    assert!(matches!(
        supervisor().launch(&window, 0).await,
        Err(LaunchError::MissingEntryPoint(_))
    ));
}

#[tokio::test]
async fn adopted_process_is_tracked_by_pid() {
    let dir = tempdir().unwrap();
    let supervisor = supervisor();
    let window = window(dir.path(), "sleep 0.5\necho 'Finished mdrun' > prod.log\n");
    let mut job = launch(&supervisor, window.clone(), 1).await;

    let mut adopted = ActiveJob {
        window,
        device: 1,
        handle: supervisor.adopt(job.handle.pid(), job.started),
        started: job.started,
    };
    assert_eq!(supervisor.poll_outcome(&mut adopted), Outcome::Running);

    assert_eq!(
        wait_for_outcome(&supervisor, &mut job).await,
        TerminalStatus::Success
    );
    assert_eq!(
        wait_for_outcome(&supervisor, &mut adopted).await,
        TerminalStatus::Success
    );
}
