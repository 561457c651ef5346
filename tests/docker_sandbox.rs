//! End-to-end kernel tests against a live Docker daemon
//!
//! Run with `cargo test --test docker_sandbox -- --ignored`. The python and
//! bash images from the default settings must be present or pullable.

use anyhow::Result;
use dotenvy::dotenv;
use oxide_sandbox::config::SandboxSettings;
use oxide_sandbox::sandbox::{
    DockerRuntime, KernelState, Language, Reaper, SandboxError, SandboxManager,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing_subscriber::{prelude::*, EnvFilter};

// Every manager sweeps labelled containers it does not own, so tests sharing
// one daemon must not overlap
static DOCKER: Mutex<()> = Mutex::const_new(());

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

async fn docker_manager(
    configure: impl FnOnce(&mut SandboxSettings),
) -> Result<(TempDir, Arc<SandboxManager>)> {
    dotenv().ok();
    init_tracing();

    let dir = tempfile::tempdir()?;
    let mut settings = SandboxSettings {
        shared_dir: dir.path().join("shared"),
        ledger_path: Some(dir.path().join("kernels.ledger")),
        ..SandboxSettings::default()
    };
    configure(&mut settings);

    let runtime = DockerRuntime::connect(&settings).await?;
    let manager = SandboxManager::new(Arc::new(runtime), settings).await?;
    Ok((dir, Arc::new(manager)))
}

#[tokio::test]
#[ignore = "Requires Docker daemon"]
async fn test_python_state_persists_between_calls() -> Result<()> {
    let _docker = DOCKER.lock().await;
    let (_dir, manager) = docker_manager(|_| {}).await?;
    let kernel = manager.create_kernel(Language::Python, None).await?;

    let first = manager.execute(&kernel, "x = 41", None).await?;
    assert_eq!(first.exit_code, 0);
    let second = manager.execute(&kernel, "print(x + 1)", None).await?;
    assert_eq!(second.stdout.trim(), "42");

    let failed = manager.execute(&kernel, "1 / 0", None).await?;
    assert_ne!(failed.exit_code, 0);
    assert!(failed.stderr.contains("ZeroDivisionError"));

    // An exception leaves the interpreter usable
    let after = manager.execute(&kernel, "print(x)", None).await?;
    assert_eq!(after.stdout.trim(), "41");

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker daemon"]
async fn test_bash_keeps_variables_and_cwd() -> Result<()> {
    let _docker = DOCKER.lock().await;
    let (_dir, manager) = docker_manager(|_| {}).await?;
    let kernel = manager.create_kernel(Language::Bash, None).await?;

    manager.execute(&kernel, "GREETING=hello; cd /tmp", None).await?;
    let result = manager.execute(&kernel, "echo \"$GREETING from $(pwd)\"", None).await?;
    assert_eq!(result.stdout.trim(), "hello from /tmp");

    let failed = manager.execute(&kernel, "false", None).await?;
    assert_eq!(failed.exit_code, 1);

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker daemon"]
async fn test_kernels_are_isolated() -> Result<()> {
    let _docker = DOCKER.lock().await;
    let (_dir, manager) = docker_manager(|_| {}).await?;
    let a = manager.create_kernel(Language::Python, None).await?;
    let b = manager.create_kernel(Language::Python, None).await?;

    manager.execute(&a, "secret = 'a'", None).await?;
    let result = manager.execute(&b, "print(secret)", None).await?;
    assert!(result.stderr.contains("NameError"));

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker daemon"]
async fn test_timeout_kills_kernel() -> Result<()> {
    let _docker = DOCKER.lock().await;
    let (_dir, manager) = docker_manager(|_| {}).await?;
    let kernel = manager.create_kernel(Language::Python, None).await?;

    let err = manager
        .execute(&kernel, "import time\ntime.sleep(30)", Some(Duration::from_secs(1)))
        .await
        .expect_err("sleep must exceed the timeout");
    assert!(matches!(err, SandboxError::Timeout { .. }));

    let info = manager.kernel_info(&kernel).await?;
    assert_eq!(info.state, KernelState::Failed);

    let err = manager
        .execute(&kernel, "print(1)", None)
        .await
        .expect_err("failed kernel must reject work");
    assert!(matches!(err, SandboxError::KernelFailed { .. }));

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker daemon"]
async fn test_artifacts_on_shared_mount() -> Result<()> {
    let _docker = DOCKER.lock().await;
    let (dir, manager) = docker_manager(|_| {}).await?;
    let kernel = manager.create_kernel(Language::Python, None).await?;

    let result = manager
        .execute(
            &kernel,
            "open('/workspace/report.txt', 'w').write('done')",
            None,
        )
        .await?;
    assert_eq!(result.exit_code, 0, "{}", result.stderr);
    assert_eq!(result.artifacts, vec!["report.txt".to_string()]);
    assert!(dir.path().join("shared/report.txt").exists());

    // The interpreter runs as the owner of the host directory, not as root
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let owner = std::fs::metadata(dir.path().join("shared"))?.uid();
        let uid = manager.execute(&kernel, "import os\nprint(os.getuid())", None).await?;
        assert_eq!(uid.stdout.trim(), owner.to_string());
    }

    // Unchanged files are not reported again
    let again = manager.execute(&kernel, "pass", None).await?;
    assert!(again.artifacts.is_empty());

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker daemon"]
async fn test_network_is_disabled() -> Result<()> {
    let _docker = DOCKER.lock().await;
    let (_dir, manager) = docker_manager(|_| {}).await?;
    let kernel = manager.create_kernel(Language::Bash, None).await?;

    let result = manager
        .execute(&kernel, "getent hosts example.com || echo offline", None)
        .await?;
    assert!(result.stdout.contains("offline"));

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker daemon"]
async fn test_idle_kernel_reaped() -> Result<()> {
    let _docker = DOCKER.lock().await;
    let (_dir, manager) = docker_manager(|s| {
        s.idle_timeout_secs = 1;
    })
    .await?;
    let kernel = manager.create_kernel(Language::Python, None).await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let report = Reaper::new(Arc::clone(&manager)).sweep().await;
    assert_eq!(report.reaped.len(), 1);

    let err = manager
        .kernel_info(&kernel)
        .await
        .expect_err("reaped kernel must be gone");
    assert!(matches!(err, SandboxError::NotFound(_)));
    Ok(())
}

#[tokio::test]
#[ignore = "Requires Docker daemon"]
async fn test_restart_recovers_leaked_containers() -> Result<()> {
    let _docker = DOCKER.lock().await;
    let (dir, first) = docker_manager(|_| {}).await?;
    first.create_kernel(Language::Python, None).await?;
    // Simulate a crash: the registry is dropped without teardown
    drop(first);

    let settings = SandboxSettings {
        shared_dir: dir.path().join("shared"),
        ledger_path: Some(dir.path().join("kernels.ledger")),
        ..SandboxSettings::default()
    };
    let runtime = DockerRuntime::connect(&settings).await?;
    let second = SandboxManager::new(Arc::new(runtime), settings).await?;

    let removed = second.recover_orphans().await?;
    assert!(removed >= 1);
    assert!(second.list_kernels().await.is_empty());
    Ok(())
}
