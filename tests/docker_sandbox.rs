//! Sandbox tests against a real Docker daemon.
//!
//! Run with: cargo test --test docker_sandbox -- --ignored

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use devloop::error::{ResourceKind, SandboxError};
use devloop::sandbox::{DockerBackend, ResourceLimits, Sandbox, SandboxSpec};

async fn sandbox(image: &str, limits: ResourceLimits) -> Sandbox {
    let backend = DockerBackend::new().expect("Docker daemon not reachable");
    backend.ping().await.expect("Docker daemon not responding");
    let name = format!("devloop-test-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let mut sandbox = Sandbox::new(
        Arc::new(backend),
        SandboxSpec::new(name, image).with_limits(limits),
    );
    sandbox.start().await.expect("sandbox failed to start");
    sandbox
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_timeout_kills_only_the_command() {
    let mut sandbox = sandbox("debian:bookworm-slim", ResourceLimits::default()).await;
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let err = sandbox
        .execute_command(&cmd(&["sleep", "10"]), Duration::from_secs(2), &cancel)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SandboxError::ExecutionTimeout { .. }));
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");

    let output = sandbox
        .execute_command(&cmd(&["echo", "still alive"]), Duration::from_secs(5), &cancel)
        .await
        .unwrap();
    assert_eq!(output.output.trim(), "still alive");

    sandbox.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_memory_ceiling_is_enforced() {
    let limits = ResourceLimits::new(64, 0.5, 100);
    let mut sandbox = sandbox("python:3.11-slim", limits).await;

    let err = sandbox
        .execute_command(
            &cmd(&["python", "-c", "x = bytearray(512 * 1024 * 1024); print(len(x))"]),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            SandboxError::ResourceLimitExceeded {
                resource: ResourceKind::Memory,
                ..
            }
        ),
        "unexpected error: {err}"
    );
    sandbox.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_no_network_and_file_round_trip() {
    let mut sandbox = sandbox("debian:bookworm-slim", ResourceLimits::default()).await;
    let cancel = CancellationToken::new();

    sandbox.write_file("hello.txt", b"hi there").await.unwrap();
    assert_eq!(sandbox.read_file("hello.txt").await.unwrap(), b"hi there");

    let err = sandbox
        .execute_command(
            &cmd(&["sh", "-c", "cat /sys/class/net/eth0/operstate"]),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::NonZeroExit { .. }));

    sandbox.stop().await.unwrap();
}
