//! End-to-end container tests.
//!
//! These need a local Docker daemon and the sandbox image
//! (`dockhand-agent:latest`), so they are ignored by default:
//!
//! ```text
//! cargo test -p dockhand-agents -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use dockhand_agents::{AgentManager, AgentManagerConfig, ResourceLimits};

fn manager(dir: &tempfile::TempDir, idle_deadline: Duration) -> Arc<AgentManager> {
    AgentManager::new(AgentManagerConfig {
        image: "dockhand-agent:latest".to_string(),
        working_dir_base: dir.path().join("agent-working-directory"),
        default_limits: ResourceLimits {
            memory_bytes: 2 * 1024 * 1024 * 1024,
            nano_cpus: 2_000_000_000,
        },
        default_idle_deadline: idle_deadline,
        max_agents: 10,
    })
    .expect("manager")
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the dockhand-agent image"]
async fn cold_start_first_command_creates_container_and_writes_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, Duration::ZERO);

    let outcome = manager
        .execute("it-cold-start", "echo hello > /mnt/a && cat /mnt/a", None)
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout, "hello\n");

    // The file landed in the host-side workspace through the bind mount.
    let host_file = dir
        .path()
        .join("agent-working-directory/it-cold-start/a");
    assert_eq!(std::fs::read_to_string(host_file).unwrap(), "hello\n");

    let agent = manager.get("it-cold-start").await.unwrap();
    let stats = agent.stats().await;
    assert_eq!(stats.state, "running");
    assert_eq!(stats.command_count, 1);

    manager.shutdown_all(true).await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the dockhand-agent image"]
async fn shell_state_persists_across_commands() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, Duration::ZERO);
    let id = "it-state";

    manager.execute(id, "cd /tmp", None).await.unwrap();
    manager.execute(id, "export FOO=bar", None).await.unwrap();
    let outcome = manager.execute(id, "echo $FOO && pwd", None).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.stdout.contains("bar\n"));
    assert!(outcome.stdout.contains("/tmp\n"));

    manager.shutdown_all(true).await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the dockhand-agent image"]
async fn exit_command_does_not_kill_the_persistent_shell() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, Duration::ZERO);
    let id = "it-exit";

    manager.execute(id, "cd /tmp", None).await.unwrap();
    let outcome = manager.execute(id, "exit 7", None).await.unwrap();
    assert_eq!(outcome.exit_code, 7);

    // Next command still starts in the recorded cwd.
    let outcome = manager.execute(id, "pwd", None).await.unwrap();
    assert_eq!(outcome.stdout, "/tmp\n");

    manager.shutdown_all(true).await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the dockhand-agent image"]
async fn idle_reap_stops_container_and_next_command_recreates_it() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, Duration::from_secs(2));
    let id = "it-idle";

    manager
        .execute(id, "cd /tmp && export FOO=bar && echo seeded > /mnt/keep", None)
        .await
        .unwrap();

    // The per-agent idle timer fires shortly after the deadline.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let agent = manager.get(id).await.unwrap();
    assert_eq!(agent.stats().await.state, "stopped");

    // Transparent recreate with fresh shell state; workspace files survive.
    let outcome = manager.execute(id, "pwd && echo ${FOO:-unset} && cat /mnt/keep", None).await.unwrap();
    assert!(outcome.stdout.contains("/mnt\n"));
    assert!(outcome.stdout.contains("unset\n"));
    assert!(outcome.stdout.contains("seeded\n"));

    manager.shutdown_all(true).await;
}

#[tokio::test]
#[ignore = "requires a Docker daemon and the dockhand-agent image"]
async fn command_timeout_leaves_container_usable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, Duration::ZERO);
    let id = "it-timeout";

    let err = manager
        .execute(id, "sleep 30", Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));

    let outcome = manager.execute(id, "echo alive", None).await.unwrap();
    assert_eq!(outcome.stdout, "alive\n");

    manager.shutdown_all(true).await;
}
