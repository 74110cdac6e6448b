//! Shared test fixtures: in-memory stores, seeded rows, and fake agent
//! scripts that emit canned stream-json output.

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;

use orca_db::models::{Task, TaskStatus};
use orca_db::pool::{create_memory_pool, ensure_schema};
use orca_db::queries::tasks::{insert_task, NewTask};

/// Create an in-memory store with the schema applied.
pub async fn create_test_store() -> SqlitePool {
    let pool = create_memory_pool()
        .await
        .expect("failed to create in-memory store");
    ensure_schema(&pool).await.expect("failed to apply schema");
    pool
}

/// Insert a `ready` task with the given id and repo path.
pub async fn seed_task(pool: &SqlitePool, id: &str, repo_path: &str) -> Task {
    seed_task_with(pool, id, repo_path, TaskStatus::Ready, 0).await
}

/// Insert a task with explicit status and priority.
pub async fn seed_task_with(
    pool: &SqlitePool,
    id: &str,
    repo_path: &str,
    status: TaskStatus,
    priority: i64,
) -> Task {
    insert_task(
        pool,
        &NewTask {
            id: id.to_string(),
            prompt: format!("work on {id}"),
            repo_path: repo_path.to_string(),
            status,
            priority,
            parent_id: None,
            is_parent: false,
        },
    )
    .await
    .expect("failed to seed task")
}

/// Write an executable shell script into `dir` that plays the given lines
/// on stdout, one per line, then exits with `exit_code`.
///
/// Stands in for the agent binary in runner tests.
pub fn write_fake_agent(dir: &Path, name: &str, stdout_lines: &[&str], exit_code: i32) -> PathBuf {
    let script_path = dir.join(name);
    let mut body = String::from("#!/bin/sh\n");
    for line in stdout_lines {
        // Single-quote each line; the canned JSON fixtures contain no
        // single quotes.
        body.push_str(&format!("echo '{line}'\n"));
    }
    body.push_str(&format!("exit {exit_code}\n"));
    std::fs::write(&script_path, body).expect("failed to write fake agent script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod fake agent script");
    }

    script_path
}

/// Write a fake agent that sleeps forever, for kill/timeout tests.
pub fn write_hanging_agent(dir: &Path, name: &str) -> PathBuf {
    let script_path = dir.join(name);
    std::fs::write(&script_path, "#!/bin/sh\nsleep 3600\n")
        .expect("failed to write hanging agent script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod hanging agent script");
    }

    script_path
}
