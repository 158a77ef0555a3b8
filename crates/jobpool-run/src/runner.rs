//! Runs shell command lines concurrently, one jobserver slot per child.
//!
//! A child may start on one of this process's implicit slots or on a token
//! from the pool. Implicit slots are tried first, so a lone job never waits
//! on the pipe.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use jobpool::{JobServer, Mode, OwnedToken, acquire_async};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: String,
    pub parallel_level: usize,
    pub commands: Vec<CommandReport>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.commands.iter().filter(|c| !c.success).count()
    }
}

/// What a running child holds. Dropping it frees the slot.
enum Slot {
    Implicit { _permit: OwnedSemaphorePermit },
    Token { _token: OwnedToken },
}

async fn acquire_slot(server: &JobServer, implicit: &Arc<Semaphore>) -> anyhow::Result<Slot> {
    if let Ok(permit) = Arc::clone(implicit).try_acquire_owned() {
        return Ok(Slot::Implicit { _permit: permit });
    }

    // The null pool would grant everything; only the implicit slots bound us.
    if server.mode() == Mode::Unconstrained {
        let permit = Arc::clone(implicit).acquire_owned().await?;
        return Ok(Slot::Implicit { _permit: permit });
    }

    // A token read that loses the race is dropped with its task and released.
    tokio::select! {
        permit = Arc::clone(implicit).acquire_owned() => Ok(Slot::Implicit { _permit: permit? }),
        token = acquire_async(server.pool()) => Ok(Slot::Token { _token: token? }),
    }
}

/// Run every command through `shell -c`, at most as many at once as
/// `server` allows. Reports come back in input order.
///
/// If a command cannot be started, no further commands are launched and the
/// error is returned once the children already running have exited, so no
/// slot is handed back while its child still runs.
pub async fn run_commands(
    server: &JobServer,
    shell: &str,
    commands: Vec<String>,
) -> anyhow::Result<RunReport> {
    let implicit = Arc::new(Semaphore::new(server.implicit_slots()));
    let mut running = JoinSet::new();
    let total = commands.len();
    let mut first_error = None;

    for (index, line) in commands.into_iter().enumerate() {
        let slot = match acquire_slot(server, &implicit).await {
            Ok(slot) => slot,
            Err(e) => {
                first_error = Some(e);
                break;
            }
        };

        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(&line);
        server.configure_command(&mut cmd);

        let started = Instant::now();
        let spawned = tokio::process::Command::from(cmd)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{line}` with {shell}"));
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                first_error = Some(e);
                break;
            }
        };
        tracing::debug!(index, command = %line, "Started command");

        running.spawn(async move {
            let status = child.wait().await;
            drop(slot);
            (index, line, status, started.elapsed())
        });
    }

    if first_error.is_some() && !running.is_empty() {
        tracing::warn!(
            running = running.len(),
            "Not starting further commands; waiting for running ones"
        );
    }

    let mut finished: Vec<(usize, CommandReport)> = Vec::with_capacity(total);
    while let Some(joined) = running.join_next().await {
        let (index, command, status, elapsed) = match joined {
            Ok(done) => done,
            Err(e) => {
                first_error.get_or_insert(e.into());
                continue;
            }
        };
        let status = match status.with_context(|| format!("failed to wait for `{command}`")) {
            Ok(status) => status,
            Err(e) => {
                first_error.get_or_insert(e);
                continue;
            }
        };
        if !status.success() {
            tracing::warn!(index, command = %command, %status, "Command failed");
        }
        finished.push((
            index,
            CommandReport {
                command,
                exit_code: status.code(),
                success: status.success(),
                duration_ms: millis(elapsed),
            },
        ));
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    finished.sort_by_key(|(index, _)| *index);

    Ok(RunReport {
        mode: server.mode().to_string(),
        parallel_level: server.parallel_level().get(),
        commands: finished.into_iter().map(|(_, report)| report).collect(),
    })
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
