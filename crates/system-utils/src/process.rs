use std::process::{ExitStatus, Stdio};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{sleep, timeout_at, Duration, Instant};

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A child process that leads its own process group, so signals reach
/// everything it forks (renderer, GPU and helper processes included).
pub struct GroupChild {
    pub child: Child,
    pub pgid: Option<libc::pid_t>,
}

pub fn spawn_process_group(cmd: &mut Command, label: &str) -> anyhow::Result<GroupChild> {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        });
    }
    cmd.kill_on_drop(true);
    let child = cmd
        .spawn()
        .map_err(|err| anyhow::anyhow!(err))
        .with_context(|| format!("failed to spawn {label}"))?;
    let pgid = child.id().map(|pid| pid as libc::pid_t);
    Ok(GroupChild { child, pgid })
}

pub fn null_stdio(cmd: &mut Command) -> &mut Command {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
}

pub fn signal_process_group(pgid: libc::pid_t, signal: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Relays a child's stderr into `tracing` at debug level until it closes.
pub fn forward_stderr(stderr: ChildStderr, label: &'static str, request_id: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(process = label, request_id = %request_id, "{line}");
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(process = label, request_id = %request_id, error = %err, "stderr closed");
                    break;
                }
            }
        }
    });
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL what is left.
///
/// The group is signalled even when the leader has already been reaped:
/// forked helpers keep the group alive after their parent exits.
pub async fn terminate_process_group(
    process: &mut GroupChild,
    grace: Duration,
    label: &str,
) -> anyhow::Result<ExitStatus> {
    let deadline = Instant::now() + grace;
    let exited = process
        .child
        .try_wait()
        .with_context(|| format!("failed to poll {label}"))?;

    let group_present = match process.pgid {
        Some(pgid) => signal_group(pgid, libc::SIGTERM, label),
        None => {
            if exited.is_none() {
                let _ = process.child.start_kill();
            }
            false
        }
    };
    if let (Some(status), false) = (exited, group_present) {
        return Ok(status);
    }

    let status = match exited {
        Some(status) => Some(status),
        None => match timeout_at(deadline, process.child.wait()).await {
            Ok(result) => Some(result.with_context(|| format!("failed to wait for {label}"))?),
            Err(_) => None,
        },
    };
    let group_gone = match (status, process.pgid) {
        (Some(_), Some(pgid)) => wait_for_group_exit(pgid, deadline).await,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if let (Some(status), true) = (status, group_gone) {
        return Ok(status);
    }

    tracing::warn!(
        process = label,
        grace_ms = grace.as_millis(),
        "process group ignored SIGTERM, sending SIGKILL"
    );
    if let Some(pgid) = process.pgid {
        signal_group(pgid, libc::SIGKILL, label);
    }
    if let Some(status) = status {
        return Ok(status);
    }
    let _ = process.child.kill().await;
    process
        .child
        .wait()
        .await
        .with_context(|| format!("failed to reap {label}"))
}

/// Returns false once the group no longer exists (ESRCH).
fn signal_group(pgid: libc::pid_t, signal: i32, label: &str) -> bool {
    match signal_process_group(pgid, signal) {
        Ok(()) => true,
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => false,
        Err(err) => {
            tracing::warn!(error = %err, process = label, signal, "failed to signal process group");
            true
        }
    }
}

async fn wait_for_group_exit(pgid: libc::pid_t, deadline: Instant) -> bool {
    loop {
        if !signal_group(pgid, 0, "process group") {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(GROUP_POLL_INTERVAL).await;
    }
}
