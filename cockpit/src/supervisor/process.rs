//! Automation process spawning and the output pump.
//!
//! stdout and stderr are read by one task each and merged into a single
//! channel in arrival order. The pump task forwards lines into the actor
//! mailbox, so the actor is the only producer of OutputLine events and
//! line order equals capture order.

use std::process::Stdio;
use std::time::Duration;

use ractor::ActorRef;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::actor::SupervisorMsg;
use super::TaskError;
use crate::config::AutomationConfig;

/// Launch `<program> <script> --task <instruction>` and start pumping its
/// output into `actor`. Returns the process id.
///
/// Cancelling `kill` force-kills the whole process group.
pub(super) fn spawn_automation(
    config: &AutomationConfig,
    task_id: &str,
    instruction: &str,
    actor: ActorRef<SupervisorMsg>,
    kill: CancellationToken,
) -> Result<Option<u32>, TaskError> {
    let mut command = Command::new(&config.program);
    command
        .arg(&config.script)
        .arg("--task")
        .arg(instruction)
        .current_dir(&config.working_dir)
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so cancellation reaches the agent's children too.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| {
        TaskError::SpawnFailed(format!(
            "{} {} in {}: {e}",
            config.program,
            config.script.display(),
            config.working_dir.display()
        ))
    })?;
    let pid = child.id();

    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_lines(stdout, line_tx.clone(), "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_lines(stderr, line_tx.clone(), "stderr"));
    }
    drop(line_tx);

    tokio::spawn(pump(
        child,
        line_rx,
        actor,
        task_id.to_string(),
        kill,
        config.drain_timeout,
    ));

    tracing::info!(task_id = %task_id, pid = ?pid, "Automation process spawned");
    Ok(pid)
}

async fn read_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end();
                if text.trim().is_empty() {
                    continue;
                }
                if tx.send(text.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(stream, error = %e, "Failed to read automation output");
                break;
            }
        }
    }
}

async fn pump(
    mut child: Child,
    mut lines: mpsc::UnboundedReceiver<String>,
    actor: ActorRef<SupervisorMsg>,
    task_id: String,
    kill: CancellationToken,
    drain_timeout: Duration,
) {
    let forward = |text: String| {
        let _ = actor.send_message(SupervisorMsg::OutputReceived {
            task_id: task_id.clone(),
            text,
        });
    };

    let mut lines_open = true;
    let status = loop {
        tokio::select! {
            line = lines.recv(), if lines_open => match line {
                Some(text) => forward(text),
                None => lines_open = false,
            },
            status = child.wait() => break status,
            _ = kill.cancelled() => {
                force_kill(&mut child);
                break child.wait().await;
            }
        }
    };

    // Output written just before exit may still be in flight.
    let deadline = tokio::time::sleep(drain_timeout);
    tokio::pin!(deadline);
    while lines_open {
        tokio::select! {
            line = lines.recv() => match line {
                Some(text) => forward(text),
                None => lines_open = false,
            },
            _ = &mut deadline => {
                tracing::debug!(task_id = %task_id, "Output drain window elapsed");
                break;
            }
        }
    }

    let (exit_code, signal, error) = match status {
        Ok(status) => (status.code(), exit_signal(&status), None),
        Err(e) => (None, None, Some(format!("failed to wait for process: {e}"))),
    };
    let _ = actor.send_message(SupervisorMsg::ProcessExited {
        task_id,
        exit_code,
        signal,
        error,
    });
}

fn force_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        signal_group(pid, Signal::Kill);
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "start_kill after group kill");
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum Signal {
    Terminate,
    Kill,
}

/// Deliver `signal` to the process group led by `pid`.
#[cfg(unix)]
pub(super) fn signal_group(pid: u32, signal: Signal) -> bool {
    let Ok(pgid) = i32::try_from(pid) else {
        return false;
    };
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group created by `process_group(0)`.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc != 0 {
        tracing::debug!(
            pid,
            ?signal,
            error = %std::io::Error::last_os_error(),
            "Process group signal not delivered"
        );
    }
    rc == 0
}

#[cfg(not(unix))]
pub(super) fn signal_group(_pid: u32, _signal: Signal) -> bool {
    false
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
