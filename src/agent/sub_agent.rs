// src/agent/sub_agent.rs
//
// =============================================================================
// TASKGRID: SUB AGENT (v 0.3)
// =============================================================================
//
// The Task Runner.
//
// One process per task. Three cooperating activities:
// 1. The supervised child executing the materialized script, with stdout and
//    stderr merged into a spool file (decouples us from the child's stdio
//    buffering).
// 2. A tail loop shipping new spool bytes into a mutex-guarded log buffer.
// 3. A heartbeat sender draining that buffer to the controller once per
//    second and watching for a quit directive.
//
// The final heartbeat is sent synchronously after the child is reaped and
// the spool fully drained, so it always carries the terminal status and the
// closing log line. Cleanup removes the script and spool files on every
// exit path; a still-live child gets SIGTERM, five seconds of grace, then
// a hard kill.

use crate::agent::{ControlPlane, HttpControlPlane};
use crate::config::Config;
use crate::core::{
    HeartbeatAction, HeartbeatRequest, RegisterSubRequest, ReportedStatus, TaskAssignment,
    TaskReport,
};
use crate::probe::ResourceProbe;
use anyhow::{Context, Result};
use chrono::Utc;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tokio::time::{interval, sleep, timeout};

/// How long a terminated child gets to exit before the hard kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Spool poll cadence for the tail loop.
const TAIL_INTERVAL: Duration = Duration::from_millis(200);

struct Inner {
    name: String,
    main_agent_id: String,
    task: TaskAssignment,
    api: Arc<dyn ControlPlane>,
    heartbeat_interval: Duration,
    probe: ResourceProbe,

    agent_id: Mutex<Option<String>>,
    status: Mutex<ReportedStatus>,
    log_buffer: Mutex<String>,
    /// Pid of the running child; 0 while no child is alive.
    child_pid: AtomicU32,
    quit: Notify,
}

#[derive(Clone)]
pub struct SubAgent {
    inner: Arc<Inner>,
}

impl SubAgent {
    pub fn new(
        main_agent_id: String,
        task: TaskAssignment,
        server_url: Option<String>,
        name: Option<String>,
    ) -> Self {
        let config = Config::from_env();
        let server_url = server_url.unwrap_or(config.server_url);
        let name = name.unwrap_or_else(|| format!("sub_agent_{}", task.id));

        Self {
            inner: Arc::new(Inner {
                name,
                main_agent_id,
                task,
                api: Arc::new(HttpControlPlane::new(server_url)),
                heartbeat_interval: config.sub_agent_heartbeat_interval,
                probe: ResourceProbe::new(),
                agent_id: Mutex::new(None),
                status: Mutex::new(ReportedStatus::Waiting),
                log_buffer: Mutex::new(String::new()),
                child_pid: AtomicU32::new(0),
                quit: Notify::new(),
            }),
        }
    }

    #[cfg(test)]
    pub fn with_api(self, api: Arc<dyn ControlPlane>) -> Self {
        let mut inner = Arc::try_unwrap(self.inner).ok().expect("fresh agent");
        inner.api = api;
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Register, heartbeat in the background, execute the script, send the
    /// final heartbeat, exit. Returns whether the task completed cleanly.
    pub async fn run(&self) -> Result<bool> {
        log::info!(
            "Sub agent starting: name={}, task={}, main={}",
            self.inner.name,
            self.inner.task.id,
            self.inner.main_agent_id
        );

        // Best-effort: a failed registration is retried by the heartbeat loop
        // until the task terminates.
        if let Err(e) = self.ensure_registered().await {
            log::error!("Initial registration failed, will retry: {:#}", e);
        }

        self.push_log(format!("==== start: {} ====\n", Utc::now().to_rfc3339()));

        let (stop_tx, stop_rx) = watch::channel(false);
        let hb = {
            let agent = self.clone();
            tokio::spawn(async move { agent.heartbeat_loop(stop_rx).await })
        };

        let outcome = self.execute_script().await;
        if let Err(e) = &outcome {
            log::error!("Task {} execution error: {:#}", self.inner.task.id, e);
        }

        // Stop the background sender before the terminal report so the final
        // heartbeat is the one that carries it.
        let _ = stop_tx.send(true);
        let _ = hb.await;

        if let Err(e) = self.send_heartbeat().await {
            // Best-effort: the watchdog takes over within the timeout.
            log::error!("Final heartbeat failed: {:#}", e);
        }

        let completed = *self.inner.status.lock().unwrap() == ReportedStatus::Completed;
        log::info!(
            "Sub agent for task {} done: completed={}",
            self.inner.task.id,
            completed
        );
        Ok(completed)
    }

    // ------------------------------------------------------------------------
    // SCRIPT EXECUTION
    // ------------------------------------------------------------------------

    async fn execute_script(&self) -> Result<()> {
        let started = Instant::now();

        let result = self.spawn_and_supervise().await;

        match result {
            Ok(exit_code) => {
                let status = if exit_code == 0 {
                    ReportedStatus::Completed
                } else {
                    ReportedStatus::Failed
                };
                *self.inner.status.lock().unwrap() = status;
                self.push_log(format!(
                    "==== end: {}, time: {:.2} s, exit_code: {} ====\n",
                    Utc::now().to_rfc3339(),
                    started.elapsed().as_secs_f64(),
                    exit_code
                ));
                Ok(())
            }
            Err(e) => {
                *self.inner.status.lock().unwrap() = ReportedStatus::Failed;
                self.push_log(format!("task startup failed: {:#}\n", e));
                self.push_log(format!(
                    "==== end: {}, time: {:.2} s, exit_code: -1 ====\n",
                    Utc::now().to_rfc3339(),
                    started.elapsed().as_secs_f64(),
                ));
                Err(e)
            }
        }
    }

    async fn spawn_and_supervise(&self) -> Result<i32> {
        // Script and spool are temp files; dropping the guards removes them
        // on every exit path.
        let script = materialize_script(&self.inner.task.script_content)?;
        let spool = tempfile::Builder::new()
            .prefix("taskgrid_task_")
            .suffix(".log")
            .tempfile()
            .context("cannot create output spool file")?;

        let stdout = spool.reopen().context("cannot reopen spool for stdout")?;
        // Duplicated handle: stdout and stderr share one file offset, which
        // is what merges the streams in write order.
        let stderr = stdout.try_clone().context("cannot clone spool handle")?;

        let mut cmd = script_command(script.path());
        cmd.env(
            "CUDA_VISIBLE_DEVICES",
            self.inner.task.gpu_ids.join(","),
        );
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(stdout);
        cmd.stderr(stderr);

        *self.inner.status.lock().unwrap() = ReportedStatus::Running;
        let mut child = cmd.spawn().context("script process spawn failed")?;
        self.inner
            .child_pid
            .store(child.id().unwrap_or(0), Ordering::SeqCst);
        log::info!(
            "Task {} process started: pid={:?}",
            self.inner.task.id,
            child.id()
        );

        let (tail_stop_tx, tail_stop_rx) = watch::channel(false);
        let tail = {
            let agent = self.clone();
            let path = spool.path().to_path_buf();
            tokio::spawn(async move { agent.tail_loop(&path, tail_stop_rx).await })
        };

        // The select must not touch `child` in the quit arm while `wait()`
        // still borrows it, so termination happens after the select resolves.
        let waited = tokio::select! {
            status = child.wait() => Some(status.context("waitpid failed")?),
            _ = self.inner.quit.notified() => None,
        };
        let exit_status = match waited {
            Some(status) => status,
            None => {
                log::warn!(
                    "Quit directive received, terminating task {}",
                    self.inner.task.id
                );
                self.terminate_with_grace(&mut child).await?
            }
        };
        self.inner.child_pid.store(0, Ordering::SeqCst);

        // Drain the spool to EOF before reporting the terminal state.
        let _ = tail_stop_tx.send(true);
        let _ = tail.await;

        let code = exit_status.code().unwrap_or(-1);
        log::info!("Task {} process exited: code={}", self.inner.task.id, code);
        Ok(code)
    }

    /// SIGTERM, a bounded grace period, then the hard kill.
    async fn terminate_with_grace(&self, child: &mut Child) -> Result<std::process::ExitStatus> {
        send_sigterm(child);

        match timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(status) => Ok(status.context("waitpid failed after terminate")?),
            Err(_) => {
                log::warn!("Grace period expired, killing task {}", self.inner.task.id);
                child.kill().await.context("kill failed")?;
                Ok(child.wait().await.context("waitpid failed after kill")?)
            }
        }
    }

    // ------------------------------------------------------------------------
    // LOG TAILING
    // ------------------------------------------------------------------------

    async fn tail_loop(&self, path: &Path, mut stop: watch::Receiver<bool>) {
        let mut offset: u64 = 0;
        let mut tick = interval(TAIL_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    offset = self.drain_spool(path, offset);
                }
                _ = stop.changed() => {
                    // Final drain catches bytes written after the last tick.
                    self.drain_spool(path, offset);
                    break;
                }
            }
        }
    }

    /// Append spool bytes past `offset` to the log buffer; returns the new
    /// offset. Read failures leave the offset unchanged for the next tick.
    fn drain_spool(&self, path: &Path, offset: u64) -> u64 {
        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(_) => return offset,
        };
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return offset;
        }
        let mut bytes = Vec::new();
        if file.read_to_end(&mut bytes).is_err() {
            return offset;
        }
        if bytes.is_empty() {
            return offset;
        }
        self.push_log(String::from_utf8_lossy(&bytes).into_owned());
        offset + bytes.len() as u64
    }

    fn push_log(&self, chunk: String) {
        self.inner.log_buffer.lock().unwrap().push_str(&chunk);
    }

    // ------------------------------------------------------------------------
    // HEARTBEATS
    // ------------------------------------------------------------------------

    async fn heartbeat_loop(&self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = sleep(self.inner.heartbeat_interval) => {}
                _ = stop.changed() => break,
            }
            if let Err(e) = self.send_heartbeat().await {
                log::error!("Heartbeat failed: {:#}", e);
            }
        }
    }

    async fn ensure_registered(&self) -> Result<String> {
        if let Some(id) = self.inner.agent_id.lock().unwrap().clone() {
            return Ok(id);
        }

        let record = self
            .inner
            .api
            .register_sub(&RegisterSubRequest {
                name: self.inner.name.clone(),
                main_agent_id: self.inner.main_agent_id.clone(),
                task_id: self.inner.task.id,
                cpu_cores: Some(self.inner.task.cpu_cores),
                gpu_ids: self.inner.task.gpu_ids.clone(),
            })
            .await?;

        log::info!("Sub agent registered: id={}", record.id);
        *self.inner.agent_id.lock().unwrap() = Some(record.id.clone());
        Ok(record.id)
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let agent_id = self.ensure_registered().await?;

        let request = HeartbeatRequest {
            resource_info: self.resource_view(),
            task_info: Some(self.drain_report()),
        };

        let response = self.inner.api.heartbeat(&agent_id, &request).await?;
        match response.action {
            HeartbeatAction::Quit | HeartbeatAction::Stop => {
                // Wakes the supervisor; a stored permit covers the race where
                // the directive lands before the wait begins.
                self.inner.quit.notify_one();
            }
            _ => {}
        }
        Ok(())
    }

    /// Snapshot rooted at the child process tree while it is alive, else at
    /// this process. The lease overrides what the probe saw: available cores
    /// are the lease, GPUs are filtered to the leased ids.
    fn resource_view(&self) -> crate::core::ResourceInfo {
        let pid = self.inner.child_pid.load(Ordering::SeqCst);
        let root = if pid != 0 { pid } else { std::process::id() };
        let mut info = self.inner.probe.snapshot_for_pid(root);

        info.available_cpu_cores = self.inner.task.cpu_cores;
        info.gpu_info
            .retain(|g| self.inner.task.gpu_ids.contains(&g.gpu_id));
        info.gpu_ids = self.inner.task.gpu_ids.clone();
        info
    }

    /// Current status plus the accumulated log bytes, cleared atomically.
    fn drain_report(&self) -> TaskReport {
        let status = *self.inner.status.lock().unwrap();
        let log = {
            let mut buffer = self.inner.log_buffer.lock().unwrap();
            if buffer.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut *buffer))
            }
        };
        TaskReport { status, log }
    }
}

// ============================================================================
// SCRIPT MATERIALIZATION
// ============================================================================

/// Write the script blob to a temp file the platform shell can execute.
#[cfg(unix)]
fn materialize_script(content: &str) -> Result<tempfile::NamedTempFile> {
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::Builder::new()
        .prefix("taskgrid_script_")
        .suffix(".sh")
        .tempfile()
        .context("cannot create script file")?;
    file.write_all(content.as_bytes())
        .context("cannot write script body")?;
    file.flush()?;

    std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755))
        .context("cannot mark script executable")?;
    Ok(file)
}

#[cfg(windows)]
fn materialize_script(content: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("taskgrid_script_")
        .suffix(".bat")
        .tempfile()
        .context("cannot create script file")?;
    // Batch interpreters want CRLF line endings.
    let crlf = content.replace("\r\n", "\n").replace('\n', "\r\n");
    file.write_all(crlf.as_bytes())
        .context("cannot write script body")?;
    file.flush()?;
    Ok(file)
}

#[cfg(unix)]
fn script_command(path: &Path) -> Command {
    let mut cmd = Command::new("/bin/bash");
    cmd.arg(path);
    cmd
}

#[cfg(windows)]
fn script_command(path: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(path);
    cmd
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &Child) {
    let _ = child.start_kill();
}
