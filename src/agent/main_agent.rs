// src/agent/main_agent.rs
//
// =============================================================================
// TASKGRID: MAIN AGENT (v 0.3)
// =============================================================================
//
// The Host Supervisor.
//
// Responsibilities:
// 1. Own the host's hardware inventory and the lease ledger.
// 2. Heartbeat the controller with TRUE capacity (total minus leased), so
//    the scheduler never over-commits this host.
// 3. Spawn one sub-agent process per dispatched task; reap them and return
//    their leases.
// 4. On quit/interrupt, cascade termination to every live child.
//
// All ledger mutations happen on the heartbeat-loop task, so the ledger
// needs no lock of its own.

use crate::agent::{ControlPlane, HttpControlPlane};
use crate::config::Config;
use crate::core::{HeartbeatAction, HeartbeatRequest, RegisterMainRequest, TaskAssignment};
use crate::probe::ResourceProbe;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::sleep;

/// One lease: the child process plus the resources committed to it.
struct Lease {
    child: Child,
    cpu_cores: i64,
    gpu_ids: Vec<String>,
}

/// Private per-host resource bookkeeping.
#[derive(Default)]
struct Ledger {
    entries: HashMap<i64, Lease>,
    locked_cpu_cores: i64,
    locked_gpu_ids: HashSet<String>,
}

impl Ledger {
    fn lock(&mut self, cpu_cores: i64, gpu_ids: &[String]) {
        self.locked_cpu_cores += cpu_cores;
        self.locked_gpu_ids.extend(gpu_ids.iter().cloned());
    }

    fn unlock(&mut self, cpu_cores: i64, gpu_ids: &[String]) {
        self.locked_cpu_cores = (self.locked_cpu_cores - cpu_cores).max(0);
        for id in gpu_ids {
            self.locked_gpu_ids.remove(id);
        }
    }
}

pub struct MainAgent {
    id: Option<String>,
    name: String,
    api: Arc<dyn ControlPlane>,
    server_url: String,
    probe: ResourceProbe,
    interval: Duration,
    reject_new_task: bool,

    total_cpu_cores: i64,
    gpu_ids: Vec<String>,
    ledger: Ledger,
}

impl MainAgent {
    pub fn new(name: Option<String>, server_url: Option<String>, reject_new_task: bool) -> Self {
        let config = Config::from_env();
        let server_url = server_url.unwrap_or(config.server_url);
        let name = name.unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "worker".into())
        });

        Self {
            id: None,
            name,
            api: Arc::new(HttpControlPlane::new(server_url.clone())),
            server_url,
            probe: ResourceProbe::new(),
            interval: config.main_agent_heartbeat_interval,
            reject_new_task,
            total_cpu_cores: 0,
            gpu_ids: Vec::new(),
            ledger: Ledger::default(),
        }
    }

    /// Register with the controller. The returned id is required before any
    /// heartbeat can be sent; failure here aborts startup.
    pub async fn register(&mut self) -> Result<()> {
        let snapshot = self.probe.snapshot();
        self.total_cpu_cores = snapshot.cpu_cores;
        self.gpu_ids = snapshot.gpu_ids.clone();

        let record = self
            .api
            .register_main(&RegisterMainRequest {
                name: self.name.clone(),
                cpu_cores: self.total_cpu_cores,
                gpu_ids: self.gpu_ids.clone(),
            })
            .await
            .context("main agent registration failed")?;

        log::info!(
            "Main agent registered: id={}, name={}, cores={}, gpus={:?}",
            record.id,
            self.name,
            self.total_cpu_cores,
            self.gpu_ids
        );
        self.id = Some(record.id);
        Ok(())
    }

    /// Heartbeat loop. Runs until the shutdown flag flips or the controller
    /// tells this agent to stop/quit. Every tick: reap, snapshot, report,
    /// dispatch the returned directive.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let agent_id = self.id.clone().context("run() before register()")?;
        log::info!("Main agent {} entering heartbeat loop", agent_id);

        while !shutdown.load(Ordering::SeqCst) {
            self.reap_finished_children().await;

            let request = HeartbeatRequest {
                resource_info: self.local_resource_view(),
                task_info: None,
            };

            let outcome = self.api.heartbeat(&agent_id, &request).await;
            match outcome {
                Ok(response) => {
                    if !self.dispatch_action(response.action, response.task).await {
                        break;
                    }
                }
                Err(e) => {
                    // Transient network failure: log and retry next tick.
                    log::error!("Heartbeat failed: {:#}", e);
                }
            }

            sleep(self.interval).await;
        }

        self.cancel_all_children().await;
        log::info!("Main agent {} shut down", agent_id);
        Ok(())
    }

    /// Snapshot overlaid with the lease ledger: available cores are total
    /// minus leased; leased GPUs are flagged unavailable.
    fn local_resource_view(&self) -> crate::core::ResourceInfo {
        let mut info = self.probe.snapshot();
        info.cpu_cores = self.total_cpu_cores;
        info.available_cpu_cores = (self.total_cpu_cores - self.ledger.locked_cpu_cores).max(0);
        for gpu in info.gpu_info.iter_mut() {
            if self.ledger.locked_gpu_ids.contains(&gpu.gpu_id) {
                gpu.is_available = false;
            }
        }
        info.reject_new_task = self.reject_new_task;
        info
    }

    /// Returns false when the loop should exit.
    async fn dispatch_action(
        &mut self,
        action: HeartbeatAction,
        task: Option<TaskAssignment>,
    ) -> bool {
        match action {
            HeartbeatAction::Continue => true,
            HeartbeatAction::NewTask => {
                if let Some(assignment) = task {
                    log::info!(
                        "Received task {} ({}): cores={}, gpus={:?}",
                        assignment.id,
                        assignment.name,
                        assignment.cpu_cores,
                        assignment.gpu_ids
                    );
                    if let Err(e) = self.spawn_sub_agent(assignment) {
                        log::error!("Failed to spawn sub agent: {:#}", e);
                    }
                } else {
                    log::warn!("new_task directive without a task payload");
                }
                true
            }
            HeartbeatAction::RejectNewTask => {
                log::info!("Controller directive: stop accepting new tasks");
                self.reject_new_task = true;
                true
            }
            HeartbeatAction::AcceptNewTask => {
                log::info!("Controller directive: resume accepting new tasks");
                self.reject_new_task = false;
                true
            }
            HeartbeatAction::Stop => {
                log::warn!("Controller no longer knows this agent, stopping");
                false
            }
            HeartbeatAction::Quit => {
                log::warn!("Controller directive: quit");
                false
            }
        }
    }

    /// Lease first, spawn second; roll the lease back if the spawn fails.
    fn spawn_sub_agent(&mut self, assignment: TaskAssignment) -> Result<()> {
        let cpu_cores = assignment.cpu_cores;
        let gpu_ids = assignment.gpu_ids.clone();
        self.ledger.lock(cpu_cores, &gpu_ids);

        match self.launch_child(&assignment) {
            Ok(child) => {
                log::info!(
                    "Sub agent spawned for task {}: pid={:?}",
                    assignment.id,
                    child.id()
                );
                self.ledger.entries.insert(
                    assignment.id,
                    Lease {
                        child,
                        cpu_cores,
                        gpu_ids,
                    },
                );
                Ok(())
            }
            Err(e) => {
                self.ledger.unlock(cpu_cores, &gpu_ids);
                Err(e)
            }
        }
    }

    fn launch_child(&self, assignment: &TaskAssignment) -> Result<Child> {
        let exe = std::env::current_exe().context("cannot resolve current executable")?;
        let task_json =
            serde_json::to_string(assignment).context("cannot serialize task assignment")?;
        let main_id = self.id.clone().context("spawn before register")?;

        // stdout/stderr inherit this process's streams; the sub agent ships
        // the task's own output through its heartbeats, not through stdio.
        let child = Command::new(exe)
            .arg("sub-agent")
            .arg("--main-id")
            .arg(&main_id)
            .arg("--server")
            .arg(&self.server_url)
            .arg("--name")
            .arg(format!("sub_{}_{}", self.name, assignment.id))
            .arg("--task")
            .arg(task_json)
            .spawn()
            .context("sub agent process spawn failed")?;
        Ok(child)
    }

    /// Non-blocking poll of every child; terminated ones return their lease.
    async fn reap_finished_children(&mut self) {
        let mut finished: Vec<i64> = Vec::new();
        for (task_id, lease) in self.ledger.entries.iter_mut() {
            match lease.child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("Sub agent for task {} exited: {}", task_id, status);
                    finished.push(*task_id);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("try_wait failed for task {}: {}", task_id, e);
                    finished.push(*task_id);
                }
            }
        }

        for task_id in finished {
            if let Some(lease) = self.ledger.entries.remove(&task_id) {
                self.ledger.unlock(lease.cpu_cores, &lease.gpu_ids);
            }
        }
    }

    /// Signal every live child, then clear the ledger. Used for quit and for
    /// interrupt shutdown; individual task cancel flows through the
    /// controller's quit directive to the sub agent instead.
    async fn cancel_all_children(&mut self) {
        for (task_id, lease) in self.ledger.entries.iter_mut() {
            log::info!(
                "Terminating sub agent for task {}: pid={:?}",
                task_id,
                lease.child.id()
            );
            terminate_child(&mut lease.child);
        }
        self.ledger.entries.clear();
        self.ledger.locked_cpu_cores = 0;
        self.ledger.locked_gpu_ids.clear();
    }
}

/// Register and run a main agent until interrupted or told to quit.
/// An error here means registration failed; callers map that to exit code 1.
pub async fn run_main_agent(
    name: Option<String>,
    server_url: Option<String>,
    reject_new_task: bool,
) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let sig = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        log::warn!("Interrupt received, stopping");
        sig.store(true, Ordering::SeqCst);
    });

    let mut agent = MainAgent::new(name, server_url, reject_new_task);
    agent.register().await?;
    agent.run(shutdown).await
}

/// Ask a child to terminate. SIGTERM where available, so the sub agent can
/// run its own cleanup (grace-kill its task, send the final heartbeat).
#[cfg(unix)]
fn terminate_child(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_lock_unlock_roundtrip() {
        let mut ledger = Ledger::default();
        ledger.lock(2, &["0".to_string(), "1".to_string()]);
        assert_eq!(ledger.locked_cpu_cores, 2);
        assert!(ledger.locked_gpu_ids.contains("0"));

        ledger.lock(1, &[]);
        assert_eq!(ledger.locked_cpu_cores, 3);

        ledger.unlock(1, &[]);
        ledger.unlock(2, &["0".to_string(), "1".to_string()]);
        assert_eq!(ledger.locked_cpu_cores, 0);
        assert!(ledger.locked_gpu_ids.is_empty());

        // Unlock past zero clamps instead of going negative.
        ledger.unlock(5, &[]);
        assert_eq!(ledger.locked_cpu_cores, 0);
    }
}
