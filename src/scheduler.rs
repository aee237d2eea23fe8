// src/scheduler.rs
//
// =============================================================================
// TASKGRID: SCHEDULER (v 0.3)
// =============================================================================
//
// The Matchmaker.
//
// Runs synchronously inside the heartbeat handler of a main agent; there is
// no background scheduling thread. Each pass:
// 1. Relaxes dependencies (blocked -> waiting where all deps completed).
// 2. Scans waiting tasks in (priority, created_time) order for the first one
//    that fits this agent's free CPU cores and available GPUs.
// 3. Claims it with the store's conditional UPDATE. A lost race is not an
//    error: the scan simply moves on to the next candidate.
//
// Tie-breaks are priority then FIFO. There is no starvation mitigation:
// low-priority tasks wait as long as needed.

use crate::core::{AgentRecord, Task, TaskAssignment};
use crate::store::{StoreResult, TaskStore};
use chrono::{DateTime, Utc};

const MB: u64 = 1024 * 1024;

pub struct Scheduler {
    store: TaskStore,
}

impl Scheduler {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// Find, claim and lease the best waiting task for this main agent.
    /// Returns `None` when nothing fits (or the agent refuses new work).
    pub fn dispatch_for(
        &self,
        agent: &AgentRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskAssignment>> {
        // Dependency relaxation happens on every heartbeat so a completed
        // parent unblocks children without waiting for a dedicated pass.
        self.store.unblock_ready_tasks()?;

        if agent.reject_new_task {
            return Ok(None);
        }

        let waiting = self.store.list_waiting_tasks_ordered()?;
        if waiting.is_empty() {
            return Ok(None);
        }

        for task in &waiting {
            let Some(gpu_lease) = gpu_lease_for(agent, task) else {
                continue;
            };

            if !self.store.atomic_claim(task.id, &agent.id, now)? {
                // Another heartbeat raced us to this task; keep scanning.
                log::debug!("Lost claim race for task {}, rescanning", task.id);
                continue;
            }

            // Mirror the lease on the stored agent row so the controller's
            // view stays consistent until the agent's next heartbeat.
            self.store.debit_lease(&agent.id, task.cpu_cores, &gpu_lease)?;

            log::info!(
                "Dispatched task {} to agent {} (cores={}, gpus={:?})",
                task.id,
                agent.id,
                task.cpu_cores,
                gpu_lease
            );
            return Ok(Some(TaskAssignment::from_task(task, gpu_lease)));
        }

        Ok(None)
    }
}

/// Feasibility check: returns the GPU ids to lease (possibly empty) when the
/// task fits this agent, or `None` when it does not.
fn gpu_lease_for(agent: &AgentRecord, task: &Task) -> Option<Vec<String>> {
    if task.cpu_cores > 0 && agent.available_cpu_cores < task.cpu_cores {
        return None;
    }

    if task.gpu_count == 0 {
        return Some(Vec::new());
    }

    // A gpu_memory requirement narrows the candidate set to GPUs with enough
    // free memory; gpu_memory is per-GPU, in MB.
    let needed_free = (task.gpu_memory.max(0) as u64) * MB;
    let candidates: Vec<&str> = agent
        .gpu_info
        .iter()
        .filter(|g| g.is_available)
        .filter(|g| {
            task.gpu_memory == 0 || g.memory_total.saturating_sub(g.memory_used) >= needed_free
        })
        .map(|g| g.gpu_id.as_str())
        .collect();

    if (candidates.len() as i64) < task.gpu_count {
        return None;
    }

    Some(
        candidates
            .into_iter()
            .take(task.gpu_count as usize)
            .map(String::from)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AgentKind, AgentStatus, CreateTaskRequest, GpuInfo, TaskStatus};

    fn fixture() -> (tempfile::TempDir, TaskStore, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("test.db"), dir.path().join("logs")).unwrap();
        let scheduler = Scheduler::new(store.clone());
        (dir, store, scheduler)
    }

    fn agent(cores: i64, gpus: Vec<GpuInfo>) -> AgentRecord {
        AgentRecord {
            id: "m1".into(),
            name: "worker".into(),
            kind: AgentKind::Main,
            status: AgentStatus::Online,
            created_time: Utc::now(),
            last_heartbeat_time: Some(Utc::now()),
            running_time: 0,
            cpu_cores: cores,
            cpu_usage: 0.0,
            memory_used: 0,
            memory_total: 0,
            gpu_info: gpus,
            available_cpu_cores: cores,
            reject_new_task: false,
            task_id: None,
            main_agent_id: None,
        }
    }

    fn task(name: &str, cpu: i64, gpu_count: i64, gpu_memory: i64) -> CreateTaskRequest {
        CreateTaskRequest {
            name: name.into(),
            template_type: "shell".into(),
            script_content: "true".into(),
            priority: 3,
            cpu_cores: cpu,
            gpu_count,
            gpu_memory,
            depends_on: vec![],
        }
    }

    fn gpu(id: &str, free_mb: u64) -> GpuInfo {
        GpuInfo {
            gpu_id: id.into(),
            usage: 0.0,
            memory_used: 0,
            memory_total: free_mb * MB,
            is_available: true,
        }
    }

    #[test]
    fn cpu_bound_feasibility() {
        let a = agent(4, vec![]);
        let t = {
            let (_d, store, _s) = fixture();
            store.create_task(&task("t", 2, 0, 0), Utc::now()).unwrap()
        };
        assert_eq!(gpu_lease_for(&a, &t), Some(vec![]));

        let mut small = a.clone();
        small.available_cpu_cores = 1;
        assert_eq!(gpu_lease_for(&small, &t), None);
    }

    #[test]
    fn gpu_count_and_memory_feasibility() {
        let (_d, store, _s) = fixture();
        let a = agent(8, vec![gpu("0", 16000), gpu("1", 4000)]);

        let t1 = store.create_task(&task("one_gpu", 1, 1, 0), Utc::now()).unwrap();
        assert_eq!(gpu_lease_for(&a, &t1), Some(vec!["0".to_string()]));

        let t2 = store.create_task(&task("two_gpus", 1, 2, 0), Utc::now()).unwrap();
        assert_eq!(
            gpu_lease_for(&a, &t2),
            Some(vec!["0".to_string(), "1".to_string()])
        );

        // 8 GB per GPU rules out the 4 GB card.
        let t3 = store.create_task(&task("big_mem", 1, 2, 8000), Utc::now()).unwrap();
        assert_eq!(gpu_lease_for(&a, &t3), None);
        let t4 = store.create_task(&task("one_big", 1, 1, 8000), Utc::now()).unwrap();
        assert_eq!(gpu_lease_for(&a, &t4), Some(vec!["0".to_string()]));
    }

    #[test]
    fn leased_gpus_are_not_offered() {
        let (_d, store, _s) = fixture();
        let mut gpus = vec![gpu("0", 16000), gpu("1", 16000)];
        gpus[0].is_available = false;
        let a = agent(8, gpus);

        let t = store.create_task(&task("t", 1, 2, 0), Utc::now()).unwrap();
        assert_eq!(gpu_lease_for(&a, &t), None);
        let t1 = store.create_task(&task("t1", 1, 1, 0), Utc::now()).unwrap();
        assert_eq!(gpu_lease_for(&a, &t1), Some(vec!["1".to_string()]));
    }

    #[test]
    fn dispatch_claims_in_priority_then_fifo_order() {
        let (_d, store, scheduler) = fixture();
        let now = Utc::now();

        let mut low = task("low", 1, 0, 0);
        low.priority = 4;
        let mut high = task("high", 1, 0, 0);
        high.priority = 2;
        store.create_task(&low, now).unwrap();
        let high_task = store.create_task(&high, now + chrono::Duration::milliseconds(1)).unwrap();

        let main = store.create_main_agent("w", 4, &[], now).unwrap();
        let picked = scheduler.dispatch_for(&main, now).unwrap().unwrap();
        assert_eq!(picked.id, high_task.id);

        let row = store.get_task(picked.id).unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Running);
        assert_eq!(row.agent_id.as_deref(), Some(main.id.as_str()));
    }

    #[test]
    fn dispatch_skips_infeasible_and_takes_next() {
        let (_d, store, scheduler) = fixture();
        let now = Utc::now();

        let mut fat = task("fat", 16, 0, 0);
        fat.priority = 1;
        store.create_task(&fat, now).unwrap();
        let thin = store.create_task(&task("thin", 2, 0, 0), now).unwrap();

        let main = store.create_main_agent("w", 4, &[], now).unwrap();
        let picked = scheduler.dispatch_for(&main, now).unwrap().unwrap();
        assert_eq!(picked.id, thin.id);
    }

    #[test]
    fn dispatch_respects_reject_flag() {
        let (_d, store, scheduler) = fixture();
        let now = Utc::now();
        store.create_task(&task("t", 1, 0, 0), now).unwrap();

        let mut main = store.create_main_agent("w", 4, &[], now).unwrap();
        main.reject_new_task = true;
        assert!(scheduler.dispatch_for(&main, now).unwrap().is_none());
    }

    #[test]
    fn dispatch_relaxes_dependencies_first() {
        let (_d, store, scheduler) = fixture();
        let now = Utc::now();

        let t1 = store.create_task(&task("parent", 1, 0, 0), now).unwrap();
        let mut child = task("child", 1, 0, 0);
        child.depends_on = vec![t1.id];
        let t2 = store.create_task(&child, now).unwrap();
        assert_eq!(t2.status, TaskStatus::Blocked);

        let main = store.create_main_agent("w", 4, &[], now).unwrap();

        // First pass dispatches the parent; the child stays blocked.
        let picked = scheduler.dispatch_for(&main, now).unwrap().unwrap();
        assert_eq!(picked.id, t1.id);
        assert!(scheduler.dispatch_for(&main, now).unwrap().is_none());
        assert_eq!(store.get_task(t2.id).unwrap().unwrap().status, TaskStatus::Blocked);

        // Once the parent completes, the next heartbeat unblocks and claims it.
        store.finish_task(t1.id, TaskStatus::Completed, now).unwrap();
        let picked = scheduler.dispatch_for(&main, now).unwrap().unwrap();
        assert_eq!(picked.id, t2.id);
    }

    #[test]
    fn dispatch_debits_the_stored_lease() {
        let (_d, store, scheduler) = fixture();
        let now = Utc::now();
        let gpus = vec!["0".to_string(), "1".to_string()];
        let main = store.create_main_agent("w", 8, &gpus, now).unwrap();

        let t = store.create_task(&task("t", 2, 1, 0), now).unwrap();
        let picked = scheduler.dispatch_for(&main, now).unwrap().unwrap();
        assert_eq!(picked.id, t.id);
        assert_eq!(picked.gpu_ids, vec!["0".to_string()]);

        let row = store.get_agent(&main.id).unwrap().unwrap();
        assert_eq!(row.available_cpu_cores, 6);
        assert_eq!(row.available_gpu_ids(), vec!["1".to_string()]);
    }

    #[test]
    fn gpu_exclusivity_over_successive_dispatches() {
        // Mirror of the three-task GPU scenario: two single-GPU tasks occupy
        // both cards; the dual-GPU task must wait for both to finish.
        let (_d, store, scheduler) = fixture();
        let now = Utc::now();
        let gpus = vec!["0".to_string(), "1".to_string()];
        let main = store.create_main_agent("w", 8, &gpus, now).unwrap();

        let t1 = store.create_task(&task("t1", 1, 1, 0), now).unwrap();
        let t2 = store
            .create_task(&task("t2", 1, 1, 0), now + chrono::Duration::milliseconds(1))
            .unwrap();
        let t3 = store
            .create_task(&task("t3", 1, 2, 0), now + chrono::Duration::milliseconds(2))
            .unwrap();

        let a1 = scheduler
            .dispatch_for(&store.get_agent(&main.id).unwrap().unwrap(), now)
            .unwrap()
            .unwrap();
        assert_eq!((a1.id, a1.gpu_ids.clone()), (t1.id, vec!["0".to_string()]));

        let a2 = scheduler
            .dispatch_for(&store.get_agent(&main.id).unwrap().unwrap(), now)
            .unwrap()
            .unwrap();
        assert_eq!((a2.id, a2.gpu_ids.clone()), (t2.id, vec!["1".to_string()]));

        // Both cards leased: t3 cannot go.
        assert!(scheduler
            .dispatch_for(&store.get_agent(&main.id).unwrap().unwrap(), now)
            .unwrap()
            .is_none());

        // One release is still not enough for a two-GPU task.
        store.finish_task(t1.id, TaskStatus::Completed, now).unwrap();
        store.credit_lease(&main.id, 1, &["0".to_string()]).unwrap();
        assert!(scheduler
            .dispatch_for(&store.get_agent(&main.id).unwrap().unwrap(), now)
            .unwrap()
            .is_none());

        store.finish_task(t2.id, TaskStatus::Completed, now).unwrap();
        store.credit_lease(&main.id, 1, &["1".to_string()]).unwrap();
        let a3 = scheduler
            .dispatch_for(&store.get_agent(&main.id).unwrap().unwrap(), now)
            .unwrap()
            .unwrap();
        assert_eq!(a3.id, t3.id);
        assert_eq!(a3.gpu_ids, vec!["0".to_string(), "1".to_string()]);
    }

    #[test]
    fn claim_race_falls_through_to_next_candidate() {
        let (_d, store, scheduler) = fixture();
        let now = Utc::now();

        let t1 = store.create_task(&task("t1", 1, 0, 0), now).unwrap();
        let t2 = store
            .create_task(&task("t2", 1, 0, 0), now + chrono::Duration::milliseconds(1))
            .unwrap();
        let main = store.create_main_agent("w", 4, &[], now).unwrap();

        // Simulate another controller thread winning t1 between scan and claim.
        store.atomic_claim(t1.id, "rival", now).unwrap();

        let picked = scheduler.dispatch_for(&main, now).unwrap().unwrap();
        assert_eq!(picked.id, t2.id);
    }
}
