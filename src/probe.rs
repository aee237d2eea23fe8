// src/probe.rs
//
// =============================================================================
// TASKGRID: RESOURCE PROBE (v 0.3)
// =============================================================================
//
// The Inventory.
//
// Responsibilities:
// 1. Resolve CPU core count and memory totals, honoring container limits
//    (cgroup v2, then v1, then the host).
// 2. Sample CPU usage system-wide or for a process tree (pid + recursive
//    children), discarding a warm-up sample.
// 3. Enumerate GPUs via nvidia-smi, honoring CUDA_VISIBLE_DEVICES.
//
// Failure policy: a snapshot never fails as a whole. Any per-GPU or
// per-process query that errors contributes zeros/defaults for its fields.

use crate::core::{GpuInfo, ResourceInfo};
use std::collections::{HashMap, HashSet, VecDeque};
use std::env;
use std::fs;
use std::process::Command;
use std::time::Duration;
use sysinfo::{
    MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System,
};

/// Sampling window for CPU usage. The first refresh only primes counters.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// cgroup v1 memory limit sentinel: anything at or above 2^63 means "no limit".
const CGROUP_V1_NO_LIMIT: u64 = 1 << 63;

pub struct ResourceProbe;

impl ResourceProbe {
    pub fn new() -> Self {
        Self
    }

    /// Full snapshot rooted at the whole system.
    pub fn snapshot(&self) -> ResourceInfo {
        self.snapshot_inner(None)
    }

    /// Snapshot with CPU/memory usage attributed to `pid` and all of its
    /// recursive children. Matches what users expect for a task process.
    pub fn snapshot_for_pid(&self, pid: u32) -> ResourceInfo {
        self.snapshot_inner(Some(pid))
    }

    fn snapshot_inner(&self, pid: Option<u32>) -> ResourceInfo {
        let cpu_cores = detect_cpu_cores();
        let memory_total = detect_memory_total();

        let (cpu_usage, memory_used) = match pid {
            Some(pid) => sample_process_tree(pid),
            None => sample_system(),
        };

        let gpu_info = detect_gpus();
        let gpu_ids = gpu_info.iter().map(|g| g.gpu_id.clone()).collect();

        ResourceInfo {
            cpu_cores,
            cpu_usage,
            memory_total,
            memory_used,
            gpu_info,
            gpu_ids,
            available_cpu_cores: cpu_cores,
            reject_new_task: false,
        }
    }
}

impl Default for ResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 1. CPU / MEMORY LIMITS
// ============================================================================

/// Resolution order: cgroup v2 quota, cgroup v1 quota, host logical count.
pub fn detect_cpu_cores() -> i64 {
    if let Ok(content) = fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu_max(&content) {
            return cores;
        }
    }

    if let (Ok(quota), Ok(period)) = (
        fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_v1_cpu(&quota, &period) {
            return cores;
        }
    }

    num_cpus::get() as i64
}

/// cgroup v2 `cpu.max` is "<quota> <period>" or "max".
fn parse_cgroup_v2_cpu_max(content: &str) -> Option<i64> {
    let content = content.trim();
    if content == "max" {
        return None;
    }
    let mut parts = content.split_whitespace();
    let quota: i64 = parts.next()?.parse().ok()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period).max(1))
    } else {
        None
    }
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<i64> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period).max(1))
    } else {
        None
    }
}

/// cgroup v2 `memory.max`, cgroup v1 `memory.limit_in_bytes`, else host total.
pub fn detect_memory_total() -> u64 {
    if let Ok(content) = fs::read_to_string("/sys/fs/cgroup/memory.max") {
        if let Some(bytes) = parse_cgroup_memory_limit(&content) {
            return bytes;
        }
    }

    if let Ok(content) = fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes") {
        if let Some(bytes) = parse_cgroup_memory_limit(&content) {
            return bytes;
        }
    }

    let mut sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();
    sys.total_memory()
}

fn parse_cgroup_memory_limit(content: &str) -> Option<u64> {
    let content = content.trim();
    if content == "max" {
        return None;
    }
    let bytes: u64 = content.parse().ok()?;
    if bytes == 0 || bytes >= CGROUP_V1_NO_LIMIT {
        None
    } else {
        Some(bytes)
    }
}

// ============================================================================
// 2. USAGE SAMPLING
// ============================================================================

/// System-wide CPU percent and used memory bytes.
fn sample_system() -> (f64, u64) {
    let mut sys = System::new_with_specifics(
        RefreshKind::nothing()
            .with_cpu(sysinfo::CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(MemoryRefreshKind::everything()),
    );

    // Warm-up sample: the first reading is always zero.
    sys.refresh_cpu_usage();
    std::thread::sleep(CPU_SAMPLE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    (sys.global_cpu_usage() as f64, sys.used_memory())
}

/// CPU percent (summed per-core, may exceed 100) and RSS bytes for a process
/// plus all recursive descendants.
fn sample_process_tree(root: u32) -> (f64, u64) {
    let refresh = ProcessRefreshKind::nothing().with_cpu().with_memory();
    let mut sys = System::new_with_specifics(RefreshKind::nothing().with_processes(refresh));

    // Warm-up sample; usage is a delta between two refreshes.
    sys.refresh_processes(ProcessesToUpdate::All, true);
    std::thread::sleep(CPU_SAMPLE_INTERVAL);
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let parents: HashMap<Pid, Pid> = sys
        .processes()
        .iter()
        .filter_map(|(pid, proc_)| proc_.parent().map(|pp| (*pid, pp)))
        .collect();

    let members = collect_descendants(Pid::from_u32(root), &parents);

    let mut cpu = 0.0f64;
    let mut rss = 0u64;
    for pid in &members {
        if let Some(proc_) = sys.processes().get(pid) {
            cpu += proc_.cpu_usage() as f64;
            rss += proc_.memory();
        }
    }
    (cpu, rss)
}

/// BFS over the parent map, rooted at `root` (inclusive).
fn collect_descendants(root: Pid, parents: &HashMap<Pid, Pid>) -> HashSet<Pid> {
    let mut members: HashSet<Pid> = HashSet::new();
    members.insert(root);

    // Child lists are not indexed, so walk the parent map to a fixpoint.
    let mut queue: VecDeque<Pid> = VecDeque::new();
    queue.push_back(root);
    while let Some(current) = queue.pop_front() {
        for (child, parent) in parents {
            if *parent == current && members.insert(*child) {
                queue.push_back(*child);
            }
        }
    }
    members
}

// ============================================================================
// 3. GPU ENUMERATION
// ============================================================================

/// Query nvidia-smi for utilization and memory. A missing binary or a
/// malformed line simply yields fewer (or zeroed) entries.
pub fn detect_gpus() -> Vec<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,utilization.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();

    let gpus = match output {
        Ok(out) if out.status.success() => {
            parse_nvidia_smi_csv(&String::from_utf8_lossy(&out.stdout))
        }
        _ => Vec::new(),
    };

    filter_visible_gpus(gpus, env::var("CUDA_VISIBLE_DEVICES").ok().as_deref())
}

/// Lines look like `0, 45, 1024, 16384` (utilization in %, memory in MiB).
fn parse_nvidia_smi_csv(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let gpu_id = fields.first()?.to_string();
            let usage = fields
                .get(1)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
                / 100.0;
            let memory_used = fields
                .get(2)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                * 1024
                * 1024;
            let memory_total = fields
                .get(3)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                * 1024
                * 1024;
            Some(GpuInfo {
                gpu_id,
                usage,
                memory_used,
                memory_total,
                is_available: true,
            })
        })
        .collect()
}

/// CUDA_VISIBLE_DEVICES narrows the enumeration when set and non-empty.
fn filter_visible_gpus(gpus: Vec<GpuInfo>, visible: Option<&str>) -> Vec<GpuInfo> {
    let Some(visible) = visible else {
        return gpus;
    };
    let visible = visible.trim();
    if visible.is_empty() {
        return Vec::new();
    }

    let wanted: HashSet<&str> = visible.split(',').map(str::trim).collect();
    gpus.into_iter()
        .filter(|g| wanted.contains(g.gpu_id.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_v2_cpu_max_parses_quota() {
        assert_eq!(parse_cgroup_v2_cpu_max("200000 100000\n"), Some(2));
        assert_eq!(parse_cgroup_v2_cpu_max("max\n"), None);
        // Sub-core quotas round up to one usable core.
        assert_eq!(parse_cgroup_v2_cpu_max("50000 100000"), Some(1));
        assert_eq!(parse_cgroup_v2_cpu_max("-1 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu_max("garbage"), None);
    }

    #[test]
    fn cgroup_v1_cpu_parses_quota_pair() {
        assert_eq!(parse_cgroup_v1_cpu("400000\n", "100000\n"), Some(4));
        assert_eq!(parse_cgroup_v1_cpu("-1", "100000"), None);
    }

    #[test]
    fn cgroup_memory_limit_ignores_sentinel() {
        assert_eq!(parse_cgroup_memory_limit("1073741824\n"), Some(1 << 30));
        assert_eq!(parse_cgroup_memory_limit("max"), None);
        assert_eq!(parse_cgroup_memory_limit("9223372036854771712"), None);
        assert_eq!(parse_cgroup_memory_limit(""), None);
    }

    #[test]
    fn nvidia_smi_csv_parses_and_zeroes_bad_fields() {
        let out = "0, 45, 1024, 16384\n1, bad, 0, 16384\n\n";
        let gpus = parse_nvidia_smi_csv(out);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].gpu_id, "0");
        assert!((gpus[0].usage - 0.45).abs() < 1e-9);
        assert_eq!(gpus[0].memory_used, 1024 * 1024 * 1024);
        assert_eq!(gpus[1].usage, 0.0);
        assert!(gpus.iter().all(|g| g.is_available));
    }

    #[test]
    fn cuda_visible_devices_filters_enumeration() {
        let gpus = vec![GpuInfo::idle("0"), GpuInfo::idle("1"), GpuInfo::idle("2")];
        let filtered = filter_visible_gpus(gpus.clone(), Some("0,2"));
        let ids: Vec<_> = filtered.iter().map(|g| g.gpu_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "2"]);

        assert_eq!(filter_visible_gpus(gpus.clone(), Some("")).len(), 0);
        assert_eq!(filter_visible_gpus(gpus, None).len(), 3);
    }

    #[test]
    fn descendant_walk_is_transitive() {
        let p = |n: u32| Pid::from_u32(n);
        let parents: HashMap<Pid, Pid> =
            [(p(2), p(1)), (p(3), p(2)), (p(4), p(3)), (p(9), p(7))]
                .into_iter()
                .collect();

        let members = collect_descendants(p(1), &parents);
        assert!(members.contains(&p(1)));
        assert!(members.contains(&p(4)));
        assert!(!members.contains(&p(9)));
    }

    #[test]
    fn snapshot_never_panics() {
        let info = ResourceProbe::new().snapshot();
        assert!(info.cpu_cores >= 1);
        assert!(info.memory_total > 0);
    }
}
