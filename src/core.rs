// src/core.rs
//
// =============================================================================
// TASKGRID: CORE SCHEMA AUTHORITY (v 0.3)
// =============================================================================
//
// The shared language of the control plane.
// This file defines the strict data contracts between the Controller, the
// Main Agents and the Sub Agents — everything that crosses the wire or the
// database boundary lives here.
//
// Design Principles:
// 1. Explicit records for every payload; unknown fields are ignored and
//    missing optional fields default.
// 2. Status enums round-trip losslessly through SQLite TEXT columns.
// 3. One envelope shape for every HTTP response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// 1. TASK LIFECYCLE
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// At least one dependency is not completed yet.
    Blocked,
    /// Eligible for dispatch.
    Waiting,
    /// Claimed by a main agent, executing on a sub agent.
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocked" => Some(TaskStatus::Blocked),
            "waiting" => Some(TaskStatus::Waiting),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "canceled" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub template_type: String,
    /// Opaque blob executed as a shell/batch script on the worker.
    pub script_content: String,
    /// 1..=5, 1 highest.
    pub priority: i64,
    pub status: TaskStatus,

    /// Required whole cores; 0 means no CPU reservation.
    pub cpu_cores: i64,
    pub gpu_count: i64,
    /// Minimum free memory per leased GPU, in MB; 0 disables the check.
    pub gpu_memory: i64,

    /// Ids of tasks that must be completed before this one may run.
    #[serde(default)]
    pub depends_on: Vec<i64>,

    pub created_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time: Option<i64>,

    /// Main agent that claimed the task, once running.
    pub agent_id: Option<String>,
    pub log_file: Option<String>,
}

/// Body of `POST /api/tasks/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub template_type: String,
    pub script_content: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub cpu_cores: i64,
    #[serde(default)]
    pub gpu_count: i64,
    #[serde(default)]
    pub gpu_memory: i64,
    #[serde(default)]
    pub depends_on: Vec<i64>,
}

fn default_priority() -> i64 {
    3
}

/// One page of `GET /api/tasks/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub pages: i64,
}

/// Slice of a task's log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSlice {
    pub content: String,
    pub total_lines: usize,
    pub start_line: usize,
    pub end_line: usize,
}

// ============================================================================
// 2. AGENTS
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Per-host long-lived worker owning the CPU/GPU inventory.
    Main,
    /// Per-task short-lived worker executing one script.
    Sub,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Main => "main",
            AgentKind::Sub => "sub",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "main" => Some(AgentKind::Main),
            "sub" => Some(AgentKind::Sub),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    /// Terminal; a sub agent whose task has finished.
    End,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::End => "end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(AgentStatus::Online),
            "offline" => Some(AgentStatus::Offline),
            "end" => Some(AgentStatus::End),
            _ => None,
        }
    }
}

/// Live view of one GPU, as reported by the probe and annotated by the
/// main agent's lease ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuInfo {
    pub gpu_id: String,
    /// Utilization in 0.0..=1.0.
    #[serde(default)]
    pub usage: f64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub memory_total: u64,
    /// False while the GPU is leased to a live sub agent.
    #[serde(default = "default_true")]
    pub is_available: bool,
}

fn default_true() -> bool {
    true
}

impl GpuInfo {
    pub fn idle(gpu_id: impl Into<String>) -> Self {
        Self {
            gpu_id: gpu_id.into(),
            usage: 0.0,
            memory_used: 0,
            memory_total: 0,
            is_available: true,
        }
    }
}

/// Controller-side agent row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub status: AgentStatus,

    pub created_time: DateTime<Utc>,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub running_time: i64,

    pub cpu_cores: i64,
    pub cpu_usage: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub gpu_info: Vec<GpuInfo>,

    /// Cores not currently leased to sub agents (main agents only).
    pub available_cpu_cores: i64,
    pub reject_new_task: bool,

    /// Sub agents only: the task bound for life and the owning main agent.
    pub task_id: Option<i64>,
    pub main_agent_id: Option<String>,
}

impl AgentRecord {
    pub fn available_gpu_ids(&self) -> Vec<String> {
        self.gpu_info
            .iter()
            .filter(|g| g.is_available)
            .map(|g| g.gpu_id.clone())
            .collect()
    }
}

/// Body of `POST /api/agents/main`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMainRequest {
    pub name: String,
    pub cpu_cores: i64,
    #[serde(default)]
    pub gpu_ids: Vec<String>,
}

/// Body of `POST /api/agents/sub`. The lease fields default to the task
/// row's requirements when the caller omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSubRequest {
    pub name: String,
    pub main_agent_id: String,
    pub task_id: i64,
    #[serde(default)]
    pub cpu_cores: Option<i64>,
    #[serde(default)]
    pub gpu_ids: Vec<String>,
}

// ============================================================================
// 3. HEARTBEAT WIRE PROTOCOL
// ============================================================================

/// `resource_info` of a heartbeat. Field names are normative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceInfo {
    #[serde(default)]
    pub cpu_cores: i64,
    /// Percent; may exceed 100 across cores.
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub gpu_info: Vec<GpuInfo>,
    #[serde(default)]
    pub gpu_ids: Vec<String>,
    #[serde(default)]
    pub available_cpu_cores: i64,
    #[serde(default)]
    pub reject_new_task: bool,
}

/// Task status a sub agent is allowed to report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl ReportedStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportedStatus::Completed | ReportedStatus::Failed)
    }

    pub fn as_task_status(&self) -> TaskStatus {
        match self {
            ReportedStatus::Waiting => TaskStatus::Waiting,
            ReportedStatus::Running => TaskStatus::Running,
            ReportedStatus::Completed => TaskStatus::Completed,
            ReportedStatus::Failed => TaskStatus::Failed,
        }
    }
}

/// `task_info` of a sub-agent heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub status: ReportedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub resource_info: ResourceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_info: Option<TaskReport>,
}

/// Directive returned by the heartbeat endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatAction {
    Continue,
    NewTask,
    RejectNewTask,
    AcceptNewTask,
    Stop,
    Quit,
}

impl HeartbeatAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatAction::Continue => "continue",
            HeartbeatAction::NewTask => "new_task",
            HeartbeatAction::RejectNewTask => "reject_new_task",
            HeartbeatAction::AcceptNewTask => "accept_new_task",
            HeartbeatAction::Stop => "stop",
            HeartbeatAction::Quit => "quit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(HeartbeatAction::Continue),
            "new_task" => Some(HeartbeatAction::NewTask),
            "reject_new_task" => Some(HeartbeatAction::RejectNewTask),
            "accept_new_task" => Some(HeartbeatAction::AcceptNewTask),
            "stop" => Some(HeartbeatAction::Stop),
            "quit" => Some(HeartbeatAction::Quit),
            _ => None,
        }
    }
}

/// The task object attached to a `new_task` directive. Carries the leased
/// GPU ids on top of the task's own fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: i64,
    pub name: String,
    pub script_content: String,
    pub cpu_cores: i64,
    pub gpu_count: i64,
    pub gpu_memory: i64,
    pub gpu_ids: Vec<String>,
    pub priority: i64,
    #[serde(default)]
    pub depends_on: Vec<i64>,
}

impl TaskAssignment {
    pub fn from_task(task: &Task, gpu_ids: Vec<String>) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            script_content: task.script_content.clone(),
            cpu_cores: task.cpu_cores,
            gpu_count: task.gpu_count,
            gpu_memory: task.gpu_memory,
            gpu_ids,
            priority: task.priority,
            depends_on: task.depends_on.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub action: HeartbeatAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskAssignment>,
}

impl HeartbeatResponse {
    pub fn plain(action: HeartbeatAction) -> Self {
        Self { action, task: None }
    }

    pub fn new_task(assignment: TaskAssignment) -> Self {
        Self {
            action: HeartbeatAction::NewTask,
            task: Some(assignment),
        }
    }
}

// ============================================================================
// 4. SCRIPT TEMPLATES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub content: String,
    pub created_time: DateTime<Utc>,
}

// ============================================================================
// 5. API ENVELOPE
// ============================================================================

/// Every HTTP response body: `{success, data?, message?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn ok_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }

    /// Success with a human message and no payload.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}
