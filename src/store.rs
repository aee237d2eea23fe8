// src/store.rs
//
// =============================================================================
// TASKGRID: TASK STORE (v 0.3)
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - SQLite using the "Hybrid Relational" pattern.
// - High-traffic fields (status, timestamps, resource counters) are columns.
// - Complex data (per-GPU state) is a JSON text column.
// - Timestamps are epoch milliseconds for cheap ordering and arithmetic.
// - One short-lived connection per call; the busy timeout absorbs contention
//   from concurrent heartbeat handlers.
//
// The single dispatch serialization point is `atomic_claim`: a conditional
// UPDATE guarded on status='waiting'. Controllers can restart without any
// reconciliation because no in-process lock participates in claiming.

use crate::core::{
    AgentKind, AgentRecord, AgentStatus, CreateTaskRequest, GpuInfo, LogSlice, RegisterSubRequest,
    ResourceInfo, Task, TaskPage, TaskStatus, Template,
};
use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: id={0}")]
    TaskNotFound(i64),

    #[error("agent not found: id={0}")]
    AgentNotFound(String),

    #[error("template not found: id={0}")]
    TemplateNotFound(i64),

    #[error("unknown dependency task id: {0}")]
    UnknownDependency(i64),

    #[error("dependency cycle detected involving task {0}")]
    DependencyCycle(i64),

    #[error("template name already exists: {0}")]
    DuplicateTemplate(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// -----------------------------------------------------------------------------
// Filters
// -----------------------------------------------------------------------------

/// Filter for task listings; all fields combine with AND.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Vec<TaskStatus>,
    pub name: Option<String>,
    pub template_type: Option<String>,
    pub script_content: Option<String>,
}

// -----------------------------------------------------------------------------
// TaskStore
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct TaskStore {
    db_path: PathBuf,
    log_dir: PathBuf,
}

impl TaskStore {
    pub fn open(db_path: impl AsRef<Path>, log_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
            log_dir: log_dir.as_ref().to_path_buf(),
        };
        if let Some(parent) = store.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&store.log_dir)?;
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        // Busy timeout handles contention between heartbeat workers; NORMAL
        // sync is enough since every mutation is a single small transaction.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(conn)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                template_type TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 3,
                status TEXT NOT NULL DEFAULT 'waiting',
                created_time_ms INTEGER NOT NULL,
                script_content TEXT NOT NULL,
                cpu_cores INTEGER NOT NULL DEFAULT 0,
                gpu_count INTEGER NOT NULL DEFAULT 0,
                gpu_memory INTEGER NOT NULL DEFAULT 0,
                start_time_ms INTEGER,
                end_time_ms INTEGER,
                execution_time INTEGER,
                agent_id TEXT,
                log_file TEXT
            );

            CREATE TABLE IF NOT EXISTS task_dependencies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id),
                depends_on_id INTEGER NOT NULL REFERENCES tasks(id)
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'online',
                created_time_ms INTEGER NOT NULL,
                last_heartbeat_ms INTEGER,
                running_time INTEGER NOT NULL DEFAULT 0,
                cpu_cores INTEGER NOT NULL DEFAULT 0,
                cpu_usage REAL NOT NULL DEFAULT 0,
                memory_used INTEGER NOT NULL DEFAULT 0,
                memory_total INTEGER NOT NULL DEFAULT 0,
                gpu_info TEXT NOT NULL DEFAULT '[]',
                task_id INTEGER,
                main_agent_id TEXT,
                available_cpu_cores INTEGER NOT NULL DEFAULT 0,
                reject_new_task INTEGER NOT NULL DEFAULT 0,
                pending_directive TEXT,
                lease_released INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                created_time_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_time_ms);
            CREATE INDEX IF NOT EXISTS idx_deps_task ON task_dependencies(task_id);
            CREATE INDEX IF NOT EXISTS idx_agents_main ON agents(main_agent_id);
            COMMIT;",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // TASKS: WRITE API
    // -------------------------------------------------------------------------

    /// Insert a task (and its dependency edges) atomically. A task with any
    /// not-yet-completed dependency starts `blocked`, otherwise `waiting`.
    pub fn create_task(&self, req: &CreateTaskRequest, now: DateTime<Utc>) -> StoreResult<Task> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // Every referenced dependency must exist before edges go in.
        let mut unmet = 0i64;
        for dep_id in &req.depends_on {
            let status: Option<String> = tx
                .query_row("SELECT status FROM tasks WHERE id = ?1", params![dep_id], |r| {
                    r.get(0)
                })
                .optional()?;
            match status {
                None => return Err(StoreError::UnknownDependency(*dep_id)),
                Some(s) if s != "completed" => unmet += 1,
                Some(_) => {}
            }
        }

        let status = if unmet > 0 {
            TaskStatus::Blocked
        } else {
            TaskStatus::Waiting
        };
        let priority = req.priority.clamp(1, 5);

        tx.execute(
            "INSERT INTO tasks (
                name, template_type, priority, status, created_time_ms,
                script_content, cpu_cores, gpu_count, gpu_memory
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                req.name,
                req.template_type,
                priority,
                status.as_str(),
                now.timestamp_millis(),
                req.script_content,
                req.cpu_cores.max(0),
                req.gpu_count.max(0),
                req.gpu_memory.max(0),
            ],
        )?;
        let task_id = tx.last_insert_rowid();

        let log_file = self.log_dir.join(format!("task_{}.log", task_id));
        tx.execute(
            "UPDATE tasks SET log_file = ?1 WHERE id = ?2",
            params![log_file.to_string_lossy(), task_id],
        )?;

        for dep_id in &req.depends_on {
            tx.execute(
                "INSERT INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                params![task_id, dep_id],
            )?;
        }

        tx.commit()?;
        log::info!(
            "Task created: id={}, name={}, status={}",
            task_id,
            req.name,
            status.as_str()
        );

        self.get_task(task_id)?.ok_or(StoreError::TaskNotFound(task_id))
    }

    /// The atomic claim: waiting -> running iff still waiting. Returns whether
    /// the row changed; a false return means another heartbeat won the race.
    pub fn atomic_claim(
        &self,
        task_id: i64,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'running', agent_id = ?1, start_time_ms = ?2
             WHERE id = ?3 AND status = 'waiting'",
            params![agent_id, now.timestamp_millis(), task_id],
        )?;
        Ok(changed == 1)
    }

    /// Move a task to a terminal state. Terminal rows never change again, so
    /// the guard also gives terminal monotonicity. Returns whether it applied.
    pub fn finish_task(
        &self,
        task_id: i64,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        debug_assert!(status.is_terminal());
        let conn = self.conn()?;
        let now_ms = now.timestamp_millis();
        let changed = conn.execute(
            "UPDATE tasks SET
                status = ?1,
                end_time_ms = ?2,
                execution_time = CASE
                    WHEN start_time_ms IS NOT NULL THEN (?2 - start_time_ms) / 1000
                    ELSE NULL
                END
             WHERE id = ?3 AND status NOT IN ('completed', 'failed', 'canceled')",
            params![status.as_str(), now_ms, task_id],
        )?;
        if changed == 1 {
            log::info!("Task {} -> {}", task_id, status.as_str());
        }
        Ok(changed == 1)
    }

    /// Flip every blocked task whose dependencies are all completed back to
    /// waiting. Cheap single statement; bounded by the blocked row count.
    pub fn unblock_ready_tasks(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'waiting'
             WHERE status = 'blocked'
               AND NOT EXISTS (
                   SELECT 1 FROM task_dependencies d
                   JOIN tasks dep ON dep.id = d.depends_on_id
                   WHERE d.task_id = tasks.id AND dep.status != 'completed'
               )",
            [],
        )?;
        if changed > 0 {
            log::info!("Unblocked {} dependency-resolved task(s)", changed);
        }
        Ok(changed)
    }

    /// Partial update used by `PUT /api/tasks/<id>`. A `depends_on` change is
    /// re-validated against the whole dependency DAG.
    pub fn update_task_fields(
        &self,
        task_id: i64,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<Task> {
        const COLUMNS: [(&str, &str); 7] = [
            ("name", "name"),
            ("template_type", "template_type"),
            ("priority", "priority"),
            ("status", "status"),
            ("cpu_cores", "cpu_cores"),
            ("gpu_count", "gpu_count"),
            ("gpu_memory", "gpu_memory"),
        ];

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM tasks WHERE id = ?1", params![task_id], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::TaskNotFound(task_id));
        }

        for (key, column) in COLUMNS {
            let Some(value) = fields.get(key) else {
                continue;
            };
            match value {
                serde_json::Value::String(s) => {
                    tx.execute(
                        &format!("UPDATE tasks SET {} = ?1 WHERE id = ?2", column),
                        params![s, task_id],
                    )?;
                }
                serde_json::Value::Number(n) => {
                    let v = n.as_i64().unwrap_or_default();
                    let v = if key == "priority" { v.clamp(1, 5) } else { v };
                    tx.execute(
                        &format!("UPDATE tasks SET {} = ?1 WHERE id = ?2", column),
                        params![v, task_id],
                    )?;
                }
                _ => {}
            }
        }

        if let Some(serde_json::Value::Array(deps)) = fields.get("depends_on") {
            let dep_ids: Vec<i64> = deps.iter().filter_map(|v| v.as_i64()).collect();

            for dep_id in &dep_ids {
                let known: Option<i64> = tx
                    .query_row("SELECT id FROM tasks WHERE id = ?1", params![dep_id], |r| {
                        r.get(0)
                    })
                    .optional()?;
                if known.is_none() {
                    return Err(StoreError::UnknownDependency(*dep_id));
                }
            }

            // Rebuild the edge set with the proposal in place, then reject on cycle.
            let mut graph: DiGraphMap<i64, ()> = DiGraphMap::new();
            {
                let mut stmt =
                    tx.prepare("SELECT task_id, depends_on_id FROM task_dependencies WHERE task_id != ?1")?;
                let rows = stmt.query_map(params![task_id], |r| {
                    Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (t, d) = row?;
                    graph.add_edge(d, t, ());
                }
            }
            for dep_id in &dep_ids {
                graph.add_edge(*dep_id, task_id, ());
            }
            if is_cyclic_directed(&graph) {
                return Err(StoreError::DependencyCycle(task_id));
            }

            tx.execute(
                "DELETE FROM task_dependencies WHERE task_id = ?1",
                params![task_id],
            )?;
            for dep_id in &dep_ids {
                tx.execute(
                    "INSERT INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                    params![task_id, dep_id],
                )?;
            }
        }

        tx.commit()?;
        self.get_task(task_id)?.ok_or(StoreError::TaskNotFound(task_id))
    }

    // -------------------------------------------------------------------------
    // TASKS: READ API
    // -------------------------------------------------------------------------

    pub fn get_task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                "SELECT id, name, template_type, priority, status, created_time_ms,
                        script_content, cpu_cores, gpu_count, gpu_memory,
                        start_time_ms, end_time_ms, execution_time, agent_id, log_file
                 FROM tasks WHERE id = ?1",
                params![task_id],
                task_from_row,
            )
            .optional()?;

        let Some(mut task) = task else {
            return Ok(None);
        };
        task.depends_on = self.dependency_ids(&conn, task_id)?;
        Ok(Some(task))
    }

    fn dependency_ids(&self, conn: &Connection, task_id: i64) -> StoreResult<Vec<i64>> {
        let mut stmt =
            conn.prepare("SELECT depends_on_id FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on_id")?;
        let ids = stmt
            .query_map(params![task_id], |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Waiting tasks in dispatch order: priority asc (1 highest), then FIFO.
    pub fn list_waiting_tasks_ordered(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn()?;
        let ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM tasks WHERE status = 'waiting'
                 ORDER BY priority ASC, created_time_ms ASC, id ASC",
            )?;
            let ids = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        drop(conn);

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = self.get_task(id)? {
                tasks.push(t);
            }
        }
        Ok(tasks)
    }

    pub fn count_unsatisfied_deps(&self, task_id: i64) -> StoreResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM task_dependencies d
             JOIN tasks dep ON dep.id = d.depends_on_id
             WHERE d.task_id = ?1 AND dep.status != 'completed'",
            params![task_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Paginated listing for the external API, newest first.
    pub fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: i64,
        per_page: i64,
    ) -> StoreResult<TaskPage> {
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if !filter.status.is_empty() {
            let placeholders = vec!["?"; filter.status.len()].join(", ");
            conditions.push(format!("status IN ({})", placeholders));
            for s in &filter.status {
                values.push(s.as_str().to_string().into());
            }
        }
        if let Some(name) = &filter.name {
            conditions.push("name LIKE ?".into());
            values.push(format!("%{}%", name).into());
        }
        if let Some(tt) = &filter.template_type {
            conditions.push("template_type = ?".into());
            values.push(tt.clone().into());
        }
        if let Some(sc) = &filter.script_content {
            conditions.push("script_content LIKE ?".into());
            values.push(format!("%{}%", sc).into());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let conn = self.conn()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM tasks{}", where_clause),
            params_from_iter(values.iter()),
            |r| r.get(0),
        )?;

        let page = page.max(1);
        let per_page = per_page.max(1);
        let pages = (total + per_page - 1) / per_page;
        let offset = (page - 1) * per_page;

        let ids: Vec<i64> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM tasks{} ORDER BY created_time_ms DESC, id DESC LIMIT ? OFFSET ?",
                where_clause
            ))?;
            let mut all_values = values.clone();
            all_values.push(per_page.into());
            all_values.push(offset.into());
            let ids = stmt
                .query_map(params_from_iter(all_values.iter()), |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        drop(conn);

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = self.get_task(id)? {
                tasks.push(t);
            }
        }

        Ok(TaskPage {
            tasks,
            total,
            page,
            per_page,
            pages,
        })
    }

    // -------------------------------------------------------------------------
    // TASK LOGS (append-only files)
    // -------------------------------------------------------------------------

    /// Append bytes to the task's log, guaranteeing a trailing newline.
    pub fn append_log(&self, task_id: i64, content: &str) -> StoreResult<()> {
        let task = self.get_task(task_id)?.ok_or(StoreError::TaskNotFound(task_id))?;
        let path = task
            .log_file
            .map(PathBuf::from)
            .unwrap_or_else(|| self.log_dir.join(format!("task_{}.log", task_id)));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(content.as_bytes())?;
        if !content.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn read_log(
        &self,
        task_id: i64,
        start_line: usize,
        max_lines: Option<usize>,
    ) -> StoreResult<LogSlice> {
        let task = self.get_task(task_id)?.ok_or(StoreError::TaskNotFound(task_id))?;
        let path = task
            .log_file
            .map(PathBuf::from)
            .unwrap_or_else(|| self.log_dir.join(format!("task_{}.log", task_id)));

        if !path.exists() {
            return Ok(LogSlice {
                content: String::new(),
                total_lines: 0,
                start_line: 0,
                end_line: 0,
            });
        }

        let raw = fs::read_to_string(&path)?;
        let lines: Vec<&str> = raw.lines().collect();
        let total_lines = lines.len();
        let start = start_line.min(total_lines);
        let end = match max_lines {
            Some(n) => (start + n).min(total_lines),
            None => total_lines,
        };

        let mut content = lines[start..end].join("\n");
        if end > start {
            content.push('\n');
        }

        Ok(LogSlice {
            content,
            total_lines,
            start_line: start,
            end_line: end,
        })
    }

    // -------------------------------------------------------------------------
    // AGENTS
    // -------------------------------------------------------------------------

    pub fn create_main_agent(
        &self,
        name: &str,
        cpu_cores: i64,
        gpu_ids: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<AgentRecord> {
        let id = Uuid::new_v4().to_string();
        let gpu_info: Vec<GpuInfo> = gpu_ids.iter().map(GpuInfo::idle).collect();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agents (
                id, name, type, status, created_time_ms, last_heartbeat_ms,
                cpu_cores, gpu_info, available_cpu_cores
            ) VALUES (?1, ?2, 'main', 'online', ?3, ?3, ?4, ?5, ?4)",
            params![
                id,
                name,
                now.timestamp_millis(),
                cpu_cores,
                serde_json::to_string(&gpu_info).unwrap_or_else(|_| "[]".into()),
            ],
        )?;

        log::info!("Main agent registered: id={}, name={}, cores={}", id, name, cpu_cores);
        self.get_agent(&id)?.ok_or_else(|| StoreError::AgentNotFound(id))
    }

    /// Create a sub agent bound to its task for life. The lease defaults to
    /// the task row's requirements when the request omits it.
    pub fn create_sub_agent(
        &self,
        req: &RegisterSubRequest,
        now: DateTime<Utc>,
    ) -> StoreResult<AgentRecord> {
        let main = self
            .get_agent(&req.main_agent_id)?
            .filter(|a| a.kind == AgentKind::Main && a.status == AgentStatus::Online)
            .ok_or_else(|| StoreError::AgentNotFound(req.main_agent_id.clone()))?;

        let task = self
            .get_task(req.task_id)?
            .ok_or(StoreError::TaskNotFound(req.task_id))?;

        let lease_cores = req.cpu_cores.unwrap_or(task.cpu_cores);
        let gpu_info: Vec<GpuInfo> = req.gpu_ids.iter().map(GpuInfo::idle).collect();
        let id = Uuid::new_v4().to_string();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agents (
                id, name, type, status, created_time_ms, last_heartbeat_ms,
                cpu_cores, gpu_info, available_cpu_cores, task_id, main_agent_id
            ) VALUES (?1, ?2, 'sub', 'online', ?3, ?3, ?4, ?5, 0, ?6, ?7)",
            params![
                id,
                req.name,
                now.timestamp_millis(),
                lease_cores,
                serde_json::to_string(&gpu_info).unwrap_or_else(|_| "[]".into()),
                req.task_id,
                main.id,
            ],
        )?;

        log::info!(
            "Sub agent registered: id={}, task={}, main={}",
            id,
            req.task_id,
            main.id
        );
        self.get_agent(&id)?.ok_or_else(|| StoreError::AgentNotFound(id))
    }

    pub fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentRecord>> {
        let conn = self.conn()?;
        let agent = conn
            .query_row(
                "SELECT id, name, type, status, created_time_ms, last_heartbeat_ms,
                        running_time, cpu_cores, cpu_usage, memory_used, memory_total,
                        gpu_info, task_id, main_agent_id, available_cpu_cores, reject_new_task
                 FROM agents WHERE id = ?1",
                params![agent_id],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    pub fn list_agents(
        &self,
        kind: Option<AgentKind>,
        status: Option<AgentStatus>,
    ) -> StoreResult<Vec<AgentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, type, status, created_time_ms, last_heartbeat_ms,
                    running_time, cpu_cores, cpu_usage, memory_used, memory_total,
                    gpu_info, task_id, main_agent_id, available_cpu_cores, reject_new_task
             FROM agents ORDER BY created_time_ms ASC",
        )?;
        let agents = stmt
            .query_map([], agent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(agents
            .into_iter()
            .filter(|a| kind.map_or(true, |k| a.kind == k))
            .filter(|a| status.map_or(true, |s| a.status == s))
            .collect())
    }

    /// Live (online) sub agents of one main agent.
    pub fn sub_agents_of(&self, main_agent_id: &str) -> StoreResult<Vec<AgentRecord>> {
        Ok(self
            .list_agents(Some(AgentKind::Sub), None)?
            .into_iter()
            .filter(|a| a.main_agent_id.as_deref() == Some(main_agent_id))
            .collect())
    }

    /// Stamp a heartbeat: liveness, usage counters and the GPU view.
    pub fn apply_heartbeat(
        &self,
        agent_id: &str,
        info: &ResourceInfo,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE agents SET
                status = 'online',
                last_heartbeat_ms = ?1,
                running_time = (?1 - created_time_ms) / 1000,
                cpu_usage = ?2,
                memory_used = ?3,
                memory_total = ?4,
                gpu_info = ?5,
                available_cpu_cores = ?6,
                reject_new_task = ?7
             WHERE id = ?8",
            params![
                now.timestamp_millis(),
                info.cpu_usage,
                info.memory_used as i64,
                info.memory_total as i64,
                serde_json::to_string(&info.gpu_info).unwrap_or_else(|_| "[]".into()),
                info.available_cpu_cores,
                info.reject_new_task as i64,
                agent_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::AgentNotFound(agent_id.to_string()));
        }
        Ok(())
    }

    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE agents SET status = ?1 WHERE id = ?2",
            params![status.as_str(), agent_id],
        )?;
        Ok(())
    }

    /// Queue a one-shot directive for delivery on the agent's next heartbeat.
    pub fn set_pending_directive(&self, agent_id: &str, directive: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE agents SET pending_directive = ?1 WHERE id = ?2",
            params![directive, agent_id],
        )?;
        if changed == 0 {
            return Err(StoreError::AgentNotFound(agent_id.to_string()));
        }
        Ok(())
    }

    /// Pop the pending directive, if any.
    pub fn take_pending_directive(&self, agent_id: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let directive: Option<String> = tx
            .query_row(
                "SELECT pending_directive FROM agents WHERE id = ?1",
                params![agent_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        if directive.is_some() {
            tx.execute(
                "UPDATE agents SET pending_directive = NULL WHERE id = ?1",
                params![agent_id],
            )?;
        }
        tx.commit()?;
        Ok(directive)
    }

    /// Debit a fresh lease from the stored main-agent row so the controller's
    /// view stays consistent between the claim and the agent's next heartbeat.
    pub fn debit_lease(
        &self,
        main_agent_id: &str,
        cpu_cores: i64,
        gpu_ids: &[String],
    ) -> StoreResult<()> {
        self.adjust_lease(main_agent_id, cpu_cores, gpu_ids, false)
    }

    /// Return a lease to the main-agent row (sub agent finished or died).
    pub fn credit_lease(
        &self,
        main_agent_id: &str,
        cpu_cores: i64,
        gpu_ids: &[String],
    ) -> StoreResult<()> {
        self.adjust_lease(main_agent_id, cpu_cores, gpu_ids, true)
    }

    fn adjust_lease(
        &self,
        main_agent_id: &str,
        cpu_cores: i64,
        gpu_ids: &[String],
        release: bool,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let row: Option<(i64, i64, String)> = tx
            .query_row(
                "SELECT cpu_cores, available_cpu_cores, gpu_info FROM agents WHERE id = ?1",
                params![main_agent_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((total, available, gpu_json)) = row else {
            return Err(StoreError::AgentNotFound(main_agent_id.to_string()));
        };

        let available = if release {
            (available + cpu_cores).min(total)
        } else {
            (available - cpu_cores).max(0)
        };

        let mut gpus: Vec<GpuInfo> = serde_json::from_str(&gpu_json).unwrap_or_default();
        for gpu in gpus.iter_mut() {
            if gpu_ids.contains(&gpu.gpu_id) {
                gpu.is_available = release;
            }
        }

        tx.execute(
            "UPDATE agents SET available_cpu_cores = ?1, gpu_info = ?2 WHERE id = ?3",
            params![
                available,
                serde_json::to_string(&gpus).unwrap_or_else(|_| "[]".into()),
                main_agent_id,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Return a sub agent's lease to its main agent exactly once, no matter
    /// how many paths race to release it (final heartbeat, watchdog, cancel).
    /// Returns whether this call performed the release.
    pub fn release_sub_lease(&self, sub_agent_id: &str) -> StoreResult<bool> {
        let sub = self
            .get_agent(sub_agent_id)?
            .ok_or_else(|| StoreError::AgentNotFound(sub_agent_id.to_string()))?;
        if sub.kind != AgentKind::Sub {
            return Ok(false);
        }

        {
            let conn = self.conn()?;
            let claimed = conn.execute(
                "UPDATE agents SET lease_released = 1 WHERE id = ?1 AND lease_released = 0",
                params![sub_agent_id],
            )?;
            if claimed == 0 {
                return Ok(false);
            }
        }

        if let Some(main_id) = &sub.main_agent_id {
            let gpu_ids: Vec<String> = sub.gpu_info.iter().map(|g| g.gpu_id.clone()).collect();
            self.credit_lease(main_id, sub.cpu_cores, &gpu_ids)?;
            log::info!(
                "Released lease of sub agent {} back to main {} (cores={}, gpus={:?})",
                sub_agent_id,
                main_id,
                sub.cpu_cores,
                gpu_ids
            );
        }
        Ok(true)
    }

    /// Online agents whose last heartbeat predates the cutoff. Watchdog input.
    pub fn stale_online_agents(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<AgentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, type, status, created_time_ms, last_heartbeat_ms,
                    running_time, cpu_cores, cpu_usage, memory_used, memory_total,
                    gpu_info, task_id, main_agent_id, available_cpu_cores, reject_new_task
             FROM agents
             WHERE status = 'online'
               AND (last_heartbeat_ms IS NULL OR last_heartbeat_ms < ?1)",
        )?;
        let agents = stmt
            .query_map(params![cutoff.timestamp_millis()], agent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    // -------------------------------------------------------------------------
    // TEMPLATES
    // -------------------------------------------------------------------------

    pub fn create_template(
        &self,
        name: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Template> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO templates (name, content, created_time_ms) VALUES (?1, ?2, ?3)",
            params![name, content, now.timestamp_millis()],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::DuplicateTemplate(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let id = conn.last_insert_rowid();
        self.get_template(id)?.ok_or(StoreError::TemplateNotFound(id))
    }

    pub fn get_template(&self, id: i64) -> StoreResult<Option<Template>> {
        let conn = self.conn()?;
        let template = conn
            .query_row(
                "SELECT id, name, content, created_time_ms FROM templates WHERE id = ?1",
                params![id],
                template_from_row,
            )
            .optional()?;
        Ok(template)
    }

    pub fn list_templates(&self) -> StoreResult<Vec<Template>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, content, created_time_ms FROM templates ORDER BY created_time_ms DESC",
        )?;
        let templates = stmt
            .query_map([], template_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    pub fn update_template(&self, id: i64, name: &str, content: &str) -> StoreResult<Template> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE templates SET name = ?1, content = ?2 WHERE id = ?3",
            params![name, content, id],
        )?;
        if changed == 0 {
            return Err(StoreError::TemplateNotFound(id));
        }
        self.get_template(id)?.ok_or(StoreError::TemplateNotFound(id))
    }

    pub fn delete_template(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM templates WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::TemplateNotFound(id));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Row hydration
// -----------------------------------------------------------------------------

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(4)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        template_type: row.get(2)?,
        priority: row.get(3)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Waiting),
        created_time: ms_to_datetime(row.get(5)?),
        script_content: row.get(6)?,
        cpu_cores: row.get(7)?,
        gpu_count: row.get(8)?,
        gpu_memory: row.get(9)?,
        start_time: row.get::<_, Option<i64>>(10)?.map(ms_to_datetime),
        end_time: row.get::<_, Option<i64>>(11)?.map(ms_to_datetime),
        execution_time: row.get(12)?,
        agent_id: row.get(13)?,
        log_file: row.get(14)?,
        depends_on: Vec::new(),
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    let kind_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let gpu_json: String = row.get(11)?;

    // Defensive: a schema-evolved blob degrades to "no GPUs", not a crash.
    let gpu_info: Vec<GpuInfo> = serde_json::from_str(&gpu_json).unwrap_or_default();

    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: AgentKind::parse(&kind_str).unwrap_or(AgentKind::Main),
        status: AgentStatus::parse(&status_str).unwrap_or(AgentStatus::Offline),
        created_time: ms_to_datetime(row.get(4)?),
        last_heartbeat_time: row.get::<_, Option<i64>>(5)?.map(ms_to_datetime),
        running_time: row.get(6)?,
        cpu_cores: row.get(7)?,
        cpu_usage: row.get(8)?,
        memory_used: row.get::<_, i64>(9)? as u64,
        memory_total: row.get::<_, i64>(10)? as u64,
        gpu_info,
        task_id: row.get(12)?,
        main_agent_id: row.get(13)?,
        available_cpu_cores: row.get(14)?,
        reject_new_task: row.get::<_, i64>(15)? != 0,
    })
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        name: row.get(1)?,
        content: row.get(2)?,
        created_time: ms_to_datetime(row.get(3)?),
    })
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fixture() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("test.db"), dir.path().join("logs")).unwrap();
        (dir, store)
    }

    fn simple_task(name: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            name: name.into(),
            template_type: "shell".into(),
            script_content: "echo hi".into(),
            priority: 3,
            cpu_cores: 1,
            gpu_count: 0,
            gpu_memory: 0,
            depends_on: vec![],
        }
    }

    #[test]
    fn create_and_get_roundtrip() {
        let (_dir, store) = fixture();
        let t = store.create_task(&simple_task("t1"), Utc::now()).unwrap();
        assert_eq!(t.status, TaskStatus::Waiting);
        assert!(t.log_file.as_deref().unwrap().ends_with("task_1.log"));

        let fetched = store.get_task(t.id).unwrap().unwrap();
        assert_eq!(fetched.name, "t1");
        assert_eq!(fetched.script_content, "echo hi");
    }

    #[test]
    fn priority_is_clamped_to_range() {
        let (_dir, store) = fixture();
        let mut req = simple_task("hot");
        req.priority = 0;
        assert_eq!(store.create_task(&req, Utc::now()).unwrap().priority, 1);
        req.priority = 99;
        assert_eq!(store.create_task(&req, Utc::now()).unwrap().priority, 5);
    }

    #[test]
    fn task_with_open_dependency_starts_blocked() {
        let (_dir, store) = fixture();
        let t1 = store.create_task(&simple_task("t1"), Utc::now()).unwrap();

        let mut req = simple_task("t2");
        req.depends_on = vec![t1.id];
        let t2 = store.create_task(&req, Utc::now()).unwrap();
        assert_eq!(t2.status, TaskStatus::Blocked);
        assert_eq!(t2.depends_on, vec![t1.id]);
        assert_eq!(store.count_unsatisfied_deps(t2.id).unwrap(), 1);
    }

    #[test]
    fn task_with_completed_dependency_starts_waiting() {
        let (_dir, store) = fixture();
        let t1 = store.create_task(&simple_task("t1"), Utc::now()).unwrap();
        store.atomic_claim(t1.id, "a", Utc::now()).unwrap();
        store.finish_task(t1.id, TaskStatus::Completed, Utc::now()).unwrap();

        let mut req = simple_task("t2");
        req.depends_on = vec![t1.id];
        let t2 = store.create_task(&req, Utc::now()).unwrap();
        assert_eq!(t2.status, TaskStatus::Waiting);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let (_dir, store) = fixture();
        let mut req = simple_task("t");
        req.depends_on = vec![999];
        assert!(matches!(
            store.create_task(&req, Utc::now()),
            Err(StoreError::UnknownDependency(999))
        ));
    }

    #[test]
    fn dependency_cycle_is_rejected_on_update() {
        let (_dir, store) = fixture();
        let t1 = store.create_task(&simple_task("t1"), Utc::now()).unwrap();
        let mut req = simple_task("t2");
        req.depends_on = vec![t1.id];
        let t2 = store.create_task(&req, Utc::now()).unwrap();

        // t1 -> t2 exists; making t1 depend on t2 closes the loop.
        let mut fields = serde_json::Map::new();
        fields.insert("depends_on".into(), serde_json::json!([t2.id]));
        assert!(matches!(
            store.update_task_fields(t1.id, &fields),
            Err(StoreError::DependencyCycle(_))
        ));
    }

    #[test]
    fn atomic_claim_is_exclusive() {
        let (_dir, store) = fixture();
        let t = store.create_task(&simple_task("t"), Utc::now()).unwrap();

        assert!(store.atomic_claim(t.id, "m1", Utc::now()).unwrap());
        assert!(!store.atomic_claim(t.id, "m2", Utc::now()).unwrap());

        let t = store.get_task(t.id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.agent_id.as_deref(), Some("m1"));
        assert!(t.start_time.is_some());
    }

    #[test]
    fn concurrent_claims_produce_one_winner() {
        let (_dir, store) = fixture();
        let t = store.create_task(&simple_task("contended"), Utc::now()).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = t.id;
            handles.push(std::thread::spawn(move || {
                store.atomic_claim(id, &format!("agent-{}", i), Utc::now()).unwrap()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn finish_task_is_terminal_monotonic() {
        let (_dir, store) = fixture();
        let t = store.create_task(&simple_task("t"), Utc::now()).unwrap();
        store.atomic_claim(t.id, "m1", Utc::now()).unwrap();

        let end = Utc::now() + Duration::seconds(5);
        assert!(store.finish_task(t.id, TaskStatus::Canceled, end).unwrap());
        // A late terminal report must not overwrite the canceled row.
        assert!(!store.finish_task(t.id, TaskStatus::Failed, end).unwrap());

        let t = store.get_task(t.id).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Canceled);
        assert!(t.end_time.is_some());
        assert!(t.execution_time.is_some());
    }

    #[test]
    fn unblock_flips_only_satisfied_tasks() {
        let (_dir, store) = fixture();
        let t1 = store.create_task(&simple_task("t1"), Utc::now()).unwrap();
        let t2 = store.create_task(&simple_task("t2"), Utc::now()).unwrap();

        let mut r3 = simple_task("t3");
        r3.depends_on = vec![t1.id];
        let t3 = store.create_task(&r3, Utc::now()).unwrap();

        let mut r4 = simple_task("t4");
        r4.depends_on = vec![t1.id, t2.id];
        let t4 = store.create_task(&r4, Utc::now()).unwrap();

        store.atomic_claim(t1.id, "m", Utc::now()).unwrap();
        store.finish_task(t1.id, TaskStatus::Completed, Utc::now()).unwrap();

        assert_eq!(store.unblock_ready_tasks().unwrap(), 1);
        assert_eq!(store.get_task(t3.id).unwrap().unwrap().status, TaskStatus::Waiting);
        assert_eq!(store.get_task(t4.id).unwrap().unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn waiting_order_is_priority_then_fifo() {
        let (_dir, store) = fixture();
        let now = Utc::now();

        let mut low = simple_task("low");
        low.priority = 5;
        let mut high = simple_task("high");
        high.priority = 1;
        let mut mid_a = simple_task("mid_a");
        mid_a.priority = 3;
        let mut mid_b = simple_task("mid_b");
        mid_b.priority = 3;

        store.create_task(&low, now).unwrap();
        store.create_task(&mid_a, now + Duration::milliseconds(1)).unwrap();
        store.create_task(&high, now + Duration::milliseconds(2)).unwrap();
        store.create_task(&mid_b, now + Duration::milliseconds(3)).unwrap();

        let names: Vec<String> = store
            .list_waiting_tasks_ordered()
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["high", "mid_a", "mid_b", "low"]);
    }

    #[test]
    fn pagination_and_filters() {
        let (_dir, store) = fixture();
        let now = Utc::now();
        for i in 0..5 {
            let mut req = simple_task(&format!("job_{}", i));
            if i == 4 {
                req.template_type = "pytorch".into();
            }
            store.create_task(&req, now + Duration::milliseconds(i)).unwrap();
        }

        let page = store.list_tasks(&TaskFilter::default(), 1, 2).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.pages, 3);
        // Newest first.
        assert_eq!(page.tasks[0].name, "job_4");

        let filter = TaskFilter {
            template_type: Some("pytorch".into()),
            ..Default::default()
        };
        assert_eq!(store.list_tasks(&filter, 1, 10).unwrap().total, 1);

        let filter = TaskFilter {
            status: vec![TaskStatus::Waiting],
            name: Some("job_1".into()),
            ..Default::default()
        };
        let page = store.list_tasks(&filter, 1, 10).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.tasks[0].name, "job_1");
    }

    #[test]
    fn log_append_guarantees_trailing_newline() {
        let (_dir, store) = fixture();
        let t = store.create_task(&simple_task("t"), Utc::now()).unwrap();

        store.append_log(t.id, "no newline").unwrap();
        store.append_log(t.id, "with newline\n").unwrap();

        let slice = store.read_log(t.id, 0, None).unwrap();
        assert_eq!(slice.total_lines, 2);
        assert_eq!(slice.content, "no newline\nwith newline\n");

        let slice = store.read_log(t.id, 1, Some(5)).unwrap();
        assert_eq!(slice.start_line, 1);
        assert_eq!(slice.end_line, 2);
        assert_eq!(slice.content, "with newline\n");
    }

    #[test]
    fn agent_lifecycle_and_lease_accounting() {
        let (_dir, store) = fixture();
        let now = Utc::now();
        let gpus = vec!["0".to_string(), "1".to_string()];
        let main = store.create_main_agent("worker-1", 8, &gpus, now).unwrap();
        assert_eq!(main.available_cpu_cores, 8);
        assert!(main.gpu_info.iter().all(|g| g.is_available));

        store.debit_lease(&main.id, 2, &["0".to_string()]).unwrap();
        let m = store.get_agent(&main.id).unwrap().unwrap();
        assert_eq!(m.available_cpu_cores, 6);
        assert_eq!(m.available_gpu_ids(), vec!["1".to_string()]);

        store.credit_lease(&main.id, 2, &["0".to_string()]).unwrap();
        let m = store.get_agent(&main.id).unwrap().unwrap();
        assert_eq!(m.available_cpu_cores, 8);
        assert_eq!(m.available_gpu_ids().len(), 2);

        // Credit never exceeds the physical total.
        store.credit_lease(&main.id, 99, &[]).unwrap();
        let m = store.get_agent(&main.id).unwrap().unwrap();
        assert_eq!(m.available_cpu_cores, 8);
    }

    #[test]
    fn sub_agent_defaults_lease_from_task_row() {
        let (_dir, store) = fixture();
        let now = Utc::now();
        let main = store.create_main_agent("w", 8, &[], now).unwrap();
        let mut req = simple_task("t");
        req.cpu_cores = 3;
        let task = store.create_task(&req, now).unwrap();

        let sub = store
            .create_sub_agent(
                &RegisterSubRequest {
                    name: "sub_w_1".into(),
                    main_agent_id: main.id.clone(),
                    task_id: task.id,
                    cpu_cores: None,
                    gpu_ids: vec![],
                },
                now,
            )
            .unwrap();
        assert_eq!(sub.kind, AgentKind::Sub);
        assert_eq!(sub.cpu_cores, 3);
        assert_eq!(sub.task_id, Some(task.id));
        assert_eq!(sub.main_agent_id.as_deref(), Some(main.id.as_str()));
    }

    #[test]
    fn sub_lease_release_is_idempotent() {
        let (_dir, store) = fixture();
        let now = Utc::now();
        let gpus = vec!["0".to_string()];
        let main = store.create_main_agent("w", 8, &gpus, now).unwrap();
        let task = store.create_task(&simple_task("t"), now).unwrap();

        let sub = store
            .create_sub_agent(
                &RegisterSubRequest {
                    name: "s".into(),
                    main_agent_id: main.id.clone(),
                    task_id: task.id,
                    cpu_cores: Some(2),
                    gpu_ids: vec!["0".to_string()],
                },
                now,
            )
            .unwrap();

        store.debit_lease(&main.id, 2, &["0".to_string()]).unwrap();
        assert_eq!(store.get_agent(&main.id).unwrap().unwrap().available_cpu_cores, 6);

        // First release credits; the racing second is a no-op.
        assert!(store.release_sub_lease(&sub.id).unwrap());
        assert!(!store.release_sub_lease(&sub.id).unwrap());

        let m = store.get_agent(&main.id).unwrap().unwrap();
        assert_eq!(m.available_cpu_cores, 8);
        assert_eq!(m.available_gpu_ids(), vec!["0".to_string()]);
    }

    #[test]
    fn pending_directive_is_one_shot() {
        let (_dir, store) = fixture();
        let main = store.create_main_agent("w", 4, &[], Utc::now()).unwrap();

        store.set_pending_directive(&main.id, "reject_new_task").unwrap();
        assert_eq!(
            store.take_pending_directive(&main.id).unwrap().as_deref(),
            Some("reject_new_task")
        );
        assert!(store.take_pending_directive(&main.id).unwrap().is_none());
    }

    #[test]
    fn stale_agents_query_uses_cutoff() {
        let (_dir, store) = fixture();
        let now = Utc::now();
        let a = store.create_main_agent("fresh", 4, &[], now).unwrap();
        let b = store.create_main_agent("stale", 4, &[], now - Duration::seconds(60)).unwrap();

        store
            .apply_heartbeat(&a.id, &ResourceInfo::default(), now)
            .unwrap();

        let stale = store.stale_online_agents(now - Duration::seconds(10)).unwrap();
        let ids: Vec<_> = stale.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&b.id.as_str()));
        assert!(!ids.contains(&a.id.as_str()));
    }

    #[test]
    fn template_names_are_unique() {
        let (_dir, store) = fixture();
        store.create_template("train", "python train.py", Utc::now()).unwrap();
        assert!(matches!(
            store.create_template("train", "other", Utc::now()),
            Err(StoreError::DuplicateTemplate(_))
        ));

        let listed = store.list_templates().unwrap();
        assert_eq!(listed.len(), 1);
        store.delete_template(listed[0].id).unwrap();
        assert!(store.list_templates().unwrap().is_empty());
    }
}
