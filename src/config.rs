// src/config.rs
//
// =============================================================================
// TASKGRID: RUNTIME CONFIGURATION (v 0.3)
// =============================================================================
//
// The Knobs.
//
// One explicit value threaded into the server, the scheduler and the agents
// at construction. No global singleton: test fixtures build their own.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the controller binds to.
    pub port: u16,

    /// Base URL agents use to reach the controller.
    pub server_url: String,

    /// Root directory for the database and task logs.
    pub data_dir: PathBuf,

    /// An online agent whose last heartbeat is older than this is declared
    /// offline by the watchdog.
    pub heartbeat_timeout: Duration,

    /// Main-agent heartbeat period.
    pub main_agent_heartbeat_interval: Duration,

    /// Sub-agent heartbeat period.
    pub sub_agent_heartbeat_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            server_url: "http://localhost:5000".into(),
            data_dir: PathBuf::from("data"),
            heartbeat_timeout: Duration::from_secs(10),
            main_agent_heartbeat_interval: Duration::from_secs(2),
            sub_agent_heartbeat_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Defaults overridden by TASKGRID_* environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = read_env("TASKGRID_PORT") {
            cfg.port = port;
        }
        if let Ok(url) = env::var("TASKGRID_SERVER_URL") {
            if !url.is_empty() {
                cfg.server_url = url;
            }
        }
        if let Ok(dir) = env::var("TASKGRID_DATA_DIR") {
            if !dir.is_empty() {
                cfg.data_dir = PathBuf::from(dir);
            }
        }
        if let Some(secs) = read_env("TASKGRID_HEARTBEAT_TIMEOUT_SECS") {
            cfg.heartbeat_timeout = Duration::from_secs(secs);
        }

        cfg
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("database").join("taskgrid.db")
    }

    pub fn task_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs").join("tasks")
    }

    pub fn task_log_path(&self, task_id: i64) -> PathBuf {
        self.task_log_dir().join(format!("task_{}.log", task_id))
    }

    /// Convenience for tests and embedded servers.
    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_nest_under_data_dir() {
        let cfg = Config::default().with_data_dir("/tmp/tg");
        assert_eq!(
            cfg.database_path(),
            PathBuf::from("/tmp/tg/database/taskgrid.db")
        );
        assert_eq!(cfg.task_log_path(7), PathBuf::from("/tmp/tg/logs/tasks/task_7.log"));
    }

    #[test]
    fn default_intervals_match_protocol() {
        let cfg = Config::default();
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(cfg.main_agent_heartbeat_interval, Duration::from_secs(2));
        assert_eq!(cfg.sub_agent_heartbeat_interval, Duration::from_secs(1));
    }
}
