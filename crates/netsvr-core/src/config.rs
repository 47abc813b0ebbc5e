//! Configuration for the worker-side connection layer.
//!
//! Everything can be built programmatically; `from_file`/`from_yaml` are a
//! convenience for embedding processes that keep their settings in YAML.
//!
//! ```
//! use netsvr_core::config::NetsvrConfig;
//!
//! let config = NetsvrConfig::from_yaml(
//!     r#"
//! workers: ["127.0.0.1:6061"]
//! task_pool:
//!   size: 4
//! "#,
//! )
//! .unwrap();
//! config.validate().unwrap();
//! assert_eq!(config.task_pool.size, 4);
//! ```

use crate::addr::worker_addr_to_hex;
use crate::error::{ConfigError, Result};
use crate::protocol::Events;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetsvrConfig {
    /// Gateway worker addresses (host:port)
    #[serde(default)]
    pub workers: Vec<String>,

    /// Payload sent verbatim as heartbeat and echoed back by the gateway
    #[serde(default = "default_heartbeat_message")]
    pub heartbeat_message: String,

    /// Framed socket settings shared by event and pooled connections
    #[serde(default)]
    pub socket: SocketSettings,

    /// Event connection settings
    #[serde(default)]
    pub main_socket: MainSocketSettings,

    /// Pooled connection settings
    #[serde(default)]
    pub task_pool: TaskPoolSettings,

    /// Reconnect supervision of event connections
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_heartbeat_message() -> String {
    "~6YOt5rW35piO~".to_string()
}

impl Default for NetsvrConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            heartbeat_message: default_heartbeat_message(),
            socket: SocketSettings::default(),
            main_socket: MainSocketSettings::default(),
            task_pool: TaskPoolSettings::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl NetsvrConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(ConfigError::NoWorkers.into());
        }

        let mut keys = HashSet::new();
        for worker in &self.workers {
            let key = worker_addr_to_hex(worker)
                .map_err(|e| ConfigError::invalid_value("workers", e.to_string()))?;
            if !keys.insert(key) {
                return Err(ConfigError::invalid_value(
                    "workers",
                    format!("duplicate worker address {}", worker),
                )
                .into());
            }
        }

        if self.heartbeat_message.is_empty() {
            return Err(ConfigError::invalid_value("heartbeat_message", "cannot be empty").into());
        }

        self.socket.validate()?;
        self.main_socket.validate(&self.socket)?;
        self.task_pool.validate(&self.socket)?;
        self.reconnect.validate()?;
        Ok(())
    }
}

/// Framed socket timeouts and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_io_timeout")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_io_timeout")]
    pub receive_timeout_ms: u64,

    /// Largest frame payload accepted in either direction
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_io_timeout() -> u64 {
    25_000
}

fn default_max_frame_size() -> usize {
    2 * 1024 * 1024
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            send_timeout_ms: default_io_timeout(),
            receive_timeout_ms: default_io_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl SocketSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("socket.connect_timeout_ms", self.connect_timeout_ms),
            ("socket.send_timeout_ms", self.send_timeout_ms),
            ("socket.receive_timeout_ms", self.receive_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "must be greater than 0").into());
            }
        }
        if self.max_frame_size == 0 {
            return Err(
                ConfigError::invalid_value("socket.max_frame_size", "must be greater than 0")
                    .into(),
            );
        }
        Ok(())
    }
}

/// Event kinds as spelled in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OnOpen,
    OnClose,
    OnMessage,
}

impl From<EventKind> for Events {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::OnOpen => Events::ON_OPEN,
            EventKind::OnClose => Events::ON_CLOSE,
            EventKind::OnMessage => Events::ON_MESSAGE,
        }
    }
}

/// Event connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainSocketSettings {
    #[serde(default = "default_main_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Bound of the event dispatch worker pool
    #[serde(default = "default_process_cmd_worker_num")]
    pub process_cmd_worker_num: usize,

    /// Capacity of the outbound frame queue
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Events pushed by the gateway
    #[serde(default = "default_events")]
    pub events: Vec<EventKind>,
}

fn default_main_heartbeat_interval() -> u64 {
    10_000
}

fn default_process_cmd_worker_num() -> usize {
    10
}

fn default_send_queue_capacity() -> usize {
    1024
}

fn default_events() -> Vec<EventKind> {
    vec![EventKind::OnOpen, EventKind::OnClose, EventKind::OnMessage]
}

impl Default for MainSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_main_heartbeat_interval(),
            process_cmd_worker_num: default_process_cmd_worker_num(),
            send_queue_capacity: default_send_queue_capacity(),
            events: default_events(),
        }
    }
}

impl MainSocketSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Combined interest bitmask.
    pub fn events(&self) -> Events {
        self.events
            .iter()
            .fold(Events::NONE, |acc, kind| acc | Events::from(*kind))
    }

    fn validate(&self, socket: &SocketSettings) -> Result<()> {
        if self.process_cmd_worker_num == 0 {
            return Err(ConfigError::invalid_value(
                "main_socket.process_cmd_worker_num",
                "must be greater than 0",
            )
            .into());
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "main_socket.send_queue_capacity",
                "must be greater than 0",
            )
            .into());
        }
        // The gateway echoes heartbeats; they are what keeps the receive side alive.
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= socket.receive_timeout_ms
        {
            return Err(ConfigError::invalid_value(
                "main_socket.heartbeat_interval_ms",
                "must be greater than 0 and shorter than socket.receive_timeout_ms",
            )
            .into());
        }
        Ok(())
    }
}

/// Pooled connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPoolSettings {
    /// Maximum connections per worker address
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// How long `get` waits for a free connection
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,

    #[serde(default = "default_pool_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

fn default_pool_size() -> usize {
    10
}

fn default_wait_timeout() -> u64 {
    10_000
}

fn default_pool_heartbeat_interval() -> u64 {
    10_000
}

impl Default for TaskPoolSettings {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            wait_timeout_ms: default_wait_timeout(),
            heartbeat_interval_ms: default_pool_heartbeat_interval(),
        }
    }
}

impl TaskPoolSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    fn validate(&self, _socket: &SocketSettings) -> Result<()> {
        if self.size == 0 {
            return Err(ConfigError::invalid_value("task_pool.size", "must be greater than 0").into());
        }
        if self.wait_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "task_pool.wait_timeout_ms",
                "must be greater than 0",
            )
            .into());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid_value(
                "task_pool.heartbeat_interval_ms",
                "must be greater than 0",
            )
            .into());
        }
        Ok(())
    }
}

/// Reconnect supervision for event connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Disabled by default: a dead event connection stays dead
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum attempts per outage (None = unlimited)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_initial_backoff() -> u64 {
    1_000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt number `attempt` (zero-based), capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = backoff_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid_value(
                "reconnect.backoff_multiplier",
                "must be at least 1.0",
            )
            .into());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::invalid_value(
                "reconnect.initial_backoff_ms",
                "cannot exceed reconnect.max_backoff_ms",
            )
            .into());
        }
        Ok(())
    }
}
