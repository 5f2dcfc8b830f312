use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub slots: SlotsConfig,
    /// PostgreSQL connection URL. When absent the service runs on the
    /// in-memory store (tests, local development).
    #[serde(default)]
    pub postgres_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Transfer coordinator tuning.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoordinatorConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub delivery_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 1024,
            delivery_attempts: 5,
            retry_backoff_ms: 200,
        }
    }
}

/// Workflow control-plane endpoint used for access checks and aborts.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkflowConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8122".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

/// Slot endpoint client tuning (start_transfer instructions).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SlotsConfig {
    pub request_timeout_ms: u64,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}
