use serde::Deserialize;
use crate::config::ConfigError;

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "pacsnode".to_string(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidNodeId);
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
