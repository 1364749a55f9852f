//! Configuration loading and management

use std::path::PathBuf;

use anyhow::Result;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for the session gateway
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Shared secret required from CONTROLLER attaches; observers never
    /// need one
    pub controller_token: Option<String>,

    /// Starting compute mix weight, clamped to [0, 1]
    pub default_mix_weight: f64,

    /// Model label used when the mix weight favors local compute
    pub local_model: String,

    /// Model label used when the mix weight favors remote compute
    pub cloud_model: String,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("synapse");

        let socket_path = std::env::var("SYNAPSE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("daemon.sock"));

        let controller_token = std::env::var("SYNAPSE_CONTROLLER_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let default_mix_weight = std::env::var("SYNAPSE_DEFAULT_MIX")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        let local_model =
            std::env::var("SYNAPSE_LOCAL_MODEL").unwrap_or_else(|_| "local-slm".to_string());
        let cloud_model =
            std::env::var("SYNAPSE_CLOUD_MODEL").unwrap_or_else(|_| "cloud-llm".to_string());

        Ok(Self {
            socket_path,
            data_dir,
            controller_token,
            default_mix_weight,
            local_model,
            cloud_model,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}
