use crate::client::CoordinatorOptions;
use crate::server::ApplicatorPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_name: Option<String>,
    pub hostname: Option<String>,

    pub bind_addr: String,
    pub bind_port: u16,

    pub data_dir: PathBuf,

    pub applicator: ApplicatorSettings,

    pub coordinator: CoordinatorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicatorSettings {
    pub locked_settings: Vec<String>,
    pub max_settings: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    pub user: Option<String>,
    pub request_timeout_ms: u64,
    pub max_concurrency: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            hostname: None,
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 9410,
            data_dir: PathBuf::from("/var/lib/flockconf"),
            applicator: ApplicatorSettings::default(),
            coordinator: CoordinatorSettings::default(),
        }
    }
}

impl Default for ApplicatorSettings {
    fn default() -> Self {
        let policy = ApplicatorPolicy::default();
        Self {
            locked_settings: policy.locked_settings,
            max_settings: policy.max_settings,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            user: None,
            request_timeout_ms: 10_000,
            max_concurrency: 16,
        }
    }
}

impl ApplicatorSettings {
    pub fn to_policy(&self) -> ApplicatorPolicy {
        ApplicatorPolicy {
            locked_settings: self.locked_settings.clone(),
            max_settings: self.max_settings,
        }
    }
}

impl CoordinatorSettings {
    pub fn effective_user(&self) -> String {
        self.user.clone().unwrap_or_else(|| {
            std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
        })
    }

    pub fn to_coordinator_options(&self, host: String) -> CoordinatorOptions {
        CoordinatorOptions {
            host,
            user: self.effective_user(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_concurrency: self.max_concurrency.max(1),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Writes the default config to `path`, refusing to overwrite an existing file.
    pub fn init(path: &PathBuf) -> anyhow::Result<Self> {
        if path.exists() {
            anyhow::bail!("Config file already exists: {:?}", path);
        }
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    pub fn effective_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    pub fn effective_node_name(&self) -> String {
        self.node_name
            .clone()
            .unwrap_or_else(|| self.effective_hostname())
    }

    pub fn effective_user(&self) -> String {
        self.coordinator.effective_user()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn to_coordinator_options(&self) -> CoordinatorOptions {
        self.coordinator
            .to_coordinator_options(self.effective_hostname())
    }
}
