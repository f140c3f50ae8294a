use anyhow::{anyhow, Result};
use std::collections::HashSet;
use tokio::sync::watch;
use tracing::info;

use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PotentialApplication {
    Allowed(Configuration),
    Rejected(String),
}

/// Decides whether a change can legally transform the committed configuration
/// and performs the side effect once the change is committed.
pub trait ChangeApplicator: Send {
    fn try_apply(&self, existing: Option<&Configuration>, change: &ConfigChange) -> PotentialApplication;

    fn apply(&mut self, change: &ConfigChange, new_config: &Configuration) -> Result<()>;

    /// Called once at startup with the configuration committed before the restart.
    fn restore(&mut self, _committed: Option<&Configuration>) {}
}

#[derive(Debug, Clone)]
pub struct ApplicatorPolicy {
    pub locked_settings: Vec<String>,
    pub max_settings: usize,
}

impl Default for ApplicatorPolicy {
    fn default() -> Self {
        Self {
            locked_settings: vec!["cluster-name".to_string()],
            max_settings: 256,
        }
    }
}

/// Manages a flat settings map and publishes every committed configuration on
/// a watch channel.
pub struct SettingsApplicator {
    locked: HashSet<String>,
    max_settings: usize,
    live: watch::Sender<Option<Configuration>>,
}

impl SettingsApplicator {
    pub fn new(policy: ApplicatorPolicy) -> Self {
        let (live, _) = watch::channel(None);
        Self {
            locked: policy.locked_settings.into_iter().collect(),
            max_settings: policy.max_settings,
            live,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Configuration>> {
        self.live.subscribe()
    }

    pub fn live_config(&self) -> Option<Configuration> {
        self.live.borrow().clone()
    }

    fn apply_one(&self, config: &mut Configuration, change: &ConfigChange) -> Result<()> {
        match change {
            ConfigChange::Set { setting, value } => {
                self.validate_setting_name(setting)?;
                self.validate_not_locked(setting, config)?;
                if value.trim().is_empty() {
                    return Err(anyhow!("Setting '{}' cannot be set to an empty value", setting));
                }
                config.settings.insert(setting.clone(), value.clone());
            }
            ConfigChange::Unset { setting } => {
                self.validate_not_locked(setting, config)?;
                if config.settings.remove(setting).is_none() {
                    return Err(anyhow!("Setting '{}' is not set", setting));
                }
            }
            ConfigChange::Batch { changes } => {
                if changes.is_empty() {
                    return Err(anyhow!("Empty batch change"));
                }
                for change in changes {
                    self.apply_one(config, change)?;
                }
            }
        }
        Ok(())
    }

    fn validate_setting_name(&self, setting: &str) -> Result<()> {
        if setting.is_empty() {
            return Err(anyhow!("Setting name cannot be empty"));
        }
        if setting.chars().any(|c| c.is_whitespace() || c == '=') {
            return Err(anyhow!("Invalid setting name '{}'", setting));
        }
        Ok(())
    }

    /// A locked setting may be written once, while it is still absent.
    fn validate_not_locked(&self, setting: &str, config: &Configuration) -> Result<()> {
        if self.locked.contains(setting) && config.settings.contains_key(setting) {
            return Err(anyhow!("Setting '{}' is locked and cannot be changed", setting));
        }
        Ok(())
    }
}

impl ChangeApplicator for SettingsApplicator {
    fn try_apply(&self, existing: Option<&Configuration>, change: &ConfigChange) -> PotentialApplication {
        let mut config = existing.cloned().unwrap_or_default();

        if let Err(e) = self.apply_one(&mut config, change) {
            return PotentialApplication::Rejected(e.to_string());
        }

        if config.len() > self.max_settings {
            return PotentialApplication::Rejected(format!(
                "Configuration would hold {} settings (max: {})",
                config.len(),
                self.max_settings
            ));
        }

        PotentialApplication::Allowed(config)
    }

    fn apply(&mut self, change: &ConfigChange, new_config: &Configuration) -> Result<()> {
        info!("Applying committed change: {}", change.summary());
        self.live.send_replace(Some(new_config.clone()));
        Ok(())
    }

    fn restore(&mut self, committed: Option<&Configuration>) {
        self.live.send_replace(committed.cloned());
    }
}
