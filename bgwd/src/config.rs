use bgw_broker::GatewayOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::{GatewayDaemonError, GatewayDaemonResult};

/// On-disk daemon configuration. Every field is optional in the file;
/// missing ones take the gateway defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: String,
    pub node_idle_timeout_secs: u64,
    pub pending_connect_timeout_secs: u64,
    pub presence_interval_secs: u64,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let options = GatewayOptions::default();
        Self {
            listen: GatewayOptions::default_listen().to_string(),
            node_idle_timeout_secs: options.node_idle_timeout.as_secs(),
            pending_connect_timeout_secs: options.pending_connect_timeout.as_secs(),
            presence_interval_secs: options.presence_interval.as_secs(),
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> GatewayDaemonResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            log::error!("Unable to read config {}: {e:}", path.display());
            e
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> GatewayDaemonResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> GatewayDaemonResult<()> {
        for (name, secs) in [
            ("nodeIdleTimeoutSecs", self.node_idle_timeout_secs),
            ("pendingConnectTimeoutSecs", self.pending_connect_timeout_secs),
            ("presenceIntervalSecs", self.presence_interval_secs),
        ] {
            if secs == 0 {
                return Err(GatewayDaemonError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        self.max_level()?;
        Ok(())
    }

    pub fn max_level(&self) -> GatewayDaemonResult<tracing::Level> {
        self.log_level
            .parse()
            .map_err(|_| GatewayDaemonError::InvalidConfig(format!("logLevel {}", self.log_level)))
    }

    pub fn gateway_options(&self) -> GatewayDaemonResult<GatewayOptions> {
        let options = GatewayOptions {
            node_idle_timeout: Duration::from_secs(self.node_idle_timeout_secs),
            pending_connect_timeout: Duration::from_secs(self.pending_connect_timeout_secs),
            presence_interval: Duration::from_secs(self.presence_interval_secs),
            ..Default::default()
        };
        Ok(options.with_listen(&self.listen)?)
    }
}
