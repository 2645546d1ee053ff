use serde::Deserialize;
use std::fmt;
use std::path::Path;

use crate::error::LimError;
use crate::mac::MacAddr;
use crate::session::{AuthType, SystemRole};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mlm: MlmConfig,
    #[serde(default)]
    pub cfg: CfgStore,
    pub simulation: Option<SimulationConfig>,
    pub logging: LoggingConfig,
}

/// Identity and policy of the local management entity
#[derive(Debug, Clone, Deserialize)]
pub struct MlmConfig {
    pub role: SystemRole,
    pub session_id: u8,
    pub bss_idx: u8,
    pub bssid: MacAddr,
    pub auth_type: AuthType,
    pub privacy: bool,
    /// Upper bound on key requests awaiting a control-plane reply
    pub max_pending_requests: usize,
    /// Auth frame 3 must arrive within this window after frame 2
    pub auth_rsp_timeout_ms: u64,
    /// STA side: give up on an authentication attempt after this long
    pub auth_failure_timeout_ms: u64,
}

/// Integer configuration items, looked up by symbolic name.
///
/// Every item is optional; a missing item is reported as
/// `LimError::ConfigurationUnavailable` by [`CfgSource::get_int`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CfgStore {
    pub preauth_cleanup_timeout_ms: Option<u32>,
    pub single_tid_rc: Option<u32>,
    pub open_system_auth_enable: Option<u32>,
    pub shared_key_auth_enable: Option<u32>,
    pub privacy_enabled: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    pub device_latency_ms: u64,
    pub device_queue_depth: usize,
    /// Peers that open an authentication exchange at startup
    pub peers: Vec<MacAddr>,
    /// Hex encoded WEP-40/WEP-104 key used as default key 0
    pub wep_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Symbolic keys of the integer configuration store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfgItem {
    PreAuthCleanupTimeout,
    SingleTidRc,
    OpenSystemAuthEnable,
    SharedKeyAuthEnable,
    PrivacyEnabled,
}

impl fmt::Display for CfgItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Read-only integer lookups against the configuration store
pub trait CfgSource {
    fn get_int(&self, item: CfgItem) -> Result<u32, LimError>;
}

impl CfgSource for CfgStore {
    fn get_int(&self, item: CfgItem) -> Result<u32, LimError> {
        let value = match item {
            CfgItem::PreAuthCleanupTimeout => self.preauth_cleanup_timeout_ms,
            CfgItem::SingleTidRc => self.single_tid_rc,
            CfgItem::OpenSystemAuthEnable => self.open_system_auth_enable,
            CfgItem::SharedKeyAuthEnable => self.shared_key_auth_enable,
            CfgItem::PrivacyEnabled => self.privacy_enabled,
        };
        value.ok_or(LimError::ConfigurationUnavailable(item))
    }
}

impl CfgSource for Config {
    fn get_int(&self, item: CfgItem) -> Result<u32, LimError> {
        self.cfg.get_int(item)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mlm: MlmConfig {
                role: SystemRole::Ap,
                session_id: 0,
                bss_idx: 0,
                bssid: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
                auth_type: AuthType::AutoSwitch,
                privacy: true,
                max_pending_requests: 4,
                auth_rsp_timeout_ms: 1000,
                auth_failure_timeout_ms: 2000,
            },
            cfg: CfgStore {
                preauth_cleanup_timeout_ms: Some(30_000),
                single_tid_rc: Some(1),
                open_system_auth_enable: Some(1),
                shared_key_auth_enable: Some(1),
                privacy_enabled: Some(1),
            },
            simulation: None,
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[mlm]
role = "ap"
session_id = 3
bss_idx = 1
bssid = "00:11:22:33:44:55"
auth_type = "shared"
privacy = true
max_pending_requests = 2
auth_rsp_timeout_ms = 500
auth_failure_timeout_ms = 1500

[cfg]
preauth_cleanup_timeout_ms = 10000
single_tid_rc = 1

[simulation]
device_latency_ms = 20
device_queue_depth = 4
peers = ["02:00:00:00:00:0a"]
wep_key = "0102030405"

[logging]
level = "debug"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.mlm.role, SystemRole::Ap);
        assert_eq!(config.mlm.auth_type, AuthType::Shared);
        assert_eq!(config.mlm.bssid.to_string(), "00:11:22:33:44:55");
        assert_eq!(config.simulation.as_ref().unwrap().peers.len(), 1);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_cfg_item_is_unavailable() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.get_int(CfgItem::PreAuthCleanupTimeout), Ok(10_000));
        assert_eq!(
            config.get_int(CfgItem::PrivacyEnabled),
            Err(LimError::ConfigurationUnavailable(CfgItem::PrivacyEnabled))
        );
    }

    #[test]
    fn test_default_config_has_all_items() {
        let config = Config::default();
        assert!(config.get_int(CfgItem::SingleTidRc).is_ok());
        assert!(config.get_int(CfgItem::SharedKeyAuthEnable).is_ok());
    }
}
