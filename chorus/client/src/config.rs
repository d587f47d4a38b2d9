use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_duty_expiry_slots() -> u64 {
    2
}

fn default_gas_limit() -> u64 {
    30_000_000
}

fn default_slot_seconds() -> u64 {
    12
}

/// Node configuration, loaded from a TOML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Upstream beacon node base URL.
    pub beacon_url: String,
    /// Address the validator-API listens on for validator clients.
    pub listen_addr: SocketAddr,
    /// Per-node data directory: manifest, identity key, key shares.
    pub data_dir: PathBuf,
    /// This operator's 1-indexed position in the cluster.
    pub operator_index: u64,
    /// Slots a duty stays alive past its slot before garbage collection.
    #[serde(default = "default_duty_expiry_slots")]
    pub duty_expiry_slots: u64,
    #[serde(default)]
    pub builder_enabled: bool,
    #[serde(default = "default_gas_limit")]
    pub target_gas_limit: u64,
    /// Default fee recipient, 0x-hex execution address.
    pub fee_recipient: String,
    #[serde(default)]
    pub graffiti: Option<String>,
    #[serde(default = "default_slot_seconds")]
    pub slot_seconds: u64,
    /// Documented test mode that skips partial-signature verification.
    #[serde(default)]
    pub insecure_test_mode: bool,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed reading config {}: {e}", path.display()))?;
        toml::from_str(&raw).map_err(|e| format!("failed parsing config: {e}"))
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::from_secs(self.slot_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            beacon_url = "http://localhost:5052"
            listen_addr = "127.0.0.1:3600"
            data_dir = "/var/lib/chorus"
            operator_index = 1
            fee_recipient = "0x000000000000000000000000000000000000dead"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.duty_expiry_slots, 2);
        assert_eq!(config.target_gas_limit, 30_000_000);
        assert_eq!(config.slot_seconds, 12);
        assert!(!config.builder_enabled);
        assert!(!config.insecure_test_mode);
    }
}
