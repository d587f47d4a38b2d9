//! Persisted cluster state in the node data directory:
//!
//! ```text
//! <data_dir>/
//!   manifest.json        cluster definition (operators, validators, fork)
//!   enr_private_key      this node's network identity key (hex)
//!   key-shares/
//!     share-<n>.json     BLS key share of the n-th validator
//!   deposit-data/        deposit-data[-<amount>eth].json output
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use dv_types::signing::{Fork, ForkInfo, Version};
use dv_types::{PubKey, Root};
use validator_api::ClusterValidator;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    /// Minimum number of shares needed to reconstruct a group signature.
    pub threshold: usize,
    /// 0x-hex 4-byte genesis fork version.
    pub fork_version: String,
    pub operators: Vec<OperatorRecord>,
    pub validators: Vec<ManifestValidator>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorRecord {
    /// The operator's ENR, from which its network identity derives.
    pub enr: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestValidator {
    pub group_pubkey: PubKey,
    /// Public shares ordered by share index.
    pub pubshares: Vec<PubKey>,
}

#[derive(Deserialize)]
struct KeyShareFile {
    secret: String,
}

impl Manifest {
    pub fn load(data_dir: &Path) -> Result<Self, String> {
        let path = data_dir.join("manifest.json");
        let raw = fs::read_to_string(&path)
            .map_err(|e| format!("failed reading manifest {}: {e}", path.display()))?;
        let manifest: Manifest =
            serde_json::from_str(&raw).map_err(|e| format!("failed parsing manifest: {e}"))?;

        let cluster_size = manifest.operators.len();
        if manifest.threshold == 0 || manifest.threshold > cluster_size {
            return Err(format!(
                "invalid threshold {} for cluster of {cluster_size}",
                manifest.threshold
            ));
        }
        for validator in &manifest.validators {
            if validator.pubshares.len() != cluster_size {
                return Err(format!(
                    "validator {} has {} pubshares, expected {cluster_size}",
                    validator.group_pubkey,
                    validator.pubshares.len()
                ));
            }
        }
        Ok(manifest)
    }

    pub fn fork_info(&self, genesis_validators_root: Root) -> Result<ForkInfo, String> {
        let stripped = self
            .fork_version
            .strip_prefix("0x")
            .ok_or("fork version must be 0x-prefixed")?;
        let bytes = hex::decode(stripped).map_err(|e| format!("invalid fork version: {e}"))?;
        let version: [u8; 4] = bytes
            .try_into()
            .map_err(|_| "fork version must be 4 bytes".to_string())?;
        Ok(ForkInfo {
            genesis_validators_root,
            forks: vec![Fork {
                version: Version(version),
                epoch: 0,
            }],
        })
    }

    pub fn cluster_validators(&self) -> Vec<ClusterValidator> {
        self.validators
            .iter()
            .map(|validator| ClusterValidator {
                group_pubkey: validator.group_pubkey,
                pubshares: validator.pubshares.clone(),
            })
            .collect()
    }

    pub fn group_pubkeys(&self) -> Vec<PubKey> {
        self.validators.iter().map(|v| v.group_pubkey).collect()
    }
}

/// Loads this operator's BLS key share for every cluster validator, in
/// manifest order.
pub fn load_key_shares(data_dir: &Path, count: usize) -> Result<Vec<tbls::SecretKey>, String> {
    let dir = data_dir.join("key-shares");
    let mut shares = Vec::with_capacity(count);
    for index in 0..count {
        let path = dir.join(format!("share-{index}.json"));
        let raw = fs::read_to_string(&path)
            .map_err(|e| format!("failed reading key share {}: {e}", path.display()))?;
        let file: KeyShareFile =
            serde_json::from_str(&raw).map_err(|e| format!("failed parsing key share: {e}"))?;
        let stripped = file
            .secret
            .strip_prefix("0x")
            .ok_or("key share secret must be 0x-prefixed")?;
        let bytes = hex::decode(stripped).map_err(|e| format!("invalid key share hex: {e}"))?;
        let secret = tbls::SecretKey::from_bytes(&bytes)
            .map_err(|e| format!("invalid key share: {e}"))?;
        shares.push(secret);
    }
    Ok(shares)
}

/// Loads the node's network identity key.
pub fn load_identity_key(data_dir: &Path) -> Result<Vec<u8>, String> {
    let path = data_dir.join("enr_private_key");
    let raw = fs::read_to_string(&path)
        .map_err(|e| format!("failed reading identity key {}: {e}", path.display()))?;
    let stripped = raw.trim().strip_prefix("0x").unwrap_or(raw.trim());
    hex::decode(stripped).map_err(|e| format!("invalid identity key hex: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn write_manifest(dir: &Path, pubshares: usize) {
        let manifest = serde_json::json!({
            "name": "test cluster",
            "threshold": 3,
            "fork_version": "0x00000000",
            "operators": [
                {"enr": "enr:-one"}, {"enr": "enr:-two"},
                {"enr": "enr:-three"}, {"enr": "enr:-four"}
            ],
            "validators": [{
                "group_pubkey": PubKey([0xaa; 48]),
                "pubshares": (0..pubshares).map(|i| PubKey([i as u8 + 1; 48])).collect::<Vec<_>>(),
            }],
        });
        fs::write(
            dir.join("manifest.json"),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn loads_valid_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 4);
        let manifest = Manifest::load(dir.path()).unwrap();
        assert_eq!(manifest.threshold, 3);
        assert_eq!(manifest.group_pubkeys(), vec![PubKey([0xaa; 48])]);
        assert_eq!(manifest.cluster_validators()[0].pubshares.len(), 4);
    }

    #[test]
    fn rejects_pubshare_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 3);
        assert!(Manifest::load(dir.path()).is_err());
    }

    #[test]
    fn key_shares_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("key-shares")).unwrap();
        let secret = tbls::SecretKey::generate(&mut StdRng::seed_from_u64(1));
        fs::write(
            dir.path().join("key-shares/share-0.json"),
            serde_json::to_vec(&serde_json::json!({
                "secret": format!("0x{}", hex::encode(secret.to_bytes())),
            }))
            .unwrap(),
        )
        .unwrap();

        let shares = load_key_shares(dir.path(), 1).unwrap();
        assert_eq!(shares[0].to_bytes(), secret.to_bytes());
    }

    #[test]
    fn fork_info_parses_version() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), 4);
        let manifest = Manifest::load(dir.path()).unwrap();
        let fork_info = manifest.fork_info(Root::repeat_byte(1)).unwrap();
        assert_eq!(fork_info.forks.len(), 1);
    }
}
