//! Deposit messages and deposit-data file output.
//!
//! Amounts are in gwei throughout. Standard (`0x01`) withdrawal credentials
//! cap a validator at 32 ETH; compounding (`0x02`) credentials cap it at
//! 2048 ETH.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tree_hash::{Hash256, TreeHash};
use tree_hash_derive::TreeHash;

use dv_types::eth::ExecutionAddress;
use dv_types::signing::{self, Version, DOMAIN_DEPOSIT};
use dv_types::{PubKey, Signature};

pub const GWEI_PER_ETH: u64 = 1_000_000_000;

/// 1 ETH, the minimum deposit.
pub const MIN_DEPOSIT_AMOUNT: u64 = GWEI_PER_ETH;

/// 32 ETH, the activation amount and the standard-credential maximum.
pub const DEFAULT_DEPOSIT_AMOUNT: u64 = 32 * GWEI_PER_ETH;

/// 2048 ETH, the compounding-credential maximum.
pub const MAX_COMPOUNDING_DEPOSIT_AMOUNT: u64 = 2048 * GWEI_PER_ETH;

const STANDARD_CREDENTIAL_PREFIX: u8 = 0x01;
const COMPOUNDING_CREDENTIAL_PREFIX: u8 = 0x02;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DepositError {
    AmountTooLow { amount: u64 },
    AmountTooHigh { amount: u64, max: u64 },
    SumTooLow { sum: u64 },
    Io(String),
}

impl fmt::Display for DepositError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepositError::AmountTooLow { amount } => {
                write!(f, "deposit amount {amount} gwei below 1 ETH minimum")
            }
            DepositError::AmountTooHigh { amount, max } => {
                write!(f, "deposit amount {amount} gwei above {max} gwei maximum")
            }
            DepositError::SumTooLow { sum } => {
                write!(f, "deposit amounts sum {sum} gwei below 32 ETH activation")
            }
            DepositError::Io(err) => write!(f, "deposit file error: {err}"),
        }
    }
}

impl std::error::Error for DepositError {}

impl From<std::io::Error> for DepositError {
    fn from(err: std::io::Error) -> Self {
        DepositError::Io(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct DepositMessage {
    pub pubkey: PubKey,
    #[serde(with = "dv_types::eth::serde_helpers::root_hex")]
    pub withdrawal_credentials: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: u64,
}

impl DepositMessage {
    /// Builds a deposit message, validating the amount against the credential
    /// type's bounds and deriving the withdrawal credentials from the
    /// execution address.
    pub fn new(
        pubkey: PubKey,
        withdrawal_address: ExecutionAddress,
        amount: u64,
        compounding: bool,
    ) -> Result<Self, DepositError> {
        if amount < MIN_DEPOSIT_AMOUNT {
            return Err(DepositError::AmountTooLow { amount });
        }
        let max = if compounding {
            MAX_COMPOUNDING_DEPOSIT_AMOUNT
        } else {
            DEFAULT_DEPOSIT_AMOUNT
        };
        if amount > max {
            return Err(DepositError::AmountTooHigh { amount, max });
        }

        let mut credentials = [0u8; 32];
        credentials[0] = if compounding {
            COMPOUNDING_CREDENTIAL_PREFIX
        } else {
            STANDARD_CREDENTIAL_PREFIX
        };
        credentials[12..].copy_from_slice(&withdrawal_address.0);

        Ok(DepositMessage {
            pubkey,
            withdrawal_credentials: Hash256::from_slice(&credentials),
            amount,
        })
    }

    /// The root signed for the deposit. Deposits use the genesis fork version
    /// and a zero genesis-validators root.
    pub fn signing_root(&self, genesis_fork_version: [u8; 4]) -> Hash256 {
        let fork_info = signing::ForkInfo {
            genesis_validators_root: Hash256::ZERO,
            forks: vec![signing::Fork {
                version: Version(genesis_fork_version),
                epoch: 0,
            }],
        };
        signing::signing_root(self.tree_hash_root(), fork_info.domain(DOMAIN_DEPOSIT, 0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositData {
    pub pubkey: PubKey,
    #[serde(with = "dv_types::eth::serde_helpers::root_hex")]
    pub withdrawal_credentials: Hash256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: u64,
    pub signature: Signature,
}

/// Validates a set of partial deposit amounts: each at least 1 ETH, each
/// within the credential maximum, and summing to at least the 32 ETH
/// activation amount. An empty list means the default single deposit.
pub fn verify_deposit_amounts(amounts: &[u64], compounding: bool) -> Result<(), DepositError> {
    if amounts.is_empty() {
        return Ok(());
    }

    let max = if compounding {
        MAX_COMPOUNDING_DEPOSIT_AMOUNT
    } else {
        DEFAULT_DEPOSIT_AMOUNT
    };

    let mut sum: u64 = 0;
    for &amount in amounts {
        if amount < MIN_DEPOSIT_AMOUNT {
            return Err(DepositError::AmountTooLow { amount });
        }
        if amount > max {
            return Err(DepositError::AmountTooHigh { amount, max });
        }
        sum = sum.saturating_add(amount);
    }

    if sum < DEFAULT_DEPOSIT_AMOUNT {
        return Err(DepositError::SumTooLow { sum });
    }

    Ok(())
}

/// Converts whole-ETH values to gwei.
pub fn eths_to_gweis(eths: &[u64]) -> Vec<u64> {
    eths.iter().map(|eth| eth * GWEI_PER_ETH).collect()
}

/// Sorts and deduplicates deposit amounts.
pub fn dedup_amounts(mut amounts: Vec<u64>) -> Vec<u64> {
    amounts.sort_unstable();
    amounts.dedup();
    amounts
}

/// Returns the deposit-data file path for the given amount:
/// `deposit-data.json` for the default 32 ETH, otherwise
/// `deposit-data-<amount>eth.json`.
pub fn deposit_file_path(dir: &Path, amount: u64) -> PathBuf {
    if amount == DEFAULT_DEPOSIT_AMOUNT {
        dir.join("deposit-data.json")
    } else {
        dir.join(format!("deposit-data-{}eth.json", amount / GWEI_PER_ETH))
    }
}

/// Writes one deposit-data JSON file containing the given deposits.
pub fn write_deposit_data_file(
    dir: &Path,
    amount: u64,
    deposit_datas: &[DepositData],
) -> Result<PathBuf, DepositError> {
    let path = deposit_file_path(dir, amount);
    let json = serde_json::to_vec_pretty(deposit_datas)
        .map_err(|e| DepositError::Io(e.to_string()))?;
    fs::write(&path, json)?;
    Ok(path)
}

/// Writes one deposit-data file per distinct amount present in the set.
pub fn write_cluster_deposit_data_files(
    dir: &Path,
    deposit_datas: &[DepositData],
) -> Result<Vec<PathBuf>, DepositError> {
    let amounts = dedup_amounts(deposit_datas.iter().map(|d| d.amount).collect());

    let mut paths = Vec::with_capacity(amounts.len());
    for amount in amounts {
        let batch: Vec<DepositData> = deposit_datas
            .iter()
            .filter(|d| d.amount == amount)
            .copied()
            .collect();
        paths.push(write_deposit_data_file(dir, amount, &batch)?);
    }
    Ok(paths)
}
