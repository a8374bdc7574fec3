//! Configuration of a harness run.

use crate::Error;
use sequencer_harness_client::{rollup, Participant};
use sequencer_harness_upgrade::{aspen, deploy::Image, lifecycle::PRE_CHECK_MARGIN};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    path::{Path, PathBuf},
};

/// Image tags run before a given upgrade is staged (matching what mainnet ran before it).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PreUpgradeImages {
    pub sequencer: String,
    pub sequencer_relayer: String,
}

/// A validator of the cohort under test.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Name of the validator (also its moniker).
    pub name: String,

    /// Bech32m address of the validator.
    pub address: String,

    /// Whether the validator runs the price feed.
    #[serde(default = "default_true")]
    pub price_feed: bool,

    /// Overrides the default JSON-RPC endpoint.
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Overrides the default gRPC endpoint.
    #[serde(default)]
    pub grpc_url: Option<String>,
}

impl ValidatorConfig {
    pub fn participant(&self) -> Participant {
        let mut participant = Participant::validator(&self.name);
        if let Some(rpc_url) = &self.rpc_url {
            participant.rpc_url = rpc_url.clone();
        }
        if let Some(grpc_url) = &self.grpc_url {
            participant.grpc_url = grpc_url.clone();
        }
        participant
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RollupConfig {
    #[serde(default = "default_rollup_url")]
    pub url: String,

    /// Image tags to override in the rollup chart.
    #[serde(default)]
    pub images: BTreeMap<Image, String>,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            url: default_rollup_url(),
            images: BTreeMap::new(),
        }
    }
}

/// Accounts and amounts moved across the bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Rollup account credited by the bridge lock.
    pub evm_destination: String,

    /// Sequencer account credited by the withdrawal.
    pub sequencer_account: String,

    /// Amount (in nria) locked on the sequencer.
    pub lock_amount: u64,

    /// Rollup balance (in wei) expected once the lock is bridged in.
    pub evm_balance_after_lock: u64,

    /// Signed, hex-encoded transaction calling the withdrawer contract.
    pub withdraw_transaction: String,

    /// Hash of `withdraw_transaction`.
    pub withdraw_transaction_hash: String,

    /// Rollup balance (in wei) expected once the withdrawal executes.
    pub evm_balance_after_withdraw: u64,

    /// Sequencer balance (in nria) expected once the withdrawal is bridged out.
    pub sequencer_balance_after_withdraw: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            evm_destination: "0xaC21B97d35Bf75A7dAb16f35b111a50e78A72F30".to_string(),
            sequencer_account: "astria17w0adeg64ky0daxwd2ugyuneellmjgnxl39504".to_string(),
            lock_amount: 10_000_000_000,
            evm_balance_after_lock: 10_000_000_000_000_000_000,
            withdraw_transaction: concat!(
                "0xf8f280843ba60f5782a35194a58639fb5458e65e4fa917ff951c390292c24a15880de0b6b3a7640000b884bab916",
                "d000000000000000000000000000000000000000000000000000000000000000200000000000000000000000000000",
                "00000000000000000000000000000000002d617374726961313777306164656736346b793064617877643275677975",
                "6e65656c6c6d6a676e786c333935303400000000000000000000000000000000000000820a95a034652da1bbcad94f",
                "6af3db785127dae70f9b4e7d4da3c3f4b36eafe7fce9bf58a0169ed71974bcd74f0cea148148b5f3f8da50cdd05505",
                "7dd18a599a2a3e14679f",
            )
            .to_string(),
            withdraw_transaction_hash:
                "0x326c3910da4c96c5a40ba1505fc338164b659729f2f975ccb07e8794c96b66f6".to_string(),
            evm_balance_after_withdraw: 9_000_000_000_000_000_000,
            sequencer_balance_after_withdraw: 1_000_000_000,
        }
    }
}

/// Configuration of a harness run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Name of the upgrade to apply.
    pub upgrade_name: String,

    /// Tag of the images that execute the upgrade.
    pub image_tag: String,

    /// Image tags run before each upgrade is staged.
    #[serde(default = "default_pre_upgrade_images")]
    pub pre_upgrade_images: BTreeMap<String, PreUpgradeImages>,

    /// Changes activated by each upgrade.
    #[serde(default = "default_upgrades")]
    pub upgrades: BTreeMap<String, Vec<String>>,

    /// Validators in deployment order. The last validator joins only after the upgrade has
    /// activated and the one before it is withheld from staging to exercise stall recovery.
    #[serde(default = "default_validators")]
    pub validators: Vec<ValidatorConfig>,

    /// Blocks between the latest height and the scheduled activation height.
    #[serde(default = "default_activation_offset")]
    pub activation_offset: u64,

    /// Maximum deployments run at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Directory containing `charts/` and `dev/values/`.
    #[serde(default = "default_chart_root")]
    pub chart_root: PathBuf,

    #[serde(default)]
    pub rollup: RollupConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.upgrades.contains_key(&self.upgrade_name) {
            return Err(Error::InvalidConfig(format!(
                "unknown upgrade `{}`",
                self.upgrade_name
            )));
        }
        if !self.pre_upgrade_images.contains_key(&self.upgrade_name) {
            return Err(Error::InvalidConfig(format!(
                "no pre-upgrade images for `{}`",
                self.upgrade_name
            )));
        }
        // Two validators are held back, and the bridge uses the second through fourth
        if self.validators.len() < 4 {
            return Err(Error::InvalidConfig(format!(
                "at least 4 validators required, found {}",
                self.validators.len()
            )));
        }
        let mut names = BTreeSet::new();
        for validator in &self.validators {
            if !names.insert(validator.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate validator `{}`",
                    validator.name
                )));
            }
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.activation_offset <= PRE_CHECK_MARGIN {
            return Err(Error::InvalidConfig(format!(
                "activation offset must exceed {PRE_CHECK_MARGIN}"
            )));
        }
        Ok(())
    }

    /// Returns the pre-upgrade images of the configured upgrade.
    pub fn pre_upgrade(&self) -> Result<&PreUpgradeImages, Error> {
        self.pre_upgrade_images.get(&self.upgrade_name).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "no pre-upgrade images for `{}`",
                self.upgrade_name
            ))
        })
    }

    /// Returns the changes of the configured upgrade.
    pub fn changes(&self) -> Result<&[String], Error> {
        self.upgrades
            .get(&self.upgrade_name)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                Error::InvalidConfig(format!("unknown upgrade `{}`", self.upgrade_name))
            })
    }
}

fn default_true() -> bool {
    true
}

fn default_rollup_url() -> String {
    rollup::DEFAULT_URL.to_string()
}

fn default_activation_offset() -> u64 {
    10
}

fn default_concurrency() -> usize {
    6
}

fn default_chart_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_pre_upgrade_images() -> BTreeMap<String, PreUpgradeImages> {
    BTreeMap::from([(
        aspen::NAME.to_string(),
        PreUpgradeImages {
            sequencer: "2.0.0".to_string(),
            sequencer_relayer: "1.0.1".to_string(),
        },
    )])
}

fn default_upgrades() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(
        aspen::NAME.to_string(),
        aspen::CHANGES.iter().map(|change| change.to_string()).collect(),
    )])
}

fn default_validators() -> Vec<ValidatorConfig> {
    [
        "astria1py0ywasutrz8g560f4q54ugy5m90jrpzdja7vs",
        "astria1aqkcy7psk93a29ujj8aj0w6cucza7taz48guf3",
        "astria13stmhhrux5xg832szc693lym0fd4ffjwkzyuth",
        "astria1jtsd309u6a78egrje6pnwsu006agztdaxzzter",
        "astria1h0wwsjmkhq8pk7z7wjcw34jqhakjh599yhlmxc",
    ]
    .iter()
    .enumerate()
    .map(|(i, address)| ValidatorConfig {
        name: format!("node{i}"),
        address: address.to_string(),
        // Oracle must keep working with only a supermajority running the price feed
        price_feed: i != 2,
        rpc_url: None,
        grpc_url: None,
    })
    .collect()
}
