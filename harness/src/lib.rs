//! Run end-to-end upgrade tests against a sequencer network deployed to a local Kubernetes cluster.
//!
//! The [driver] deploys a validator cohort and an EVM rollup, stages a network upgrade on all but
//! one validator, confirms the remaining validator stalls and recovers once upgraded, and finally
//! verifies that every node agrees on the post-upgrade state. The run is described by a YAML
//! [config::Config] and bridges funds through the external astria CLI ([cli::Cli]).

use std::process::ExitStatus;
use thiserror::Error;

pub mod cli;
pub mod config;
pub mod driver;

/// Errors that can occur when running the harness.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Backoff(#[from] sequencer_harness_backoff::Error),
    #[error(transparent)]
    Client(#[from] sequencer_harness_client::Error),
    #[error(transparent)]
    Upgrade(#[from] sequencer_harness_upgrade::Error),
    #[error("`{command}` failed ({status}): {stderr}")]
    CliFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("`{command}` failed {attempts} times, giving up: {last}")]
    CliRetriesExhausted {
        command: String,
        attempts: usize,
        last: Box<Error>,
    },
    #[error("unexpected output from `{command}`: {stdout}")]
    UnexpectedOutput { command: String, stdout: String },
    #[error("`{command}` succeeded but should have been rejected")]
    NotRejected { command: String },
    #[error("balance of {account} did not reach {expected} within {timeout:?} (last observed: {last:?})")]
    BalanceUnsatisfied {
        account: String,
        expected: u128,
        timeout: std::time::Duration,
        last: Option<u128>,
    },
    #[error("balance of {address} is {balance}, expected {expected}")]
    UnexpectedBalance {
        address: String,
        balance: u128,
        expected: u128,
    },
    #[error("genesis app version {genesis} differs from current app version {current} (has the network been reset since the last run?)")]
    StaleNetwork { genesis: u64, current: u64 },
}
