//! Wrapper around the astria CLI's `sequencer` subcommand.

use crate::Error;
use sequencer_harness_backoff::{Backoff, Config};
use sequencer_harness_client::{query::POLL_INTERVAL, Participant};
use std::{iter, time::Duration};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default time allowed for retrying a command.
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(10);

const IMAGE: &str = "ghcr.io/astriaorg/astria-cli";
const CHAIN_ID: &str = "--sequencer.chain-id=sequencer-test-chain-0";
const ASSET: &str = "nria";

const BRIDGE_ACCOUNT: &str = "astria13ahqz4pjqfmynk9ylrqv4fwe4957x2p0h5782u";
const BRIDGE_ACCOUNT_KEY: &str = "dfa7108e38ab71f89f356c72afc38600d5758f11a8c337164713e4471411d2e0";
const FUNDED_ACCOUNT_KEY: &str = "934ab488f9e1900f6a08f50605ce1409ca9d95ebdc400dafc2e8a4306419fd52";
const SUDO_KEY: &str = "2bd806c97f0e00af1a1fc3328fa763a9269723c8db8fac4f93af71db186d6e90";

/// Runs `sequencer` subcommands of the astria CLI.
#[derive(Clone, Debug)]
pub struct Cli {
    program: String,
    base: Vec<String>,
    retry_timeout: Duration,
}

impl Cli {
    /// Runs the CLI from `program` invoked with `base` arguments.
    pub fn new(program: &str, base: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            base: base.iter().map(|arg| arg.to_string()).collect(),
            retry_timeout: RETRY_TIMEOUT,
        }
    }

    /// Runs the CLI image tagged `tag` with docker.
    pub fn docker(tag: &str) -> Self {
        let image = format!("{IMAGE}:{tag}");
        Self::new(
            "docker",
            &["run", "--rm", "--network", "host", image.as_str()],
        )
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    fn args(&self, participant: &Participant, args: &[&str]) -> Vec<String> {
        let mut all = self.base.clone();
        all.push("sequencer".to_string());
        all.extend(args.iter().map(|arg| arg.to_string()));
        all.push(format!("--sequencer-url={}", participant.rpc_url));
        all
    }

    fn command_line(&self, args: &[String]) -> String {
        iter::once(self.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs `sequencer <args> --sequencer-url=<participant rpc>` once, returning its stdout.
    pub async fn try_exec(
        &self,
        participant: &Participant,
        args: &[&str],
    ) -> Result<String, Error> {
        let args = self.args(participant, args);
        let command = self.command_line(&args);
        debug!(%command, "running cli");
        let output = Command::new(&self.program).args(&args).output().await?;
        if !output.status.success() {
            return Err(Error::CliFailed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Runs the command until it succeeds, waiting with exponential backoff between attempts.
    pub async fn exec_with_retry(
        &self,
        participant: &Participant,
        args: &[&str],
    ) -> Result<String, Error> {
        let mut backoff = Backoff::new(Config::exponential(self.retry_timeout))?;
        loop {
            let err = match self.try_exec(participant, args).await {
                Ok(stdout) => return Ok(stdout),
                Err(err) => err,
            };
            warn!(
                participant = %participant.name,
                %err,
                retry_in = ?backoff.delay(),
                "cli failed"
            );
            if backoff.wait().await.is_err() {
                return Err(Error::CliRetriesExhausted {
                    command: self.command_line(&self.args(participant, args)),
                    attempts: backoff.waits() + 1,
                    last: Box::new(err),
                });
            }
        }
    }

    /// Ensures the command fails. Only the exit status is inspected.
    ///
    /// Used to confirm an action has been disabled (e.g. a bridge lock after the bridge is
    /// disabled). The aspen scenario does not disable anything, so [crate::driver::run] never
    /// calls it.
    pub async fn ensure_rejected(
        &self,
        participant: &Participant,
        args: &[&str],
    ) -> Result<(), Error> {
        match self.try_exec(participant, args).await {
            Ok(_) => Err(Error::NotRejected {
                command: self.command_line(&self.args(participant, args)),
            }),
            Err(Error::CliFailed { command, status, .. }) => {
                info!(%command, %status, "command rejected");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn init_bridge_account(&self, participant: &Participant) -> Result<(), Error> {
        let key = format!("--private-key={BRIDGE_ACCOUNT_KEY}");
        let fee_asset = format!("--fee-asset={ASSET}");
        let asset = format!("--asset={ASSET}");
        self.exec_with_retry(
            participant,
            &[
                "init-bridge-account",
                "--rollup-name=astria",
                &key,
                CHAIN_ID,
                &fee_asset,
                &asset,
            ],
        )
        .await?;
        info!(participant = %participant.name, "initialized bridge account");
        Ok(())
    }

    /// Locks `amount` on the bridge account, to be credited to `destination` on the rollup.
    pub async fn bridge_lock(
        &self,
        participant: &Participant,
        amount: u64,
        destination: &str,
    ) -> Result<(), Error> {
        let amount = format!("--amount={amount}");
        let destination = format!("--destination-chain-address={destination}");
        let key = format!("--private-key={FUNDED_ACCOUNT_KEY}");
        let fee_asset = format!("--fee-asset={ASSET}");
        let asset = format!("--asset={ASSET}");
        self.exec_with_retry(
            participant,
            &[
                "bridge-lock",
                BRIDGE_ACCOUNT,
                &amount,
                &destination,
                &key,
                CHAIN_ID,
                &fee_asset,
                &asset,
            ],
        )
        .await?;
        info!(participant = %participant.name, "locked funds on bridge");
        Ok(())
    }

    /// Submits a sudo validator update naming the validator with `pub_key` (hex).
    pub async fn validator_update(
        &self,
        participant: &Participant,
        pub_key: &str,
        power: u64,
    ) -> Result<(), Error> {
        let pub_key = format!("--validator-public-key={pub_key}");
        let key = format!("--private-key={SUDO_KEY}");
        let power = format!("--power={power}");
        let name = format!("--name={}", participant.name);
        self.try_exec(
            participant,
            &["sudo", "validator-update", CHAIN_ID, &pub_key, &key, &power, &name],
        )
        .await?;
        info!(participant = %participant.name, "submitted validator update");
        Ok(())
    }

    /// Returns the balance (in nria) of `account`.
    pub async fn balance(&self, participant: &Participant, account: &str) -> Result<u128, Error> {
        let stdout = self
            .exec_with_retry(participant, &["account", "balance", account])
            .await?;
        parse_balance(&stdout).ok_or_else(|| Error::UnexpectedOutput {
            command: self.command_line(&self.args(participant, &["account", "balance", account])),
            stdout,
        })
    }

    /// Polls the balance of `account` until it equals `expected`. Failed queries are logged and
    /// retried until `timeout` elapses.
    pub async fn wait_until_balance(
        &self,
        participant: &Participant,
        account: &str,
        expected: u128,
        timeout: Duration,
    ) -> Result<u128, Error> {
        let mut backoff = Backoff::new(Config::fixed(timeout, POLL_INTERVAL))?;
        let mut last = None;
        loop {
            match self.balance(participant, account).await {
                Ok(balance) if balance == expected => {
                    info!(account, balance, elapsed = ?backoff.elapsed(), "balance reached");
                    return Ok(balance);
                }
                Ok(balance) => last = Some(balance),
                Err(err) => warn!(account, %err, "failed to get balance"),
            }
            if backoff.wait().await.is_err() {
                return Err(Error::BalanceUnsatisfied {
                    account: account.to_string(),
                    expected,
                    timeout,
                    last,
                });
            }
            info!(
                account,
                balance = ?last,
                expected,
                remaining = ?backoff.remaining(),
                "awaiting balance"
            );
        }
    }
}

/// Parses the balance from the last line of `account balance` output (e.g. `1000nria`).
fn parse_balance(stdout: &str) -> Option<u128> {
    stdout
        .lines()
        .last()?
        .trim()
        .strip_suffix(ASSET)?
        .parse()
        .ok()
}
