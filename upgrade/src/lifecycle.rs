//! Drive a single node through an upgrade rollout.
//!
//! Each step consumes the token produced by the previous one, so the height captured before a
//! restart is carried explicitly from [stage] into [await_activation]:
//!
//! ```text
//! Running --stage--> Staged --await_activation--> Upgraded (via Converged or Stalled)
//! Running --detect_stall--> Stalled --resume_after_stall--> Upgraded
//! ```

use crate::{
    change_info::{check_change_infos, Upgrades},
    deploy::{Component, Deployer, Release},
    Error,
};
use sequencer_harness_client::Node;
use std::time::Duration;
use tracing::{info, warn};

/// Time allowed for a restarted node to terminate and roll out again.
pub const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed for a restarted node to commit [RESTART_MARGIN] blocks past its captured height.
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(60);

/// Blocks a restarted node must commit beyond its captured height (a block may be committed
/// between capturing the height and the node shutting down).
pub const RESTART_MARGIN: u64 = 2;

/// Scheduled changes are only checked while the node is at least this many blocks short of the
/// activation height.
pub const PRE_CHECK_MARGIN: u64 = 2;

/// Time budgeted per block still to be committed.
pub const TIME_PER_BLOCK: Duration = Duration::from_secs(10);

/// Lower bound on any wait scaled by a number of blocks.
pub const MIN_BLOCK_WAIT: Duration = Duration::from_secs(30);

/// Phase of a node's upgrade rollout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Running,
    Staged,
    Stalled,
    Converged,
    Upgraded,
}

/// A node restarted with a release scheduling the upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Staged {
    /// Height reported just before the restart (`None` if the node had already stopped).
    pub captured_height: Option<u64>,
    pub activation_height: u64,
}

impl Staged {
    pub fn state(&self) -> State {
        State::Staged
    }
}

/// A node that stopped at the activation height because it was not upgraded in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stalled {
    pub activation_height: u64,

    /// Height reported while stalled (`None` if the node could not be queried).
    pub observed_height: Option<u64>,
}

impl Stalled {
    pub fn state(&self) -> State {
        State::Stalled
    }
}

/// A node that has committed the activation height with the upgraded binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Activated {
    /// Path taken to activation: [State::Converged] if the node was running when staged,
    /// [State::Stalled] if it had stopped.
    pub from: State,

    /// Height observed once activation was confirmed.
    pub height: u64,
}

impl Activated {
    pub fn state(&self) -> State {
        State::Upgraded
    }
}

/// Returns the height `blocks` past `height`, failing instead of overflowing.
pub fn height_after(height: u64, blocks: u64) -> Result<u64, Error> {
    height
        .checked_add(blocks)
        .ok_or(Error::HeightOverflow { height, blocks })
}

/// Returns [TIME_PER_BLOCK] for every block in `blocks`, but no less than [MIN_BLOCK_WAIT].
pub fn block_wait(blocks: u64) -> Duration {
    let scaled = TIME_PER_BLOCK.saturating_mul(u32::try_from(blocks).unwrap_or(u32::MAX));
    scaled.max(MIN_BLOCK_WAIT)
}

/// Captures the node's height and restarts it with `release`.
///
/// Failing to read the height means the node has already stopped, in which case the pod is
/// restarted explicitly after the release is applied.
pub async fn stage<N: Node, D: Deployer>(
    node: &N,
    deployer: &D,
    component: &Component,
    release: &Release,
) -> Result<Staged, Error> {
    let activation_height = release
        .activation_height()
        .ok_or(Error::MissingActivationHeight)?;

    // Capture height before restart
    let captured_height = match node.try_last_block_height().await {
        Ok(height) => Some(height),
        Err(err) => {
            warn!(node = node.name(), %err, "failed to capture height, assuming node has stopped");
            None
        }
    };

    // Apply the release
    deployer.upgrade(component, release).await?;
    if captured_height.is_none() {
        deployer.restart(component).await?;
    }
    info!(node = node.name(), ?captured_height, activation_height, "staged upgrade");
    Ok(Staged {
        captured_height,
        activation_height,
    })
}

/// Waits for a staged node to restart and commit the activation height.
///
/// If a height was captured, the node must first commit [RESTART_MARGIN] blocks past it and, while
/// still [PRE_CHECK_MARGIN] blocks short of activation, report no applied changes and valid
/// scheduled changes. A node that had already stopped skips those checks and is given time
/// proportional to the activation height.
pub async fn await_activation<N: Node, D: Deployer>(
    node: &N,
    deployer: &D,
    component: &Component,
    staged: Staged,
    upgrades: &Upgrades,
) -> Result<Activated, Error> {
    let activation_height = staged.activation_height;
    deployer.wait_for_rollout(component, ROLLOUT_TIMEOUT).await?;

    let (from, timeout) = match staged.captured_height {
        Some(captured) => {
            node.wait_until_height(height_after(captured, RESTART_MARGIN)?, RESTART_TIMEOUT)
                .await?;
            let latest = node.last_block_height().await?;
            if latest < activation_height.saturating_sub(PRE_CHECK_MARGIN) {
                check_scheduled(node, upgrades).await?;
            }
            (
                State::Converged,
                block_wait(activation_height.saturating_sub(latest)),
            )
        }
        None => (
            State::Stalled,
            TIME_PER_BLOCK.saturating_mul(u32::try_from(activation_height).unwrap_or(u32::MAX)),
        ),
    };

    let poll = node.wait_until_height(activation_height, timeout).await?;
    info!(node = node.name(), height = poll.value, ?from, "reached activation height");
    Ok(Activated {
        from,
        height: poll.value,
    })
}

/// Checks that nothing has been applied yet and the scheduled changes are valid.
async fn check_scheduled<N: Node>(node: &N, upgrades: &Upgrades) -> Result<(), Error> {
    let info = node.upgrades_info().await?;
    if !info.applied.is_empty() {
        return Err(Error::UnexpectedAppliedChanges {
            node: node.name().to_string(),
            count: info.applied.len(),
        });
    }
    check_change_infos(&info.scheduled, upgrades, None)?;
    for change in &info.scheduled {
        info!(node = node.name(), %change, "scheduled change");
    }
    Ok(())
}

/// Confirms that a node left on the outdated binary has stopped short of `activation_height`.
pub async fn detect_stall<N: Node>(node: &N, activation_height: u64) -> Result<Stalled, Error> {
    let observed_height = match node.try_last_block_height().await {
        Ok(height) if height >= activation_height => {
            return Err(Error::NotStalled {
                node: node.name().to_string(),
                height,
                activation_height,
            });
        }
        Ok(height) => Some(height),
        Err(err) => {
            info!(node = node.name(), %err, "node unreachable");
            None
        }
    };
    info!(node = node.name(), ?observed_height, activation_height, "node stalled as expected");
    Ok(Stalled {
        activation_height,
        observed_height,
    })
}

/// Upgrades a stalled node, waits for it to activate, and then waits for it to catch up with the
/// height `reference` reports.
pub async fn resume_after_stall<N: Node, R: Node, D: Deployer>(
    node: &N,
    deployer: &D,
    component: &Component,
    release: &Release,
    stalled: Stalled,
    reference: &R,
    upgrades: &Upgrades,
) -> Result<Activated, Error> {
    let staged = stage(node, deployer, component, release).await?;
    if staged.activation_height != stalled.activation_height {
        return Err(Error::ActivationHeightMismatch {
            change: component.name().to_string(),
            expected: stalled.activation_height,
            actual: staged.activation_height,
        });
    }
    await_activation(node, deployer, component, staged, upgrades).await?;

    // Catch up with the rest of the cohort
    let target = reference.last_block_height().await?;
    let timeout = block_wait(target.saturating_sub(stalled.activation_height));
    let poll = node.wait_until_height(target, timeout).await?;
    info!(node = node.name(), height = poll.value, "caught up");
    Ok(Activated {
        from: State::Stalled,
        height: poll.value,
    })
}
