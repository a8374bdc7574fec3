//! Checks specific to the `aspen` upgrade, which enables vote extensions (carried in each block as
//! extended commit info) one block after activation.

use crate::{lifecycle::height_after, Error};
use futures::future::try_join_all;
use sequencer_harness_client::Node;
use tracing::info;

pub const NAME: &str = "aspen";

/// Changes activated by the upgrade.
pub const CHANGES: [&str; 3] = [
    "price_feed_change",
    "validator_update_action_change",
    "ibc_acknowledgement_failure_change",
];

/// Asserts that vote extensions are not yet enabled on any node of `cohort`.
pub async fn assert_pre_upgrade_conditions<N: Node>(cohort: &[N]) -> Result<(), Error> {
    try_join_all(cohort.iter().map(|node| async move {
        check_enable_height(node, 0).await?;
        let latest = node.last_block_height().await?;
        check_commit_info(node, latest, false).await
    }))
    .await?;
    info!("vote extensions disabled on all nodes");
    Ok(())
}

/// Asserts that vote extensions were enabled at `activation_height + 1` on every node of
/// `cohort`, so the block at the activation height carries no extended commit info while the
/// latest block does.
pub async fn assert_post_upgrade_conditions<N: Node>(
    cohort: &[N],
    activation_height: u64,
) -> Result<(), Error> {
    let enable_height = height_after(activation_height, 1)?;
    try_join_all(cohort.iter().map(|node| async move {
        check_enable_height(node, enable_height).await?;
        check_commit_info(node, activation_height, false).await?;
        let latest = node.last_block_height().await?;
        check_commit_info(node, latest, true).await
    }))
    .await?;
    info!(activation_height, "vote extensions enabled on all nodes");
    Ok(())
}

async fn check_enable_height<N: Node>(node: &N, expected: u64) -> Result<(), Error> {
    let actual = node.vote_extensions_enable_height().await?;
    if actual != expected {
        return Err(Error::VoteExtensionsEnableHeight {
            node: node.name().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

async fn check_commit_info<N: Node>(node: &N, height: u64, expected: bool) -> Result<(), Error> {
    let block = node.sequencer_block(height).await?;
    let present = block.extended_commit_info_with_proof.is_some();
    if present != expected {
        return Err(Error::ExtendedCommitInfo {
            node: node.name().to_string(),
            height,
            present,
            expected,
        });
    }
    Ok(())
}
