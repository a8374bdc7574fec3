//! Stage, await, and verify network upgrades across a cohort of sequencer nodes.
//!
//! # Overview
//!
//! An upgrade is rolled out by restarting each validator with a binary (and `upgrades.json`) that
//! schedules a set of named changes at an activation height. [lifecycle] drives a single node through
//! that rollout (`Running -> Staged -> (Stalled | Converged) -> Upgraded`), [consistency] asserts
//! that every node of a cohort reports the same state once they have converged, and
//! [change_info] validates the changes nodes report as scheduled or applied.
//!
//! Deployment itself is delegated to a [deploy::Deployer] (in production, [deploy::Helm]), and nodes
//! are queried through [sequencer_harness_client::Node], so every step can be exercised against
//! the simulated nodes in `mocks`.

use std::process::ExitStatus;
use thiserror::Error;

pub mod aspen;
pub mod change_info;
pub mod consistency;
pub mod deploy;
pub mod lifecycle;

#[cfg(test)]
pub mod mocks;

/// Errors that can occur when orchestrating or verifying an upgrade.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] sequencer_harness_client::Error),
    #[error("cohort is empty")]
    EmptyCohort,
    #[error("{reference} and {node} report different values for {what}: {expected} != {actual}")]
    Inconsistent {
        what: String,
        reference: String,
        node: String,
        expected: String,
        actual: String,
    },
    #[error("{what} changed: {before} != {after}")]
    Changed {
        what: String,
        before: String,
        after: String,
    },
    #[error("no change infos reported")]
    NoChangeInfos,
    #[error("change `{0}` does not belong to any known upgrade")]
    UnknownChange(String),
    #[error("change `{change}` is claimed by both {first} and {second}")]
    AmbiguousChange {
        change: String,
        first: String,
        second: String,
    },
    #[error("height {height} + {blocks} overflows")]
    HeightOverflow { height: u64, blocks: u64 },
    #[error("change `{change}` activates at {actual}, expected {expected}")]
    ActivationHeightMismatch {
        change: String,
        expected: u64,
        actual: u64,
    },
    #[error("change `{change}` has app version {actual}, expected {expected}")]
    AppVersionMismatch {
        change: String,
        expected: u64,
        actual: u64,
    },
    #[error("{node}: expected no applied changes, found {count}")]
    UnexpectedAppliedChanges { node: String, count: usize },
    #[error("{node}: expected no scheduled changes, found {count}")]
    UnexpectedScheduledChanges { node: String, count: usize },
    #[error("release does not schedule an activation height")]
    MissingActivationHeight,
    #[error("{node} should be stalled but reports height {height} (activation height {activation_height})")]
    NotStalled {
        node: String,
        height: u64,
        activation_height: u64,
    },
    #[error("{node}: app version {after} did not increase from {before}")]
    AppVersionUnchanged { node: String, before: u64, after: u64 },
    #[error("{node}: vote extensions enable height is {actual}, expected {expected}")]
    VoteExtensionsEnableHeight {
        node: String,
        expected: u64,
        actual: u64,
    },
    #[error("{node}: block {height} has extended commit info: {present} (expected {expected})")]
    ExtendedCommitInfo {
        node: String,
        height: u64,
        present: bool,
        expected: bool,
    },
    #[error("unknown upgrade: {0}")]
    UnknownUpgrade(String),
    #[error("`{command}` failed: {status}")]
    CommandFailed { command: String, status: ExitStatus },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
