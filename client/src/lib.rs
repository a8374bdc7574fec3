//! Query sequencer and rollup nodes over JSON-RPC and gRPC.
//!
//! Every query comes in two flavors: a single attempt (`try_*`), which surfaces any network or
//! protocol failure as a query error, and a retrying variant, which absorbs query errors until its
//! [Backoff](sequencer_harness_backoff::Backoff) is exhausted. Conditions that take a while to
//! become true (a block height, a balance) are awaited with [query::poll_until].
//!
//! The [Node] trait is the surface consumed by upgrade orchestration. [sequencer::Client] is the
//! production implementation.

use std::{future::Future, time::Duration};
use thiserror::Error;

pub mod grpc;
pub mod jsonrpc;
pub mod proto;
pub mod query;
pub mod rollup;
pub mod sequencer;

pub use proto::{ChangeInfo, SequencerBlock};
pub use query::Poll;

/// Name of the validator whose endpoints use the unsuffixed hostnames.
const PRIMARY_NODE: &str = "node0";

/// Namespace shared by the primary validator and the rollup.
pub const DEV_NAMESPACE: &str = "astria-dev-cluster";

/// Errors that can occur when querying a node.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid backoff: {0}")]
    Backoff(#[from] sequencer_harness_backoff::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected http status: {0}")]
    Status(reqwest::StatusCode),
    #[error("json-rpc error response for `{method}`: {error}")]
    JsonRpc {
        method: String,
        error: serde_json::Value,
    },
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("invalid field {field}: {value}")]
    InvalidField {
        field: String,
        value: serde_json::Value,
    },
    #[error("unexpected moniker: expected {expected}, node reported {reported}")]
    UnexpectedMoniker { expected: String, reported: String },
    #[error("grpc transport failed: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("grpc request failed: {0}")]
    Grpc(#[from] Box<tonic::Status>),
    #[error("{participant}: {operation} failed {attempts} times, giving up: {last}")]
    RetriesExhausted {
        participant: String,
        operation: String,
        attempts: usize,
        last: Box<Error>,
    },
    #[error("{participant}: {operation} not satisfied within {timeout:?} (last observed: {last})")]
    Unsatisfied {
        participant: String,
        operation: String,
        timeout: Duration,
        last: String,
    },
}

impl Error {
    /// Returns whether this error is a single-attempt failure that is worth retrying.
    pub fn is_query(&self) -> bool {
        !matches!(
            self,
            Error::Backoff(_) | Error::RetriesExhausted { .. } | Error::Unsatisfied { .. }
        )
    }
}

/// A network participant under test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Participant {
    /// Identity of the node (also its moniker).
    pub name: String,

    /// Kubernetes namespace the node is deployed into.
    pub namespace: String,

    /// JSON-RPC endpoint.
    pub rpc_url: String,

    /// gRPC endpoint.
    pub grpc_url: String,
}

impl Participant {
    /// Returns the participant for a validator deployed to the local development cluster.
    pub fn validator(name: &str) -> Self {
        if name == PRIMARY_NODE {
            return Self {
                name: name.to_string(),
                namespace: DEV_NAMESPACE.to_string(),
                rpc_url: "http://rpc.sequencer.localdev.me".to_string(),
                grpc_url: "http://grpc.sequencer.localdev.me:80".to_string(),
            };
        }
        Self {
            name: name.to_string(),
            namespace: format!("astria-validator-{name}"),
            rpc_url: format!("http://rpc.sequencer-{name}.localdev.me"),
            grpc_url: format!("http://grpc.sequencer-{name}.localdev.me:80"),
        }
    }
}

/// Applied and scheduled upgrade changes reported by a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpgradesInfo {
    pub applied: Vec<ChangeInfo>,
    pub scheduled: Vec<ChangeInfo>,
}

impl From<proto::GetUpgradesInfoResponse> for UpgradesInfo {
    fn from(response: proto::GetUpgradesInfoResponse) -> Self {
        Self {
            applied: response.applied,
            scheduled: response.scheduled,
        }
    }
}

/// Identity of a validator as reported by its `status` endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub moniker: String,
    pub address: String,

    /// Hex-encoded public key.
    pub pub_key: String,
    pub voting_power: u64,
}

/// Interface to a single sequencer node.
///
/// Methods other than [Node::try_last_block_height] retry internally and only fail once their
/// retry budget is exhausted.
pub trait Node: Send + Sync {
    /// Identity of the node.
    fn name(&self) -> &str;

    /// Queries the latest block height once.
    fn try_last_block_height(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Queries the latest block height.
    fn last_block_height(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Queries the app version currently in effect.
    fn current_app_version(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Queries the app version recorded in genesis.
    fn genesis_app_version(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Queries the height at which vote extensions are enabled (zero when disabled).
    fn vote_extensions_enable_height(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Queries the sequencer block at `height`.
    fn sequencer_block(
        &self,
        height: u64,
    ) -> impl Future<Output = Result<SequencerBlock, Error>> + Send;

    /// Queries the applied and scheduled upgrade changes.
    fn upgrades_info(&self) -> impl Future<Output = Result<UpgradesInfo, Error>> + Send;

    /// Polls the latest block height until it reaches `height`.
    fn wait_until_height(
        &self,
        height: u64,
        timeout: Duration,
    ) -> impl Future<Output = Result<Poll<u64>, Error>> + Send {
        async move {
            let operation = format!("reach block {height}");
            query::poll_until(
                self.name(),
                &operation,
                timeout,
                || self.try_last_block_height(),
                |latest| *latest >= height,
            )
            .await
        }
    }
}
