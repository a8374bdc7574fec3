//! Protobuf messages exchanged with the sequencer gRPC service.
//!
//! Only the fields consulted by upgrade checks are decoded as structured messages. Nested messages
//! that are merely tested for presence are kept as their raw encoding.

use std::fmt;

/// Request for the sequencer block at a given height.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct GetSequencerBlockRequest {
    #[prost(uint64, tag = "1")]
    pub height: u64,
}

/// A block as assembled by the sequencer.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct SequencerBlock {
    #[prost(bytes = "vec", tag = "1")]
    pub header: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub rollup_transactions: Vec<Vec<u8>>,
    #[prost(bytes = "vec", tag = "3")]
    pub rollup_transactions_proof: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub rollup_ids_proof: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub block_hash: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub upgrade_change_hashes: Vec<Vec<u8>>,
    #[prost(message, optional, tag = "7")]
    pub extended_commit_info_with_proof: Option<ExtendedCommitInfoWithProof>,
}

/// Extended commit info (carrying vote extensions) and its inclusion proof.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct ExtendedCommitInfoWithProof {
    #[prost(bytes = "vec", tag = "1")]
    pub extended_commit_info: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub proof: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct GetUpgradesInfoRequest {}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct GetUpgradesInfoResponse {
    #[prost(message, repeated, tag = "1")]
    pub applied: Vec<ChangeInfo>,
    #[prost(message, repeated, tag = "2")]
    pub scheduled: Vec<ChangeInfo>,
}

/// A single named change within an upgrade.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct ChangeInfo {
    #[prost(uint64, tag = "1")]
    pub activation_height: u64,
    #[prost(string, tag = "2")]
    pub change_name: String,
    #[prost(uint64, tag = "3")]
    pub app_version: u64,
    #[prost(string, tag = "4")]
    pub base64_hash: String,
}

impl fmt::Display for ChangeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (activation height {}, app version {}, hash {})",
            self.change_name, self.activation_height, self.app_version, self.base64_hash
        )
    }
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Address {
    #[prost(string, tag = "1")]
    pub bech32m: String,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct GetValidatorNameRequest {
    #[prost(message, optional, tag = "1")]
    pub address: Option<Address>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct GetValidatorNameResponse {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use prost::Message;

    #[test_traced]
    fn test_missing_commit_info_decodes_as_none() {
        let block = SequencerBlock {
            block_hash: vec![1; 32],
            ..Default::default()
        };
        let decoded = SequencerBlock::decode(block.encode_to_vec().as_slice()).unwrap();
        assert!(decoded.extended_commit_info_with_proof.is_none());
        assert!(decoded.upgrade_change_hashes.is_empty());
    }

    #[test_traced]
    fn test_change_info_display() {
        let info = ChangeInfo {
            activation_height: 42,
            change_name: "price_feed_change".into(),
            app_version: 2,
            base64_hash: "aGFzaA==".into(),
        };
        assert_eq!(
            info.to_string(),
            "price_feed_change (activation height 42, app version 2, hash aGFzaA==)"
        );
    }
}
