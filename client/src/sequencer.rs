//! Sequencer node client.

use crate::{
    grpc,
    jsonrpc::{self, field, str_field, u64_field},
    proto, query, Error, Node, NodeInfo, Participant, SequencerBlock, UpgradesInfo,
};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Retry budget for JSON-RPC queries.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry budget for gRPC queries.
pub const GRPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry budget for the `status` query (the node may still be starting).
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(600);

/// A validator in the active set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validator {
    pub address: String,
    pub voting_power: u64,
}

/// Queries a single sequencer node.
#[derive(Clone, Debug)]
pub struct Client {
    participant: Participant,
    http: reqwest::Client,
}

impl Client {
    pub fn new(participant: Participant) -> Self {
        Self {
            participant,
            http: reqwest::Client::new(),
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, Error> {
        debug!(participant = %self.participant.name, method, "sending json-rpc request");
        jsonrpc::request(&self.http, &self.participant.rpc_url, method, params).await
    }

    async fn rpc_with_retry(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, Error> {
        query::query_with_retry(&self.participant.name, method, timeout, || {
            self.rpc(method, params.clone())
        })
        .await
    }

    async fn grpc_with_retry<Req, Resp>(
        &self,
        operation: &str,
        path: &'static str,
        request: Req,
    ) -> Result<Resp, Error>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        query::query_with_retry(&self.participant.name, operation, GRPC_TIMEOUT, || {
            grpc::unary(&self.participant.grpc_url, path, request.clone())
        })
        .await
    }

    /// Queries the current validator set.
    pub async fn validators(&self) -> Result<Vec<Validator>, Error> {
        let result = self.rpc_with_retry("validators", json!({}), RPC_TIMEOUT).await?;
        parse_validators(&result)
    }

    /// Queries the node's identity, failing if the reported moniker is not this participant's name.
    pub async fn node_info(&self) -> Result<NodeInfo, Error> {
        let result = self.rpc_with_retry("status", json!({}), STATUS_TIMEOUT).await?;
        parse_node_info(&self.participant.name, &result)
    }

    /// Queries the name registered for the validator with the given bech32m `address`.
    ///
    /// This is a single attempt: failures are returned to the caller.
    pub async fn validator_name(&self, address: &str) -> Result<String, Error> {
        let request = proto::GetValidatorNameRequest {
            address: Some(proto::Address {
                bech32m: address.to_string(),
            }),
        };
        let response: proto::GetValidatorNameResponse = query::try_query(|| {
            grpc::unary(&self.participant.grpc_url, grpc::GET_VALIDATOR_NAME, request)
        })
        .await?;
        Ok(response.name)
    }
}

impl Node for Client {
    fn name(&self) -> &str {
        &self.participant.name
    }

    async fn try_last_block_height(&self) -> Result<u64, Error> {
        let result = query::try_query(|| self.rpc("abci_info", json!({}))).await?;
        u64_field(&result, &["response", "last_block_height"])
    }

    async fn last_block_height(&self) -> Result<u64, Error> {
        let result = self.rpc_with_retry("abci_info", json!({}), RPC_TIMEOUT).await?;
        u64_field(&result, &["response", "last_block_height"])
    }

    async fn current_app_version(&self) -> Result<u64, Error> {
        let result = self.rpc_with_retry("abci_info", json!({}), RPC_TIMEOUT).await?;
        u64_field(&result, &["response", "app_version"])
    }

    async fn genesis_app_version(&self) -> Result<u64, Error> {
        let result = self.rpc_with_retry("genesis", json!({}), RPC_TIMEOUT).await?;
        u64_field(&result, &["genesis", "consensus_params", "version", "app"])
    }

    async fn vote_extensions_enable_height(&self) -> Result<u64, Error> {
        // Querying without a height intermittently fails to find the consensus params
        let height = self.last_block_height().await?;
        let params = json!({ "height": height.to_string() });
        let result = self
            .rpc_with_retry("consensus_params", params, RPC_TIMEOUT)
            .await?;
        u64_field(
            &result,
            &["consensus_params", "abci", "vote_extensions_enable_height"],
        )
    }

    async fn sequencer_block(&self, height: u64) -> Result<SequencerBlock, Error> {
        let request = proto::GetSequencerBlockRequest { height };
        self.grpc_with_retry(
            &format!("get sequencer block {height}"),
            grpc::GET_SEQUENCER_BLOCK,
            request,
        )
        .await
    }

    async fn upgrades_info(&self) -> Result<UpgradesInfo, Error> {
        let response: proto::GetUpgradesInfoResponse = self
            .grpc_with_retry(
                "get upgrades info",
                grpc::GET_UPGRADES_INFO,
                proto::GetUpgradesInfoRequest {},
            )
            .await?;
        Ok(response.into())
    }
}

fn parse_validators(result: &Value) -> Result<Vec<Validator>, Error> {
    let validators = field(result, &["validators"])?;
    let Some(validators) = validators.as_array() else {
        return Err(Error::InvalidField {
            field: "validators".to_string(),
            value: validators.clone(),
        });
    };
    validators
        .iter()
        .map(|validator| {
            Ok(Validator {
                address: str_field(validator, &["address"])?.to_string(),
                voting_power: u64_field(validator, &["voting_power"])?,
            })
        })
        .collect()
}

fn parse_node_info(expected: &str, result: &Value) -> Result<NodeInfo, Error> {
    let moniker = str_field(result, &["node_info", "moniker"])?;
    if moniker != expected {
        return Err(Error::UnexpectedMoniker {
            expected: expected.to_string(),
            reported: moniker.to_string(),
        });
    }
    let encoded = field(result, &["validator_info", "pub_key", "value"])?;
    let pub_key = encoded
        .as_str()
        .and_then(|value| base64::decode(value).ok())
        .ok_or_else(|| Error::InvalidField {
            field: "validator_info.pub_key.value".to_string(),
            value: encoded.clone(),
        })?;
    Ok(NodeInfo {
        moniker: moniker.to_string(),
        address: str_field(result, &["validator_info", "address"])?.to_string(),
        pub_key: hex::encode(pub_key),
        voting_power: u64_field(result, &["validator_info", "voting_power"])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    fn status(moniker: &str) -> Value {
        json!({
            "node_info": {"moniker": moniker},
            "validator_info": {
                "address": "0A1B2C",
                "pub_key": {"type": "tendermint/PubKeyEd25519", "value": "cHVia2V5"},
                "voting_power": "10",
            },
        })
    }

    #[test_traced]
    fn test_node_info_parsed() {
        let info = parse_node_info("node1", &status("node1")).unwrap();
        assert_eq!(
            info,
            NodeInfo {
                moniker: "node1".into(),
                address: "0A1B2C".into(),
                pub_key: "7075626b6579".into(),
                voting_power: 10,
            }
        );
    }

    #[test_traced]
    fn test_node_info_rejects_wrong_moniker() {
        match parse_node_info("node1", &status("node2")).unwrap_err() {
            Error::UnexpectedMoniker { expected, reported } => {
                assert_eq!(expected, "node1");
                assert_eq!(reported, "node2");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test_traced]
    fn test_node_info_rejects_invalid_pub_key() {
        let mut result = status("node1");
        result["validator_info"]["pub_key"]["value"] = json!("not base64!");
        let err = parse_node_info("node1", &result).unwrap_err();
        assert!(matches!(err, Error::InvalidField { .. }));
    }

    #[test_traced]
    fn test_validators_parsed() {
        let result = json!({
            "block_height": "12",
            "validators": [
                {"address": "AA", "voting_power": "10"},
                {"address": "BB", "voting_power": "5"},
            ],
        });
        let validators = parse_validators(&result).unwrap();
        assert_eq!(validators.len(), 2);
        assert_eq!(validators[1].address, "BB");
        assert_eq!(validators[1].voting_power, 5);
    }

    #[test_traced]
    fn test_validators_not_a_list() {
        let err = parse_validators(&json!({"validators": "none"})).unwrap_err();
        assert!(matches!(err, Error::InvalidField { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_query_error() {
        let mut participant = Participant::validator("node0");
        participant.rpc_url = "http://127.0.0.1:1".to_string();
        let client = Client::new(participant);
        let err = client.try_last_block_height().await.unwrap_err();
        assert!(err.is_query());
    }
}
