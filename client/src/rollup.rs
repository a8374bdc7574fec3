//! EVM rollup client.

use crate::{
    jsonrpc::{self, hex_quantity},
    query::{self, Poll},
    Error,
};
use serde_json::{json, Value};
use std::time::Duration;

/// JSON-RPC endpoint of the rollup executor in the local development cluster.
pub const DEFAULT_URL: &str = "http://executor.astria.localdev.me/";

/// Name used to identify the rollup in logs and errors.
const NAME: &str = "rollup";

/// Queries the EVM rollup over positional-parameter JSON-RPC.
#[derive(Clone, Debug)]
pub struct Client {
    url: String,
    http: reqwest::Client,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

impl Client {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, Error> {
        jsonrpc::request(&self.http, &self.url, method, params).await
    }

    /// Returns the balance of `address` (in wei) at the latest block.
    pub async fn balance(&self, address: &str) -> Result<u128, Error> {
        let result = self
            .rpc("eth_getBalance", json!([address, "latest"]))
            .await?;
        hex_quantity(&result)
    }

    /// Polls the balance of `address` until it equals `expected`.
    pub async fn wait_until_balance(
        &self,
        address: &str,
        expected: u128,
        timeout: Duration,
    ) -> Result<Poll<u128>, Error> {
        query::poll_until(
            NAME,
            &format!("balance of {address} to equal {expected}"),
            timeout,
            || self.balance(address),
            |balance| *balance == expected,
        )
        .await
    }

    /// Returns the number of the latest finalized block.
    pub async fn finalized_height(&self) -> Result<u64, Error> {
        let result = self
            .rpc("eth_getBlockByNumber", json!(["finalized", false]))
            .await?;
        let number = jsonrpc::field(&result, &["number"])?;
        as_u64(number)
    }

    /// Polls the finalized block number until it reaches `height`.
    pub async fn wait_until_finalized_height(
        &self,
        height: u64,
        timeout: Duration,
    ) -> Result<Poll<u64>, Error> {
        query::poll_until(
            NAME,
            &format!("finalize block {height}"),
            timeout,
            || self.finalized_height(),
            |latest| *latest >= height,
        )
        .await
    }

    /// Submits a `0x`-prefixed hex-encoded signed transaction, returning its hash.
    pub async fn send_raw_transaction(&self, transaction: &str) -> Result<String, Error> {
        let result = self
            .rpc("eth_sendRawTransaction", json!([transaction]))
            .await?;
        match result {
            Value::String(hash) => Ok(hash),
            other => Err(Error::InvalidField {
                field: "hash".to_string(),
                value: other,
            }),
        }
    }

    /// Returns the number of the block that included the transaction with `hash`.
    pub async fn transaction_block_number(&self, hash: &str) -> Result<u64, Error> {
        let receipt = self
            .rpc("eth_getTransactionReceipt", json!([hash]))
            .await?;
        let number = jsonrpc::field(&receipt, &["blockNumber"])?;
        as_u64(number)
    }
}

fn as_u64(value: &Value) -> Result<u64, Error> {
    let quantity = hex_quantity(value)?;
    u64::try_from(quantity).map_err(|_| Error::InvalidField {
        field: "quantity".to_string(),
        value: value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_block_number_decoded() {
        assert_eq!(as_u64(&json!("0x1f")).unwrap(), 31);
    }

    #[test_traced]
    fn test_oversized_block_number_rejected() {
        let err = as_u64(&json!("0x10000000000000000")).unwrap_err();
        assert!(matches!(err, Error::InvalidField { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_rollup_exhausts_poll() {
        let client = Client::new("http://127.0.0.1:1/");
        let err = client
            .wait_until_finalized_height(10, Duration::from_secs(3))
            .await
            .unwrap_err();
        match err {
            Error::Unsatisfied { participant, last, .. } => {
                assert_eq!(participant, "rollup");
                assert_eq!(last, "None");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
