//! Single-attempt JSON-RPC 2.0 requests and helpers for reading their results.

use crate::Error;
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Sends a single JSON-RPC request to `url` and returns its `result` member.
///
/// `params` should be an object (named parameters) or an array (positional parameters).
pub async fn request(
    http: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
) -> Result<Value, Error> {
    let payload = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let response = http.post(url).json(&payload).send().await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(Error::Status(status));
    }
    let body: Value = response.json().await?;
    into_result(method, body)
}

/// Extracts the `result` member of a JSON-RPC response.
pub fn into_result(method: &str, mut body: Value) -> Result<Value, Error> {
    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(Error::JsonRpc {
            method: method.to_string(),
            error: body.get("error").cloned().unwrap_or(Value::Null),
        }),
    }
}

/// Follows `path` through nested objects.
pub fn field<'a>(value: &'a Value, path: &[&str]) -> Result<&'a Value, Error> {
    path.iter().try_fold(value, |current, key| {
        current
            .get(key)
            .ok_or_else(|| Error::MissingField(path.join(".")))
    })
}

/// Reads an integer encoded either as a JSON number or as a decimal string.
pub fn u64_field(value: &Value, path: &[&str]) -> Result<u64, Error> {
    let found = field(value, path)?;
    let parsed = match found {
        Value::Number(number) => number.as_u64(),
        Value::String(string) => string.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::InvalidField {
        field: path.join("."),
        value: found.clone(),
    })
}

/// Reads a string field.
pub fn str_field<'a>(value: &'a Value, path: &[&str]) -> Result<&'a str, Error> {
    let found = field(value, path)?;
    found.as_str().ok_or_else(|| Error::InvalidField {
        field: path.join("."),
        value: found.clone(),
    })
}

/// Decodes a `0x`-prefixed hex quantity.
pub fn hex_quantity(value: &Value) -> Result<u128, Error> {
    value
        .as_str()
        .and_then(|string| string.strip_prefix("0x"))
        .and_then(|digits| u128::from_str_radix(digits, 16).ok())
        .ok_or_else(|| Error::InvalidField {
            field: "quantity".to_string(),
            value: value.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use test_case::test_case;

    #[test_traced]
    fn test_result_extracted() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": {"response": {"app_version": "2"}}});
        let result = into_result("abci_info", body).unwrap();
        assert_eq!(u64_field(&result, &["response", "app_version"]).unwrap(), 2);
    }

    #[test_traced]
    fn test_error_response() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32603, "message": "Internal error"}
        });
        match into_result("consensus_params", body).unwrap_err() {
            Error::JsonRpc { method, error } => {
                assert_eq!(method, "consensus_params");
                assert_eq!(error["code"], -32603);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test_traced]
    fn test_missing_result_without_error() {
        let err = into_result("status", json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert!(matches!(err, Error::JsonRpc { error: Value::Null, .. }));
        assert!(err.is_query());
    }

    #[test_case(json!({"height": "17"}), Some(17); "decimal string")]
    #[test_case(json!({"height": 17}), Some(17); "number")]
    #[test_case(json!({"height": "0x11"}), None; "hex string")]
    #[test_case(json!({"height": -1}), None; "negative")]
    #[test_case(json!({"height": null}), None; "null")]
    fn test_u64_field(value: Value, expected: Option<u64>) {
        assert_eq!(u64_field(&value, &["height"]).ok(), expected);
    }

    #[test_traced]
    fn test_missing_nested_field() {
        let value = json!({"genesis": {"consensus_params": {}}});
        match u64_field(&value, &["genesis", "consensus_params", "version", "app"]).unwrap_err() {
            Error::MissingField(path) => assert_eq!(path, "genesis.consensus_params.version.app"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test_case(json!("0x0"), Some(0); "zero")]
    #[test_case(json!("0x8ac7230489e80000"), Some(10_000_000_000_000_000_000); "ten ether")]
    #[test_case(json!("8ac7"), None; "missing prefix")]
    #[test_case(json!(12), None; "number")]
    fn test_hex_quantity(value: Value, expected: Option<u128>) {
        assert_eq!(hex_quantity(&value).ok(), expected);
    }
}
