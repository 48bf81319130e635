//! JSON-RPC 2.0 batch envelope types.
use serde::{Deserialize, Serialize};

/// Method name used to pad a single-command batch so that servers which only enable their
/// batch code path for arrays of two or more still answer with an array.
pub const PADDING_METHOD: &str = "rpc_fabric.padding";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        RpcRequest {
            id,
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// What a single element of a batch response turned out to be.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    Result(serde_json::Value),
    Error(RpcError),
    Malformed,
}

/// Extracts the numeric id of a batch response element, if it has one.
pub fn entry_id(entry: &serde_json::Value) -> Option<u64> {
    entry.get("id").and_then(serde_json::Value::as_u64)
}

/// Classifies one batch response element.
///
/// Elements are inspected as raw JSON rather than deserialized into a struct, so that an
/// explicit `"result": null` still counts as a result.
pub fn entry_outcome(entry: &serde_json::Value) -> EntryOutcome {
    if let Some(result) = entry.get("result") {
        return EntryOutcome::Result(result.clone());
    }
    match entry.get("error") {
        Some(error) => match serde_json::from_value::<RpcError>(error.clone()) {
            Ok(error) => EntryOutcome::Error(error),
            Err(_) => EntryOutcome::Malformed,
        },
        None => EntryOutcome::Malformed,
    }
}
