//! Reply validation.
//!
//! [`read_reply`] checks a framed reply against the active request and
//! extracts its result. Interpreting the result is left to the
//! per-request handlers in the client.

use super::protocol::RpcResponse;
use super::request::{Request, RequestKind};
use crate::error::{NodeError, Result};
use serde_json::Value;

/// Validate `frame` as the reply to `active` and return its result.
///
/// - An empty frame, unparseable JSON or a call id other than the active
///   one is a protocol error.
/// - A `null` result to `eth_getFilterChanges` reads as an empty list.
/// - A missing or `null` result is an RPC error when the reply carries an
///   `error` object, tolerated for transaction lookups, and a
///   [`NodeError::MissingResult`] otherwise.
pub fn read_reply(frame: &[u8], active: &Request) -> Result<Value> {
    if frame.iter().all(u8::is_ascii_whitespace) {
        return Err(NodeError::protocol("Error on socket read: empty response"));
    }

    let response: RpcResponse = serde_json::from_slice(frame)
        .map_err(|e| NodeError::protocol(format!("Response parse error: {}", e)))?;

    if response.call_id() != Some(active.call_id()) {
        let got = response
            .id
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "-1".to_string());
        return Err(NodeError::protocol(format!(
            "Call number mismatch {} != {}",
            got,
            active.call_id()
        )));
    }

    let result = match response.result {
        Some(Value::Null) if active.kind() == RequestKind::GetFilterChanges => {
            Some(Value::Array(Vec::new()))
        }
        other => other,
    };

    match result {
        Some(value) if !value.is_null() => Ok(value),
        absent => {
            if let Some(error) = response.error {
                return Err(NodeError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }
            if active.kind() == RequestKind::GetTransactionByHash {
                return Ok(absent.unwrap_or(Value::Null));
            }
            Err(NodeError::MissingResult {
                method: active.method().to_string(),
            })
        }
    }
}
