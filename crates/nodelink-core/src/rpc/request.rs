//! Requests as tracked by the dispatcher.

use super::protocol::RpcRequest;
use crate::error::Result;
use serde_json::Value;

/// Whether a request drives the user-visible busy indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Issued on behalf of the user; shows as busy while in flight.
    Full,
    /// Background polling.
    NonVisual,
}

/// How a failed reply to a request is recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Tear down the session: stop polling and drop every queued request.
    Hard,
    /// Drop only the failed request.
    Soft,
    /// Drop the failed request and everything queued behind it, keep polling.
    SoftClearQueue,
}

/// The operations the client issues, tagged so replies can be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    GetAccounts,
    GetBalance,
    GetTransactionCount,
    NewAccount,
    DeleteAccount,
    GetBlockNumber,
    GetPeerCount,
    SendTransaction,
    UnlockAccount,
    GetGasPrice,
    EstimateGas,
    NewBlockFilter,
    NewEventFilter,
    GetFilterChanges,
    UninstallFilter,
    GetTransactionByHash,
    GetBlock,
    GetClientVersion,
    GetNetVersion,
    GetSyncing,
    GetLogs,
    GetTransactionReceipt,
}

impl RequestKind {
    pub fn visibility(self) -> Visibility {
        match self {
            RequestKind::GetBlockNumber
            | RequestKind::GetPeerCount
            | RequestKind::GetSyncing
            | RequestKind::GetFilterChanges
            | RequestKind::GetClientVersion
            | RequestKind::GetNetVersion => Visibility::NonVisual,
            _ => Visibility::Full,
        }
    }

    /// Recovery applied when the node answers with an error or no result.
    ///
    /// Requests the session cannot run without fail hard; requests made on
    /// behalf of a single user action fail soft.
    pub fn failure_policy(self) -> FailurePolicy {
        match self {
            RequestKind::GetAccounts
            | RequestKind::GetBlockNumber
            | RequestKind::GetPeerCount
            | RequestKind::GetSyncing
            | RequestKind::GetClientVersion
            | RequestKind::GetNetVersion
            | RequestKind::NewBlockFilter => FailurePolicy::Hard,
            RequestKind::UnlockAccount => FailurePolicy::SoftClearQueue,
            _ => FailurePolicy::Soft,
        }
    }

    /// Requests whose params include a password.
    pub fn carries_secret(self) -> bool {
        matches!(
            self,
            RequestKind::NewAccount
                | RequestKind::DeleteAccount
                | RequestKind::UnlockAccount
                | RequestKind::SendTransaction
        )
    }
}

/// An immutable request with its call id.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    call_id: u64,
    kind: RequestKind,
    method: String,
    params: Vec<Value>,
    target_index: Option<usize>,
}

impl Request {
    pub fn new(call_id: u64, kind: RequestKind, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            call_id,
            kind,
            method: method.into(),
            params,
            target_index: None,
        }
    }

    /// Attach the account or transaction slot the reply updates.
    pub fn with_target(mut self, index: usize) -> Self {
        self.target_index = Some(index);
        self
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn target_index(&self) -> Option<usize> {
        self.target_index
    }

    pub fn visibility(&self) -> Visibility {
        self.kind.visibility()
    }

    /// First param as a string, e.g. the hash or filter id a request is about.
    pub fn first_param_str(&self) -> Option<&str> {
        self.params.first().and_then(Value::as_str)
    }

    /// True when `method` and `params` match this request.
    pub fn same_call(&self, method: &str, params: &[Value]) -> bool {
        self.method == method && self.params == params
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        RpcRequest::new(self.method.clone(), self.params.clone(), self.call_id).to_bytes()
    }

    /// Loggable form of the request, with secrets masked.
    pub fn log_line(&self) -> String {
        if self.kind.carries_secret() {
            format!("#{} {} [REDACTED]", self.call_id, self.method)
        } else {
            format!(
                "#{} {} {}",
                self.call_id,
                self.method,
                Value::Array(self.params.clone())
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_visibility_of_polls() {
        assert_eq!(RequestKind::GetPeerCount.visibility(), Visibility::NonVisual);
        assert_eq!(RequestKind::GetFilterChanges.visibility(), Visibility::NonVisual);
        assert_eq!(RequestKind::GetAccounts.visibility(), Visibility::Full);
        assert_eq!(RequestKind::UninstallFilter.visibility(), Visibility::Full);
    }

    #[test]
    fn test_failure_policies() {
        assert_eq!(RequestKind::GetNetVersion.failure_policy(), FailurePolicy::Hard);
        assert_eq!(RequestKind::SendTransaction.failure_policy(), FailurePolicy::Soft);
        assert_eq!(RequestKind::GetFilterChanges.failure_policy(), FailurePolicy::Soft);
        assert_eq!(
            RequestKind::UnlockAccount.failure_policy(),
            FailurePolicy::SoftClearQueue
        );
    }

    #[test]
    fn test_log_line_masks_passwords() {
        let unlock = Request::new(
            4,
            RequestKind::UnlockAccount,
            "personal_unlockAccount",
            vec![json!("0xabc"), json!("hunter2"), json!("0x3c")],
        );
        let line = unlock.log_line();
        assert!(!line.contains("hunter2"));
        assert!(line.contains("personal_unlockAccount"));

        let balance = Request::new(
            5,
            RequestKind::GetBalance,
            "eth_getBalance",
            vec![json!("0xabc"), json!("latest")],
        );
        assert!(balance.log_line().contains("latest"));
    }

    #[test]
    fn test_encode_uses_call_id() {
        let req = Request::new(9, RequestKind::GetGasPrice, "eth_gasPrice", vec![]);
        let value: Value = serde_json::from_slice(&req.encode().unwrap()).unwrap();
        assert_eq!(value["id"], json!(9));
        assert_eq!(value["method"], json!("eth_gasPrice"));
    }

    #[test]
    fn test_target_index() {
        let req = Request::new(1, RequestKind::GetBalance, "eth_getBalance", vec![]).with_target(3);
        assert_eq!(req.target_index(), Some(3));
        assert_eq!(req.first_param_str(), None);
    }
}
