//! Value types carried by client events and commands.

use crate::error::Result;
use crate::units;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A locally known account and its last fetched figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub hash: String,
    /// Balance in ether, once fetched.
    pub balance: Option<String>,
    pub transaction_count: Option<u64>,
}

impl AccountInfo {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            balance: None,
            transaction_count: None,
        }
    }
}

/// Sync progress as last reported by the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub syncing: bool,
    pub current_block: u64,
    pub highest_block: u64,
    pub starting_block: u64,
}

/// Transaction fields as returned by `eth_getTransactionByHash`.
///
/// Quantities stay in the node's hex encoding; accessors decode the ones
/// collaborators usually display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionInfo {
    pub hash: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<String>,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    pub nonce: Option<String>,
    pub input: Option<String>,
    pub block_hash: Option<String>,
    pub block_number: Option<String>,
    pub transaction_index: Option<String>,
}

impl TransactionInfo {
    /// Build from a JSON object, ignoring unknown or mistyped fields.
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            hash: field("hash"),
            from: field("from"),
            to: field("to"),
            value: field("value"),
            gas: field("gas"),
            gas_price: field("gasPrice"),
            nonce: field("nonce"),
            input: field("input"),
            block_hash: field("blockHash"),
            block_number: field("blockNumber"),
            transaction_index: field("transactionIndex"),
        }
    }

    /// Transferred value in ether.
    pub fn value_ether(&self) -> Option<String> {
        let wei = units::parse_hex(self.value.as_deref()?).ok()?;
        Some(units::wei_to_ether(wei))
    }

    /// Block the transaction was mined in; `None` while pending.
    pub fn block_number(&self) -> Option<u64> {
        let number = units::parse_hex(self.block_number.as_deref()?).ok()?;
        u64::try_from(number).ok()
    }

    pub fn is_pending(&self) -> bool {
        self.block_hash.is_none() || self.block_number.is_none()
    }
}

/// Transaction parameters as entered by a user.
///
/// `value` and `gas_price` are decimal ether amounts and `gas` is a decimal
/// integer; [`TransactionRequest::to_params`] encodes them for the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    pub data: Option<String>,
}

impl TransactionRequest {
    pub fn new(from: impl Into<String>, to: impl Into<String>, value: impl Into<String>) -> Self {
        let to = to.into();
        Self {
            from: from.into(),
            to: (!to.is_empty()).then_some(to),
            value: value.into(),
            ..Self::default()
        }
    }

    pub fn with_gas(mut self, gas: impl Into<String>) -> Self {
        self.gas = Some(gas.into());
        self
    }

    pub fn with_gas_price(mut self, gas_price: impl Into<String>) -> Self {
        self.gas_price = Some(gas_price.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Encode as the node's transaction object. Empty optional fields are
    /// left out.
    pub fn to_params(&self) -> Result<Value> {
        let mut object = Map::new();
        object.insert("from".into(), Value::String(self.from.clone()));
        object.insert(
            "value".into(),
            Value::String(units::ether_to_hex_wei(&self.value)?),
        );
        if let Some(to) = non_empty(&self.to) {
            object.insert("to".into(), Value::String(to.to_string()));
        }
        if let Some(gas) = non_empty(&self.gas) {
            object.insert("gas".into(), Value::String(units::decimal_to_hex(gas)?));
        }
        if let Some(gas_price) = non_empty(&self.gas_price) {
            object.insert(
                "gasPrice".into(),
                Value::String(units::ether_to_hex_wei(gas_price)?),
            );
        }
        if let Some(data) = non_empty(&self.data) {
            object.insert("data".into(), Value::String(units::hex_prefixed(data)));
        }
        Ok(Value::Object(object))
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}
