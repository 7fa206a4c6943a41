//! Operation and reply types shared by the store, the guest and the host.
//!
//! An [`Operation`] maps onto a JSON-RPC call: the variant name becomes the
//! method and its fields become the params. Byte strings travel hex-encoded.

use crate::error::{RaveError, Result};
use serde::{Deserialize, Serialize};

/// Byte string key or value. Hex-encoded when serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blob(#[serde(with = "hex::serde")] pub Vec<u8>);

impl Blob {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob(bytes)
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        Blob(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Blob {
    fn from(bytes: &[u8; N]) -> Self {
        Blob(bytes.to_vec())
    }
}

impl From<&str> for Blob {
    fn from(s: &str) -> Self {
        Blob(s.as_bytes().to_vec())
    }
}

impl From<String> for Blob {
    fn from(s: String) -> Self {
        Blob(s.into_bytes())
    }
}

/// Key bounds, direction and limit for iteration and range deletes.
///
/// `gt` takes precedence over `gte`, and `lt` over `lte`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Blob>,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl KeyRange {
    /// Every key, ascending.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<Blob>) -> Self {
        let prefix = prefix.into();
        let upper = prefix_successor(prefix.as_slice());
        Self {
            gte: Some(prefix),
            lt: upper.map(Blob),
            ..Self::default()
        }
    }

    pub fn gt(mut self, key: impl Into<Blob>) -> Self {
        self.gt = Some(key.into());
        self
    }

    pub fn gte(mut self, key: impl Into<Blob>) -> Self {
        self.gte = Some(key.into());
        self
    }

    pub fn lt(mut self, key: impl Into<Blob>) -> Self {
        self.lt = Some(key.into());
        self
    }

    pub fn lte(mut self, key: impl Into<Blob>) -> Self {
        self.lte = Some(key.into());
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Smallest key greater than every key that starts with `prefix`.
/// `None` when no such key exists (empty prefix or all `0xff`).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchOp {
    Put { key: Blob, value: Blob },
    Del { key: Blob },
}

impl BatchOp {
    pub fn put(key: impl Into<Blob>, value: impl Into<Blob>) -> Self {
        BatchOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<Blob>) -> Self {
        BatchOp::Del { key: key.into() }
    }
}

/// A key/value pair returned by iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Blob,
    pub value: Blob,
}

/// A single store operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Operation {
    Get { key: Blob },
    GetMany { keys: Vec<Blob> },
    Put { key: Blob, value: Blob },
    Del { key: Blob },
    Batch { ops: Vec<BatchOp> },
    Iterate { range: KeyRange },
    Clear { range: KeyRange },
}

impl Operation {
    pub const METHODS: [&'static str; 7] =
        ["get", "get_many", "put", "del", "batch", "iterate", "clear"];

    /// JSON-RPC method name for this operation.
    pub fn method(&self) -> &'static str {
        match self {
            Operation::Get { .. } => "get",
            Operation::GetMany { .. } => "get_many",
            Operation::Put { .. } => "put",
            Operation::Del { .. } => "del",
            Operation::Batch { .. } => "batch",
            Operation::Iterate { .. } => "iterate",
            Operation::Clear { .. } => "clear",
        }
    }

    /// True for operations that only read.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Operation::Get { .. } | Operation::GetMany { .. } | Operation::Iterate { .. }
        )
    }

    /// Split into a JSON-RPC method name and params object.
    pub fn into_call(self) -> Result<(String, serde_json::Value)> {
        let mut value = serde_json::to_value(&self)?;
        let params = value
            .get_mut("params")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::json!({}));
        Ok((self.method().to_string(), params))
    }

    /// Rebuild an operation from a JSON-RPC method name and params object.
    pub fn from_call(method: &str, params: serde_json::Value) -> Result<Self> {
        if !Self::METHODS.contains(&method) {
            return Err(RaveError::UnknownMethod {
                method: method.to_string(),
            });
        }
        serde_json::from_value(serde_json::json!({ "method": method, "params": params })).map_err(
            |e| RaveError::Validation {
                field: "params".to_string(),
                message: format!("Invalid params for {}: {}", method, e),
            },
        )
    }
}

/// Result of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Done,
    Value(Option<Blob>),
    Values(Vec<Option<Blob>>),
    Entries(Vec<Entry>),
}

impl Reply {
    pub fn into_done(self) -> Result<()> {
        match self {
            Reply::Done => Ok(()),
            other => Err(unexpected("done", &other)),
        }
    }

    pub fn into_value(self) -> Result<Option<Vec<u8>>> {
        match self {
            Reply::Value(value) => Ok(value.map(Blob::into_vec)),
            other => Err(unexpected("value", &other)),
        }
    }

    pub fn into_values(self) -> Result<Vec<Option<Vec<u8>>>> {
        match self {
            Reply::Values(values) => Ok(values
                .into_iter()
                .map(|v| v.map(Blob::into_vec))
                .collect()),
            other => Err(unexpected("values", &other)),
        }
    }

    pub fn into_entries(self) -> Result<Vec<Entry>> {
        match self {
            Reply::Entries(entries) => Ok(entries),
            other => Err(unexpected("entries", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Reply) -> RaveError {
    RaveError::Validation {
        field: "reply".to_string(),
        message: format!("expected {} reply, got {:?}", expected, got),
    }
}
