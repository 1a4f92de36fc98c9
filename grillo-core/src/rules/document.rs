//! Serde model of the rule document as written on disk.
//!
//! ```json
//! [
//!   {
//!     "method": "echo.Echo/Say",
//!     "predicates": [{ "field": "text", "value": "ping", "mode": "exact" }],
//!     "action": { "type": "response", "payload": { "text": "pong" } }
//!   },
//!   {
//!     "method": "echo.Echo/Say",
//!     "action": { "type": "error", "code": "NOT_FOUND", "message": "no such text" }
//!   }
//! ]
//! ```
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The top level of a rule document: a bare list, or an object with a `rules` list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RuleDocument {
    List(Vec<RuleEntry>),
    Wrapped { rules: Vec<RuleEntry> },
}

impl RuleDocument {
    pub fn into_entries(self) -> Vec<RuleEntry> {
        match self {
            RuleDocument::List(entries) => entries,
            RuleDocument::Wrapped { rules } => rules,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    /// `package.Service/Method`, or a bare method name when it is unambiguous.
    pub method: String,
    #[serde(default)]
    pub predicates: Vec<PredicateEntry>,
    pub action: ActionEntry,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PredicateEntry {
    /// Dot separated path into the request (`meta.origin`, `tags.0`).
    /// A predicate without a field matches every request.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub mode: MatchMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    Partial,
    Regex,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ActionEntry {
    Response {
        #[serde(default = "empty_object")]
        payload: serde_json::Value,
        #[serde(default)]
        delay_ms: u64,
    },
    Error {
        code: CodeEntry,
        #[serde(default)]
        message: String,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
        #[serde(default)]
        delay_ms: u64,
    },
    Stream {
        #[serde(default)]
        items: Vec<StreamItemEntry>,
        /// Default delay before each item.
        #[serde(default)]
        delay_ms: u64,
        /// Terminal status. Absent means the stream ends with `OK`.
        #[serde(default)]
        status: Option<StatusEntry>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StatusEntry {
    pub code: CodeEntry,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A status code written either as a number (`5`) or a name (`"NOT_FOUND"`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CodeEntry {
    Number(i32),
    Name(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StreamItemEntry {
    pub payload: serde_json::Value,
    /// Overrides the stream's default delay for this item.
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}
