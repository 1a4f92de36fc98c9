//! # Rule Store
//!
//! Loads the declarative rule document and indexes it by method.
//!
//! ## Ordering
//!
//! Rules of a method keep the order in which they appear in the document and the
//! [matcher](crate::matcher) picks the first rule whose predicates all hold. A rule without
//! predicates is the method's **fallback**: it is kept aside and only consulted when no other
//! rule matches. Each method accepts at most one fallback.
//!
//! ## Validation
//!
//! Loading fails fast on anything that would otherwise surface as a broken call:
//! references to unknown methods, payloads that do not fit the method's response message,
//! invalid regular expressions or templates, stream actions on methods that reply with a
//! single message, and unknown status codes.
//!
//! ## Hot reload
//!
//! A [`RuleStore`] is immutable. [`RulesHandle`] holds the active snapshot and swaps it
//! atomically; calls keep the snapshot they started with.
pub mod document;

use crate::{
    registry::{MethodKey, Registry, Resolution, StreamingMode},
    status::{self, ErrorStatus},
    template,
};
use arc_swap::ArcSwap;
use document::{
    ActionEntry, CodeEntry, MatchMode, PredicateEntry, RuleDocument, RuleEntry, StatusEntry,
};
use prost_reflect::{DeserializeOptions, DynamicMessage, FieldDescriptor, Kind, MessageDescriptor};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tonic::Code;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Failed to read rule document '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON rule document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid YAML rule document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Rule #{index}: method '{method}' is not registered")]
    UnknownMethod { index: usize, method: String },
    #[error("Rule #{index}: method '{method}' is ambiguous, candidates: {candidates}")]
    AmbiguousMethod {
        index: usize,
        method: String,
        candidates: String,
    },
    #[error("Rule #{index}: method '{method}' already has a fallback rule (rule #{previous})")]
    DuplicateRule {
        index: usize,
        method: MethodKey,
        previous: usize,
    },
    #[error("Rule #{index}: payload does not match message '{message}': {source}")]
    InvalidPayload {
        index: usize,
        message: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Rule #{index}: invalid template: {source}")]
    InvalidTemplate {
        index: usize,
        #[source]
        source: handlebars::TemplateError,
    },
    #[error("Rule #{index}: invalid regular expression: {source}")]
    InvalidPredicate {
        index: usize,
        #[source]
        source: regex::Error,
    },
    #[error("Rule #{index}: field '{field}' does not exist in message '{message}'")]
    UnknownField {
        index: usize,
        field: String,
        message: String,
    },
    #[error("Rule #{index}: regex predicates expect a string value")]
    RegexNotString { index: usize },
    #[error("Rule #{index}: a stream action cannot answer {mode} method '{method}'")]
    IncompatibleAction {
        index: usize,
        method: MethodKey,
        mode: StreamingMode,
    },
    #[error("Rule #{index}: invalid status code '{code}'")]
    InvalidStatusCode { index: usize, code: String },
    #[error("Rule #{index}: invalid metadata entry '{key}'")]
    InvalidMetadata { index: usize, key: String },
}

/// How a predicate compares the selected request field with its expectation.
#[derive(Debug, Clone)]
pub enum Comparison {
    /// Structural, type-aware equality.
    Exact(Value),
    /// Only the fields present in the expectation must match.
    Partial(Value),
    /// The field's textual value must match the expression.
    Regex(Regex),
}

/// A single condition over the request payload.
#[derive(Debug, Clone)]
pub struct Predicate {
    /// Path segments into the request. Never empty.
    pub path: Vec<String>,
    pub comparison: Comparison,
}

/// A payload streamed back to the peer.
#[derive(Debug, Clone)]
pub struct StreamItem {
    pub payload: Value,
    pub delay: Duration,
}

/// What a rule answers with.
#[derive(Debug, Clone)]
pub enum Action {
    /// A single response message, after an optional delay.
    Response { payload: Value, delay: Duration },
    /// A terminal error status, after an optional delay.
    Error { status: ErrorStatus, delay: Duration },
    /// A sequence of messages and a terminal status (`None` means `OK`).
    Stream {
        items: Vec<StreamItem>,
        status: Option<ErrorStatus>,
    },
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// Position of the rule in its document.
    pub index: usize,
    pub method: MethodKey,
    pub predicates: Vec<Predicate>,
    pub action: Action,
}

impl Rule {
    pub fn is_fallback(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// The rules of a single method.
#[derive(Debug, Clone, Default)]
pub struct MethodRules {
    /// Specific rules, in document order.
    pub rules: Vec<Arc<Rule>>,
    pub fallback: Option<Arc<Rule>>,
}

/// Immutable index of rules by method.
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    methods: HashMap<MethodKey, MethodRules>,
    origin: Option<PathBuf>,
}

impl RuleStore {
    /// Loads a rule document from disk. `.yaml`/`.yml` files are parsed as YAML, anything else
    /// as JSON.
    pub fn from_path(registry: &Registry, path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        let document: RuleDocument = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        let mut store = Self::from_entries(registry, document.into_entries())?;
        store.origin = Some(path.to_path_buf());
        Ok(store)
    }

    /// Parses a JSON rule document.
    pub fn from_json(registry: &Registry, json: &str) -> Result<Self, RuleError> {
        let document: RuleDocument = serde_json::from_str(json)?;
        Self::from_entries(registry, document.into_entries())
    }

    /// Validates and indexes already parsed rule entries.
    pub fn from_entries(registry: &Registry, entries: Vec<RuleEntry>) -> Result<Self, RuleError> {
        let mut store = Self::default();

        for (index, entry) in entries.into_iter().enumerate() {
            store.insert(compile_rule(registry, index, entry)?)?;
        }

        Ok(store)
    }

    /// Appends a compiled rule after the ones already indexed for its method.
    pub(crate) fn insert(&mut self, rule: Rule) -> Result<(), RuleError> {
        let slot = self.methods.entry(rule.method.clone()).or_default();

        if !rule.is_fallback() {
            slot.rules.push(Arc::new(rule));
            return Ok(());
        }

        if let Some(previous) = &slot.fallback {
            return Err(RuleError::DuplicateRule {
                index: rule.index,
                method: rule.method,
                previous: previous.index,
            });
        }

        slot.fallback = Some(Arc::new(rule));
        Ok(())
    }

    pub fn rules_for(&self, method: &MethodKey) -> Option<&MethodRules> {
        self.methods.get(method)
    }

    /// The file this store was loaded from, if any.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Total number of rules, fallbacks included.
    pub fn len(&self) -> usize {
        self.methods
            .values()
            .map(|m| m.rules.len() + usize::from(m.fallback.is_some()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared, atomically replaceable handle to the active [`RuleStore`].
#[derive(Debug, Clone)]
pub struct RulesHandle {
    current: Arc<ArcSwap<RuleStore>>,
}

impl RulesHandle {
    pub fn new(store: RuleStore) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(store)),
        }
    }

    /// The snapshot active right now. Holders keep it alive across later reloads.
    pub fn snapshot(&self) -> Arc<RuleStore> {
        self.current.load_full()
    }

    /// Installs a new snapshot. Calls already in flight are unaffected.
    pub fn replace(&self, store: RuleStore) {
        self.current.store(Arc::new(store));
    }
}

impl Default for RulesHandle {
    fn default() -> Self {
        Self::new(RuleStore::default())
    }
}

fn compile_rule(registry: &Registry, index: usize, entry: RuleEntry) -> Result<Rule, RuleError> {
    let method = match registry.resolve(&entry.method) {
        Resolution::Found(key) => key,
        Resolution::NotFound => {
            return Err(RuleError::UnknownMethod {
                index,
                method: entry.method,
            });
        }
        Resolution::Ambiguous(candidates) => {
            return Err(RuleError::AmbiguousMethod {
                index,
                method: entry.method,
                candidates: candidates
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
    };

    // Resolution only succeeds for registered methods.
    let Some(descriptor) = registry.method(&method) else {
        return Err(RuleError::UnknownMethod {
            index,
            method: method.to_string(),
        });
    };
    let mode = StreamingMode::from(descriptor);
    let input = descriptor.input();
    let output = descriptor.output();

    let predicates = entry
        .predicates
        .into_iter()
        .filter_map(|predicate| compile_predicate(index, predicate, &input, mode).transpose())
        .collect::<Result<Vec<_>, _>>()?;

    let action = compile_action(index, entry.action, &output)?;

    if matches!(action, Action::Stream { .. }) && !mode.is_server_streaming() {
        return Err(RuleError::IncompatibleAction {
            index,
            method,
            mode,
        });
    }

    Ok(Rule {
        index,
        method,
        predicates,
        action,
    })
}

/// Predicates without a field always hold, so they are dropped.
fn compile_predicate(
    index: usize,
    entry: PredicateEntry,
    input: &MessageDescriptor,
    mode: StreamingMode,
) -> Result<Option<Predicate>, RuleError> {
    let (field, path): (&str, Vec<String>) = match entry.field.as_deref().map(str::trim) {
        None | Some("") => return Ok(None),
        Some(field) => (field, field.split('.').map(str::to_string).collect()),
    };

    // Assembled request streams are matched as an array of messages.
    let segments = match path.split_first() {
        Some((first, rest)) if mode.is_client_streaming() && is_index(first) => rest,
        _ => &path[..],
    };

    if !message_has_path(input, segments) {
        return Err(RuleError::UnknownField {
            index,
            field: field.to_string(),
            message: input.full_name().to_string(),
        });
    }

    let comparison = match entry.mode {
        MatchMode::Exact => Comparison::Exact(entry.value),
        MatchMode::Partial => Comparison::Partial(entry.value),
        MatchMode::Regex => {
            let Value::String(pattern) = &entry.value else {
                return Err(RuleError::RegexNotString { index });
            };
            let regex = Regex::new(pattern)
                .map_err(|source| RuleError::InvalidPredicate { index, source })?;
            Comparison::Regex(regex)
        }
    };

    Ok(Some(Predicate { path, comparison }))
}

fn is_index(segment: &str) -> bool {
    segment.parse::<usize>().is_ok()
}

/// Whether `path` names something a decoded `message` can hold. Fields go by their `.proto`
/// or JSON name, list elements by index and map values by key. A oneof name is accepted as
/// the last segment.
fn message_has_path(message: &MessageDescriptor, path: &[String]) -> bool {
    let [first, rest @ ..] = path else {
        return true;
    };

    // Well-known types have their own free-form JSON mapping.
    if message.package_name() == "google.protobuf" {
        return true;
    }

    let field = message
        .get_field_by_name(first)
        .or_else(|| message.get_field_by_json_name(first));

    match field {
        Some(field) => field_has_path(&field, rest),
        None => rest.is_empty() && message.oneofs().any(|oneof| oneof.name() == first),
    }
}

fn field_has_path(field: &FieldDescriptor, path: &[String]) -> bool {
    let Some((first, rest)) = path.split_first() else {
        return true;
    };

    if field.is_list() {
        return is_index(first) && kind_has_path(&field.kind(), rest);
    }

    if field.is_map() {
        return match field.kind() {
            Kind::Message(entry) => kind_has_path(&entry.map_entry_value_field().kind(), rest),
            _ => false,
        };
    }

    kind_has_path(&field.kind(), path)
}

fn kind_has_path(kind: &Kind, path: &[String]) -> bool {
    match kind {
        _ if path.is_empty() => true,
        Kind::Message(message) => message_has_path(message, path),
        _ => false,
    }
}

fn compile_action(
    index: usize,
    entry: ActionEntry,
    output: &MessageDescriptor,
) -> Result<Action, RuleError> {
    match entry {
        ActionEntry::Response { payload, delay_ms } => {
            check_payload(index, &payload, output)?;
            Ok(Action::Response {
                payload,
                delay: Duration::from_millis(delay_ms),
            })
        }
        ActionEntry::Error {
            code,
            message,
            metadata,
            delay_ms,
        } => {
            let status = compile_status(
                index,
                StatusEntry {
                    code,
                    message,
                    metadata,
                },
            )?.ok_or(RuleError::InvalidStatusCode {
                index,
                code: "OK".to_string(),
            })?;
            Ok(Action::Error {
                status,
                delay: Duration::from_millis(delay_ms),
            })
        }
        ActionEntry::Stream {
            items,
            delay_ms,
            status,
        } => {
            let items = items
                .into_iter()
                .map(|item| {
                    check_payload(index, &item.payload, output)?;
                    Ok(StreamItem {
                        payload: item.payload,
                        delay: Duration::from_millis(item.delay_ms.unwrap_or(delay_ms)),
                    })
                })
                .collect::<Result<Vec<_>, RuleError>>()?;

            let status = match status {
                Some(status) => compile_status(index, status)?,
                None => None,
            };

            Ok(Action::Stream { items, status })
        }
    }
}

/// Returns `None` for an `OK` status.
fn compile_status(index: usize, entry: StatusEntry) -> Result<Option<ErrorStatus>, RuleError> {
    let code = match &entry.code {
        CodeEntry::Number(number) => status::code_from_number(*number),
        CodeEntry::Name(name) => status::parse_code(name),
    }
    .ok_or_else(|| RuleError::InvalidStatusCode {
        index,
        code: match entry.code {
            CodeEntry::Number(number) => number.to_string(),
            CodeEntry::Name(name) => name,
        },
    })?;

    if code == Code::Ok {
        return Ok(None);
    }

    for (key, value) in &entry.metadata {
        if !status::is_valid_metadata(key, value) {
            return Err(RuleError::InvalidMetadata {
                index,
                key: key.clone(),
            });
        }
    }

    Ok(Some(ErrorStatus {
        code,
        message: entry.message,
        metadata: entry.metadata.into_iter().collect(),
    }))
}

/// Checks a payload against the response message. Templated payloads can only be checked
/// once rendered, so the codec reports their mismatches per call instead.
fn check_payload(index: usize, payload: &Value, output: &MessageDescriptor) -> Result<(), RuleError> {
    let templated =
        template::check(payload).map_err(|source| RuleError::InvalidTemplate { index, source })?;

    if templated {
        return Ok(());
    }

    DynamicMessage::deserialize_with_options(
        output.clone(),
        payload.clone(),
        &DeserializeOptions::new().deny_unknown_fields(true),
    )
    .map_err(|source| RuleError::InvalidPayload {
        index,
        message: output.full_name().to_string(),
        source,
    })?;

    Ok(())
}
