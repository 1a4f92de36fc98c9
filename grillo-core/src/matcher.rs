//! # Matcher Engine
//!
//! Selects the rule answering a request.
//!
//! [`find`] is a pure function of the rule snapshot, the method and the request payload: the
//! same inputs always select the same rule, which keeps it trivially safe to call from any
//! number of concurrent calls.
//!
//! ## Comparison semantics
//!
//! * **Exact**: structural equality. Numbers compare by value, and a number equals a string
//!   holding the same number (protobuf JSON renders 64-bit integers as strings). Within
//!   objects, a key missing on one side equals a default value (`null`, `false`, `0`, `""`,
//!   `[]`, `{}`) on the other, since proto3 may or may not emit defaults. The same holds for
//!   the field a predicate points at.
//! * **Partial**: only keys present in the expectation are compared, recursively. Arrays must
//!   have the same length and match element-wise.
//! * **Regex**: the field's textual value must match the expression.
use crate::{
    registry::MethodKey,
    rules::{Comparison, Predicate, Rule, RuleStore},
};
use serde_json::{Number, Value};
use std::sync::Arc;

/// The rule selected for a request.
#[derive(Debug, Clone, Copy)]
pub enum MatchOutcome<'a> {
    /// The first rule, in document order, whose predicates all hold.
    Matched(&'a Arc<Rule>),
    /// No specific rule held; the method's fallback applies.
    Fallback(&'a Arc<Rule>),
    NoMatch,
}

impl<'a> MatchOutcome<'a> {
    pub fn rule(&self) -> Option<&'a Arc<Rule>> {
        match self {
            MatchOutcome::Matched(rule) | MatchOutcome::Fallback(rule) => Some(rule),
            MatchOutcome::NoMatch => None,
        }
    }
}

/// Finds the rule answering `payload` for `method`.
pub fn find<'a>(store: &'a RuleStore, method: &MethodKey, payload: &Value) -> MatchOutcome<'a> {
    let Some(rules) = store.rules_for(method) else {
        return MatchOutcome::NoMatch;
    };

    if let Some(rule) = rules.rules.iter().find(|rule| rule_matches(rule, payload)) {
        return MatchOutcome::Matched(rule);
    }

    match &rules.fallback {
        Some(rule) => MatchOutcome::Fallback(rule),
        None => MatchOutcome::NoMatch,
    }
}

/// A rule matches when every one of its predicates holds.
pub fn rule_matches(rule: &Rule, payload: &Value) -> bool {
    rule.predicates
        .iter()
        .all(|predicate| predicate_matches(predicate, payload))
}

pub fn predicate_matches(predicate: &Predicate, payload: &Value) -> bool {
    let Some(actual) = lookup(payload, &predicate.path) else {
        // An absent field holds its default value.
        return match &predicate.comparison {
            Comparison::Exact(expected) | Comparison::Partial(expected) => is_default(expected),
            Comparison::Regex(_) => false,
        };
    };

    match &predicate.comparison {
        Comparison::Exact(expected) => exact_eq(expected, actual),
        Comparison::Partial(expected) => partial_eq(expected, actual),
        Comparison::Regex(regex) => match actual {
            Value::String(s) => regex.is_match(s),
            Value::Number(n) => regex.is_match(&n.to_string()),
            Value::Bool(b) => regex.is_match(&b.to_string()),
            _ => false,
        },
    }
}

/// Follows a dot separated path. Numeric segments index arrays.
fn lookup<'v>(payload: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter().try_fold(payload, |current, segment| match current {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn exact_eq(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => {
            let keys_of_expected = expected.iter().all(|(key, value)| match actual.get(key) {
                Some(other) => exact_eq(value, other),
                None => is_default(value),
            });
            let extra_are_default = actual
                .iter()
                .filter(|(key, _)| !expected.contains_key(*key))
                .all(|(_, value)| is_default(value));

            keys_of_expected && extra_are_default
        }
        (Value::Array(expected), Value::Array(actual)) => {
            expected.len() == actual.len()
                && expected.iter().zip(actual).all(|(e, a)| exact_eq(e, a))
        }
        _ => scalar_eq(expected, actual),
    }
}

fn partial_eq(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(expected), Value::Object(actual)) => {
            expected.iter().all(|(key, value)| match actual.get(key) {
                Some(other) => partial_eq(value, other),
                None => is_default(value),
            })
        }
        (Value::Array(expected), Value::Array(actual)) => {
            expected.len() == actual.len()
                && expected.iter().zip(actual).all(|(e, a)| partial_eq(e, a))
        }
        _ => scalar_eq(expected, actual),
    }
}

fn scalar_eq(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => number_eq(a, b),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            parse_number(s).is_some_and(|parsed| number_eq(n, &parsed))
        }
        _ => expected == actual,
    }
}

fn number_eq(a: &Number, b: &Number) -> bool {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a == b;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn parse_number(value: &str) -> Option<Number> {
    let value = value.trim();
    if let Ok(int) = value.parse::<i64>() {
        return Some(Number::from(int));
    }
    if let Ok(uint) = value.parse::<u64>() {
        return Some(Number::from(uint));
    }
    value.parse::<f64>().ok().and_then(Number::from_f64)
}

fn is_default(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}
