//! Condition trees and their evaluation against a signal set.
//!
//! Evaluation is pure: the same tree over the same signals always yields the
//! same verdict and the same evidence. Every child of `All`/`Any` is visited,
//! so evidence is the union of all satisfied leaves even when the node as a
//! whole fails.

use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Signal, SignalKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("definition is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("missing `{0}`")]
    MissingField(&'static str),
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),
    #[error("unknown signal kind `{0}`")]
    UnknownSignalKind(String),
    #[error("unknown severity `{0}`")]
    UnknownSeverity(String),
    #[error("malformed condition: {0}")]
    Malformed(String),
}

/// Signal kinds rules may reference.
#[derive(Debug, Clone, Default)]
pub struct SignalCatalog {
    extra: BTreeSet<String>,
}

impl SignalCatalog {
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extra: extra.into_iter().map(Into::into).collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<SignalKind, DefinitionError> {
        let kind = SignalKind::from_name(name);
        if kind.is_built_in() || self.extra.contains(name) {
            Ok(kind)
        } else {
            Err(DefinitionError::UnknownSignalKind(name.to_string()))
        }
    }

    pub fn kinds(&self) -> Vec<SignalKind> {
        SignalKind::BUILT_IN
            .iter()
            .cloned()
            .chain(self.extra.iter().map(|name| SignalKind::from_name(name)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl Operator {
    pub fn parse(name: &str) -> Result<Self, DefinitionError> {
        match name {
            "eq" => Ok(Operator::Eq),
            "neq" | "ne" => Ok(Operator::Neq),
            "gt" => Ok(Operator::Gt),
            "gte" => Ok(Operator::Gte),
            "lt" => Ok(Operator::Lt),
            "lte" => Ok(Operator::Lte),
            "in" => Ok(Operator::In),
            other => Err(DefinitionError::UnknownOperator(other.to_string())),
        }
    }

    /// Compares `actual` against `expected`. Numbers compare by value whatever
    /// their JSON representation; ordering operators only apply to numbers.
    pub fn compare(&self, actual: &Value, expected: &Value) -> bool {
        if actual.is_null() {
            return false;
        }
        match self {
            Operator::Eq => values_equal(actual, expected),
            Operator::Neq => !values_equal(actual, expected),
            Operator::Gt => numeric(actual, expected, |a, b| a > b),
            Operator::Gte => numeric(actual, expected, |a, b| a >= b),
            Operator::Lt => numeric(actual, expected, |a, b| a < b),
            Operator::Lte => numeric(actual, expected, |a, b| a <= b),
            Operator::In => match expected {
                Value::Array(options) => options.iter().any(|option| values_equal(actual, option)),
                _ => false,
            },
        }
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(af), Some(bf)) => af == bf,
            _ => false,
        },
        _ => actual == expected,
    }
}

fn numeric(actual: &Value, bound: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), bound.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// One operator applied to a field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    Compare(Operator, Value),
    /// Applies the nested criteria to the field's length; scalars count as 1.
    Count(Vec<Criterion>),
}

impl Criterion {
    /// Decodes the criteria given for one `where` field. A scalar is
    /// shorthand for `eq`.
    fn parse_all(field: &str, criteria: &Value) -> Result<Vec<Criterion>, DefinitionError> {
        match criteria {
            Value::Object(ops) if ops.is_empty() => {
                let reason = format!("no operator given for `{field}`");
                Err(DefinitionError::Malformed(reason))
            }
            Value::Object(ops) => ops
                .iter()
                .map(|(op, value)| match op.as_str() {
                    "count" => Ok(Criterion::Count(Self::parse_all(field, value)?)),
                    other => Ok(Criterion::Compare(Operator::parse(other)?, value.clone())),
                })
                .collect(),
            scalar => Ok(vec![Criterion::Compare(Operator::Eq, scalar.clone())]),
        }
    }

    fn holds(&self, actual: &Value) -> bool {
        match self {
            Criterion::Compare(operator, expected) => operator.compare(actual, expected),
            Criterion::Count(nested) => {
                let count = match actual {
                    Value::Array(items) => items.len(),
                    _ => 1,
                };
                let count = Value::from(count);
                nested.iter().all(|criterion| criterion.holds(&count))
            }
        }
    }
}

/// Criteria on one field of a signal kind; a single signal has to satisfy
/// all of them. `field_path: None` means the signal score.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub signal_kind: SignalKind,
    pub field_path: Option<String>,
    pub criteria: Vec<Criterion>,
}

impl Leaf {
    fn satisfied_by(&self, signal: &Signal) -> bool {
        let actual = match &self.field_path {
            None => Value::from(signal.score),
            Some(path) => match signal.payload_field(path) {
                Some(value) => value.clone(),
                None => return false,
            },
        };
        if actual.is_null() {
            return false;
        }
        self.criteria.iter().all(|criterion| criterion.holds(&actual))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Leaf(Leaf),
    /// True when at least one signal of the kind is in scope.
    Exists(SignalKind),
}

/// Verdict plus the ids of signals that satisfied a leaf, in first-seen order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluation {
    pub matched: bool,
    pub evidence: Vec<Uuid>,
}

impl Condition {
    /// Decodes the `when` clause of a playbook definition.
    pub fn from_json(value: &Value, catalog: &SignalCatalog) -> Result<Self, DefinitionError> {
        let node = value
            .as_object()
            .ok_or_else(|| DefinitionError::Malformed(format!("expected an object, got {value}")))?;

        match (node.get("all"), node.get("any"), node.get("signal")) {
            (Some(children), None, None) => Ok(Condition::All(Self::children(children, catalog)?)),
            (None, Some(children), None) => Ok(Condition::Any(Self::children(children, catalog)?)),
            (None, None, Some(kind)) => Self::signal_clause(kind, node, catalog),
            (None, None, None) => Err(DefinitionError::Malformed(
                "condition needs one of `all`, `any` or `signal`".to_string(),
            )),
            _ => Err(DefinitionError::Malformed(
                "condition mixes `all`, `any` and `signal`".to_string(),
            )),
        }
    }

    fn children(
        value: &Value,
        catalog: &SignalCatalog,
    ) -> Result<Vec<Condition>, DefinitionError> {
        value
            .as_array()
            .ok_or_else(|| DefinitionError::Malformed("`all`/`any` expects a list".to_string()))?
            .iter()
            .map(|child| Self::from_json(child, catalog))
            .collect()
    }

    fn signal_clause(
        kind: &Value,
        node: &Map<String, Value>,
        catalog: &SignalCatalog,
    ) -> Result<Self, DefinitionError> {
        let kind_name = kind
            .as_str()
            .ok_or_else(|| DefinitionError::Malformed("`signal` must be a string".to_string()))?;
        let signal_kind = catalog.resolve(kind_name)?;

        let clauses = match node.get("where") {
            None | Some(Value::Null) => return Ok(Condition::Exists(signal_kind)),
            Some(Value::Object(clauses)) if clauses.is_empty() => {
                return Ok(Condition::Exists(signal_kind))
            }
            Some(Value::Object(clauses)) => clauses,
            Some(_) => {
                return Err(DefinitionError::Malformed("`where` must be an object".to_string()))
            }
        };

        let mut leaves = Vec::new();
        for (field, criteria) in clauses {
            let field_path = if field == "score" {
                None
            } else {
                Some(field.clone())
            };
            leaves.push(Condition::Leaf(Leaf {
                signal_kind: signal_kind.clone(),
                field_path,
                criteria: Criterion::parse_all(field, criteria)?,
            }));
        }

        if leaves.len() == 1 {
            Ok(leaves.remove(0))
        } else {
            Ok(Condition::All(leaves))
        }
    }

    pub fn evaluate(&self, signals: &[Signal]) -> Evaluation {
        let mut evidence = Evidence::default();
        let matched = self.visit(signals, &mut evidence);
        Evaluation {
            matched,
            evidence: evidence.ids,
        }
    }

    fn visit(&self, signals: &[Signal], evidence: &mut Evidence) -> bool {
        match self {
            Condition::All(children) => children
                .iter()
                .map(|child| child.visit(signals, evidence))
                .fold(true, |acc, matched| acc && matched),
            Condition::Any(children) => children
                .iter()
                .map(|child| child.visit(signals, evidence))
                .fold(false, |acc, matched| acc || matched),
            Condition::Leaf(leaf) => {
                let mut matched = false;
                for signal in signals.iter().filter(|s| s.kind == leaf.signal_kind) {
                    if leaf.satisfied_by(signal) {
                        evidence.push(signal.id);
                        matched = true;
                    }
                }
                matched
            }
            Condition::Exists(kind) => {
                let mut matched = false;
                for signal in signals.iter().filter(|s| &s.kind == kind) {
                    evidence.push(signal.id);
                    matched = true;
                }
                matched
            }
        }
    }
}

#[derive(Default)]
struct Evidence {
    seen: HashSet<Uuid>,
    ids: Vec<Uuid>,
}

impl Evidence {
    fn push(&mut self, id: Uuid) {
        if self.seen.insert(id) {
            self.ids.push(id);
        }
    }
}
