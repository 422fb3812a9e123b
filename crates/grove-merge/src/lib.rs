#![forbid(unsafe_code)]

//! Multi-table merge chains.
//!
//! A raw [`KeySpec`] is normalized into one [`KeyPair`] per join step, the
//! whole chain is validated against the table schemas, and only then are the
//! pairwise inner joins executed left to right.

use std::{borrow::Borrow, borrow::Cow, collections::HashSet, fmt};

use grove_frame::DataFrame;
use grove_join::{
    JoinError, JoinExecutionOptions, JoinOptions, Suffixes, inner_join_with_options,
    shared_columns,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeySpecError {
    #[error("key specification not supported: {spec}")]
    UnsupportedSpec { spec: String },
    #[error("key specification element {position} has an unsupported shape: {element}")]
    UnsupportedElement { position: usize, element: String },
    #[error("key specification has {actual} join step(s), expected {expected}")]
    StepCountMismatch { expected: usize, actual: usize },
    #[error("key specification element {position} has an empty key")]
    EmptyKey { position: usize },
    #[error("join step {step} infers only one side of its key")]
    HalfNatural { step: usize },
}

/// One element of a stepwise key specification: how table `i` joins table `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpecElement {
    SameName(String),
    Pair(String, String),
    MultiSame(Vec<String>),
    MultiPair(Vec<String>, Vec<String>),
    Natural,
}

impl From<&str> for KeySpecElement {
    fn from(value: &str) -> Self {
        Self::SameName(value.to_owned())
    }
}

impl From<(&str, &str)> for KeySpecElement {
    fn from((left, right): (&str, &str)) -> Self {
        Self::Pair(left.to_owned(), right.to_owned())
    }
}

/// User-supplied join key specification.
///
/// Deserializes from the nested-list notation:
/// `null`, `"id"`, or a list with one element per join step where each
/// element is `"id"`, `["left", "right"]`, `[["a", "b"]]`,
/// `[["l1", "l2"], ["r1", "r2"]]` or `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum KeySpec {
    #[default]
    Absent,
    Single(String),
    Steps(Vec<KeySpecElement>),
}

impl KeySpec {
    pub fn steps<I, E>(elements: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<KeySpecElement>,
    {
        Self::Steps(elements.into_iter().map(Into::into).collect())
    }

    pub fn from_json(value: &Value) -> Result<Self, KeySpecError> {
        match value {
            Value::Null => Ok(Self::Absent),
            Value::String(_) | Value::Number(_) => column_name(value)
                .map(Self::Single)
                .ok_or_else(|| unsupported_spec(value)),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(position, item)| parse_element(position, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Steps),
            Value::Bool(_) | Value::Object(_) => Err(unsupported_spec(value)),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Absent => Value::Null,
            Self::Single(name) => Value::String(name.clone()),
            Self::Steps(elements) => Value::Array(elements.iter().map(element_to_json).collect()),
        }
    }
}

impl From<&str> for KeySpec {
    fn from(value: &str) -> Self {
        Self::Single(value.to_owned())
    }
}

impl From<String> for KeySpec {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl TryFrom<Value> for KeySpec {
    type Error = KeySpecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(&value)
    }
}

impl From<KeySpec> for Value {
    fn from(spec: KeySpec) -> Self {
        spec.to_json()
    }
}

/// Nesting depth of a key specification fragment: scalars are 0, a list is
/// one more than its first element.
#[must_use]
pub fn key_spec_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.first().map_or(0, key_spec_depth),
        _ => 0,
    }
}

fn unsupported_spec(value: &Value) -> KeySpecError {
    KeySpecError::UnsupportedSpec {
        spec: value.to_string(),
    }
}

fn unsupported_element(position: usize, value: &Value) -> KeySpecError {
    KeySpecError::UnsupportedElement {
        position,
        element: value.to_string(),
    }
}

// Integer column names are accepted, as headerless tables are named 0, 1, ...
fn column_name(value: &Value) -> Option<String> {
    match value {
        Value::String(name) => Some(name.clone()),
        Value::Number(number) if number.is_u64() || number.is_i64() => Some(number.to_string()),
        _ => None,
    }
}

fn column_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => items.iter().map(column_name).collect(),
        _ => None,
    }
}

fn parse_element(position: usize, value: &Value) -> Result<KeySpecElement, KeySpecError> {
    if value.is_null() {
        return Ok(KeySpecElement::Natural);
    }
    let invalid = || unsupported_element(position, value);
    match (key_spec_depth(value), value) {
        (0, _) => column_name(value)
            .map(KeySpecElement::SameName)
            .ok_or_else(invalid),
        (1, Value::Array(items)) if items.len() == 2 => {
            let names = column_list(value).ok_or_else(invalid)?;
            let [left, right]: [String; 2] = names.try_into().map_err(|_| invalid())?;
            Ok(KeySpecElement::Pair(left, right))
        }
        (2, Value::Array(items)) => match items.as_slice() {
            [same] => column_list(same)
                .map(KeySpecElement::MultiSame)
                .ok_or_else(invalid),
            [left, right] => match (column_list(left), column_list(right)) {
                (Some(left), Some(right)) => Ok(KeySpecElement::MultiPair(left, right)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

fn element_to_json(element: &KeySpecElement) -> Value {
    let names = |names: &[String]| Value::Array(names.iter().cloned().map(Value::String).collect());
    match element {
        KeySpecElement::SameName(name) => Value::String(name.clone()),
        KeySpecElement::Pair(left, right) => {
            Value::Array(vec![Value::String(left.clone()), Value::String(right.clone())])
        }
        KeySpecElement::MultiSame(same) => Value::Array(vec![names(same)]),
        KeySpecElement::MultiPair(left, right) => Value::Array(vec![names(left), names(right)]),
        KeySpecElement::Natural => Value::Null,
    }
}

/// One side of a normalized join step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRef {
    Single(String),
    Multi(Vec<String>),
    /// Join on the column names shared by both sides at that step.
    Natural,
}

impl KeyRef {
    /// Column names this key refers to; empty for `Natural`.
    #[must_use]
    pub fn names(&self) -> &[String] {
        match self {
            Self::Single(name) => std::slice::from_ref(name),
            Self::Multi(names) => names,
            Self::Natural => &[],
        }
    }

    #[must_use]
    pub fn is_natural(&self) -> bool {
        matches!(self, Self::Natural)
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(name) => write!(f, "'{name}'"),
            Self::Multi(names) => write!(f, "[{}]", names.join(", ")),
            Self::Natural => f.write_str("<natural>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPair {
    pub left: KeyRef,
    pub right: KeyRef,
}

impl KeyPair {
    #[must_use]
    pub fn new(left: KeyRef, right: KeyRef) -> Self {
        Self { left, right }
    }

    #[must_use]
    pub fn same(key: KeyRef) -> Self {
        Self {
            left: key.clone(),
            right: key,
        }
    }

    #[must_use]
    pub fn natural() -> Self {
        Self::same(KeyRef::Natural)
    }
}

/// Exactly one key pair per join step. Either both sides of a pair are
/// `Natural` or neither is, and no key is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<KeyPair>", into = "Vec<KeyPair>")]
pub struct NormalizedKeySpec {
    pairs: Vec<KeyPair>,
}

impl NormalizedKeySpec {
    pub fn from_pairs(pairs: Vec<KeyPair>) -> Result<Self, KeySpecError> {
        for (step, pair) in pairs.iter().enumerate() {
            if pair.left.is_natural() != pair.right.is_natural() {
                return Err(KeySpecError::HalfNatural { step });
            }
            for key in [&pair.left, &pair.right] {
                let empty = match key {
                    KeyRef::Natural => false,
                    KeyRef::Single(name) => name.is_empty(),
                    KeyRef::Multi(names) => names.is_empty() || names.iter().any(String::is_empty),
                };
                if empty {
                    return Err(KeySpecError::EmptyKey { position: step });
                }
            }
        }
        Ok(Self { pairs })
    }

    #[must_use]
    pub fn pairs(&self) -> &[KeyPair] {
        &self.pairs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyPair> + '_ {
        self.pairs.iter()
    }
}

impl TryFrom<Vec<KeyPair>> for NormalizedKeySpec {
    type Error = KeySpecError;

    fn try_from(pairs: Vec<KeyPair>) -> Result<Self, Self::Error> {
        Self::from_pairs(pairs)
    }
}

impl From<NormalizedKeySpec> for Vec<KeyPair> {
    fn from(spec: NormalizedKeySpec) -> Self {
        spec.pairs
    }
}

impl From<NormalizedKeySpec> for KeySpec {
    fn from(spec: NormalizedKeySpec) -> Self {
        Self::Steps(
            spec.pairs
                .into_iter()
                .map(|pair| match (pair.left, pair.right) {
                    (KeyRef::Single(left), KeyRef::Single(right)) if left == right => {
                        KeySpecElement::SameName(left)
                    }
                    (KeyRef::Single(left), KeyRef::Single(right)) => {
                        KeySpecElement::Pair(left, right)
                    }
                    (KeyRef::Multi(left), KeyRef::Multi(right)) if left == right => {
                        KeySpecElement::MultiSame(left)
                    }
                    (KeyRef::Multi(left), KeyRef::Multi(right)) => {
                        KeySpecElement::MultiPair(left, right)
                    }
                    (KeyRef::Single(left), KeyRef::Multi(right)) => {
                        KeySpecElement::MultiPair(vec![left], right)
                    }
                    (KeyRef::Multi(left), KeyRef::Single(right)) => {
                        KeySpecElement::MultiPair(left, vec![right])
                    }
                    // half-natural pairs are rejected by `from_pairs`
                    (KeyRef::Natural, _) | (_, KeyRef::Natural) => KeySpecElement::Natural,
                })
                .collect(),
        )
    }
}

/// Normalize `spec` for a chain of `n_tables` tables into `n_tables - 1` pairs.
pub fn normalize_key_spec(
    spec: &KeySpec,
    n_tables: usize,
) -> Result<NormalizedKeySpec, KeySpecError> {
    let steps = n_tables.saturating_sub(1);
    let pairs = match spec {
        KeySpec::Absent => vec![KeyPair::natural(); steps],
        KeySpec::Single(name) => vec![KeyPair::same(KeyRef::Single(name.clone())); steps],
        KeySpec::Steps(elements) => {
            if elements.len() != steps {
                return Err(KeySpecError::StepCountMismatch {
                    expected: steps,
                    actual: elements.len(),
                });
            }
            elements.iter().map(normalize_element).collect()
        }
    };
    NormalizedKeySpec::from_pairs(pairs)
}

fn normalize_element(element: &KeySpecElement) -> KeyPair {
    match element {
        KeySpecElement::SameName(name) => KeyPair::same(KeyRef::Single(name.clone())),
        KeySpecElement::Pair(left, right) => {
            KeyPair::new(KeyRef::Single(left.clone()), KeyRef::Single(right.clone()))
        }
        KeySpecElement::MultiSame(names) => KeyPair::same(KeyRef::Multi(names.clone())),
        KeySpecElement::MultiPair(left, right) => {
            KeyPair::new(KeyRef::Multi(left.clone()), KeyRef::Multi(right.clone()))
        }
        KeySpecElement::Natural => KeyPair::natural(),
    }
}

/// Identifies a table in merge errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRef {
    /// Position in the merge chain.
    Position(usize),
    Named(String),
    /// Running result of the listed tables.
    Merged(Vec<TableRef>),
}

impl TableRef {
    fn running(step: usize) -> Self {
        if step == 0 {
            Self::Position(0)
        } else {
            Self::Merged((0..=step).map(Self::Position).collect())
        }
    }

    /// Replace chain positions by the matching entry of `names`.
    #[must_use]
    pub fn with_names<S: AsRef<str>>(self, names: &[S]) -> Self {
        match self {
            Self::Position(position) => names
                .get(position)
                .map_or(Self::Position(position), |name| {
                    Self::Named(name.as_ref().to_owned())
                }),
            Self::Named(name) => Self::Named(name),
            Self::Merged(parts) => {
                Self::Merged(parts.into_iter().map(|part| part.with_names(names)).collect())
            }
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(position) => write!(f, "table {position}"),
            Self::Named(name) => write!(f, "'{name}'"),
            Self::Merged(parts) => {
                f.write_str("merged result of ")?;
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{part}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    KeySpec(#[from] KeySpecError),
    #[error("no tables to merge")]
    NoTables,
    #[error("column '{column}' not present in {table}")]
    MissingColumn { column: String, table: TableRef },
    #[error("join step {step}: {left} and {right} have no common columns")]
    NoCommonColumns {
        step: usize,
        left: TableRef,
        right: TableRef,
    },
    #[error("join step {step} would produce column '{column}' twice")]
    DuplicateColumn { step: usize, column: String },
    #[error("join step {step} with {table} failed: {source}")]
    JoinStep {
        step: usize,
        table: TableRef,
        #[source]
        source: JoinError,
    },
}

impl MergeError {
    /// Rewrite positional table references using the names the tables were
    /// requested under.
    #[must_use]
    pub fn with_table_names<S: AsRef<str>>(self, names: &[S]) -> Self {
        match self {
            Self::MissingColumn { column, table } => Self::MissingColumn {
                column,
                table: table.with_names(names),
            },
            Self::NoCommonColumns { step, left, right } => Self::NoCommonColumns {
                step,
                left: left.with_names(names),
                right: right.with_names(names),
            },
            Self::JoinStep {
                step,
                table,
                source,
            } => Self::JoinStep {
                step,
                table: table.with_names(names),
                source,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    pub execution: JoinExecutionOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainColumn {
    name: String,
    base: String,
    origin: usize,
}

/// Resolved join step: keys and renames expressed against the actual
/// column names at that point of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    pub step: usize,
    pub right_position: usize,
    pub left_on: Vec<String>,
    pub right_on: Vec<String>,
    pub left_renames: Vec<(String, String)>,
    pub right_renames: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    steps: Vec<StepPlan>,
    output: Vec<ChainColumn>,
}

impl MergePlan {
    #[must_use]
    pub fn steps(&self) -> &[StepPlan] {
        &self.steps
    }

    /// Column names of the merged table, in order.
    #[must_use]
    pub fn output_columns(&self) -> Vec<&str> {
        self.output.iter().map(|column| column.name.as_str()).collect()
    }
}

fn positional_name(base: &str, position: usize) -> String {
    format!("{base}_{position}")
}

fn renamed_keys(keys: Vec<String>, renames: &[(String, String)]) -> Vec<String> {
    keys.into_iter()
        .map(|key| {
            renames
                .iter()
                .find(|(from, _)| *from == key)
                .map_or(key.clone(), |(_, to)| to.clone())
        })
        .collect()
}

fn plan_step(
    step: usize,
    running: &[ChainColumn],
    right: &[String],
    pair: &KeyPair,
) -> Result<(StepPlan, Vec<ChainColumn>), MergeError> {
    let right_position = step + 1;
    let running_names: Vec<String> = running.iter().map(|c| c.name.clone()).collect();

    let (left_keys, right_keys) = if pair.left.is_natural() && pair.right.is_natural() {
        let shared = shared_columns(&running_names, right);
        if shared.is_empty() {
            return Err(MergeError::NoCommonColumns {
                step,
                left: TableRef::running(step),
                right: TableRef::Position(right_position),
            });
        }
        (shared.clone(), shared)
    } else {
        if let Some(column) = pair.left.names().iter().find(|c| !running_names.contains(c)) {
            return Err(MergeError::MissingColumn {
                column: column.clone(),
                table: TableRef::running(step),
            });
        }
        if let Some(column) = pair.right.names().iter().find(|c| !right.contains(c)) {
            return Err(MergeError::MissingColumn {
                column: column.clone(),
                table: TableRef::Position(right_position),
            });
        }
        (pair.left.names().to_vec(), pair.right.names().to_vec())
    };

    // same name at the same key position: the right copy is dropped
    let coalesced: Vec<&str> = left_keys
        .iter()
        .zip(&right_keys)
        .filter(|(l, r)| l == r)
        .map(|(l, _)| l.as_str())
        .collect();
    let right_kept: Vec<&String> = right
        .iter()
        .filter(|name| !coalesced.contains(&name.as_str()))
        .collect();

    let mut next = Vec::with_capacity(running.len() + right_kept.len());
    let mut left_renames = Vec::new();
    for column in running {
        let mut column = column.clone();
        if column.name == column.base && right_kept.iter().any(|r| **r == column.base) {
            let renamed = positional_name(&column.base, column.origin);
            left_renames.push((column.name.clone(), renamed.clone()));
            column.name = renamed;
        }
        next.push(column);
    }

    let mut right_renames = Vec::new();
    for name in right_kept {
        let collides = running.iter().any(|c| c.base == *name || c.name == *name);
        let out = if collides {
            let renamed = positional_name(name, right_position);
            right_renames.push((name.clone(), renamed.clone()));
            renamed
        } else {
            name.clone()
        };
        next.push(ChainColumn {
            name: out,
            base: name.clone(),
            origin: right_position,
        });
    }

    let mut seen = HashSet::with_capacity(next.len());
    if let Some(column) = next.iter().find(|column| !seen.insert(column.name.as_str())) {
        return Err(MergeError::DuplicateColumn {
            step,
            column: column.name.clone(),
        });
    }

    let plan = StepPlan {
        step,
        right_position,
        left_on: renamed_keys(left_keys, &left_renames),
        right_on: renamed_keys(right_keys, &right_renames),
        left_renames,
        right_renames,
    };
    Ok((plan, next))
}

/// Check every step of the chain against the table schemas without joining.
///
/// The schema of the running result is projected step by step, so keys may
/// refer to any column introduced earlier in the chain. Steps are scanned in
/// order, left key before right key; the first missing column is returned.
pub fn validate_merge<T: Borrow<DataFrame>>(
    tables: &[T],
    spec: &NormalizedKeySpec,
) -> Result<MergePlan, MergeError> {
    let Some(first) = tables.first() else {
        return Err(MergeError::NoTables);
    };
    let expected = tables.len() - 1;
    if spec.len() != expected {
        return Err(KeySpecError::StepCountMismatch {
            expected,
            actual: spec.len(),
        }
        .into());
    }

    let mut running: Vec<ChainColumn> = first
        .borrow()
        .column_names()
        .iter()
        .map(|name| ChainColumn {
            name: name.clone(),
            base: name.clone(),
            origin: 0,
        })
        .collect();
    let mut steps = Vec::with_capacity(expected);
    for (step, pair) in spec.iter().enumerate() {
        let right = tables[step + 1].borrow();
        let (plan, next) = plan_step(step, &running, right.column_names(), pair)?;
        steps.push(plan);
        running = next;
    }
    Ok(MergePlan {
        steps,
        output: running,
    })
}

pub fn merge_tables<T: Borrow<DataFrame>>(
    tables: &[T],
    on: &KeySpec,
) -> Result<DataFrame, MergeError> {
    merge_tables_with_options(tables, on, &MergeOptions::default())
}

/// Inner-join `tables` left to right according to `on`.
///
/// Non-key columns whose name appears on both sides of a step are renamed
/// `{name}_{position}`, `position` being the chain position of the table the
/// column came from. Key columns with the same name on both sides are kept
/// once.
pub fn merge_tables_with_options<T: Borrow<DataFrame>>(
    tables: &[T],
    on: &KeySpec,
    options: &MergeOptions,
) -> Result<DataFrame, MergeError> {
    if tables.is_empty() {
        return Err(MergeError::NoTables);
    }
    let spec = normalize_key_spec(on, tables.len())?;
    merge_normalized(tables, &spec, options)
}

pub fn merge_normalized<T: Borrow<DataFrame>>(
    tables: &[T],
    spec: &NormalizedKeySpec,
    options: &MergeOptions,
) -> Result<DataFrame, MergeError> {
    let plan = validate_merge(tables, spec)?;
    let mut result = tables[0].borrow().clone();
    for step in plan.steps() {
        let right = tables[step.right_position].borrow();
        result = execute_step(&result, right, step, options).map_err(|source| {
            warn!(step = step.step, table = step.right_position, error = %source, "join step failed");
            MergeError::JoinStep {
                step: step.step,
                table: TableRef::Position(step.right_position),
                source,
            }
        })?;
        debug!(
            step = step.step,
            rows = result.len(),
            columns = result.num_columns(),
            "merge step"
        );
    }
    Ok(result)
}

fn rename<'a>(
    frame: &'a DataFrame,
    renames: &[(String, String)],
) -> Result<Cow<'a, DataFrame>, JoinError> {
    if renames.is_empty() {
        return Ok(Cow::Borrowed(frame));
    }
    let mapping: Vec<(&str, &str)> = renames
        .iter()
        .map(|(from, to)| (from.as_str(), to.as_str()))
        .collect();
    Ok(Cow::Owned(frame.rename_columns(&mapping)?))
}

fn execute_step(
    left: &DataFrame,
    right: &DataFrame,
    step: &StepPlan,
    options: &MergeOptions,
) -> Result<DataFrame, JoinError> {
    let left = rename(left, &step.left_renames)?;
    let right = rename(right, &step.right_renames)?;
    let left_on: Vec<&str> = step.left_on.iter().map(String::as_str).collect();
    let right_on: Vec<&str> = step.right_on.iter().map(String::as_str).collect();
    let join_options = JoinOptions {
        suffixes: Suffixes::default(),
        execution: options.execution,
    };
    inner_join_with_options(&left, &right, &left_on, &right_on, &join_options)
}
