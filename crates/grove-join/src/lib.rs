#![forbid(unsafe_code)]

use std::{collections::HashMap, fmt, mem::size_of};

use bumpalo::{Bump, collections::Vec as BumpVec};
use grove_columnar::{Column, ColumnError};
use grove_frame::{DataFrame, FrameError};
use grove_types::{DType, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("left"),
            Self::Right => f.write_str("right"),
        }
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join key is empty")]
    EmptyKey,
    #[error("left key has {left} column(s) but right key has {right}")]
    KeyArityMismatch { left: usize, right: usize },
    #[error("{side} key column '{column}' not found")]
    MissingKeyColumn { side: Side, column: String },
    #[error(
        "cannot join key '{left_column}' ({left_dtype}) with '{right_column}' ({right_dtype})"
    )]
    IncompatibleKeyTypes {
        left_column: String,
        left_dtype: DType,
        right_column: String,
        right_dtype: DType,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

/// Suffixes appended to non-key columns present on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Suffixes {
    pub left: String,
    pub right: String,
}

impl Suffixes {
    #[must_use]
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
        }
    }
}

impl Default for Suffixes {
    fn default() -> Self {
        Self::new("_x", "_y")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinOptions {
    pub suffixes: Suffixes,
    pub execution: JoinExecutionOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinExecutionTrace {
    used_arena: bool,
    output_rows: usize,
    estimated_bytes: usize,
}

/// One column of a join result: where it comes from and what it is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub side: Side,
    pub source: String,
    pub name: String,
}

/// Column names shared by both sides, in left column order.
#[must_use]
pub fn shared_columns(left_columns: &[String], right_columns: &[String]) -> Vec<String> {
    left_columns
        .iter()
        .filter(|name| right_columns.contains(name))
        .cloned()
        .collect()
}

/// Output schema of an inner join, computed from column names alone.
///
/// Left columns come first, then right columns. A right key column with the
/// same name as the left key at the same position is coalesced into the left
/// one. Remaining names present on both sides get `suffixes` appended.
#[must_use]
pub fn plan_output_columns(
    left_columns: &[String],
    right_columns: &[String],
    left_on: &[&str],
    right_on: &[&str],
    suffixes: &Suffixes,
) -> Vec<OutputColumn> {
    let coalesced: Vec<&str> = left_on
        .iter()
        .zip(right_on)
        .filter(|(l, r)| l == r)
        .map(|(l, _)| *l)
        .collect();
    let right_kept: Vec<&String> = right_columns
        .iter()
        .filter(|name| !coalesced.contains(&name.as_str()))
        .collect();

    let mut out = Vec::with_capacity(left_columns.len() + right_kept.len());
    for name in left_columns {
        let collides = right_kept.iter().any(|right| *right == name);
        out.push(OutputColumn {
            side: Side::Left,
            source: name.clone(),
            name: if collides {
                format!("{name}{}", suffixes.left)
            } else {
                name.clone()
            },
        });
    }
    for name in right_kept {
        let collides = left_columns.contains(name);
        out.push(OutputColumn {
            side: Side::Right,
            source: name.clone(),
            name: if collides {
                format!("{name}{}", suffixes.right)
            } else {
                name.clone()
            },
        });
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Any,
    Numeric,
    Text,
}

fn key_family(dtype: DType) -> KeyFamily {
    match dtype {
        DType::Null => KeyFamily::Any,
        DType::Utf8 => KeyFamily::Text,
        _ => KeyFamily::Numeric,
    }
}

/// Hashable key component. Bools and whole floats collapse onto `Int` so
/// that keys compare by value across numeric widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum KeyValue<'a> {
    Int(i64),
    Float(u64),
    Text(&'a str),
}

fn key_value(scalar: &Scalar) -> Option<KeyValue<'_>> {
    if scalar.is_missing() {
        return None;
    }
    match scalar {
        Scalar::Bool(v) => Some(KeyValue::Int(i64::from(*v))),
        Scalar::Int64(v) => Some(KeyValue::Int(*v)),
        Scalar::Float64(v) => {
            if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 {
                Some(KeyValue::Int(*v as i64))
            } else {
                Some(KeyValue::Float(v.to_bits()))
            }
        }
        Scalar::Utf8(v) => Some(KeyValue::Text(v.as_str())),
        Scalar::Null(_) => None,
    }
}

/// Composite key of one row; `None` when any component is missing, so such
/// rows never match.
fn row_key<'a>(columns: &[&'a Column], row: usize) -> Option<Vec<KeyValue<'a>>> {
    columns
        .iter()
        .map(|column| column.value(row).and_then(key_value))
        .collect()
}

fn key_columns<'a>(
    frame: &'a DataFrame,
    keys: &[&str],
    side: Side,
) -> Result<Vec<&'a Column>, JoinError> {
    keys.iter()
        .map(|&name| {
            frame
                .column(name)
                .ok_or_else(|| JoinError::MissingKeyColumn {
                    side,
                    column: name.to_owned(),
                })
        })
        .collect()
}

fn check_key_types(
    left_on: &[&str],
    left_keys: &[&Column],
    right_on: &[&str],
    right_keys: &[&Column],
) -> Result<(), JoinError> {
    for (idx, (left, right)) in left_keys.iter().zip(right_keys).enumerate() {
        let (lf, rf) = (key_family(left.dtype()), key_family(right.dtype()));
        if lf != rf && lf != KeyFamily::Any && rf != KeyFamily::Any {
            return Err(JoinError::IncompatibleKeyTypes {
                left_column: left_on[idx].to_owned(),
                left_dtype: left.dtype(),
                right_column: right_on[idx].to_owned(),
                right_dtype: right.dtype(),
            });
        }
    }
    Ok(())
}

pub fn inner_join(
    left: &DataFrame,
    right: &DataFrame,
    left_on: &[&str],
    right_on: &[&str],
) -> Result<DataFrame, JoinError> {
    inner_join_with_options(left, right, left_on, right_on, &JoinOptions::default())
}

/// Hash inner join of `left` and `right` on `left_on[i] == right_on[i]`.
///
/// Output rows follow left row order; for each left row, matches follow
/// right row order.
pub fn inner_join_with_options(
    left: &DataFrame,
    right: &DataFrame,
    left_on: &[&str],
    right_on: &[&str],
    options: &JoinOptions,
) -> Result<DataFrame, JoinError> {
    let (joined, _) = inner_join_with_trace(left, right, left_on, right_on, options)?;
    Ok(joined)
}

fn inner_join_with_trace(
    left: &DataFrame,
    right: &DataFrame,
    left_on: &[&str],
    right_on: &[&str],
    options: &JoinOptions,
) -> Result<(DataFrame, JoinExecutionTrace), JoinError> {
    if left_on.is_empty() || right_on.is_empty() {
        return Err(JoinError::EmptyKey);
    }
    if left_on.len() != right_on.len() {
        return Err(JoinError::KeyArityMismatch {
            left: left_on.len(),
            right: right_on.len(),
        });
    }

    let left_keys = key_columns(left, left_on, Side::Left)?;
    let right_keys = key_columns(right, right_on, Side::Right)?;
    check_key_types(left_on, &left_keys, right_on, &right_keys)?;

    let mut right_map = HashMap::<Vec<KeyValue<'_>>, Vec<usize>>::new();
    for pos in 0..right.len() {
        if let Some(key) = row_key(&right_keys, pos) {
            right_map.entry(key).or_default().push(pos);
        }
    }
    let probe: Vec<Option<Vec<KeyValue<'_>>>> =
        (0..left.len()).map(|pos| row_key(&left_keys, pos)).collect();

    let outputs = plan_output_columns(
        left.column_names(),
        right.column_names(),
        left_on,
        right_on,
        &options.suffixes,
    );

    let output_rows = estimate_output_rows(&probe, &right_map);
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let use_arena =
        options.execution.use_arena && estimated_bytes <= options.execution.arena_budget_bytes;

    let joined = if use_arena {
        join_with_arena(left, right, &probe, &right_map, output_rows, &outputs)?
    } else {
        join_with_global_allocator(left, right, &probe, &right_map, output_rows, &outputs)?
    };

    let trace = JoinExecutionTrace {
        used_arena: use_arena,
        output_rows,
        estimated_bytes,
    };
    debug!(
        left_rows = left.len(),
        right_rows = right.len(),
        output_rows = trace.output_rows,
        estimated_bytes = trace.estimated_bytes,
        used_arena = trace.used_arena,
        "inner join"
    );

    Ok((joined, trace))
}

fn estimate_output_rows(
    probe: &[Option<Vec<KeyValue<'_>>>],
    right_map: &HashMap<Vec<KeyValue<'_>>, Vec<usize>>,
) -> usize {
    probe
        .iter()
        .filter_map(|key| key.as_ref().and_then(|key| right_map.get(key)))
        .map(Vec::len)
        .sum()
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<usize>().saturating_mul(2))
}

fn join_with_global_allocator(
    left: &DataFrame,
    right: &DataFrame,
    probe: &[Option<Vec<KeyValue<'_>>>],
    right_map: &HashMap<Vec<KeyValue<'_>>, Vec<usize>>,
    output_rows: usize,
    outputs: &[OutputColumn],
) -> Result<DataFrame, JoinError> {
    let mut left_positions = Vec::<usize>::with_capacity(output_rows);
    let mut right_positions = Vec::<usize>::with_capacity(output_rows);

    for (left_pos, key) in probe.iter().enumerate() {
        let Some(matches) = key.as_ref().and_then(|key| right_map.get(key)) else {
            continue;
        };
        for right_pos in matches {
            left_positions.push(left_pos);
            right_positions.push(*right_pos);
        }
    }

    assemble(left, right, outputs, &left_positions, &right_positions)
}

fn join_with_arena(
    left: &DataFrame,
    right: &DataFrame,
    probe: &[Option<Vec<KeyValue<'_>>>],
    right_map: &HashMap<Vec<KeyValue<'_>>, Vec<usize>>,
    output_rows: usize,
    outputs: &[OutputColumn],
) -> Result<DataFrame, JoinError> {
    let arena = Bump::new();
    let mut left_positions = BumpVec::<usize>::with_capacity_in(output_rows, &arena);
    let mut right_positions = BumpVec::<usize>::with_capacity_in(output_rows, &arena);

    for (left_pos, key) in probe.iter().enumerate() {
        let Some(matches) = key.as_ref().and_then(|key| right_map.get(key)) else {
            continue;
        };
        for right_pos in matches {
            left_positions.push(left_pos);
            right_positions.push(*right_pos);
        }
    }

    assemble(left, right, outputs, &left_positions, &right_positions)
}

fn assemble(
    left: &DataFrame,
    right: &DataFrame,
    outputs: &[OutputColumn],
    left_positions: &[usize],
    right_positions: &[usize],
) -> Result<DataFrame, JoinError> {
    let columns = outputs
        .iter()
        .map(|output| {
            let (frame, positions) = match output.side {
                Side::Left => (left, left_positions),
                Side::Right => (right, right_positions),
            };
            let column = frame
                .column(&output.source)
                .ok_or_else(|| FrameError::ColumnNotFound(output.source.clone()))?;
            Ok((output.name.clone(), column.take(positions)?))
        })
        .collect::<Result<Vec<_>, JoinError>>()?;
    Ok(DataFrame::from_columns_with_rows(
        left_positions.len(),
        columns,
    )?)
}

#[cfg(test)]
mod tests {
    use grove_frame::DataFrame;
    use grove_types::{DType, NullKind, Scalar};

    use super::{
        JoinError, JoinExecutionOptions, JoinOptions, Side, Suffixes, inner_join,
        inner_join_with_options, inner_join_with_trace, plan_output_columns, shared_columns,
    };

    fn frame(data: Vec<(&str, Vec<Scalar>)>) -> DataFrame {
        DataFrame::from_dict(data).expect("frame")
    }

    fn ints(values: &[i64]) -> Vec<Scalar> {
        values.iter().copied().map(Scalar::Int64).collect()
    }

    fn global_options() -> JoinOptions {
        JoinOptions {
            execution: JoinExecutionOptions {
                use_arena: false,
                arena_budget_bytes: 0,
            },
            ..JoinOptions::default()
        }
    }

    #[test]
    fn inner_join_multiplies_cardinality_for_duplicates() {
        let left = frame(vec![("k", ints(&[1, 1, 2])), ("a", ints(&[10, 20, 30]))]);
        let right = frame(vec![("k", ints(&[1, 1])), ("b", ints(&[100, 200]))]);

        let out = inner_join(&left, &right, &["k"], &["k"]).expect("join");
        assert_eq!(out.column_names(), &["k", "a", "b"]);
        assert_eq!(out.len(), 4);
        assert_eq!(
            out.column("a").expect("a").values(),
            ints(&[10, 10, 20, 20]).as_slice()
        );
        assert_eq!(
            out.column("b").expect("b").values(),
            ints(&[100, 200, 100, 200]).as_slice()
        );
    }

    #[test]
    fn different_key_names_keep_both_columns() {
        let left = frame(vec![("id", ints(&[1, 2, 3]))]);
        let right = frame(vec![("id1", ints(&[3, 1])), ("cat", ints(&[30, 10]))]);
        let out = inner_join(&left, &right, &["id"], &["id1"]).expect("join");
        assert_eq!(out.column_names(), &["id", "id1", "cat"]);
        assert_eq!(out.column("id1").expect("id1").values(), ints(&[1, 3]).as_slice());
    }

    #[test]
    fn colliding_non_key_columns_get_suffixes() {
        let left = frame(vec![("id", ints(&[1])), ("value", ints(&[5]))]);
        let right = frame(vec![("id", ints(&[1])), ("value", ints(&[6]))]);

        let out = inner_join(&left, &right, &["id"], &["id"]).expect("join");
        assert_eq!(out.column_names(), &["id", "value_x", "value_y"]);

        let options = JoinOptions {
            suffixes: Suffixes::new("_0", "_1"),
            ..JoinOptions::default()
        };
        let out = inner_join_with_options(&left, &right, &["id"], &["id"], &options).expect("join");
        assert_eq!(out.column_names(), &["id", "value_0", "value_1"]);
    }

    #[test]
    fn composite_keys_require_every_component_to_match() {
        let left = frame(vec![
            ("a", ints(&[1, 1, 2])),
            ("b", ints(&[1, 2, 1])),
            ("v", ints(&[10, 20, 30])),
        ]);
        let right = frame(vec![
            ("a", ints(&[1, 2])),
            ("b", ints(&[2, 2])),
            ("w", ints(&[7, 8])),
        ]);
        let out = inner_join(&left, &right, &["a", "b"], &["a", "b"]).expect("join");
        assert_eq!(out.column_names(), &["a", "b", "v", "w"]);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out.row(0).expect("row"),
            vec![
                &Scalar::Int64(1),
                &Scalar::Int64(2),
                &Scalar::Int64(20),
                &Scalar::Int64(7)
            ]
        );
    }

    #[test]
    fn numeric_keys_match_across_widths() {
        let left = frame(vec![("k", ints(&[3, 4]))])
            .astype_column("k", DType::UInt8)
            .expect("narrow");
        let right = frame(vec![("k", vec![Scalar::Float64(3.0), Scalar::Float64(4.5)])]);
        let out = inner_join(&left, &right, &["k"], &["k"]).expect("join");
        assert_eq!(out.len(), 1);
        assert_eq!(out.column("k").expect("k").dtype(), DType::UInt8);
    }

    #[test]
    fn bool_keys_match_numeric_keys_by_value() {
        let left = frame(vec![("k", vec![Scalar::Bool(true), Scalar::Bool(false)])]);
        let right = frame(vec![
            ("k", vec![Scalar::Int64(0), Scalar::Float64(1.0), Scalar::Int64(2)]),
            ("v", ints(&[10, 11, 12])),
        ]);
        let out = inner_join(&left, &right, &["k"], &["k"]).expect("join");
        assert_eq!(out.column("k").expect("k").dtype(), DType::Bool);
        assert_eq!(out.column("v").expect("v").values(), ints(&[11, 10]).as_slice());

        let text = frame(vec![("k", vec![Scalar::from("true")])]);
        assert!(matches!(
            inner_join(&left, &text, &["k"], &["k"]).expect_err("bool with text"),
            JoinError::IncompatibleKeyTypes { .. }
        ));
    }

    #[test]
    fn missing_keys_never_match() {
        let left = frame(vec![(
            "k",
            vec![Scalar::Null(NullKind::Null), Scalar::Int64(1)],
        )]);
        let right = frame(vec![(
            "k",
            vec![Scalar::Int64(1), Scalar::Null(NullKind::Null)],
        )]);
        let out = inner_join(&left, &right, &["k"], &["k"]).expect("join");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn incompatible_key_types_are_rejected() {
        let left = frame(vec![("k", ints(&[1]))]);
        let right = frame(vec![("k", vec![Scalar::from("1")])]);
        let err = inner_join(&left, &right, &["k"], &["k"]).expect_err("type mismatch");
        assert!(matches!(
            err,
            JoinError::IncompatibleKeyTypes {
                left_dtype: DType::Int64,
                right_dtype: DType::Utf8,
                ..
            }
        ));
    }

    #[test]
    fn key_arity_and_presence_are_checked() {
        let left = frame(vec![("a", ints(&[1])), ("b", ints(&[1]))]);
        let right = frame(vec![("a", ints(&[1]))]);
        assert!(matches!(
            inner_join(&left, &right, &["a", "b"], &["a"]).expect_err("arity"),
            JoinError::KeyArityMismatch { left: 2, right: 1 }
        ));
        assert!(matches!(
            inner_join(&left, &right, &["b"], &["b"]).expect_err("missing"),
            JoinError::MissingKeyColumn {
                side: Side::Right,
                ..
            }
        ));
        assert!(matches!(
            inner_join(&left, &right, &[], &[]).expect_err("empty"),
            JoinError::EmptyKey
        ));
    }

    #[test]
    fn arena_join_matches_global_allocator_behavior() {
        let left = frame(vec![("k", ints(&[1, 1, 2])), ("a", ints(&[1, 2, 3]))]);
        let right = frame(vec![("k", ints(&[1, 1])), ("b", ints(&[10, 20]))]);

        let global =
            inner_join_with_options(&left, &right, &["k"], &["k"], &global_options())
                .expect("global join");
        let arena = inner_join_with_options(&left, &right, &["k"], &["k"], &JoinOptions::default())
            .expect("arena join");
        assert_eq!(arena, global);
    }

    #[test]
    fn arena_join_falls_back_when_budget_is_too_small() {
        let left = frame(vec![("k", ints(&[1, 1, 1]))]);
        let right = frame(vec![("k", ints(&[1, 1])), ("b", ints(&[10, 20]))]);

        let options = JoinOptions {
            execution: JoinExecutionOptions {
                use_arena: true,
                arena_budget_bytes: 1,
            },
            ..JoinOptions::default()
        };
        let (fallback_out, trace) =
            inner_join_with_trace(&left, &right, &["k"], &["k"], &options).expect("fallback");
        let global_out =
            inner_join_with_options(&left, &right, &["k"], &["k"], &global_options())
                .expect("global join");

        assert_eq!(fallback_out, global_out);
        assert!(!trace.used_arena);
        assert_eq!(trace.output_rows, 6);
        assert!(trace.estimated_bytes > options.execution.arena_budget_bytes);
    }

    #[test]
    fn arena_join_is_stable_across_many_small_operations() {
        let left = frame(vec![("k", ints(&[1, 2]))]);
        let right = frame(vec![("k", ints(&[1, 2])), ("b", ints(&[10, 20]))]);

        for _ in 0..1_000 {
            let out = inner_join(&left, &right, &["k"], &["k"]).expect("arena join");
            assert_eq!(out.len(), 2);
            assert_eq!(out.column("b").expect("b").values(), ints(&[10, 20]).as_slice());
        }
    }

    #[test]
    fn plan_output_columns_matches_executed_schema() {
        let left = frame(vec![("id", ints(&[1])), ("v", ints(&[1])), ("w", ints(&[1]))]);
        let right = frame(vec![("key", ints(&[1])), ("v", ints(&[1])), ("id", ints(&[1]))]);
        let planned = plan_output_columns(
            left.column_names(),
            right.column_names(),
            &["id"],
            &["key"],
            &Suffixes::default(),
        );
        let executed = inner_join(&left, &right, &["id"], &["key"]).expect("join");
        let planned_names: Vec<&str> = planned.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(planned_names, executed.column_names());
        assert_eq!(planned_names, vec!["id_x", "v_x", "w", "key", "v_y", "id_y"]);
    }

    #[test]
    fn shared_columns_follow_left_order() {
        let left = vec!["b".to_owned(), "a".to_owned(), "c".to_owned()];
        let right = vec!["a".to_owned(), "b".to_owned()];
        assert_eq!(shared_columns(&left, &right), vec!["b", "a"]);
    }
}
