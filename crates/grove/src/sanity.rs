//! Light per-table data-quality checks.

use std::fmt;

use grove_frame::DataFrame;
use grove_runtime::Reporter;
use grove_types::{DType, Scalar};
use serde::{Deserialize, Serialize};

/// Which checks run. Everything is on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanityOptions {
    pub check_empty: bool,
    pub check_all_missing: bool,
    pub check_has_missing: bool,
    pub check_numeric_text: bool,
}

impl Default for SanityOptions {
    fn default() -> Self {
        Self {
            check_empty: true,
            check_all_missing: true,
            check_has_missing: true,
            check_numeric_text: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SanityIssue {
    Empty,
    AllMissing { column: String },
    HasMissing { column: String, count: usize },
    /// Text column whose values all parse as numbers.
    NumericText { column: String },
}

impl fmt::Display for SanityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("table is empty"),
            Self::AllMissing { column } => write!(f, "column '{column}' has only missing values"),
            Self::HasMissing { column, count } => {
                write!(f, "column '{column}' has {count} missing value(s)")
            }
            Self::NumericText { column } => {
                write!(f, "column '{column}' holds numbers stored as text")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityReport {
    pub table: String,
    pub issues: Vec<SanityIssue>,
}

impl SanityReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

fn is_numeric_text(values: &[Scalar]) -> bool {
    let mut seen = false;
    for value in values {
        match value {
            Scalar::Utf8(text) => {
                if text.trim().parse::<f64>().is_err() {
                    return false;
                }
                seen = true;
            }
            _ if value.is_missing() => {}
            _ => return false,
        }
    }
    seen
}

/// Check one table and send every issue found to `reporter` as a warning.
pub fn sanity_check_table(
    name: &str,
    frame: &DataFrame,
    options: &SanityOptions,
    reporter: &mut dyn Reporter,
) -> SanityReport {
    let mut issues = Vec::new();

    if frame.is_empty() {
        if options.check_empty {
            issues.push(SanityIssue::Empty);
        }
    } else {
        for (column_name, column) in frame.iter_columns() {
            let missing = column.null_count();
            if missing == column.len() {
                if options.check_all_missing {
                    issues.push(SanityIssue::AllMissing {
                        column: column_name.to_owned(),
                    });
                }
                continue;
            }
            if missing > 0 && options.check_has_missing {
                issues.push(SanityIssue::HasMissing {
                    column: column_name.to_owned(),
                    count: missing,
                });
            }
            if options.check_numeric_text
                && column.dtype() == DType::Utf8
                && is_numeric_text(column.values())
            {
                issues.push(SanityIssue::NumericText {
                    column: column_name.to_owned(),
                });
            }
        }
    }

    for issue in &issues {
        reporter.warn(name, &issue.to_string());
    }
    SanityReport {
        table: name.to_owned(),
        issues,
    }
}
