#![forbid(unsafe_code)]

//! Named collections of tables with multi-table merge chains.
//!
//! ```no_run
//! use grove::{Collection, KeySpec};
//!
//! let data = Collection::create([
//!     ("items", "data/items.csv"),
//!     ("categories", "data/categories.csv"),
//! ])?;
//! let merged = data.merge(&["items", "categories"], &KeySpec::from("id"))?;
//! # Ok::<(), grove::CollectionError>(())
//! ```

mod collection;
pub mod config;
pub mod sanity;

pub use collection::{Collection, CollectionError, InfoOptions, TableSource};
pub use config::{ConfigError, GroveConfig};
pub use sanity::{SanityIssue, SanityOptions, SanityReport, sanity_check_table};

pub use grove_columnar::{Column, FloatTarget};
pub use grove_frame::{DataFrame, FrameError, ShrinkOptions};
pub use grove_io::{IoError, read_table_path, read_table_reader, write_csv_string};
pub use grove_join::{JoinError, JoinExecutionOptions, JoinOptions, Suffixes, inner_join};
pub use grove_merge::{
    KeyPair, KeyRef, KeySpec, KeySpecElement, KeySpecError, MergeError, MergeOptions,
    NormalizedKeySpec, TableRef, merge_tables, merge_tables_with_options, normalize_key_spec,
    validate_merge,
};
pub use grove_runtime::{ReportLedger, ReportLevel, Reporter, TracingReporter, WriterReporter};
pub use grove_types::{DType, NullKind, Scalar};
