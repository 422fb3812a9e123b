use std::{
    collections::BTreeMap,
    fmt,
    io::Read,
    path::{Path, PathBuf},
};

use grove_frame::{DataFrame, FrameError, ShrinkOptions};
use grove_io::{IoError, read_table_path, read_table_reader};
use grove_merge::{KeySpec, MergeError, MergeOptions, merge_tables_with_options};
use grove_runtime::Reporter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::sanity::{SanityOptions, SanityReport, sanity_check_table};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const EMPTY_COLLECTION: &str = "Collection is empty";

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("collection specification not supported: {0}")]
    Config(String),
    #[error("table(s) not in collection: {}", quoted(.names))]
    NotFound { names: Vec<String> },
    #[error("source for table '{name}' is an unsupported type: {found}")]
    UnsupportedSource { name: String, found: String },
    #[error("failed to load table '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: IoError,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Where a table comes from when it is put into a collection.
pub enum TableSource {
    Table(DataFrame),
    /// Delimited text file; the delimiter is sniffed.
    Path(PathBuf),
    /// Delimited text stream; read to the end, the delimiter is sniffed.
    Reader(Box<dyn Read + Send>),
}

impl TableSource {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }
}

impl fmt::Debug for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(frame) => f
                .debug_struct("Table")
                .field("rows", &frame.len())
                .field("columns", &frame.column_names())
                .finish(),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<DataFrame> for TableSource {
    fn from(frame: DataFrame) -> Self {
        Self::Table(frame)
    }
}

impl From<&str> for TableSource {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<String> for TableSource {
    fn from(path: String) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for TableSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for TableSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoOptions {
    pub memory_usage: bool,
    pub verbose: bool,
}

impl Default for InfoOptions {
    fn default() -> Self {
        Self {
            memory_usage: true,
            verbose: false,
        }
    }
}

/// Named tables. Names are unique; putting a name again replaces the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    tables: BTreeMap<String, DataFrame>,
}

impl Collection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    /// Build a collection from `(name, source)` pairs. Maps work as well,
    /// since they iterate as pairs.
    pub fn create<I, K, S>(entries: I) -> Result<Self, CollectionError>
    where
        I: IntoIterator<Item = (K, S)>,
        K: Into<String>,
        S: Into<TableSource>,
    {
        let mut collection = Self::new();
        for (name, source) in entries {
            collection.put(name, source)?;
        }
        Ok(collection)
    }

    /// Build a collection from a JSON manifest: either an object of
    /// `name: path` or an array of `[name, path]` pairs. Relative paths are
    /// resolved against `base_dir`.
    pub fn from_manifest(
        manifest: &Value,
        base_dir: impl AsRef<Path>,
    ) -> Result<Self, CollectionError> {
        let entries: Vec<(String, &Value)> = match manifest {
            Value::Object(map) => map.iter().map(|(name, source)| (name.clone(), source)).collect(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item.as_array().map(Vec::as_slice) {
                    Some([Value::String(name), source]) => Ok((name.clone(), source)),
                    _ => Err(CollectionError::Config(item.to_string())),
                })
                .collect::<Result<_, _>>()?,
            other => return Err(CollectionError::Config(other.to_string())),
        };

        let base_dir = base_dir.as_ref();
        let mut collection = Self::new();
        for (name, source) in entries {
            let Some(path) = source.as_str() else {
                return Err(CollectionError::UnsupportedSource {
                    name,
                    found: source.to_string(),
                });
            };
            collection.put(name, base_dir.join(path))?;
        }
        Ok(collection)
    }

    /// Store a table under `name`, loading it first when `source` is a path
    /// or a stream.
    pub fn put(
        &mut self,
        name: impl Into<String>,
        source: impl Into<TableSource>,
    ) -> Result<(), CollectionError> {
        let name = name.into();
        let frame = match source.into() {
            TableSource::Table(frame) => frame,
            TableSource::Path(path) => {
                read_table_path(&path).map_err(|source| CollectionError::Io {
                    name: name.clone(),
                    source,
                })?
            }
            TableSource::Reader(reader) => {
                read_table_reader(reader).map_err(|source| CollectionError::Io {
                    name: name.clone(),
                    source,
                })?
            }
        };
        debug!(
            table = %name,
            rows = frame.len(),
            columns = frame.num_columns(),
            "table stored"
        );
        self.tables.insert(name, frame);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&DataFrame, CollectionError> {
        self.tables
            .get(name)
            .ok_or_else(|| CollectionError::NotFound {
                names: vec![name.to_owned()],
            })
    }

    /// Tables in request order. Fails listing every missing name.
    pub fn get_many<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<&DataFrame>, CollectionError> {
        let missing: Vec<String> = names
            .iter()
            .map(|name| name.as_ref())
            .filter(|name: &&str| !self.tables.contains_key(*name))
            .map(str::to_owned)
            .collect();
        if !missing.is_empty() {
            return Err(CollectionError::NotFound { names: missing });
        }
        Ok(names
            .iter()
            .filter_map(|name| self.tables.get(name.as_ref()))
            .collect())
    }

    pub fn merge<S: AsRef<str>>(
        &self,
        names: &[S],
        on: &KeySpec,
    ) -> Result<DataFrame, CollectionError> {
        self.merge_with_options(names, on, &MergeOptions::default())
    }

    /// Inner-join the named tables left to right. Errors refer to tables
    /// by name.
    pub fn merge_with_options<S: AsRef<str>>(
        &self,
        names: &[S],
        on: &KeySpec,
        options: &MergeOptions,
    ) -> Result<DataFrame, CollectionError> {
        let tables = self.get_many(names)?;
        merge_tables_with_options(&tables, on, options)
            .map_err(|err| CollectionError::Merge(err.with_table_names(names)))
    }

    /// Names in alphabetical order.
    #[must_use]
    pub fn list_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataFrame)> + '_ {
        self.tables.iter().map(|(name, frame)| (name.as_str(), frame))
    }

    pub fn remove(&mut self, name: &str) -> Option<DataFrame> {
        self.tables.remove(name)
    }

    /// Shrink the storage width of every numeric column of every table.
    pub fn shrink_dtypes(&mut self, options: ShrinkOptions) -> Result<(), CollectionError> {
        for (name, frame) in &mut self.tables {
            let before = frame.memory_usage_bytes();
            frame.shrink_dtypes_in_place(options)?;
            debug!(
                table = %name,
                before,
                after = frame.memory_usage_bytes(),
                "shrunk dtypes"
            );
        }
        Ok(())
    }

    /// Run the sanity check on every table, in name order.
    pub fn sanity_check(
        &self,
        options: &SanityOptions,
        reporter: &mut dyn Reporter,
    ) -> Vec<SanityReport> {
        self.iter()
            .map(|(name, frame)| sanity_check_table(name, frame, options, reporter))
            .collect()
    }

    /// Summary of the collection: table count, names and, optionally, memory
    /// usage and per-table column info. The text is sent to `reporter` and
    /// returned.
    pub fn info(&self, options: InfoOptions, reporter: &mut dyn Reporter) -> String {
        if self.is_empty() {
            let out = EMPTY_COLLECTION.to_owned();
            reporter.info("collection", &out);
            return out;
        }

        let mut out = format!(
            "Contents: {} tables\n{}\n",
            self.len(),
            self.list_names().join(", ")
        );

        if options.memory_usage {
            let width = self
                .tables
                .keys()
                .map(String::len)
                .chain(["TOTAL".len(), "Table".len()])
                .max()
                .unwrap_or_default();
            out.push_str("\nMemory usage\n============\n");
            out.push_str(&format!("{:>width$}  {:>10}\n", "Table", "MiB"));
            let mut total = 0.0;
            for (name, frame) in self.iter() {
                let mib = frame.memory_usage_bytes() as f64 / BYTES_PER_MIB;
                total += mib;
                out.push_str(&format!("{name:>width$}  {mib:>10.6}\n"));
            }
            out.push_str(&format!("{:>width$}  {total:>10.6}\n", "TOTAL"));
        }

        if options.verbose {
            for (name, frame) in self.iter() {
                out.push_str(&format!("\n{}\n{}\n", underlined(name), frame.info()));
            }
        }

        reporter.info("collection", &out);
        out
    }
}

fn underlined(name: &str) -> String {
    format!("{name}\n{}", "=".repeat(name.len().max(8)))
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str(EMPTY_COLLECTION);
        }
        for (name, frame) in self.iter() {
            writeln!(f, "{}", underlined(name))?;
            writeln!(f, "* cols: {}", frame.num_columns())?;
            writeln!(f, "* rows: {}", frame.len())?;
            writeln!(f)?;
        }
        Ok(())
    }
}
