#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use grove_columnar::{Column, ColumnError};
use grove_frame::{DataFrame, FrameError};
use grove_types::{DType, NullKind, Scalar};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("delimited input has no headers")]
    MissingHeaders,
    #[error("failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Delimiters tried by [`sniff_delimiter`], in tie-break order.
pub const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b'\t', b';', b'|'];

const SNIFF_RECORDS: usize = 10;

/// Count candidate delimiters per record over the first records of `sample`,
/// skipping quoted sections.
fn delimiter_counts(sample: &str) -> Vec<[usize; CANDIDATE_DELIMITERS.len()]> {
    let mut records = Vec::new();
    let mut current = [0_usize; CANDIDATE_DELIMITERS.len()];
    let mut in_quotes = false;
    let mut has_content = false;

    for byte in sample.bytes() {
        match byte {
            b'"' => {
                in_quotes = !in_quotes;
                has_content = true;
            }
            b'\n' if !in_quotes => {
                if has_content {
                    records.push(current);
                    if records.len() == SNIFF_RECORDS {
                        return records;
                    }
                }
                current = [0; CANDIDATE_DELIMITERS.len()];
                has_content = false;
            }
            b'\r' => {}
            other => {
                has_content = true;
                if !in_quotes {
                    if let Some(slot) = CANDIDATE_DELIMITERS.iter().position(|d| *d == other) {
                        current[slot] += 1;
                    }
                }
            }
        }
    }
    if has_content {
        records.push(current);
    }
    records
}

/// Guess the field delimiter of a delimited-text sample.
///
/// Prefers the candidate that appears the same non-zero number of times in
/// every sampled record, taking the highest such count; otherwise the most
/// frequent candidate in the header record. Falls back to `,` when no
/// candidate appears, which reads single-column files correctly.
#[must_use]
pub fn sniff_delimiter(sample: &str) -> u8 {
    let records = delimiter_counts(sample);
    let Some(header) = records.first() else {
        return b',';
    };

    let consistent = (0..CANDIDATE_DELIMITERS.len())
        .filter(|&slot| header[slot] > 0 && records.iter().all(|r| r[slot] == header[slot]))
        .max_by(|&a, &b| header[a].cmp(&header[b]).then(b.cmp(&a)));

    let chosen = consistent.or_else(|| {
        (0..CANDIDATE_DELIMITERS.len())
            .filter(|&slot| header[slot] > 0)
            .max_by(|&a, &b| header[a].cmp(&header[b]).then(b.cmp(&a)))
    });

    let delimiter = chosen.map_or(b',', |slot| CANDIDATE_DELIMITERS[slot]);
    debug!(
        delimiter = %char::from(delimiter).escape_default(),
        records = records.len(),
        "sniffed delimiter"
    );
    delimiter
}

/// Read comma-separated text.
pub fn read_csv_str(input: &str) -> Result<DataFrame, IoError> {
    read_delimited_str(input, b',')
}

/// Read delimited text after sniffing its delimiter.
pub fn read_table_str(input: &str) -> Result<DataFrame, IoError> {
    read_delimited_str(input, sniff_delimiter(input))
}

/// Read a whole stream of delimited text, sniffing the delimiter.
pub fn read_table_reader<R: Read>(mut reader: R) -> Result<DataFrame, IoError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let text = String::from_utf8(bytes)?;
    read_table_str(&text)
}

/// Load a delimited-text file, sniffing the delimiter.
pub fn read_table_path(path: impl AsRef<Path>) -> Result<DataFrame, IoError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| IoError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let frame = read_table_reader(file)?;
    debug!(
        path = %path.display(),
        rows = frame.len(),
        columns = frame.num_columns(),
        "loaded table"
    );
    Ok(frame)
}

pub fn read_delimited_str(input: &str, delimiter: u8) -> Result<DataFrame, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    let header_count = headers.len();
    let row_hint = input.len() / (header_count * 8).max(1);
    let mut fields: Vec<Vec<String>> = (0..header_count)
        .map(|_| Vec::with_capacity(row_hint))
        .collect();

    let mut row_count = 0_usize;
    for row in reader.records() {
        let record = row?;
        for (idx, col) in fields.iter_mut().enumerate() {
            col.push(record.get(idx).unwrap_or_default().trim().to_owned());
        }
        row_count += 1;
    }

    let columns = headers
        .iter()
        .zip(fields)
        .map(|(name, raw)| Ok((name.to_owned(), infer_column(raw)?)))
        .collect::<Result<Vec<_>, IoError>>()?;

    Ok(DataFrame::from_columns_with_rows(row_count, columns)?)
}

/// Type one column of raw fields: int64, then float64, then bool, else utf8.
/// Empty fields are missing; a column of only empty fields is `Null`.
fn infer_column(raw: Vec<String>) -> Result<Column, IoError> {
    let present = || raw.iter().filter(|field| !field.is_empty());

    if present().next().is_none() {
        let values = vec![Scalar::Null(NullKind::Null); raw.len()];
        return Ok(Column::new(DType::Null, values)?);
    }

    if present().all(|field| field.parse::<i64>().is_ok()) {
        return typed_column(&raw, DType::Int64, |field| {
            field.parse::<i64>().ok().map(Scalar::Int64)
        });
    }
    if present().all(|field| field.parse::<f64>().is_ok()) {
        return typed_column(&raw, DType::Float64, |field| {
            field.parse::<f64>().ok().map(Scalar::Float64)
        });
    }
    if present().all(|field| parse_bool(field).is_some()) {
        return typed_column(&raw, DType::Bool, |field| parse_bool(field).map(Scalar::Bool));
    }

    let values = raw
        .into_iter()
        .map(|field| {
            if field.is_empty() {
                Scalar::Null(NullKind::Null)
            } else {
                Scalar::Utf8(field)
            }
        })
        .collect();
    Ok(Column::new(DType::Utf8, values)?)
}

fn typed_column(
    raw: &[String],
    dtype: DType,
    parse: impl Fn(&str) -> Option<Scalar>,
) -> Result<Column, IoError> {
    let values = raw
        .iter()
        .map(|field| parse(field).unwrap_or_else(|| Scalar::missing_for_dtype(dtype)))
        .collect();
    Ok(Column::new(dtype, values)?)
}

fn parse_bool(field: &str) -> Option<bool> {
    match field {
        "true" | "True" | "TRUE" => Some(true),
        "false" | "False" | "FALSE" => Some(false),
        _ => None,
    }
}

pub fn write_csv_string(frame: &DataFrame) -> Result<String, IoError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    writer.write_record(frame.column_names())?;

    for row_idx in 0..frame.len() {
        let row = frame
            .iter_columns()
            .map(|(_, column)| column.value(row_idx).map_or_else(String::new, scalar_to_csv))
            .collect::<Vec<_>>();
        writer.write_record(&row)?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

fn scalar_to_csv(scalar: &Scalar) -> String {
    if scalar.is_missing() {
        return String::new();
    }
    scalar.to_string()
}
