//! Reconciles heterogeneous raw records into a table matching the fixed schema.
//!
//! Columns are processed in lexicographic order so the outcome never depends
//! on the order fields arrived in. Every column goes through an explicit
//! fallible parse; a strict pass is tried first and a lenient salvage pass
//! second. Values that survive neither mark their record as malformed, and a
//! column where nothing parses is replaced by its defaults.

use arrow::array::{ArrayRef, BooleanArray, Int64Array, StringArray, TimestampMillisecondArray};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{IngestionError, SchemaCoercionError};
use crate::record::Record;
use crate::schema::{Coercion, ColumnSpec, ColumnType, FixedSchema, TIMESTAMP_ZONE};

const SAMPLE_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Strict,
    Lenient,
}

/// A record dropped because one of its values could not be represented.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedRecord {
    pub index: usize,
    pub column: String,
    pub sample: String,
}

/// What normalization had to do to make a raw batch fit the schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalvageReport {
    pub input_rows: usize,
    pub output_rows: usize,
    /// Schema columns absent from the raw batch, filled with defaults.
    pub synthesized_columns: Vec<String>,
    /// Columns that failed strict coercion but were recovered leniently.
    pub salvaged_columns: Vec<String>,
    /// Raw columns that were discarded: undeclared or unrepresentable.
    pub dropped_columns: Vec<String>,
    pub dropped_records: Vec<DroppedRecord>,
}

impl SalvageReport {
    pub fn is_clean(&self) -> bool {
        self.salvaged_columns.is_empty()
            && self.dropped_columns.is_empty()
            && self.dropped_records.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub batch: RecordBatch,
    pub report: SalvageReport,
}

pub struct SchemaNormalizer {
    schema: FixedSchema,
}

impl SchemaNormalizer {
    pub fn new(schema: FixedSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &FixedSchema {
        &self.schema
    }

    pub fn normalize(&self, records: &[Record]) -> Result<NormalizedBatch, IngestionError> {
        let rows = records.len();
        let mut report = SalvageReport {
            input_rows: rows,
            ..Default::default()
        };

        let present: BTreeSet<&str> = records.iter().flat_map(|r| r.field_names()).collect();
        let mut canonical = present.clone();
        canonical.extend(self.schema.names());

        let absent = vec![None; rows];
        let mut coerced: HashMap<&str, ColumnValues> = HashMap::with_capacity(self.schema.len());
        let mut malformed: BTreeMap<usize, DroppedRecord> = BTreeMap::new();
        let mut surviving = 0usize;

        for name in canonical {
            let Some(spec) = self.schema.column(name) else {
                debug!("Dropping column '{}' not declared in schema", name);
                report.dropped_columns.push(name.to_string());
                continue;
            };

            if !present.contains(name) {
                report.synthesized_columns.push(name.to_string());
                coerced.insert(name, coerce_column(spec, &absent, Mode::Strict).values);
                continue;
            }

            let raw: Vec<Option<&Value>> = records.iter().map(|r| r.get(name)).collect();
            let strict = coerce_column(spec, &raw, Mode::Strict);
            if strict.failures.is_empty() {
                surviving += 1;
                coerced.insert(name, strict.values);
                continue;
            }

            let salvaged = coerce_column(spec, &raw, Mode::Lenient);
            if salvaged.parsed == 0 {
                warn!(
                    column = name,
                    failures = salvaged.failures.len(),
                    "Column cannot be represented as {:?}, replacing with defaults (first value: {})",
                    spec.column_type,
                    salvaged.failures.first().map(|f| f.sample.as_str()).unwrap_or("")
                );
                report.dropped_columns.push(name.to_string());
                coerced.insert(name, coerce_column(spec, &absent, Mode::Strict).values);
                continue;
            }

            debug!(
                "Salvaged column '{}' ({} values unrecoverable)",
                name,
                salvaged.failures.len()
            );
            surviving += 1;
            report.salvaged_columns.push(name.to_string());
            for failure in salvaged.failures {
                malformed.entry(failure.row).or_insert(DroppedRecord {
                    index: failure.row,
                    column: name.to_string(),
                    sample: failure.sample,
                });
            }
            coerced.insert(name, salvaged.values);
        }

        if rows > 0 && surviving == 0 {
            return Err(SchemaCoercionError::NoSurvivingColumns {
                rows,
                dropped: report.dropped_columns.len(),
            }
            .into());
        }

        if let Some(first) = malformed.values().next() {
            warn!(
                dropped = malformed.len(),
                rows,
                "Dropping malformed records; sample #{} column '{}': {}",
                first.index,
                first.column,
                first.sample
            );
        }

        let keep: Vec<bool> = (0..rows).map(|i| !malformed.contains_key(&i)).collect();
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.schema.len());
        for spec in self.schema.columns() {
            let values = coerced.remove(spec.name.as_str()).ok_or_else(|| {
                SchemaCoercionError::Assembly {
                    reason: format!("column '{}' was not produced", spec.name),
                }
            })?;
            arrays.push(values.into_array(&keep));
        }

        let batch = RecordBatch::try_new(self.schema.arrow_schema(), arrays).map_err(|e| {
            SchemaCoercionError::Assembly {
                reason: e.to_string(),
            }
        })?;
        self.schema.verify(batch.schema().as_ref())?;

        report.output_rows = batch.num_rows();
        report.dropped_records = malformed.into_values().collect();

        Ok(NormalizedBatch { batch, report })
    }
}

/// Typed cells of one column, before malformed rows are filtered out.
enum ColumnValues {
    Text(Vec<Option<String>>),
    Int(Vec<Option<i64>>),
    Bool(Vec<Option<bool>>),
    Millis(Vec<Option<i64>>),
}

impl ColumnValues {
    fn into_array(self, keep: &[bool]) -> ArrayRef {
        match self {
            ColumnValues::Text(cells) => Arc::new(StringArray::from(retain(cells, keep))),
            ColumnValues::Int(cells) => Arc::new(Int64Array::from(retain(cells, keep))),
            ColumnValues::Bool(cells) => Arc::new(BooleanArray::from(retain(cells, keep))),
            ColumnValues::Millis(cells) => Arc::new(
                TimestampMillisecondArray::from(retain(cells, keep)).with_timezone(TIMESTAMP_ZONE),
            ),
        }
    }
}

fn retain<T>(cells: Vec<Option<T>>, keep: &[bool]) -> Vec<Option<T>> {
    cells
        .into_iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(cell, _)| cell)
        .collect()
}

struct ColumnFailure {
    row: usize,
    sample: String,
}

struct CoercedColumn {
    values: ColumnValues,
    failures: Vec<ColumnFailure>,
    /// Non-null raw values that parsed successfully.
    parsed: usize,
}

struct Cells<T> {
    cells: Vec<Option<T>>,
    failures: Vec<ColumnFailure>,
    parsed: usize,
}

fn coerce_column(spec: &ColumnSpec, raw: &[Option<&Value>], mode: Mode) -> CoercedColumn {
    macro_rules! column {
        ($variant:ident, $parse:expr, $fill:expr, $blank_is_null:expr) => {{
            let fallback = $fill.or_else(|| default_cell(&spec.default, $parse));
            let c = coerce_cells(raw, fallback, mode, $blank_is_null, $parse);
            CoercedColumn {
                values: ColumnValues::$variant(c.cells),
                failures: c.failures,
                parsed: c.parsed,
            }
        }};
    }

    match (spec.column_type, spec.coercion) {
        (ColumnType::Utf8, Coercion::JsonText) => column!(Text, parse_json_text, None, false),
        (ColumnType::Utf8, _) => column!(Text, parse_text, None, false),
        (ColumnType::Int64, Coercion::FillZero) => column!(Int, parse_int, Some(0), true),
        (ColumnType::Int64, _) => column!(Int, parse_int, None, true),
        (ColumnType::Boolean, Coercion::FillFalse) => column!(Bool, parse_bool, Some(false), true),
        (ColumnType::Boolean, _) => column!(Bool, parse_bool, None, true),
        (ColumnType::Timestamp, _) => column!(Millis, parse_timestamp, None, true),
    }
}

fn default_cell<T>(default: &Value, parse: fn(&Value, Mode) -> Option<T>) -> Option<T> {
    if default.is_null() {
        None
    } else {
        parse(default, Mode::Lenient)
    }
}

fn coerce_cells<T: Clone>(
    raw: &[Option<&Value>],
    fallback: Option<T>,
    mode: Mode,
    blank_is_null: bool,
    parse: fn(&Value, Mode) -> Option<T>,
) -> Cells<T> {
    let mut out = Cells {
        cells: Vec::with_capacity(raw.len()),
        failures: Vec::new(),
        parsed: 0,
    };
    for (row, value) in raw.iter().enumerate() {
        let value = match value {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if blank_is_null && mode == Mode::Lenient && s.trim().is_empty() => {
                None
            }
            Some(v) => Some(*v),
        };
        match value {
            None => out.cells.push(fallback.clone()),
            Some(v) => match parse(v, mode) {
                Some(parsed) => {
                    out.parsed += 1;
                    out.cells.push(Some(parsed));
                }
                None => {
                    out.failures.push(ColumnFailure {
                        row,
                        sample: sample(v),
                    });
                    out.cells.push(fallback.clone());
                }
            },
        }
    }
    out
}

/// Text passes through. Other values only become text when a column is
/// salvaged.
fn parse_text(value: &Value, mode: Mode) -> Option<String> {
    match (value, mode) {
        (Value::String(s), _) => Some(s.clone()),
        (other, Mode::Lenient) => Some(canonical_json(other)),
        _ => None,
    }
}

/// Text passes through; nested values are serialized as JSON with sorted keys.
fn parse_json_text(value: &Value, _mode: Mode) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        other => Some(canonical_json(other)),
    }
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

fn parse_int(value: &Value, mode: Mode) -> Option<i64> {
    match (value, mode) {
        (Value::Number(n), _) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e18)
                .map(|f| f as i64)
        }),
        (Value::String(s), Mode::Lenient) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e18)
                    .map(|f| f as i64)
            })
        }
        (Value::Bool(b), Mode::Lenient) => Some(i64::from(*b)),
        _ => None,
    }
}

fn parse_bool(value: &Value, mode: Mode) -> Option<bool> {
    match (value, mode) {
        (Value::Bool(b), _) => Some(*b),
        (Value::String(s), Mode::Lenient) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        (Value::Number(n), Mode::Lenient) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

fn parse_timestamp(value: &Value, mode: Mode) -> Option<i64> {
    match (value, mode) {
        (Value::Number(n), _) => n.as_i64(),
        (Value::String(s), Mode::Strict) => parse_timestamp_text(s),
        (Value::String(s), Mode::Lenient) => {
            parse_timestamp_text(s).or_else(|| s.trim().parse::<i64>().ok())
        }
        _ => None,
    }
}

/// Parses the timestamp layouts the sources are known to emit, to epoch
/// milliseconds.
pub fn parse_timestamp_text(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%a %b %d %H:%M:%S %z %Y") {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S %z") {
        return Some(dt.timestamp_millis());
    }
    let naive = s.strip_suffix(" UTC").unwrap_or(s);
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn sample(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > SAMPLE_CHARS {
        let cut: String = rendered.chars().take(SAMPLE_CHARS).collect();
        format!("{cut}...")
    } else {
        rendered
    }
}
