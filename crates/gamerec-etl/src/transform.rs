//! Columnar transform stage: declarative steps applied to bounded chunks, with
//! `dedupe_by_key` acting as a barrier between row-local segments.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use gamerec_core::{normalize_tag, BatchError, Column, ColumnBatch, ColumnType, RowOrdinal, Value};
use gamerec_sources::{RawChunk, SourceError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("step `{step}` needs column `{column}`, which is not present")]
    MissingColumn { step: String, column: String },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("transform output rejected: {0}")]
    Sink(String),
}

/// A literal in a step definition; coerced to the target column's type when applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    fn value(&self) -> Value {
        match self {
            Literal::Bool(v) => Value::Bool(*v),
            Literal::Int(v) => Value::Int(*v),
            Literal::Float(v) => Value::Float(*v),
            Literal::Text(v) => Value::Text(v.clone()),
        }
    }

    fn kind(&self) -> ColumnType {
        match self {
            Literal::Bool(_) => ColumnType::Bool,
            Literal::Int(_) => ColumnType::Int,
            Literal::Float(_) => ColumnType::Float,
            Literal::Text(_) => ColumnType::Text,
        }
    }

    fn coerced(&self, kind: ColumnType) -> Value {
        cast_value(&self.value(), kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    Trim,
    Lowercase,
    CollapseWhitespace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    NotNull,
    AtLeast { value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum DeriveExpr {
    /// Null inputs count as zero unless every input is null.
    Sum { columns: Vec<String> },
    /// 0 when the denominator is 0.
    Ratio { numerator: String, denominator: String },
    /// "0 - 20,000" -> 10000.
    RangeMidpoint { column: String },
    /// First four-digit run in a date string.
    YearOf { column: String },
    /// UUIDv5 over the rendered inputs.
    StableKey { columns: Vec<String> },
    /// Union of delimited list columns as a tag set.
    JoinLists { columns: Vec<String> },
    /// First non-null input, rendered as text.
    Coalesce { columns: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformStep {
    /// No-op when `from` is absent, so alias lists can cover several source layouts.
    Rename { from: String, to: String },
    /// With `lenient_default`, unreadable and null cells take the default instead of
    /// becoming invalid.
    Cast {
        column: String,
        to: ColumnType,
        #[serde(default)]
        lenient_default: Option<Literal>,
    },
    Derive { column: String, expr: DeriveExpr },
    NormalizeText { column: String, mode: TextMode },
    FillNull { column: String, value: Literal },
    Filter { column: String, predicate: Predicate },
    Select { columns: Vec<String> },
    DedupeByKey {
        key: String,
        #[serde(default)]
        order_by: Option<String>,
    },
}

impl TransformStep {
    pub fn name(&self) -> &'static str {
        match self {
            TransformStep::Rename { .. } => "rename",
            TransformStep::Cast { .. } => "cast",
            TransformStep::Derive { .. } => "derive",
            TransformStep::NormalizeText { .. } => "normalize_text",
            TransformStep::FillNull { .. } => "fill_null",
            TransformStep::Filter { .. } => "filter",
            TransformStep::Select { .. } => "select",
            TransformStep::DedupeByKey { .. } => "dedupe_by_key",
        }
    }
}

const CURRENCY_SYMBOLS: &[char] = &['$', '£', '€', '¥'];

pub fn parse_int(raw: &str) -> Option<i64> {
    let cleaned = raw.trim().replace([',', '_'], "");
    if let Ok(v) = cleaned.parse::<i64>() {
        return Some(v);
    }
    let f = cleaned.parse::<f64>().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// Prices and other decimals: currency symbols and thousands separators are stripped,
/// "Free" reads as 0.
pub fn parse_float(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("free") || trimmed.eq_ignore_ascii_case("free to play") {
        return Some(0.0);
    }
    let cleaned = trimmed
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c) && *c != ',')
        .collect::<String>();
    cleaned.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" | "-1" => Some(false),
        _ => None,
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    ["%Y-%m-%d", "%b %d, %Y", "%d %b, %Y", "%B %d, %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn parse_tags(raw: &str) -> std::collections::BTreeSet<String> {
    raw.split([';', ',', '|'])
        .filter_map(normalize_tag)
        .collect()
}

fn first_year(raw: &str) -> Option<i64> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 4 {
                return raw[start..i].parse().ok();
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Midpoint of "lo - hi" (or a single number); 0 when unparseable, `None` when the
/// bounds overflow.
fn range_midpoint(raw: &str) -> Option<i64> {
    let cleaned = raw.replace(',', "");
    let parts = cleaned
        .split('-')
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>();
    match parts {
        Ok(parts) if !parts.is_empty() => parts
            .iter()
            .try_fold(0i64, |acc, v| acc.checked_add(*v))
            .map(|total| total / parts.len() as i64),
        _ => Some(0),
    }
}

pub fn cast_value(value: &Value, to: ColumnType) -> Value {
    let invalid = || Value::Invalid(value.render());
    match (value, to) {
        (Value::Null, _) => Value::Null,
        (Value::Invalid(_), _) => value.clone(),
        (_, ColumnType::Text) => match value {
            Value::Text(_) => value.clone(),
            other => Value::Text(other.render()),
        },
        (Value::Text(s), ColumnType::Int) => parse_int(s).map(Value::Int).unwrap_or_else(invalid),
        (Value::Text(s), ColumnType::Float) => {
            parse_float(s).map(Value::Float).unwrap_or_else(invalid)
        }
        (Value::Text(s), ColumnType::Bool) => parse_bool(s).map(Value::Bool).unwrap_or_else(invalid),
        (Value::Text(s), ColumnType::Timestamp) => parse_timestamp(s)
            .map(Value::Timestamp)
            .unwrap_or_else(invalid),
        (Value::Text(s), ColumnType::TagSet) => Value::Tags(parse_tags(s)),
        (Value::Int(v), ColumnType::Int) => Value::Int(*v),
        (Value::Int(v), ColumnType::Float) => Value::Float(*v as f64),
        (Value::Int(v), ColumnType::Bool) => match v {
            0 | -1 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => invalid(),
        },
        (Value::Int(v), ColumnType::Timestamp) => Utc
            .timestamp_opt(*v, 0)
            .single()
            .map(Value::Timestamp)
            .unwrap_or_else(invalid),
        (Value::Float(v), ColumnType::Float) => Value::Float(*v),
        (Value::Float(v), ColumnType::Int) if v.fract() == 0.0 && v.is_finite() => {
            Value::Int(*v as i64)
        }
        (Value::Bool(v), ColumnType::Bool) => Value::Bool(*v),
        (Value::Bool(v), ColumnType::Int) => Value::Int(i64::from(*v)),
        (Value::Timestamp(v), ColumnType::Timestamp) => Value::Timestamp(*v),
        (Value::Tags(v), ColumnType::TagSet) => Value::Tags(v.clone()),
        _ => invalid(),
    }
}

static NULL: Value = Value::Null;

fn cell<'a>(batch: &'a ColumnBatch, column: &str, row: usize) -> &'a Value {
    batch.value(column, row).unwrap_or(&NULL)
}

fn column_kind(batch: &ColumnBatch, column: &str) -> Option<ColumnType> {
    batch.column(column).map(|c| c.kind)
}

fn derive(batch: &ColumnBatch, expr: &DeriveExpr) -> (ColumnType, Vec<Value>) {
    let rows = 0..batch.num_rows();
    match expr {
        DeriveExpr::Sum { columns } => {
            let float = columns
                .iter()
                .any(|c| column_kind(batch, c) == Some(ColumnType::Float));
            let values = rows
                .map(|row| {
                    let cells = columns.iter().map(|c| cell(batch, c, row)).collect::<Vec<_>>();
                    if cells.iter().all(|v| v.is_null()) {
                        return Value::Null;
                    }
                    if let Some(bad) = cells.iter().find(|v| !v.is_null() && v.as_f64().is_none()) {
                        return Value::Invalid(bad.render());
                    }
                    if float {
                        return Value::Float(cells.iter().filter_map(|v| v.as_f64()).sum());
                    }
                    cells
                        .iter()
                        .filter_map(|v| v.as_i64())
                        .try_fold(0i64, |acc, v| acc.checked_add(v))
                        .map(Value::Int)
                        .unwrap_or_else(|| {
                            let parts = cells.iter().map(|v| v.render()).collect::<Vec<_>>();
                            Value::Invalid(parts.join(" + "))
                        })
                })
                .collect();
            (if float { ColumnType::Float } else { ColumnType::Int }, values)
        }
        DeriveExpr::Ratio {
            numerator,
            denominator,
        } => {
            let values = rows
                .map(|row| {
                    match (
                        cell(batch, numerator, row).as_f64(),
                        cell(batch, denominator, row).as_f64(),
                    ) {
                        (Some(_), Some(d)) if d == 0.0 => Value::Float(0.0),
                        (Some(n), Some(d)) => Value::Float(n / d),
                        _ => Value::Null,
                    }
                })
                .collect();
            (ColumnType::Float, values)
        }
        DeriveExpr::RangeMidpoint { column } => {
            let values = rows
                .map(|row| match cell(batch, column, row) {
                    Value::Null => Value::Null,
                    Value::Int(v) => Value::Int(*v),
                    other => {
                        let raw = other.render();
                        range_midpoint(&raw).map(Value::Int).unwrap_or(Value::Invalid(raw))
                    }
                })
                .collect();
            (ColumnType::Int, values)
        }
        DeriveExpr::YearOf { column } => {
            let values = rows
                .map(|row| match cell(batch, column, row) {
                    Value::Timestamp(ts) => Value::Int(i64::from(ts.year())),
                    Value::Null => Value::Null,
                    other => first_year(&other.render())
                        .map(Value::Int)
                        .unwrap_or(Value::Null),
                })
                .collect();
            (ColumnType::Int, values)
        }
        DeriveExpr::StableKey { columns } => {
            let values = rows
                .map(|row| {
                    let material = columns
                        .iter()
                        .map(|c| cell(batch, c, row).render())
                        .collect::<Vec<_>>()
                        .join("\u{1f}");
                    Value::Text(Uuid::new_v5(&Uuid::NAMESPACE_OID, material.as_bytes()).to_string())
                })
                .collect();
            (ColumnType::Text, values)
        }
        DeriveExpr::JoinLists { columns } => {
            let values = rows
                .map(|row| {
                    let mut tags = std::collections::BTreeSet::new();
                    for column in columns {
                        match cell(batch, column, row) {
                            Value::Null => {}
                            Value::Tags(t) => tags.extend(t.iter().cloned()),
                            other => tags.extend(parse_tags(&other.render())),
                        }
                    }
                    Value::Tags(tags)
                })
                .collect();
            (ColumnType::TagSet, values)
        }
        DeriveExpr::Coalesce { columns } => {
            let values = rows
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| cell(batch, c, row))
                        .find(|v| !v.is_null())
                        .map(|v| Value::Text(v.render()))
                        .unwrap_or(Value::Null)
                })
                .collect();
            (ColumnType::Text, values)
        }
    }
}

fn normalize(value: &Value, mode: TextMode) -> Value {
    let Value::Text(s) = value else {
        return value.clone();
    };
    // Postgres text cannot hold NUL.
    let s = s.replace('\0', "");
    let out = match mode {
        TextMode::Trim => s.trim().to_string(),
        TextMode::Lowercase => s.to_lowercase(),
        TextMode::CollapseWhitespace => s.split_whitespace().collect::<Vec<_>>().join(" "),
    };
    Value::Text(out)
}

/// Applies one row-local step. `DedupeByKey` is handled by the runtime, never here.
fn apply_step(step: &TransformStep, mut batch: ColumnBatch) -> Result<ColumnBatch, TransformError> {
    let rows = batch.num_rows();
    match step {
        TransformStep::Rename { from, to } => {
            batch.rename(from, to);
        }
        TransformStep::Cast {
            column,
            to,
            lenient_default,
        } => {
            let source = batch
                .column(column)
                .map(|c| c.values.clone())
                .unwrap_or_else(|| vec![Value::Null; rows]);
            let fallback = lenient_default.as_ref().map(|lit| lit.coerced(*to));
            let values = source
                .iter()
                .map(|v| match (cast_value(v, *to), &fallback) {
                    (Value::Null | Value::Invalid(_), Some(default)) => default.clone(),
                    (cast, _) => cast,
                })
                .collect();
            batch.put_column(Column::new(column.clone(), *to, values))?;
        }
        TransformStep::Derive { column, expr } => {
            let (kind, values) = derive(&batch, expr);
            batch.put_column(Column::new(column.clone(), kind, values))?;
        }
        TransformStep::NormalizeText { column, mode } => {
            if let Some(target) = batch.column_mut(column) {
                for value in target.values.iter_mut() {
                    *value = normalize(value, *mode);
                }
            }
        }
        TransformStep::FillNull { column, value } => match batch.column_mut(column) {
            Some(target) => {
                let fill = value.coerced(target.kind);
                for cell in target.values.iter_mut().filter(|v| v.is_null()) {
                    *cell = fill.clone();
                }
            }
            None => {
                let kind = value.kind();
                batch.put_column(Column::new(column.clone(), kind, vec![value.value(); rows]))?;
            }
        },
        TransformStep::Filter { column, predicate } => {
            let target = batch.column(column).ok_or_else(|| TransformError::MissingColumn {
                step: step.name().into(),
                column: column.clone(),
            })?;
            let keep = target
                .values
                .iter()
                .map(|v| match predicate {
                    Predicate::NotNull => !v.is_null(),
                    Predicate::AtLeast { value } => v.as_f64().is_some_and(|x| x >= *value),
                })
                .collect::<Vec<_>>();
            batch = batch.filter(&keep);
        }
        TransformStep::Select { columns } => {
            batch = batch.select(columns);
        }
        TransformStep::DedupeByKey { .. } => {}
    }
    Ok(batch)
}

fn apply_steps(steps: &[TransformStep], batch: ColumnBatch) -> Result<ColumnBatch, TransformError> {
    steps.iter().try_fold(batch, |batch, step| apply_step(step, batch))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum DedupKey {
    Int(i64),
    Text(String),
}

struct Winner {
    order: Option<f64>,
    ordinal: RowOrdinal,
    values: Vec<Value>,
}

impl Winner {
    /// Greater `order_by` value wins; missing orders lose to present ones; ties fall back
    /// to ingestion order, later rows winning.
    fn beats(&self, other: &Winner) -> bool {
        let by_order = match (self.order, other.order) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        by_order.then(self.ordinal.cmp(&other.ordinal)) == Ordering::Greater
    }
}

/// One retained row per key. Rows whose key is null or unreadable are passed through so
/// validation can reject them.
struct DedupeState {
    key: String,
    order_by: Option<String>,
    layout: Option<Vec<(String, ColumnType)>>,
    winners: BTreeMap<DedupKey, Winner>,
    passthrough: Vec<(RowOrdinal, Vec<Value>)>,
    dropped: u64,
}

fn order_value(value: &Value) -> Option<f64> {
    match value {
        Value::Timestamp(ts) => Some(ts.timestamp_millis() as f64),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        other => other.as_f64(),
    }
}

impl DedupeState {
    fn new(key: String, order_by: Option<String>) -> Self {
        Self {
            key,
            order_by,
            layout: None,
            winners: BTreeMap::new(),
            passthrough: Vec::new(),
            dropped: 0,
        }
    }

    fn absorb(&mut self, batch: ColumnBatch) -> Result<(), TransformError> {
        if batch.column(&self.key).is_none() {
            return Err(TransformError::MissingColumn {
                step: "dedupe_by_key".into(),
                column: self.key.clone(),
            });
        }
        let layout = self
            .layout
            .get_or_insert_with(|| {
                batch
                    .columns()
                    .iter()
                    .map(|c| (c.name.clone(), c.kind))
                    .collect()
            })
            .iter()
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        for row in 0..batch.num_rows() {
            let ordinal = batch.ordinals()[row];
            let values = batch.row_values(row, &layout);
            let key = match cell(&batch, &self.key, row) {
                Value::Int(v) => DedupKey::Int(*v),
                Value::Text(s) => DedupKey::Text(s.clone()),
                _ => {
                    self.passthrough.push((ordinal, values));
                    continue;
                }
            };
            let order = self
                .order_by
                .as_deref()
                .and_then(|c| order_value(cell(&batch, c, row)));
            let candidate = Winner {
                order,
                ordinal,
                values,
            };
            match self.winners.get_mut(&key) {
                Some(current) => {
                    if candidate.beats(current) {
                        *current = candidate;
                    }
                    self.dropped += 1;
                }
                None => {
                    self.winners.insert(key, candidate);
                }
            }
        }
        Ok(())
    }

    /// Winners sorted by key, then pass-through rows in ingestion order, in chunks.
    fn finish(self, chunk_rows: usize) -> Result<(Vec<ColumnBatch>, u64), TransformError> {
        let Some(layout) = self.layout else {
            return Ok((Vec::new(), self.dropped));
        };
        let rows = self
            .winners
            .into_values()
            .map(|w| (w.ordinal, w.values))
            .chain(self.passthrough)
            .collect::<Vec<_>>();
        let mut out = Vec::new();
        for chunk in rows.chunks(chunk_rows.max(1)) {
            let mut columns = layout
                .iter()
                .map(|(name, kind)| Column::new(name.clone(), *kind, Vec::with_capacity(chunk.len())))
                .collect::<Vec<_>>();
            let mut ordinals = Vec::with_capacity(chunk.len());
            for (ordinal, values) in chunk {
                ordinals.push(*ordinal);
                for (column, value) in columns.iter_mut().zip(values) {
                    column.values.push(value.clone());
                }
            }
            out.push(ColumnBatch::new(columns, ordinals)?);
        }
        Ok((out, self.dropped))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformStats {
    pub chunks_in: u64,
    pub rows_in: u64,
    pub rows_out: u64,
    pub duplicates_dropped: u64,
    pub rows_filtered: u64,
}

struct Segment<'a> {
    steps: &'a [TransformStep],
    dedupe: Option<(&'a str, Option<&'a str>)>,
}

fn chunk_to_batch(chunk: Result<RawChunk, SourceError>) -> Result<ColumnBatch, TransformError> {
    Ok(chunk?.into_batch()?)
}

/// Runs a step plan over chunked input. Row-local steps run on windows of `parallelism`
/// chunks at a time, and results are reassembled in input order.
#[derive(Debug, Clone)]
pub struct TransformStage {
    steps: Vec<TransformStep>,
    parallelism: usize,
    chunk_rows: usize,
}

impl TransformStage {
    pub fn new(steps: Vec<TransformStep>, parallelism: usize, chunk_rows: usize) -> Self {
        Self {
            steps,
            parallelism: parallelism.max(1),
            chunk_rows: chunk_rows.max(1),
        }
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    fn segments(&self) -> Vec<Segment<'_>> {
        let mut segments = Vec::new();
        let mut start = 0;
        for (idx, step) in self.steps.iter().enumerate() {
            if let TransformStep::DedupeByKey { key, order_by } = step {
                segments.push(Segment {
                    steps: &self.steps[start..idx],
                    dedupe: Some((key.as_str(), order_by.as_deref())),
                });
                start = idx + 1;
            }
        }
        segments.push(Segment {
            steps: &self.steps[start..],
            dedupe: None,
        });
        segments
    }

    /// Streams `chunks` through the plan, handing each output batch to `sink` in order.
    /// An empty input produces no batches and zeroed stats.
    pub fn run<I, F>(&self, chunks: I, mut sink: F) -> Result<TransformStats, TransformError>
    where
        I: Iterator<Item = Result<RawChunk, SourceError>>,
        F: FnMut(ColumnBatch) -> Result<(), TransformError>,
    {
        let mut stats = TransformStats::default();
        let segments = self.segments();
        let mut counted = CountingStream {
            inner: chunks.map(chunk_to_batch),
            chunks: 0,
            rows: 0,
        };
        self.drive(&segments, &mut counted, &mut sink, &mut stats)?;
        stats.chunks_in = counted.chunks;
        stats.rows_in = counted.rows;
        stats.rows_filtered = stats
            .rows_in
            .saturating_sub(stats.rows_out)
            .saturating_sub(stats.duplicates_dropped);
        Ok(stats)
    }

    #[cfg(test)]
    fn run_collect<I>(&self, chunks: I) -> Result<(Vec<ColumnBatch>, TransformStats), TransformError>
    where
        I: Iterator<Item = Result<RawChunk, SourceError>>,
    {
        let mut out = Vec::new();
        let stats = self.run(chunks, |batch| {
            out.push(batch);
            Ok(())
        })?;
        Ok((out, stats))
    }

    fn drive(
        &self,
        segments: &[Segment<'_>],
        input: &mut dyn Iterator<Item = Result<ColumnBatch, TransformError>>,
        sink: &mut dyn FnMut(ColumnBatch) -> Result<(), TransformError>,
        stats: &mut TransformStats,
    ) -> Result<(), TransformError> {
        let Some((segment, rest)) = segments.split_first() else {
            return Ok(());
        };
        let mut dedupe = segment
            .dedupe
            .map(|(key, order_by)| DedupeState::new(key.to_string(), order_by.map(str::to_string)));

        loop {
            let window = (&mut *input)
                .take(self.parallelism)
                .collect::<Result<Vec<_>, _>>()?;
            if window.is_empty() {
                break;
            }
            let processed = window
                .into_par_iter()
                .map(|batch| apply_steps(segment.steps, batch))
                .collect::<Result<Vec<_>, _>>()?;
            for batch in processed {
                match dedupe.as_mut() {
                    Some(state) => state.absorb(batch)?,
                    None => {
                        stats.rows_out += batch.num_rows() as u64;
                        debug!(rows = batch.num_rows(), "transformed batch");
                        sink(batch)?;
                    }
                }
            }
        }

        if let Some(state) = dedupe {
            let (batches, dropped) = state.finish(self.chunk_rows)?;
            stats.duplicates_dropped += dropped;
            let mut next = batches.into_iter().map(Ok::<ColumnBatch, TransformError>);
            self.drive(rest, &mut next, sink, stats)?;
        }
        Ok(())
    }
}

struct CountingStream<S> {
    inner: S,
    chunks: u64,
    rows: u64,
}

impl<S> Iterator for CountingStream<S>
where
    S: Iterator<Item = Result<ColumnBatch, TransformError>>,
{
    type Item = Result<ColumnBatch, TransformError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if let Ok(batch) = &item {
            self.chunks += 1;
            self.rows += batch.num_rows() as u64;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(source_index: u32, first_row: u64, headers: &[&str], rows: &[&[&str]]) -> RawChunk {
        RawChunk {
            source_index,
            first_row,
            headers: Arc::new(headers.iter().map(|h| h.to_string()).collect()),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    fn steps(yaml: &str) -> Vec<TransformStep> {
        serde_yaml::from_str(yaml).expect("steps yaml")
    }

    #[test]
    fn price_parsing_strips_currency_and_maps_free() {
        assert_eq!(parse_float("$19.99"), Some(19.99));
        assert_eq!(parse_float("£1,299.00"), Some(1299.0));
        assert_eq!(parse_float("Free"), Some(0.0));
        assert_eq!(parse_float("-5"), Some(-5.0));
        assert_eq!(parse_float("n/a"), None);
        assert_eq!(parse_int("20,000"), Some(20_000));
        assert_eq!(parse_int("12.0"), Some(12));
        assert_eq!(parse_int("12.5"), None);
    }

    #[test]
    fn timestamps_accept_epoch_and_store_dates() {
        assert_eq!(parse_timestamp("0").map(|t| t.timestamp()), Some(0));
        assert_eq!(
            parse_timestamp("Oct 21, 2008").map(|t| t.year()),
            Some(2008)
        );
        assert!(parse_timestamp("2024-03-01T10:00:00Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn derive_expressions_match_catalog_rules() {
        let plan = steps(
            r#"
- { op: cast, column: positive, to: int, lenient_default: 0 }
- { op: cast, column: negative, to: int, lenient_default: 0 }
- { op: derive, column: total, expr: { fn: sum, columns: [positive, negative] } }
- { op: derive, column: ratio, expr: { fn: ratio, numerator: positive, denominator: total } }
- { op: derive, column: owners, expr: { fn: range_midpoint, column: owners_raw } }
- { op: derive, column: year, expr: { fn: year_of, column: released } }
- { op: derive, column: tags, expr: { fn: join_lists, columns: [genres, extra] } }
"#,
        );
        let stage = TransformStage::new(plan, 2, 100);
        let input = chunk(
            0,
            0,
            &["positive", "negative", "owners_raw", "released", "genres", "extra"],
            &[
                &["8", "2", "0 - 20,000", "Oct 21, 2008", "RPG;Indie", "Indie, Co-op"],
                &["", "junk", "", "", "", ""],
            ],
        );
        let (out, stats) = stage.run_collect(vec![Ok(input)].into_iter()).unwrap();
        let batch = &out[0];
        assert_eq!(stats.rows_in, 2);
        assert_eq!(batch.value("total", 0), Some(&Value::Int(10)));
        assert_eq!(batch.value("ratio", 0), Some(&Value::Float(0.8)));
        assert_eq!(batch.value("ratio", 1), Some(&Value::Float(0.0)));
        assert_eq!(batch.value("owners", 0), Some(&Value::Int(10_000)));
        assert_eq!(batch.value("year", 0), Some(&Value::Int(2008)));
        assert_eq!(batch.value("year", 1), Some(&Value::Null));
        let tags = batch.value("tags", 0).and_then(Value::as_tags).unwrap();
        assert_eq!(
            tags.iter().cloned().collect::<Vec<_>>(),
            vec!["Co-op".to_string(), "Indie".to_string(), "RPG".to_string()]
        );
    }

    #[test]
    fn text_normalization_strips_nul_bytes() {
        assert_eq!(
            normalize(&Value::Text(" Half\0 Life ".into()), TextMode::CollapseWhitespace),
            Value::Text("Half Life".into())
        );
        assert_eq!(
            normalize(&Value::Text("\0english ".into()), TextMode::Trim),
            Value::Text("english".into())
        );
    }

    #[test]
    fn overflowing_sums_and_ranges_become_invalid() {
        let plan = steps(
            r#"
- { op: cast, column: positive, to: int }
- { op: cast, column: negative, to: int }
- { op: derive, column: total, expr: { fn: sum, columns: [positive, negative] } }
- { op: derive, column: owners, expr: { fn: range_midpoint, column: owners_raw } }
"#,
        );
        let stage = TransformStage::new(plan, 1, 100);
        let input = chunk(
            0,
            0,
            &["positive", "negative", "owners_raw"],
            &[
                &["9223372036854775807", "1", "9223372036854775807 - 9223372036854775807"],
                &["9223372036854775806", "1", "9223372036854775806 - 0"],
            ],
        );
        let (out, _) = stage.run_collect(vec![Ok(input)].into_iter()).unwrap();
        let batch = &out[0];
        assert!(matches!(batch.value("total", 0), Some(Value::Invalid(_))));
        assert!(matches!(batch.value("owners", 0), Some(Value::Invalid(_))));
        assert_eq!(batch.value("total", 1), Some(&Value::Int(i64::MAX)));
        assert_eq!(batch.value("owners", 1), Some(&Value::Int(4_611_686_018_427_387_903)));
    }

    #[test]
    fn strict_cast_marks_invalid_and_fill_null_only_touches_nulls() {
        let plan = steps(
            r#"
- { op: cast, column: price, to: float }
- { op: fill_null, column: price, value: 0 }
"#,
        );
        let stage = TransformStage::new(plan, 1, 100);
        let input = chunk(0, 0, &["price"], &[&["abc"], &[""], &["Free"]]);
        let (out, _) = stage.run_collect(vec![Ok(input)].into_iter()).unwrap();
        assert_eq!(out[0].value("price", 0), Some(&Value::Invalid("abc".into())));
        assert_eq!(out[0].value("price", 1), Some(&Value::Float(0.0)));
        assert_eq!(out[0].value("price", 2), Some(&Value::Float(0.0)));
    }

    #[test]
    fn output_order_is_independent_of_parallelism() {
        let plan = steps(
            r#"
- { op: rename, from: AppID, to: game_id }
- { op: cast, column: game_id, to: int }
- { op: filter, column: game_id, predicate: { kind: at_least, value: 0 } }
"#,
        );
        let chunks = || {
            (0..8u64)
                .map(|i| {
                    let id = i.to_string();
                    Ok(chunk(0, i, &["AppID"], &[&[id.as_str()]]))
                })
                .collect::<Vec<_>>()
                .into_iter()
        };
        let ids = |parallelism| {
            let (out, _) = TransformStage::new(plan.clone(), parallelism, 100)
                .run_collect(chunks())
                .unwrap();
            out.iter()
                .flat_map(|b| b.column("game_id").unwrap().values.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(1), ids(4));
        assert_eq!(ids(3).len(), 8);
    }

    #[test]
    fn dedupe_keeps_most_recent_by_order_then_ingestion() {
        let plan = steps(
            r#"
- { op: cast, column: id, to: int }
- { op: cast, column: updated, to: int }
- { op: dedupe_by_key, key: id, order_by: updated }
"#,
        );
        let stage = TransformStage::new(plan, 2, 100);
        let chunks = vec![
            Ok(chunk(0, 0, &["id", "title", "updated"], &[&["2", "old", "5"], &["1", "first", ""]])),
            Ok(chunk(1, 0, &["id", "title", "updated"], &[&["2", "new", "9"], &["1", "second", ""]])),
            Ok(chunk(1, 2, &["id", "title", "updated"], &[&["2", "stale", "7"], &["", "nokey", "1"]])),
        ];
        let (out, stats) = stage.run_collect(chunks.into_iter()).unwrap();
        let batch = ColumnBatch::concat(out);
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(stats.duplicates_dropped, 3);
        // Winners come out sorted by key, then the null-key row.
        assert_eq!(batch.value("id", 0), Some(&Value::Int(1)));
        assert_eq!(batch.value("title", 0), Some(&Value::Text("second".into())));
        assert_eq!(batch.value("title", 1), Some(&Value::Text("new".into())));
        assert_eq!(batch.value("id", 2), Some(&Value::Null));
    }

    #[test]
    fn empty_source_is_an_empty_result() {
        let plan = steps("- { op: dedupe_by_key, key: id }");
        let stage = TransformStage::new(plan, 4, 10);
        let (out, stats) = stage.run_collect(std::iter::empty()).unwrap();
        assert!(out.is_empty());
        assert_eq!(stats, TransformStats::default());
    }

    #[test]
    fn filter_on_absent_column_is_a_contract_error() {
        let plan = steps("- { op: filter, column: game_id, predicate: { kind: not_null } }");
        let stage = TransformStage::new(plan, 1, 10);
        let err = stage
            .run_collect(vec![Ok(chunk(0, 0, &["Name"], &[&["x"]]))].into_iter())
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingColumn { .. }));
    }
}
