//! Schema validation: per-row rule checks that partition a batch into conforming and
//! rejected rows and feed the run's validation report.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use gamerec_core::{
    ColumnBatch, ColumnType, DatasetCounts, Rejection, RowOrdinal, RuleKind, ValidationReport,
    Value,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRule {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub allowed: Option<Vec<String>>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub dataset: String,
    pub columns: Vec<ColumnRule>,
}

/// A malformed schema declaration. Always fatal for the run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("{dataset}: column {column} declared more than once")]
    DuplicateColumn { dataset: String, column: String },
    #[error("{dataset}: column {column} has min {min} greater than max {max}")]
    InvertedRange {
        dataset: String,
        column: String,
        min: f64,
        max: f64,
    },
    #[error("{dataset}: column {column} declares allowed values but is not text")]
    AllowedOnNonText { dataset: String, column: String },
    #[error("{dataset}: column {column} declares a range but is not numeric")]
    RangeOnNonNumeric { dataset: String, column: String },
    #[error("{dataset}: declared column {column} is absent from the batch")]
    MissingColumn { dataset: String, column: String },
}

impl DatasetSchema {
    pub fn check(&self) -> Result<(), SchemaError> {
        let mut names = HashSet::new();
        for rule in &self.columns {
            let err_ctx = || (self.dataset.clone(), rule.name.clone());
            if !names.insert(rule.name.as_str()) {
                let (dataset, column) = err_ctx();
                return Err(SchemaError::DuplicateColumn { dataset, column });
            }
            if let (Some(min), Some(max)) = (rule.min, rule.max) {
                if min > max {
                    let (dataset, column) = err_ctx();
                    return Err(SchemaError::InvertedRange {
                        dataset,
                        column,
                        min,
                        max,
                    });
                }
            }
            let numeric = matches!(rule.kind, ColumnType::Int | ColumnType::Float);
            if (rule.min.is_some() || rule.max.is_some()) && !numeric {
                let (dataset, column) = err_ctx();
                return Err(SchemaError::RangeOnNonNumeric { dataset, column });
            }
            if rule.allowed.is_some() && rule.kind != ColumnType::Text {
                let (dataset, column) = err_ctx();
                return Err(SchemaError::AllowedOnNonText { dataset, column });
            }
        }
        Ok(())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

fn kind_label(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Text => "text",
        ColumnType::Int => "int",
        ColumnType::Float => "float",
        ColumnType::Bool => "bool",
        ColumnType::Timestamp => "timestamp",
        ColumnType::TagSet => "tag set",
    }
}

/// Rule checks for one cell, excluding uniqueness.
fn check_cell(rule: &ColumnRule, value: &Value) -> Option<(RuleKind, String)> {
    match value {
        Value::Null if rule.nullable => return None,
        Value::Null => return Some((RuleKind::NullViolation, "missing value".into())),
        Value::Invalid(raw) => {
            return Some((
                RuleKind::TypeMismatch,
                format!("cannot read {raw:?} as {}", kind_label(rule.kind)),
            ))
        }
        Value::Float(v) if !v.is_finite() => {
            return Some((RuleKind::TypeMismatch, format!("non-finite number {v}")))
        }
        Value::Text(s) if s.contains('\0') => {
            return Some((RuleKind::TypeMismatch, "text contains a NUL byte".into()))
        }
        Value::Tags(tags) if tags.iter().any(|t| t.contains('\0')) => {
            return Some((RuleKind::TypeMismatch, "tag contains a NUL byte".into()))
        }
        _ => {}
    }
    if !value.fits(rule.kind) {
        return Some((
            RuleKind::TypeMismatch,
            format!("{:?} is not {}", value, kind_label(rule.kind)),
        ));
    }
    if let Some(x) = value.as_f64() {
        if let Some(min) = rule.min.filter(|min| x < *min) {
            return Some((RuleKind::RangeViolation, format!("{x} below minimum {min}")));
        }
        if let Some(max) = rule.max.filter(|max| x > *max) {
            return Some((RuleKind::RangeViolation, format!("{x} above maximum {max}")));
        }
    }
    if let (Some(allowed), Some(text)) = (&rule.allowed, value.as_text()) {
        if !allowed.iter().any(|a| a == text) {
            return Some((RuleKind::NotAllowed, format!("{text:?} not in allowed set")));
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub accepted: ColumnBatch,
    pub rejected: Vec<Rejection>,
}

/// Validates batches of one dataset against its schema. Uniqueness is tracked across every
/// batch the validator sees during a run.
#[derive(Debug)]
pub struct SchemaValidator {
    schema: DatasetSchema,
    seen: HashMap<String, HashSet<String>>,
}

impl SchemaValidator {
    pub fn new(schema: DatasetSchema) -> Result<Self, SchemaError> {
        schema.check()?;
        let seen = schema
            .columns
            .iter()
            .filter(|c| c.unique)
            .map(|c| (c.name.clone(), HashSet::new()))
            .collect();
        Ok(Self { schema, seen })
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    /// Splits `batch` into accepted and rejected rows. Each rejected row carries the first
    /// rule it broke, in declared column order; uniqueness is checked last. Data problems
    /// never fail; only a declared column missing from the batch does.
    pub fn validate(
        &mut self,
        batch: &ColumnBatch,
        report: &mut ValidationReportBuilder,
    ) -> Result<Partition, SchemaError> {
        let dataset = self.schema.dataset.clone();
        if batch.columns().is_empty() && batch.is_empty() {
            return Ok(Partition {
                accepted: batch.clone(),
                rejected: Vec::new(),
            });
        }
        let mut columns = Vec::with_capacity(self.schema.columns.len());
        for rule in &self.schema.columns {
            let column = batch
                .column(&rule.name)
                .ok_or_else(|| SchemaError::MissingColumn {
                    dataset: dataset.clone(),
                    column: rule.name.clone(),
                })?;
            columns.push((rule, column));
        }

        let mut keep = Vec::with_capacity(batch.num_rows());
        let mut rejected = Vec::new();
        for row in 0..batch.num_rows() {
            let ordinal = batch.ordinals()[row];
            let violation = columns.iter().find_map(|(rule, column)| {
                check_cell(rule, &column.values[row]).map(|(kind, detail)| (rule.name.clone(), kind, detail))
            });
            let violation = violation.or_else(|| {
                columns
                    .iter()
                    .filter(|(rule, _)| rule.unique)
                    .find_map(|(rule, column)| {
                        let value = &column.values[row];
                        if value.is_null() {
                            return None;
                        }
                        let key = value.render();
                        self.seen
                            .get(&rule.name)
                            .is_some_and(|seen| seen.contains(&key))
                            .then(|| {
                                (
                                    rule.name.clone(),
                                    RuleKind::DuplicateKey,
                                    format!("{key} already seen in this run"),
                                )
                            })
                    })
            });

            match violation {
                Some((column, rule, detail)) => {
                    keep.push(false);
                    rejected.push(Rejection {
                        dataset: dataset.clone(),
                        ordinal,
                        rule,
                        column,
                        detail,
                    });
                }
                None => {
                    keep.push(true);
                    for (rule, column) in columns.iter().filter(|(rule, _)| rule.unique) {
                        let value = &column.values[row];
                        if !value.is_null() {
                            if let Some(seen) = self.seen.get_mut(&rule.name) {
                                seen.insert(value.render());
                            }
                        }
                    }
                }
            }
        }

        if !rejected.is_empty() {
            warn!(
                dataset = %dataset,
                rejected = rejected.len(),
                rows = batch.num_rows(),
                "rows failed validation"
            );
        }
        report.record_examined(&dataset, batch.num_rows() as u64);
        report.record_rejections(rejected.iter().cloned());

        let accepted = batch.filter(&keep).select(&self.schema.column_names());
        Ok(Partition { accepted, rejected })
    }
}

/// Accumulates one run's audit record; `finish` freezes it into a [`ValidationReport`].
#[derive(Debug, Clone)]
pub struct ValidationReportBuilder {
    run_id: Uuid,
    created_at: DateTime<Utc>,
    datasets: BTreeMap<String, DatasetCounts>,
    rejections: Vec<Rejection>,
}

impl ValidationReportBuilder {
    pub fn new(run_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            created_at,
            datasets: BTreeMap::new(),
            rejections: Vec::new(),
        }
    }

    /// Registers a dataset so it shows up in the report even with no rows.
    pub fn register(&mut self, dataset: &str) {
        self.datasets.entry(dataset.to_string()).or_default();
    }

    pub fn record_examined(&mut self, dataset: &str, rows: u64) {
        self.datasets.entry(dataset.to_string()).or_default().examined += rows;
    }

    pub fn record_rejections(&mut self, rejections: impl IntoIterator<Item = Rejection>) {
        for rejection in rejections {
            self.datasets
                .entry(rejection.dataset.clone())
                .or_default()
                .rejected += 1;
            self.rejections.push(rejection);
        }
    }

    /// Folds counts and rejections gathered elsewhere (for one batch) into this report.
    pub fn merge(&mut self, other: ValidationReportBuilder) {
        for (dataset, counts) in other.datasets {
            let entry = self.datasets.entry(dataset).or_default();
            entry.examined += counts.examined;
            entry.rejected += counts.rejected;
        }
        self.rejections.extend(other.rejections);
    }

    /// Rows rejected so far for `dataset`, by ordinal.
    pub fn rejected_ordinals(&self, dataset: &str) -> BTreeSet<RowOrdinal> {
        self.rejections
            .iter()
            .filter(|r| r.dataset == dataset)
            .map(|r| r.ordinal)
            .collect()
    }

    pub fn finish(self) -> ValidationReport {
        ValidationReport::new(self.run_id, self.created_at, self.datasets, self.rejections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamerec_core::Column;

    fn schema(yaml: &str) -> DatasetSchema {
        serde_yaml::from_str(yaml).expect("schema yaml")
    }

    fn catalog_schema() -> DatasetSchema {
        schema(
            r#"
dataset: catalog
columns:
  - { name: game_id, type: int, nullable: false, min: 0, unique: true }
  - { name: price, type: float, nullable: false, min: 0 }
  - { name: positive_ratio, type: float, nullable: false, min: 0, max: 1 }
"#,
        )
    }

    fn batch(rows: &[(Value, Value, Value)]) -> ColumnBatch {
        let ordinals = (0..rows.len() as u64)
            .map(|row| RowOrdinal { source: 0, row })
            .collect();
        ColumnBatch::new(
            vec![
                Column::new("game_id", ColumnType::Int, rows.iter().map(|r| r.0.clone()).collect()),
                Column::new("price", ColumnType::Float, rows.iter().map(|r| r.1.clone()).collect()),
                Column::new(
                    "positive_ratio",
                    ColumnType::Float,
                    rows.iter().map(|r| r.2.clone()).collect(),
                ),
            ],
            ordinals,
        )
        .unwrap()
    }

    #[test]
    fn negative_price_is_a_range_violation_and_zero_is_accepted() {
        let mut validator = SchemaValidator::new(catalog_schema()).unwrap();
        let mut report = ValidationReportBuilder::new(Uuid::new_v4(), Utc::now());
        let part = validator
            .validate(
                &batch(&[
                    (Value::Int(1), Value::Float(-5.0), Value::Float(0.5)),
                    (Value::Int(2), Value::Float(0.0), Value::Float(0.5)),
                ]),
                &mut report,
            )
            .unwrap();
        assert_eq!(part.accepted.num_rows(), 1);
        assert_eq!(part.accepted.value("game_id", 0), Some(&Value::Int(2)));
        assert_eq!(part.rejected.len(), 1);
        assert_eq!(part.rejected[0].rule, RuleKind::RangeViolation);
        assert_eq!(part.rejected[0].rule.tag(), "range violation");
        assert_eq!(part.rejected[0].column, "price");

        let report = report.finish();
        assert_eq!(report.rows_examined(), 2);
        assert_eq!(report.rows_rejected(), 1);
    }

    #[test]
    fn first_violation_wins_and_each_rule_is_tagged() {
        let mut validator = SchemaValidator::new(catalog_schema()).unwrap();
        let mut report = ValidationReportBuilder::new(Uuid::new_v4(), Utc::now());
        let part = validator
            .validate(
                &batch(&[
                    (Value::Null, Value::Float(-1.0), Value::Float(0.5)),
                    (Value::Int(3), Value::Invalid("abc".into()), Value::Float(2.0)),
                    (Value::Int(4), Value::Float(1.0), Value::Float(1.5)),
                    (Value::Int(5), Value::Float(1.0), Value::Float(0.1)),
                    (Value::Int(5), Value::Float(2.0), Value::Float(0.2)),
                    (Value::Int(6), Value::Text("x".into()), Value::Float(0.2)),
                ]),
                &mut report,
            )
            .unwrap();
        let rules = part.rejected.iter().map(|r| r.rule).collect::<Vec<_>>();
        assert_eq!(
            rules,
            vec![
                RuleKind::NullViolation,
                RuleKind::TypeMismatch,
                RuleKind::RangeViolation,
                RuleKind::DuplicateKey,
                RuleKind::TypeMismatch,
            ]
        );
        assert_eq!(part.accepted.num_rows(), 1);
        assert_eq!(report.finish().rule_counts()[&RuleKind::TypeMismatch], 2);
    }

    #[test]
    fn uniqueness_spans_batches() {
        let mut validator = SchemaValidator::new(catalog_schema()).unwrap();
        let mut report = ValidationReportBuilder::new(Uuid::new_v4(), Utc::now());
        let row = (Value::Int(7), Value::Float(1.0), Value::Float(0.5));
        let first = validator.validate(&batch(&[row.clone()]), &mut report).unwrap();
        let second = validator.validate(&batch(&[row]), &mut report).unwrap();
        assert_eq!(first.accepted.num_rows(), 1);
        assert_eq!(second.rejected[0].rule, RuleKind::DuplicateKey);
    }

    #[test]
    fn per_batch_reports_merge_into_run_report() {
        let run_id = Uuid::new_v4();
        let created_at = Utc::now();
        let mut validator = SchemaValidator::new(catalog_schema()).unwrap();
        let mut run = ValidationReportBuilder::new(run_id, created_at);
        run.register("catalog");
        for rows in [
            vec![(Value::Int(1), Value::Float(-1.0), Value::Float(0.5))],
            vec![
                (Value::Int(2), Value::Float(1.0), Value::Float(0.5)),
                (Value::Int(3), Value::Float(1.0), Value::Float(3.0)),
            ],
        ] {
            let mut local = ValidationReportBuilder::new(run_id, created_at);
            validator.validate(&batch(&rows), &mut local).unwrap();
            run.merge(local);
        }
        assert_eq!(
            run.rejected_ordinals("catalog").into_iter().map(|o| o.row).collect::<Vec<_>>(),
            vec![0, 1]
        );
        let report = run.finish();
        assert_eq!(report.rows_examined(), 3);
        assert_eq!(report.rows_rejected(), 2);
        assert_eq!(report.datasets()["catalog"].examined, 3);
    }

    #[test]
    fn nul_bytes_are_rejected_before_loading() {
        let mut validator = SchemaValidator::new(schema(
            r#"
dataset: reviews
columns:
  - { name: body, type: text }
"#,
        ))
        .unwrap();
        let mut report = ValidationReportBuilder::new(Uuid::new_v4(), Utc::now());
        let input = ColumnBatch::new(
            vec![Column::new(
                "body",
                ColumnType::Text,
                vec![Value::Text("fine".into()), Value::Text("bad\0byte".into())],
            )],
            vec![RowOrdinal { source: 0, row: 0 }, RowOrdinal { source: 0, row: 1 }],
        )
        .unwrap();
        let part = validator.validate(&input, &mut report).unwrap();
        assert_eq!(part.accepted.num_rows(), 1);
        assert_eq!(part.rejected[0].rule, RuleKind::TypeMismatch);
        assert_eq!(part.rejected[0].ordinal.row, 1);
    }

    #[test]
    fn allowed_values_are_enforced() {
        let mut validator = SchemaValidator::new(schema(
            r#"
dataset: reviews
columns:
  - { name: language, type: text, allowed: [english, schinese] }
"#,
        ))
        .unwrap();
        let mut report = ValidationReportBuilder::new(Uuid::new_v4(), Utc::now());
        let input = ColumnBatch::new(
            vec![Column::new(
                "language",
                ColumnType::Text,
                vec![Value::Text("english".into()), Value::Text("klingon".into())],
            )],
            vec![RowOrdinal { source: 0, row: 0 }, RowOrdinal { source: 0, row: 1 }],
        )
        .unwrap();
        let part = validator.validate(&input, &mut report).unwrap();
        assert_eq!(part.rejected[0].rule, RuleKind::NotAllowed);
        assert_eq!(part.rejected[0].ordinal.row, 1);
    }

    #[test]
    fn malformed_schema_is_fatal() {
        let dup = schema(
            r#"
dataset: catalog
columns:
  - { name: price, type: float }
  - { name: price, type: float }
"#,
        );
        assert!(matches!(
            SchemaValidator::new(dup),
            Err(SchemaError::DuplicateColumn { .. })
        ));

        let inverted = schema(
            r#"
dataset: catalog
columns:
  - { name: price, type: float, min: 10, max: 1 }
"#,
        );
        assert!(matches!(
            SchemaValidator::new(inverted),
            Err(SchemaError::InvertedRange { .. })
        ));

        let mut validator = SchemaValidator::new(catalog_schema()).unwrap();
        let mut report = ValidationReportBuilder::new(Uuid::new_v4(), Utc::now());
        let narrow = batch(&[(Value::Int(1), Value::Float(1.0), Value::Float(0.5))])
            .select(&["game_id".to_string()]);
        // select() fills absent columns with nulls, so build a batch lacking `price` directly.
        let lacking = ColumnBatch::new(
            vec![narrow.column("game_id").unwrap().clone()],
            narrow.ordinals().to_vec(),
        )
        .unwrap();
        assert!(matches!(
            validator.validate(&lacking, &mut report),
            Err(SchemaError::MissingColumn { .. })
        ));
    }
}
