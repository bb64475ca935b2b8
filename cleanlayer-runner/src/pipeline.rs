//! The full clean layer for one batch: validate, align, standardize, attach
//! lineage, and optionally persist.

use crate::store::DestinationStore;
use crate::writer::{CancelToken, ColumnDrift, IdempotentWriter, WriteError, WriteReport};
use cleanlayer_core::frame;
use cleanlayer_core::validator::{check_dropped_columns, flag};
use cleanlayer_core::{
    AlignSpec, Aligner, AlignmentError, BatchMetadata, LineageError, LineageTracker,
    StandardizationError, StandardizeSpec, Standardizer, TableSchema, ValidationError,
    ValidationResult, Validator,
};
use polars::prelude::*;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("alignment failed: {0}")]
    Alignment(#[from] AlignmentError),

    #[error("standardization failed: {0}")]
    Standardization(#[from] StandardizationError),

    #[error("lineage failed: {0}")]
    Lineage(#[from] LineageError),

    #[error("write failed: {0}")]
    Write(#[from] WriteError),

    #[error(transparent)]
    ColumnDrift(#[from] ColumnDrift),

    #[error("frame error: {0}")]
    Frame(#[from] PolarsError),
}

/// A cleaned batch and the validation findings that let it through.
#[derive(Debug, Clone)]
pub struct CleanOutcome {
    pub batch: DataFrame,
    pub validation: ValidationResult,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub batch: DataFrame,
    pub validation: ValidationResult,
    pub report: WriteReport,
}

/// One table's clean layer. Stateless across batches, so a single pipeline
/// can serve many threads.
#[derive(Debug, Clone)]
pub struct CleanPipeline {
    validator: Validator,
    aligner: Aligner,
    align: AlignSpec,
    standardize: StandardizeSpec,
}

impl CleanPipeline {
    pub fn new(schema: TableSchema, aligner: Aligner) -> Self {
        Self {
            validator: Validator::new(schema),
            aligner,
            align: AlignSpec::default(),
            standardize: StandardizeSpec::default(),
        }
    }

    pub fn with_align(mut self, align: AlignSpec) -> Self {
        self.align = align;
        self
    }

    pub fn with_standardize(mut self, standardize: StandardizeSpec) -> Self {
        self.standardize = standardize;
        self
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Key columns used when writing: the alignment key if set, else the
    /// schema's.
    pub fn write_keys(&self) -> &[String] {
        if self.align.primary_key.is_empty() {
            &self.validator.schema().primary_key
        } else {
            &self.align.primary_key
        }
    }

    /// Run the pure stages. Fatal validation findings stop the batch before
    /// any transformation; out-of-range rows are flagged and kept.
    pub fn clean(
        &self,
        batch: &DataFrame,
        meta: &BatchMetadata,
    ) -> Result<CleanOutcome, PipelineError> {
        let input_columns = frame::column_names(batch);
        let validation = self.validator.validate(batch, &input_columns)?;

        let mut out = if validation.out_of_range_row_ids.is_empty() {
            batch.clone()
        } else {
            flag(batch, &validation.out_of_range_row_ids)?
        };
        out = self.aligner.align_all(&out, &self.align)?;
        out = Standardizer::standardize_all(&out, &self.standardize)?;
        out = LineageTracker::attach(&out, meta)?;

        ensure_inputs_kept(&input_columns, &out)?;

        debug!(
            rows_in = batch.height(),
            rows_out = out.height(),
            sources = ?meta.source_tables,
            "batch cleaned"
        );
        Ok(CleanOutcome {
            batch: out,
            validation,
        })
    }

    /// Clean `batch` and write it to `target`.
    pub fn run<S: DestinationStore>(
        &self,
        writer: &mut IdempotentWriter<S>,
        batch: &DataFrame,
        meta: &BatchMetadata,
        target: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<RunOutcome, PipelineError> {
        let CleanOutcome { batch, validation } = self.clean(batch, meta)?;
        let report = writer.write(&batch, target, self.write_keys(), cancel)?;
        info!(
            table = target,
            rows = report.rows_written,
            warnings = validation.warnings().len(),
            "batch persisted"
        );
        Ok(RunOutcome {
            batch,
            validation,
            report,
        })
    }

    /// Clean independent batches in parallel. One batch failing does not
    /// affect the others; results keep input order.
    pub fn clean_many(
        &self,
        batches: &[(DataFrame, BatchMetadata)],
    ) -> Vec<Result<CleanOutcome, PipelineError>> {
        batches
            .par_iter()
            .map(|(batch, meta)| self.clean(batch, meta))
            .collect()
    }
}

/// Every input column must still be present after the transforming stages.
fn ensure_inputs_kept(input_columns: &[String], out: &DataFrame) -> Result<(), ColumnDrift> {
    let dropped = check_dropped_columns(input_columns, out);
    if dropped.is_valid {
        return Ok(());
    }
    Err(ColumnDrift {
        missing: dropped.dropped_columns.into_iter().collect(),
        unexpected: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cleanlayer_core::schema::{LINEAGE_COLUMNS, MAPPING_FAILED, VALIDATION_FLAG};
    use cleanlayer_core::{ColumnType, DateAlignment, DateOutput, IdentifierAlignment};

    fn schema() -> TableSchema {
        TableSchema::new()
            .require("symbol", ColumnType::Text)
            .require("trade_date", ColumnType::Timestamp)
            .require("close", ColumnType::Float)
            .require_nullable("pe_ratio", ColumnType::Float)
            .with_range("pe_ratio", 0.0, 200.0)
    }

    fn pipeline() -> CleanPipeline {
        CleanPipeline::new(schema(), Aligner::new()).with_align(AlignSpec {
            date: Some(DateAlignment {
                source: "trade_date".into(),
                target: "trade_date".into(),
                output: DateOutput::IntegerYyyymmdd,
            }),
            identifier: Some(IdentifierAlignment {
                source: "symbol".into(),
                target: "entity_code".into(),
                strict: false,
            }),
            primary_key: vec!["entity_code".into(), "trade_date".into()],
            enforce_uniqueness: true,
        })
    }

    fn batch() -> DataFrame {
        df!(
            "symbol" => &["sz000001", "600000", "000001.SZ"],
            "trade_date" => &["2024-01-05", "20240105", "2024/01/05"],
            "close" => &[10.5, 7.2, 10.6],
            "pe_ratio" => &[Some(8.0), Some(500.0), None],
        )
        .unwrap()
    }

    #[test]
    fn cleans_flags_and_dedupes() {
        let meta = BatchMetadata::new(["raw_quotes"]).with_job_id("job-1");
        let outcome = pipeline().clean(&batch(), &meta).unwrap();

        assert!(outcome.validation.is_valid);
        assert!(outcome.validation.out_of_range_row_ids.contains(&1));

        let out = &outcome.batch;
        assert_eq!(out.height(), 2);
        for col in LINEAGE_COLUMNS.iter().chain([&VALIDATION_FLAG, &MAPPING_FAILED]) {
            assert!(frame::has_column(out, col), "missing {col}");
        }

        let codes: Vec<Option<&str>> = out.column("entity_code").unwrap().str().unwrap().into_iter().collect();
        assert!(codes.contains(&Some("000001.SZ")));
        assert!(codes.contains(&Some("600000.SH")));

        // last write wins for the duplicated 000001.SZ row
        let close: Vec<Option<f64>> = out.column("close").unwrap().f64().unwrap().into_iter().collect();
        assert!(close.contains(&Some(10.6)));
        assert!(!close.contains(&Some(10.5)));
    }

    #[test]
    fn null_in_required_column_is_fatal() {
        let bad = df!(
            "symbol" => &["600000"],
            "trade_date" => &["2024-01-05"],
            "close" => &[None::<f64>],
            "pe_ratio" => &[Some(8.0)],
        )
        .unwrap();
        let err = pipeline()
            .clean(&bad, &BatchMetadata::new(["raw_quotes"]))
            .unwrap_err();
        match err {
            PipelineError::Validation(e) => {
                assert!(e.result.null_fields.contains("close"));
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn empty_sources_fail_lineage() {
        let err = pipeline()
            .clean(&batch(), &BatchMetadata::new(Vec::<String>::new()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Lineage(LineageError::NoSourceTables)));
    }

    #[test]
    fn write_keys_fall_back_to_schema() {
        let p = CleanPipeline::new(schema().with_primary_key(["symbol"]), Aligner::new());
        assert_eq!(p.write_keys(), ["symbol".to_string()]);
        assert_eq!(pipeline().write_keys(), ["entity_code".to_string(), "trade_date".to_string()]);
    }

    #[test]
    fn lost_input_column_is_drift() {
        let input = frame::column_names(&batch());
        let out = batch().drop("pe_ratio").unwrap().drop("close").unwrap();
        let drift = ensure_inputs_kept(&input, &out).unwrap_err();
        assert_eq!(drift.missing, vec!["close".to_string(), "pe_ratio".to_string()]);
        assert!(drift.unexpected.is_empty());
        assert!(ensure_inputs_kept(&input, &batch()).is_ok());

        let err: PipelineError = drift.into();
        assert!(matches!(err, PipelineError::ColumnDrift(_)));
    }

    #[test]
    fn many_batches_are_isolated() {
        let bad = batch().drop("close").unwrap();
        let meta = BatchMetadata::new(["raw_quotes"]);
        let results = pipeline().clean_many(&[
            (batch(), meta.clone()),
            (bad, meta.clone()),
            (batch(), meta),
        ]);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(PipelineError::Validation(_))));
        assert!(results[2].is_ok());
    }
}
