//! Clean Layer core: the pure stages that turn a raw tabular batch into a
//! validated, aligned, standardized and traceable one.
//!
//! - Schema contract and validation result model
//! - Validator: fatal findings vs. warnings, never silent repair
//! - Aligner: dates, security identifiers, primary keys
//! - Standardizer: monetary and volume units, unadjusted price snapshots
//! - Lineage tracker: provenance columns on every row
//!
//! Every stage takes a `&DataFrame` and returns a new one. Persistence lives in
//! `cleanlayer-runner`.

pub mod aligner;
pub mod dates;
pub mod frame;
pub mod identifier;
pub mod lineage;
pub mod schema;
pub mod standardizer;
pub mod validator;

pub use aligner::{AlignSpec, Aligner, AlignmentError, DateAlignment, DateOutput, IdentifierAlignment};
pub use frame::KeepStrategy;
pub use identifier::{IdentifierResolver, SecurityMaster};
pub use lineage::{BatchMetadata, LineageError, LineageTracker};
pub use schema::{ColumnType, SchemaError, TableSchema, ValidationResult};
pub use standardizer::{StandardizationError, StandardizeSpec, Standardizer, UnitConversion};
pub use validator::{ValidationError, Validator};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: stage types can be shared across worker threads.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<Validator>();
        require_sync::<Validator>();
        require_send::<Aligner>();
        require_sync::<Aligner>();
        require_send::<SecurityMaster>();
        require_sync::<SecurityMaster>();
        require_send::<TableSchema>();
        require_sync::<TableSchema>();
        require_send::<ValidationResult>();
        require_sync::<ValidationResult>();
        require_send::<BatchMetadata>();
        require_sync::<BatchMetadata>();
        require_send::<AlignSpec>();
        require_sync::<AlignSpec>();
        require_send::<StandardizeSpec>();
        require_sync::<StandardizeSpec>();
    }

    /// A schema written in TOML deserializes into the same contract as the
    /// chained builder produces.
    #[test]
    fn schema_loads_from_toml() {
        let text = r#"
            required_columns = ["entity_code", "close", "pe_ratio"]
            nullable_columns = ["pe_ratio"]
            primary_key = ["entity_code"]

            [column_types]
            entity_code = "text"
            close = "float"
            pe_ratio = "float"

            [value_ranges]
            pe_ratio = [0.0, 200.0]
        "#;
        let parsed: TableSchema = toml::from_str(text).unwrap();
        let built = TableSchema::new()
            .require("entity_code", ColumnType::Text)
            .require("close", ColumnType::Float)
            .require_nullable("pe_ratio", ColumnType::Float)
            .with_range("pe_ratio", 0.0, 200.0)
            .with_primary_key(["entity_code"]);
        assert_eq!(parsed, built);
        assert!(parsed.check_consistency().is_ok());
    }
}
