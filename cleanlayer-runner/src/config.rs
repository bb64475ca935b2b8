//! TOML-loadable pipeline configuration.
//!
//! ```toml
//! [schema]
//! required_columns = ["entity_code", "trade_date", "close"]
//! primary_key = ["entity_code", "trade_date"]
//!
//! [align.identifier]
//! source = "symbol"
//!
//! [write]
//! target = "daily_quotes"
//! batch_size = 5000
//! ```

use crate::conflict::{ConflictStrategy, MergePolicy, MergeRule};
use crate::pipeline::CleanPipeline;
use crate::writer::{WriteError, WriteOptions};
use cleanlayer_core::{AlignSpec, Aligner, IdentifierResolver, SchemaError, StandardizeSpec, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("invalid write settings: {0}")]
    Write(#[from] WriteError),
}

fn default_conflict_strategy() -> String {
    "replace".to_string()
}

fn default_batch_size() -> usize {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

/// Persistence settings for one destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSettings {
    pub target: String,

    /// `replace`, or `merge` together with a complete `merge_rules` table.
    #[serde(default = "default_conflict_strategy")]
    pub conflict_strategy: String,

    #[serde(default)]
    pub merge_rules: BTreeMap<String, MergeRule>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl WriteSettings {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            conflict_strategy: default_conflict_strategy(),
            merge_rules: BTreeMap::new(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }

    /// Resolve the strategy name. A merge needs its rule table; coverage of
    /// the batch's columns is checked at write time.
    pub fn conflict(&self) -> Result<ConflictStrategy, WriteError> {
        let name = self.conflict_strategy.trim().to_ascii_lowercase();
        if name == "merge" {
            if self.merge_rules.is_empty() {
                return Err(WriteError::UnsupportedStrategy(name));
            }
            return Ok(ConflictStrategy::Merge(MergePolicy {
                rules: self.merge_rules.clone(),
            }));
        }
        ConflictStrategy::from_name(&name)
    }

    pub fn options(&self) -> Result<WriteOptions, WriteError> {
        if self.batch_size == 0 {
            return Err(WriteError::ZeroBatchSize);
        }
        Ok(WriteOptions {
            conflict: self.conflict()?,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
        })
    }
}

/// Everything needed to clean and persist one kind of batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub schema: TableSchema,

    #[serde(default)]
    pub align: AlignSpec,

    #[serde(default)]
    pub standardize: StandardizeSpec,

    pub write: WriteSettings,
}

impl PipelineConfig {
    /// Parse and check the config. Schema consistency and write settings are
    /// verified here so a bad file fails before any batch is touched.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.schema.check_consistency()?;
        config.write.options()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    pub fn build_pipeline(&self, resolver: Option<Arc<dyn IdentifierResolver>>) -> CleanPipeline {
        let aligner = match resolver {
            Some(r) => Aligner::with_resolver(r),
            None => Aligner::new(),
        };
        CleanPipeline::new(self.schema.clone(), aligner)
            .with_align(self.align.clone())
            .with_standardize(self.standardize.clone())
    }
}
