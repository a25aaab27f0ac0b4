//! Declarative per-dataset pipelines (transform steps + schema), loaded from YAML.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transform::TransformStep;
use crate::validate::DatasetSchema;

const DEFAULT_PIPELINE: &str = include_str!("../../../pipeline.yaml");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetPipeline {
    pub steps: Vec<TransformStep>,
    pub schema: DatasetSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub version: u32,
    pub catalog: DatasetPipeline,
    pub reviews: DatasetPipeline,
}

impl PipelineSpec {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing pipeline definition")
    }

    /// The Steam catalog + review pipeline shipped with the workspace.
    pub fn steam_default() -> Result<Self> {
        Self::from_yaml(DEFAULT_PIPELINE)
    }

    /// `<root>/pipeline.yaml` when present, the shipped default otherwise.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("pipeline.yaml");
        if !path.exists() {
            return Self::steam_default();
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Sets the ordering column on every `dedupe_by_key` step that does not name one.
    pub fn with_dedup_order(mut self, column: Option<&str>) -> Self {
        let Some(column) = column else {
            return self;
        };
        for step in self
            .catalog
            .steps
            .iter_mut()
            .chain(self.reviews.steps.iter_mut())
        {
            if let TransformStep::DedupeByKey { order_by, .. } = step {
                if order_by.is_none() {
                    *order_by = Some(column.to_string());
                }
            }
        }
        self
    }
}
