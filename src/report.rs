//! JSON run report

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use flowload_core::{AggregatedStats, IterationRecord, RunSummary};

/// Everything one run produced
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub stats: &'a AggregatedStats,
    pub summary: &'a RunSummary,
    pub records: &'a [IterationRecord],
}

impl RunReport<'_> {
    /// Write the report to `path` as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }
}
