//! CLI argument parsing and command dispatch

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use flowload_client::HttpServiceFactory;
use flowload_core::{
    summarize, InMemoryMetrics, IterationRecord, LineChunkSource, RunControllerBuilder, RunSummary,
};

use crate::config::AppConfig;
use crate::report::RunReport;

#[derive(Parser, Debug)]
#[command(name = "flowload")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a load test
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "FLOWLOAD_CONFIG")]
        config: PathBuf,

        /// Override the number of producers
        #[arg(long)]
        producers: Option<usize>,

        /// Override the number of consumers
        #[arg(long)]
        consumers: Option<usize>,

        /// Override the iterations each producer runs
        #[arg(long)]
        iterations: Option<u32>,

        /// Write records and summary to this JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, env = "FLOWLOAD_CONFIG")]
        config: PathBuf,
    },
    /// Show how an input file would be chunked
    Inspect {
        /// Path to the delimited input file
        #[arg(short, long)]
        input: PathBuf,

        /// Chunk size in bytes
        #[arg(long, default_value_t = 4 * 1024 * 1024)]
        chunk_size: usize,
    },
}

impl Cli {
    /// Execute the selected command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run {
                config,
                producers,
                consumers,
                iterations,
                output,
            } => {
                let overrides = Overrides {
                    producers,
                    consumers,
                    iterations,
                };
                run(&config, overrides, output.as_deref()).await
            }
            Commands::Validate { config } => validate(&config),
            Commands::Inspect { input, chunk_size } => inspect(input, chunk_size).await,
        }
    }
}

/// Command-line values that replace config file settings
#[derive(Debug, Default)]
struct Overrides {
    producers: Option<usize>,
    consumers: Option<usize>,
    iterations: Option<u32>,
}

impl Overrides {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(producers) = self.producers {
            config.load.run.producers = producers;
        }
        if let Some(consumers) = self.consumers {
            config.load.run.consumers = consumers;
        }
        if let Some(iterations) = self.iterations {
            config.load.run.iterations_per_actor = iterations;
        }
    }
}

async fn run(path: &Path, overrides: Overrides, output: Option<&Path>) -> Result<()> {
    let mut config = AppConfig::load(path)?;
    overrides.apply(&mut config);
    config.validate()?;

    let source = LineChunkSource::from_path(&config.load.input.path, config.load.input.chunk_size)
        .context("Failed to open input file")?;
    let factory = HttpServiceFactory::new(config.api.clone())?;
    let metrics = Arc::new(InMemoryMetrics::new());

    let (controller, rx) = RunControllerBuilder::new()
        .config(config.load.clone())
        .factory(Arc::new(factory))
        .source(Arc::new(source))
        .metrics(metrics)
        .build()?;
    let run_id = controller.context().run_id.clone();

    tracing::info!(
        run_id = %run_id,
        config = %path.display(),
        base_url = %config.api.base_url,
        input = %config.load.input.path,
        "Starting flowload"
    );

    let collector = tokio::spawn(collect_records(rx));
    let start = Instant::now();
    let stats = controller.run_with_signal_handling().await?;
    let records = collector.await.context("Record collector panicked")?;
    let summary = RunSummary::from_records(&records, start.elapsed());

    tracing::info!(
        run_id = %run_id,
        producer_iterations = summary.producer_iterations,
        successful = summary.successful,
        failed = summary.failed,
        validation_mismatches = summary.validation_mismatches,
        validation_unavailable = summary.validation_unavailable,
        artifacts_published = summary.artifacts_published,
        consumer_iterations = summary.consumer_iterations,
        consumer_failures = summary.consumer_failures,
        p50_ms = summary.iteration_latency.p50,
        p95_ms = summary.iteration_latency.p95,
        ips = summary.iterations_per_second,
        "Run summary"
    );
    for (stage, count) in &summary.failures_by_stage {
        tracing::info!(stage = %stage, failures = count, "Failures by stage");
    }

    if let Some(output) = output {
        RunReport {
            run_id: &run_id,
            stats: &stats,
            summary: &summary,
            records: &records,
        }
        .write_json(output)?;
        tracing::info!(path = %output.display(), "Report written");
    }

    Ok(())
}

async fn collect_records(mut rx: mpsc::Receiver<IterationRecord>) -> Vec<IterationRecord> {
    let mut records = Vec::new();
    while let Some(record) = rx.recv().await {
        records.push(record);
    }
    records
}

fn validate(path: &Path) -> Result<()> {
    let config = AppConfig::load(path)?;
    config.validate()?;

    let run = &config.load.run;
    println!("Configuration is valid: {}", path.display());
    println!("  Base URL:     {}", config.api.base_url);
    println!("  Input:        {}", config.load.input.path);
    println!("  Producers:    {}", run.producers);
    println!("  Consumers:    {}", run.consumers);
    println!("  Iterations:   {}", run.iterations_per_actor);
    println!("  Users:        {}", config.load.users.len());
    println!(
        "  Secondary:    {}",
        if config.load.secondary.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    Ok(())
}

async fn inspect(input: PathBuf, chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        bail!("--chunk-size must be positive");
    }
    let display = input.display().to_string();
    let source = LineChunkSource::from_path(input, chunk_size)?;
    let summary = summarize(&source)
        .await
        .with_context(|| format!("Failed to read input file: {display}"))?;

    println!("Input:       {display}");
    println!("Chunk size:  {chunk_size} bytes");
    println!("Chunks:      {}", summary.total_chunks);
    println!("Bytes:       {}", summary.total_bytes);
    println!("Data rows:   {}", summary.data_rows);
    Ok(())
}
