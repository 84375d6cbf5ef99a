//! Benchmark driver for the uvmsim paging engine.
//!
//! Runs paging workloads against a simulated two-tier address space and
//! emits a results CSV suitable for plotting.

mod csv;
mod workload;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::Level;

use uvmsim_core::ReplacementPolicyKind;

use crate::workload::WorkloadConfig;

#[derive(Parser)]
#[command(name = "uvmsim-bench")]
#[command(about = "Paging and migration benchmarks for the uvmsim engine")]
struct Args {
    /// Workload to run: random, sequential, oversubscribe, all
    #[arg(short, long, default_value = "all")]
    workload: String,

    /// Working set size in MiB
    #[arg(long, default_value = "256")]
    working_set_mb: usize,

    /// Device pool size in MiB
    #[arg(long, default_value = "64")]
    gpu_memory_mb: usize,

    /// Page accesses per workload
    #[arg(short, long, default_value = "100000")]
    accesses: usize,

    /// Replacement policy: lru, clock
    #[arg(short, long, default_value = "lru")]
    policy: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Write a results CSV to this path
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_policy(name: &str) -> Result<ReplacementPolicyKind> {
    match name.to_ascii_lowercase().as_str() {
        "lru" => Ok(ReplacementPolicyKind::Lru),
        "clock" => Ok(ReplacementPolicyKind::Clock),
        other => bail!("unknown replacement policy: {other}"),
    }
}

fn parse_level(name: &str) -> Result<Level> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => bail!("unknown log level: {other}"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = parse_level(&args.log_level)?;
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let config = WorkloadConfig {
        working_set_bytes: args.working_set_mb * 1024 * 1024,
        gpu_memory_bytes: args.gpu_memory_mb * 1024 * 1024,
        accesses: args.accesses,
        policy: parse_policy(&args.policy)?,
        log_level,
    };

    let mut rows = Vec::new();
    match args.workload.as_str() {
        "random" => rows.push(workload::random_access(&config)?),
        "sequential" => rows.push(workload::sequential_sweep(&config)?),
        "oversubscribe" => rows.push(workload::oversubscribe(&config)?),
        "all" => {
            rows.push(workload::random_access(&config)?);
            rows.push(workload::sequential_sweep(&config)?);
            rows.push(workload::oversubscribe(&config)?);
        }
        other => bail!("unknown workload: {other}"),
    }

    for row in &rows {
        println!(
            "{:<24} ws={} MiB gpu={} MiB faults={} migrations={} migrated={:.1} MiB {:.0} pages/s",
            row.benchmark,
            row.working_set_mb,
            row.gpu_memory_mb,
            row.page_faults,
            row.migrations,
            row.migrated_mb,
            row.throughput_pages_sec,
        );
    }

    if let Some(path) = &args.output {
        csv::write_results_csv(path, &rows)?;
        println!("results written to {}", path.display());
    }

    Ok(())
}
