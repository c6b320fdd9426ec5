//! warp-poolbench: concurrent load against a WarpGrid connection pool.
//!
//! Spawns `--tasks` tasks that each run `--iterations` rounds of
//! acquire, optional work delay, query, release against the in-memory
//! mock driver, then prints pool statistics. Exits non-zero if any
//! connection is still leased once every task has finished.
//!
//! # Usage
//!
//! ```text
//! warp-poolbench --partitions 3 --min 5 --max 20 --tasks 100 --iterations 50
//! warp-poolbench --config datasource.toml --work-delay-ms -1 --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use warpgrid_datasource::{ConfigValue, DataSource, DataSourceConfig, DriverRegistry, Password};
use warpgrid_pool::mock::MockDriver;
use warpgrid_pool::{PoolStats, StatisticsSnapshot};

const QUERY: &str = "SELECT id FROM bench WHERE id = ?";

#[derive(Parser)]
#[command(name = "warp-poolbench", about = "WarpGrid connection pool load generator", version)]
struct Cli {
    /// Data source TOML file. Its driver must be "mock"; sizing flags are
    /// ignored when set.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "3")]
    partitions: i64,

    /// Minimum connections per partition.
    #[arg(long, default_value = "5")]
    min: i64,

    /// Maximum connections per partition.
    #[arg(long, default_value = "20")]
    max: i64,

    /// Connections added per partition when it runs low.
    #[arg(long, default_value = "2")]
    increment: i64,

    #[arg(long, default_value = "3")]
    release_helpers: i64,

    /// Concurrent tasks.
    #[arg(long, default_value = "50")]
    tasks: usize,

    /// Acquire/release rounds per task.
    #[arg(long, default_value = "20")]
    iterations: usize,

    /// Time each connection is held. Negative picks a random delay of up
    /// to 10ms per round.
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    work_delay_ms: i64,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    tasks: usize,
    iterations: usize,
    elapsed_ms: u64,
    pool: PoolStats,
    statistics: StatisticsSnapshot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,warpgrid_pool=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DataSourceConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => config_from_args(&cli),
    };

    let drivers = DriverRegistry::new();
    drivers.register("mock", Arc::new(MockDriver::new()));
    let source = Arc::new(DataSource::new(config, &drivers)?);
    source.init().await?;

    let started = Instant::now();
    let mut handles = Vec::with_capacity(cli.tasks);
    for task in 0..cli.tasks {
        let source = source.clone();
        let iterations = cli.iterations;
        let work_delay_ms = cli.work_delay_ms;
        handles.push(tokio::spawn(async move {
            run_task(&source, task, iterations, work_delay_ms).await
        }));
    }

    let mut failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "task failed");
                failures += 1;
            }
            Err(e) => {
                warn!(error = %e, "task panicked");
                failures += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    let pool = source.pool().context("pool was not built")?;
    let report = Report {
        tasks: cli.tasks,
        iterations: cli.iterations,
        elapsed_ms: elapsed.as_millis() as u64,
        pool: pool.stats(),
        statistics: pool.statistics(),
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let leased = source.total_leased();
    source.close().await;
    if leased > 0 {
        bail!("{leased} connection(s) still leased after all tasks finished");
    }
    if failures > 0 {
        bail!("{failures} task(s) failed");
    }
    info!(elapsed_ms = report.elapsed_ms, "benchmark finished");
    Ok(())
}

fn config_from_args(cli: &Cli) -> DataSourceConfig {
    DataSourceConfig {
        url: "mock:poolbench".into(),
        driver: "mock".into(),
        username: "bench".into(),
        password: Password("bench".into()),
        partitions: Some(ConfigValue::Int(cli.partitions)),
        min_connections_per_partition: Some(ConfigValue::Int(cli.min)),
        max_connections_per_partition: Some(ConfigValue::Int(cli.max)),
        acquire_increment: Some(ConfigValue::Int(cli.increment)),
        release_helper_threads: Some(ConfigValue::Int(cli.release_helpers)),
        lazy_init: false,
        ..DataSourceConfig::default()
    }
}

async fn run_task(
    source: &DataSource,
    task: usize,
    iterations: usize,
    work_delay_ms: i64,
) -> anyhow::Result<()> {
    for round in 0..iterations {
        let conn = source.get_connection().await?;
        let delay = if work_delay_ms < 0 {
            rand::thread_rng().gen_range(0..=10)
        } else {
            work_delay_ms as u64
        };
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let statement = conn.prepare_statement(QUERY)?;
        statement.set(1, (task * iterations + round) as i64)?;
        let rows = statement.execute_query()?;
        while rows.next()? {}
        statement.close();
        conn.close();
    }
    Ok(())
}

fn print_report(report: &Report) {
    let stats = &report.statistics;
    println!(
        "{} tasks x {} iterations in {}ms",
        report.tasks, report.iterations, report.elapsed_ms
    );
    println!(
        "connections: {} created, {} free, {} leased",
        report.pool.created, report.pool.free, report.pool.leased
    );
    for partition in &report.pool.partitions {
        println!(
            "  partition {}: {} created ({}..{}), {} free, {} leased",
            partition.index,
            partition.created,
            partition.min,
            partition.max,
            partition.free,
            partition.leased
        );
    }
    println!(
        "requests: {} (average wait {:?})",
        stats.connections_requested,
        stats.average_wait()
    );
    println!(
        "statements: {} prepared, {} executed, cache hit ratio {:.1}%",
        stats.statements_prepared,
        stats.statements_executed,
        stats.cache_hit_ratio() * 100.0
    );
    println!(
        "lifecycle: {} connections created, {} destroyed, {} recoveries, {} leaks",
        stats.connections_created,
        stats.connections_destroyed,
        stats.recoveries,
        stats.leaks_detected
    );
}
