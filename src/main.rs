//! stageflow demo driver
//!
//! Runs a scan → filter → aggregate query over a generated table with the
//! configured worker pool, submits a duplicate of it to show merging, and
//! prints a JSON report.
//!
//! Usage: `stageflow [CONFIG.toml] [ROWS]`

use anyhow::Context;
use serde::Serialize;
use stageflow::{
    config::EngineConfig,
    pipeline::{
        AggregateFunction, AggregateOperator, AggregateSpec, AnyOperator, CmpOp, Dispatcher,
        DispatcherStats, FilterOperator, MemoryTable, PacketDescriptor, PacketState, PageSource,
        Predicate, ScanOperator, Tuple,
    },
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_ROWS: i64 = 100_000;
const GROUPS: i64 = 16;

#[derive(Serialize)]
struct GroupRow {
    group: i64,
    sum: i64,
}

#[derive(Serialize)]
struct Report {
    rows: i64,
    workers: usize,
    elapsed_ms: f64,
    primary_state: PacketState,
    duplicate_merged: bool,
    duplicate_state: PacketState,
    results_match: bool,
    groups: Vec<GroupRow>,
    stats: DispatcherStats,
}

fn query(table: &Arc<dyn PageSource>) -> PacketDescriptor {
    let scan = PacketDescriptor::new(AnyOperator::scan(ScanOperator::new(Arc::clone(table))))
        .with_merge_key("scan:demo");

    let filter = PacketDescriptor::new(AnyOperator::filter(FilterOperator::new(Predicate::new(
        1,
        CmpOp::Ge,
        0,
    ))))
    .with_merge_key("filter:value>=0")
    .with_input(scan);

    PacketDescriptor::new(AnyOperator::aggregate(AggregateOperator::new(
        AggregateSpec::grouped(0, AggregateFunction::Sum, 1),
    )))
    .with_merge_key("sum-by-group")
    .with_input(filter)
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let rows: i64 = match args.next() {
        Some(raw) => raw.parse().with_context(|| format!("invalid row count '{raw}'"))?,
        None => DEFAULT_ROWS,
    };

    let config = match &config_path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::load_or_default(None),
    };
    let _log_guard = stageflow::logging::init(&config.logging)?;

    tracing::info!("Starting stageflow demo over {} rows", rows);

    let table: Arc<dyn PageSource> = Arc::new(
        (0..rows)
            .map(|i| Tuple::pair(i % GROUPS, (i * 7919) % 1000 - 100))
            .collect::<MemoryTable>(),
    );

    let mut dispatcher =
        Dispatcher::new(config.dispatcher_config()).context("starting dispatcher")?;

    let started = Instant::now();
    let primary = dispatcher.submit(query(&table))?;
    let duplicate = dispatcher.submit(query(&table))?;

    let primary_rows = primary.collect();
    let duplicate_rows = duplicate.collect();
    let primary_state = primary.wait();
    let duplicate_state = duplicate.wait();
    let elapsed = started.elapsed();

    if let Some(err) = primary.error() {
        anyhow::bail!("query failed: {err}");
    }

    let report = Report {
        rows,
        workers: dispatcher.worker_count(),
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        primary_state,
        duplicate_merged: duplicate.is_merged(),
        duplicate_state,
        results_match: primary_rows == duplicate_rows,
        groups: primary_rows
            .iter()
            .map(|t| GroupRow {
                group: t.get(0).unwrap_or_default(),
                sum: t.get(1).unwrap_or_default(),
            })
            .collect(),
        stats: dispatcher.stats(),
    };

    dispatcher.shutdown();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
