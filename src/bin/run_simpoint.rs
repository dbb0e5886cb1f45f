//! Cluster collected BBVs with SimPoint
use anyhow::bail;
use clap::Parser;
use log::{info, warn};
use std::{collections::BTreeMap, path::PathBuf};
use stf_trace_flow::{
    DEFAULT_MAX_K, Emulator, FailurePolicy, Settings, SimPointRunner, SimPointSummary, Sweep,
    discover_bbv_runs, init_logger, read_json,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[arg(long, alias = "board", value_enum, default_value_t = Emulator::Spike)]
    emulator: Emulator,

    /// Only analyze this workload
    #[arg(short, long)]
    workload: Option<String>,

    /// Only analyze this benchmark
    #[arg(short, long)]
    benchmark: Option<String>,

    /// Maximum number of clusters
    #[arg(long, default_value_t = DEFAULT_MAX_K)]
    max_k: u32,

    /// Analysis directory instead of <outputs>/simpoint_analysis
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FailurePolicy::Continue)]
    on_failure: FailurePolicy,
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Cli::parse();
    let runner = SimPointRunner::new(&args.settings, args.max_k, args.output_dir.clone());

    let runs = discover_bbv_runs(
        &args.settings.layout(),
        args.emulator,
        args.workload.as_deref(),
        args.benchmark.as_deref(),
    )?;
    if runs.is_empty() {
        bail!("No BBV files found, run the workloads with --bbv first");
    }

    // earlier analyses of other benchmarks stay in the summary
    let summary_path = runner.summary_path();
    let mut summary: BTreeMap<String, SimPointSummary> = if summary_path.exists() {
        read_json(&summary_path).unwrap_or_else(|err| {
            warn!("Replacing unreadable summary: {:#}", err);
            BTreeMap::new()
        })
    } else {
        BTreeMap::new()
    };

    let mut sweep = Sweep::new("simpoint", args.on_failure, runs.len());
    for run in &runs {
        let unit = format!("{}:{}", run.workload, run.benchmark);
        let outcome = sweep.run(&unit, || {
            let result = runner.analyze(run)?;
            let message = format!(
                "{} simpoints, coverage {:.3}",
                result.intervals.len(),
                result.coverage
            );
            if result.intervals.is_empty() {
                warn!("{}: SimPoint produced no usable intervals", unit);
            }
            summary.insert(unit.clone(), result);
            Ok(message)
        });
        if outcome.is_err() {
            break;
        }
    }

    if !summary.is_empty() {
        runner.write_summary(&summary)?;
    }
    info!("SimPoint analysis stored in {}", runner.analysis_root().display());
    sweep.finish()
}
