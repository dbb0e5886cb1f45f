//! Run built workloads under Spike or QEMU, collecting BBVs and traces
use anyhow::bail;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use stf_trace_flow::{
    Arch, DEFAULT_INTERVAL_SIZE, Emulator, FailurePolicy, Platform, RunConfig, Settings, Sweep,
    WorkloadRunner, discover_targets, explicit_target, init_logger,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Only run benchmarks of this workload
    #[arg(short, long)]
    workload: Option<String>,

    /// Only run this benchmark
    #[arg(short, long)]
    benchmark: Option<String>,

    /// Run this binary instead of discovered ones
    #[arg(long, requires_all = ["workload", "benchmark"])]
    binary: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Arch::Rv64)]
    arch: Arch,

    #[arg(long, value_enum, default_value_t = Platform::Baremetal)]
    platform: Platform,

    #[arg(long, alias = "board", value_enum, default_value_t = Emulator::Spike)]
    emulator: Emulator,

    /// ISA string, defaults to the one recorded at build time
    #[arg(long)]
    isa: Option<String>,

    /// Collect basic block vectors
    #[arg(long, overrides_with = "no_bbv")]
    bbv: bool,

    #[arg(long, overrides_with = "bbv")]
    no_bbv: bool,

    /// Generate an STF trace of the whole run
    #[arg(long, overrides_with = "no_trace")]
    trace: bool,

    #[arg(long, overrides_with = "trace")]
    no_trace: bool,

    /// Instructions per BBV interval
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SIZE)]
    interval_size: u64,

    /// Remove previous run outputs first
    #[arg(long)]
    clean: bool,

    /// Dump generated traces with stf_dump
    #[arg(long)]
    stf_dump: bool,

    /// List runnable binaries and exit
    #[arg(long)]
    list: bool,

    #[arg(long, value_enum, default_value_t = FailurePolicy::Continue)]
    on_failure: FailurePolicy,
}

/// `--x` / `--no-x` pair: None keeps the build-time setting
fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Cli::parse();
    let layout = args.settings.layout();

    let targets = match &args.binary {
        Some(binary) => {
            let (Some(workload), Some(benchmark)) = (&args.workload, &args.benchmark) else {
                bail!("--binary requires --workload and --benchmark");
            };
            vec![explicit_target(
                &layout,
                args.emulator,
                binary,
                workload,
                benchmark,
            )?]
        }
        None => discover_targets(
            &layout,
            args.emulator,
            args.workload.as_deref(),
            args.benchmark.as_deref(),
        )?,
    };

    if args.list {
        for target in &targets {
            println!("{}: {}", target.name(), target.binary.display());
        }
        return Ok(());
    }
    if targets.is_empty() {
        bail!("No binaries to run");
    }

    let runner = WorkloadRunner::new(
        &args.settings,
        RunConfig {
            emulator: args.emulator,
            arch: args.arch,
            platform: args.platform,
            isa: args.isa.clone(),
            bbv: toggle(args.bbv, args.no_bbv),
            trace: toggle(args.trace, args.no_trace),
            interval_size: args.interval_size,
            clean: args.clean,
            stf_dump: args.stf_dump,
        },
    );
    runner.check_tool()?;

    let mut sweep = Sweep::new("run", args.on_failure, targets.len());
    for target in &targets {
        let outcome = sweep.run(&target.name(), || {
            let metadata = runner.run(target)?;
            if metadata.bbv_enabled && metadata.bbv_file.is_none() {
                warn!("{}: no BBV file was produced", target.name());
            }
            if metadata.trace_enabled && metadata.trace_file.is_none() {
                warn!("{}: no trace was produced", target.name());
            }
            info!(
                "{} finished in {:.2}s",
                target.name(),
                metadata.elapsed_seconds
            );
            Ok(format!("{:.2}s", metadata.elapsed_seconds))
        });
        if outcome.is_err() {
            break;
        }
    }
    sweep.finish()
}
