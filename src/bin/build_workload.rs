//! Compile and link workload benchmarks for an emulator
use anyhow::bail;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use stf_trace_flow::{
    Arch, BuildConfig, Emulator, FailurePolicy, FeatureSet, Platform, Settings, Sweep,
    WorkloadBuilder, describe_workloads, init_logger,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    /// Workload name from the board configuration
    #[arg(short, long, required_unless_present = "list")]
    workload: Option<String>,

    /// Build a single benchmark
    #[arg(short, long)]
    benchmark: Option<String>,

    #[arg(long, value_enum, default_value_t = Arch::Rv64)]
    arch: Arch,

    #[arg(long, value_enum, default_value_t = Platform::Baremetal)]
    platform: Platform,

    #[arg(long, alias = "board", value_enum, default_value_t = Emulator::Spike)]
    emulator: Emulator,

    /// Enable the bbv feature flags
    #[arg(long)]
    bbv: bool,

    /// Enable the trace feature flags
    #[arg(long)]
    trace: bool,

    /// Workload root instead of the configured search roots
    #[arg(long)]
    custom_path: Option<PathBuf>,

    /// Entry point symbol the benchmark exports
    #[arg(long)]
    entrypoint: Option<String>,

    /// Link prebuilt objects instead of compiling sources (requires --benchmark)
    #[arg(long, num_args = 1.., requires = "benchmark")]
    input_obj: Vec<PathBuf>,

    /// Remove previous objects and binaries first
    #[arg(long)]
    clean: bool,

    /// List configured workloads and exit
    #[arg(long)]
    list: bool,

    #[arg(long, value_enum, default_value_t = FailurePolicy::Continue)]
    on_failure: FailurePolicy,
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Cli::parse();
    let config = BuildConfig::load(&args.settings, args.emulator)?;
    let features = FeatureSet {
        bbv: args.bbv,
        trace: args.trace,
    };

    if args.list {
        let lines = describe_workloads(&config, |workload| {
            let root = config.resolve_workload_root(workload, None)?;
            config.finalize(
                workload,
                args.arch,
                args.platform,
                args.emulator,
                &root,
                features,
            )
        });
        for line in lines {
            println!("{}", line);
        }
        return Ok(());
    }

    let Some(workload) = args.workload.as_deref() else {
        bail!("--workload is required");
    };
    let workload_root = config.resolve_workload_root(workload, args.custom_path.as_deref())?;
    info!("Workload root: {}", workload_root.display());
    let final_config = config.finalize(
        workload,
        args.arch,
        args.platform,
        args.emulator,
        &workload_root,
        features,
    )?;
    let builder = WorkloadBuilder::new(final_config, args.entrypoint.as_deref());

    if !args.input_obj.is_empty() {
        let Some(benchmark) = args.benchmark.as_deref() else {
            bail!("--input-obj requires --benchmark");
        };
        let binary = builder.link_objects(benchmark, &args.input_obj, args.clean)?;
        info!("Linked {}", binary.display());
        return Ok(());
    }

    let benchmarks = builder.benchmarks(args.benchmark.as_deref())?;
    if benchmarks.is_empty() {
        bail!("No benchmarks found for workload {}", workload);
    }
    let shared = builder.prepare_shared()?;

    let mut sweep = Sweep::new("build", args.on_failure, benchmarks.len());
    for benchmark in &benchmarks {
        let outcome = sweep.run(benchmark, || {
            let binary = builder.build_benchmark(&shared, benchmark, args.clean)?;
            Ok(binary.display().to_string())
        });
        if outcome.is_err() {
            break;
        }
    }
    sweep.finish()
}
