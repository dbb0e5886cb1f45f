//! Generate STF traces: one window of a binary, or one slice per SimPoint
use anyhow::bail;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use stf_trace_flow::{
    Arch, Author, Emulator, FailurePolicy, Settings, SingleTrace, SliceRequest, Sweep,
    TraceGenerator, TraceMode, display_relative, init_logger, list_dirs, parse_pc,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(flatten)]
    author: Author,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trace a single window of a binary
    Single {
        /// Workload binary
        binary: PathBuf,

        #[arg(long, alias = "board", value_enum, default_value_t = Emulator::Spike)]
        emulator: Emulator,

        #[arg(long, value_enum, default_value_t = TraceMode::Macro)]
        mode: TraceMode,

        #[arg(long, value_enum, default_value_t = Arch::Rv64)]
        arch: Arch,

        /// ISA passed to spike
        #[arg(long)]
        isa: Option<String>,

        /// Run the binary under the proxy kernel
        #[arg(long)]
        pk: bool,

        /// Instructions to trace (insn_count and pc_count modes)
        #[arg(short, long)]
        num_instructions: Option<u64>,

        /// Instructions to skip before tracing
        #[arg(long, default_value_t = 0)]
        start_instruction: u64,

        /// Program counter that starts tracing (pc_count mode)
        #[arg(long, value_parser = parse_pc)]
        start_pc: Option<u64>,

        /// Hits of --start-pc before tracing starts
        #[arg(long, default_value_t = 1)]
        pc_threshold: u64,

        /// Output .zstf file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write an stf_dump of the trace
        #[arg(long)]
        dump: bool,
    },
    /// Trace every SimPoint interval of a previous BBV run
    Sliced {
        #[arg(long, alias = "board", value_enum, default_value_t = Emulator::Spike)]
        emulator: Emulator,

        #[arg(short, long)]
        workload: String,

        /// Slice a single benchmark instead of every analyzed one
        #[arg(short, long)]
        benchmark: Option<String>,

        /// Instructions per slice, defaults to the interval size of the run
        #[arg(long)]
        interval_size: Option<u64>,

        /// SimPoint files, default to the analysis directory
        #[arg(long, requires = "benchmark")]
        simpoints: Option<PathBuf>,

        #[arg(long, requires = "benchmark")]
        weights: Option<PathBuf>,

        /// Check instruction counts with stf_count
        #[arg(long)]
        verify: bool,

        #[arg(long)]
        dump: bool,

        /// Remove previous slices first
        #[arg(long)]
        clean: bool,

        #[arg(long, value_enum, default_value_t = FailurePolicy::Continue)]
        on_failure: FailurePolicy,
    },
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Cli::parse();
    let generator = TraceGenerator::new(&args.settings, args.author.clone());

    match args.command {
        Commands::Single {
            binary,
            emulator,
            mode,
            arch,
            isa,
            pk,
            num_instructions,
            start_instruction,
            start_pc,
            pc_threshold,
            output,
            dump,
        } => {
            let trace = generator.generate_single(&SingleTrace {
                binary,
                emulator,
                mode,
                arch,
                isa,
                pk,
                num_instructions,
                start_instruction,
                start_pc,
                pc_threshold,
                output,
                dump,
            })?;
            println!("{}", display_relative(&trace));
        }
        Commands::Sliced {
            emulator,
            workload,
            benchmark,
            interval_size,
            simpoints,
            weights,
            verify,
            dump,
            clean,
            on_failure,
        } => {
            let benchmarks = match benchmark {
                Some(benchmark) => vec![benchmark],
                None => {
                    // benchmarks that went through SimPoint analysis
                    let layout = args.settings.layout();
                    let analysis = layout.simpoint_analysis_root().join(&workload);
                    if !analysis.is_dir() {
                        bail!("No SimPoint analysis for {}: {}", workload, analysis.display());
                    }
                    let mut benchmarks = vec![];
                    for bench in list_dirs(layout.emulator_root(emulator).join(&workload))? {
                        if layout.benchmark(emulator, &workload, &bench).simpoints_path().exists() {
                            benchmarks.push(bench);
                        }
                    }
                    benchmarks
                }
            };
            if benchmarks.is_empty() {
                bail!("Nothing to slice for workload {}", workload);
            }

            let mut sweep = Sweep::new("slice", on_failure, benchmarks.len());
            for bench in &benchmarks {
                let request = SliceRequest {
                    emulator,
                    workload: workload.clone(),
                    benchmark: bench.clone(),
                    interval_size,
                    simpoints: simpoints.clone(),
                    weights: weights.clone(),
                    verify,
                    dump,
                    clean,
                };
                let outcome = sweep.run(bench, || {
                    let manifest = generator.generate_sliced(&request)?;
                    info!(
                        "{}: {} slices, total weight {:.3}",
                        bench,
                        manifest.slices.len(),
                        manifest.total_weight
                    );
                    Ok(format!("{} slices", manifest.slices.len()))
                });
                if outcome.is_err() {
                    break;
                }
            }
            sweep.finish()?;
        }
    }
    Ok(())
}
