//! Build, run, analyze and slice a workload in one go
use anyhow::bail;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use stf_trace_flow::{
    Arch, DEFAULT_IMAGE, DEFAULT_INTERVAL_SIZE, DEFAULT_MAX_K, DockerOrchestrator, Emulator,
    Executor, FailurePolicy, FlowOptions, FlowStep, FullFlow, Platform, Settings, StepStatus,
    init_logger, print_reports,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[arg(short, long)]
    workload: String,

    #[arg(short, long)]
    benchmark: Option<String>,

    #[arg(long, value_enum, default_value_t = Arch::Rv64)]
    arch: Arch,

    #[arg(long, value_enum, default_value_t = Platform::Baremetal)]
    platform: Platform,

    #[arg(long, alias = "board", value_enum, default_value_t = Emulator::Spike)]
    emulator: Emulator,

    /// Collect BBVs; needed for the simpoint and slice steps
    #[arg(long)]
    bbv: bool,

    /// Trace the whole run
    #[arg(long)]
    trace: bool,

    #[arg(long, default_value_t = DEFAULT_INTERVAL_SIZE)]
    interval_size: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_K)]
    max_k: u32,

    /// Verify slice instruction counts
    #[arg(long)]
    verify: bool,

    /// Steps to leave out
    #[arg(long, value_enum, value_delimiter = ',')]
    skip: Vec<FlowStep>,

    #[arg(long, value_enum, default_value_t = FailurePolicy::Continue)]
    on_failure: FailurePolicy,

    /// Run every step inside the toolchain image
    #[arg(long)]
    docker: bool,

    #[arg(long, default_value = DEFAULT_IMAGE)]
    image: String,

    /// Build the image from this Docker context first
    #[arg(long, requires = "docker")]
    build_image: Option<PathBuf>,

    /// Host workloads directory mounted into the container
    #[arg(long, requires = "docker")]
    workloads_dir: Option<PathBuf>,

    /// Host environment directory mounted into the container
    #[arg(long, requires = "docker")]
    environment_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let args = Cli::parse();

    let executor = if args.docker {
        DockerOrchestrator::check()?;
        let docker = DockerOrchestrator::new(
            &args.image,
            &args.settings.outputs_root,
            args.workloads_dir.as_deref(),
            args.environment_dir.as_deref(),
        )?;
        if let Some(context) = &args.build_image {
            docker.build_image(context)?;
        } else if !docker.image_exists() {
            bail!(
                "Docker image {} not found, pass --build-image <context>",
                args.image
            );
        }
        Executor::Docker(docker)
    } else {
        Executor::local()
    };

    let options = FlowOptions {
        workload: args.workload.clone(),
        benchmark: args.benchmark.clone(),
        arch: args.arch,
        platform: args.platform,
        emulator: args.emulator,
        bbv: args.bbv,
        trace: args.trace,
        interval_size: args.interval_size,
        max_k: args.max_k,
        verify: args.verify,
        on_failure: args.on_failure,
        skip: args.skip.clone(),
    };
    info!(
        "Full flow for {} on {} ({}, {})",
        args.workload, args.emulator, args.arch, args.platform
    );
    let flow = FullFlow::new(&args.settings, options, executor);
    let reports = flow.run();
    print_reports(&reports)?;

    if let Some(report) = reports
        .iter()
        .find(|report| matches!(report.status, StepStatus::Failed(_)))
    {
        bail!("Flow stopped at the {:?} step", report.step);
    }
    Ok(())
}
