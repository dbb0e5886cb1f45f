//! Share STF traces through a local trace archive
use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use cli_table::{Cell, Table, print_stdout};
use log::info;
use std::path::{Path, PathBuf};
use stf_trace_flow::{
    ArchiveConfig, ArchiveError, LocalStorage, TraceArchive, TraceInterval, TraceMetadata,
    UploadRequest, display_relative, get_selection, init_logger,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Storage configuration file
    #[arg(long, env = "TRACE_SHARE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Use a configured storage instead of the default one
    #[arg(long, global = true, conflicts_with = "storage_path")]
    storage_name: Option<String>,

    /// Use an archive directory directly
    #[arg(long, global = true)]
    storage_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload traces, and their workload when it is not archived yet
    Upload {
        /// Trace files; metadata is read from <trace>.metadata.yaml
        #[arg(long)]
        trace: Vec<PathBuf>,

        /// Workload binary
        #[arg(long)]
        workload: Option<PathBuf>,

        /// Add partial traces to this existing attempt
        #[arg(long)]
        attempt: Option<u32>,

        /// Part numbers, one per --trace in order
        #[arg(long)]
        part: Vec<u32>,

        /// Pick files interactively
        #[arg(long)]
        it: bool,
    },
    /// List archived traces
    List,
    /// Copy a trace, its metadata or a workload out of the archive
    Get(GetArgs),
    /// Configure storages
    Setup {
        /// Register a local storage under this name (requires --path)
        #[arg(long, requires = "path")]
        add_storage: Option<String>,

        /// Directory of the new storage
        #[arg(long)]
        path: Option<PathBuf>,

        /// Make this storage the default
        #[arg(long)]
        set_default_storage: Option<String>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct GetSelection {
    /// Trace id to download, with its metadata
    #[arg(long, value_name = "TRACE_ID")]
    trace: Option<String>,

    /// Trace id whose metadata to download
    #[arg(long, value_name = "TRACE_ID")]
    metadata: Option<String>,

    /// Workload id to download
    #[arg(long, value_name = "WORKLOAD_ID")]
    workload: Option<u32>,
}

#[derive(Args)]
struct GetArgs {
    #[command(flatten)]
    selection: GetSelection,

    /// Output folder or file path
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn default_config_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".config")
            .join("trace_share")
            .join("config.yaml"),
        None => PathBuf::from("trace_share.yaml"),
    }
}

fn open_storage(cli: &Cli, config: &ArchiveConfig) -> anyhow::Result<LocalStorage> {
    if let Some(path) = &cli.storage_path {
        return Ok(LocalStorage::open(path)?);
    }
    match config.select(cli.storage_name.as_deref()) {
        Ok(storage) => Ok(storage.open()?),
        Err(ArchiveError::NoStorage) => {
            bail!("No storage configured, run `trace_share setup --add-storage NAME --path DIR`")
        }
        Err(err) => Err(err.into()),
    }
}

/// Files under the working directory matching a glob pattern
fn candidates(pattern: &str, keep: impl Fn(&Path) -> bool) -> anyhow::Result<Vec<String>> {
    let mut found = vec![];
    for entry in glob::glob(pattern)? {
        let path = entry?;
        if path.is_file() && keep(&path) {
            found.push(path.display().to_string());
        }
    }
    Ok(found)
}

fn describe_interval(metadata: &TraceMetadata) -> String {
    match metadata.stf.interval {
        None => "fully traced".to_string(),
        Some(TraceInterval::InstructionCount {
            start_instruction,
            interval_length,
        }) => format!("insn {} +{}", start_instruction, interval_length),
        Some(TraceInterval::Ip {
            ip,
            ip_count,
            interval_length,
        }) => format!("pc {:#x} x{} +{}", ip, ip_count, interval_length),
    }
}

fn upload(
    archive: &mut TraceArchive<LocalStorage>,
    mut request: UploadRequest,
    interactive: bool,
) -> anyhow::Result<()> {
    if interactive && request.traces.is_empty() {
        let traces = candidates("**/*.zstf", |_| true)?;
        request
            .traces
            .push(PathBuf::from(get_selection(traces, "trace> ")?));
    }
    if request.traces.is_empty() {
        bail!("Provide at least one --trace, or --it");
    }

    let plan = match archive.plan_upload(&request) {
        Err(ArchiveError::WorkloadRequired(_)) if interactive && request.workload.is_none() => {
            let binaries = candidates("**/*", |path| {
                let name = path.to_string_lossy();
                !name.ends_with(".zstf") && !name.ends_with(".yaml") && !name.ends_with(".json")
            })?;
            request.workload = Some(PathBuf::from(get_selection(binaries, "workload> ")?));
            archive.plan_upload(&request)?
        }
        other => other?,
    };

    for trace in &plan.traces {
        info!(
            "{} -> {} ({})",
            trace.source.display(),
            trace.trace_id,
            describe_interval(&trace.metadata)
        );
    }
    for id in archive.commit(&plan)? {
        println!("{}", id);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logger();
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = ArchiveConfig::load(&config_path)?;

    match &cli.command {
        Commands::Setup {
            add_storage,
            path,
            set_default_storage,
        } => {
            if add_storage.is_none() && set_default_storage.is_none() {
                bail!("Nothing to do, pass --add-storage or --set-default-storage");
            }
            if let (Some(name), Some(path)) = (add_storage, path) {
                config.add_local_storage(name, path)?;
                info!("Added storage {} at {}", name, path.display());
            }
            if let Some(name) = set_default_storage {
                config.set_default(name)?;
                info!("Default storage is now {}", name);
            }
            config.save(&config_path)?;
        }
        Commands::Upload {
            trace,
            workload,
            attempt,
            part,
            it,
        } => {
            let mut archive = TraceArchive::new(open_storage(&cli, &config)?);
            let request = UploadRequest {
                traces: trace.clone(),
                workload: workload.clone(),
                attempt: *attempt,
                parts: part.clone(),
            };
            upload(&mut archive, request, *it)?;
        }
        Commands::List => {
            let archive = TraceArchive::new(open_storage(&cli, &config)?);
            let rows = archive.list()?;
            if rows.is_empty() {
                println!("No traces found.");
                return Ok(());
            }
            let mut table = vec![];
            for (row, metadata, bytes) in rows {
                table.push(vec![
                    row.trace_id.cell(),
                    row.workload_name.cell(),
                    row.attempt.cell(),
                    row.part.cell(),
                    describe_interval(&metadata).cell(),
                    size::Size::from_bytes(bytes).to_string().cell(),
                    metadata.stf.timestamp.cell(),
                    metadata.description.unwrap_or_default().cell(),
                ]);
            }
            let table = table.table().title(vec![
                "Trace ID".cell(),
                "Workload".cell(),
                "Attempt".cell(),
                "Part".cell(),
                "Interval".cell(),
                "Size".cell(),
                "Timestamp".cell(),
                "Description".cell(),
            ]);
            print_stdout(table)?;
        }
        Commands::Get(get) => {
            let archive = TraceArchive::new(open_storage(&cli, &config)?);
            let output = get.output.as_deref();
            let selection = &get.selection;
            if let Some(trace_id) = &selection.trace {
                let (trace, metadata) = archive.save_trace(trace_id, output)?;
                println!("Trace {} saved to {}", trace_id, display_relative(&trace));
                println!("Metadata saved to {}", display_relative(&metadata));
            } else if let Some(trace_id) = &selection.metadata {
                let metadata = archive.save_metadata(trace_id, output)?;
                println!("Metadata {} saved to {}", trace_id, display_relative(&metadata));
            } else if let Some(workload_id) = selection.workload {
                let workload = archive.save_workload(workload_id, output)?;
                println!("Workload {} saved to {}", workload_id, display_relative(&workload));
            }
        }
    }
    Ok(())
}
