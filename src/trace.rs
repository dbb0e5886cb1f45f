use crate::{
    Arch, Author, Emulator, IntervalMode, MetadataFactory, Platform, RunMetadata, RunOptions,
    Settings, TraceInterval, clean_dir, ensure_dir, get_tqdm_style, load_simpoints, now_iso,
    run_command, shell_join, trace_metadata_path, write_json,
};
use anyhow::{Context, bail};
use clap::ValueEnum;
use indicatif::ProgressBar;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the traced window of a single trace is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TraceMode {
    /// between the start/stop tracing macros compiled into the workload
    Macro,
    /// a window of dynamic instructions
    #[value(name = "insn_count")]
    InsnCount,
    /// a window starting once a PC has been hit a number of times
    #[value(name = "pc_count")]
    PcCount,
}

impl TraceMode {
    pub fn interval_mode(&self) -> IntervalMode {
        match self {
            TraceMode::Macro => IntervalMode::Macro,
            TraceMode::InsnCount => IntervalMode::InstructionCount,
            TraceMode::PcCount => IntervalMode::Ip,
        }
    }
}

/// Accepts decimal or `0x` prefixed program counters
pub fn parse_pc(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("invalid program counter '{}': {}", text, err))
}

#[derive(Debug, Clone)]
pub struct SingleTrace {
    pub binary: PathBuf,
    pub emulator: Emulator,
    pub mode: TraceMode,
    pub arch: Arch,
    pub isa: Option<String>,
    /// run the binary under the proxy kernel
    pub pk: bool,
    pub num_instructions: Option<u64>,
    pub start_instruction: u64,
    pub start_pc: Option<u64>,
    pub pc_threshold: u64,
    pub output: Option<PathBuf>,
    pub dump: bool,
}

/// `<binary>.zstf` by default; an output directory gets `<stem>.zstf`
pub fn resolve_output(binary: &Path, output: Option<&Path>) -> anyhow::Result<PathBuf> {
    let Some(output) = output else {
        return Ok(binary.with_extension("zstf"));
    };
    if output.is_dir() {
        let stem = binary.file_stem().unwrap_or_default().to_string_lossy();
        return Ok(output.join(format!("{}.zstf", stem)));
    }
    match output.extension().and_then(|ext| ext.to_str()) {
        Some("zstf") | Some("stf") => Ok(output.to_path_buf()),
        _ => bail!("--output must point to a directory or .zstf/.stf file"),
    }
}

/// First instruction of SimPoint interval `interval`
pub fn slice_start(interval: u64, interval_size: u64) -> anyhow::Result<u64> {
    match interval.checked_mul(interval_size) {
        Some(start) => Ok(start),
        None => bail!(
            "Interval {} of size {} overflows the instruction counter",
            interval,
            interval_size
        ),
    }
}

/// Last unsigned integer appearing in tool output
pub fn last_integer(text: &str) -> Option<u64> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .last()
}

#[derive(Debug, Clone)]
pub struct SliceRequest {
    pub emulator: Emulator,
    pub workload: String,
    pub benchmark: String,
    /// defaults to the interval size of the run
    pub interval_size: Option<u64>,
    pub simpoints: Option<PathBuf>,
    pub weights: Option<PathBuf>,
    pub verify: bool,
    pub dump: bool,
    pub clean: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceEntry {
    pub interval_index: u64,
    pub weight: f64,
    pub start_instruction: u64,
    pub num_instructions: u64,
    pub trace: PathBuf,
    pub metadata: PathBuf,
    /// None when verification was not requested or not possible
    pub verified: Option<bool>,
    pub counted_instructions: Option<u64>,
}

/// `slices.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceManifest {
    pub workload: String,
    pub benchmark: String,
    pub emulator: Emulator,
    pub interval_size: u64,
    pub generated_at: String,
    pub simpoints: PathBuf,
    pub weights: PathBuf,
    pub slices: Vec<SliceEntry>,
    pub total_weight: f64,
}

pub struct TraceGenerator<'a> {
    settings: &'a Settings,
    factory: MetadataFactory<'a>,
}

impl<'a> TraceGenerator<'a> {
    pub fn new(settings: &'a Settings, author: Author) -> Self {
        Self {
            settings,
            factory: MetadataFactory::new(settings, author),
        }
    }

    pub fn single_command(&self, request: &SingleTrace, output: &Path) -> anyhow::Result<Vec<String>> {
        let needs_count = || {
            request
                .num_instructions
                .with_context(|| format!("--num-instructions is required for {:?} mode", request.mode))
        };
        let mut argv = vec![];
        match request.emulator {
            Emulator::Spike => {
                argv.push(self.settings.spike.clone());
                if let Some(isa) = &request.isa {
                    argv.push(format!("--isa={}", isa));
                }
                argv.push("--stf_trace_memory_records".to_string());
                argv.push(format!("--stf_trace={}", output.display()));
                match request.mode {
                    TraceMode::Macro => argv.push("--stf_macro_tracing".to_string()),
                    TraceMode::InsnCount => {
                        let count = needs_count()?;
                        argv.push("--stf_insn_num_tracing".to_string());
                        argv.push("--stf_insn_start".to_string());
                        argv.push(request.start_instruction.to_string());
                        argv.push("--stf_insn_count".to_string());
                        argv.push(count.to_string());
                    }
                    TraceMode::PcCount => bail!("Spike does not support pc_count mode"),
                }
                if request.pk {
                    argv.push(self.settings.spike_pk.display().to_string());
                }
                argv.push(request.binary.display().to_string());
            }
            Emulator::Qemu => {
                argv.push(format!("qemu-riscv{}", request.arch.bits()));
                argv.push(request.binary.display().to_string());
                let plugin = &self.settings.stf_plugin;
                if !plugin.exists() {
                    bail!("STF plugin not found: {}", plugin.display());
                }
                let config = match request.mode {
                    TraceMode::InsnCount => {
                        // the plugin counts instructions from 1
                        let Some(start) = request.start_instruction.checked_add(1) else {
                            bail!(
                                "Start instruction {} overflows the instruction counter",
                                request.start_instruction
                            );
                        };
                        format!(
                            "{},mode=dyn_insn_count,start_dyn_insn={},num_instructions={},outfile={}",
                            plugin.display(),
                            start,
                            needs_count()?,
                            output.display()
                        )
                    }
                    TraceMode::PcCount => {
                        let Some(start_pc) = request.start_pc else {
                            bail!("pc_count requires --num-instructions and --start-pc");
                        };
                        format!(
                            "{},mode=ip,start_ip={},ip_hit_threshold={},num_instructions={},outfile={}",
                            plugin.display(),
                            start_pc,
                            request.pc_threshold,
                            needs_count()?,
                            output.display()
                        )
                    }
                    TraceMode::Macro => bail!("Macro tracing is not available via QEMU"),
                };
                argv.push("-plugin".to_string());
                argv.push(config);
                argv.push("-d".to_string());
                argv.push("plugin".to_string());
            }
        }
        Ok(argv)
    }

    fn single_interval(request: &SingleTrace) -> Option<TraceInterval> {
        match request.mode {
            TraceMode::Macro => None,
            TraceMode::InsnCount => Some(TraceInterval::InstructionCount {
                start_instruction: request.start_instruction,
                interval_length: request.num_instructions.unwrap_or_default(),
            }),
            TraceMode::PcCount => Some(TraceInterval::Ip {
                ip: request.start_pc.unwrap_or_default(),
                ip_count: request.pc_threshold,
                interval_length: request.num_instructions.unwrap_or_default(),
            }),
        }
    }

    /// Trace one window of a binary; returns the trace path
    pub fn generate_single(&self, request: &SingleTrace) -> anyhow::Result<PathBuf> {
        if !request.binary.is_file() {
            bail!("Binary not found: {}", request.binary.display());
        }
        let binary = std::fs::canonicalize(&request.binary)?;
        let output = resolve_output(&binary, request.output.as_deref())?;
        if let Some(parent) = output.parent() {
            ensure_dir(parent)?;
        }
        let request = SingleTrace {
            binary,
            ..request.clone()
        };

        let argv = self.single_command(&request, &output)?;
        info!("Generating trace: {}", shell_join(&argv));
        run_command(&argv, &RunOptions::default())?;

        let metadata = self.factory.create(
            &request.binary,
            &output,
            request.mode.interval_mode(),
            Self::single_interval(&request),
            Some(shell_join(&argv)),
            None,
        )?;
        write_json(trace_metadata_path(&output), &metadata)?;

        if request.dump {
            self.dump(&output)?;
        }
        info!("Trace generated at {}", output.display());
        Ok(output)
    }

    pub fn slice_command(
        &self,
        isa: &str,
        platform: Platform,
        binary: &Path,
        start: u64,
        count: u64,
        trace: &Path,
    ) -> Vec<String> {
        let mut argv = vec![
            self.settings.spike.clone(),
            format!("--isa={}", isa),
            "--stf_trace_memory_records".to_string(),
            "--stf_insn_num_tracing".to_string(),
            "--stf_insn_start".to_string(),
            start.to_string(),
            "--stf_insn_count".to_string(),
            count.to_string(),
            format!("--stf_trace={}", trace.display()),
        ];
        if platform == Platform::Linux {
            argv.push(self.settings.spike_pk.display().to_string());
        }
        argv.push(binary.display().to_string());
        argv
    }

    /// Count instructions with `stf_count`; (None, None) when that is not possible
    pub fn verify(&self, trace: &Path, expected: u64) -> (Option<bool>, Option<u64>) {
        let tool = self.settings.stf_tool("stf_count");
        if !tool.exists() {
            warn!("stf_count not available; skipping verification");
            return (None, None);
        }
        let argv = [tool.display().to_string(), trace.display().to_string()];
        match run_command(&argv, &RunOptions::default()) {
            Ok(result) => {
                let counted = last_integer(&result.stdout);
                let verified = counted.is_some_and(|counted| counted.abs_diff(expected) <= 1);
                if !verified {
                    warn!(
                        "{}: counted {:?} instructions, expected {}",
                        trace.display(),
                        counted,
                        expected
                    );
                }
                (Some(verified), counted)
            }
            Err(err) => {
                warn!("stf_count failed: {}", err);
                (None, None)
            }
        }
    }

    /// Write `stf_dump` output next to the trace as `.dump`
    pub fn dump(&self, trace: &Path) -> anyhow::Result<()> {
        let tool = self.settings.stf_tool("stf_dump");
        if !tool.exists() {
            warn!("stf_dump not available; skipping dump");
            return Ok(());
        }
        let argv = [tool.display().to_string(), trace.display().to_string()];
        match run_command(&argv, &RunOptions::default()) {
            Ok(result) => std::fs::write(trace.with_extension("dump"), result.stdout)?,
            Err(err) => warn!("stf_dump failed: {}", err),
        }
        Ok(())
    }

    /// One trace per SimPoint interval of a previous run
    pub fn generate_sliced(&self, request: &SliceRequest) -> anyhow::Result<SliceManifest> {
        if request.emulator != Emulator::Spike {
            bail!("Sliced trace generation requires spike");
        }
        let paths = self
            .settings
            .layout()
            .benchmark(request.emulator, &request.workload, &request.benchmark);
        let run_meta_path = paths.run_meta_path();
        if !run_meta_path.exists() {
            bail!(
                "run_meta.json not found, run the workload first: {}",
                run_meta_path.display()
            );
        }
        let run = RunMetadata::load(&run_meta_path)?;
        let interval_size = request.interval_size.unwrap_or(run.interval_size);
        if interval_size == 0 {
            bail!("Interval size missing; pass --interval-size");
        }
        if run.isa.is_empty() {
            bail!("ISA missing from run metadata");
        }
        if !run.binary.is_file() {
            bail!("Binary not found: {}", run.binary.display());
        }

        let simpoints = request
            .simpoints
            .clone()
            .unwrap_or_else(|| paths.simpoints_path());
        let weights = request.weights.clone().unwrap_or_else(|| paths.weights_path());
        if !simpoints.exists() || !weights.exists() {
            bail!(
                "SimPoint files missing: {} {}",
                simpoints.display(),
                weights.display()
            );
        }
        let entries = load_simpoints(&simpoints, &weights)?.entries;
        if entries.is_empty() {
            bail!("No SimPoint entries detected in {}", simpoints.display());
        }

        let output_dir = paths.simpoint_dir();
        if request.clean {
            clean_dir(&output_dir)?;
        } else {
            ensure_dir(&output_dir)?;
        }
        info!(
            "Generating {} sliced traces for {}/{}",
            entries.len(),
            request.workload,
            request.benchmark
        );

        let pbar = ProgressBar::new(entries.len() as u64);
        pbar.set_style(get_tqdm_style());
        let mut slices = vec![];
        for entry in &entries {
            let start = slice_start(entry.interval, interval_size)?;
            let trace = paths.slice_trace_path(entry.interval);
            pbar.set_message(format!("interval {}", entry.interval));

            let argv = self.slice_command(&run.isa, run.platform, &run.binary, start, interval_size, &trace);
            run_command(&argv, &RunOptions::default())
                .with_context(|| format!("Failed to slice interval {}", entry.interval))?;

            let (verified, counted_instructions) = if request.verify {
                self.verify(&trace, interval_size)
            } else {
                (None, None)
            };
            if request.dump {
                self.dump(&trace)?;
            }

            let metadata = self.factory.create(
                &run.binary,
                &trace,
                IntervalMode::InstructionCount,
                Some(TraceInterval::InstructionCount {
                    start_instruction: start,
                    interval_length: interval_size,
                }),
                Some(shell_join(&argv)),
                None,
            )?;
            let metadata_path = trace_metadata_path(&trace);
            write_json(&metadata_path, &metadata)?;

            slices.push(SliceEntry {
                interval_index: entry.interval,
                weight: entry.weight,
                start_instruction: start,
                num_instructions: interval_size,
                trace,
                metadata: metadata_path,
                verified,
                counted_instructions,
            });
            pbar.inc(1);
        }
        pbar.finish_and_clear();

        let manifest = SliceManifest {
            workload: request.workload.clone(),
            benchmark: request.benchmark.clone(),
            emulator: request.emulator,
            interval_size,
            generated_at: now_iso(),
            simpoints,
            weights,
            total_weight: entries.iter().map(|entry| entry.weight).sum(),
            slices,
        };
        write_json(paths.slices_manifest_path(), &manifest)?;
        info!("SimPoint slices stored under {}", output_dir.display());
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Arch, Author, Emulator, IntervalMode, Platform, RunMetadata, Settings, SingleTrace,
        SliceManifest, SliceRequest, TraceGenerator, TraceInfoValue, TraceInterval, TraceMetadata,
        TraceMode, last_integer, now_iso, parse_pc, read_json, resolve_output, sha256_file,
        slice_start, trace_metadata_path, write_json,
    };
    use std::{
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    };

    fn script(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Settings with a spike that writes `<insn_count + 1> instructions` into
    /// the trace, and STF tools that read it back
    fn fake_tools(dir: &Path) -> Settings {
        let spike = dir.join("spike");
        script(
            &spike,
            r#"out=""
count=0
while [ $# -gt 0 ]; do
  case "$1" in
    --stf_trace=*) out="${1#--stf_trace=}" ;;
    --stf_insn_count) count="$2"; shift ;;
  esac
  shift
done
echo "$((count + 1)) instructions" > "$out"
"#,
        );
        let tools = dir.join("stf_tools");
        script(&tools.join("stf_count").join("stf_count"), "cat \"$1\"\n");
        script(
            &tools.join("stf_trace_info").join("stf_trace_info"),
            "printf 'VERSION 1.5\\nGENERATOR spike\\n\\nSTF_CONTAIN_RV64\\n'\n",
        );
        Settings {
            outputs_root: dir.join("outputs"),
            stf_tools: tools,
            spike: spike.display().to_string(),
            ..Default::default()
        }
    }

    fn elf_binary(dir: &Path) -> PathBuf {
        let binary = dir.join("bench");
        std::fs::copy("/bin/true", &binary).unwrap();
        binary
    }

    fn request(emulator: Emulator, mode: TraceMode) -> SingleTrace {
        SingleTrace {
            binary: PathBuf::from("/w/bench"),
            emulator,
            mode,
            arch: Arch::Rv64,
            isa: Some("rv64gc".to_string()),
            pk: false,
            num_instructions: Some(1000),
            start_instruction: 50,
            start_pc: Some(0x80000000),
            pc_threshold: 2,
            output: None,
            dump: false,
        }
    }

    #[test]
    fn test_slice_start() {
        assert_eq!(slice_start(3, 10_000_000).unwrap(), 30_000_000);
        assert_eq!(slice_start(0, 10_000_000).unwrap(), 0);
        assert!(slice_start(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_parse_pc() {
        assert_eq!(parse_pc("0x80000000"), Ok(0x80000000));
        assert_eq!(parse_pc("4096"), Ok(4096));
        assert!(parse_pc("0xzz").is_err());
    }

    #[test]
    fn test_last_integer() {
        assert_eq!(last_integer("trace.zstf: 3 records, 10000001 instructions\n"), Some(10000001));
        assert_eq!(last_integer("no numbers"), None);
    }

    #[test]
    fn test_resolve_output() {
        let dir = tempfile::tempdir().unwrap();
        let binary = Path::new("/w/bench");
        assert_eq!(resolve_output(binary, None).unwrap(), PathBuf::from("/w/bench.zstf"));
        assert_eq!(
            resolve_output(binary, Some(dir.path())).unwrap(),
            dir.path().join("bench.zstf")
        );
        assert_eq!(
            resolve_output(binary, Some(Path::new("/t/out.stf"))).unwrap(),
            PathBuf::from("/t/out.stf")
        );
        assert!(resolve_output(binary, Some(Path::new("/t/out.txt"))).is_err());
    }

    #[test]
    fn test_spike_single_commands() {
        let settings = Settings::default();
        let generator = TraceGenerator::new(&settings, Author::default());
        let output = Path::new("/t/bench.zstf");

        let argv = generator
            .single_command(&request(Emulator::Spike, TraceMode::InsnCount), output)
            .unwrap();
        assert_eq!(
            argv,
            vec![
                "spike",
                "--isa=rv64gc",
                "--stf_trace_memory_records",
                "--stf_trace=/t/bench.zstf",
                "--stf_insn_num_tracing",
                "--stf_insn_start",
                "50",
                "--stf_insn_count",
                "1000",
                "/w/bench",
            ]
        );

        let argv = generator
            .single_command(&request(Emulator::Spike, TraceMode::Macro), output)
            .unwrap();
        assert!(argv.contains(&"--stf_macro_tracing".to_string()));
        assert!(
            generator
                .single_command(&request(Emulator::Spike, TraceMode::PcCount), output)
                .is_err()
        );

        let mut missing = request(Emulator::Spike, TraceMode::InsnCount);
        missing.num_instructions = None;
        assert!(generator.single_command(&missing, output).is_err());
    }

    #[test]
    fn test_qemu_single_commands() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("libstfmem.so");
        std::fs::write(&plugin, b"").unwrap();
        let settings = Settings {
            stf_plugin: plugin.clone(),
            ..Default::default()
        };
        let generator = TraceGenerator::new(&settings, Author::default());
        let output = Path::new("/t/bench.zstf");

        let argv = generator
            .single_command(&request(Emulator::Qemu, TraceMode::InsnCount), output)
            .unwrap();
        assert_eq!(argv[0], "qemu-riscv64");
        assert_eq!(
            argv[3],
            format!(
                "{},mode=dyn_insn_count,start_dyn_insn=51,num_instructions=1000,outfile=/t/bench.zstf",
                plugin.display()
            )
        );

        let argv = generator
            .single_command(&request(Emulator::Qemu, TraceMode::PcCount), output)
            .unwrap();
        assert_eq!(
            argv[3],
            format!(
                "{},mode=ip,start_ip=2147483648,ip_hit_threshold=2,num_instructions=1000,outfile=/t/bench.zstf",
                plugin.display()
            )
        );
        assert!(
            generator
                .single_command(&request(Emulator::Qemu, TraceMode::Macro), output)
                .is_err()
        );

        let mut last = request(Emulator::Qemu, TraceMode::InsnCount);
        last.start_instruction = u64::MAX;
        let err = generator.single_command(&last, output).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_slice_command() {
        let settings = Settings::default();
        let generator = TraceGenerator::new(&settings, Author::default());
        let argv = generator.slice_command(
            "rv64gc",
            Platform::Linux,
            Path::new("/w/bench"),
            30_000_000,
            10_000_000,
            Path::new("/s/bench.sp_3.zstf"),
        );
        assert_eq!(argv[5], "30000000");
        assert_eq!(argv[7], "10000000");
        assert_eq!(argv[argv.len() - 2], settings.spike_pk.display().to_string());
        assert_eq!(argv.last().unwrap(), "/w/bench");
    }

    #[test]
    fn test_sliced_requires_run() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_outputs_root(dir.path());
        let generator = TraceGenerator::new(&settings, Author::default());
        let request = SliceRequest {
            emulator: Emulator::Spike,
            workload: "embench".to_string(),
            benchmark: "crc32".to_string(),
            interval_size: None,
            simpoints: None,
            weights: None,
            verify: false,
            dump: false,
            clean: false,
        };
        let err = generator.generate_sliced(&request).unwrap_err();
        assert!(err.to_string().contains("run_meta.json"));

        let qemu = SliceRequest {
            emulator: Emulator::Qemu,
            ..request
        };
        assert!(generator.generate_sliced(&qemu).is_err());
    }

    #[test]
    fn test_generate_single_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let settings = fake_tools(dir.path());
        let binary = elf_binary(dir.path());
        let out = dir.path().join("traces");
        std::fs::create_dir(&out).unwrap();
        let generator = TraceGenerator::new(&settings, Author::default());

        let trace = generator
            .generate_single(&SingleTrace {
                binary: binary.clone(),
                output: Some(out.clone()),
                ..request(Emulator::Spike, TraceMode::InsnCount)
            })
            .unwrap();
        assert_eq!(trace, out.join("bench.zstf"));
        assert_eq!(std::fs::read_to_string(&trace).unwrap(), "1001 instructions\n");

        let metadata = TraceMetadata::from_path(trace_metadata_path(&trace)).unwrap();
        assert_eq!(metadata.workload.filename, "bench");
        assert_eq!(metadata.workload.sha256, sha256_file(&binary).unwrap());
        assert_eq!(metadata.stf.interval_mode, IntervalMode::InstructionCount);
        assert_eq!(
            metadata.stf.interval,
            Some(TraceInterval::InstructionCount {
                start_instruction: 50,
                interval_length: 1000
            })
        );
        let command = metadata.workload.execution_command.unwrap();
        assert!(command.contains("--stf_insn_start 50 --stf_insn_count 1000"));
        assert_eq!(
            metadata.stf.trace_info["VERSION"],
            TraceInfoValue::Text("1.5".to_string())
        );
        assert_eq!(
            metadata.stf.trace_info["STF_FEATURES"],
            TraceInfoValue::List(vec!["STF_CONTAIN_RV64".to_string()])
        );
    }

    #[test]
    fn test_verify_tolerates_one_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let settings = fake_tools(dir.path());
        let generator = TraceGenerator::new(&settings, Author::default());
        let trace = dir.path().join("slice.zstf");

        for (counted, verified) in [(1000, true), (1001, true), (999, true), (1002, false), (998, false)] {
            std::fs::write(&trace, format!("{} instructions\n", counted)).unwrap();
            assert_eq!(
                generator.verify(&trace, 1000),
                (Some(verified), Some(counted)),
                "counted {}",
                counted
            );
        }

        let missing = Settings {
            stf_tools: dir.path().join("nowhere"),
            ..settings.clone()
        };
        let generator = TraceGenerator::new(&missing, Author::default());
        assert_eq!(generator.verify(&trace, 1000), (None, None));
    }

    #[test]
    fn test_generate_sliced() {
        let dir = tempfile::tempdir().unwrap();
        let settings = fake_tools(dir.path());
        let binary = elf_binary(dir.path());
        let paths = settings
            .layout()
            .benchmark(Emulator::Spike, "embench", "crc32");

        std::fs::create_dir_all(paths.run_root()).unwrap();
        write_json(
            paths.run_meta_path(),
            &RunMetadata {
                timestamp: now_iso(),
                emulator: Emulator::Spike,
                arch: Arch::Rv64,
                platform: Platform::Baremetal,
                workload: "embench".to_string(),
                benchmark: "crc32".to_string(),
                binary: binary.clone(),
                isa: "rv64imafdc".to_string(),
                interval_size: 10_000_000,
                bbv_enabled: true,
                trace_enabled: false,
                bbv_file: Some(paths.bbv_path()),
                trace_file: None,
                command: vec![],
                elapsed_seconds: 1.0,
                exit_status: Some(0),
                build_meta: None,
            },
        )
        .unwrap();
        std::fs::create_dir_all(paths.simpoints_path().parent().unwrap()).unwrap();
        std::fs::write(paths.simpoints_path(), "7 1\n3 0\n").unwrap();
        std::fs::write(paths.weights_path(), "0.25 0\n0.75 1\n").unwrap();

        let generator = TraceGenerator::new(&settings, Author::default());
        let manifest = generator
            .generate_sliced(&SliceRequest {
                emulator: Emulator::Spike,
                workload: "embench".to_string(),
                benchmark: "crc32".to_string(),
                interval_size: None,
                simpoints: None,
                weights: None,
                verify: true,
                dump: false,
                clean: true,
            })
            .unwrap();

        assert_eq!(manifest.interval_size, 10_000_000);
        assert_eq!(manifest.total_weight, 1.0);
        assert_eq!(manifest.slices.len(), 2);
        let first = &manifest.slices[0];
        assert_eq!(first.interval_index, 3);
        assert_eq!(first.weight, 0.25);
        assert_eq!(first.start_instruction, 30_000_000);
        assert_eq!(first.num_instructions, 10_000_000);
        assert_eq!(first.trace, paths.slice_trace_path(3));
        // spike traced one instruction more than asked, which still verifies
        assert_eq!(first.verified, Some(true));
        assert_eq!(first.counted_instructions, Some(10_000_001));
        assert_eq!(manifest.slices[1].start_instruction, 70_000_000);
        assert_eq!(manifest.slices[1].weight, 0.75);

        let metadata = TraceMetadata::from_path(&first.metadata).unwrap();
        assert_eq!(metadata.start_instruction(), Some(30_000_000));
        assert_eq!(metadata.workload.sha256, sha256_file(&binary).unwrap());
        assert!(
            metadata
                .workload
                .execution_command
                .unwrap()
                .contains("--isa=rv64imafdc")
        );

        let stored: SliceManifest = read_json(paths.slices_manifest_path()).unwrap();
        assert_eq!(stored, manifest);
    }
}
