use crate::{
    Arch, BenchmarkPaths, BuildMetadata, CommandError, Emulator, FeatureSet, OutputLayout,
    Platform, RESERVED_BIN_DIRS, RunMetadata, RunOptions, Settings, clean_dir, ensure_dir,
    list_dirs, now_iso, run_command, tool_available, write_json,
};
use anyhow::{Context, bail};
use log::{info, warn};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};

pub const DEFAULT_INTERVAL_SIZE: u64 = 10_000_000;

/// A built binary and the identifiers its outputs are filed under
#[derive(Debug, Clone)]
pub struct RunTarget {
    pub paths: BenchmarkPaths,
    pub binary: PathBuf,
    pub build_meta: Option<BuildMetadata>,
}

impl RunTarget {
    fn from_binary(paths: BenchmarkPaths, binary: PathBuf) -> Self {
        let meta_path = paths.build_meta_path();
        let build_meta = if meta_path.exists() {
            match BuildMetadata::load(&meta_path) {
                Ok(meta) => Some(meta),
                Err(err) => {
                    warn!("Ignoring unreadable {}: {:#}", meta_path.display(), err);
                    None
                }
            }
        } else {
            None
        };
        Self {
            paths,
            binary,
            build_meta,
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.paths.workload, self.paths.benchmark)
    }
}

/// Built binaries under `<outputs>/<emulator>/bin/<workload>/<bench>/<bench>`
pub fn discover_targets(
    layout: &OutputLayout,
    emulator: Emulator,
    workload: Option<&str>,
    benchmark: Option<&str>,
) -> anyhow::Result<Vec<RunTarget>> {
    let root = layout.binaries_root(emulator);
    if !root.is_dir() {
        bail!("No binaries found under {}, build first", root.display());
    }
    let workloads = match workload {
        Some(workload) => vec![workload.to_string()],
        None => list_dirs(&root)?
            .into_iter()
            .filter(|name| !RESERVED_BIN_DIRS.contains(&name.as_str()))
            .collect(),
    };

    let mut targets = vec![];
    for workload in workloads {
        let workload_dir = root.join(&workload);
        if !workload_dir.is_dir() {
            continue;
        }
        for bench in list_dirs(&workload_dir)? {
            if RESERVED_BIN_DIRS.contains(&bench.as_str()) {
                continue;
            }
            if benchmark.is_some_and(|only| only != bench) {
                continue;
            }
            let paths = layout.benchmark(emulator, &workload, &bench);
            let binary = paths.binary_path();
            if binary.is_file() {
                targets.push(RunTarget::from_binary(paths, binary));
            }
        }
    }
    Ok(targets)
}

/// A binary given on the command line, filed under the given names
pub fn explicit_target(
    layout: &OutputLayout,
    emulator: Emulator,
    binary: &Path,
    workload: &str,
    benchmark: &str,
) -> anyhow::Result<RunTarget> {
    if !binary.is_file() {
        bail!("Binary not found: {}", binary.display());
    }
    let paths = layout.benchmark(emulator, workload, benchmark);
    Ok(RunTarget::from_binary(paths, binary.to_path_buf()))
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub emulator: Emulator,
    pub arch: Arch,
    pub platform: Platform,
    pub isa: Option<String>,
    pub bbv: Option<bool>,
    pub trace: Option<bool>,
    pub interval_size: u64,
    pub clean: bool,
    pub stf_dump: bool,
}

/// Emulator invocation and the output files it is expected to produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub argv: Vec<String>,
    pub isa: String,
    pub bbv_file: Option<PathBuf>,
    pub trace_file: Option<PathBuf>,
}

pub struct WorkloadRunner<'a> {
    settings: &'a Settings,
    config: RunConfig,
}

impl<'a> WorkloadRunner<'a> {
    pub fn new(settings: &'a Settings, config: RunConfig) -> Self {
        Self { settings, config }
    }

    /// Emulator executable for this run
    pub fn tool(&self) -> String {
        let bits = self.config.arch.bits();
        match (self.config.emulator, self.config.platform) {
            (Emulator::Spike, _) => self.settings.spike.clone(),
            (Emulator::Qemu, Platform::Baremetal) => format!("qemu-system-riscv{}", bits),
            (Emulator::Qemu, Platform::Linux) => format!("qemu-riscv{}", bits),
        }
    }

    pub fn check_tool(&self) -> anyhow::Result<()> {
        let tool = self.tool();
        if !tool_available(&tool) {
            bail!("{} not found in PATH", tool);
        }
        Ok(())
    }

    pub fn features(&self, target: &RunTarget) -> FeatureSet {
        target
            .build_meta
            .as_ref()
            .map(|meta| meta.features)
            .unwrap_or_default()
            .overridden_by(self.config.bbv, self.config.trace)
    }

    /// `--isa`, else the build metadata, else the architecture default
    pub fn isa(&self, target: &RunTarget) -> String {
        self.config
            .isa
            .clone()
            .or_else(|| target.build_meta.as_ref().and_then(|meta| meta.isa.clone()))
            .unwrap_or_else(|| self.config.arch.default_isa().to_string())
    }

    pub fn plan(&self, target: &RunTarget) -> RunPlan {
        let features = self.features(target);
        let isa = self.isa(target);
        let paths = &target.paths;
        let bbv_file = features.bbv.then(|| paths.bbv_path());
        let trace_file = features.trace.then(|| paths.trace_path());
        match self.config.emulator {
            Emulator::Spike => self.spike_plan(target, isa, bbv_file, trace_file),
            Emulator::Qemu => self.qemu_plan(target, isa, bbv_file, trace_file),
        }
    }

    fn spike_plan(
        &self,
        target: &RunTarget,
        isa: String,
        bbv_file: Option<PathBuf>,
        trace_file: Option<PathBuf>,
    ) -> RunPlan {
        let mut argv = vec![self.tool(), format!("--isa={}", isa)];
        if let Some(bbv) = &bbv_file {
            argv.push("--en_bbv".to_string());
            argv.push(format!("--bb_file={}", bbv.display()));
            argv.push(format!("--simpoint_size={}", self.config.interval_size));
        }
        if let Some(trace) = &trace_file {
            argv.push("--stf_trace_memory_records".to_string());
            argv.push("--stf_macro_tracing".to_string());
            argv.push(format!("--stf_trace={}", trace.display()));
        }
        if self.config.platform == Platform::Linux {
            argv.push(self.settings.spike_pk.display().to_string());
        }
        argv.push(target.binary.display().to_string());
        RunPlan {
            argv,
            isa,
            bbv_file,
            trace_file,
        }
    }

    fn qemu_plan(
        &self,
        target: &RunTarget,
        isa: String,
        mut bbv_file: Option<PathBuf>,
        mut trace_file: Option<PathBuf>,
    ) -> RunPlan {
        let mut argv = vec![self.tool()];
        match self.config.platform {
            Platform::Baremetal => {
                argv.extend(
                    ["-nographic", "-machine", "virt", "-bios", "none", "-kernel"]
                        .iter()
                        .map(|arg| arg.to_string()),
                );
                argv.push(target.binary.display().to_string());
            }
            Platform::Linux => argv.push(target.binary.display().to_string()),
        }

        if let Some(bbv) = &bbv_file {
            if self.settings.bbv_plugin.exists() {
                argv.push("-plugin".to_string());
                argv.push(format!(
                    "{},interval={},outfile={}",
                    self.settings.bbv_plugin.display(),
                    self.config.interval_size,
                    bbv.display()
                ));
            } else {
                warn!(
                    "BBV plugin {} not found, skipping BBV collection",
                    self.settings.bbv_plugin.display()
                );
                bbv_file = None;
            }
        }
        if let Some(trace) = &trace_file {
            if self.settings.stf_plugin.exists() {
                argv.push("-plugin".to_string());
                argv.push(format!(
                    "{},mode=dyn_insn_count,start_dyn_insn=0,num_instructions={},outfile={}",
                    self.settings.stf_plugin.display(),
                    u64::MAX,
                    trace.display()
                ));
                argv.push("-d".to_string());
                argv.push("plugin".to_string());
            } else {
                warn!(
                    "STF plugin {} not found, skipping trace generation",
                    self.settings.stf_plugin.display()
                );
                trace_file = None;
            }
        }
        RunPlan {
            argv,
            isa,
            bbv_file,
            trace_file,
        }
    }

    /// Run one target; run metadata is written even when the emulator fails
    pub fn run(&self, target: &RunTarget) -> anyhow::Result<RunMetadata> {
        let paths = &target.paths;
        if self.config.clean {
            for dir in [paths.bbv_dir(), paths.trace_dir(), paths.logs_dir()] {
                clean_dir(dir)?;
            }
        }
        let plan = self.plan(target);
        if plan.bbv_file.is_some() {
            ensure_dir(paths.bbv_dir())?;
        }
        if plan.trace_file.is_some() {
            ensure_dir(paths.trace_dir())?;
        }
        ensure_dir(paths.logs_dir())?;

        info!("Running {} on {}", target.name(), self.config.emulator);
        let begin = Instant::now();
        let outcome = run_command(&plan.argv, &RunOptions::unchecked());
        let elapsed_seconds = begin.elapsed().as_secs_f64();

        let result = outcome.as_ref().ok();
        if let Some(result) = result {
            std::fs::write(paths.log_path(), result.combined_output())
                .with_context(|| format!("Failed to write {}", paths.log_path().display()))?;
        }

        let bbv_file = plan.bbv_file.as_ref().and_then(|bbv| {
            locate_output(bbv, &format!("{}.bbv*", paths.benchmark))
        });
        let trace_file = plan.trace_file.as_ref().and_then(|trace| {
            locate_output(trace, &format!("{}*.zstf", paths.benchmark))
        });
        let metadata = RunMetadata {
            timestamp: now_iso(),
            emulator: self.config.emulator,
            arch: self.config.arch,
            platform: self.config.platform,
            workload: paths.workload.clone(),
            benchmark: paths.benchmark.clone(),
            binary: target.binary.clone(),
            isa: plan.isa.clone(),
            interval_size: self.config.interval_size,
            bbv_enabled: plan.bbv_file.is_some(),
            trace_enabled: plan.trace_file.is_some(),
            bbv_file,
            trace_file,
            command: plan.argv.clone(),
            elapsed_seconds,
            exit_status: result.and_then(|result| result.status),
            build_meta: target.build_meta.clone(),
        };
        write_json(paths.run_meta_path(), &metadata)?;

        let result = outcome?;
        if !result.success() {
            return Err(CommandError::Failed(result).into());
        }
        if self.config.stf_dump {
            if let Some(trace) = &metadata.trace_file {
                self.dump_trace(trace)?;
            }
        }
        Ok(metadata)
    }

    fn dump_trace(&self, trace: &Path) -> anyhow::Result<()> {
        let tool = self.settings.stf_tool("stf_dump");
        run_command(
            &[tool.display().to_string(), trace.display().to_string()],
            &RunOptions::streamed(),
        )?;
        Ok(())
    }
}

/// The expected file, else the first sorted match of `fallback` next to it
pub fn locate_output(expected: &Path, fallback: &str) -> Option<PathBuf> {
    if expected.exists() {
        return Some(expected.to_path_buf());
    }
    let dir = expected.parent()?;
    let pattern = dir.join(fallback);
    let mut matches: Vec<PathBuf> = glob::glob(pattern.to_str()?)
        .ok()?
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .collect();
    matches.sort();
    match matches.into_iter().next() {
        Some(found) => {
            info!("Using {} for {}", found.display(), expected.display());
            Some(found)
        }
        None => {
            warn!("Expected output missing: {}", expected.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Arch, Emulator, OutputLayout, Platform, RunConfig, RunMetadata, RunTarget, Settings,
        WorkloadRunner, discover_targets, explicit_target, locate_output,
    };
    use std::path::{Path, PathBuf};

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn config(emulator: Emulator, platform: Platform) -> RunConfig {
        RunConfig {
            emulator,
            arch: Arch::Rv64,
            platform,
            isa: None,
            bbv: Some(true),
            trace: Some(true),
            interval_size: 100,
            clean: false,
            stf_dump: false,
        }
    }

    fn target(layout: &OutputLayout, emulator: Emulator) -> RunTarget {
        let paths = layout.benchmark(emulator, "embench", "crc32");
        touch(&paths.binary_path());
        explicit_target(layout, emulator, &paths.binary_path(), "embench", "crc32").unwrap()
    }

    #[test]
    fn test_discover_targets() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let bin = layout.binaries_root(Emulator::Spike);
        touch(&bin.join("env/crt0.o"));
        touch(&bin.join("embench/crc32/crc32"));
        touch(&bin.join("embench/common/obj/util.o"));
        std::fs::create_dir_all(bin.join("embench/unbuilt")).unwrap();
        touch(&bin.join("dhrystone/dhrystone/dhrystone"));

        let targets = discover_targets(&layout, Emulator::Spike, None, None).unwrap();
        let names: Vec<String> = targets.iter().map(|target| target.name()).collect();
        assert_eq!(names, vec!["dhrystone/dhrystone", "embench/crc32"]);

        let targets = discover_targets(&layout, Emulator::Spike, Some("embench"), Some("crc32")).unwrap();
        assert_eq!(targets.len(), 1);
        assert!(targets[0].build_meta.is_none());
        assert!(discover_targets(&layout, Emulator::Qemu, None, None).is_err());
    }

    #[test]
    fn test_spike_command() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let settings = Settings::with_outputs_root(dir.path());
        let target = target(&layout, Emulator::Spike);
        let runner = WorkloadRunner::new(&settings, config(Emulator::Spike, Platform::Linux));
        let plan = runner.plan(&target);
        let paths = &target.paths;
        assert_eq!(
            plan.argv,
            vec![
                "spike".to_string(),
                "--isa=rv64imafdc".to_string(),
                "--en_bbv".to_string(),
                format!("--bb_file={}", paths.bbv_path().display()),
                "--simpoint_size=100".to_string(),
                "--stf_trace_memory_records".to_string(),
                "--stf_macro_tracing".to_string(),
                format!("--stf_trace={}", paths.trace_path().display()),
                settings.spike_pk.display().to_string(),
                paths.binary_path().display().to_string(),
            ]
        );
    }

    #[test]
    fn test_qemu_missing_plugins_skip_features() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let settings = Settings {
            bbv_plugin: dir.path().join("missing-bbv.so"),
            stf_plugin: dir.path().join("missing-stf.so"),
            ..Settings::with_outputs_root(dir.path())
        };
        let target = target(&layout, Emulator::Qemu);
        let runner = WorkloadRunner::new(&settings, config(Emulator::Qemu, Platform::Baremetal));
        let plan = runner.plan(&target);
        assert_eq!(plan.argv[0], "qemu-system-riscv64");
        assert_eq!(plan.argv.len(), 8);
        assert_eq!(plan.bbv_file, None);
        assert_eq!(plan.trace_file, None);
    }

    #[test]
    fn test_qemu_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let plugin = dir.path().join("libbbv.so");
        touch(&plugin);
        let settings = Settings {
            bbv_plugin: plugin.clone(),
            ..Settings::with_outputs_root(dir.path())
        };
        let target = target(&layout, Emulator::Qemu);
        let mut run_config = config(Emulator::Qemu, Platform::Linux);
        run_config.trace = Some(false);
        let runner = WorkloadRunner::new(&settings, run_config);
        let plan = runner.plan(&target);
        assert_eq!(
            plan.argv,
            vec![
                "qemu-riscv64".to_string(),
                target.binary.display().to_string(),
                "-plugin".to_string(),
                format!(
                    "{},interval=100,outfile={}",
                    plugin.display(),
                    target.paths.bbv_path().display()
                ),
            ]
        );
    }

    #[test]
    fn test_run_writes_metadata_with_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let settings = Settings {
            spike: "true".to_string(),
            ..Settings::with_outputs_root(dir.path())
        };
        let target = target(&layout, Emulator::Spike);
        let produced = target.paths.bbv_dir().join("crc32.bbv_cpu0");
        touch(&produced);

        let runner = WorkloadRunner::new(&settings, config(Emulator::Spike, Platform::Baremetal));
        let metadata = runner.run(&target).unwrap();
        assert_eq!(metadata.bbv_file, Some(produced));
        assert_eq!(metadata.trace_file, None);
        assert_eq!(metadata.exit_status, Some(0));
        assert!(target.paths.log_path().exists());

        let stored = RunMetadata::load(target.paths.run_meta_path()).unwrap();
        assert_eq!(stored.isa, "rv64imafdc");
        assert!(stored.bbv_enabled);
    }

    #[test]
    fn test_failed_run_still_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let settings = Settings {
            spike: "false".to_string(),
            ..Settings::with_outputs_root(dir.path())
        };
        let target = target(&layout, Emulator::Spike);
        let runner = WorkloadRunner::new(&settings, config(Emulator::Spike, Platform::Baremetal));
        assert!(runner.run(&target).is_err());
        let stored = RunMetadata::load(target.paths.run_meta_path()).unwrap();
        assert_eq!(stored.exit_status, Some(1));
    }

    #[test]
    fn test_locate_output() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("bench.full.zstf");
        assert_eq!(locate_output(&expected, "bench*.zstf"), None);
        touch(&dir.path().join("bench.b.zstf"));
        touch(&dir.path().join("bench.a.zstf"));
        assert_eq!(
            locate_output(&expected, "bench*.zstf"),
            Some(dir.path().join("bench.a.zstf"))
        );
        touch(&expected);
        assert_eq!(locate_output(&expected, "bench*.zstf"), Some(PathBuf::from(&expected)));
    }
}
