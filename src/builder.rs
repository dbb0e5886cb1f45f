use crate::{
    BenchmarkPaths, BuildConfig, BuildMetadata, FinalConfig, OutputLayout, RunOptions, clean_dir,
    ensure_dir, run_command, write_json,
};
use anyhow::{Context, bail};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Entry point every environment calls; anything else gets a wrapper
pub const DEFAULT_ENTRYPOINT: &str = "benchmark";

/// Benchmarks shown per workload by `--list`
const LIST_SAMPLE: usize = 6;

pub fn compile_command(config: &FinalConfig, source: &Path, object: &Path) -> Vec<String> {
    let mut argv = vec![config.tools.cc.clone(), "-c".to_string()];
    argv.extend(config.flags.cflags_with_includes());
    argv.push("-o".to_string());
    argv.push(object.display().to_string());
    argv.push(source.display().to_string());
    argv
}

/// `cc [-T<lds>] ldflags -o out objects libs`
pub fn link_command(config: &FinalConfig, output: &Path, objects: &[PathBuf]) -> Vec<String> {
    let mut argv = vec![config.tools.cc.clone()];
    if let Some(script) = &config.flags.linker_script {
        argv.push(format!("-T{}", script.display()));
    }
    argv.extend(config.flags.ldflags.iter().cloned());
    argv.push("-o".to_string());
    argv.push(output.display().to_string());
    argv.extend(objects.iter().map(|object| object.display().to_string()));
    argv.extend(config.flags.libs.iter().cloned());
    argv
}

pub fn wrapper_source(entrypoint: &str) -> String {
    format!(
        "extern int {entry}(void);\nint benchmark(void) {{\n    return {entry}();\n}}\n",
        entry = entrypoint
    )
}

fn object_path(dir: &Path, source: &Path) -> PathBuf {
    let stem = source.file_stem().unwrap_or_default();
    dir.join(format!("{}.o", stem.to_string_lossy()))
}

/// Objects compiled once per workload and linked into every benchmark
#[derive(Debug, Clone, Default)]
pub struct SharedObjects {
    pub env: Vec<PathBuf>,
    pub common: Vec<PathBuf>,
    pub support_once: Vec<PathBuf>,
}

impl SharedObjects {
    fn all(&self) -> Vec<PathBuf> {
        self.env
            .iter()
            .chain(self.common.iter())
            .chain(self.support_once.iter())
            .cloned()
            .collect()
    }
}

/// Compiles and links the benchmarks of one resolved workload
pub struct WorkloadBuilder {
    config: FinalConfig,
    layout: OutputLayout,
    entrypoint: String,
}

impl WorkloadBuilder {
    pub fn new(config: FinalConfig, entrypoint: Option<&str>) -> Self {
        let layout = OutputLayout::new(&config.paths.outputs_root);
        Self {
            config,
            layout,
            entrypoint: entrypoint.unwrap_or(DEFAULT_ENTRYPOINT).to_string(),
        }
    }

    pub fn config(&self) -> &FinalConfig {
        &self.config
    }

    fn paths(&self, benchmark: &str) -> BenchmarkPaths {
        self.layout
            .benchmark(self.config.emulator, &self.config.workload, benchmark)
    }

    /// Either the requested benchmark or everything the layout discovers
    pub fn benchmarks(&self, only: Option<&str>) -> anyhow::Result<Vec<String>> {
        match only {
            Some(benchmark) => Ok(vec![benchmark.to_string()]),
            None => self.config.layout.list_benchmarks(&self.config.workload),
        }
    }

    fn compile(&self, config: &FinalConfig, source: &Path, object: &Path) -> anyhow::Result<()> {
        if let Some(parent) = object.parent() {
            ensure_dir(parent)?;
        }
        run_command(&compile_command(config, source, object), &RunOptions::default())
            .with_context(|| format!("Failed to compile {}", source.display()))?;
        Ok(())
    }

    fn compile_many(&self, config: &FinalConfig, sources: &[PathBuf], dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        ensure_dir(dir)?;
        let mut objects = vec![];
        for source in sources {
            let object = object_path(dir, source);
            self.compile(config, source, &object)?;
            objects.push(object);
        }
        Ok(objects)
    }

    pub fn compile_environment(&self) -> anyhow::Result<Vec<PathBuf>> {
        let env_out = ensure_dir(self.layout.env_dir(self.config.emulator))?;
        if self.config.env.skip {
            debug!("Skipping environment files for {}", self.config.workload);
            return Ok(vec![]);
        }
        let mut objects = vec![];
        for name in &self.config.env.files {
            let source = self.config.env.dir.join(name);
            if !source.exists() {
                bail!("Environment file missing: {}", source.display());
            }
            let object = object_path(&env_out, &source);
            self.compile(&self.config, &source, &object)?;
            objects.push(object);
        }
        Ok(objects)
    }

    pub fn prepare_shared(&self) -> anyhow::Result<SharedObjects> {
        let env = self.compile_environment()?;
        let common = self.compile_many(
            &self.config,
            &self.config.layout.common_sources()?,
            &self.layout.common_obj_dir(self.config.emulator, &self.config.workload),
        )?;
        let support_once = self.compile_many(
            &self.config,
            &self.config.layout.support_once_sources()?,
            &self.layout.support_once_obj_dir(self.config.emulator, &self.config.workload),
        )?;
        Ok(SharedObjects {
            env,
            common,
            support_once,
        })
    }

    fn wrapper(&self, config: &FinalConfig) -> anyhow::Result<Option<PathBuf>> {
        if self.entrypoint == DEFAULT_ENTRYPOINT {
            return Ok(None);
        }
        let dir = ensure_dir(self.layout.wrapper_dir(self.config.emulator))?;
        let source = dir.join("wrapper_entry.c");
        std::fs::write(&source, wrapper_source(&self.entrypoint))?;
        let object = dir.join("wrapper_entry.o");
        self.compile(config, &source, &object)?;
        Ok(Some(object))
    }

    fn link(
        &self,
        config: &FinalConfig,
        paths: &BenchmarkPaths,
        mut objects: Vec<PathBuf>,
        sources: Vec<PathBuf>,
    ) -> anyhow::Result<PathBuf> {
        if let Some(wrapper) = self.wrapper(config)? {
            objects.push(wrapper);
        }
        let binary = paths.binary_path();
        ensure_dir(paths.binary_dir())?;
        run_command(&link_command(config, &binary, &objects), &RunOptions::default())
            .with_context(|| format!("Failed to link {}", binary.display()))?;

        let metadata = BuildMetadata::new(config, &paths.benchmark, &self.entrypoint, sources, binary.clone());
        write_json(paths.build_meta_path(), &metadata)?;
        Ok(binary)
    }

    /// Compile one benchmark's sources and link them with the shared objects
    pub fn build_benchmark(
        &self,
        shared: &SharedObjects,
        benchmark: &str,
        clean: bool,
    ) -> anyhow::Result<PathBuf> {
        let config = self.config.for_benchmark(benchmark)?;
        let paths = self.paths(benchmark);
        if clean {
            clean_dir(paths.binary_dir())?;
        }

        let sources = config.layout.benchmark_sources(benchmark)?;
        if sources.is_empty() {
            bail!("No sources discovered for benchmark '{}'", benchmark);
        }
        let objects = self.compile_many(&config, &sources, &paths.object_dir())?;

        let mut inputs = shared.all();
        inputs.extend(objects);
        let binary = self.link(&config, &paths, inputs, sources)?;
        info!("Built {}", binary.display());
        Ok(binary)
    }

    /// Link prebuilt objects or archives with the environment
    pub fn link_objects(&self, benchmark: &str, objects: &[PathBuf], clean: bool) -> anyhow::Result<PathBuf> {
        let config = self.config.for_benchmark(benchmark)?;
        let paths = self.paths(benchmark);
        if clean {
            clean_dir(paths.binary_dir())?;
        }
        let mut resolved = vec![];
        for object in objects {
            if !object.exists() {
                bail!("Input object not found: {}", object.display());
            }
            resolved.push(std::fs::canonicalize(object)?);
        }

        let mut inputs = self.compile_environment()?;
        inputs.extend(resolved.iter().cloned());
        let binary = self.link(&config, &paths, inputs, resolved)?;
        info!("Linked {} from provided objects", binary.display());
        Ok(binary)
    }
}

/// One line per configured workload: layout mode, root and a sample of benchmarks
pub fn describe_workloads<F>(config: &BuildConfig, mut finalize: F) -> Vec<String>
where
    F: FnMut(&str) -> anyhow::Result<FinalConfig>,
{
    let mut lines = vec![];
    for workload in config.list_workloads() {
        let final_config = match finalize(&workload) {
            Ok(final_config) => final_config,
            Err(err) => {
                warn!("{}: failed to resolve: {:#}", workload, err);
                lines.push(format!("{}: unresolved", workload));
                continue;
            }
        };
        let layout = &final_config.layout;
        let mut line = format!(
            "{} ({}): {}",
            workload,
            layout.mode_name(),
            final_config.workload_root.display()
        );
        if let Ok(benchmarks) = layout.list_benchmarks(&workload) {
            let mut sample = benchmarks
                .iter()
                .take(LIST_SAMPLE)
                .cloned()
                .collect::<Vec<String>>()
                .join(", ");
            if benchmarks.len() > LIST_SAMPLE {
                sample.push_str(", ...");
            }
            line.push_str(&format!(" | benches: {}", sample));
        }
        lines.push(line);
    }
    lines
}
