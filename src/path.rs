// outputs folder structure:
// {outputs-root}/
// |- {emulator}/
//    |- bin/
//       |- env/
//          \- {env-file-stem}.o
//       |- wrapper/
//          \- wrapper_entry.{c,o}
//       \- {workload}/
//          |- common/obj/{source-stem}.o
//          |- support_once/obj/{source-stem}.o
//          \- {benchmark}/
//             |- {benchmark}
//             |- build_meta.json
//             \- obj/{source-stem}.o
//    \- {workload}/
//       \- {benchmark}/
//          |- run_meta.json
//          |- bbv/{benchmark}.bbv
//          |- traces/{benchmark}.full.zstf
//          \- logs/{benchmark}.log
// |- simpoint_analysis/
//    |- simpoint_summary.json
//    \- {workload}/
//       |- {benchmark}.simpoints
//       \- {benchmark}.weights
// \- simpointed/
//    \- {emulator}/
//       \- {workload}/
//          \- {benchmark}/
//             |- slices.json
//             |- {benchmark}.sp_{slice-index}.zstf
//             \- {benchmark}.sp_{slice-index}.metadata.json

use crate::Emulator;
use anyhow::bail;
use skim::{
    Skim,
    prelude::{SkimItemReader, SkimOptionsBuilder},
};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

/// Directories under `bin/` and `bin/<workload>/` that never hold a benchmark
pub const RESERVED_BIN_DIRS: &[&str] = &["env", "wrapper", "common", "support_once"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binaries_root(&self, emulator: Emulator) -> PathBuf {
        self.root.join(emulator.as_str()).join("bin")
    }

    pub fn env_dir(&self, emulator: Emulator) -> PathBuf {
        self.binaries_root(emulator).join("env")
    }

    /// Objects shared by every benchmark of a workload
    pub fn common_obj_dir(&self, emulator: Emulator, workload: &str) -> PathBuf {
        self.binaries_root(emulator)
            .join(workload)
            .join("common")
            .join("obj")
    }

    pub fn support_once_obj_dir(&self, emulator: Emulator, workload: &str) -> PathBuf {
        self.binaries_root(emulator)
            .join(workload)
            .join("support_once")
            .join("obj")
    }

    pub fn wrapper_dir(&self, emulator: Emulator) -> PathBuf {
        self.binaries_root(emulator).join("wrapper")
    }

    pub fn emulator_root(&self, emulator: Emulator) -> PathBuf {
        self.root.join(emulator.as_str())
    }

    pub fn simpoint_analysis_root(&self) -> PathBuf {
        self.root.join("simpoint_analysis")
    }

    pub fn simpointed_root(&self, emulator: Emulator) -> PathBuf {
        self.root.join("simpointed").join(emulator.as_str())
    }

    pub fn benchmark(&self, emulator: Emulator, workload: &str, benchmark: &str) -> BenchmarkPaths {
        BenchmarkPaths {
            layout: self.clone(),
            emulator,
            workload: workload.to_string(),
            benchmark: benchmark.to_string(),
        }
    }
}

/// Every path belonging to one benchmark, derived only from its identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkPaths {
    layout: OutputLayout,
    pub emulator: Emulator,
    pub workload: String,
    pub benchmark: String,
}

impl BenchmarkPaths {
    pub fn binary_dir(&self) -> PathBuf {
        self.layout
            .binaries_root(self.emulator)
            .join(&self.workload)
            .join(&self.benchmark)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.binary_dir().join(&self.benchmark)
    }

    pub fn object_dir(&self) -> PathBuf {
        self.binary_dir().join("obj")
    }

    pub fn build_meta_path(&self) -> PathBuf {
        self.binary_dir().join("build_meta.json")
    }

    pub fn env_dir(&self) -> PathBuf {
        self.layout.env_dir(self.emulator)
    }

    pub fn run_root(&self) -> PathBuf {
        self.layout
            .emulator_root(self.emulator)
            .join(&self.workload)
            .join(&self.benchmark)
    }

    pub fn bbv_dir(&self) -> PathBuf {
        self.run_root().join("bbv")
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.run_root().join("traces")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_root().join("logs")
    }

    pub fn run_meta_path(&self) -> PathBuf {
        self.run_root().join("run_meta.json")
    }

    pub fn bbv_path(&self) -> PathBuf {
        self.bbv_dir().join(format!("{}.bbv", self.benchmark))
    }

    pub fn trace_path(&self) -> PathBuf {
        self.trace_dir().join(format!("{}.full.zstf", self.benchmark))
    }

    pub fn log_path(&self) -> PathBuf {
        self.logs_dir().join(format!("{}.log", self.benchmark))
    }

    pub fn simpoints_path(&self) -> PathBuf {
        self.layout
            .simpoint_analysis_root()
            .join(&self.workload)
            .join(format!("{}.simpoints", self.benchmark))
    }

    pub fn weights_path(&self) -> PathBuf {
        self.layout
            .simpoint_analysis_root()
            .join(&self.workload)
            .join(format!("{}.weights", self.benchmark))
    }

    /// Destination of sliced traces
    pub fn simpoint_dir(&self) -> PathBuf {
        self.layout
            .simpointed_root(self.emulator)
            .join(&self.workload)
            .join(&self.benchmark)
    }

    pub fn slice_trace_path(&self, interval: u64) -> PathBuf {
        self.simpoint_dir()
            .join(format!("{}.sp_{}.zstf", self.benchmark, interval))
    }

    pub fn slices_manifest_path(&self) -> PathBuf {
        self.simpoint_dir().join("slices.json")
    }
}

/// Sidecar written next to a generated trace, `foo.zstf` gives `foo.metadata.json`
pub fn trace_metadata_path<P: AsRef<Path>>(trace: P) -> PathBuf {
    trace.as_ref().with_extension("metadata.json")
}

pub fn get_selection(selections: Vec<String>, prompt: &str) -> anyhow::Result<String> {
    if selections.is_empty() {
        bail!("Nothing to choose from")
    }

    let options = SkimOptionsBuilder::default()
        .height(String::from("50%"))
        .prompt(prompt.to_string())
        .build()?;

    let input = selections.join("\n");

    let item_reader = SkimItemReader::default();
    let items = item_reader.of_bufread(Cursor::new(input));

    let Some(output) = Skim::run_with(&options, Some(items)) else {
        bail!("Selection interface failed to start")
    };
    if output.is_abort {
        bail!("User cancelled the selection")
    }

    match output.selected_items.first() {
        Some(item) => Ok(item.output().to_string()),
        None => bail!("Nothing selected"),
    }
}

/// Subdirectory names of a directory, sorted
pub fn list_dirs<P: AsRef<Path>>(dir: P) -> anyhow::Result<Vec<String>> {
    let mut names = vec![];
    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use crate::{Emulator, OutputLayout, list_dirs, trace_metadata_path};
    use std::path::PathBuf;

    #[test]
    fn test_benchmark_paths() {
        let layout = OutputLayout::new("/outputs");
        let paths = layout.benchmark(Emulator::Spike, "riscv-tests", "dhrystone");
        assert_eq!(
            paths.binary_path(),
            PathBuf::from("/outputs/spike/bin/riscv-tests/dhrystone/dhrystone")
        );
        assert_eq!(
            paths.object_dir(),
            PathBuf::from("/outputs/spike/bin/riscv-tests/dhrystone/obj")
        );
        assert_eq!(paths.env_dir(), PathBuf::from("/outputs/spike/bin/env"));
        assert_eq!(
            paths.run_meta_path(),
            PathBuf::from("/outputs/spike/riscv-tests/dhrystone/run_meta.json")
        );
        assert_eq!(
            paths.bbv_path(),
            PathBuf::from("/outputs/spike/riscv-tests/dhrystone/bbv/dhrystone.bbv")
        );
        assert_eq!(
            paths.slice_trace_path(2),
            PathBuf::from("/outputs/simpointed/spike/riscv-tests/dhrystone/dhrystone.sp_2.zstf")
        );
        assert_eq!(
            paths.simpoints_path(),
            PathBuf::from("/outputs/simpoint_analysis/riscv-tests/dhrystone.simpoints")
        );
    }

    #[test]
    fn test_benchmark_paths_deterministic() {
        let first = OutputLayout::new("/outputs").benchmark(Emulator::Qemu, "embench", "crc32");
        let second = OutputLayout::new("/outputs").benchmark(Emulator::Qemu, "embench", "crc32");
        assert_eq!(first, second);
        assert_eq!(first.binary_dir(), second.binary_dir());
        assert_eq!(first.trace_path(), second.trace_path());
        assert_eq!(first.simpoint_dir(), second.simpoint_dir());
    }

    #[test]
    fn test_trace_metadata_path() {
        assert_eq!(
            trace_metadata_path("/t/foo.zstf"),
            PathBuf::from("/t/foo.metadata.json")
        );
    }

    #[test]
    fn test_list_dirs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b", "a", "c"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("file"), b"").unwrap();
        assert_eq!(list_dirs(dir.path()).unwrap(), vec!["a", "b", "c"]);
    }
}
