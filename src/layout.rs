use crate::{list_dirs, one_or_many};
use anyhow::{Context, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

fn default_source_patterns() -> Vec<String> {
    vec!["*.c".to_string(), "*.S".to_string()]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutModeName {
    #[default]
    PerBenchmark,
    Single,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPerBenchmark {
    #[serde(default)]
    pub bench_root: Option<String>,
    #[serde(default = "default_source_patterns", deserialize_with = "one_or_many")]
    pub source_patterns: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub exclude_dirs: Vec<String>,
}

impl Default for RawPerBenchmark {
    fn default() -> Self {
        Self {
            bench_root: None,
            source_patterns: default_source_patterns(),
            exclude_dirs: vec![],
        }
    }
}

/// `layout:` section of a workload, after placeholder substitution
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLayout {
    #[serde(default)]
    pub mode: LayoutModeName,
    #[serde(default)]
    pub per_benchmark: RawPerBenchmark,
    #[serde(default, deserialize_with = "one_or_many")]
    pub common_patterns: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub common_skip: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub support_once_patterns: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub support_per_benchmark_patterns: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub single_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LayoutMode {
    /// one benchmark per subdirectory of `bench_root`
    PerBenchmark {
        bench_root: PathBuf,
        source_patterns: Vec<String>,
        exclude_dirs: Vec<String>,
    },
    /// one fixed source set, built as a single benchmark named after the workload
    Single { single_sources: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutConfig {
    pub workload_root: PathBuf,
    #[serde(flatten)]
    pub mode: LayoutMode,
    pub common_patterns: Vec<String>,
    /// file stems excluded from the common sources
    pub common_skip: Vec<String>,
    pub support_once_patterns: Vec<String>,
    pub support_per_benchmark_patterns: Vec<String>,
}

fn absolutize(base: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Expand glob patterns into existing files, deduplicated by absolute path and sorted
pub fn glob_sources(patterns: &[String], base: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();
    for pattern in patterns {
        let full = absolutize(base, pattern);
        let Some(text) = full.to_str() else {
            bail!("Non UTF-8 source pattern: {}", full.display());
        };
        for entry in glob::glob(text).with_context(|| format!("Invalid source pattern {}", text))? {
            let path = entry?;
            if path.is_file() {
                found.insert(std::fs::canonicalize(&path).unwrap_or(path));
            }
        }
    }
    Ok(found.into_iter().collect())
}

impl LayoutConfig {
    pub fn from_raw(raw: RawLayout, workload_root: &Path) -> anyhow::Result<Self> {
        let mode = match raw.mode {
            LayoutModeName::PerBenchmark => {
                let bench_root = raw
                    .per_benchmark
                    .bench_root
                    .map(|root| absolutize(workload_root, &root))
                    .unwrap_or_else(|| workload_root.join("benchmarks"));
                if raw.per_benchmark.source_patterns.is_empty() {
                    bail!("per_benchmark layout requires non-empty source_patterns");
                }
                LayoutMode::PerBenchmark {
                    bench_root,
                    source_patterns: raw.per_benchmark.source_patterns,
                    exclude_dirs: raw.per_benchmark.exclude_dirs,
                }
            }
            LayoutModeName::Single => {
                if raw.single_sources.is_empty() {
                    bail!("single layout requires non-empty single_sources");
                }
                LayoutMode::Single {
                    single_sources: raw.single_sources,
                }
            }
        };
        Ok(Self {
            workload_root: workload_root.to_path_buf(),
            mode,
            common_patterns: raw.common_patterns,
            common_skip: raw.common_skip,
            support_once_patterns: raw.support_once_patterns,
            support_per_benchmark_patterns: raw.support_per_benchmark_patterns,
        })
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            LayoutMode::PerBenchmark { .. } => "per_benchmark",
            LayoutMode::Single { .. } => "single",
        }
    }

    pub fn list_benchmarks(&self, workload: &str) -> anyhow::Result<Vec<String>> {
        match &self.mode {
            LayoutMode::PerBenchmark {
                bench_root,
                exclude_dirs,
                ..
            } => {
                if !bench_root.is_dir() {
                    bail!("Benchmark root not found: {}", bench_root.display());
                }
                Ok(list_dirs(bench_root)?
                    .into_iter()
                    .filter(|name| !exclude_dirs.contains(name))
                    .collect())
            }
            LayoutMode::Single { .. } => Ok(vec![workload.to_string()]),
        }
    }

    pub fn benchmark_sources(&self, benchmark: &str) -> anyhow::Result<Vec<PathBuf>> {
        let mut sources = match &self.mode {
            LayoutMode::PerBenchmark {
                bench_root,
                source_patterns,
                ..
            } => glob_sources(source_patterns, &bench_root.join(benchmark))?,
            LayoutMode::Single { single_sources } => {
                glob_sources(single_sources, &self.workload_root)?
            }
        };
        let support: Vec<String> = self
            .support_per_benchmark_patterns
            .iter()
            .map(|pattern| pattern.replace("{bench}", benchmark))
            .collect();
        sources.extend(glob_sources(&support, &self.workload_root)?);

        let sources: BTreeSet<PathBuf> = sources.into_iter().collect();
        debug!("{} sources for {}", sources.len(), benchmark);
        Ok(sources.into_iter().collect())
    }

    /// Sources compiled once per workload, minus `common_skip`
    pub fn common_sources(&self) -> anyhow::Result<Vec<PathBuf>> {
        Ok(glob_sources(&self.common_patterns, &self.workload_root)?
            .into_iter()
            .filter(|path| {
                let stem = path.file_stem().unwrap_or_default();
                !self
                    .common_skip
                    .iter()
                    .any(|skip| Path::new(skip).file_stem().unwrap_or_default() == stem)
            })
            .collect())
    }

    pub fn support_once_sources(&self) -> anyhow::Result<Vec<PathBuf>> {
        glob_sources(&self.support_once_patterns, &self.workload_root)
    }
}
