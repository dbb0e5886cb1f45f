use crate::{
    Emulator, OutputLayout, RunMetadata, RunOptions, Settings, ensure_dir, list_dirs, run_command,
    tool_available, write_json,
};
use anyhow::{Context, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_MAX_K: u32 = 30;

pub const SIMPOINT_TIMEOUT: Duration = Duration::from_secs(300);

/// One representative interval: a phase is a cluster
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimPointEntry {
    pub cluster: u64,
    /// index of the representative interval
    pub interval: u64,
    /// fraction of execution the cluster stands for
    pub weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimPointResult {
    /// sorted by interval
    pub entries: Vec<SimPointEntry>,
    /// clusters without a weight
    pub dropped: usize,
}

impl SimPointResult {
    /// Sum of the weights, ideally 1.0
    pub fn coverage(&self) -> f64 {
        self.entries.iter().map(|entry| entry.weight).sum()
    }
}

/// Lines made of exactly two whitespace separated fields
fn pairs(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(first), Some(second), None) => Some((first, second)),
            _ => None,
        }
    })
}

/// Join `<interval> <cluster>` lines with `<weight> <cluster>` lines on the cluster id
pub fn join_simpoints(simpoints: &str, weights: &str) -> anyhow::Result<SimPointResult> {
    let mut intervals: BTreeMap<u64, u64> = BTreeMap::new();
    for (interval, cluster) in pairs(simpoints) {
        let interval = interval
            .parse()
            .with_context(|| format!("Invalid interval '{}'", interval))?;
        let cluster = cluster
            .parse()
            .with_context(|| format!("Invalid cluster '{}'", cluster))?;
        intervals.insert(cluster, interval);
    }

    let mut cluster_weights: BTreeMap<u64, f64> = BTreeMap::new();
    for (weight, cluster) in pairs(weights) {
        let weight = weight
            .parse()
            .with_context(|| format!("Invalid weight '{}'", weight))?;
        let cluster = cluster
            .parse()
            .with_context(|| format!("Invalid cluster '{}'", cluster))?;
        cluster_weights.insert(cluster, weight);
    }

    let mut result = SimPointResult::default();
    for (cluster, interval) in intervals {
        match cluster_weights.get(&cluster) {
            Some(&weight) => result.entries.push(SimPointEntry {
                cluster,
                interval,
                weight,
            }),
            None => {
                debug!("Dropping cluster {} without weight", cluster);
                result.dropped += 1;
            }
        }
    }
    result.entries.sort_by_key(|entry| entry.interval);
    Ok(result)
}

pub fn load_simpoints(simpoints: &Path, weights: &Path) -> anyhow::Result<SimPointResult> {
    let simpoints_text = std::fs::read_to_string(simpoints)
        .with_context(|| format!("Failed to read {}", simpoints.display()))?;
    let weights_text = std::fs::read_to_string(weights)
        .with_context(|| format!("Failed to read {}", weights.display()))?;
    let result = join_simpoints(&simpoints_text, &weights_text)?;
    if result.dropped > 0 {
        warn!(
            "{}: dropped {} clusters without weight",
            simpoints.display(),
            result.dropped
        );
    }
    Ok(result)
}

/// Entry of `simpoint_summary.json`, keyed `<workload>:<benchmark>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimPointSummary {
    pub workload: String,
    pub benchmark: String,
    pub bbv_file: PathBuf,
    pub simpoints_file: PathBuf,
    pub weights_file: PathBuf,
    pub intervals: Vec<SimPointEntry>,
    pub coverage: f64,
    pub dropped_clusters: usize,
}

/// Runs that produced a non-empty BBV file
pub fn discover_bbv_runs(
    layout: &OutputLayout,
    emulator: Emulator,
    workload: Option<&str>,
    benchmark: Option<&str>,
) -> anyhow::Result<Vec<RunMetadata>> {
    let run_root = layout.emulator_root(emulator);
    if !run_root.is_dir() {
        bail!("No run outputs present: {}", run_root.display());
    }
    let mut runs = vec![];
    for workload_name in list_dirs(&run_root)? {
        if workload_name == "bin" || workload.is_some_and(|only| only != workload_name) {
            continue;
        }
        for bench in list_dirs(run_root.join(&workload_name))? {
            if benchmark.is_some_and(|only| only != bench) {
                continue;
            }
            let meta_path = layout
                .benchmark(emulator, &workload_name, &bench)
                .run_meta_path();
            if !meta_path.exists() {
                continue;
            }
            let run = RunMetadata::load(&meta_path)?;
            let usable = run
                .bbv()
                .and_then(|bbv| std::fs::metadata(bbv).ok())
                .is_some_and(|meta| meta.len() > 0);
            if usable {
                runs.push(run);
            } else {
                warn!("No BBV file for {}/{}, skipping", workload_name, bench);
            }
        }
    }
    Ok(runs)
}

pub struct SimPointRunner<'a> {
    settings: &'a Settings,
    max_k: u32,
    /// replaces `<outputs>/simpoint_analysis`
    output_dir: Option<PathBuf>,
}

impl<'a> SimPointRunner<'a> {
    pub fn new(settings: &'a Settings, max_k: u32, output_dir: Option<PathBuf>) -> Self {
        Self {
            settings,
            max_k,
            output_dir,
        }
    }

    pub fn analysis_root(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.settings.layout().simpoint_analysis_root())
    }

    pub fn summary_path(&self) -> PathBuf {
        self.analysis_root().join("simpoint_summary.json")
    }

    /// `.simpoints` and `.weights` files of one benchmark
    pub fn output_paths(&self, workload: &str, benchmark: &str) -> (PathBuf, PathBuf) {
        let dir = self.analysis_root().join(workload);
        (
            dir.join(format!("{}.simpoints", benchmark)),
            dir.join(format!("{}.weights", benchmark)),
        )
    }

    pub fn check_tool(&self) -> anyhow::Result<()> {
        if !tool_available(&self.settings.simpoint) {
            bail!("{} not found in PATH", self.settings.simpoint);
        }
        Ok(())
    }

    pub fn command(&self, bbv: &Path, simpoints: &Path, weights: &Path) -> Vec<String> {
        vec![
            self.settings.simpoint.clone(),
            "-loadFVFile".to_string(),
            bbv.display().to_string(),
            "-maxK".to_string(),
            self.max_k.to_string(),
            "-saveSimpoints".to_string(),
            simpoints.display().to_string(),
            "-saveSimpointWeights".to_string(),
            weights.display().to_string(),
        ]
    }

    pub fn analyze(&self, run: &RunMetadata) -> anyhow::Result<SimPointSummary> {
        let Some(bbv) = run.bbv() else {
            bail!("{}/{} has no BBV file", run.workload, run.benchmark);
        };
        self.check_tool()?;
        let (simpoints, weights) = self.output_paths(&run.workload, &run.benchmark);
        if let Some(parent) = simpoints.parent() {
            ensure_dir(parent)?;
        }

        info!("Running SimPoint for {}/{}", run.workload, run.benchmark);
        run_command(
            &self.command(bbv, &simpoints, &weights),
            &RunOptions::with_timeout(SIMPOINT_TIMEOUT),
        )?;
        if !simpoints.exists() || !weights.exists() {
            bail!(
                "SimPoint completed without producing {} and {}",
                simpoints.display(),
                weights.display()
            );
        }

        let result = load_simpoints(&simpoints, &weights)?;
        Ok(SimPointSummary {
            workload: run.workload.clone(),
            benchmark: run.benchmark.clone(),
            bbv_file: bbv.to_path_buf(),
            simpoints_file: simpoints,
            weights_file: weights,
            coverage: result.coverage(),
            dropped_clusters: result.dropped,
            intervals: result.entries,
        })
    }

    pub fn write_summary(&self, summary: &BTreeMap<String, SimPointSummary>) -> anyhow::Result<PathBuf> {
        let path = self.summary_path();
        write_json(&path, summary)?;
        info!("Wrote SimPoint summary to {}", path.display());
        Ok(path)
    }
}
