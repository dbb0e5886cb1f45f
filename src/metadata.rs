use crate::{
    Arch, EnvConfig, Emulator, FeatureSet, FinalConfig, Flags, Platform, RunOptions, Settings,
    Tools, now_iso, read_json, run_command, sha256_file,
};
use anyhow::{Context, bail};
use clap::Args;
use log::error;
use object::{Object, ObjectSection};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// ELF sections recorded in trace metadata
pub const ELF_SECTIONS: &[&str] = &[".comment", ".riscv.attributes", ".GCC.command.line"];

/// Key under which `stf_trace_info` feature lines are stored
pub const STF_FEATURES_KEY: &str = "STF_FEATURES";

/// Written next to every binary as `build_meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub timestamp: String,
    pub emulator: Emulator,
    pub arch: Arch,
    pub platform: Platform,
    pub workload: String,
    pub benchmark: String,
    pub features: FeatureSet,
    pub entrypoint: String,
    pub toolchain: Tools,
    pub flags: Flags,
    pub env: EnvConfig,
    /// first `-march=` value of the flags
    pub isa: Option<String>,
    pub sources: Vec<PathBuf>,
    pub binary: PathBuf,
}

impl BuildMetadata {
    pub fn new(
        config: &FinalConfig,
        benchmark: &str,
        entrypoint: &str,
        sources: Vec<PathBuf>,
        binary: PathBuf,
    ) -> Self {
        Self {
            timestamp: now_iso(),
            emulator: config.emulator,
            arch: config.arch,
            platform: config.platform,
            workload: config.workload.clone(),
            benchmark: benchmark.to_string(),
            features: config.features,
            entrypoint: entrypoint.to_string(),
            toolchain: config.tools.clone(),
            flags: config.flags.clone(),
            env: config.env.clone(),
            isa: config.flags.isa(),
            sources,
            binary,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        read_json(path)
    }
}

/// Written after every emulator run as `run_meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub timestamp: String,
    pub emulator: Emulator,
    pub arch: Arch,
    pub platform: Platform,
    pub workload: String,
    pub benchmark: String,
    pub binary: PathBuf,
    pub isa: String,
    pub interval_size: u64,
    pub bbv_enabled: bool,
    pub trace_enabled: bool,
    pub bbv_file: Option<PathBuf>,
    pub trace_file: Option<PathBuf>,
    pub command: Vec<String>,
    pub elapsed_seconds: f64,
    /// None until the emulator exits, or when it was killed
    pub exit_status: Option<i32>,
    pub build_meta: Option<BuildMetadata>,
}

impl RunMetadata {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        read_json(path)
    }

    /// BBV file usable by SimPoint, if the run produced one
    pub fn bbv(&self) -> Option<&Path> {
        self.bbv_file
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Trace author recorded in metadata
    #[arg(long = "author-name", env = "TRACE_AUTHOR_NAME", default_value = "unknown")]
    pub name: String,

    #[arg(long = "author-company", env = "TRACE_AUTHOR_COMPANY", default_value = "unknown")]
    pub company: String,

    #[arg(long = "author-email", env = "TRACE_AUTHOR_EMAIL", default_value = "unknown")]
    pub email: String,
}

impl Default for Author {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            company: "unknown".to_string(),
            email: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub filename: String,
    #[serde(rename = "SHA256")]
    pub sha256: String,
    #[serde(default)]
    pub execution_command: Option<String>,
    #[serde(default)]
    pub elf_sections: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntervalMode {
    Ip,
    InstructionCount,
    Macro,
    FullyTrace,
}

/// Which part of the execution a partial trace covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceInterval {
    Ip {
        ip: u64,
        ip_count: u64,
        interval_length: u64,
    },
    InstructionCount {
        start_instruction: u64,
        interval_length: u64,
    },
}

/// One line of `stf_trace_info` output, or the feature list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceInfoValue {
    Text(String),
    List(Vec<String>),
    Other(serde_yaml::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStfInfo")]
pub struct StfInfo {
    pub timestamp: String,
    pub trace_info: BTreeMap<String, TraceInfoValue>,
    pub interval_mode: IntervalMode,
    pub interval: Option<TraceInterval>,
}

/// Interval as written by either this crate or the older archive tools,
/// which spell it `trace_interval` with `start_instruction_index` and `interval_lenght`
#[derive(Deserialize)]
struct RawInterval {
    #[serde(default, alias = "instruction_pc")]
    ip: Option<u64>,
    #[serde(default, alias = "pc_count")]
    ip_count: Option<u64>,
    #[serde(default, alias = "interval_lenght")]
    interval_length: Option<u64>,
    #[serde(default, alias = "start_instruction_index")]
    start_instruction: Option<u64>,
    #[serde(default, alias = "end_instruction_index")]
    end_instruction: Option<u64>,
}

#[derive(Deserialize)]
struct RawStfInfo {
    timestamp: String,
    #[serde(default, alias = "stf_trace_info")]
    trace_info: Option<BTreeMap<String, TraceInfoValue>>,
    #[serde(default)]
    interval_mode: Option<IntervalMode>,
    #[serde(default, alias = "trace_interval")]
    interval: Option<RawInterval>,
}

impl RawInterval {
    fn length(&self) -> Result<u64, String> {
        match (self.interval_length, self.start_instruction, self.end_instruction) {
            (Some(length), _, _) => Ok(length),
            (None, Some(start), Some(end)) if end >= start => Ok(end - start),
            _ => Err("interval has no length".to_string()),
        }
    }

    fn instruction_count(&self) -> Result<TraceInterval, String> {
        Ok(TraceInterval::InstructionCount {
            start_instruction: self
                .start_instruction
                .ok_or("interval has no start instruction")?,
            interval_length: self.length()?,
        })
    }

    fn ip(&self) -> Result<TraceInterval, String> {
        Ok(TraceInterval::Ip {
            ip: self.ip.ok_or("interval has no ip")?,
            ip_count: self.ip_count.ok_or("interval has no ip count")?,
            interval_length: self.length()?,
        })
    }
}

impl TryFrom<RawStfInfo> for StfInfo {
    type Error = String;

    fn try_from(raw: RawStfInfo) -> Result<Self, Self::Error> {
        let (interval_mode, interval) = match (raw.interval_mode, raw.interval) {
            (Some(IntervalMode::Ip), Some(interval)) => (IntervalMode::Ip, Some(interval.ip()?)),
            (Some(IntervalMode::InstructionCount), Some(interval)) => (
                IntervalMode::InstructionCount,
                Some(interval.instruction_count()?),
            ),
            (Some(mode), Some(_)) => {
                return Err(format!("interval mode {:?} takes no interval", mode));
            }
            (Some(mode), None) => (mode, None),
            // older sidecars carry no mode, so infer it from the interval
            (None, None) => (IntervalMode::FullyTrace, None),
            (None, Some(interval)) if interval.start_instruction.is_some() => (
                IntervalMode::InstructionCount,
                Some(interval.instruction_count()?),
            ),
            (None, Some(interval)) => (IntervalMode::Ip, Some(interval.ip()?)),
        };
        Ok(Self {
            timestamp: raw.timestamp,
            trace_info: raw.trace_info.unwrap_or_default(),
            interval_mode,
            interval,
        })
    }
}

/// Metadata describing one STF trace, stored beside it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub author: Author,
    pub workload: WorkloadInfo,
    pub stf: StfInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl TraceMetadata {
    /// Interval mode and interval must agree
    pub fn validate(&self) -> anyhow::Result<()> {
        match (self.stf.interval_mode, &self.stf.interval) {
            (IntervalMode::Ip, Some(TraceInterval::Ip { .. }))
            | (IntervalMode::InstructionCount, Some(TraceInterval::InstructionCount { .. }))
            | (IntervalMode::Macro, None)
            | (IntervalMode::FullyTrace, None) => {}
            (mode, interval) => bail!(
                "Interval {:?} does not match interval mode {:?}",
                interval,
                mode
            ),
        }
        if self.workload.sha256.is_empty() {
            bail!("Metadata is missing the workload SHA256");
        }
        Ok(())
    }

    pub fn is_fully_traced(&self) -> bool {
        self.stf.interval.is_none()
    }

    /// First traced instruction, used to order the parts of an attempt
    pub fn start_instruction(&self) -> Option<u64> {
        match self.stf.interval {
            Some(TraceInterval::InstructionCount {
                start_instruction, ..
            }) => Some(start_instruction),
            _ => None,
        }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let metadata: TraceMetadata = serde_yaml::from_str(text)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Parse a `.json` or `.yaml` metadata file
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read metadata {}", path.display()))?;
        let metadata: TraceMetadata = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            serde_yaml::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        };
        metadata
            .validate()
            .with_context(|| format!("Invalid metadata {}", path.display()))?;
        Ok(metadata)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Printable ASCII runs of at least two characters, joined by spaces
pub fn printable_strings(data: &[u8]) -> String {
    let mut runs = vec![];
    let mut current = String::new();
    for &byte in data {
        if (0x20..=0x7e).contains(&byte) {
            current.push(byte as char);
        } else if current.len() >= 2 {
            runs.push(std::mem::take(&mut current));
        } else {
            current.clear();
        }
    }
    if current.len() >= 2 {
        runs.push(current);
    }
    runs.join(" ").replace('\'', "")
}

/// Toolchain identification sections of an ELF file, keyed without the leading dot
pub fn elf_sections<P: AsRef<Path>>(path: P) -> anyhow::Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    let binary_data = std::fs::read(path)
        .with_context(|| format!("Workload file not found: {}", path.display()))?;
    let file = object::File::parse(&*binary_data)?;

    let mut result = BTreeMap::new();
    for name in ELF_SECTIONS {
        if let Some(section) = file.section_by_name(name) {
            let data = section.data()?;
            result.insert(
                name.trim_start_matches('.').to_string(),
                printable_strings(data),
            );
        }
    }
    Ok(result)
}

/// `key value` lines up to the first blank line, then one feature per line
pub fn parse_trace_info(output: &str) -> BTreeMap<String, TraceInfoValue> {
    let mut info = BTreeMap::new();
    let mut features = vec![];
    let mut in_features = false;
    for line in output.trim().lines() {
        let line = line.trim();
        if line.is_empty() {
            in_features = true;
            continue;
        }
        if in_features {
            features.push(line.to_string());
        } else if let Some((key, value)) = line.split_once(char::is_whitespace) {
            info.insert(
                key.trim().to_string(),
                TraceInfoValue::Text(value.trim().to_string()),
            );
        }
    }
    info.insert(STF_FEATURES_KEY.to_string(), TraceInfoValue::List(features));
    info
}

/// Builds trace metadata from the workload binary and the generated trace
pub struct MetadataFactory<'a> {
    settings: &'a Settings,
    author: Author,
}

impl<'a> MetadataFactory<'a> {
    pub fn new(settings: &'a Settings, author: Author) -> Self {
        Self { settings, author }
    }

    pub fn create(
        &self,
        workload: &Path,
        trace: &Path,
        interval_mode: IntervalMode,
        interval: Option<TraceInterval>,
        execution_command: Option<String>,
        description: Option<String>,
    ) -> anyhow::Result<TraceMetadata> {
        let filename = workload
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let metadata = TraceMetadata {
            description,
            author: self.author.clone(),
            workload: WorkloadInfo {
                filename,
                sha256: sha256_file(workload)
                    .with_context(|| format!("Failed to hash {}", workload.display()))?,
                execution_command,
                elf_sections: elf_sections(workload)?,
            },
            stf: StfInfo {
                timestamp: chrono::Utc::now().to_rfc3339(),
                trace_info: self.trace_info(trace),
                interval_mode,
                interval,
            },
            trace_id: None,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    fn trace_info(&self, trace: &Path) -> BTreeMap<String, TraceInfoValue> {
        let tool = self.settings.stf_tool("stf_trace_info");
        let argv = [tool.display().to_string(), trace.display().to_string()];
        match run_command(&argv, &RunOptions::default()) {
            Ok(result) => parse_trace_info(&result.stdout),
            Err(err) => {
                error!("Failed to run stf_trace_info: {}", err);
                BTreeMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        IntervalMode, MetadataFactory, Settings, TraceInfoValue, TraceInterval, TraceMetadata,
        Author, parse_trace_info, printable_strings,
    };

    const METADATA: &str = r#"
description: dhrystone slice
author:
  name: Jane
  company: Example
  email: jane@example.com
workload:
  filename: dhrystone
  SHA256: 0123abcd
  execution_command: spike dhrystone
  elf_sections:
    comment: "GCC: (gc891d8dc2) 13.2.0"
stf:
  timestamp: "2024-01-01T00:00:00+00:00"
  trace_info:
    STF_VERSION: "1.5"
    STF_FEATURES: [STF_CONTAIN_RV64]
  interval_mode: instructionCount
  interval:
    start_instruction: 30000000
    interval_length: 10000000
"#;

    #[test]
    fn test_parse_metadata() {
        let metadata = TraceMetadata::from_yaml_str(METADATA).unwrap();
        assert!(!metadata.is_fully_traced());
        assert_eq!(metadata.start_instruction(), Some(30_000_000));
        assert_eq!(
            metadata.stf.interval,
            Some(TraceInterval::InstructionCount {
                start_instruction: 30_000_000,
                interval_length: 10_000_000
            })
        );
        let again = TraceMetadata::from_yaml_str(&metadata.to_yaml().unwrap()).unwrap();
        assert_eq!(again, metadata);
    }

    #[test]
    fn test_reject_mismatched_interval() {
        let text = METADATA.replace("interval_mode: instructionCount", "interval_mode: ip");
        assert!(TraceMetadata::from_yaml_str(&text).is_err());
        let text = METADATA.replace("interval_mode: instructionCount", "interval_mode: fullyTrace");
        assert!(TraceMetadata::from_yaml_str(&text).is_err());
    }

    #[test]
    fn test_fully_traced() {
        let text = METADATA
            .replace("interval_mode: instructionCount", "interval_mode: fullyTrace")
            .replace(
                "  interval:\n    start_instruction: 30000000\n    interval_length: 10000000\n",
                "",
            );
        let metadata = TraceMetadata::from_yaml_str(&text).unwrap();
        assert!(metadata.is_fully_traced());
        assert_eq!(metadata.start_instruction(), None);
    }

    #[test]
    fn test_parse_archive_tool_metadata() {
        let text = r#"
description: null
author:
  name: Jane Doe
  company: RISCV
  email: jane.doe@riscv.org
workload:
  filename: dhrystone
  SHA256: 0123abcd
  execution_command: ./dhrystone
  elf_sections:
    comment: Test
stf:
  timestamp: "2025-01-01T00:00:00"
  stf_trace_info:
    VERSION: Test
    STF_FEATURES: []
  trace_interval:
    instruction_pc: 300
    pc_count: 3
    interval_lenght: 300
    start_instruction_index: 300
    end_instruction_index: 400
"#;
        let metadata = TraceMetadata::from_yaml_str(text).unwrap();
        assert_eq!(metadata.stf.interval_mode, IntervalMode::InstructionCount);
        assert_eq!(metadata.start_instruction(), Some(300));
        assert_eq!(
            metadata.stf.trace_info.get("VERSION"),
            Some(&TraceInfoValue::Text("Test".to_string()))
        );

        let full = text.replace(
            "  trace_interval:\n    instruction_pc: 300\n    pc_count: 3\n    interval_lenght: 300\n    start_instruction_index: 300\n    end_instruction_index: 400\n",
            "  trace_interval: null\n",
        );
        let metadata = TraceMetadata::from_yaml_str(&full).unwrap();
        assert_eq!(metadata.stf.interval_mode, IntervalMode::FullyTrace);
        assert!(metadata.is_fully_traced());
    }

    #[test]
    fn test_printable_strings() {
        assert_eq!(
            printable_strings(b"\x00GCC: 'x'\x00a\x01Linker v1\x00"),
            "GCC: x Linker v1"
        );
    }

    #[test]
    fn test_parse_trace_info() {
        let output = "STF_VERSION 1.5\nGENERATOR spike\n\nSTF_CONTAIN_RV64\nSTF_CONTAIN_PHYSICAL_ADDRESS\n";
        let info = parse_trace_info(output);
        assert_eq!(info["STF_VERSION"], TraceInfoValue::Text("1.5".to_string()));
        assert_eq!(
            info["STF_FEATURES"],
            TraceInfoValue::List(vec![
                "STF_CONTAIN_RV64".to_string(),
                "STF_CONTAIN_PHYSICAL_ADDRESS".to_string()
            ])
        );
    }

    #[test]
    fn test_factory_rejects_non_elf() {
        let dir = tempfile::tempdir().unwrap();
        let workload = dir.path().join("bench");
        std::fs::write(&workload, b"not an elf").unwrap();
        let settings = Settings::default();
        let factory = MetadataFactory::new(&settings, Author::default());
        let result = factory.create(
            &workload,
            &dir.path().join("bench.zstf"),
            IntervalMode::Macro,
            None,
            None,
            None,
        );
        assert!(result.is_err());
    }
}
