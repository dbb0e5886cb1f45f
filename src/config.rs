use crate::{Arch, Emulator, Platform, Settings, convert_legacy_board};
use anyhow::{Context, bail};
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

pub const SCHEMA_VERSION: u64 = 2;

pub const DEFAULT_WORKLOADS_ROOTS: &[&str] = &["/workloads", "/default"];

/// A list that may be written as a single string in board files
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

pub(crate) fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => vec![],
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

/// Prefix substitution tried when a configured path does not exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltRoot {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variables {
    #[serde(default, deserialize_with = "one_or_many")]
    pub workloads_roots: Vec<String>,
    /// directory holding the board environment, `{board}` is substituted
    #[serde(default)]
    pub env_root: Option<String>,
    /// extra include directories added to every workload
    #[serde(default, deserialize_with = "one_or_many")]
    pub include_auto: Vec<String>,
    #[serde(default)]
    pub alt_roots: Vec<AltRoot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    pub cc: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub base_cflags: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub base_ldflags: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub libs: Vec<String>,
    #[serde(default)]
    pub linker_script: Option<String>,
}

/// Flags appended when a build feature (bbv, trace) is enabled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default, deserialize_with = "one_or_many")]
    pub cflags: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub ldflags: Vec<String>,
}

/// Replaces the `-march=` value for matching benchmarks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarchOverride {
    /// workloads this applies to, empty for all
    #[serde(default, deserialize_with = "one_or_many")]
    pub workloads: Vec<String>,
    /// glob patterns on the benchmark name
    #[serde(deserialize_with = "one_or_many")]
    pub benchmarks: Vec<String>,
    #[serde(default)]
    pub arch: Option<Arch>,
    pub march: String,
}

impl MarchOverride {
    pub fn applies_to(&self, workload: &str, arch: Arch) -> bool {
        (self.workloads.is_empty() || self.workloads.iter().any(|name| name == workload))
            && self.arch.is_none_or(|target| target == arch)
    }
}

/// The board description as written on disk (schema 2)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardDocument {
    #[serde(default)]
    pub schema: u64,
    #[serde(default)]
    pub variables: Variables,
    /// `toolchains[arch][platform]`
    #[serde(default)]
    pub toolchains: BTreeMap<Arch, BTreeMap<Platform, Toolchain>>,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureFlags>,
    #[serde(default)]
    pub march_overrides: Vec<MarchOverride>,
    /// kept untyped until layered, see `finalize`
    #[serde(default)]
    pub workloads: BTreeMap<String, serde_yaml::Value>,
}

/// A loaded board configuration, shared by every build of one process
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub board: Emulator,
    pub source: PathBuf,
    pub document: BoardDocument,
    /// `<environment_root>/<board>`, used when `variables.env_root` is unset
    pub default_env_dir: PathBuf,
    pub outputs_root: PathBuf,
}

impl BuildConfig {
    pub fn from_document(
        document: BoardDocument,
        board: Emulator,
        source: PathBuf,
        settings: &Settings,
    ) -> anyhow::Result<Self> {
        if document.schema != SCHEMA_VERSION {
            bail!(
                "{}: unsupported schema {} (board files must set `schema: {}`)",
                source.display(),
                document.schema,
                SCHEMA_VERSION
            );
        }
        Ok(Self {
            board,
            source,
            document,
            default_env_dir: settings.environment_root.join(board.as_str()),
            outputs_root: settings.outputs_root.clone(),
        })
    }

    pub fn from_yaml_str(text: &str, board: Emulator, settings: &Settings) -> anyhow::Result<Self> {
        let document: BoardDocument = serde_yaml::from_str(text)?;
        Self::from_document(document, board, PathBuf::from("<memory>"), settings)
    }

    /// Where a board configuration is looked up, in order
    pub fn candidate_paths(settings: &Settings, board: Emulator) -> Vec<PathBuf> {
        if let Some(path) = &settings.board_config {
            return vec![path.clone()];
        }
        let local = PathBuf::from("environment").join(board.as_str());
        let installed = settings.environment_root.join(board.as_str());
        vec![
            installed.join("board.yaml"),
            installed.join("board.cfg"),
            local.join("board.yaml"),
            local.join("board.cfg"),
        ]
    }

    pub fn load(settings: &Settings, board: Emulator) -> anyhow::Result<Self> {
        let candidates = Self::candidate_paths(settings, board);
        let Some(path) = candidates.iter().find(|path| path.is_file()) else {
            bail!(
                "Board config not found for {}. Searched: {}",
                board,
                candidates
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<String>>()
                    .join(", ")
            );
        };
        Self::load_path(path, settings, board)
    }

    pub fn load_path<P: AsRef<Path>>(path: P, settings: &Settings, board: Emulator) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("Loading board config from {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let document = if path.extension().is_some_and(|ext| ext == "cfg") {
            debug!("Converting legacy ini board config");
            convert_legacy_board(&text)
                .with_context(|| format!("Failed to convert {}", path.display()))?
        } else {
            serde_yaml::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        };
        Self::from_document(document, board, path.to_path_buf(), settings)
    }

    pub fn list_workloads(&self) -> Vec<String> {
        // BTreeMap keys are already sorted
        self.document.workloads.keys().cloned().collect()
    }

    pub fn workload_section(&self, workload: &str) -> anyhow::Result<&serde_yaml::Value> {
        match self.document.workloads.get(workload) {
            Some(section) => Ok(section),
            None => bail!(
                "Unknown workload '{}', configured: {}",
                workload,
                self.list_workloads().join(", ")
            ),
        }
    }

    pub fn toolchain(&self, arch: Arch, platform: Platform) -> anyhow::Result<&Toolchain> {
        match self
            .document
            .toolchains
            .get(&arch)
            .and_then(|platforms| platforms.get(&platform))
        {
            Some(toolchain) => Ok(toolchain),
            None => bail!("Missing toolchain for {}.{}", arch, platform),
        }
    }

    pub fn workloads_roots(&self) -> Vec<PathBuf> {
        let roots = if self.document.variables.workloads_roots.is_empty() {
            DEFAULT_WORKLOADS_ROOTS.iter().map(|root| root.to_string()).collect()
        } else {
            self.document.variables.workloads_roots.clone()
        };
        roots
            .iter()
            .map(|root| PathBuf::from(root.replace("{board}", self.board.as_str())))
            .collect()
    }

    /// A custom path must exist; otherwise the first `<root>/<workload>` found
    pub fn resolve_workload_root(&self, workload: &str, custom: Option<&Path>) -> anyhow::Result<PathBuf> {
        if let Some(custom) = custom {
            if custom.exists() {
                return Ok(custom.to_path_buf());
            }
            bail!("Custom workload path not found: {}", custom.display());
        }
        let roots = self.workloads_roots();
        for root in &roots {
            let candidate = root.join(workload);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        bail!(
            "Workload '{}' not found in: {}",
            workload,
            roots
                .iter()
                .map(|root| root.display().to_string())
                .collect::<Vec<String>>()
                .join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::{Arch, BuildConfig, Emulator, Platform, Settings};

    const BOARD: &str = r#"
schema: 2
variables:
  include_auto: ["{workload_root}/include"]
toolchains:
  rv64:
    baremetal:
      cc: riscv64-unknown-elf-gcc
      base_cflags: ["-march=rv64gc", "-O2"]
      base_ldflags: ["-march=rv64gc", "-nostartfiles"]
      libs: "-lc"
      linker_script: link.ld
workloads:
  embench-iot:
    layout:
      mode: per_benchmark
  dhrystone:
    layout:
      mode: single
      single_sources: ["{workload_root}/dhry.c"]
"#;

    #[test]
    fn test_load_document() {
        let config = BuildConfig::from_yaml_str(BOARD, Emulator::Spike, &Settings::default()).unwrap();
        assert_eq!(config.list_workloads(), vec!["dhrystone", "embench-iot"]);
        let toolchain = config.toolchain(Arch::Rv64, Platform::Baremetal).unwrap();
        assert_eq!(toolchain.libs, vec!["-lc"]);
        assert!(config.toolchain(Arch::Rv32, Platform::Baremetal).is_err());
        assert!(config.workload_section("coremark").is_err());
    }

    #[test]
    fn test_reject_schema() {
        let result = BuildConfig::from_yaml_str("schema: 1\n", Emulator::Spike, &Settings::default());
        assert!(result.is_err());
        let result = BuildConfig::from_yaml_str("workloads: {}\n", Emulator::Qemu, &Settings::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_workload_root() {
        let dir = tempfile::tempdir().unwrap();
        let second = dir.path().join("second");
        std::fs::create_dir_all(second.join("embench-iot")).unwrap();
        let text = format!(
            "schema: 2\nvariables:\n  workloads_roots: [\"{}\", \"{}\"]\n",
            dir.path().join("first").display(),
            second.display()
        );
        let config = BuildConfig::from_yaml_str(&text, Emulator::Spike, &Settings::default()).unwrap();
        assert_eq!(
            config.resolve_workload_root("embench-iot", None).unwrap(),
            second.join("embench-iot")
        );
        assert!(config.resolve_workload_root("missing", None).is_err());
        assert!(
            config
                .resolve_workload_root("embench-iot", Some(&dir.path().join("nope")))
                .is_err()
        );
    }

    #[test]
    fn test_discovery_reports_searched_paths() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            environment_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = BuildConfig::load(&settings, Emulator::Qemu).unwrap_err();
        assert!(err.to_string().contains("board.yaml"));

        std::fs::create_dir_all(dir.path().join("qemu")).unwrap();
        std::fs::write(dir.path().join("qemu").join("board.yaml"), BOARD).unwrap();
        let config = BuildConfig::load(&settings, Emulator::Qemu).unwrap();
        assert_eq!(config.default_env_dir, dir.path().join("qemu"));
    }
}
