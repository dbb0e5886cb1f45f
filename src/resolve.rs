use crate::{
    AltRoot, Arch, BuildConfig, Emulator, FeatureSet, LayoutConfig, MarchOverride, Platform,
    RawLayout, dedupe, one_or_many,
};
use anyhow::Context;
use globset::{Glob, GlobSetBuilder};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Mapping key whose lists are concatenated instead of replaced
pub const APPEND_KEY: &str = "append";

fn as_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => vec![],
        Some(Value::Sequence(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

fn append_values(existing: Option<&Value>, extra: &Value) -> Value {
    match (existing, extra) {
        (Some(Value::Mapping(existing)), Value::Mapping(extra)) => {
            let mut out = existing.clone();
            for (key, value) in extra {
                let merged = append_values(existing.get(key), value);
                out.insert(key.clone(), merged);
            }
            Value::Mapping(out)
        }
        (None, Value::Mapping(_)) => append_values(Some(&Value::Mapping(Mapping::new())), extra),
        _ => {
            let mut items = as_list(existing);
            items.extend(as_list(Some(extra)));
            Value::Sequence(items)
        }
    }
}

/// Merge `overlay` over `base`: mappings recurse, everything else is replaced,
/// lists under an `append:` mapping are concatenated
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    let (Value::Mapping(base), Value::Mapping(overlay)) = (base, overlay) else {
        return overlay.clone();
    };

    let mut out = base.clone();
    let mut appends = vec![];
    for (key, value) in overlay {
        if key.as_str() == Some(APPEND_KEY) && value.is_mapping() {
            appends.push(value);
            continue;
        }
        let merged = match out.get(key) {
            Some(existing) if existing.is_mapping() && value.is_mapping() => deep_merge(existing, value),
            _ => value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    for append in appends {
        if let Value::Mapping(append) = append {
            for (key, extra) in append {
                let merged = append_values(out.get(key), extra);
                out.insert(key.clone(), merged);
            }
        }
    }
    Value::Mapping(out)
}

/// Textual `{name}` substitution; unknown names are left untouched
#[derive(Debug, Clone)]
pub struct Placeholders {
    pairs: Vec<(String, String)>,
}

impl Placeholders {
    pub fn new(workload_root: &Path, arch: Arch, platform: Platform, emulator: Emulator, board: Emulator) -> Self {
        Self {
            pairs: vec![
                ("{workload_root}".to_string(), workload_root.display().to_string()),
                ("{arch}".to_string(), arch.to_string()),
                ("{platform}".to_string(), platform.to_string()),
                ("{emulator}".to_string(), emulator.to_string()),
                ("{board}".to_string(), board.to_string()),
            ],
        }
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (name, value) in &self.pairs {
            if out.contains(name.as_str()) {
                out = out.replace(name.as_str(), value);
            }
        }
        out
    }

    pub fn apply_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.apply(text)),
            Value::Sequence(items) => Value::Sequence(items.iter().map(|item| self.apply_value(item)).collect()),
            Value::Mapping(mapping) => Value::Mapping(
                mapping
                    .iter()
                    .map(|(key, value)| (key.clone(), self.apply_value(value)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Try each `alt_roots` prefix when `path` is missing, keeping it unchanged otherwise
pub fn rewrite_if_missing(path: PathBuf, alt_roots: &[AltRoot]) -> PathBuf {
    if path.exists() {
        return path;
    }
    let text = path.display().to_string();
    for rule in alt_roots {
        if rule.from.is_empty() || rule.to.is_empty() {
            continue;
        }
        if let Some(rest) = text.strip_prefix(rule.from.as_str()) {
            let candidate = PathBuf::from(format!("{}{}", rule.to, rest));
            if candidate.exists() {
                debug!("Rewrote {} to {}", path.display(), candidate.display());
                return candidate;
            }
        }
    }
    path
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawEnv {
    #[serde(default, deserialize_with = "one_or_many")]
    files: Vec<String>,
    #[serde(default)]
    skip: bool,
}

/// Flags a workload contributes when one of its features is enabled
#[derive(Debug, Clone, Default, Deserialize)]
struct WorkloadFeature {
    #[serde(default, deserialize_with = "one_or_many")]
    includes: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    defines: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    cflags: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    ldflags: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    libs: Vec<String>,
    /// replaces the layout's single sources as written
    #[serde(default, deserialize_with = "one_or_many")]
    workload_sources: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WorkloadSection {
    #[serde(default)]
    layout: RawLayout,
    #[serde(default, deserialize_with = "one_or_many")]
    includes: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    defines: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    cflags: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    ldflags: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    libs: Vec<String>,
    #[serde(default)]
    linker_script: Option<String>,
    #[serde(default)]
    env: RawEnv,
    #[serde(default)]
    features: BTreeMap<String, WorkloadFeature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tools {
    pub cc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub cflags: Vec<String>,
    pub includes: Vec<PathBuf>,
    pub ldflags: Vec<String>,
    pub libs: Vec<String>,
    pub linker_script: Option<PathBuf>,
}

impl Flags {
    pub fn cflags_with_includes(&self) -> Vec<String> {
        let mut flags = self.cflags.clone();
        flags.extend(
            self.includes
                .iter()
                .map(|include| format!("-I{}", include.display())),
        );
        dedupe(&flags)
    }

    /// Value of the first `-march=` flag
    pub fn isa(&self) -> Option<String> {
        self.cflags
            .iter()
            .chain(self.ldflags.iter())
            .find_map(|flag| flag.strip_prefix("-march="))
            .map(String::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    pub dir: PathBuf,
    pub files: Vec<String>,
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Paths {
    pub workload_roots: Vec<PathBuf>,
    pub outputs_root: PathBuf,
}

/// Fully resolved build configuration of one workload for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalConfig {
    pub workload: String,
    pub arch: Arch,
    pub platform: Platform,
    pub emulator: Emulator,
    pub features: FeatureSet,
    pub workload_root: PathBuf,
    pub tools: Tools,
    pub flags: Flags,
    pub env: EnvConfig,
    pub layout: LayoutConfig,
    pub paths: Paths,
    #[serde(skip)]
    march_overrides: Vec<MarchOverride>,
}

fn replace_march(flags: &[String], march: &str) -> Vec<String> {
    flags
        .iter()
        .map(|flag| {
            if flag.starts_with("-march=") {
                format!("-march={}", march)
            } else {
                flag.clone()
            }
        })
        .collect()
}

fn defines(defines: &[String]) -> impl Iterator<Item = String> + '_ {
    defines.iter().map(|define| format!("-D{}", define))
}

impl FinalConfig {
    /// Configuration for one benchmark, with the first matching `-march` override applied
    pub fn for_benchmark(&self, benchmark: &str) -> anyhow::Result<FinalConfig> {
        for rule in &self.march_overrides {
            let mut builder = GlobSetBuilder::new();
            for pattern in &rule.benchmarks {
                builder.add(Glob::new(pattern).with_context(|| format!("Invalid benchmark pattern {}", pattern))?);
            }
            if builder.build()?.is_match(benchmark) {
                debug!("Using -march={} for {}", rule.march, benchmark);
                let mut config = self.clone();
                config.flags.cflags = dedupe(&replace_march(&self.flags.cflags, &rule.march));
                config.flags.ldflags = dedupe(&replace_march(&self.flags.ldflags, &rule.march));
                return Ok(config);
            }
        }
        Ok(self.clone())
    }
}

impl BuildConfig {
    fn resolve_path(&self, raw: &str, workload_root: &Path) -> PathBuf {
        let path = PathBuf::from(raw);
        let path = if path.is_relative() {
            workload_root.join(path)
        } else {
            path
        };
        rewrite_if_missing(path, &self.document.variables.alt_roots)
    }

    pub fn finalize(
        &self,
        workload: &str,
        arch: Arch,
        platform: Platform,
        emulator: Emulator,
        workload_root: &Path,
        features: FeatureSet,
    ) -> anyhow::Result<FinalConfig> {
        let toolchain = self.toolchain(arch, platform)?;
        let section = self.workload_section(workload)?;
        let placeholders = Placeholders::new(workload_root, arch, platform, emulator, self.board);

        let mut merged = deep_merge(&Value::Mapping(Mapping::new()), section);
        if let Some(platform_override) = section
            .get("platforms")
            .and_then(|platforms| platforms.get(platform.as_str()))
        {
            merged = deep_merge(&merged, platform_override);
        }
        if let Value::Mapping(mapping) = &mut merged {
            mapping.remove("platforms");
        }
        let merged: WorkloadSection = serde_yaml::from_value(placeholders.apply_value(&merged))
            .with_context(|| format!("Invalid configuration for workload {}", workload))?;

        let mut cflags: Vec<String> = toolchain.base_cflags.clone();
        cflags.extend(defines(&merged.defines));
        cflags.extend(merged.cflags.iter().cloned());
        let mut ldflags: Vec<String> = toolchain.base_ldflags.clone();
        ldflags.extend(merged.ldflags.iter().cloned());
        let mut libs: Vec<String> = toolchain.libs.clone();
        libs.extend(merged.libs.iter().cloned());
        let mut include_dirs: Vec<String> = self
            .document
            .variables
            .include_auto
            .iter()
            .map(|include| placeholders.apply(include))
            .collect();
        include_dirs.extend(merged.includes.iter().cloned());
        let mut layout = merged.layout;

        for feature in features.enabled() {
            if let Some(flags) = self.document.features.get(feature) {
                cflags.extend(flags.cflags.iter().map(|flag| placeholders.apply(flag)));
                ldflags.extend(flags.ldflags.iter().map(|flag| placeholders.apply(flag)));
            }
        }
        for feature in features.enabled() {
            if let Some(extra) = merged.features.get(feature) {
                cflags.extend(defines(&extra.defines));
                cflags.extend(extra.cflags.iter().cloned());
                ldflags.extend(extra.ldflags.iter().cloned());
                libs.extend(extra.libs.iter().cloned());
                include_dirs.extend(extra.includes.iter().cloned());
                if !extra.workload_sources.is_empty() {
                    layout.single_sources = extra.workload_sources.clone();
                }
            }
        }

        let includes: Vec<PathBuf> = include_dirs
            .iter()
            .map(|include| self.resolve_path(include, workload_root))
            .collect();

        let env_dir = match &self.document.variables.env_root {
            Some(env_root) => PathBuf::from(placeholders.apply(env_root)),
            None => self.default_env_dir.clone(),
        };
        let linker_script = match platform {
            Platform::Baremetal => merged
                .linker_script
                .or_else(|| toolchain.linker_script.clone())
                .map(|lds| {
                    rewrite_if_missing(env_dir.join(lds), &self.document.variables.alt_roots)
                }),
            Platform::Linux => None,
        };

        let layout = LayoutConfig::from_raw(layout, workload_root)
            .with_context(|| format!("Invalid layout for workload {}", workload))?;

        Ok(FinalConfig {
            workload: workload.to_string(),
            arch,
            platform,
            emulator,
            features,
            workload_root: workload_root.to_path_buf(),
            tools: Tools {
                cc: placeholders.apply(&toolchain.cc),
            },
            flags: Flags {
                cflags: dedupe(&cflags),
                includes: dedupe(&includes),
                ldflags: dedupe(&ldflags),
                libs: dedupe(&libs),
                linker_script,
            },
            env: EnvConfig {
                dir: env_dir,
                files: merged.env.files,
                skip: merged.env.skip,
            },
            layout,
            paths: Paths {
                workload_roots: self.workloads_roots(),
                outputs_root: self.outputs_root.clone(),
            },
            march_overrides: self
                .document
                .march_overrides
                .iter()
                .filter(|rule| rule.applies_to(workload, arch))
                .cloned()
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Arch, BuildConfig, Emulator, FeatureSet, LayoutMode, Platform, Settings, deep_merge,
        Placeholders,
    };
    use std::path::{Path, PathBuf};

    const BOARD: &str = r#"
schema: 2
variables:
  env_root: "/env/{board}"
  include_auto: ["{workload_root}/include"]
  alt_roots:
    - {from: "/workloads/", to: "ALT/"}
toolchains:
  rv64:
    baremetal:
      cc: riscv64-unknown-elf-gcc
      base_cflags: ["-march=rv64gc", "-O2", "-g"]
      base_ldflags: ["-march=rv64gc", "-static"]
      libs: ["-lc", "-lm"]
      linker_script: link.ld
    linux:
      cc: riscv64-unknown-linux-gnu-gcc
      base_cflags: ["-march=rv64gc", "-O2"]
      base_ldflags: ["-static"]
features:
  bbv:
    cflags: ["-DBBV", "-O2"]
  trace:
    cflags: ["-DTRACE"]
    ldflags: ["-Wl,--no-relax"]
march_overrides:
  - workloads: [riscv-tests]
    benchmarks: ["vec-*"]
    march: rv64gcv
workloads:
  embench-iot:
    defines: ["CPU_MHZ=1"]
    cflags: ["-fno-common"]
    includes: ["support", "/workloads/embench-iot/extra"]
    env:
      files: [crt0.S, main.c]
    layout:
      per_benchmark:
        bench_root: "{workload_root}/src"
        source_patterns: ["*.c"]
        exclude_dirs: ["{bench}"]
    platforms:
      linux:
        cflags: ["-fPIC"]
        env:
          skip: true
        append:
          libs: ["-lpthread"]
  dhrystone:
    layout:
      mode: single
      single_sources: ["{workload_root}/dhry_1.c"]
    features:
      trace:
        defines: [TRACED]
        workload_sources: ["{workload_root}/dhry_traced.c"]
  riscv-tests: {}
"#;

    fn config() -> BuildConfig {
        BuildConfig::from_yaml_str(BOARD, Emulator::Spike, &Settings::default()).unwrap()
    }

    fn finalize(workload: &str, platform: Platform, features: FeatureSet) -> crate::FinalConfig {
        config()
            .finalize(
                workload,
                Arch::Rv64,
                platform,
                Emulator::Spike,
                Path::new("/workloads/embench-iot"),
                features,
            )
            .unwrap()
    }

    #[test]
    fn test_finalize_idempotent() {
        let features = FeatureSet {
            bbv: true,
            trace: true,
        };
        let first = finalize("embench-iot", Platform::Baremetal, features);
        let second = finalize("embench-iot", Platform::Baremetal, features);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_base_flags() {
        let config = finalize("embench-iot", Platform::Baremetal, FeatureSet::default());
        assert_eq!(config.tools.cc, "riscv64-unknown-elf-gcc");
        assert_eq!(
            config.flags.cflags,
            vec!["-march=rv64gc", "-O2", "-g", "-DCPU_MHZ=1", "-fno-common"]
        );
        assert_eq!(config.flags.isa(), Some("rv64gc".to_string()));
        assert_eq!(
            config.flags.includes,
            vec![
                PathBuf::from("/workloads/embench-iot/include"),
                PathBuf::from("/workloads/embench-iot/support"),
                PathBuf::from("/workloads/embench-iot/extra"),
            ]
        );
        assert_eq!(config.env.dir, PathBuf::from("/env/spike"));
        assert_eq!(config.flags.linker_script, Some(PathBuf::from("/env/spike/link.ld")));
        assert!(
            config
                .flags
                .cflags_with_includes()
                .ends_with(&["-I/workloads/embench-iot/extra".to_string()])
        );
        match &config.layout.mode {
            LayoutMode::PerBenchmark {
                bench_root,
                exclude_dirs,
                ..
            } => {
                assert_eq!(bench_root, Path::new("/workloads/embench-iot/src"));
                // unknown placeholders survive substitution
                assert_eq!(exclude_dirs, &vec!["{bench}".to_string()]);
            }
            _ => panic!("expected per_benchmark"),
        }
    }

    #[test]
    fn test_features_only_append() {
        let base = finalize("embench-iot", Platform::Baremetal, FeatureSet::default());
        for features in [
            FeatureSet {
                bbv: true,
                trace: false,
            },
            FeatureSet {
                bbv: false,
                trace: true,
            },
            FeatureSet {
                bbv: true,
                trace: true,
            },
        ] {
            let extended = finalize("embench-iot", Platform::Baremetal, features);
            assert!(extended.flags.cflags.starts_with(&base.flags.cflags));
            assert!(extended.flags.ldflags.starts_with(&base.flags.ldflags));
        }
        let both = finalize(
            "embench-iot",
            Platform::Baremetal,
            FeatureSet {
                bbv: true,
                trace: true,
            },
        );
        // -O2 from the bbv section is already present
        assert_eq!(&both.flags.cflags[5..], &["-DBBV", "-DTRACE"]);
        assert_eq!(both.flags.ldflags.last().unwrap(), "-Wl,--no-relax");
    }

    #[test]
    fn test_platform_override_precedence() {
        let config = finalize("embench-iot", Platform::Linux, FeatureSet::default());
        // lists are replaced wholesale, except under `append`
        assert_eq!(config.flags.cflags, vec!["-march=rv64gc", "-O2", "-DCPU_MHZ=1", "-fPIC"]);
        assert_eq!(config.flags.libs, vec!["-lpthread"]);
        assert!(config.env.skip);
        assert_eq!(config.env.files, vec!["crt0.S", "main.c"]);
        assert_eq!(config.flags.linker_script, None);
    }

    #[test]
    fn test_workload_feature_sources() {
        let plain = finalize("dhrystone", Platform::Baremetal, FeatureSet::default());
        let traced = finalize(
            "dhrystone",
            Platform::Baremetal,
            FeatureSet {
                bbv: false,
                trace: true,
            },
        );
        assert_eq!(
            plain.layout.mode,
            LayoutMode::Single {
                single_sources: vec!["/workloads/embench-iot/dhry_1.c".to_string()]
            }
        );
        assert_eq!(
            traced.layout.mode,
            LayoutMode::Single {
                single_sources: vec!["/workloads/embench-iot/dhry_traced.c".to_string()]
            }
        );
        assert_eq!(&traced.flags.cflags[3..], &["-DTRACE", "-DTRACED"]);
    }

    #[test]
    fn test_march_override() {
        let config = finalize("riscv-tests", Platform::Baremetal, FeatureSet::default());
        let vector = config.for_benchmark("vec-add").unwrap();
        assert_eq!(vector.flags.cflags[0], "-march=rv64gcv");
        assert_eq!(vector.flags.ldflags[0], "-march=rv64gcv");
        assert_eq!(config.for_benchmark("median").unwrap(), config);

        let other = finalize("embench-iot", Platform::Baremetal, FeatureSet::default());
        assert_eq!(other.for_benchmark("vec-add").unwrap(), other);
    }

    #[test]
    fn test_missing_toolchain() {
        let result = config().finalize(
            "embench-iot",
            Arch::Rv32,
            Platform::Baremetal,
            Emulator::Spike,
            Path::new("/w"),
            FeatureSet::default(),
        );
        assert!(result.unwrap_err().to_string().contains("rv32.baremetal"));
    }

    #[test]
    fn test_alt_roots_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("default");
        std::fs::create_dir_all(mirror.join("embench-iot/extra")).unwrap();
        let text = BOARD.replace("ALT/", &format!("{}/", mirror.display()));
        let config = BuildConfig::from_yaml_str(&text, Emulator::Spike, &Settings::default()).unwrap();
        let config = config
            .finalize(
                "embench-iot",
                Arch::Rv64,
                Platform::Baremetal,
                Emulator::Spike,
                Path::new("/workloads/embench-iot"),
                FeatureSet::default(),
            )
            .unwrap();
        assert_eq!(config.flags.includes[2], mirror.join("embench-iot/extra"));
    }

    #[test]
    fn test_deep_merge() {
        let base: serde_yaml::Value =
            serde_yaml::from_str("a: 1\nlist: [x]\nnested: {k: v, keep: true}").unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("a: 2\nnested: {k: w}\nappend: {list: [y], fresh: z}").unwrap();
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged["a"].as_i64(), Some(2));
        assert_eq!(merged["nested"]["k"].as_str(), Some("w"));
        assert_eq!(merged["nested"]["keep"].as_bool(), Some(true));
        assert_eq!(merged["list"].as_sequence().unwrap().len(), 2);
        assert_eq!(merged["fresh"][0].as_str(), Some("z"));
        assert!(merged.get("append").is_none());
    }

    #[test]
    fn test_placeholders() {
        let placeholders = Placeholders::new(
            Path::new("/w"),
            Arch::Rv32,
            Platform::Linux,
            Emulator::Qemu,
            Emulator::Qemu,
        );
        assert_eq!(
            placeholders.apply("{workload_root}/{arch}-{platform}/{emulator}/{board}/{bench}"),
            "/w/rv32-linux/qemu/qemu/{bench}"
        );
    }
}
