//! Conversion of the legacy ini `board.cfg` into a schema 2 board document

use crate::{Arch, BoardDocument, FeatureFlags, MarchOverride, Platform, SCHEMA_VERSION, Toolchain};
use anyhow::bail;
use clap::ValueEnum;
use log::warn;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Environment files compiled when a legacy board does not list any
pub const LEGACY_ENVIRONMENT_FILES: &[&str] = &["crt0.S", "main.c", "stub.c"];

const FEATURE_SECTIONS: &[&str] = &["bbv", "trace", "vector"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

pub fn parse_ini(text: &str) -> anyhow::Result<Vec<IniSection>> {
    let mut sections: Vec<IniSection> = vec![];
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            sections.push(IniSection {
                name: name.trim().to_string(),
                entries: vec![],
            });
            continue;
        }

        let Some(section) = sections.last_mut() else {
            bail!("line {}: entry outside of any section", index + 1);
        };

        // indented lines continue the previous value
        if raw.starts_with(char::is_whitespace) {
            if let Some((_, value)) = section.entries.last_mut() {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(line);
                continue;
            }
        }

        let Some(split) = line.find(['=', ':']) else {
            bail!("line {}: expected `key = value`, got {:?}", index + 1, line);
        };
        let key = line[..split].trim().to_lowercase();
        let value = line[split + 1..].trim().to_string();
        section.entries.push((key, value));
    }
    Ok(sections)
}

fn split_quoted(value: &str) -> Option<Vec<String>> {
    let mut words = vec![];
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => current.push(c),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => current.push(chars.next()?),
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                current.push(chars.next()?);
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}

/// Shell-like word splitting, falling back to whitespace on unbalanced quotes
pub fn split_words(value: &str) -> Vec<String> {
    match split_quoted(value) {
        Some(words) => words,
        None => {
            warn!("Failed to parse config value {:?}, splitting on whitespace", value);
            value.split_whitespace().map(String::from).collect()
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}

fn list_value(words: Vec<String>) -> Value {
    Value::Sequence(words.into_iter().map(Value::String).collect())
}

fn child<'a>(mapping: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let key = Value::String(key.to_string());
    if !matches!(mapping.get(&key), Some(Value::Mapping(_))) {
        mapping.insert(key.clone(), Value::Mapping(Mapping::new()));
    }
    match mapping.get_mut(&key) {
        Some(Value::Mapping(inner)) => inner,
        _ => unreachable!("mapping inserted above"),
    }
}

/// Map legacy keys of a workload (or platform override) section onto the schema 2 layout
fn convert_workload_entries(section: &IniSection, target: &mut Mapping) {
    for (key, value) in &section.entries {
        let key = key.as_str();
        let flag_key = key.strip_prefix("workload_").unwrap_or(key);
        match flag_key {
            "cflags" | "ldflags" | "includes" | "defines" | "libs" => {
                target.insert(flag_key.into(), list_value(split_words(value)));
            }
            "linker_script" => {
                target.insert(flag_key.into(), Value::String(value.clone()));
            }
            "sources" => {
                let layout = child(target, "layout");
                layout.insert("mode".into(), "single".into());
                layout.insert("single_sources".into(), list_value(split_words(value)));
            }
            _ => match key {
                "environment_files" => {
                    child(target, "env").insert("files".into(), list_value(split_words(value)));
                }
                "skip_environment" => {
                    child(target, "env").insert("skip".into(), Value::Bool(parse_bool(value)));
                }
                "skip_common_files" => {
                    child(target, "layout")
                        .insert("common_skip".into(), list_value(split_words(value)));
                }
                "common_patterns" | "support_once_patterns" | "support_per_benchmark_patterns" => {
                    child(target, "layout").insert(key.into(), list_value(split_words(value)));
                }
                "bench_root" => {
                    child(child(target, "layout"), "per_benchmark")
                        .insert(key.into(), Value::String(value.clone()));
                }
                "source_patterns" | "exclude_dirs" => {
                    child(child(target, "layout"), "per_benchmark")
                        .insert(key.into(), list_value(split_words(value)));
                }
                _ => warn!("Ignoring legacy key {} in [{}]", key, section.name),
            },
        }
    }
}

fn default_cc(arch: Arch, platform: Platform) -> String {
    match platform {
        Platform::Baremetal => format!("riscv{}-unknown-elf-gcc", arch.bits()),
        Platform::Linux => format!("riscv{}-unknown-linux-gnu-gcc", arch.bits()),
    }
}

fn convert_toolchain(defaults: &IniSection, section: &IniSection, arch: Arch, platform: Platform) -> Toolchain {
    let get = |key: &str| section.get(key).or_else(|| defaults.get(key));
    Toolchain {
        cc: get("cc")
            .map(String::from)
            .unwrap_or_else(|| default_cc(arch, platform)),
        base_cflags: get("base_cflags").map(split_words).unwrap_or_default(),
        base_ldflags: get("base_ldflags").map(split_words).unwrap_or_default(),
        libs: get("libs").map(split_words).unwrap_or_default(),
        linker_script: get("linker_script").map(String::from),
    }
}

pub fn convert_legacy_board(text: &str) -> anyhow::Result<BoardDocument> {
    let sections = parse_ini(text)?;
    let defaults = sections
        .iter()
        .find(|section| section.name == "DEFAULT")
        .cloned()
        .unwrap_or_default();

    let mut document = BoardDocument {
        schema: SCHEMA_VERSION,
        ..Default::default()
    };
    let mut workloads: BTreeMap<String, Mapping> = BTreeMap::new();
    let default_env_files = defaults
        .get("environment_files")
        .map(split_words)
        .unwrap_or_else(|| LEGACY_ENVIRONMENT_FILES.iter().map(|file| file.to_string()).collect());

    for section in &sections {
        let name = section.name.as_str();
        if name == "DEFAULT" {
            continue;
        }

        if FEATURE_SECTIONS.contains(&name) {
            if name == "vector" {
                for arch in [Arch::Rv32, Arch::Rv64] {
                    for (prefix, pattern) in [("vector", "vec-*"), ("regular", "*")] {
                        if let Some(march) = section.get(&format!("{}_{}_arch", prefix, arch)) {
                            document.march_overrides.push(MarchOverride {
                                workloads: vec!["riscv-tests".to_string()],
                                benchmarks: vec![pattern.to_string()],
                                arch: Some(arch),
                                march: march.to_string(),
                            });
                        }
                    }
                }
            } else {
                document.features.insert(
                    name.to_string(),
                    FeatureFlags {
                        cflags: section
                            .get(&format!("{}_cflags", name))
                            .map(split_words)
                            .unwrap_or_default(),
                        ldflags: section
                            .get(&format!("{}_ldflags", name))
                            .map(split_words)
                            .unwrap_or_default(),
                    },
                );
            }
            continue;
        }

        match name.split_once('.') {
            Some((first, second)) => {
                if let Ok(platform) = Platform::from_str(first, true) {
                    // <platform>.<workload>
                    let workload = workloads.entry(second.to_string()).or_default();
                    let platforms = child(workload, "platforms");
                    convert_workload_entries(section, child(platforms, platform.as_str()));
                } else if let (Ok(arch), Ok(platform)) =
                    (Arch::from_str(first, true), Platform::from_str(second, true))
                {
                    document
                        .toolchains
                        .entry(arch)
                        .or_default()
                        .insert(platform, convert_toolchain(&defaults, section, arch, platform));
                } else {
                    warn!("Ignoring unknown legacy section [{}]", name);
                }
            }
            None => {
                let workload = workloads.entry(name.to_string()).or_default();
                convert_workload_entries(section, workload);
            }
        }
    }

    for (name, mut workload) in workloads {
        let env = child(&mut workload, "env");
        if !env.contains_key("files") {
            env.insert("files".into(), list_value(default_env_files.clone()));
        }
        if !env.contains_key("skip") {
            if let Some(skip) = defaults.get("skip_environment") {
                env.insert("skip".into(), Value::Bool(parse_bool(skip)));
            }
        }
        document.workloads.insert(name, Value::Mapping(workload));
    }
    Ok(document)
}

#[cfg(test)]
mod tests {
    use crate::{Arch, Platform, convert_legacy_board, parse_ini, split_words};

    const LEGACY: &str = r#"
[DEFAULT]
base_cflags = -O2 -static
environment_files = crt0.S main.c

[rv32.baremetal]
cc = riscv32-unknown-elf-gcc
base_cflags = -march=rv32imafdc -mabi=ilp32d
  -mcmodel=medany
linker_script = link.ld

[embench-iot]
workload_cflags = -DCPU_MHZ=1 "-DNAME=a b"
skip_common_files = syscalls.c

[dhrystone]
workload_sources = {workload_root}/dhry_1.c {workload_root}/dhry_2.c

[linux.embench-iot]
skip_environment = true

[bbv]
bbv_cflags = -DBBV

[vector]
vector_rv32_arch = rv32gcv
regular_rv32_arch = rv32gc
"#;

    #[test]
    fn test_split_words() {
        assert_eq!(split_words("-O2  '-DX=a b' \"-DY=\\\"q\\\"\""), vec!["-O2", "-DX=a b", "-DY=\"q\""]);
        assert_eq!(split_words("-DX='unbalanced"), vec!["-DX='unbalanced"]);
        assert!(split_words("   ").is_empty());
    }

    #[test]
    fn test_parse_ini_continuation() {
        let sections = parse_ini(LEGACY).unwrap();
        let toolchain = sections.iter().find(|s| s.name == "rv32.baremetal").unwrap();
        assert_eq!(
            toolchain.get("base_cflags"),
            Some("-march=rv32imafdc -mabi=ilp32d -mcmodel=medany")
        );
        assert!(parse_ini("key = value\n").is_err());
    }

    #[test]
    fn test_convert_legacy_board() {
        let document = convert_legacy_board(LEGACY).unwrap();
        assert_eq!(document.schema, 2);

        let toolchain = &document.toolchains[&Arch::Rv32][&Platform::Baremetal];
        assert_eq!(toolchain.cc, "riscv32-unknown-elf-gcc");
        assert_eq!(toolchain.base_cflags.len(), 3);
        assert_eq!(toolchain.linker_script.as_deref(), Some("link.ld"));

        let embench = &document.workloads["embench-iot"];
        assert_eq!(embench["cflags"][1].as_str(), Some("-DNAME=a b"));
        assert_eq!(embench["layout"]["common_skip"][0].as_str(), Some("syscalls.c"));
        assert_eq!(embench["env"]["files"][1].as_str(), Some("main.c"));
        assert_eq!(embench["platforms"]["linux"]["env"]["skip"].as_bool(), Some(true));

        let dhrystone = &document.workloads["dhrystone"];
        assert_eq!(dhrystone["layout"]["mode"].as_str(), Some("single"));
        assert_eq!(dhrystone["layout"]["single_sources"].as_sequence().unwrap().len(), 2);

        assert_eq!(document.features["bbv"].cflags, vec!["-DBBV"]);
        assert_eq!(document.march_overrides.len(), 2);
        assert_eq!(document.march_overrides[0].benchmarks, vec!["vec-*"]);
        assert_eq!(document.march_overrides[0].march, "rv32gcv");
        assert_eq!(document.march_overrides[1].benchmarks, vec!["*"]);
    }
}
