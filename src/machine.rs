use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base integer width of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Rv32,
    Rv64,
}

impl Arch {
    pub fn bits(&self) -> u32 {
        match self {
            Arch::Rv32 => 32,
            Arch::Rv64 => 64,
        }
    }

    /// ISA string used when neither the command line nor the build metadata provide one
    pub fn default_isa(&self) -> &'static str {
        match self {
            Arch::Rv32 => "rv32imafdc",
            Arch::Rv64 => "rv64imafdc",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Rv32 => "rv32",
            Arch::Rv64 => "rv64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// No operating system, linked against the board environment
    Baremetal,
    /// User-mode binary, run under the proxy kernel or qemu user mode
    Linux,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Baremetal => "baremetal",
            Platform::Linux => "linux",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emulator used to run workloads, also the name of the board configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Emulator {
    Spike,
    Qemu,
}

impl Emulator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emulator::Spike => "spike",
            Emulator::Qemu => "qemu",
        }
    }
}

impl fmt::Display for Emulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrumentation requested at build or run time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub bbv: bool,
    #[serde(default)]
    pub trace: bool,
}

impl FeatureSet {
    /// Names of the enabled features, in application order
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut names = vec![];
        if self.bbv {
            names.push("bbv");
        }
        if self.trace {
            names.push("trace");
        }
        names
    }

    /// Run-time flags override build-time defaults when given
    pub fn overridden_by(&self, bbv: Option<bool>, trace: Option<bool>) -> FeatureSet {
        FeatureSet {
            bbv: bbv.unwrap_or(self.bbv),
            trace: trace.unwrap_or(self.trace),
        }
    }
}
