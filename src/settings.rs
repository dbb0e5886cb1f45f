use crate::OutputLayout;
use clap::Args;
use std::path::{Path, PathBuf};

pub const DEFAULT_OUTPUTS_ROOT: &str = "/outputs";
pub const DEFAULT_ENVIRONMENT_ROOT: &str = "/default/environment";
pub const DEFAULT_STF_TOOLS: &str = "/riscv/stf_tools/release/tools";
pub const DEFAULT_SPIKE_PK: &str = "/riscv/riscv-pk/build/pk";
pub const DEFAULT_STF_PLUGIN: &str = "/usr/lib/libstfmem.so";
pub const DEFAULT_BBV_PLUGIN: &str = "/usr/lib/libbbv.so";

/// Process-wide tool locations and roots, built once from the command line
/// and environment and passed down to every component
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Root of all generated artifacts
    #[arg(long, env = "FLOW_OUTPUTS_ROOT", default_value = DEFAULT_OUTPUTS_ROOT, global = true)]
    pub outputs_root: PathBuf,

    /// Directory containing one board configuration folder per emulator
    #[arg(long, env = "FLOW_ENVIRONMENT_ROOT", default_value = DEFAULT_ENVIRONMENT_ROOT, global = true)]
    pub environment_root: PathBuf,

    /// Explicit board configuration file, bypasses discovery
    #[arg(long, env = "FLOW_BOARD_CONFIG", global = true)]
    pub board_config: Option<PathBuf>,

    /// Directory holding the STF tools (stf_dump, stf_count, stf_trace_info)
    #[arg(long, env = "STF_TOOLS", default_value = DEFAULT_STF_TOOLS, global = true)]
    pub stf_tools: PathBuf,

    /// Proxy kernel used to run linux binaries under spike
    #[arg(long, env = "SPIKE_PK", default_value = DEFAULT_SPIKE_PK, global = true)]
    pub spike_pk: PathBuf,

    /// QEMU STF tracing plugin
    #[arg(long, env = "STF_PLUGIN", default_value = DEFAULT_STF_PLUGIN, global = true)]
    pub stf_plugin: PathBuf,

    /// QEMU BBV plugin
    #[arg(long, env = "BBV_PLUGIN", default_value = DEFAULT_BBV_PLUGIN, global = true)]
    pub bbv_plugin: PathBuf,

    /// Spike executable
    #[arg(long, env = "SPIKE", default_value = "spike", global = true)]
    pub spike: String,

    /// SimPoint executable
    #[arg(long, env = "SIMPOINT", default_value = "simpoint", global = true)]
    pub simpoint: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outputs_root: PathBuf::from(DEFAULT_OUTPUTS_ROOT),
            environment_root: PathBuf::from(DEFAULT_ENVIRONMENT_ROOT),
            board_config: None,
            stf_tools: PathBuf::from(DEFAULT_STF_TOOLS),
            spike_pk: PathBuf::from(DEFAULT_SPIKE_PK),
            stf_plugin: PathBuf::from(DEFAULT_STF_PLUGIN),
            bbv_plugin: PathBuf::from(DEFAULT_BBV_PLUGIN),
            spike: "spike".to_string(),
            simpoint: "simpoint".to_string(),
        }
    }
}

impl Settings {
    /// Default settings rooted at a different outputs directory
    pub fn with_outputs_root<P: AsRef<Path>>(outputs_root: P) -> Self {
        Self {
            outputs_root: outputs_root.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(&self.outputs_root)
    }

    /// STF tools are installed as `<stf_tools>/<name>/<name>`
    pub fn stf_tool(&self, name: &str) -> PathBuf {
        self.stf_tools.join(name).join(name)
    }
}
