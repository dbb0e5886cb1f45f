use crate::{CommandResult, RunOptions, ensure_dir, run_command, shell_join, tool_available};
use anyhow::{Context, bail};
use log::info;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_IMAGE: &str = "riscv-perf-model:latest";

pub const DOCKER_TIMEOUT: Duration = Duration::from_secs(1800);

pub const CONTAINER_OUTPUTS_ROOT: &str = "/outputs";
pub const CONTAINER_WORKLOADS_ROOT: &str = "/workloads";
pub const CONTAINER_ENVIRONMENT_ROOT: &str = "/workloads/environment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
}

/// Runs flow commands inside the toolchain image with the expected mounts
#[derive(Debug, Clone)]
pub struct DockerOrchestrator {
    image: String,
    /// parents before children, so nested mounts stay visible
    mounts: Vec<Mount>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("Mount source missing: {}", path.display()))
}

impl DockerOrchestrator {
    pub fn new(
        image: &str,
        outputs: &Path,
        workloads: Option<&Path>,
        environment: Option<&Path>,
    ) -> anyhow::Result<Self> {
        ensure_dir(outputs)?;
        let mut mounts = vec![Mount {
            host: absolute(outputs)?,
            container: CONTAINER_OUTPUTS_ROOT.to_string(),
        }];
        if let Some(workloads) = workloads {
            mounts.push(Mount {
                host: absolute(workloads)?,
                container: CONTAINER_WORKLOADS_ROOT.to_string(),
            });
        }
        if let Some(environment) = environment {
            mounts.push(Mount {
                host: absolute(environment)?,
                container: CONTAINER_ENVIRONMENT_ROOT.to_string(),
            });
        }
        Ok(Self {
            image: image.to_string(),
            mounts,
            env: vec![
                ("FLOW_OUTPUTS_ROOT".to_string(), CONTAINER_OUTPUTS_ROOT.to_string()),
                ("FLOW_ENVIRONMENT_ROOT".to_string(), CONTAINER_ENVIRONMENT_ROOT.to_string()),
            ],
            timeout: DOCKER_TIMEOUT,
        })
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// `docker --version`, failing when docker is unusable
    pub fn check() -> anyhow::Result<String> {
        if !tool_available("docker") {
            bail!("Docker is not installed or not in PATH");
        }
        let result = run_command(&["docker", "--version"], &RunOptions::default())?;
        let version = result.stdout.trim().to_string();
        info!("Docker available: {}", version);
        Ok(version)
    }

    pub fn image_exists(&self) -> bool {
        run_command(&["docker", "images", "-q", self.image.as_str()], &RunOptions::default())
            .map(|result| !result.stdout.trim().is_empty())
            .unwrap_or(false)
    }

    /// `docker build -t <image> <context>`
    pub fn build_image(&self, context: &Path) -> anyhow::Result<()> {
        if !context.join("Dockerfile").is_file() {
            bail!("Dockerfile not found in {}", context.display());
        }
        let argv = [
            "docker".to_string(),
            "build".to_string(),
            "-t".to_string(),
            self.image.clone(),
            context.display().to_string(),
        ];
        info!("Building image: {}", shell_join(&argv));
        run_command(&argv, &RunOptions::streamed())?;
        Ok(())
    }

    /// `docker run --rm` wrapping `inner` in a login shell
    pub fn command<S: AsRef<str>>(&self, inner: &[S]) -> Vec<String> {
        let mut argv = vec!["docker".to_string(), "run".to_string(), "--rm".to_string()];
        for mount in &self.mounts {
            argv.push("-v".to_string());
            argv.push(format!("{}:{}", mount.host.display(), mount.container));
        }
        for (key, value) in &self.env {
            argv.push("-e".to_string());
            argv.push(format!("{}={}", key, value));
        }
        argv.push(self.image.clone());
        argv.push("bash".to_string());
        argv.push("-lc".to_string());
        argv.push(shell_join(inner));
        argv
    }

    pub fn run<S: AsRef<str>>(&self, inner: &[S]) -> anyhow::Result<CommandResult> {
        let argv = self.command(inner);
        info!("Docker exec: {}", shell_join(&argv));
        let options = RunOptions {
            timeout: Some(self.timeout),
            capture: false,
            ..Default::default()
        };
        Ok(run_command(&argv, &options)?)
    }
}
