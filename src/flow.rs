use crate::{
    Arch, DockerOrchestrator, Emulator, FailurePolicy, Platform, RunOptions, Settings,
    run_command, shell_join,
};
use anyhow::Context;
use clap::ValueEnum;
use cli_table::{Cell, Table, print_stdout};
use log::{error, info, warn};
use std::{
    path::PathBuf,
    time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FlowStep {
    Build,
    Run,
    Simpoint,
    Slice,
}

impl FlowStep {
    pub const ALL: [FlowStep; 4] = [FlowStep::Build, FlowStep::Run, FlowStep::Simpoint, FlowStep::Slice];

    /// Binary that implements the step
    pub fn program(&self) -> &'static str {
        match self {
            FlowStep::Build => "build_workload",
            FlowStep::Run => "run_workload",
            FlowStep::Simpoint => "run_simpoint",
            FlowStep::Slice => "generate_trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub workload: String,
    pub benchmark: Option<String>,
    pub arch: Arch,
    pub platform: Platform,
    pub emulator: Emulator,
    pub bbv: bool,
    pub trace: bool,
    pub interval_size: u64,
    pub max_k: u32,
    pub verify: bool,
    pub on_failure: FailurePolicy,
    pub skip: Vec<FlowStep>,
}

impl FlowOptions {
    fn selection(&self, argv: &mut Vec<String>) {
        argv.push("--workload".to_string());
        argv.push(self.workload.clone());
        if let Some(benchmark) = &self.benchmark {
            argv.push("--benchmark".to_string());
            argv.push(benchmark.clone());
        }
    }

    fn target(&self, argv: &mut Vec<String>) {
        argv.push("--arch".to_string());
        argv.push(self.arch.to_string());
        argv.push("--platform".to_string());
        argv.push(self.platform.to_string());
        argv.push("--emulator".to_string());
        argv.push(self.emulator.to_string());
    }

    fn on_failure(&self, argv: &mut Vec<String>) {
        argv.push("--on-failure".to_string());
        argv.push(match self.on_failure {
            FailurePolicy::Abort => "abort".to_string(),
            FailurePolicy::Continue => "continue".to_string(),
        });
    }

    /// Command line of one step, or None when the step does not apply
    pub fn step_command(&self, step: FlowStep) -> Option<Vec<String>> {
        let mut argv = vec![step.program().to_string()];
        match step {
            FlowStep::Build => {
                self.selection(&mut argv);
                self.target(&mut argv);
                if self.bbv {
                    argv.push("--bbv".to_string());
                }
                if self.trace {
                    argv.push("--trace".to_string());
                }
                self.on_failure(&mut argv);
            }
            FlowStep::Run => {
                self.selection(&mut argv);
                self.target(&mut argv);
                argv.push(if self.bbv { "--bbv" } else { "--no-bbv" }.to_string());
                argv.push(if self.trace { "--trace" } else { "--no-trace" }.to_string());
                argv.push("--interval-size".to_string());
                argv.push(self.interval_size.to_string());
                self.on_failure(&mut argv);
            }
            FlowStep::Simpoint => {
                if !self.bbv {
                    return None;
                }
                argv.push("--emulator".to_string());
                argv.push(self.emulator.to_string());
                self.selection(&mut argv);
                argv.push("--max-k".to_string());
                argv.push(self.max_k.to_string());
                self.on_failure(&mut argv);
            }
            FlowStep::Slice => {
                if !self.bbv || self.emulator != Emulator::Spike {
                    return None;
                }
                argv.push("sliced".to_string());
                argv.push("--emulator".to_string());
                argv.push(self.emulator.to_string());
                self.selection(&mut argv);
                if self.verify {
                    argv.push("--verify".to_string());
                }
                self.on_failure(&mut argv);
            }
        }
        Some(argv)
    }
}

/// Where step commands execute
pub enum Executor {
    /// sibling binaries of the current executable
    Local { bin_dir: Option<PathBuf> },
    Docker(DockerOrchestrator),
}

impl Executor {
    pub fn local() -> Self {
        let bin_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()));
        Executor::Local { bin_dir }
    }

    fn execute(&self, argv: &[String], settings: &Settings) -> anyhow::Result<()> {
        match self {
            Executor::Local { bin_dir } => {
                let mut argv = argv.to_vec();
                if let Some(program) = bin_dir.as_ref().map(|dir| dir.join(&argv[0])) {
                    if program.is_file() {
                        argv[0] = program.display().to_string();
                    }
                }
                argv.push("--outputs-root".to_string());
                argv.push(settings.outputs_root.display().to_string());
                argv.push("--environment-root".to_string());
                argv.push(settings.environment_root.display().to_string());
                if let Some(board_config) = &settings.board_config {
                    argv.push("--board-config".to_string());
                    argv.push(board_config.display().to_string());
                }
                info!("Executing: {}", shell_join(&argv));
                run_command(&argv, &RunOptions::streamed())?;
            }
            Executor::Docker(docker) => {
                docker.run(argv)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct StepReport {
    pub step: FlowStep,
    pub status: StepStatus,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done,
    Skipped(String),
    Failed(String),
    /// not attempted because an earlier step failed
    NotRun,
}

pub struct FullFlow<'a> {
    settings: &'a Settings,
    options: FlowOptions,
    executor: Executor,
}

impl<'a> FullFlow<'a> {
    pub fn new(settings: &'a Settings, options: FlowOptions, executor: Executor) -> Self {
        Self {
            settings,
            options,
            executor,
        }
    }

    /// Run build, run, simpoint and slice in order; the first failure stops the rest
    pub fn run(&self) -> Vec<StepReport> {
        let mut reports = vec![];
        let mut failed = false;
        for step in FlowStep::ALL {
            let begin = Instant::now();
            let status = if failed {
                StepStatus::NotRun
            } else if self.options.skip.contains(&step) {
                StepStatus::Skipped("requested".to_string())
            } else {
                match self.options.step_command(step) {
                    None => {
                        warn!("Skipping {:?}: not applicable to this configuration", step);
                        StepStatus::Skipped("not applicable".to_string())
                    }
                    Some(argv) => match self
                        .executor
                        .execute(&argv, self.settings)
                        .with_context(|| format!("{:?} step failed", step))
                    {
                        Ok(()) => StepStatus::Done,
                        Err(err) => {
                            error!("{:#}", err);
                            failed = true;
                            StepStatus::Failed(format!("{:#}", err))
                        }
                    },
                }
            };
            reports.push(StepReport {
                step,
                status,
                elapsed_seconds: begin.elapsed().as_secs_f64(),
            });
        }
        reports
    }
}

pub fn print_reports(reports: &[StepReport]) -> anyhow::Result<()> {
    let mut table = vec![];
    for report in reports {
        let status = match &report.status {
            StepStatus::Done => "done".to_string(),
            StepStatus::Skipped(reason) => format!("skipped ({})", reason),
            StepStatus::Failed(_) => "FAILED".to_string(),
            StepStatus::NotRun => "not run".to_string(),
        };
        table.push(vec![
            format!("{:?}", report.step).cell(),
            status.cell(),
            format!("{:.1}", report.elapsed_seconds).cell(),
        ]);
    }
    let table = table
        .table()
        .title(vec!["Step".cell(), "Status".cell(), "Time (s)".cell()]);
    print_stdout(table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        Arch, Emulator, Executor, FailurePolicy, FlowOptions, FlowStep, FullFlow, Platform,
        Settings, StepStatus,
    };
    use std::path::PathBuf;

    fn options() -> FlowOptions {
        FlowOptions {
            workload: "embench".to_string(),
            benchmark: Some("crc32".to_string()),
            arch: Arch::Rv32,
            platform: Platform::Baremetal,
            emulator: Emulator::Spike,
            bbv: true,
            trace: false,
            interval_size: 1000,
            max_k: 30,
            verify: false,
            on_failure: FailurePolicy::Continue,
            skip: vec![],
        }
    }

    #[test]
    fn test_step_commands() {
        let options = options();
        assert_eq!(
            options.step_command(FlowStep::Build).unwrap(),
            vec![
                "build_workload",
                "--workload",
                "embench",
                "--benchmark",
                "crc32",
                "--arch",
                "rv32",
                "--platform",
                "baremetal",
                "--emulator",
                "spike",
                "--bbv",
                "--on-failure",
                "continue",
            ]
        );
        let run = options.step_command(FlowStep::Run).unwrap();
        assert!(run.contains(&"--no-trace".to_string()));
        let slice = options.step_command(FlowStep::Slice).unwrap();
        assert_eq!(&slice[..2], &["generate_trace", "sliced"]);
    }

    #[test]
    fn test_steps_not_applicable() {
        let mut options = options();
        options.emulator = Emulator::Qemu;
        assert!(options.step_command(FlowStep::Slice).is_none());
        options.bbv = false;
        assert!(options.step_command(FlowStep::Simpoint).is_none());
    }

    #[test]
    fn test_failed_step_stops_flow() {
        let settings = Settings::default();
        let mut options = options();
        options.skip = vec![FlowStep::Simpoint];
        // no such binaries next to the test executable or on PATH
        let executor = Executor::Local {
            bin_dir: Some(PathBuf::from("/nonexistent")),
        };
        let flow = FullFlow::new(&settings, options, executor);
        let reports = flow.run();
        assert_eq!(reports.len(), 4);
        assert!(matches!(reports[0].status, StepStatus::Failed(_)));
        assert_eq!(reports[1].status, StepStatus::NotRun);
        assert_eq!(reports[2].status, StepStatus::NotRun);
        assert_eq!(reports[3].status, StepStatus::NotRun);
    }
}
