use crate::get_tqdm_style;
use anyhow::bail;
use clap::ValueEnum;
use cli_table::{Cell, Table, print_stdout};
use indicatif::ProgressBar;
use log::{error, info};
use std::time::Instant;

/// What a multi-benchmark sweep does after one unit fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum FailurePolicy {
    /// stop at the first failure
    Abort,
    /// record the failure and keep going
    #[default]
    Continue,
}

#[derive(Debug)]
pub struct UnitOutcome {
    pub unit: String,
    /// success message or the error chain
    pub result: Result<String, String>,
    pub elapsed_seconds: f64,
}

/// Runs units one after another and records an outcome for each
pub struct Sweep {
    name: String,
    policy: FailurePolicy,
    outcomes: Vec<UnitOutcome>,
    pbar: ProgressBar,
}

impl Sweep {
    pub fn new(name: &str, policy: FailurePolicy, total: usize) -> Self {
        let pbar = ProgressBar::new(total as u64);
        pbar.set_style(get_tqdm_style());
        Self {
            name: name.to_string(),
            policy,
            outcomes: vec![],
            pbar,
        }
    }

    /// Run one unit; only returns an error when the policy says to abort
    pub fn run<F>(&mut self, unit: &str, f: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<String>,
    {
        self.pbar.set_message(unit.to_string());
        let begin = Instant::now();
        let result = f();
        let elapsed_seconds = begin.elapsed().as_secs_f64();
        self.pbar.inc(1);

        let failed = result.is_err();
        let result = result.map_err(|err| {
            let message = format!("{:#}", err);
            self.pbar.suspend(|| error!("{}: {}", unit, message));
            message
        });
        self.outcomes.push(UnitOutcome {
            unit: unit.to_string(),
            result,
            elapsed_seconds,
        });

        if failed && self.policy == FailurePolicy::Abort {
            bail!("{} aborted after {} failed", self.name, unit);
        }
        Ok(())
    }

    pub fn outcomes(&self) -> &[UnitOutcome] {
        &self.outcomes
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .count()
    }

    pub fn print_summary(&self) -> anyhow::Result<()> {
        let mut table = vec![];
        for outcome in &self.outcomes {
            let (status, detail) = match &outcome.result {
                Ok(message) => ("ok", message.clone()),
                Err(message) => ("FAILED", message.lines().next().unwrap_or_default().to_string()),
            };
            table.push(vec![
                outcome.unit.clone().cell(),
                status.cell(),
                format!("{:.2}", outcome.elapsed_seconds).cell(),
                detail.cell(),
            ]);
        }
        let table = table.table().title(vec![
            "Unit".cell(),
            "Status".cell(),
            "Time (s)".cell(),
            "Detail".cell(),
        ]);
        print_stdout(table)?;
        Ok(())
    }

    /// Print the summary and fail if any unit failed
    pub fn finish(self) -> anyhow::Result<()> {
        self.pbar.finish_and_clear();
        if self.outcomes.is_empty() {
            info!("{}: nothing to do", self.name);
            return Ok(());
        }
        self.print_summary()?;
        let failed = self.failed();
        info!(
            "{}: {} succeeded, {} failed",
            self.name,
            self.outcomes.len() - failed,
            failed
        );
        if failed > 0 {
            bail!("{} of {} {} units failed", failed, self.outcomes.len(), self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{FailurePolicy, Sweep};
    use anyhow::bail;

    #[test]
    fn test_continue_records_every_unit() {
        let mut sweep = Sweep::new("build", FailurePolicy::Continue, 3);
        sweep.run("a", || Ok("built".to_string())).unwrap();
        sweep.run("b", || bail!("compiler failed")).unwrap();
        sweep.run("c", || Ok("built".to_string())).unwrap();
        assert_eq!(sweep.outcomes().len(), 3);
        assert_eq!(sweep.failed(), 1);
        assert!(sweep.finish().is_err());
    }

    #[test]
    fn test_abort_stops() {
        let mut sweep = Sweep::new("run", FailurePolicy::Abort, 2);
        sweep.run("a", || Ok(String::new())).unwrap();
        assert!(sweep.run("b", || bail!("emulator crashed")).is_err());
        assert_eq!(sweep.failed(), 1);
    }

    #[test]
    fn test_all_succeeded() {
        let mut sweep = Sweep::new("simpoint", FailurePolicy::default(), 1);
        sweep.run("a", || Ok("done".to_string())).unwrap();
        assert!(sweep.finish().is_ok());
    }
}
