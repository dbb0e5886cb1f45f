use log::debug;
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

pub fn get_tqdm_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template(
            "{percent:>3}% |{wide_bar}| {pos}/{len} [{elapsed_precise}<{eta_precise}, {custom_per_sec}] {msg}",
        )
        .unwrap()
        .with_key(
            "custom_per_sec",
            Box::new(|s: &indicatif::ProgressState, w: &mut dyn std::fmt::Write| write!(w, "{:.2} it/s", s.per_sec()).unwrap()),
        ).progress_chars("██ ")
}

/// `info` unless RUST_LOG says otherwise
pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Outcome of an external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub argv: Vec<String>,
    /// exit code, None if terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, as written to run logs
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command line")]
    Empty,
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "command failed ({}): {}\nstdout:\n{}\nstderr:\n{}",
        describe_status(.0.status),
        shell_join(&.0.argv),
        .0.stdout,
        .0.stderr
    )]
    Failed(CommandResult),
    #[error("command timed out after {}s: {}", .timeout.as_secs(), shell_join(.argv))]
    Timeout { argv: Vec<String>, timeout: Duration },
}

impl CommandError {
    /// The captured result, if the process ran to completion
    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            CommandError::Failed(result) => Some(result),
            _ => None,
        }
    }
}

fn describe_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// kill the process and fail once this elapses
    pub timeout: Option<Duration>,
    /// capture stdout/stderr instead of inheriting the terminal
    pub capture: bool,
    /// treat a non-zero exit as an error
    pub check: bool,
    pub cwd: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            capture: true,
            check: true,
            cwd: None,
        }
    }
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn unchecked() -> Self {
        Self {
            check: false,
            ..Default::default()
        }
    }

    pub fn streamed() -> Self {
        Self {
            capture: false,
            ..Default::default()
        }
    }
}

/// Quote a command line for display
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=,:+@%".contains(c))
            {
                arg.to_string()
            } else {
                format!("'{}'", arg.replace('\'', "'\\''"))
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            // the process may have exited in between
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = vec![];
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// Run an external tool to completion, blocking the caller
pub fn run_command<S: AsRef<str>>(
    argv: &[S],
    options: &RunOptions,
) -> Result<CommandResult, CommandError> {
    let argv: Vec<String> = argv.iter().map(|arg| arg.as_ref().to_string()).collect();
    let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;

    let mut command = Command::new(program);
    command.args(args);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    if options.capture {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    debug!("Running {}", shell_join(&argv));
    let spawn_error = |source| CommandError::Spawn {
        program: program.clone(),
        source,
    };
    let mut child = command.spawn().map_err(spawn_error)?;
    // drain pipes concurrently so a chatty tool never blocks on a full pipe
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let status = match options.timeout {
        Some(timeout) => wait_with_timeout(&mut child, timeout),
        None => child.wait().map(Some),
    }
    .map_err(spawn_error)?;

    let stdout = join_reader(stdout);
    let stderr = join_reader(stderr);
    let Some(status) = status else {
        return Err(CommandError::Timeout {
            argv,
            timeout: options.timeout.unwrap_or_default(),
        });
    };

    let result = CommandResult {
        argv,
        status: status.code(),
        stdout,
        stderr,
    };
    if options.check && !result.success() {
        return Err(CommandError::Failed(result));
    }
    Ok(result)
}

/// Whether a tool can be launched: an existing path, or a name found on PATH
pub fn tool_available(tool: &str) -> bool {
    if tool.contains('/') {
        return Path::new(tool).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}

/// `mkdir -p`
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> anyhow::Result<PathBuf> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)
        .map_err(|err| anyhow::anyhow!("Failed to create {}: {}", path.display(), err))?;
    Ok(path.to_path_buf())
}

/// Remove a directory tree and recreate it empty
pub fn clean_dir<P: AsRef<Path>>(path: P) -> anyhow::Result<PathBuf> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    ensure_dir(path)
}

pub fn write_json<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut content = serde_json::to_vec_pretty(value)?;
    content.push(b'\n');
    std::fs::write(path, content)?;
    Ok(())
}

pub fn read_json<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> anyhow::Result<T> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|err| anyhow::anyhow!("Failed to open {}: {}", path.display(), err))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|err| anyhow::anyhow!("Failed to parse {}: {}", path.display(), err))
}

pub fn sha256_file<P: AsRef<Path>>(path: P) -> anyhow::Result<String> {
    let mut file = File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let size = file.read(&mut buf)?;
        if size == 0 {
            break;
        }
        hasher.update(&buf[..size]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Remove repeated entries, keeping the first occurrence
pub fn dedupe<T: Clone + PartialEq>(items: &[T]) -> Vec<T> {
    let mut out: Vec<T> = vec![];
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Display a path relative to the working directory when possible
pub fn display_relative<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();
    std::env::current_dir()
        .ok()
        .and_then(|cwd| pathdiff::diff_paths(path, cwd))
        .filter(|relative| !relative.starts_with(".."))
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use crate::{CommandError, RunOptions, dedupe, run_command, sha256_file, shell_join};
    use std::time::Duration;

    #[test]
    fn test_dedupe_keeps_first() {
        let flags = vec!["-O2", "-g", "-O2", "-DBBV", "-g"];
        assert_eq!(dedupe(&flags), vec!["-O2", "-g", "-DBBV"]);
    }

    #[test]
    fn test_shell_join() {
        assert_eq!(
            shell_join(&["spike", "--isa=rv64gc", "a b"]),
            "spike --isa=rv64gc 'a b'"
        );
    }

    #[test]
    fn test_run_command_captures_failure() {
        let result = run_command(&["sh", "-c", "echo out; echo err >&2; exit 3"], &RunOptions::default());
        match result {
            Err(CommandError::Failed(result)) => {
                assert_eq!(result.status, Some(3));
                assert_eq!(result.stdout.trim(), "out");
                assert_eq!(result.stderr.trim(), "err");
            }
            other => panic!("unexpected {:?}", other),
        }

        let unchecked = run_command(&["false"], &RunOptions::unchecked()).unwrap();
        assert!(!unchecked.success());
    }

    #[test]
    fn test_run_command_timeout() {
        let result = run_command(
            &["sleep", "5"],
            &RunOptions::with_timeout(Duration::from_millis(100)),
        );
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }

    #[test]
    fn test_missing_tool() {
        let result = run_command(&["definitely-not-a-tool-xyz"], &RunOptions::default());
        assert!(matches!(result, Err(CommandError::Spawn { .. })));
    }

    #[test]
    fn test_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
