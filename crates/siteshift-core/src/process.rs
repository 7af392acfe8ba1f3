//! Subprocess execution for external database and host tooling.
//!
//! Every external invocation carries a timeout; an elapsed timeout
//! marks the operation failed (not cancelled) so retry policy applies.
//! Stdout and stderr are captured separately and never interleaved;
//! stderr is kept even on success so callers can log it at debug level.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default timeout applied when a call site does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// A fully specified external invocation.
///
/// Credentials that must not appear on the command line (the postgres
/// family password) go through `env`.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// File piped to the child's stdin (restores read the dump this way).
    pub stdin_file: Option<PathBuf>,
    /// File receiving the child's stdout (dumps write their output this way).
    pub stdout_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdin_file: None,
            stdout_file: None,
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the command, blocking the current thread. Async callers go
    /// through [`run_async`].
    pub fn run(self) -> Result<CommandOutput> {
        run_command(self)
    }
}

/// Run a command on the blocking pool; the suspension-point-safe entry
/// for async callers.
pub async fn run_async(spec: CommandSpec) -> Result<CommandOutput> {
    tokio::task::spawn_blocking(move || run_command(spec))
        .await
        .map_err(|e| Error::transfer(format!("subprocess task panicked: {e}")))?
}

fn run_command(spec: CommandSpec) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);

    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    match &spec.stdin_file {
        Some(path) => {
            let file = File::open(path).map_err(|e| {
                Error::transfer(format!("cannot open stdin file {}: {e}", path.display()))
            })?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }

    match &spec.stdout_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                Error::transfer(format!("cannot create stdout file {}: {e}", path.display()))
            })?;
            command.stdout(Stdio::from(file));
        }
        None => {
            command.stdout(Stdio::piped());
        }
    }
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| Error::transfer(format!("failed to spawn {}: {e}", spec.program)))?;

    let deadline = Instant::now() + spec.timeout;
    loop {
        match child
            .try_wait()
            .map_err(|e| Error::transfer(format!("failed to poll {}: {e}", spec.program)))?
        {
            Some(status) => {
                let stdout = read_pipe(child.stdout.take());
                let stderr = read_pipe(child.stderr.take());
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let stdout = read_pipe(child.stdout.take());
                    let mut stderr = read_pipe(child.stderr.take());
                    stderr.push_str(&format!(
                        "\ncommand timed out after {}",
                        humantime::format_duration(spec.timeout)
                    ));
                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout,
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }

                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut bytes = Vec::new();
    if let Some(mut reader) = pipe {
        let _ = reader.read_to_end(&mut bytes);
    }
    String::from_utf8_lossy(&bytes).to_string()
}

/// Probe PATH for a tool; `None` when it cannot be resolved.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Require a tool on PATH, failing with a pre-flight error otherwise.
pub fn require_tool(name: &str) -> Result<PathBuf> {
    find_tool(name)
        .ok_or_else(|| Error::preflight(format!("required tool '{name}' not found on PATH")))
}

/// Available bytes on the filesystem holding `path`, if the platform
/// exposes them. Used by the recovery validator's disk-space check.
pub fn available_disk_space(path: &Path) -> Option<u64> {
    #[cfg(unix)]
    {
        // `df -Pk` is POSIX and avoids a libc dependency for statvfs.
        let output = Command::new("df")
            .arg("-Pk")
            .arg(path)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().nth(1)?;
        let avail_kib: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
        Some(avail_kib * 1024)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout_and_exit_code() {
        let out = CommandSpec::new("sh")
            .args(["-c", "echo hello; echo oops >&2"])
            .timeout(Duration::from_secs(5))
            .run()
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn test_run_reports_nonzero_exit() {
        let out = CommandSpec::new("sh")
            .args(["-c", "exit 3"])
            .timeout(Duration::from_secs(5))
            .run()
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 3);
    }

    #[test]
    fn test_timeout_kills_child_and_marks_output() {
        let out = CommandSpec::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(300))
            .run()
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.stderr.contains("timed out"));
    }

    #[test]
    fn test_env_reaches_child() {
        let out = CommandSpec::new("sh")
            .args(["-c", "printf %s \"$SITESHIFT_TEST_VAR\""])
            .env("SITESHIFT_TEST_VAR", "secret")
            .timeout(Duration::from_secs(5))
            .run()
            .unwrap();
        assert_eq!(out.stdout, "secret");
    }

    #[test]
    fn test_stdout_file_redirect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let out = CommandSpec::new("sh")
            .args(["-c", "echo dumped"])
            .stdout_file(&path)
            .timeout(Duration::from_secs(5))
            .run()
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "dumped");
    }

    #[test]
    fn test_find_tool_resolves_sh() {
        assert!(find_tool("sh").is_some());
        assert!(find_tool("definitely-not-a-real-tool-xyz").is_none());
    }

    #[test]
    fn test_available_disk_space_on_tmp() {
        // Smoke check: some bytes should be reported for /tmp on unix.
        if cfg!(unix) {
            assert!(available_disk_space(Path::new("/tmp")).unwrap_or(0) > 0);
        }
    }
}
