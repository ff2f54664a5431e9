//! Converter execution: build the command line, run it supervised.
//!
//! ## Why log files instead of pipes?
//!
//! A converter failing on a 100 MB document can print megabytes of
//! warnings. Redirecting stdout/stderr to files in the scoped workspace keeps
//! that out of our heap; diagnostics read back only a bounded prefix.
//!
//! ## Three terminators
//!
//! Each run races natural exit, the memory supervisor, and a wall-clock
//! timeout. Memory and timeout share the same terminal action (SIGTERM,
//! grace period, SIGKILL) but are reported as distinct [`ExitKind`]s so the
//! caller can tell a resource kill from an ordinary converter failure.

use crate::error::{remediation_hint, resource_hint, ChunkError, DocConvError, ResourceKind};
use crate::options::AdvancedOptions;
use crate::pipeline::monitor::{send_terminate, ResourceMonitor, Supervision};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on captured diagnostics read back from a log file.
pub const MAX_DIAGNOSTIC_BYTES: u64 = 5000;

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a converter run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitKind {
    Success,
    /// Ordinary non-zero exit (or a signal we did not send and cannot attribute).
    Failed { exit_code: i32 },
    /// Terminated by the memory supervisor or killed by the OS for memory.
    KilledForMemory { rss_mb: Option<f64> },
    /// Terminated after the wall-clock timeout.
    TimedOut,
}

/// Outcome of one supervised converter invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub kind: ExitKind,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.kind == ExitKind::Success
    }

    /// Bounded prefix of the captured stderr.
    pub fn stderr_excerpt(&self) -> String {
        read_log_head(&self.stderr_log, MAX_DIAGNOSTIC_BYTES)
    }

    /// Bounded prefix of the captured stdout.
    pub fn stdout_excerpt(&self) -> String {
        read_log_head(&self.stdout_log, MAX_DIAGNOSTIC_BYTES)
    }

    /// Fatal error for a failed whole-file run, `None` on success.
    pub fn to_error(&self, memory_limit_mb: u64, timeout: Duration) -> Option<DocConvError> {
        match self.kind {
            ExitKind::Success => None,
            ExitKind::Failed { exit_code } => {
                let stderr = self.stderr_excerpt();
                Some(DocConvError::ConverterFailure {
                    exit_code,
                    hint: remediation_hint(exit_code, &stderr),
                    stderr,
                    stdout: self.stdout_excerpt(),
                })
            }
            ExitKind::KilledForMemory { .. } => Some(DocConvError::ResourceExceeded {
                kind: ResourceKind::Memory,
                limit: format!("{memory_limit_mb}MB"),
                stderr: self.stderr_excerpt(),
                hint: resource_hint(ResourceKind::Memory),
            }),
            ExitKind::TimedOut => Some(DocConvError::ResourceExceeded {
                kind: ResourceKind::Timeout,
                limit: format!("{}s", timeout.as_secs()),
                stderr: self.stderr_excerpt(),
                hint: resource_hint(ResourceKind::Timeout),
            }),
        }
    }

    /// Non-fatal error for a failed chunk run, `None` on success.
    pub fn to_chunk_error(&self, chunk: usize) -> Option<ChunkError> {
        match self.kind {
            ExitKind::Success => None,
            ExitKind::Failed { exit_code } => {
                let mut detail = self.stderr_excerpt();
                truncate_at_char_boundary(&mut detail, 500);
                Some(ChunkError::ConverterFailed {
                    chunk,
                    exit_code,
                    detail,
                })
            }
            ExitKind::KilledForMemory { .. } => Some(ChunkError::ResourceExceeded {
                chunk,
                kind: ResourceKind::Memory,
            }),
            ExitKind::TimedOut => Some(ChunkError::ResourceExceeded {
                chunk,
                kind: ResourceKind::Timeout,
            }),
        }
    }
}

/// Launches the external converter.
#[derive(Debug, Clone)]
pub struct ConverterExecutor {
    binary: String,
    data_dir: Option<PathBuf>,
    monitor: ResourceMonitor,
}

impl ConverterExecutor {
    pub fn new(binary: impl Into<String>, data_dir: Option<PathBuf>, monitor: ResourceMonitor) -> Self {
        Self {
            binary: binary.into(),
            data_dir,
            monitor,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Build the converter argv. Pure and deterministic.
    ///
    /// Layout: `<binary> [--data-dir=D] <options…> <input> -t <format> -o <output> [--self-contained]`.
    pub fn build_command(
        &self,
        input: &Path,
        output: &Path,
        format: &str,
        options: &AdvancedOptions,
        self_contained: bool,
    ) -> Vec<String> {
        let mut argv = vec![self.binary.clone()];
        if let Some(ref dir) = self.data_dir {
            argv.push(format!("--data-dir={}", dir.display()));
        }
        argv.extend(options.as_slice().iter().cloned());
        argv.push(input.display().to_string());
        argv.push("-t".to_string());
        argv.push(format.to_string());
        argv.push("-o".to_string());
        argv.push(output.display().to_string());
        if self_contained {
            argv.push("--self-contained".to_string());
        }
        argv
    }

    /// Check the converter runs and its data directory is readable.
    ///
    /// Returns the first line of `<binary> --version`.
    pub async fn preflight(&self) -> Result<String, DocConvError> {
        let missing = |detail: String, hint: &str| DocConvError::ConverterMissingResources {
            binary: self.binary.clone(),
            detail,
            hint: format!("Hint: {hint}"),
        };

        if let Some(ref dir) = self.data_dir {
            if let Err(e) = std::fs::read_dir(dir) {
                return Err(missing(
                    format!("data directory '{}' is not readable: {e}", dir.display()),
                    "point --data-dir at the converter's data files or unset it",
                ));
            }
        }

        let run = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(PREFLIGHT_TIMEOUT, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(missing(
                    "executable not found".into(),
                    "install pandoc (https://pandoc.org/installing.html) or pass --converter <path>",
                ))
            }
            Ok(Err(e)) => return Err(missing(format!("could not start: {e}"), "check the converter path and permissions")),
            Err(_) => {
                return Err(missing(
                    format!("`--version` did not answer within {}s", PREFLIGHT_TIMEOUT.as_secs()),
                    "the converter appears to hang; check its installation",
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(missing(
                format!("`--version` exited with {}: {}", output.status, stderr.trim()),
                "the converter installation looks broken; reinstall it",
            ));
        }

        let version = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("unknown")
            .trim()
            .to_string();
        debug!("Converter pre-flight ok: {version}");
        Ok(version)
    }

    /// Run `argv` in `work_dir` under memory supervision and a timeout.
    ///
    /// `label` names the attempt in logs and log files (e.g. `chunk_3`).
    /// Spawn failures are returned as errors; every other ending is an
    /// [`ExecutionResult`].
    pub async fn execute(
        &self,
        argv: &[String],
        work_dir: &Path,
        memory_limit_mb: u64,
        timeout: Duration,
        label: &str,
    ) -> Result<ExecutionResult, DocConvError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DocConvError::Internal("empty converter command".into()))?;

        let stdout_log = work_dir.join(format!("converter_stdout_{label}.log"));
        let stderr_log = work_dir.join(format!("converter_stderr_{label}.log"));
        let log_file = |path: &Path| {
            std::fs::File::create(path).map_err(|e| DocConvError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })
        };
        let stdout = log_file(&stdout_log)?;
        let stderr = log_file(&stderr_log)?;

        info!("Executing converter for {label}: {}", argv.join(" "));
        let start = Instant::now();

        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DocConvError::ConverterMissingResources {
                        binary: program.clone(),
                        detail: "executable not found".into(),
                        hint: "Hint: install the converter or pass --converter <path>".into(),
                    }
                } else {
                    DocConvError::Internal(format!("Failed to start converter: {e}"))
                }
            })?;

        // The guard cancels the token on every exit path, so the supervisor
        // never outlives the wait below.
        let exited = CancellationToken::new();
        let _exit_guard = exited.clone().drop_guard();
        let supervisor = child.id().map(|pid| {
            tokio::spawn(
                self.monitor
                    .clone()
                    .supervise(pid, memory_limit_mb, exited.clone()),
            )
        });

        let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status, false),
            Err(_) => {
                error!("Converter timeout for {label} after {}s, terminating process", timeout.as_secs());
                (self.terminate(&mut child).await, true)
            }
        };
        exited.cancel();

        let verdict = match supervisor {
            Some(handle) => handle.await.unwrap_or(Supervision::Completed),
            None => Supervision::Completed,
        };
        let status = status.map_err(|e| DocConvError::Internal(format!("Failed to wait for converter: {e}")))?;

        let kind = classify(status, timed_out, verdict);
        match kind {
            ExitKind::Success => info!("Converter successful for {label}"),
            ExitKind::KilledForMemory { .. } => error!("Converter terminated due to memory limit for {label}"),
            ExitKind::TimedOut => error!("Converter timed out for {label}"),
            ExitKind::Failed { exit_code } => {
                let mut excerpt = read_log_head(&stderr_log, MAX_DIAGNOSTIC_BYTES);
                truncate_at_char_boundary(&mut excerpt, 500);
                error!("Converter failed for {label} with exit code {exit_code}: {excerpt}");
            }
        }

        Ok(ExecutionResult {
            kind,
            stdout_log,
            stderr_log,
            duration: start.elapsed(),
        })
    }

    /// SIGTERM, wait the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        if let Some(pid) = child.id() {
            send_terminate(pid);
        }
        match tokio::time::timeout(self.monitor.grace_period(), child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("Converter ignored SIGTERM, killing");
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

fn classify(status: ExitStatus, timed_out: bool, verdict: Supervision) -> ExitKind {
    if timed_out {
        return ExitKind::TimedOut;
    }
    if let Supervision::Exceeded { rss_mb } = verdict {
        return ExitKind::KilledForMemory { rss_mb: Some(rss_mb) };
    }
    if status.success() {
        return ExitKind::Success;
    }
    if let Some(code) = status.code() {
        return ExitKind::Failed { exit_code: code };
    }
    signal_kind(status)
}

#[cfg(unix)]
fn signal_kind(status: ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        // SIGKILL from the OOM killer, SIGTERM from an external memory guard.
        Some(9) | Some(15) => ExitKind::KilledForMemory { rss_mb: None },
        Some(sig) => ExitKind::Failed { exit_code: -sig },
        None => ExitKind::Failed { exit_code: -1 },
    }
}

#[cfg(not(unix))]
fn signal_kind(_status: ExitStatus) -> ExitKind {
    ExitKind::Failed { exit_code: -1 }
}

/// Read at most `limit` bytes of a log file, lossily decoded.
fn read_log_head(path: &Path, limit: u64) -> String {
    let mut buf = Vec::new();
    match std::fs::File::open(path) {
        Ok(f) => {
            if let Err(e) = f.take(limit).read_to_end(&mut buf) {
                debug!("Could not read {}: {e}", path.display());
            }
        }
        Err(_) => return String::new(),
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ConverterExecutor {
        ConverterExecutor::new(
            "pandoc",
            None,
            ResourceMonitor::new(Duration::from_millis(100), Duration::from_millis(300)),
        )
    }

    #[test]
    fn build_command_layout() {
        let opts = AdvancedOptions::parse("--standalone --toc").unwrap();
        let argv = executor().build_command(
            Path::new("/w/in.html"),
            Path::new("/w/in.md"),
            "markdown+smart",
            &opts,
            true,
        );
        assert_eq!(
            argv,
            [
                "pandoc",
                "--standalone",
                "--toc",
                "/w/in.html",
                "-t",
                "markdown+smart",
                "-o",
                "/w/in.md",
                "--self-contained"
            ]
        );
    }

    #[test]
    fn build_command_is_deterministic_and_adds_data_dir() {
        let ex = ConverterExecutor::new(
            "pandoc",
            Some(PathBuf::from("/opt/pandoc-data")),
            ResourceMonitor::new(Duration::from_secs(1), Duration::from_secs(2)),
        );
        let a = ex.build_command(Path::new("a"), Path::new("b"), "plain", &AdvancedOptions::default(), false);
        let b = ex.build_command(Path::new("a"), Path::new("b"), "plain", &AdvancedOptions::default(), false);
        assert_eq!(a, b);
        assert_eq!(a[1], "--data-dir=/opt/pandoc-data");
        assert!(!a.contains(&"--self-contained".to_string()));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "é".repeat(10);
        truncate_at_char_boundary(&mut s, 5);
        assert_eq!(s, "éé");
    }

    #[tokio::test]
    async fn preflight_reports_missing_binary() {
        let ex = ConverterExecutor::new(
            "definitely-not-a-real-converter-binary",
            None,
            ResourceMonitor::new(Duration::from_secs(1), Duration::from_secs(2)),
        );
        let err = ex.preflight().await.unwrap_err();
        assert!(matches!(err, DocConvError::ConverterMissingResources { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_captures_failure_and_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let argv: Vec<String> = ["sh", "-c", "echo 'bad input at line 3' >&2; exit 64"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = executor()
            .execute(&argv, dir.path(), 4096, Duration::from_secs(10), "single")
            .await
            .unwrap();
        assert_eq!(result.kind, ExitKind::Failed { exit_code: 64 });
        assert!(result.stderr_excerpt().contains("bad input"));
        let err = result.to_error(4096, Duration::from_secs(10)).unwrap();
        assert!(err.to_string().contains("malformed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let argv: Vec<String> = ["sleep", "30"].iter().map(|s| s.to_string()).collect();
        let start = Instant::now();
        let result = executor()
            .execute(&argv, dir.path(), 4096, Duration::from_millis(300), "chunk_1")
            .await
            .unwrap();
        assert_eq!(result.kind, ExitKind::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            result.to_chunk_error(1),
            Some(ChunkError::ResourceExceeded { kind: ResourceKind::Timeout, .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_kills_for_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let argv: Vec<String> = ["sleep", "30"].iter().map(|s| s.to_string()).collect();
        let start = Instant::now();
        // A zero-MB ceiling is crossed by any live process.
        let result = executor()
            .execute(&argv, dir.path(), 0, Duration::from_secs(20), "chunk_2")
            .await
            .unwrap();
        assert!(matches!(result.kind, ExitKind::KilledForMemory { rss_mb: Some(_) }));
        // poll interval + grace period, with scheduling slack
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(matches!(
            result.to_error(0, Duration::from_secs(20)),
            Some(DocConvError::ResourceExceeded { kind: ResourceKind::Memory, .. })
        ));
    }
}
