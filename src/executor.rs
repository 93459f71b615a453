use std::{
    path::Path,
    process::Stdio,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::Notify,
};

use crate::{config::Config, language::Language, Error, Result};

// How long to keep reading pipes once the child is gone. A descendant that
// escaped the process group can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub output_limit_exceeded: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub timeout: Duration,
    pub output_limit: usize,
}

#[derive(Debug, Clone)]
pub struct Executor {
    config: Config,
}

enum Outcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    OutputLimit,
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Executor { config }
    }

    pub fn default_limits(&self) -> Limits {
        Limits {
            timeout: self.config.timeout,
            output_limit: self.config.output_limit,
        }
    }

    pub fn command(&self, language: Language, source: &Path, workdir: &Path) -> Command {
        let mut cmd = Command::new(self.config.interpreter(language));

        match language {
            Language::Python => {
                cmd.args(&["-X", "utf8"]);
            }
            Language::JavaScript => {}
        }

        cmd.arg(source)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        lead_process_group(&mut cmd);

        cmd
    }

    pub async fn run(&self, language: Language, source: &Path, workdir: &Path) -> Result<ProcessOutput> {
        self.run_with_limits(language, source, workdir, &self.default_limits())
            .await
    }

    pub async fn run_with_limits(
        &self,
        language: Language,
        source: &Path,
        workdir: &Path,
        limits: &Limits,
    ) -> Result<ProcessOutput> {
        let mut command = self.command(language, source, workdir);
        log::debug!("Execution command is {:?}", command);

        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| Error::UnableToStartInterpreter {
            program: self.config.interpreter(language).to_path_buf(),
            source: e,
        })?;

        let pgid = child.id();

        let budget = Arc::new(OutputBudget::new(limits.output_limit));
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));

        let stdout = child.stdout.take().ok_or(Error::UnableToCaptureOutput)?;
        let stderr = child.stderr.take().ok_or(Error::UnableToCaptureOutput)?;
        let mut readers = vec![
            tokio::spawn(drain(stdout, budget.clone(), stdout_buf.clone())),
            tokio::spawn(drain(stderr, budget.clone(), stderr_buf.clone())),
        ];

        let outcome = tokio::select! {
            status = child.wait() => {
                Outcome::Exited(status.map_err(|e| Error::UnableToWaitForInterpreter { source: e })?)
            }
            _ = budget.exhausted() => Outcome::OutputLimit,
            _ = tokio::time::sleep(limits.timeout) => Outcome::TimedOut,
        };

        // Also takes down descendants still running after a normal exit.
        kill_process_group(pgid);
        if !matches!(outcome, Outcome::Exited(_)) {
            if let Err(e) = child.kill().await {
                log::debug!("Unable to kill interpreter: {}", e);
            }
        }

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            for reader in readers.iter_mut() {
                match reader.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("Error reading interpreter output: {}", e),
                    Err(e) => log::warn!("Output reader failed: {}", e),
                }
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("Interpreter output pipes still open, abandoning them");
            for reader in &readers {
                reader.abort();
            }
        }

        let mut output = assemble(
            outcome,
            budget.overflowed(),
            take_lossy(&stdout_buf),
            take_lossy(&stderr_buf),
            limits,
        );
        output.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(output)
    }
}

/// Builds the reported output once both pipes are drained.
///
/// The child can exit before the reader that overflowed the budget gets to
/// signal it, so the ceiling is judged from the budget itself rather than
/// from which branch of the race won.
fn assemble(outcome: Outcome, overflowed: bool, stdout: String, mut stderr: String, limits: &Limits) -> ProcessOutput {
    let mut output = ProcessOutput::default();
    let hit_limit = overflowed || matches!(outcome, Outcome::OutputLimit);

    match outcome {
        Outcome::Exited(status) => {
            output.exit_code = status.code();
            if !status.success() {
                log::debug!("Interpreter exited with {}", status);
            }
        }
        Outcome::TimedOut => {
            output.timed_out = true;
            stderr = format!(
                "Execution timeout: Code took too long to execute ({}s limit)",
                limits.timeout.as_secs_f64()
            );
        }
        Outcome::OutputLimit => {}
    }

    if hit_limit {
        output.output_limit_exceeded = true;
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "Output limit exceeded: more than {} bytes written",
            limits.output_limit
        ));
    }

    output.stdout = stdout;
    output.stderr = stderr;
    output
}

/// Puts the child in a fresh process group so a kill reaches its descendants.
#[cfg(unix)]
fn lead_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn lead_process_group(_cmd: &mut Command) {}

/// Kills everything in the process group led by the child.
#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        let rc = unsafe { libc::kill(-(pgid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                log::debug!("Unable to signal process group {}: {}", pgid, err);
            }
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}

/// Byte allowance shared by stdout and stderr.
struct OutputBudget {
    limit: usize,
    used: AtomicUsize,
    exhausted: Notify,
}

impl OutputBudget {
    fn new(limit: usize) -> Self {
        OutputBudget {
            limit,
            used: AtomicUsize::new(0),
            exhausted: Notify::new(),
        }
    }

    /// Claims up to `n` bytes and returns how many may be kept.
    fn reserve(&self, n: usize) -> usize {
        let prev = self.used.fetch_add(n, Ordering::SeqCst);
        if prev >= self.limit {
            0
        } else {
            n.min(self.limit - prev)
        }
    }

    /// True once any output had to be dropped.
    fn overflowed(&self) -> bool {
        self.used.load(Ordering::SeqCst) > self.limit
    }

    async fn exhausted(&self) {
        self.exhausted.notified().await
    }
}

async fn drain<R>(mut reader: R, budget: Arc<OutputBudget>, sink: Arc<Mutex<Vec<u8>>>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }

        let allowed = budget.reserve(n);
        sink.lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(&chunk[..allowed]);

        if allowed < n {
            budget.exhausted.notify_one();
            return Ok(());
        }
    }
}

fn take_lossy(buf: &Mutex<Vec<u8>>) -> String {
    let bytes = std::mem::take(&mut *buf.lock().unwrap_or_else(|e| e.into_inner()));
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use lazy_static::lazy_static;
    use std::fs;
    use tempdir::TempDir;

    lazy_static! {
        static ref CONFIG: Config = Config::default();
        static ref HAS_NODE: bool = interpreter_works(Language::JavaScript);
        static ref HAS_PYTHON: bool = interpreter_works(Language::Python);
    }

    fn interpreter_works(language: Language) -> bool {
        std::process::Command::new(CONFIG.interpreter(language))
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(language: Language, code: &str, limits: Limits) -> ProcessOutput {
        let dir = TempDir::new("executor").unwrap();
        let source = dir.path().join(format!("main.{}", language.file_extension()));
        fs::write(&source, code).unwrap();

        Executor::new(CONFIG.clone())
            .run_with_limits(language, &source, dir.path(), &limits)
            .await
            .expect("Unable to execute code")
    }

    fn limits() -> Limits {
        Limits {
            timeout: Duration::from_secs(10),
            output_limit: 1024 * 1024,
        }
    }

    #[test]
    fn budget_is_shared_and_capped() {
        let budget = OutputBudget::new(10);
        assert_eq!(budget.reserve(4), 4);
        assert_eq!(budget.reserve(4), 4);
        assert_eq!(budget.reserve(4), 2);
        assert_eq!(budget.reserve(1), 0);
    }

    #[test]
    fn filling_the_budget_exactly_is_not_an_overflow() {
        let budget = OutputBudget::new(8);
        assert_eq!(budget.reserve(8), 8);
        assert!(!budget.overflowed());
        assert_eq!(budget.reserve(1), 0);
        assert!(budget.overflowed());
    }

    #[cfg(unix)]
    #[test]
    fn overflow_is_reported_even_when_the_exit_wins_the_race() {
        use std::os::unix::process::ExitStatusExt;

        let out = assemble(
            Outcome::Exited(std::process::ExitStatus::from_raw(0)),
            true,
            "xxxx".to_string(),
            "warn".to_string(),
            &Limits {
                timeout: Duration::from_secs(1),
                output_limit: 4,
            },
        );

        assert!(out.output_limit_exceeded);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stderr, "warn\nOutput limit exceeded: more than 4 bytes written");
    }

    #[test]
    fn python_is_invoked_with_an_argument_vector() {
        let executor = Executor::new(Config::default());
        let cmd = executor.command(Language::Python, Path::new("/s/x; rm -rf.py"), Path::new("/s"));
        let rendered = format!("{:?}", cmd);
        assert!(rendered.contains("\"-X\""));
        assert!(rendered.contains("\"/s/x; rm -rf.py\""));
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        if !*HAS_NODE {
            eprintln!("skipping: node not available");
            return;
        }
        let out = run(
            Language::JavaScript,
            "console.log('out'); console.error('err')",
            limits(),
        )
        .await;

        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        if !*HAS_PYTHON {
            eprintln!("skipping: python not available");
            return;
        }
        let out = run(Language::Python, "import sys\nsys.exit('boom')", limits()).await;

        assert_eq!(out.exit_code, Some(1));
        assert!(out.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn infinite_loop_is_killed_at_the_timeout() {
        if !*HAS_PYTHON {
            eprintln!("skipping: python not available");
            return;
        }
        let started = Instant::now();
        let out = run(
            Language::Python,
            "print('partial', flush=True)\nwhile True:\n    pass\n",
            Limits {
                timeout: Duration::from_secs(1),
                ..limits()
            },
        )
        .await;

        assert!(out.timed_out);
        assert!(out.stderr.starts_with("Execution timeout"));
        assert_eq!(out.stdout, "partial\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn runaway_output_hits_the_ceiling() {
        if !*HAS_NODE {
            eprintln!("skipping: node not available");
            return;
        }
        let out = run(
            Language::JavaScript,
            "while (true) { console.log('x'.repeat(1000)); }",
            Limits {
                output_limit: 64 * 1024,
                ..limits()
            },
        )
        .await;

        assert!(out.output_limit_exceeded);
        assert!(!out.timed_out);
        assert!(out.stdout.len() <= 64 * 1024);
        assert!(out.stderr.contains("Output limit exceeded"));
    }

    #[tokio::test]
    async fn short_burst_over_the_ceiling_is_flagged() {
        if !*HAS_PYTHON {
            eprintln!("skipping: python not available");
            return;
        }
        // Exits straight after writing, racing the overflow notification.
        for _ in 0..5 {
            let out = run(
                Language::Python,
                "import sys\nsys.stdout.write('x' * 4096)\n",
                Limits {
                    output_limit: 1024,
                    ..limits()
                },
            )
            .await;

            assert!(out.output_limit_exceeded);
            assert_eq!(out.stdout.len(), 1024);
            assert!(out.stderr.contains("Output limit exceeded"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_leads_its_own_process_group() {
        if !*HAS_PYTHON {
            eprintln!("skipping: python not available");
            return;
        }
        let out = run(Language::Python, "import os\nprint(os.getpgid(0) == os.getpid())\n", limits()).await;

        assert_eq!(out.stdout, "True\n");
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_internal_error() {
        let dir = TempDir::new("executor").unwrap();
        let source = dir.path().join("main.js");
        fs::write(&source, "1").unwrap();

        let config = Config {
            node: "/nonexistent/node".into(),
            ..Config::default()
        };
        let err = Executor::new(config)
            .run(Language::JavaScript, &source, dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnableToStartInterpreter { .. }));
    }
}
