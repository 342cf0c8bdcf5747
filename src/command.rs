//! Running external programs.
//!
//! Every external process this crate launches — the VCS tool, the AI
//! assistant, a quality-check command — goes through [`CommandRunner`]. That
//! keeps subprocess invocation behind one seam so tests can substitute a
//! deterministic fake with zero real I/O.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// A program failed, or could not be started at all.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub message: String,
    pub exit_code: Option<i32>,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "`{} {}` failed in {}: {}",
            self.program,
            self.args.join(" "),
            self.workdir.display(),
            self.message
        )
    }
}

impl std::error::Error for CommandError {}

/// Capability to run an external program in a working directory.
///
/// Implementations must not retain any state that would make two calls with
/// the same arguments behave differently (beyond the state of the external
/// world itself) — the phase executor and VCS context rely on this being a
/// pure "do the thing" seam.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` in `workdir`. Returns trimmed stdout on
    /// success, a [`CommandError`] on non-zero exit or spawn failure.
    fn run(&self, workdir: &Path, program: &str, args: &[&str]) -> Result<String, CommandError>;

    /// Run `program` with a bound on wall-clock time. The default
    /// implementation ignores the timeout and delegates to [`run`](Self::run);
    /// [`SystemCommandRunner`] overrides it to actually enforce the bound.
    fn run_timeout(
        &self,
        workdir: &Path,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> Result<String, CommandError> {
        self.run(workdir, program, args)
    }

    /// Run `program` with `args` in `workdir`, writing `stdin` to the
    /// child's standard input, bounded by `timeout`. Used for the AI
    /// assistant invocation, which takes its prompt on stdin.
    fn run_with_stdin(
        &self,
        workdir: &Path,
        program: &str,
        args: &[&str],
        stdin: &str,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let _ = stdin;
        self.run_timeout(workdir, program, args, timeout)
    }
}

/// Default [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

fn cmd_str(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

fn finish(
    workdir: &Path,
    program: &str,
    args: &[&str],
    started: Instant,
    output: std::io::Result<std::process::Output>,
) -> Result<String, CommandError> {
    let elapsed = started.elapsed();
    match output {
        Ok(output) if output.status.success() => {
            log::debug!(
                "$ {} [workdir={}] ok dur={:?}",
                cmd_str(program, args),
                workdir.display(),
                elapsed
            );
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let message = if !stderr.is_empty() {
                stderr
            } else if !stdout.is_empty() {
                stdout
            } else {
                format!("exited with status {}", output.status)
            };
            log::debug!(
                "$ {} [workdir={}] err dur={:?} msg={message:?}",
                cmd_str(program, args),
                workdir.display(),
                elapsed
            );
            Err(CommandError {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                workdir: workdir.to_path_buf(),
                message,
                exit_code: output.status.code(),
            })
        }
        Err(e) => {
            log::debug!(
                "$ {} [workdir={}] spawn-err dur={:?} err={e}",
                cmd_str(program, args),
                workdir.display(),
                elapsed
            );
            Err(CommandError {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                workdir: workdir.to_path_buf(),
                message: e.to_string(),
                exit_code: None,
            })
        }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, workdir: &Path, program: &str, args: &[&str]) -> Result<String, CommandError> {
        log::debug!("$ {} [workdir={}]", cmd_str(program, args), workdir.display());
        let started = Instant::now();
        let output = Command::new(program).args(args).current_dir(workdir).output();
        finish(workdir, program, args, started, output)
    }

    fn run_timeout(
        &self,
        workdir: &Path,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, CommandError> {
        log::debug!(
            "$ {} [workdir={}] timeout={:?}",
            cmd_str(program, args),
            workdir.display(),
            timeout
        );
        let started = Instant::now();
        let mut child = match Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return finish(workdir, program, args, started, Err(e)),
        };
        match child.wait_timeout(timeout) {
            Ok(Some(_)) => {
                let output = child.wait_with_output();
                finish(workdir, program, args, started, output)
            }
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                log::debug!(
                    "$ {} [workdir={}] timed out after {:?}",
                    cmd_str(program, args),
                    workdir.display(),
                    timeout
                );
                Err(CommandError {
                    program: program.to_string(),
                    args: args.iter().map(|s| s.to_string()).collect(),
                    workdir: workdir.to_path_buf(),
                    message: format!("timed out after {timeout:?}"),
                    exit_code: None,
                })
            }
            Err(e) => finish(workdir, program, args, started, Err(e)),
        }
    }

    fn run_with_stdin(
        &self,
        workdir: &Path,
        program: &str,
        args: &[&str],
        stdin: &str,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        use std::io::Write;

        log::debug!(
            "$ {} [workdir={}] timeout={:?} stdin_len={}",
            cmd_str(program, args),
            workdir.display(),
            timeout,
            stdin.len()
        );
        let started = Instant::now();
        let mut child = match Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return finish(workdir, program, args, started, Err(e)),
        };

        if let Some(mut pipe) = child.stdin.take() {
            if let Err(e) = pipe.write_all(stdin.as_bytes()) {
                let _ = child.kill();
                let _ = child.wait();
                return finish(workdir, program, args, started, Err(e));
            }
        }

        match child.wait_timeout(timeout) {
            Ok(Some(_)) => {
                let output = child.wait_with_output();
                finish(workdir, program, args, started, output)
            }
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(CommandError {
                    program: program.to_string(),
                    args: args.iter().map(|s| s.to_string()).collect(),
                    workdir: workdir.to_path_buf(),
                    message: format!("timed out after {timeout:?}"),
                    exit_code: None,
                })
            }
            Err(e) => finish(workdir, program, args, started, Err(e)),
        }
    }
}

/// A zero-I/O fake for tests: scripted responses keyed by `(program, args)`.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeCommandRunner {
        responses: Mutex<HashMap<(String, Vec<String>), VecDeque<Result<String, CommandError>>>>,
        pub calls: Mutex<Vec<(PathBuf, String, Vec<String>)>>,
    }

    impl FakeCommandRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response for `(program, args)`. Calling this more than
        /// once for the same key queues successive responses, returned in
        /// order on successive calls; a single stub keeps returning the same
        /// response for every call.
        pub fn stub(&self, program: &str, args: &[&str], result: Result<String, CommandError>) {
            self.responses
                .lock()
                .unwrap()
                .entry((
                    program.to_string(),
                    args.iter().map(|s| s.to_string()).collect(),
                ))
                .or_default()
                .push_back(result);
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl CommandRunner for FakeCommandRunner {
        fn run(&self, workdir: &Path, program: &str, args: &[&str]) -> Result<String, CommandError> {
            self.calls.lock().unwrap().push((
                workdir.to_path_buf(),
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            let key = (
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            );
            let mut responses = self.responses.lock().unwrap();
            let response = match responses.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            response.unwrap_or_else(|| {
                Err(CommandError {
                    program: program.to_string(),
                    args: args.iter().map(|s| s.to_string()).collect(),
                    workdir: workdir.to_path_buf(),
                    message: "no stubbed response".to_string(),
                    exit_code: None,
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeCommandRunner;
    use super::*;

    #[test]
    fn system_runner_trims_stdout_on_success() {
        let runner = SystemCommandRunner;
        let out = runner
            .run(Path::new("."), "printf", &["hello\n"])
            .expect("printf should succeed");
        assert_eq!(out, "hello");
    }

    #[test]
    fn system_runner_surfaces_stderr_on_failure() {
        let runner = SystemCommandRunner;
        let err = runner
            .run(Path::new("."), "sh", &["-c", "echo boom >&2; exit 3"])
            .unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn fake_runner_records_calls_and_returns_stub() {
        let fake = FakeCommandRunner::new();
        fake.stub("git", &["status"], Ok("clean".to_string()));
        let out = fake.run(Path::new("/repo"), "git", &["status"]).unwrap();
        assert_eq!(out, "clean");
        assert_eq!(fake.call_count(), 1);
    }

    #[test]
    fn fake_runner_errors_on_unstubbed_call() {
        let fake = FakeCommandRunner::new();
        let err = fake.run(Path::new("/repo"), "git", &["status"]).unwrap_err();
        assert_eq!(err.message, "no stubbed response");
    }
}
