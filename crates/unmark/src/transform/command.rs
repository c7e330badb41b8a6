//! A transform that delegates to an external program.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::{TransformContext, TransformError, VideoTransform};
use crate::config::TransformConfig;

const STDERR_TAIL_LINES: usize = 20;

/// Runs a configured program once per job.
///
/// `{input}`, `{output}` and `{work_dir}` in the arguments are replaced
/// with the job's paths. Every stdout line that is an integer (optionally
/// followed by `%`) is reported as progress.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
    poll_interval: Duration,
}

impl CommandTransform {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn from_config(config: &TransformConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn build_args(&self, input: &Path, output: &Path, work_dir: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let work_dir = work_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{work_dir}", &work_dir)
            })
            .collect()
    }
}

impl VideoTransform for CommandTransform {
    fn run(
        &self,
        input: &Path,
        output: &Path,
        ctx: &TransformContext,
    ) -> Result<(), TransformError> {
        ctx.checkpoint()?;

        let args = self.build_args(input, output, ctx.work_dir());
        debug!(program = %self.program, ?args, "Spawning transform");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .current_dir(ctx.work_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut command);
        let mut child = command
            .spawn()
            .map_err(|source| TransformError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (waited, stderr_tail) = thread::scope(|s| {
            let stdout_reader = s.spawn(move || {
                if let Some(stdout) = stdout {
                    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                        if let Some(percent) = parse_percent(&line) {
                            ctx.report_progress(percent);
                        }
                    }
                }
            });
            let stderr_reader = s.spawn(move || stderr.map(read_tail).unwrap_or_default());

            let waited = wait_or_cancel(&mut child, ctx, self.poll_interval);

            let _ = stdout_reader.join();
            let tail = stderr_reader.join().unwrap_or_default();
            (waited, tail)
        });

        let status = match waited {
            Ok(Some(status)) => status,
            Ok(None) => return Err(TransformError::Cancelled),
            Err(source) => {
                return Err(TransformError::Io {
                    path: input.to_path_buf(),
                    source,
                })
            }
        };

        if !status.success() {
            let detail = if stderr_tail.is_empty() {
                String::new()
            } else {
                format!(": {}", stderr_tail.join("\n"))
            };
            return Err(TransformError::Failed(format!(
                "'{}' exited with {}{}",
                self.program, status, detail
            )));
        }

        if !output.exists() {
            return Err(TransformError::Failed(format!(
                "'{}' exited successfully but produced no output at '{}'",
                self.program,
                output.display()
            )));
        }

        ctx.report_progress(100);
        Ok(())
    }
}

/// Polls the child until it exits. Returns `Ok(None)` if the job was
/// cancelled, in which case the child has been killed and reaped.
fn wait_or_cancel(
    child: &mut Child,
    ctx: &TransformContext,
    poll_interval: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if ctx.is_cancelled() {
            kill_process_tree(child);
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(poll_interval);
    }
}

/// Puts the child in a new process group so it can be killed together
/// with anything it spawns.
#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// Kills the child's whole process group. Descendants holding the output
/// pipes would otherwise keep the readers blocked after the child is gone.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        match i32::try_from(child.id()) {
            Ok(pid) => match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) => return,
                Err(e) => warn!("Failed to kill transform process group {}: {}", pid, e),
            },
            Err(_) => warn!("Transform pid {} out of range", child.id()),
        }
    }
    if let Err(e) = child.kill() {
        warn!("Failed to kill cancelled transform: {}", e);
    }
}

fn read_tail(stream: impl Read) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for line in BufReader::new(stream).lines().map_while(Result::ok) {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

fn parse_percent(line: &str) -> Option<u8> {
    let trimmed = line.trim();
    let digits = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    digits.parse::<u32>().ok().map(|p| p.min(100) as u8)
}
