/// External firmware toolchain (arduino-cli)
///
/// Each call runs one process with stdout/stderr captured and forwarded to the
/// log, a hard timeout, and cooperative cancellation. A non-zero exit is not
/// an error at this layer; callers decide what it means for their stage.

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_CLI: &str = "arduino-cli";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out after {} s", .after.as_secs_f32())]
    TimedOut { after: Duration },
    #[error("Cancelled")]
    Cancelled,
    #[error("Lost track of tool process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Shared cancellation flag, checked while a tool runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunLimits<'a> {
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// What to show the operator: stderr if the tool wrote any, else stdout.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

pub trait Toolchain: Send {
    fn list_boards(&self, limits: &RunLimits) -> Result<ToolOutput, ToolError>;
    fn install_core(&self, package: &str, limits: &RunLimits) -> Result<ToolOutput, ToolError>;
    fn install_library(&self, library: &str, limits: &RunLimits) -> Result<ToolOutput, ToolError>;
    fn compile(&self, fqbn: &str, sketch: &Path, limits: &RunLimits) -> Result<ToolOutput, ToolError>;
    fn upload(&self, port: &str, fqbn: &str, sketch: &Path, limits: &RunLimits) -> Result<ToolOutput, ToolError>;
}

/// Does a `board list` listing have a row whose port column is exactly `port`?
pub fn board_list_has_port(listing: &str, port: &str) -> bool {
    listing
        .lines()
        .any(|line| line.split_whitespace().next() == Some(port))
}

#[derive(Debug, Clone)]
pub struct ArduinoCli {
    program: PathBuf,
}

impl Default for ArduinoCli {
    fn default() -> Self {
        Self::new(DEFAULT_CLI)
    }
}

impl ArduinoCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run<I, S>(&self, args: I, limits: &RunLimits) -> Result<ToolOutput, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        run_tool(cmd, limits)
    }
}

impl Toolchain for ArduinoCli {
    fn list_boards(&self, limits: &RunLimits) -> Result<ToolOutput, ToolError> {
        self.run(["board", "list"], limits)
    }

    fn install_core(&self, package: &str, limits: &RunLimits) -> Result<ToolOutput, ToolError> {
        self.run(["core", "install", package], limits)
    }

    fn install_library(&self, library: &str, limits: &RunLimits) -> Result<ToolOutput, ToolError> {
        self.run(["lib", "install", library], limits)
    }

    fn compile(&self, fqbn: &str, sketch: &Path, limits: &RunLimits) -> Result<ToolOutput, ToolError> {
        self.run([OsStr::new("compile"), OsStr::new("--fqbn"), OsStr::new(fqbn), sketch.as_os_str()], limits)
    }

    fn upload(&self, port: &str, fqbn: &str, sketch: &Path, limits: &RunLimits) -> Result<ToolOutput, ToolError> {
        self.run(
            [
                OsStr::new("upload"),
                OsStr::new("-p"),
                OsStr::new(port),
                OsStr::new("--fqbn"),
                OsStr::new(fqbn),
                sketch.as_os_str(),
            ],
            limits,
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Forward each line of `stream` to `lines` until EOF.
fn capture<R: Read + Send + 'static>(stream: R, which: Stream, lines: Sender<(Stream, String)>) {
    let target = match which {
        Stream::Stdout => "toolchain::stdout",
        Stream::Stderr => "toolchain::stderr",
    };
    thread::spawn(move || {
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            debug!(target: target, "{}", line);
            if lines.send((which, line)).is_err() {
                break;
            }
        }
    });
}

/// Kill the tool and everything it started.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child leads its own process group, so this reaches grandchildren too.
        if let Ok(pgid) = i32::try_from(child.id()) {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Run `cmd` to completion, killing it on timeout or cancellation.
///
/// The deadline covers both the process and its output: a tool that exits
/// while something it spawned still holds the pipes open is not finished.
pub fn run_tool(mut cmd: Command, limits: &RunLimits) -> Result<ToolOutput, ToolError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
    info!(target: "toolchain", "Running {} {}", program, args.join(" "));

    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = cmd.spawn().map_err(|source| ToolError::Spawn { program: program.clone(), source })?;

    let (tx, lines) = unbounded();
    if let Some(out) = child.stdout.take() {
        capture(out, Stream::Stdout, tx.clone());
    }
    if let Some(err) = child.stderr.take() {
        capture(err, Stream::Stderr, tx.clone());
    }
    drop(tx);

    let started = Instant::now();
    let deadline = started + limits.timeout;
    let mut output = ToolOutput::default();
    let mut status = None;
    loop {
        if limits.cancel.is_cancelled() {
            warn!(target: "toolchain", "Cancelling {} (PID {})", program, child.id());
            terminate(&mut child);
            return Err(ToolError::Cancelled);
        }
        if status.is_none() {
            match child.try_wait() {
                Ok(exited) => status = exited,
                Err(e) => {
                    terminate(&mut child);
                    return Err(ToolError::Wait(e));
                }
            }
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(target: "toolchain", "{} exceeded {:?}, killing PID {}", program, limits.timeout, child.id());
            terminate(&mut child);
            return Err(ToolError::TimedOut { after: limits.timeout });
        }
        match lines.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
            Ok((Stream::Stdout, line)) => {
                output.stdout.push_str(&line);
                output.stdout.push('\n');
            }
            Ok((Stream::Stderr, line)) => {
                output.stderr.push_str(&line);
                output.stderr.push('\n');
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => match status {
                Some(_) => break,
                None => thread::sleep(POLL_INTERVAL.min(deadline - now)),
            },
        }
    }

    output.code = status.and_then(|s| s.code());
    info!(target: "toolchain", "{} exited with {:?} after {:.1} s", program, output.code, started.elapsed().as_secs_f32());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "Port         Protocol Type              Board Name FQBN Core\n\
                           /dev/ttyUSB10 serial  Serial Port (USB) Unknown\n\
                           /dev/ttyS0   serial   Serial Port       Unknown\n";

    #[test]
    fn test_board_list_matches_port_column_exactly() {
        assert!(board_list_has_port(LISTING, "/dev/ttyUSB10"));
        assert!(board_list_has_port(LISTING, "/dev/ttyS0"));
        assert!(!board_list_has_port(LISTING, "/dev/ttyUSB1"));
        assert!(!board_list_has_port(LISTING, "serial"));
        assert!(!board_list_has_port("", "/dev/ttyS0"));
    }

    #[test]
    fn test_diagnostics_prefers_stderr() {
        let out = ToolOutput { code: Some(1), stdout: "building\n".into(), stderr: "  error: no Servo.h\n".into() };
        assert_eq!(out.diagnostics(), "error: no Servo.h");
        let out = ToolOutput { code: Some(1), stdout: "only stdout\n".into(), stderr: " \n".into() };
        assert_eq!(out.diagnostics(), "only stdout");
        assert!(!out.success());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let cancel = CancelToken::new();
        let limits = RunLimits { timeout: Duration::from_secs(5), cancel: &cancel };
        let cli = ArduinoCli::new("/nonexistent/servodriver-arduino-cli");
        assert!(matches!(cli.list_boards(&limits), Err(ToolError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_tool_captures_output_and_exit_code() {
        let cancel = CancelToken::new();
        let limits = RunLimits { timeout: Duration::from_secs(10), cancel: &cancel };
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let out = run_tool(cmd, &limits).unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_tool_times_out() {
        let cancel = CancelToken::new();
        let limits = RunLimits { timeout: Duration::from_millis(200), cancel: &cancel };
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 30"]);
        let started = Instant::now();
        assert!(matches!(run_tool(cmd, &limits), Err(ToolError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_tool_honours_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let limits = RunLimits { timeout: Duration::from_secs(30), cancel: &cancel };
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 30"]);
        assert!(matches!(run_tool(cmd, &limits), Err(ToolError::Cancelled)));
    }

    #[cfg(unix)]
    #[test]
    fn test_lingering_background_job_counts_against_deadline() {
        let cancel = CancelToken::new();
        let limits = RunLimits { timeout: Duration::from_secs(1), cancel: &cancel };
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 6 & echo uploaded"]);
        let started = Instant::now();
        assert!(matches!(run_tool(cmd, &limits), Err(ToolError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-running");
        let cancel = CancelToken::new();
        let limits = RunLimits { timeout: Duration::from_millis(300), cancel: &cancel };
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("(sleep 2; touch '{}') & wait", marker.display()));
        assert!(matches!(run_tool(cmd, &limits), Err(ToolError::TimedOut { .. })));
        thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists());
    }
}
