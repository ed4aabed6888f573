/// Firmware provisioning pipeline
///
/// GenerateSource → VerifyArtifact → SelectTarget → VerifyBoard →
/// InstallDependencies → Compile → Upload → Done
///
/// Every stage gates the next. The first failure ends the job with that
/// stage's error; nothing is retried and nothing is rolled back (only the
/// generated sketch outlives a failed job). The target port is claimed from
/// SelectTarget until the job ends, so a live serial link cannot hold it.

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver};
use log::{error, info};
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::firmware::{sketch_file_name, write_sketch, SketchError};
use crate::ports::{selected_port, PortId};
use crate::serial_link::PortClaim;
use crate::toolchain::{board_list_has_port, CancelToken, RunLimits, ToolError, ToolOutput, Toolchain};

/// The one board this firmware is built for.
pub const BOARD_FQBN: &str = "arduino:avr:nano:cpu=atmega168";
pub const CORE_PACKAGE: &str = "arduino:avr";
pub const SERVO_LIBRARY: &str = "Servo";
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    GenerateSource,
    VerifyArtifact,
    SelectTarget,
    VerifyBoard,
    InstallDependencies,
    Compile,
    Upload,
    Done,
}

impl Stage {
    pub const ORDER: [Stage; 8] = [
        Stage::GenerateSource,
        Stage::VerifyArtifact,
        Stage::SelectTarget,
        Stage::VerifyBoard,
        Stage::InstallDependencies,
        Stage::Compile,
        Stage::Upload,
        Stage::Done,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::GenerateSource => "generating firmware source",
            Stage::VerifyArtifact => "checking firmware source",
            Stage::SelectTarget => "selecting port",
            Stage::VerifyBoard => "verifying board",
            Stage::InstallDependencies => "installing core and libraries",
            Stage::Compile => "compiling",
            Stage::Upload => "uploading",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Firmware file name {0:?} must end in .ino")]
    InvalidFileName(String),
    #[error("Firmware source not found: {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("Select a serial port first")]
    NoPortSelected,
    #[error("Port {port} is in use; disconnect it before uploading firmware")]
    PortBusy { port: PortId },
    #[error("Port {port} is not reported as a connected board")]
    NotABoard { port: PortId },
    #[error("Failed to install {package}:\n{diagnostics}")]
    DependencyInstallFailed { package: String, diagnostics: String },
    #[error("Compilation failed:\n{diagnostics}")]
    CompileFailed { diagnostics: String },
    #[error("Upload to {port} did not finish within {} s", .after.as_secs())]
    UploadTimeout { port: PortId, after: Duration },
    #[error("Upload failed:\n{diagnostics}")]
    UploadFailed { diagnostics: String },
    #[error("Provisioning cancelled while {stage}")]
    Cancelled { stage: Stage },
    #[error("Unexpected error while {stage}: {message}")]
    Unexpected { stage: Stage, message: String },
}

impl ProvisionError {
    /// Stage the job was in when it failed.
    pub fn stage(&self) -> Stage {
        match self {
            ProvisionError::InvalidFileName(_) => Stage::GenerateSource,
            ProvisionError::ArtifactMissing(_) => Stage::VerifyArtifact,
            ProvisionError::NoPortSelected | ProvisionError::PortBusy { .. } => Stage::SelectTarget,
            ProvisionError::NotABoard { .. } => Stage::VerifyBoard,
            ProvisionError::DependencyInstallFailed { .. } => Stage::InstallDependencies,
            ProvisionError::CompileFailed { .. } => Stage::Compile,
            ProvisionError::UploadTimeout { .. } | ProvisionError::UploadFailed { .. } => Stage::Upload,
            ProvisionError::Cancelled { stage } | ProvisionError::Unexpected { stage, .. } => *stage,
        }
    }

    /// Text for the operator. An upload that hangs almost always means the
    /// wrong port or board was chosen, so that is what a timeout says.
    pub fn user_message(&self) -> String {
        match self {
            ProvisionError::UploadTimeout { .. } => "Wrong port or wrong board selected.".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub upload_timeout: Duration,
    /// Limit for every other tool invocation.
    pub tool_timeout: Duration,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

impl ProvisionSettings {
    /// Whole-job budget: board list, two installs and a compile, plus the upload.
    pub fn job_budget(&self) -> Duration {
        self.tool_timeout * 4 + self.upload_timeout
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Folder the sketch is generated in; the sketch is named after it.
    pub sketch_dir: PathBuf,
    pub port: Option<PortId>,
}

/// One upload attempt.
#[derive(Debug, Clone)]
pub struct ProvisioningJob {
    pub id: Uuid,
    pub port: Option<PortId>,
    pub source_path: Option<PathBuf>,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub budget: Duration,
    started: Instant,
}

impl ProvisioningJob {
    fn new(port: Option<PortId>, budget: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            port,
            source_path: None,
            stage: Stage::GenerateSource,
            started_at: Utc::now(),
            budget,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub job_id: Uuid,
    pub port: PortId,
    pub source_path: PathBuf,
    pub elapsed: Duration,
    pub upload_output: ToolOutput,
}

pub struct ProvisioningPipeline<T: Toolchain> {
    toolchain: T,
    settings: ProvisionSettings,
}

impl<T: Toolchain> ProvisioningPipeline<T> {
    pub fn new(toolchain: T, settings: ProvisionSettings) -> Self {
        Self { toolchain, settings }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    /// Run every stage in order on the calling thread.
    ///
    /// `on_stage` is called as each stage begins, including `Done`.
    pub fn run(
        &self,
        request: &ProvisionRequest,
        cancel: &CancelToken,
        on_stage: &mut dyn FnMut(&ProvisioningJob),
    ) -> Result<ProvisionReport, ProvisionError> {
        let mut job = ProvisioningJob::new(request.port.clone(), self.settings.job_budget());
        info!(target: "provisioning", "Job {} started for port {:?}", job.id, job.port);
        let result = self.run_stages(&mut job, request, cancel, on_stage);
        match &result {
            Ok(report) => info!(target: "provisioning", "Job {} finished in {:.1} s", job.id, report.elapsed.as_secs_f32()),
            Err(e) => error!(target: "provisioning", "Job {} failed while {}: {}", job.id, e.stage(), e),
        }
        result
    }

    fn run_stages(
        &self,
        job: &mut ProvisioningJob,
        request: &ProvisionRequest,
        cancel: &CancelToken,
        on_stage: &mut dyn FnMut(&ProvisioningJob),
    ) -> Result<ProvisionReport, ProvisionError> {
        enter(job, Stage::GenerateSource, cancel, on_stage)?;
        let source = generate_source(&request.sketch_dir)?;
        job.source_path = Some(source.clone());

        enter(job, Stage::VerifyArtifact, cancel, on_stage)?;
        verify_artifact(&source)?;

        enter(job, Stage::SelectTarget, cancel, on_stage)?;
        let port = request
            .port
            .as_deref()
            .and_then(selected_port)
            .ok_or(ProvisionError::NoPortSelected)?;
        let _claim = PortClaim::acquire(&port).map_err(|_| ProvisionError::PortBusy { port: port.clone() })?;

        enter(job, Stage::VerifyBoard, cancel, on_stage)?;
        let limits = self.limits(job, self.settings.tool_timeout, cancel);
        let listing = self
            .toolchain
            .list_boards(&limits)
            .map_err(|e| unexpected(Stage::VerifyBoard, e))?;
        if !listing.success() {
            return Err(ProvisionError::Unexpected {
                stage: Stage::VerifyBoard,
                message: listing.diagnostics(),
            });
        }
        if !board_list_has_port(&listing.stdout, &port) {
            return Err(ProvisionError::NotABoard { port });
        }

        enter(job, Stage::InstallDependencies, cancel, on_stage)?;
        let limits = self.limits(job, self.settings.tool_timeout, cancel);
        install_result(CORE_PACKAGE, self.toolchain.install_core(CORE_PACKAGE, &limits))?;
        let limits = self.limits(job, self.settings.tool_timeout, cancel);
        install_result(SERVO_LIBRARY, self.toolchain.install_library(SERVO_LIBRARY, &limits))?;

        enter(job, Stage::Compile, cancel, on_stage)?;
        let limits = self.limits(job, self.settings.tool_timeout, cancel);
        let compiled = match self.toolchain.compile(BOARD_FQBN, &source, &limits) {
            Ok(out) => out,
            Err(ToolError::TimedOut { after }) => {
                return Err(ProvisionError::CompileFailed { diagnostics: timed_out(after) });
            }
            Err(e) => return Err(unexpected(Stage::Compile, e)),
        };
        if !compiled.success() {
            return Err(ProvisionError::CompileFailed { diagnostics: compiled.diagnostics() });
        }

        enter(job, Stage::Upload, cancel, on_stage)?;
        let limits = self.limits(job, self.settings.upload_timeout, cancel);
        let uploaded = match self.toolchain.upload(&port, BOARD_FQBN, &source, &limits) {
            Ok(out) => out,
            Err(ToolError::TimedOut { after }) => return Err(ProvisionError::UploadTimeout { port, after }),
            Err(e) => return Err(unexpected(Stage::Upload, e)),
        };
        if !uploaded.success() {
            return Err(ProvisionError::UploadFailed { diagnostics: uploaded.diagnostics() });
        }

        enter(job, Stage::Done, cancel, on_stage)?;
        Ok(ProvisionReport {
            job_id: job.id,
            port,
            source_path: source,
            elapsed: job.elapsed(),
            upload_output: uploaded,
        })
    }

    fn limits<'a>(&self, job: &ProvisioningJob, stage_timeout: Duration, cancel: &'a CancelToken) -> RunLimits<'a> {
        RunLimits {
            timeout: stage_timeout.min(job.remaining()),
            cancel,
        }
    }
}

fn enter(
    job: &mut ProvisioningJob,
    stage: Stage,
    cancel: &CancelToken,
    on_stage: &mut dyn FnMut(&ProvisioningJob),
) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled { stage: job.stage });
    }
    job.stage = stage;
    info!(target: "provisioning", "Job {}: {}", job.id, stage);
    on_stage(job);
    Ok(())
}

fn generate_source(dir: &Path) -> Result<PathBuf, ProvisionError> {
    let file_name = sketch_file_name(dir).ok_or_else(|| ProvisionError::InvalidFileName(dir.display().to_string()))?;
    write_sketch(dir, &file_name).map_err(|e| match e {
        SketchError::InvalidFileName(name) => ProvisionError::InvalidFileName(name),
        SketchError::Io(message) => ProvisionError::Unexpected { stage: Stage::GenerateSource, message },
    })
}

/// The generated sketch must exist as a regular file before anything is built from it.
fn verify_artifact(path: &Path) -> Result<(), ProvisionError> {
    if path.is_file() {
        Ok(())
    } else {
        error!(target: "provisioning", "Generated sketch missing at {}", path.display());
        Err(ProvisionError::ArtifactMissing(path.to_path_buf()))
    }
}

fn install_result(package: &str, result: Result<ToolOutput, ToolError>) -> Result<(), ProvisionError> {
    let out = match result {
        Ok(out) => out,
        Err(ToolError::TimedOut { after }) => {
            return Err(ProvisionError::DependencyInstallFailed {
                package: package.to_string(),
                diagnostics: timed_out(after),
            });
        }
        Err(e) => return Err(unexpected(Stage::InstallDependencies, e)),
    };
    if out.success() {
        Ok(())
    } else {
        Err(ProvisionError::DependencyInstallFailed {
            package: package.to_string(),
            diagnostics: out.diagnostics(),
        })
    }
}

fn timed_out(after: Duration) -> String {
    format!("timed out after {} s", after.as_secs())
}

fn unexpected(stage: Stage, e: ToolError) -> ProvisionError {
    match e {
        ToolError::Cancelled => ProvisionError::Cancelled { stage },
        other => ProvisionError::Unexpected { stage, message: other.to_string() },
    }
}

#[derive(Debug)]
pub enum ProvisionEvent {
    StageStarted { job_id: Uuid, stage: Stage },
    Finished(Result<ProvisionReport, ProvisionError>),
}

/// A pipeline running on its own thread. Dropping the task cancels it.
#[derive(Debug)]
pub struct ProvisioningTask {
    events: Receiver<ProvisionEvent>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl ProvisioningTask {
    pub fn spawn<T: Toolchain + 'static>(pipeline: ProvisioningPipeline<T>, request: ProvisionRequest) -> Self {
        let (tx, events) = unbounded();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let worker = thread::spawn(move || {
            let stage_tx = tx.clone();
            let mut on_stage = |job: &ProvisioningJob| {
                let _ = stage_tx.send(ProvisionEvent::StageStarted { job_id: job.id, stage: job.stage });
            };
            let result = pipeline.run(&request, &worker_cancel, &mut on_stage);
            let _ = tx.send(ProvisionEvent::Finished(result));
        });
        Self {
            events,
            cancel,
            worker: Some(worker),
        }
    }

    pub fn events(&self) -> &Receiver<ProvisionEvent> {
        &self.events
    }

    /// Stops at the next stage boundary and kills a running tool.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ProvisioningTask {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
