use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use uuid::Uuid;

use crate::models::payload::{DispatchPayload, GradingStrictness};
use crate::models::snapshot::{RubricItem, SnapshotQuestion};
use crate::models::submission::SubmissionVersion;
use crate::services::evidence;

/// Confidence threshold passed to the grader when the payload sets none.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.75;

/// Everything needed to grade one submission against one snapshot question.
#[derive(Debug, Clone)]
pub struct GradingRequest {
    pub job_id: Uuid,
    pub snapshot_id: Uuid,
    pub submission: SubmissionVersion,
    pub question: SnapshotQuestion,
    pub payload: DispatchPayload,
}

/// Raw grader output plus the identity of the model that produced it.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub output_text: String,
    pub model_name: String,
    pub model_version: Option<String>,
}

/// Narrow seam around the external grader. The pipeline never depends on how
/// grading is actually performed.
#[async_trait]
pub trait GradingInvoker: Send + Sync {
    async fn invoke(&self, request: &GradingRequest) -> Result<InvocationOutput, InvokeError>;
}

#[derive(Debug, Clone)]
pub struct InvokerSettings {
    /// Executable to run, e.g. `python3`.
    pub program: String,
    /// Leading arguments, e.g. the grader script path.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub max_images: usize,
    pub max_image_bytes: u64,
    /// Parent directory for per-job work directories; system temp if unset.
    pub work_root: Option<PathBuf>,
    pub default_model: Option<String>,
}

/// Runs the grader as a subprocess inside a scratch directory.
///
/// Invocation: `program args.. --json <input> --out <output> [--image <path>]..
/// [--model <name>] [--temperature <t>]`. The grader must write a JSON
/// document to `<output>` and exit 0.
pub struct ProcessInvoker {
    settings: InvokerSettings,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InputDocument<'a> {
    submission_version_id: Uuid,
    assignment_snapshot_id: Uuid,
    student_answer_text: &'a str,
    student_answer_payload: Option<&'a Value>,
    answer_format: Option<&'a str>,
    question: QuestionDocument<'a>,
    options: OptionsDocument<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QuestionDocument<'a> {
    question_index: i64,
    question_type: String,
    question_schema: Option<&'a Value>,
    grading_policy: Option<&'a Value>,
    prompt: String,
    standard_answer: String,
    rubric: &'a [RubricItem],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OptionsDocument<'a> {
    return_student_markdown: bool,
    min_confidence: f64,
    handwriting_recognition: bool,
    grading_strictness: GradingStrictness,
    custom_guidance: &'a str,
}

fn input_document(request: &GradingRequest) -> InputDocument<'_> {
    let question = &request.question;
    let options = &request.payload.options;
    InputDocument {
        submission_version_id: request.submission.id,
        assignment_snapshot_id: request.snapshot_id,
        student_answer_text: request.submission.content_text.as_deref().unwrap_or(""),
        student_answer_payload: request.submission.answer_payload.as_ref(),
        answer_format: request.submission.answer_format.as_deref(),
        question: QuestionDocument {
            question_index: question.question_index,
            question_type: question.kind().to_string(),
            question_schema: question.question_schema.as_ref(),
            grading_policy: question.grading_policy.as_ref(),
            prompt: question.prompt_text(),
            standard_answer: question.standard_answer_text(),
            rubric: &question.rubric,
        },
        options: OptionsDocument {
            return_student_markdown: options.return_student_markdown,
            min_confidence: request
                .payload
                .uncertainty_policy
                .min_confidence
                .unwrap_or(DEFAULT_MIN_CONFIDENCE),
            handwriting_recognition: options.handwriting_recognition,
            grading_strictness: options.grading_strictness,
            custom_guidance: options.custom_guidance.as_deref().map_or("", str::trim),
        },
    }
}

struct ProcessOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stdout_overflow: bool,
    stderr: Vec<u8>,
}

impl ProcessInvoker {
    pub fn new(settings: InvokerSettings) -> Self {
        Self { settings }
    }

    fn work_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("grading-");
        match &self.settings.work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }

    /// Run the command to completion or until the timeout, capturing at most
    /// `max_output_bytes` of each stream.
    async fn run_bounded(&self, mut command: Command) -> Result<ProcessOutput, InvokeError> {
        let mut child = command.spawn().map_err(InvokeError::Spawn)?;
        // Anything the grader forked dies with it, however this call ends.
        let _group = ProcessGroup::of(&child);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.settings.max_output_bytes;

        let collect = async {
            let (out, err, status) = tokio::try_join!(
                read_bounded(stdout, limit),
                read_bounded(stderr, limit),
                child.wait(),
            )?;
            Ok::<_, std::io::Error>((out, err, status))
        };
        let outcome = tokio::time::timeout(self.settings.timeout, collect).await;

        match outcome {
            Ok(Ok(((stdout, stdout_overflow), (stderr, _), status))) => Ok(ProcessOutput {
                status,
                stdout,
                stdout_overflow,
                stderr,
            }),
            Ok(Err(e)) => Err(InvokeError::Io(e)),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill timed-out grader");
                }
                Err(InvokeError::Timeout(self.settings.timeout))
            }
        }
    }
}

/// The grader's process group, sent SIGKILL on drop.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self { pgid: child.id() }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    if let Ok(pgid) = libc::pid_t::try_from(pgid) {
        // SAFETY: killpg only sends a signal. The group was created for the
        // grader by `process_group(0)`; ESRCH once every member is gone.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

#[async_trait]
impl GradingInvoker for ProcessInvoker {
    async fn invoke(&self, request: &GradingRequest) -> Result<InvocationOutput, InvokeError> {
        // Removed on drop, whichever way this function returns.
        let work_dir = self.work_dir()?;
        let input_path = work_dir.path().join("input.json");
        let output_path = work_dir.path().join("output.json");

        let document =
            serde_json::to_vec_pretty(&input_document(request)).map_err(InvokeError::Encode)?;
        tokio::fs::write(&input_path, document).await?;

        let max_images = request
            .payload
            .options
            .max_pages
            .map_or(self.settings.max_images, |pages| {
                (pages as usize).min(self.settings.max_images)
            });
        let images = evidence::collect_evidence(
            &request.submission.file_url,
            max_images,
            self.settings.max_image_bytes,
        )
        .await;

        let mut command = Command::new(&self.settings.program);
        command
            .args(&self.settings.args)
            .arg("--json")
            .arg(&input_path)
            .arg("--out")
            .arg(&output_path);
        for image in &images {
            command.arg("--image").arg(image);
        }
        if let Some(hint) = &request.payload.model_hint {
            command.arg("--model").arg(&hint.name);
        }
        if let Some(temperature) = request.payload.options.temperature {
            command.arg("--temperature").arg(temperature.to_string());
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        tracing::info!(
            job_id = %request.job_id,
            images = images.len(),
            timeout_ms = self.settings.timeout.as_millis() as u64,
            "Invoking grader"
        );
        let started = Instant::now();
        let result = self.run_bounded(command).await;
        metrics::histogram!("grading_invocation_seconds").record(started.elapsed().as_secs_f64());
        let output = result?;

        if !output.status.success() {
            return Err(InvokeError::NonZeroExit {
                code: output.status.code(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), 500),
            });
        }
        if output.stdout_overflow {
            return Err(InvokeError::OutputLimit(self.settings.max_output_bytes));
        }

        let output_text = match tokio::fs::read_to_string(&output_path).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Err(e) => return Err(InvokeError::Io(e)),
        };
        if output_text.trim().is_empty() {
            return Err(InvokeError::MissingOutput);
        }

        let (model_name, model_version) = match &request.payload.model_hint {
            Some(hint) => (hint.name.clone(), hint.version.clone()),
            None => (
                self.settings
                    .default_model
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                None,
            ),
        };

        Ok(InvocationOutput {
            output_text,
            model_name,
            model_version,
        })
    }
}

async fn read_bounded<R>(reader: Option<R>, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok((Vec::new(), false));
    };

    let mut buf = Vec::new();
    let mut limited = reader.take(limit as u64 + 1);
    limited.read_to_end(&mut buf).await?;

    let overflow = buf.len() > limit;
    if overflow {
        buf.truncate(limit);
        // Keep draining so the child never blocks on a full pipe.
        let mut rest = limited.into_inner();
        tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
    }
    Ok((buf, overflow))
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("grader timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("grader terminated with {}: {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("grader output exceeded {0} bytes")]
    OutputLimit(usize),

    #[error("grader produced no output")]
    MissingOutput,

    #[error("failed to start grader: {0}")]
    Spawn(std::io::Error),

    #[error("failed to encode grader input: {0}")]
    Encode(serde_json::Error),

    #[error("grader I/O error: {0}")]
    Io(#[from] std::io::Error),
}
