//! Subprocess invoker tests using small `sh` scripts as the grader.
//!
//! The grader is invoked as `sh -c <script> grader --json <in> --out <out> ...`,
//! so inside the script `$2` is the input path and `$4` the output path.
//!
//! Run with: cargo test --test invoker_tests

use grading_pipeline::models::payload::{DispatchPayload, GradingOptions, GradingStrictness};
use grading_pipeline::models::snapshot::SnapshotQuestion;
use grading_pipeline::models::submission::{AiStatus, SubmissionVersion};
use grading_pipeline::services::invoker::{
    GradingInvoker, GradingRequest, InvokeError, InvokerSettings, ProcessInvoker,
};
use grading_pipeline::services::parser::parse_model_output;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

fn settings(script: &str, work_root: &Path) -> InvokerSettings {
    InvokerSettings {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), "grader".to_string()],
        timeout: Duration::from_secs(10),
        max_output_bytes: 64 * 1024,
        max_images: 4,
        max_image_bytes: 1024,
        work_root: Some(work_root.to_path_buf()),
        default_model: Some("default-model".to_string()),
    }
}

fn request(file_url: String, payload: DispatchPayload) -> GradingRequest {
    let question: SnapshotQuestion = serde_json::from_value(json!({
        "questionId": Uuid::new_v4().to_string(),
        "questionType": "ESSAY",
        "prompt": "Explain",
        "rubric": [{ "rubricItemKey": "R1", "maxScore": 5 }]
    }))
    .unwrap();

    GradingRequest {
        job_id: Uuid::new_v4(),
        snapshot_id: Uuid::new_v4(),
        submission: SubmissionVersion {
            id: Uuid::new_v4(),
            assignment_id: Uuid::new_v4(),
            question_id: Uuid::new_v4(),
            content_text: Some("answer".to_string()),
            answer_payload: None,
            answer_format: None,
            file_url,
            ai_status: AiStatus::Running,
        },
        question,
        payload,
    }
}

fn write_png(dir: &Path, name: &str, size: usize) -> String {
    let mut bytes = PNG_MAGIC.to_vec();
    bytes.resize(size.max(PNG_MAGIC.len()), 0);
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path.to_string_lossy().into_owned()
}

fn entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

#[tokio::test]
async fn test_output_file_is_read_and_input_is_written() {
    let root = tempfile::tempdir().unwrap();
    // The grader only answers if the input document carries every run option.
    let script = r#"grep -q '"studentAnswerText": "answer"' "$2" || exit 9
grep -q '"handwritingRecognition": true' "$2" || exit 10
grep -q '"gradingStrictness": "STRICT"' "$2" || exit 11
grep -q '"customGuidance": "award method marks"' "$2" || exit 12
grep -q '"minConfidence": 0.75' "$2" || exit 13
printf '{"result":{"totalScore":5}}' > "$4""#;
    let invoker = ProcessInvoker::new(settings(script, root.path()));
    let payload = DispatchPayload {
        options: GradingOptions {
            handwriting_recognition: true,
            grading_strictness: GradingStrictness::Strict,
            custom_guidance: Some("  award method marks ".to_string()),
            ..GradingOptions::default()
        },
        ..DispatchPayload::default()
    };

    let output = invoker
        .invoke(&request(String::new(), payload))
        .await
        .unwrap();

    let parsed = parse_model_output(&output.output_text).unwrap();
    assert_eq!(parsed.result["totalScore"], 5);
    assert_eq!(output.model_name, "default-model");
}

#[tokio::test]
async fn test_stdout_used_when_no_output_file() {
    let root = tempfile::tempdir().unwrap();
    let invoker = ProcessInvoker::new(settings(
        r#"echo 'log line'; echo '{"result":{"ok":true}}'"#,
        root.path(),
    ));

    let output = invoker
        .invoke(&request(String::new(), DispatchPayload::default()))
        .await
        .unwrap();

    let parsed = parse_model_output(&output.output_text).unwrap();
    assert_eq!(parsed.result["ok"], true);
}

#[tokio::test]
async fn test_non_zero_exit_reports_stderr() {
    let root = tempfile::tempdir().unwrap();
    let invoker = ProcessInvoker::new(settings("echo boom >&2; exit 3", root.path()));

    let err = invoker
        .invoke(&request(String::new(), DispatchPayload::default()))
        .await
        .unwrap_err();

    match err {
        InvokeError::NonZeroExit { code, stderr } => {
            assert_eq!(code, Some(3));
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_empty_output_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let invoker = ProcessInvoker::new(settings("exit 0", root.path()));

    let err = invoker
        .invoke(&request(String::new(), DispatchPayload::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::MissingOutput));
}

#[tokio::test]
async fn test_timeout_kills_grader_promptly() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = settings("exec sleep 30", root.path());
    settings.timeout = Duration::from_millis(300);
    let invoker = ProcessInvoker::new(settings);

    let started = Instant::now();
    let err = invoker
        .invoke(&request(String::new(), DispatchPayload::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, InvokeError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(entries(root.path()).is_empty());
}

#[cfg(target_os = "linux")]
fn process_gone(pid: &str) -> bool {
    // Exited (or a zombie awaiting its reaper).
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_forked_descendants() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let pid_file = scratch.path().join("child.pid");
    // No exec: the sleeping grandchild keeps the output pipes open.
    let script = format!(
        r#"sleep 30 & echo $! > "{}"; wait"#,
        pid_file.display()
    );
    let mut settings = settings(&script, root.path());
    settings.timeout = Duration::from_millis(500);
    let invoker = ProcessInvoker::new(settings);

    let err = invoker
        .invoke(&request(String::new(), DispatchPayload::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::Timeout(_)));

    let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
    let mut gone = false;
    for _ in 0..40 {
        if process_gone(&pid) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "forked grader process {pid} survived the timeout");
}

#[tokio::test]
async fn test_stdout_over_limit_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let mut settings = settings("head -c 5000 /dev/zero | tr '\\0' a", root.path());
    settings.max_output_bytes = 1024;
    let invoker = ProcessInvoker::new(settings);

    let err = invoker
        .invoke(&request(String::new(), DispatchPayload::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::OutputLimit(1024)));
}

#[tokio::test]
async fn test_unusable_evidence_is_skipped_not_fatal() {
    let root = tempfile::tempdir().unwrap();
    let evidence = tempfile::tempdir().unwrap();
    let candidates = vec![
        write_png(evidence.path(), "a.png", 64),
        write_png(evidence.path(), "big1.png", 4096),
        evidence.path().join("missing.png").to_string_lossy().into_owned(),
        write_png(evidence.path(), "b.png", 64),
        write_png(evidence.path(), "big2.png", 2048),
        write_png(evidence.path(), "c.png", 64),
    ];
    let file_url = serde_json::to_string(&candidates).unwrap();

    let script = r#"n=0; for a in "$@"; do [ "$a" = "--image" ] && n=$((n+1)); done
printf '{"result":{"images":%d}}' "$n" > "$4""#;
    let invoker = ProcessInvoker::new(settings(script, root.path()));

    let output = invoker
        .invoke(&request(file_url.clone(), DispatchPayload::default()))
        .await
        .unwrap();
    let parsed = parse_model_output(&output.output_text).unwrap();
    assert_eq!(parsed.result["images"], 3);

    // max_pages narrows the image budget further.
    let payload = DispatchPayload {
        options: GradingOptions {
            max_pages: Some(2),
            ..GradingOptions::default()
        },
        ..DispatchPayload::default()
    };
    let output = invoker.invoke(&request(file_url, payload)).await.unwrap();
    let parsed = parse_model_output(&output.output_text).unwrap();
    assert_eq!(parsed.result["images"], 2);
}

#[tokio::test]
async fn test_work_dir_removed_after_invocation() {
    let root = tempfile::tempdir().unwrap();
    let script = r#"printf '{"result":{"dir":"%s"}}' "$(dirname "$2")" > "$4""#;
    let invoker = ProcessInvoker::new(settings(script, root.path()));

    let output = invoker
        .invoke(&request(String::new(), DispatchPayload::default()))
        .await
        .unwrap();
    let parsed = parse_model_output(&output.output_text).unwrap();
    let dir = PathBuf::from(parsed.result["dir"].as_str().unwrap());

    assert!(dir.starts_with(root.path()));
    assert!(!dir.exists());
    assert!(entries(root.path()).is_empty());

    // Failure paths clean up too.
    let failing = ProcessInvoker::new(settings("exit 1", root.path()));
    failing
        .invoke(&request(String::new(), DispatchPayload::default()))
        .await
        .unwrap_err();
    assert!(entries(root.path()).is_empty());
}
