//! Event chain behaviour against recording collaborators.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use common::{MockArtifacts, MockPublisher, MockRecords, MockRunner, RecordCall, Scripted};
use watchrabbit_core::{
    AnalysisCompleted, AnalysisRequested, AnalysisStatus, FileDetected, SupportedFileTypes,
};
use watchrabbit_worker::{ChainError, EventChain};

struct Harness {
    _dir: tempfile::TempDir,
    publisher: Arc<MockPublisher>,
    runner: Arc<MockRunner>,
    artifacts: Arc<MockArtifacts>,
    chain: EventChain,
}

fn harness_with(scripted: impl FnOnce(&std::path::Path) -> Scripted, artifacts: MockArtifacts) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Arc::new(MockPublisher::new());
    let runner = Arc::new(MockRunner::new(scripted(dir.path())));
    let artifacts = Arc::new(artifacts);
    let chain = EventChain::new(
        publisher.clone(),
        runner.clone(),
        artifacts.clone(),
        SupportedFileTypes::default(),
        "biomarker",
    );
    Harness {
        _dir: dir,
        publisher,
        runner,
        artifacts,
        chain,
    }
}

fn succeeding() -> Harness {
    harness_with(|dir| Scripted::Succeed(dir.join("out")), MockArtifacts::new())
}

fn request(path: &str, file_type: &str) -> AnalysisRequested {
    AnalysisRequested::from_detection(&FileDetected::new(path, file_type, 10))
}

fn single_completion(publisher: &MockPublisher) -> (String, String, AnalysisCompleted) {
    let messages = publisher.messages();
    assert_eq!(messages.len(), 1, "exactly one completion expected");
    let m = &messages[0];
    (
        m.exchange.clone(),
        m.routing_key.clone(),
        m.envelope.decode().unwrap(),
    )
}

// ── FileDetected ─────────────────────────────────────────────────────

#[tokio::test]
async fn supported_detection_requests_analysis() {
    let h = succeeding();
    for (path, ext, word) in [("/data/a.csv", ".csv", "csv"), ("/data/b.sas7bdat", ".SAS7BDAT", "sas7bdat")] {
        let detected = FileDetected::new(path, ext, 120);
        let request = h.chain.on_file_detected(&detected).await.unwrap().unwrap();
        assert_eq!(request.file_path, path);
        assert_eq!(request.file_type, format!(".{word}"));
        assert!(request.timestamp >= detected.timestamp);

        let last = h.publisher.messages().pop().unwrap();
        assert_eq!(last.exchange, "biomarker.analysis.events");
        assert_eq!(last.routing_key, format!("analysis.requested.{word}"));
        assert_eq!(last.envelope.kind, "analysis.requested");
        let decoded: AnalysisRequested = last.envelope.decode().unwrap();
        assert_eq!(decoded, request);
    }
    assert_eq!(h.publisher.messages().len(), 2);
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn unsupported_detection_is_dropped() {
    let h = succeeding();
    for ext in [".txt", ".xlsx", ""] {
        let detected = FileDetected::new("/data/notes", ext, 1);
        assert!(h.chain.on_file_detected(&detected).await.unwrap().is_none());
    }
    assert!(h.publisher.messages().is_empty());
}

#[tokio::test]
async fn detection_publish_failure_propagates() {
    let h = succeeding();
    h.publisher.fail(true);
    let err = h
        .chain
        .on_file_detected(&FileDetected::new("/data/a.csv", ".csv", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::Publish { .. }));
}

// ── AnalysisRequested ────────────────────────────────────────────────

#[tokio::test]
async fn success_publishes_completion_with_result_key() {
    let h = succeeding();
    let completion = h.chain.on_analysis_requested(&request("/data/a.csv", ".csv")).await.unwrap();

    let (exchange, key, published) = single_completion(&h.publisher);
    assert_eq!(exchange, "biomarker.result.events");
    assert_eq!(key, "analysis.completed.csv");
    assert_eq!(published, completion);
    assert_eq!(completion.status, AnalysisStatus::Success);
    assert!(completion.result_key.starts_with("results/"));
    assert!(completion.error_message.is_none());
    assert_eq!(completion.analysis_type, "descriptive");
    assert_eq!(completion.file_type, ".csv");

    let stored = h.artifacts.stored();
    assert_eq!(stored.len(), 1);
    let (local, meta) = &stored[0];
    assert!(local.exists(), "artifact is retained by default");
    assert_eq!(meta.content_type, "text/html");
    assert_eq!(meta.file_type, ".csv");
    assert_eq!(meta.script.as_deref(), Some("mock.R"));
    assert_eq!(completion.analysis_id, Some(meta.invocation_id));
}

#[tokio::test]
async fn failed_outcome_publishes_failure_without_key() {
    let h = harness_with(|_| Scripted::Fail("exit status 1: boom".into()), MockArtifacts::new());
    let completion = h.chain.on_analysis_requested(&request("/data/a.csv", ".csv")).await.unwrap();

    let (_, _, published) = single_completion(&h.publisher);
    assert_eq!(published.status, AnalysisStatus::Failed);
    assert!(published.result_key.is_empty());
    assert_eq!(published.error_message.as_deref(), Some("exit status 1: boom"));
    assert_eq!(completion, published);
    assert!(h.artifacts.stored().is_empty());
}

#[tokio::test]
async fn timed_out_outcome_keeps_timeout_status() {
    let h = harness_with(|_| Scripted::TimeOut, MockArtifacts::new());
    let completion = h.chain.on_analysis_requested(&request("/data/a.csv", ".csv")).await.unwrap();
    assert_eq!(completion.status, AnalysisStatus::Timeout);
    assert!(completion.result_key.is_empty());
    assert!(completion.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn storage_failure_turns_success_into_failure() {
    let h = harness_with(|dir| Scripted::Succeed(dir.join("out")), MockArtifacts::failing());
    let completion = h.chain.on_analysis_requested(&request("/data/a.csv", ".csv")).await.unwrap();

    assert_eq!(completion.status, AnalysisStatus::Failed);
    assert!(completion.result_key.is_empty());
    assert!(completion.error_message.unwrap().contains("failed to store result"));
    assert_eq!(h.publisher.messages().len(), 1);
}

#[tokio::test]
async fn processing_time_counts_from_original_request() {
    let h = succeeding();
    let mut req = request("/data/a.csv", ".csv");
    req.timestamp = Utc::now() - ChronoDuration::seconds(3);

    let completion = h.chain.on_analysis_requested(&req).await.unwrap();
    assert!(
        completion.processing_time_ms >= 3_000,
        "got {}ms",
        completion.processing_time_ms
    );
}

#[tokio::test]
async fn completion_publish_failure_propagates() {
    let h = succeeding();
    h.publisher.fail(true);
    let err = h
        .chain
        .on_analysis_requested(&request("/data/a.csv", ".csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::Publish { kind: "analysis.completed", .. }));
}

#[tokio::test]
async fn discard_output_removes_stored_artifact() {
    let h = succeeding();
    let chain = EventChain::new(
        h.publisher.clone(),
        h.runner.clone(),
        h.artifacts.clone(),
        SupportedFileTypes::default(),
        "biomarker",
    )
    .discard_output(true);

    let completion = chain.on_analysis_requested(&request("/data/a.csv", ".csv")).await.unwrap();
    assert_eq!(completion.status, AnalysisStatus::Success);
    let (local, _) = h.artifacts.stored().pop().unwrap();
    assert!(!local.exists());
}

// ── Records ──────────────────────────────────────────────────────────

#[tokio::test]
async fn records_follow_the_analysis() {
    let h = harness_with(|_| Scripted::Fail("bad input".into()), MockArtifacts::new());
    let records = Arc::new(MockRecords::new());
    let chain = EventChain::new(
        h.publisher.clone(),
        h.runner.clone(),
        h.artifacts.clone(),
        SupportedFileTypes::default(),
        "biomarker",
    )
    .with_records(records.clone());

    chain
        .on_file_detected(&FileDetected::new("/data/a.csv", ".csv", 42))
        .await
        .unwrap();
    chain.on_analysis_requested(&request("/data/a.csv", ".csv")).await.unwrap();

    let calls = records.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], RecordCall::File("/data/a.csv".into(), 42));
    assert_eq!(
        calls[1],
        RecordCall::Start("/data/a.csv".into(), "descriptive".into())
    );
    match &calls[2] {
        RecordCall::Status(_, status, error) => {
            assert_eq!(*status, AnalysisStatus::Failed);
            assert_eq!(error.as_deref(), Some("bad input"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn stored_result_is_recorded_against_the_analysis() {
    let h = succeeding();
    let records = Arc::new(MockRecords::new());
    let chain = EventChain::new(
        h.publisher.clone(),
        h.runner.clone(),
        h.artifacts.clone(),
        SupportedFileTypes::default(),
        "biomarker",
    )
    .with_records(records.clone());

    let completion = chain.on_analysis_requested(&request("/data/a.csv", ".csv")).await.unwrap();
    assert_eq!(completion.status, AnalysisStatus::Success);

    let calls = records.calls();
    assert_eq!(calls.len(), 3, "{calls:?}");
    assert!(matches!(calls[0], RecordCall::Start(..)));
    let RecordCall::Status(status_id, AnalysisStatus::Success, None) = &calls[1] else {
        panic!("unexpected {:?}", calls[1]);
    };
    match &calls[2] {
        RecordCall::Result(result_id, result) => {
            assert_eq!(result_id, status_id);
            assert_eq!(result.storage_key, completion.result_key);
            assert_eq!(result.storage_type, "s3");
            assert_eq!(result.content_type, "text/html");
            assert_eq!(result.result_type, "report");
            assert_eq!(result.size_bytes, "<html>report</html>".len() as u64);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn failing_records_never_block_the_chain() {
    let h = succeeding();
    let records = Arc::new(MockRecords::failing());
    let chain = EventChain::new(
        h.publisher.clone(),
        h.runner.clone(),
        h.artifacts.clone(),
        SupportedFileTypes::default(),
        "biomarker",
    )
    .with_records(records.clone());

    chain
        .on_file_detected(&FileDetected::new("/data/a.csv", ".csv", 1))
        .await
        .unwrap()
        .unwrap();
    let completion = chain.on_analysis_requested(&request("/data/a.csv", ".csv")).await.unwrap();
    assert_eq!(completion.status, AnalysisStatus::Success);
    assert_eq!(h.publisher.messages().len(), 2);
    // Start failed, so no status update is attempted.
    assert!(!records
        .calls()
        .iter()
        .any(|c| matches!(c, RecordCall::Status(..))));
}
