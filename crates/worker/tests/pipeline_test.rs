//! The worker wired to the in-memory broker: a detection travels through
//! both queues and ends as a completion on the result exchange.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use common::{MockRunner, Scripted};
use watchrabbit_analysis::{AnalysisRunner, TaskSupervisor};
use watchrabbit_broker::memory::{MemoryBroker, MemoryConnector};
use watchrabbit_broker::{
    ConnectionManager, Envelope, EventPublisher, Publisher, ReconnectPolicy, RedeliveryPolicy,
    Topology, CONTENT_TYPE_JSON,
};
use watchrabbit_core::config::AnalysisConfig;
use watchrabbit_core::{AnalysisCompleted, AnalysisStatus, EventKind, FileDetected, SupportedFileTypes};
use watchrabbit_storage::{LocalBackend, ObjectArtifactStore, StorageBackend};
use watchrabbit_worker::{EventChain, PipelineWorker, Worker};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Pipeline {
    connector: Arc<MemoryConnector>,
    manager: Arc<ConnectionManager>,
    publisher: Arc<Publisher>,
    worker: PipelineWorker,
}

async fn pipeline(runner: Arc<dyn AnalysisRunner>, results: &Path, max_redeliveries: u32) -> Pipeline {
    let connector = MemoryConnector::new(MemoryBroker::new());
    let manager = ConnectionManager::new(
        connector.clone(),
        Topology::standard("biomarker", true),
        ReconnectPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            factor: 2.0,
            max_attempts: None,
        },
        Duration::from_secs(1),
    );
    manager.start().await.unwrap();

    let publisher = Arc::new(Publisher::new(manager.clone(), Duration::from_secs(1)));
    let artifacts = ObjectArtifactStore::new(StorageBackend::Local(LocalBackend::new(results).unwrap()));
    let chain = EventChain::new(
        publisher.clone(),
        runner,
        Arc::new(artifacts),
        SupportedFileTypes::default(),
        "biomarker",
    );
    let worker = PipelineWorker::new(
        manager.clone(),
        Arc::new(chain),
        RedeliveryPolicy::capped(max_redeliveries),
    );
    worker.start().await.unwrap();

    Pipeline {
        connector,
        manager,
        publisher,
        worker,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_completion(p: &Pipeline) -> AnalysisCompleted {
    let queue = EventKind::AnalysisCompleted.queue_name();
    let broker = p.connector.broker().clone();
    eventually(|| broker.queue_depth(queue) > 0).await;
    let mut drained = broker.drain(queue);
    assert_eq!(drained.len(), 1);
    let (routing_key, envelope) = drained.remove(0);
    assert_eq!(routing_key, "analysis.completed.csv");
    envelope.decode().unwrap()
}

#[tokio::test]
async fn detection_flows_to_successful_completion() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new(Scripted::Succeed(dir.path().join("out"))));
    let results = dir.path().join("results");
    let p = pipeline(runner.clone(), &results, 3).await;

    p.publisher
        .publish_event("biomarker", &FileDetected::new("/data/a.csv", ".csv", 120))
        .await
        .unwrap();

    let completion = next_completion(&p).await;
    assert_eq!(completion.status, AnalysisStatus::Success);
    assert_eq!(completion.file_path, "/data/a.csv");
    assert!(completion.result_key.starts_with("results/"));
    assert!(results.join(&completion.result_key).is_file());
    assert_eq!(runner.calls(), 1);

    // Both consumed messages were acked.
    let broker = p.connector.broker();
    eventually(|| broker.unacked_count("file.detected") == 0).await;
    eventually(|| broker.unacked_count("analysis.requested") == 0).await;
    assert_eq!(broker.queue_depth("file.detected.dead"), 0);

    p.worker.stop().await.unwrap();
    p.manager.close().await;
}

#[tokio::test]
async fn unsupported_detection_produces_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new(Scripted::Succeed(dir.path().join("out"))));
    let p = pipeline(runner.clone(), &dir.path().join("results"), 3).await;

    p.publisher
        .publish_event("biomarker", &FileDetected::new("/data/readme.txt", ".txt", 5))
        .await
        .unwrap();

    let broker = p.connector.broker();
    eventually(|| broker.queue_depth("file.detected") == 0 && broker.unacked_count("file.detected") == 0)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.queue_depth("analysis.requested"), 0);
    assert_eq!(broker.queue_depth("analysis.completed"), 0);
    assert_eq!(runner.calls(), 0);
    p.manager.close().await;
}

#[tokio::test]
async fn zero_exit_without_report_completes_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let scripts = dir.path().join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join("analysis.sh"), "exit 0\n").unwrap();
    let input = dir.path().join("a.csv");
    std::fs::write(&input, "x\n1\n").unwrap();

    let config = AnalysisConfig {
        executable: Some("/bin/sh".into()),
        scripts_dir: scripts,
        script: "analysis.sh".into(),
        timeout_secs: 10,
        output_dir: dir.path().join("out"),
        retain_output: true,
        analysis_type: "descriptive".into(),
    };
    let supervisor = TaskSupervisor::new(&config, SupportedFileTypes::default()).unwrap();
    let p = pipeline(Arc::new(supervisor), &dir.path().join("results"), 3).await;

    p.publisher
        .publish_event(
            "biomarker",
            &FileDetected::new(input.to_string_lossy(), ".csv", 4),
        )
        .await
        .unwrap();

    let completion = next_completion(&p).await;
    assert_eq!(completion.status, AnalysisStatus::Failed);
    assert!(completion.result_key.is_empty());
    assert!(completion.error_message.unwrap().contains("no output"));
    p.manager.close().await;
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new(Scripted::Succeed(dir.path().join("out"))));
    let p = pipeline(runner.clone(), &dir.path().join("results"), 2).await;

    let envelope = Envelope {
        kind: "file.detected".into(),
        payload: b"{not json".to_vec(),
        content_type: CONTENT_TYPE_JSON.into(),
        timestamp: chrono::Utc::now(),
        message_id: uuid::Uuid::new_v4(),
        persistent: true,
    };
    p.publisher
        .publish_envelope("biomarker.file.events", "file.detected.csv", envelope)
        .await
        .unwrap();

    let broker = p.connector.broker();
    eventually(|| broker.queue_depth("file.detected.dead") == 1).await;
    assert_eq!(broker.queue_depth("file.detected"), 0);
    assert_eq!(broker.queue_depth("analysis.requested"), 0);
    assert_eq!(runner.calls(), 0);
    p.manager.close().await;
}

#[tokio::test]
async fn pipeline_resumes_after_unsolicited_closure() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new(Scripted::Succeed(dir.path().join("out"))));
    let p = pipeline(runner.clone(), &dir.path().join("results"), 3).await;

    p.connector.sever_all();
    let connector = p.connector.clone();
    eventually(|| connector.connect_count() >= 2).await;
    p.manager.wait_connected(TIMEOUT).await.unwrap();

    p.publisher
        .publish_event("biomarker", &FileDetected::new("/data/a.csv", ".csv", 1))
        .await
        .unwrap();
    let completion = next_completion(&p).await;
    assert_eq!(completion.status, AnalysisStatus::Success);
    p.manager.close().await;
}
