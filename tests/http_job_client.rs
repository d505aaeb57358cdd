//! Integration tests for the REST job client against a mock job system

use chrono::{TimeZone, Utc};
use pipewright::dag::{Edge, TaskGraph};
use pipewright::executors::{HostCallbacks, HttpJobClient, ShellCallbacks};
use pipewright::external::submission_key;
use pipewright::models::{
    ExternalStatus, MonitorState, Run, RunHandle, RunStatus, StepDefinition, Task, TaskKind,
    TaskParams, TaskState, WaitSource,
};
use pipewright::retry::RetryPolicy;
use pipewright::scheduler::TaskScheduler;
use pipewright::signal::CancelSignal;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn params(job_flow_id: &str) -> TaskParams {
    let mut params = TaskParams::new();
    params.insert("job_flow_id".to_string(), job_flow_id.to_string());
    params
}

fn steps() -> StepDefinition {
    StepDefinition(serde_json::json!([
        {"Name": "move raw data from S3 to HDFS"},
        {"Name": "classify movie reviews"}
    ]))
}

#[tokio::test]
async fn test_submit_watches_last_step() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/job-flows/j-1/steps"))
        .and(header("Idempotency-Key", "key-1"))
        .and(body_json(serde_json::json!({ "steps": steps().0 })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "step_ids": ["s-1", "s-2"] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpJobClient::new(&format!("{}/api", server.uri())).unwrap();
    let handle = client
        .submit(&params("j-1"), &steps(), "key-1")
        .await
        .unwrap();

    assert_eq!(handle.job_id, "j-1");
    assert_eq!(handle.step_id, "s-2");
    assert_eq!(handle.submitted_steps, 2);
    assert_eq!(handle.state, MonitorState::Submitted);
}

#[tokio::test]
async fn test_submit_error_status_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/job-flows/j-1/steps"))
        .respond_with(ResponseTemplate::new(503).set_body_string("throttled"))
        .mount(&server)
        .await;

    let client = HttpJobClient::new(&server.uri()).unwrap();
    let err = client
        .submit(&params("j-1"), &steps(), "key-1")
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("503"), "{}", message);
    assert!(message.contains("throttled"), "{}", message);
}

#[tokio::test]
async fn test_poll_maps_job_states() {
    let server = MockServer::start().await;

    for (step, body) in [
        ("s-run", serde_json::json!({ "state": "RUNNING" })),
        ("s-done", serde_json::json!({ "state": "COMPLETED" })),
        (
            "s-bad",
            serde_json::json!({ "state": "FAILED", "message": "container killed" }),
        ),
        ("s-gone", serde_json::json!({ "state": "CANCELLED" })),
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/job-flows/j-1/steps/{}", step)))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
    }

    let client = HttpJobClient::new(&server.uri()).unwrap();
    let poll = |step: &str| {
        let client = client.clone();
        let handle = pipewright::models::ExternalStepHandle::new("j-1", step, 1);
        async move { client.poll(&handle).await }
    };

    assert_eq!(poll("s-run").await.unwrap(), ExternalStatus::Running);
    assert_eq!(poll("s-done").await.unwrap(), ExternalStatus::Completed);
    assert_eq!(
        poll("s-bad").await.unwrap(),
        ExternalStatus::Failed(Some("container killed".to_string()))
    );
    assert_eq!(poll("s-gone").await.unwrap(), ExternalStatus::Cancelled);
}

#[tokio::test]
async fn test_missing_job_flow_id_rejected() {
    let client = HttpJobClient::new("http://127.0.0.1:9").unwrap();
    let err = client
        .submit(&TaskParams::new(), &steps(), "key-1")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("job_flow_id"));
}

#[tokio::test]
async fn test_submit_and_wait_through_scheduler() {
    let server = MockServer::start().await;

    let request_key = submission_key(
        "user_behaviour@2022-01-11T00:00:00Z",
        "start_emr_movie_classification_script",
        1,
    );
    Mock::given(method("POST"))
        .and(path("/job-flows/j-2AXXXXXXGAPLF/steps"))
        .and(header("Idempotency-Key", request_key.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "step_ids": ["s-9"] })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/job-flows/j-2AXXXXXXGAPLF/steps/s-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "state": "COMPLETED" })))
        .mount(&server)
        .await;

    let callbacks = HostCallbacks::new(
        ShellCallbacks::new(),
        Some(HttpJobClient::new(&server.uri()).unwrap()),
    );

    let submit = Task::new(
        "start_emr_movie_classification_script",
        TaskKind::ExternalJobSubmit { steps: steps() },
    )
    .with_param("job_flow_id", "j-2AXXXXXXGAPLF");
    let wait = Task::new(
        "wait_for_movie_classification_transformation",
        TaskKind::ExternalJobWait {
            source: WaitSource::Upstream("start_emr_movie_classification_script".to_string()),
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        },
    );
    let graph = Arc::new(
        TaskGraph::build(
            "user_behaviour",
            vec![submit, wait],
            &[Edge::new(
                "start_emr_movie_classification_script",
                "wait_for_movie_classification_transformation",
            )],
        )
        .unwrap(),
    );

    let handle = RunHandle::new(
        "user_behaviour",
        Utc.with_ymd_and_hms(2022, 1, 11, 0, 0, 0).unwrap(),
    );
    let run = Run::new(handle, graph.all_tasks().iter().map(|t| t.id.as_str()));
    let scheduler = TaskScheduler::new(Arc::new(callbacks))
        .with_default_retry(RetryPolicy::no_retry());

    let report = scheduler
        .execute_run(graph, run, CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    let wait = report
        .instance("wait_for_movie_classification_transformation")
        .unwrap();
    assert_eq!(wait.state, TaskState::Success);
    let watched = wait.external.as_ref().unwrap();
    assert_eq!(watched.step_id, "s-9");
    assert_eq!(watched.state, MonitorState::Completed);
}
