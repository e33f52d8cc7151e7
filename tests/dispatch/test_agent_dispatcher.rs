use fleetflow::core::dispatch::{
    AgentDispatcher, AgentDispatcherSettings, Dispatcher, Task, TaskStatus,
};
use fleetflow::core::workflow::{HostSpec, Step, Vars};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn task() -> Task {
    Task {
        id: "t-1".into(),
        run_id: "run-1".into(),
        step: Step::new("deploy", "cmd.run"),
        host: HostSpec {
            name: "web1".into(),
            ..HostSpec::default()
        },
        vars: Vars::new(),
    }
}

fn settings(server: &MockServer) -> AgentDispatcherSettings {
    AgentDispatcherSettings {
        base_url: server.uri(),
        retry_delay: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        ..AgentDispatcherSettings::default()
    }
}

fn envelope(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "result": result }))
}

#[tokio::test]
async fn sync_dispatch_sends_task_token_and_extra_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .and(header("authorization", "Bearer s3cret"))
        .and(header("x-runner-token", "s3cret"))
        .and(header("x-team", "ops"))
        .and(body_partial_json(json!({
            "task": { "id": "t-1", "run_id": "run-1", "step": { "name": "deploy" } }
        })))
        .respond_with(envelope(json!({
            "task_id": "t-1",
            "status": "success",
            "output": { "stdout": "deployed\n" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut headers = BTreeMap::new();
    headers.insert("X-Team".to_string(), "ops".to_string());
    headers.insert("X-Blank".to_string(), "  ".to_string());
    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        token: " s3cret ".into(),
        headers,
        ..settings(&server)
    });

    let result = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.task_id, "t-1");
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.output["stdout"], json!("deployed\n"));
}

#[tokio::test]
async fn host_address_takes_precedence_over_base_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "status": "success" })))
        .expect(1)
        .mount(&server)
        .await;

    let mut task = task();
    task.host.address = format!("{}/", server.uri());
    let dispatcher = AgentDispatcher::with_base_url("http://127.0.0.1:9");
    let result = dispatcher
        .dispatch(task, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.task_id, "t-1");
}

#[tokio::test]
async fn bare_inventory_address_uses_the_configured_base_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "status": "success" })))
        .expect(1)
        .mount(&server)
        .await;

    let mut task = task();
    task.host = HostSpec::new("web1");
    assert_eq!(task.host.address, "web1");
    let result = AgentDispatcher::new(settings(&server))
        .dispatch(task, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Success);
}

#[tokio::test]
async fn bare_address_without_base_url_is_reached_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "status": "success" })))
        .expect(1)
        .mount(&server)
        .await;

    let mut task = task();
    task.host.address = server.address().to_string();
    let result = AgentDispatcher::new(AgentDispatcherSettings::default())
        .dispatch(task, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.task_id, "t-1");
}

#[tokio::test]
async fn missing_base_url_is_a_configuration_error() {
    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings::default());
    let err = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error.code, "FF-AGENT-001");
    assert_eq!(err.error.message, "agent dispatcher base url is required");
}

#[tokio::test]
async fn running_tasks_are_polled_and_stream_only_new_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "task_id": "t-1", "status": "running" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/status"))
        .and(body_partial_json(json!({ "task_id": "t-1" })))
        .respond_with(envelope(json!({
            "task_id": "t-1", "status": "running", "output": { "stdout": "foo" }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/status"))
        .respond_with(envelope(json!({
            "task_id": "t-1", "status": "running", "output": { "stdout": "foobar" }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/status"))
        .respond_with(envelope(json!({
            "task_id": "t-1", "status": "success", "output": { "stdout": "foobar" }
        })))
        .mount(&server)
        .await;

    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&chunks);
    let dispatcher = AgentDispatcher::new(settings(&server)).with_output_callback(Arc::new(
        move |task_id: &str, step: &str, host: &str, stream: &str, chunk: &str| {
            sink.lock()
                .unwrap()
                .push(format!("{} {} {} {} {}", task_id, step, host, stream, chunk));
        },
    ));

    let result = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.output["stdout"], json!("foobar"));
    assert_eq!(
        *chunks.lock().unwrap(),
        vec!["t-1 deploy web1 stdout foo", "t-1 deploy web1 stdout bar"]
    );
}

#[tokio::test]
async fn polled_result_without_status_counts_as_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "task_id": "t-1", "status": "running" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/custom-status"))
        .respond_with(envelope(json!({ "task_id": "t-1", "output": { "exit_code": 0 } })))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        status_path: "/custom-status".into(),
        ..settings(&server)
    });
    let result = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Success);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(500).set_body_string("busy"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "task_id": "t-1", "status": "success" })))
        .mount(&server)
        .await;

    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        retry_max: 2,
        ..settings(&server)
    });
    let result = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn exhausted_retries_report_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(2)
        .mount(&server)
        .await;

    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        retry_max: 1,
        ..settings(&server)
    });
    let err = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error.code, "FF-AGENT-003");
    assert_eq!(
        err.error.message,
        "agent dispatch failed: 500 Internal Server Error (boom)"
    );
}

#[tokio::test]
async fn envelope_error_fails_with_partial_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "task_id": "t-1", "output": { "stderr": "no space left" } },
            "error": "disk full"
        })))
        .mount(&server)
        .await;

    let dispatcher = AgentDispatcher::new(settings(&server));
    let err = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error.code, "FF-AGENT-007");
    assert_eq!(err.error.message, "disk full");
    assert_eq!(err.partial.status, TaskStatus::Failed);
    assert_eq!(err.partial.error, "disk full");
    assert_eq!(err.partial.output["stderr"], json!("no space left"));
}

#[tokio::test]
async fn heartbeat_precedes_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/heartbeat"))
        .and(header("x-runner-token", "tok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "status": "success" })))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        heartbeat: true,
        token: "tok".into(),
        ..settings(&server)
    });
    dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_heartbeat_skips_the_run_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/heartbeat"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "status": "success" })))
        .expect(0)
        .mount(&server)
        .await;

    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        heartbeat: true,
        ..settings(&server)
    });
    let err = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error.code, "FF-AGENT-002");
}

#[tokio::test]
async fn polling_stops_on_cancel_and_on_async_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(envelope(json!({ "task_id": "t-1", "status": "running" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/status"))
        .respond_with(envelope(json!({ "task_id": "t-1", "status": "running" })))
        .mount(&server)
        .await;

    let dispatcher = AgentDispatcher::new(settings(&server));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = dispatcher.dispatch(task(), cancel).await.unwrap_err();
    assert!(err.error.is_canceled());

    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        async_timeout: Duration::from_millis(80),
        ..settings(&server)
    });
    let err = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error.code, "FF-AGENT-009");
}

#[tokio::test]
async fn heartbeat_failure_on_last_attempt_keeps_the_partial_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/heartbeat"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/heartbeat"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "task_id": "t-1", "output": { "stdout": "half done" } },
            "error": "disk full"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        heartbeat: true,
        retry_max: 1,
        ..settings(&server)
    });
    let err = dispatcher
        .dispatch(task(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error.code, "FF-AGENT-002");
    assert_eq!(err.partial.status, TaskStatus::Failed);
    assert_eq!(err.partial.error, "disk full");
    assert_eq!(err.partial.output["stdout"], json!("half done"));
}
