use async_trait::async_trait;
use fleetflow::core::dispatch::{AgentDispatcher, AgentDispatcherSettings, Dispatcher, TaskResult};
use fleetflow::core::engine::{Engine, Recorder, RunOptions};
use fleetflow::core::error::AppError;
use fleetflow::core::executor::{Observer, StepOutcome};
use fleetflow::core::modules::ModuleRegistry;
use fleetflow::core::state::{
    is_already_exists, HttpNotifier, InMemoryRunStore, RunState, RunStateStore, RunStatus,
};
use fleetflow::core::workflow::{load_str, HostSpec, Step, Workflow};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PIPELINE: &str = r#"
version: v1
name: pipeline
inventory:
  hosts:
    local: {}
steps:
  - name: stage
    action: env.set
    args:
      env: { STAGE: prod }
  - name: build
    action: cmd.run
    expect_vars: [BUILD]
    args:
      cmd: 'echo "FLEETFLOW_EXPORT: BUILD=$STAGE-42"'
      export_vars: true
  - name: publish
    action: cmd.run
    must_vars: [BUILD]
    args:
      cmd: printf '%s/%s' "$BUILD" "$REGION"
"#;

const FAILING: &str = r#"
version: v1
name: broken
inventory:
  hosts:
    local: {}
steps:
  - name: explode
    action: cmd.run
    args:
      cmd: echo oops >&2; exit 3
  - name: never
    action: cmd.run
    args:
      cmd: "true"
"#;

fn engine() -> Engine {
    Engine::new(ModuleRegistry::with_builtins().unwrap())
}

fn workflow(yaml: &str) -> Workflow {
    load_str(yaml).unwrap()
}

fn host_output(run: &RunState, step: &str, key: &str) -> Value {
    run.step(step).unwrap().hosts["local"].output[key].clone()
}

#[derive(Default)]
struct LogRecorder {
    lines: Mutex<Vec<String>>,
}

#[async_trait]
impl Observer for LogRecorder {
    async fn step_start(&self, step: &Step, _targets: &[HostSpec]) -> Result<(), AppError> {
        self.lines.lock().unwrap().push(format!("start {}", step.name));
        Ok(())
    }

    async fn step_finish(&self, step: &Step, outcome: StepOutcome) -> Result<(), AppError> {
        self.lines
            .lock()
            .unwrap()
            .push(format!("finish {} {}", step.name, outcome));
        Ok(())
    }
}

#[async_trait]
impl Recorder for LogRecorder {
    async fn host_result(
        &self,
        step: &Step,
        host: &HostSpec,
        result: &TaskResult,
    ) -> Result<(), AppError> {
        self.lines
            .lock()
            .unwrap()
            .push(format!("host {} {} {}", step.name, host.name, result.status));
        Ok(())
    }
}

#[tokio::test]
async fn apply_threads_env_and_exports_through_the_run() {
    let store = Arc::new(InMemoryRunStore::new());
    let recorder = Arc::new(LogRecorder::default());
    let mut env = BTreeMap::new();
    env.insert("REGION".to_string(), "eu-west".to_string());

    let run = engine()
        .apply_with_run(
            &workflow(PIPELINE),
            RunOptions {
                run_id: "run-engine-ok-1".into(),
                store: Some(store.clone()),
                recorder: Some(recorder.clone()),
                env,
                ..RunOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(run.run_id, "run-engine-ok-1");
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.finished_at.is_some());
    let statuses: Vec<(&str, RunStatus)> = run
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("stage", RunStatus::Success),
            ("build", RunStatus::Success),
            ("publish", RunStatus::Success),
        ]
    );
    assert_eq!(host_output(&run, "stage", "env"), json!({ "STAGE": "prod" }));
    assert_eq!(host_output(&run, "build", "vars"), json!({ "BUILD": "prod-42" }));
    assert_eq!(host_output(&run, "publish", "stdout"), json!("prod-42/eu-west"));

    let stored = store.get_run("run-engine-ok-1").await.unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.version, run.version);

    assert_eq!(
        *recorder.lines.lock().unwrap(),
        vec![
            "start stage",
            "host stage local success",
            "finish stage success",
            "start build",
            "host build local success",
            "finish build success",
            "start publish",
            "host publish local success",
            "finish publish success",
        ]
    );
}

#[tokio::test]
async fn failed_apply_returns_the_final_snapshot() {
    let store = Arc::new(InMemoryRunStore::new());
    let failure = engine()
        .with_store(store.clone())
        .apply(&workflow(FAILING), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.error.code, "FF-CMD-001");
    let run = failure.run.expect("snapshot after start");
    assert!(run.run_id.starts_with("run-"));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.message, failure.error.to_string());
    assert_eq!(run.last_error, failure.error.to_string());
    assert!(run.step("never").is_none());

    let explode = &run.step("explode").unwrap().hosts["local"];
    assert_eq!(explode.status, RunStatus::Failed);
    assert_eq!(explode.output["exit_code"], json!(3));
    assert_eq!(explode.output["stderr"], json!("oops\n"));

    assert_eq!(
        store.get_run(&run.run_id).await.unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn canceled_apply_is_recorded_as_canceled() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let failure = engine()
        .apply(&workflow(PIPELINE), &cancel)
        .await
        .unwrap_err();
    assert!(failure.error.is_canceled());
    assert_eq!(failure.run.unwrap().status, RunStatus::Canceled);
}

#[tokio::test]
async fn run_id_problems_fail_before_the_run_starts() {
    let store = Arc::new(InMemoryRunStore::new());
    store
        .create_run(RunState::new("run-taken-01", "pipeline"))
        .await
        .unwrap();
    let engine = engine().with_store(store);

    let failure = engine
        .apply_with_run(
            &workflow(PIPELINE),
            RunOptions {
                run_id: "run-taken-01".into(),
                ..RunOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(failure.run.is_none());
    assert!(is_already_exists(&failure.error));

    let failure = engine
        .apply_with_run(
            &workflow(PIPELINE),
            RunOptions {
                run_id: "bad id!".into(),
                ..RunOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(failure.run.is_none());
    assert_eq!(failure.error.code, "FF-STATE-013");
}

async fn wait_for<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn state_changes_are_posted_to_the_notifier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/runs"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let notifier = HttpNotifier::new(format!("{}/hooks/runs", server.uri()), &BTreeMap::new());
    let run = engine()
        .with_notifier(Arc::new(notifier), 0, Duration::from_millis(10))
        .apply_with_run(
            &workflow(PIPELINE),
            RunOptions {
                run_id: "run-notify-01".into(),
                ..RunOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let server_ref = &server;
    wait_for(move || async move {
        let Some(requests) = server_ref.received_requests().await else {
            return false;
        };
        let bodies: Vec<Value> = requests
            .iter()
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .filter(|body| body["run_id"] == "run-notify-01")
            .collect();
        let finished = bodies
            .iter()
            .any(|body| body["status"] == "success" && body["step"].is_null());
        let host_updates = bodies.iter().filter(|body| body["host"] == "local").count();
        finished && host_updates == 3
    })
    .await;
}

#[tokio::test]
async fn notify_failures_are_kept_on_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryRunStore::new());
    let notifier = HttpNotifier::new(server.uri(), &BTreeMap::new());
    engine()
        .with_store(store.clone())
        .apply_with_run(
            &workflow(PIPELINE),
            RunOptions {
                run_id: "run-notify-02".into(),
                notifier: Some(Arc::new(notifier)),
                notify_retry: Some(1),
                notify_delay: Some(Duration::from_millis(5)),
                ..RunOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    wait_for(|| {
        let store = Arc::clone(&store);
        async move {
            store
                .get_run("run-notify-02")
                .await
                .map(|run| !run.last_notify_error.is_empty())
                .unwrap_or(false)
        }
    })
    .await;
    let run = store.get_run("run-notify-02").await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn plan_lists_desired_changes_without_running_anything() {
    let plan = engine().plan(&workflow(PIPELINE)).await.unwrap();
    assert_eq!(plan.workflow_name, "pipeline");
    assert_eq!(plan.change_count(), 3);

    let stage = &plan.steps[0].changes[0];
    assert_eq!(stage.resource_id, "stage:local");
    assert_eq!(stage.diff["env"].current, Value::Null);
    assert_eq!(stage.diff["env"].desired, json!({ "STAGE": "prod" }));

    let publish = &plan.steps[2];
    assert_eq!(publish.targets, vec!["local"]);
    assert_eq!(
        publish.changes[0].diff["cmd"].desired,
        json!("printf '%s/%s' \"$BUILD\" \"$REGION\"")
    );
}

#[tokio::test]
async fn plan_rejects_unknown_modules() {
    let wf = workflow(
        r#"
name: odd
inventory: { hosts: { local: {} } }
steps:
  - { name: mystery, action: pkg.install }
"#,
    );
    let err = engine().plan(&wf).await.unwrap_err();
    assert_eq!(err.code, "FF-DISPATCH-001");
}

#[tokio::test]
async fn reconcile_interrupts_runs_left_running() {
    let store = Arc::new(InMemoryRunStore::new());
    for (id, status) in [
        ("run-left-001", RunStatus::Running),
        ("run-left-002", RunStatus::Running),
        ("run-done-001", RunStatus::Success),
    ] {
        store
            .create_run(RunState {
                status,
                ..RunState::new(id, "pipeline")
            })
            .await
            .unwrap();
    }
    let engine = engine().with_store(store.clone());
    assert_eq!(
        engine
            .reconcile_running(None, "controller restarted")
            .await
            .unwrap(),
        2
    );
    let run = store.get_run("run-left-001").await.unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
    assert_eq!(run.interrupted_reason, "controller restarted");

    let other = InMemoryRunStore::new();
    other
        .create_run(RunState {
            status: RunStatus::Running,
            ..RunState::new("run-other-01", "pipeline")
        })
        .await
        .unwrap();
    assert_eq!(engine.reconcile_running(Some(&other), "x").await.unwrap(), 1);
    assert_eq!(engine.reconcile_running(None, "x").await.unwrap(), 0);
}

#[tokio::test]
async fn inventory_hosts_without_address_dispatch_to_the_configured_agent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .and(body_partial_json(json!({ "task": { "host": { "name": "web1" } } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": { "status": "success", "output": { "stdout": "pong\n" } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let remote = workflow(
        r#"
version: v1
name: remote
inventory:
  hosts:
    web1: {}
steps:
  - name: ping
    action: cmd.run
    args: { cmd: echo pong }
"#,
    );
    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        base_url: server.uri(),
        retry_delay: Duration::from_millis(10),
        ..AgentDispatcherSettings::default()
    });
    let run = engine()
        .with_dispatcher(Arc::new(dispatcher) as Arc<dyn Dispatcher>)
        .apply(&remote, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(
        run.step("ping").unwrap().hosts["web1"].output["stdout"],
        json!("pong\n")
    );
}
