use fleetflow::core::agent_server::{AgentServer, AgentServerSettings, RESTART_REASON};
use fleetflow::core::dispatch::{
    AgentDispatcher, AgentDispatcherSettings, Dispatcher, Task, TaskStatus,
};
use fleetflow::core::engine::Engine;
use fleetflow::core::modules::ModuleRegistry;
use fleetflow::core::state::{
    FileRunStore, InMemoryRunStore, RunState, RunStateStore, RunStatus,
};
use fleetflow::core::workflow::{load_str, HostSpec, Step};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct Agent {
    base: String,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl Agent {
    async fn start(store: Arc<dyn RunStateStore>, settings: AgentServerSettings) -> Self {
        let server = AgentServer::new(
            ModuleRegistry::with_builtins().unwrap(),
            store,
            AgentServerSettings {
                bind: "127.0.0.1:0".into(),
                ..settings
            },
        )
        .await;
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(server.serve(shutdown.clone(), Some(ready_tx)));
        let addr = ready_rx.await.unwrap();
        Self {
            base: format!("http://{}", addr),
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    async fn default() -> Self {
        Self::start(
            Arc::new(InMemoryRunStore::new()),
            AgentServerSettings::default(),
        )
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    /// Poll `/status` until the task leaves `running`.
    async fn wait_done(&self, task_id: &str) -> Value {
        for _ in 0..200 {
            let (_, body) = self.post("/status", json!({ "task_id": task_id })).await;
            if body["result"]["status"] != "running" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {} never finished", task_id);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn cmd_task(id: &str, run_id: &str, cmd: &str) -> Value {
    json!({
        "task": {
            "id": id,
            "run_id": run_id,
            "step": { "name": "hello", "action": "cmd.run", "args": { "cmd": cmd } },
            "host": { "name": "local" },
            "vars": {}
        }
    })
}

fn async_settings() -> AgentServerSettings {
    AgentServerSettings {
        async_threshold: Duration::from_millis(50),
        ..AgentServerSettings::default()
    }
}

#[tokio::test]
async fn quick_tasks_answer_synchronously_and_are_mirrored() {
    let agent = Agent::default().await;
    let (status, body) = agent
        .post("/run", cmd_task("t-sync-1", "run-agent-sync-1", "echo hi"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run_id"], "run-agent-sync-1");
    assert_eq!(body["result"]["task_id"], "t-sync-1");
    assert_eq!(body["result"]["status"], "success");
    assert_eq!(body["result"]["output"]["stdout"], "hi\n");
    assert!(body.get("error").is_none());

    let (status, run) = agent.get("/run-status?run_id=run-agent-sync-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "success");
    assert_eq!(run["workflow_name"], "hello");
    assert_eq!(run["steps"][0]["hosts"]["local"]["status"], "success");

    // Replaying a finished task returns the stored result.
    let (_, replay) = agent
        .post("/run", cmd_task("t-sync-1", "run-agent-sync-1", "echo other"))
        .await;
    assert_eq!(replay["result"]["output"]["stdout"], "hi\n");
}

#[tokio::test]
async fn failing_commands_report_failed_with_output() {
    let agent = Agent::default().await;
    let (status, body) = agent
        .post("/run", cmd_task("t-fail-1", "run-agent-fail-1", "echo bad >&2; exit 4"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["status"], "failed");
    assert_eq!(body["result"]["output"]["exit_code"], 4);
    assert_eq!(body["result"]["output"]["stderr"], "bad\n");
    assert!(body["error"].as_str().unwrap().starts_with("cmd.run failed"));

    let (_, run) = agent.get("/run-status?run_id=run-agent-fail-1").await;
    assert_eq!(run["status"], "failed");
    assert_eq!(run["last_error"], body["error"]);
}

#[tokio::test]
async fn slow_tasks_switch_to_polling() {
    let agent = Agent::start(Arc::new(InMemoryRunStore::new()), async_settings()).await;
    let (_, body) = agent
        .post(
            "/run",
            cmd_task("t-async-1", "run-agent-async-1", "echo start; sleep 0.3; echo end"),
        )
        .await;
    assert_eq!(body["result"]["status"], "running");

    let (status, polled) = agent.get("/status?task_id=t-async-1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(polled["result"]["output"]["stdout"].is_string());

    let done = agent.wait_done("t-async-1").await;
    assert_eq!(done["result"]["status"], "success");
    assert_eq!(done["result"]["output"]["stdout"], "start\nend\n");

    let (_, health) = agent.get("/health").await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["tasks"], 1);
}

#[tokio::test]
async fn running_tasks_can_be_canceled_once() {
    let agent = Agent::start(Arc::new(InMemoryRunStore::new()), async_settings()).await;
    let (_, body) = agent
        .post("/run", cmd_task("t-cancel-1", "run-agent-cancel-1", "sleep 5"))
        .await;
    assert_eq!(body["result"]["status"], "running");

    let (status, canceled) = agent.post("/cancel", json!({ "task_id": "t-cancel-1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["result"]["status"], "canceled");

    let (_, polled) = agent.get("/status?task_id=t-cancel-1").await;
    assert_eq!(polled["result"]["status"], "canceled");

    let (status, _) = agent.get("/cancel?task_id=t-cancel-1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, run) = agent.get("/run-status?run_id=run-agent-cancel-1").await;
    assert_eq!(run["status"], "canceled");
}

#[tokio::test]
async fn token_is_required_when_configured() {
    let agent = Agent::start(
        Arc::new(InMemoryRunStore::new()),
        AgentServerSettings {
            token: "s3cret".into(),
            ..AgentServerSettings::default()
        },
    )
    .await;

    let (status, body) = agent.post("/run", cmd_task("t-auth-1", "", "echo hi")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let response = agent
        .client
        .post(agent.url("/heartbeat"))
        .header("X-Runner-Token", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let beat: Value = response.json().await.unwrap();
    assert_eq!(beat["status"], "ok");
    assert!(beat["capability"]
        .as_array()
        .unwrap()
        .contains(&json!("cmd.run")));

    let response = agent
        .client
        .post(agent.url("/run"))
        .bearer_auth("s3cret")
        .json(&cmd_task("t-auth-2", "", "echo hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["run_id"], "t-auth-2");

    let (status, _) = agent.get("/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let agent = Agent::start(
        Arc::new(InMemoryRunStore::new()),
        AgentServerSettings {
            max_body_bytes: 512,
            ..AgentServerSettings::default()
        },
    )
    .await;

    let mut unsupported = cmd_task("t-bad-1", "run-agent-bad-1", "true");
    unsupported["task"]["step"]["action"] = json!("pkg.install");
    let (status, body) = agent.post("/run", unsupported).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unsupported action");
    assert_eq!(body["run_id"], "run-agent-bad-1");

    let response = agent
        .client
        .post(agent.url("/run"))
        .body("{ nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let huge = cmd_task("t-big-1", "", &"x".repeat(4096));
    let (status, body) = agent.post("/run", huge).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "payload too large");

    let (status, body) = agent.get("/status").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "task_id is required");
    let (status, _) = agent.get("/status?task_id=missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = agent.get("/run-status").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = agent.get("/run-status?run_id=run-never-seen").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "run not found");
}

#[tokio::test]
async fn startup_interrupts_runs_left_running() {
    let store = Arc::new(InMemoryRunStore::new());
    store
        .create_run(RunState {
            status: RunStatus::Running,
            ..RunState::new("run-stale-001", "deploy")
        })
        .await
        .unwrap();

    let agent = Agent::start(store.clone(), AgentServerSettings::default()).await;
    let (_, run) = agent.get("/run-status?run_id=run-stale-001").await;
    assert_eq!(run["status"], "interrupted");
    assert_eq!(run["interrupted_reason"], RESTART_REASON);
}

#[tokio::test]
async fn dispatcher_streams_output_from_a_live_agent() {
    let agent = Agent::start(
        Arc::new(InMemoryRunStore::new()),
        AgentServerSettings {
            token: "tok".into(),
            ..async_settings()
        },
    )
    .await;

    let chunks = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&chunks);
    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        base_url: agent.base.clone(),
        token: "tok".into(),
        heartbeat: true,
        poll_interval: Duration::from_millis(20),
        ..AgentDispatcherSettings::default()
    })
    .with_output_callback(Arc::new(
        move |_task_id: &str, _step: &str, _host: &str, stream: &str, chunk: &str| {
            if stream == "stdout" {
                sink.lock().unwrap().push_str(chunk);
            }
        },
    ));

    let mut step = Step::new("stream", "cmd.run");
    step.args
        .insert("cmd".into(), json!("echo one; sleep 0.3; echo two"));
    let task = Task {
        id: "t-live-1".into(),
        run_id: "run-agent-live-1".into(),
        step,
        host: HostSpec {
            name: "local".into(),
            ..HostSpec::default()
        },
        ..Task::default()
    };

    let result = dispatcher
        .dispatch(task, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.output["stdout"], json!("one\ntwo\n"));
    assert_eq!(*chunks.lock().unwrap(), "one\ntwo\n");

    let (status, _) = agent.get("/run-status?run_id=run-agent-live-1").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let run: Value = agent
        .client
        .get(agent.url("/run-status?run_id=run-agent-live-1"))
        .bearer_auth("tok")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run["status"], "success");
    assert_eq!(run["steps"][0]["name"], "stream");
}

#[tokio::test]
async fn controller_and_agent_can_share_one_state_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn RunStateStore> =
        Arc::new(FileRunStore::new(dir.path().join("runs.json")));
    let agent = Agent::start(Arc::clone(&store), AgentServerSettings::default()).await;

    let workflow = load_str(
        r#"
version: v1
name: shared
inventory:
  hosts:
    web1: {}
steps:
  - name: first
    action: env.set
    args: { env: { A: "1" } }
  - name: second
    action: env.set
    args: { env: { B: "2" } }
"#,
    )
    .unwrap();
    let dispatcher = AgentDispatcher::new(AgentDispatcherSettings {
        base_url: agent.base.clone(),
        ..AgentDispatcherSettings::default()
    });
    let run = Engine::new(ModuleRegistry::with_builtins().unwrap())
        .with_store(Arc::clone(&store))
        .with_dispatcher(Arc::new(dispatcher) as Arc<dyn Dispatcher>)
        .apply(&workflow, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let stored = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.workflow_name, "shared");
    assert_eq!(stored.step("second").unwrap().status, RunStatus::Success);
}
