use fleetflow::core::workflow::{as_vars, load_file, load_str, render_vars};
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;

const DEPLOY_WORKFLOW: &str = r#"
version: v0.1
name: deploy-web
description: roll the web tier
plan:
  mode: manual-approve
  strategy: sequential
vars:
  release: "1.4.2"
inventory:
  vars: { user: deploy }
  hosts:
    web1: { address: 10.0.0.1, vars: { weight: 10 } }
    web2: { address: 10.0.0.2 }
  groups:
    web: { hosts: [web1, web2], vars: { role: web } }
steps:
  - name: fetch
    action: cmd.run
    targets: [web]
    with:
      cmd: "curl -fsSL https://artifacts/app-${release}.tgz -o /tmp/app.tgz"
    retries: 2
    timeout: 30s
  - name: restart
    action: shell.run
    loop: [app, worker]
    args:
      script: "systemctl restart ${item}"
    continue_on_error: true
    notify: [reload-lb]
    must_vars: [role]
    expect_vars: [PID]
handlers:
  - name: reload-lb
    action: cmd.run
    with: { cmd: "lbctl reload" }
tests:
  - name: smoke
    action: cmd.run
    with: { cmd: "curl -f http://localhost/health" }
"#;

fn write_workflow(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    write!(file, "{}", yaml).expect("write workflow");
    file
}

#[test]
fn full_document_loads_from_disk() {
    let file = write_workflow(DEPLOY_WORKFLOW);
    let workflow = load_file(file.path()).unwrap();
    workflow.validate().unwrap();

    assert_eq!(workflow.name, "deploy-web");
    assert_eq!(workflow.plan.mode, "manual-approve");
    assert_eq!(workflow.steps.len(), 2);
    assert_eq!(workflow.handlers.len(), 1);
    assert_eq!(workflow.tests.len(), 1);

    let fetch = &workflow.steps[0];
    assert_eq!(fetch.retries, 2);
    assert_eq!(fetch.timeout, "30s");
    assert!(fetch.args["cmd"].as_str().unwrap().contains("${release}"));

    let restart = &workflow.steps[1];
    assert_eq!(restart.loop_items, vec![json!("app"), json!("worker")]);
    assert!(restart.continue_on_error);
    assert_eq!(restart.notify, vec!["reload-lb"]);
    assert_eq!(restart.must_vars, vec!["role"]);
    assert_eq!(restart.expect_vars, vec!["PID"]);

    let handler_step = workflow.handlers[0].as_step();
    assert_eq!(handler_step.name, "reload-lb");
    assert_eq!(handler_step.args["cmd"], json!("lbctl reload"));
}

#[test]
fn inventory_layers_vars_onto_hosts() {
    let workflow = load_str(DEPLOY_WORKFLOW).unwrap();
    let hosts = workflow.inventory.resolve_hosts();
    assert_eq!(hosts.len(), 2);
    let web1 = &hosts["web1"];
    assert_eq!(web1.vars["user"], json!("deploy"));
    assert_eq!(web1.vars["role"], json!("web"));
    assert_eq!(web1.vars["weight"], json!(10));
    assert_eq!(web1.groups, vec!["web"]);
    assert!(!hosts["web2"].vars.contains_key("weight"));
}

#[test]
fn json_documents_load_too() {
    let workflow = load_str(
        r#"{"version":"v1","name":"json","inventory":{"hosts":{"a":{}}},
            "steps":[{"name":"s","action":"env.set","args":{"env":{"A":"1"}}}]}"#,
    )
    .unwrap();
    workflow.validate().unwrap();
    assert_eq!(workflow.steps[0].action, "env.set");
}

#[test]
fn empty_plan_policy_is_accepted() {
    let workflow = load_str(
        "version: v1\nname: bare\nsteps:\n  - { name: s, action: cmd.run, args: { cmd: 'true' } }\n",
    )
    .unwrap();
    assert!(workflow.plan.mode.is_empty());
    assert!(workflow.validation_issues().is_empty());
}

#[test]
fn validation_collects_every_issue() {
    let workflow = load_str(
        r#"
version: ""
name: broken
plan: { mode: yolo }
steps:
  - name: a
    action: ""
  - name: a
    action: cmd.run
    notify: [ghost]
"#,
    )
    .unwrap();
    let issues = workflow.validation_issues();
    assert_eq!(
        issues,
        vec![
            "plan.mode must be manual-approve or auto, got \"yolo\"".to_string(),
            "step name \"a\" is duplicated".to_string(),
            "steps[0] action is required".to_string(),
            "steps[1] notify handler \"ghost\" not found".to_string(),
            "version is required".to_string(),
        ]
    );
    let err = workflow.validate().unwrap_err();
    assert_eq!(err.code, "FF-VALIDATE-001");
}

#[test]
fn malformed_documents_are_serialization_errors() {
    let err = load_str("steps: {not: [a list").unwrap_err();
    assert_eq!(err.code, "FF-WORKFLOW-002");
    let err = load_file(std::path::Path::new("/definitely/not/here.yaml")).unwrap_err();
    assert_eq!(err.code, "FF-WORKFLOW-001");
}

#[test]
fn args_render_against_scope() {
    let workflow = load_str(DEPLOY_WORKFLOW).unwrap();
    let scope = as_vars(&json!({ "release": "1.4.2", "item": "worker" })).unwrap();
    let fetch = render_vars(&workflow.steps[0].args, &scope);
    assert_eq!(
        fetch["cmd"],
        json!("curl -fsSL https://artifacts/app-1.4.2.tgz -o /tmp/app.tgz")
    );
    let restart = render_vars(&workflow.steps[1].args, &scope);
    assert_eq!(restart["script"], json!("systemctl restart worker"));
}
