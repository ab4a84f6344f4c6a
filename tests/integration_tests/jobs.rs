// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Job observation: caller context, audit ordering, filters

use crate::common::setup;
use serde_json::json;
use serde_json::Value;
use uuid::Uuid;

// The caller recorded at API time rides through the composer into the
// job's params.context.
#[tokio::test]
async fn test_provision_records_caller() {
    let cptestctx = setup("provision_records_caller").await;
    let caller = json!({
        "caller": {
            "type": "signature",
            "ip": "127.0.0.68",
            "keyId": "/admin/keys/id_rsa",
        },
        "params": {"reason": "nightly rebuild"},
    });
    let response = cptestctx
        .client
        .post(cptestctx.url("/vms"))
        .header("x-context", caller.to_string())
        .header("x-request-id", "cafecafe-0000-4000-8000-000000000001")
        .json(&cptestctx.provision_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let accepted: Value = response.json().await.unwrap();
    let job: Uuid = accepted["job_uuid"].as_str().unwrap().parse().unwrap();

    let record = cptestctx.wait_job(job).await;
    assert!(record["name"].as_str().unwrap().contains("provision"));
    assert_eq!(record["task"], "provision");
    assert_eq!(record["params"]["context"]["caller"], caller["caller"]);
}

// Audit for a VM: jobs come back in reverse creation order, matching the
// actions performed.
#[tokio::test]
async fn test_vm_job_audit_order() {
    let cptestctx = setup("vm_job_audit_order").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;
    cptestctx.action_and_wait(vm, &json!({"action": "stop"})).await;
    cptestctx.wait_vm_state(vm, "stopped").await;
    cptestctx.action_and_wait(vm, &json!({"action": "start"})).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let jobs: Vec<Value> = serde_json::from_value(
        cptestctx.get_json(&format!("/vms/{}/jobs", vm)).await,
    )
    .unwrap();
    let tasks: Vec<&str> =
        jobs.iter().map(|j| j["task"].as_str().unwrap()).collect();
    assert_eq!(tasks, vec!["start", "stop", "provision"]);
    for job in &jobs {
        assert_eq!(job["vm_uuid"], vm.to_string());
        assert_eq!(job["execution"], "succeeded");
    }
}

#[tokio::test]
async fn test_job_filters() {
    let cptestctx = setup("job_filters").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;
    cptestctx.action_and_wait(vm, &json!({"action": "stop"})).await;

    let jobs: Vec<Value> = serde_json::from_value(
        cptestctx.get_json("/jobs?task=provision").await,
    )
    .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["task"], "provision");

    let jobs: Vec<Value> = serde_json::from_value(
        cptestctx
            .get_json(&format!("/jobs?vm_uuid={}&execution=succeeded", vm))
            .await,
    )
    .unwrap();
    assert_eq!(jobs.len(), 2);

    let response = cptestctx.get("/jobs?execution=paused").await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    let response =
        cptestctx.get(&format!("/jobs/{}", Uuid::new_v4())).await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

// Two concurrent mutations on one VM both get a 202 and a job; the
// pipelines serialize at the VM ticket and both land.
#[tokio::test]
async fn test_concurrent_mutations_serialize() {
    let cptestctx = setup("concurrent_mutations_serialize").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let first = cptestctx
        .post(&format!("/vms/{}/tags", vm), &json!({"first": "1"}))
        .await;
    let second = cptestctx
        .post(&format!("/vms/{}/tags", vm), &json!({"second": "2"}))
        .await;
    assert_eq!(first.status(), reqwest::StatusCode::ACCEPTED);
    assert_eq!(second.status(), reqwest::StatusCode::ACCEPTED);
    let first: Value = first.json().await.unwrap();
    let second: Value = second.json().await.unwrap();
    for accepted in [&first, &second] {
        let job: Uuid =
            accepted["job_uuid"].as_str().unwrap().parse().unwrap();
        let job = cptestctx.wait_job(job).await;
        assert_eq!(job["execution"], "succeeded");
    }

    let tags = cptestctx.get_json(&format!("/vms/{}/tags", vm)).await;
    assert_eq!(tags, json!({"first": "1", "second": "2"}));
}

#[tokio::test]
async fn test_ping() {
    let cptestctx = setup("ping").await;
    let body = cptestctx.get_json("/ping").await;
    assert_eq!(body["ping"], "pong");
    assert_eq!(body["store"], "ok");
    assert_eq!(body["workflow_executor"], "ok");
}
