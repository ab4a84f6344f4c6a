// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Migration phases: begin, sync, switch, abort, and automatic chaining

use crate::common::setup;
use crate::common::TestContext;
use serde_json::json;
use serde_json::Value;
use std::time::Duration;
use std::time::Instant;
use uuid::Uuid;

async fn migrate(
    cptestctx: &TestContext,
    vm: Uuid,
    action: &str,
) -> Value {
    cptestctx
        .action_and_wait(
            vm,
            &json!({"action": "migrate", "migration_action": action}),
        )
        .await
}

#[tokio::test]
async fn test_migrate_phases() {
    let cptestctx = setup("migrate_phases").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    let record = cptestctx.wait_vm_state(vm, "running").await;
    let source = record["server_uuid"].as_str().unwrap().to_string();

    // sync before begin is rejected
    let response = cptestctx
        .post(
            &format!("/vms/{}", vm),
            &json!({"action": "migrate", "migration_action": "sync"}),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    migrate(&cptestctx, vm, "begin").await;
    // Begin provisions the target but the VM stays where it was.
    let record = cptestctx.get_json(&format!("/vms/{}", vm)).await;
    assert_eq!(record["server_uuid"].as_str().unwrap(), source);

    migrate(&cptestctx, vm, "sync").await;
    migrate(&cptestctx, vm, "switch").await;

    let record = cptestctx.wait_vm_state(vm, "running").await;
    let target = record["server_uuid"].as_str().unwrap();
    assert_ne!(target, source, "switch must move the VM off its source");
    assert!(cptestctx.servers.iter().any(|s| s.to_string() == target));

    // The switch reserved the VM's addresses on the way over.
    assert!(!cptestctx.sim.napi.reserved_ips().is_empty());
}

#[tokio::test]
async fn test_migrate_automatic_chains_phases() {
    let cptestctx = setup("migrate_automatic").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    let record = cptestctx.wait_vm_state(vm, "running").await;
    let source = record["server_uuid"].as_str().unwrap().to_string();

    cptestctx
        .action_and_wait(
            vm,
            &json!({
                "action": "migrate",
                "migration_action": "begin",
                "automatic": true,
            }),
        )
        .await;

    // The reconciler chains sync and switch; wait for the switch job to
    // land and the VM to move.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let jobs: Vec<Value> = serde_json::from_value(
            cptestctx
                .get_json(&format!(
                    "/vms/{}/jobs?task=migrate-switch&execution=succeeded",
                    vm
                ))
                .await,
        )
        .unwrap();
        if !jobs.is_empty() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "automatic migration never reached switch"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let record = cptestctx.wait_vm_state(vm, "running").await;
    assert_ne!(record["server_uuid"].as_str().unwrap(), source);
}

#[tokio::test]
async fn test_migrate_abort_restores_source() {
    let cptestctx = setup("migrate_abort").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    let record = cptestctx.wait_vm_state(vm, "running").await;
    let source = record["server_uuid"].as_str().unwrap().to_string();

    migrate(&cptestctx, vm, "begin").await;
    migrate(&cptestctx, vm, "abort").await;

    let record = cptestctx.wait_vm_state(vm, "running").await;
    assert_eq!(record["server_uuid"].as_str().unwrap(), source);

    // Migration on a VM that is not running is rejected.
    cptestctx.action_and_wait(vm, &json!({"action": "stop"})).await;
    cptestctx.wait_vm_state(vm, "stopped").await;
    let response = cptestctx
        .post(
            &format!("/vms/{}", vm),
            &json!({"action": "migrate", "migration_action": "begin"}),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VmNotRunning");
}
