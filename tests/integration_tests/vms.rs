// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provision, lifecycle, validation, and destroy behavior

use crate::common::setup;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_provision_and_lifecycle() {
    let cptestctx = setup("provision_and_lifecycle").await;

    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    let record = cptestctx.wait_vm_state(vm, "running").await;
    assert_eq!(record["brand"], "joyent-minimal");
    assert_eq!(record["ram"], 256);
    assert_eq!(record["max_physical_memory"], 256);
    assert!(record["server_uuid"].as_str().is_some());
    assert_eq!(record["nics"].as_array().unwrap().len(), 1);
    assert_eq!(record["nics"][0]["state"], "running");
    assert_eq!(cptestctx.sim.napi.nic_count(vm), 1);

    cptestctx.action_and_wait(vm, &json!({"action": "stop"})).await;
    cptestctx.wait_vm_state(vm, "stopped").await;

    cptestctx.action_and_wait(vm, &json!({"action": "start"})).await;
    cptestctx.wait_vm_state(vm, "running").await;

    cptestctx.action_and_wait(vm, &json!({"action": "reboot"})).await;
    cptestctx.wait_vm_state(vm, "running").await;
}

#[tokio::test]
async fn test_provision_missing_parameters() {
    let cptestctx = setup("provision_missing_parameters").await;
    let response = cptestctx.post("/vms", &json!({})).await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "ValidationFailed");
    let fields: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["field"].as_str().unwrap())
        .collect();
    for field in ["owner_uuid", "brand", "ram", "billing_id", "networks"] {
        assert!(fields.contains(&field), "missing field error: {}", field);
    }
}

#[tokio::test]
async fn test_provision_unknown_network() {
    let cptestctx = setup("provision_unknown_network").await;
    let mut body = cptestctx.provision_body();
    body["networks"] =
        json!([{"uuid": "caaaf10c-a587-49c6-9cf6-9b0a14ba960b"}]);
    let response = cptestctx.post("/vms", &body).await;
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "code": "UnprocessableEntityError",
            "message": "No such Network or Pool with id/name: \
                        \"caaaf10c-a587-49c6-9cf6-9b0a14ba960b\"",
        })
    );
}

#[tokio::test]
async fn test_provision_network_by_name() {
    let cptestctx = setup("provision_network_by_name").await;
    let mut body = cptestctx.provision_body();
    body["networks"] = json!([{"name": "external"}]);
    let vm = cptestctx.provision_and_wait(&body).await;
    let record = cptestctx.wait_vm_state(vm, "running").await;
    assert_eq!(
        record["nics"][0]["network_uuid"],
        cptestctx.network.to_string()
    );
}

#[tokio::test]
async fn test_provision_bad_triton_tag() {
    let cptestctx = setup("provision_bad_triton_tag").await;
    let mut body = cptestctx.provision_body();
    body["tags"] = json!({"triton.foo": true});
    let response = cptestctx.post("/vms", &body).await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "ValidationFailed");
    assert_eq!(
        body["errors"][0],
        json!({
            "field": "tags",
            "code": "Invalid",
            "message": "Unrecognized special triton tag \"triton.foo\"",
        })
    );
}

#[tokio::test]
async fn test_provision_used_ip() {
    let cptestctx = setup("provision_used_ip").await;
    let holder = Uuid::new_v4();
    cptestctx.sim.napi.claim_ip(cptestctx.network, "10.0.0.55", holder);
    let mut body = cptestctx.provision_body();
    body["networks"] = json!([{
        "uuid": cptestctx.network.to_string(),
        "ipv4_ips": ["10.0.0.55"],
    }]);
    let response = cptestctx.post("/vms", &body).await;
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "InvalidParameters");
    assert_eq!(
        body["errors"][0],
        json!({
            "type": "zone",
            "id": holder.to_string(),
            "code": "UsedBy",
            "field": "ip",
        })
    );
}

#[tokio::test]
async fn test_provision_bad_locality() {
    let cptestctx = setup("provision_bad_locality").await;
    let mut body = cptestctx.provision_body();
    body["locality"] = json!({"near": "definitely-not-a-uuid"});
    let response = cptestctx.post("/vms", &body).await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["errors"][0]["field"], "locality");
    assert_eq!(body["errors"][0]["code"], "Invalid");
    assert_eq!(
        body["errors"][0]["message"],
        "locality contains malformed UUID"
    );
}

// A failure before the point of no return marks the VM failed and removes
// every NIC record pre-created for it.
#[tokio::test]
async fn test_failed_provision_cleans_up_nics() {
    let cptestctx = setup("failed_provision_cleans_up_nics").await;
    cptestctx.sim.imgapi.fail_next_ensure();
    let (vm, job) = cptestctx.provision(&cptestctx.provision_body()).await;
    let job = cptestctx.wait_job(job).await;
    assert_eq!(job["execution"], "failed");
    cptestctx.wait_vm_state(vm, "failed").await;
    assert_eq!(cptestctx.sim.napi.nic_count(vm), 0);
}

// Once the compute node has started creating the zone, a failure leaves
// the NIC records for a later sync to reconcile.
#[tokio::test]
async fn test_failed_provision_past_point_of_no_return() {
    let cptestctx = setup("failed_provision_no_cleanup").await;
    cptestctx.sim.cnapi.fail_next_provision();
    let (vm, job) = cptestctx.provision(&cptestctx.provision_body()).await;
    let job = cptestctx.wait_job(job).await;
    assert_eq!(job["execution"], "failed");
    cptestctx.wait_vm_state(vm, "failed").await;
    assert_eq!(cptestctx.sim.napi.nic_count(vm), 1);
}

#[tokio::test]
async fn test_start_requires_stopped() {
    let cptestctx = setup("start_requires_stopped").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;
    let response =
        cptestctx.post(&format!("/vms/{}", vm), &json!({"action": "start"})).await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VmNotStopped");
}

#[tokio::test]
async fn test_action_validation() {
    let cptestctx = setup("action_validation").await;

    // Unknown VM is a 404 regardless of the action.
    let response = cptestctx
        .post(&format!("/vms/{}", Uuid::new_v4()), &json!({"action": "start"}))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // A malformed uuid in the path never resolves to a VM.
    let response =
        cptestctx.post("/vms/not-a-uuid", &json!({"action": "start"})).await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let response = cptestctx
        .post(&format!("/vms/{}", vm), &json!({"action": "defenestrate"}))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "ValidationFailed");

    let response = cptestctx.post(&format!("/vms/{}", vm), &json!({})).await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_resize_up_exceeding_capacity() {
    let cptestctx = setup("resize_up_exceeding_capacity").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let response = cptestctx
        .post(
            &format!("/vms/{}", vm),
            &json!({
                "action": "update",
                "billing_id": cptestctx.package_huge.to_string(),
            }),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "ValidationFailed");
    assert_eq!(body["errors"][0]["field"], "ram");
    assert_eq!(body["errors"][0]["code"], "InsufficientCapacity");
    let message = body["errors"][0]["message"].as_str().unwrap();
    assert!(message.starts_with("Required additional RAM ("));
    assert!(message.contains("exceeds the server's available RAM ("));

    // The VM's package is unchanged.
    let record = cptestctx.get_json(&format!("/vms/{}", vm)).await;
    assert_eq!(record["billing_id"], cptestctx.package_small.to_string());
    assert_eq!(record["ram"], 256);
}

#[tokio::test]
async fn test_update_applies_package_and_alias() {
    let cptestctx = setup("update_applies_package").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    // An empty owner_uuid is rejected outright.
    let response = cptestctx
        .post(
            &format!("/vms/{}", vm),
            &json!({"action": "update", "owner_uuid": ""}),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    cptestctx
        .action_and_wait(
            vm,
            &json!({"action": "update", "alias": "renamed", "autoboot": false}),
        )
        .await;
    let record = cptestctx.get_json(&format!("/vms/{}", vm)).await;
    assert_eq!(record["alias"], "renamed");
    assert_eq!(record["autoboot"], false);
}

#[tokio::test]
async fn test_snapshot_lifecycle() {
    let cptestctx = setup("snapshot_lifecycle").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    cptestctx
        .action_and_wait(
            vm,
            &json!({"action": "create_snapshot", "snapshot_name": "nightly"}),
        )
        .await;
    let record = cptestctx.get_json(&format!("/vms/{}", vm)).await;
    assert_eq!(record["snapshots"][0]["name"], "nightly");

    cptestctx
        .action_and_wait(
            vm,
            &json!({"action": "rollback_snapshot", "snapshot_name": "nightly"}),
        )
        .await;

    cptestctx
        .action_and_wait(
            vm,
            &json!({"action": "delete_snapshot", "snapshot_name": "nightly"}),
        )
        .await;
    let record = cptestctx.get_json(&format!("/vms/{}", vm)).await;
    assert!(record["snapshots"].as_array().unwrap().is_empty());

    // Rolling back to a snapshot that never existed is rejected.
    let response = cptestctx
        .post(
            &format!("/vms/{}", vm),
            &json!({"action": "rollback_snapshot", "snapshot_name": "ghost"}),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_snapshots_unsupported_for_hvm() {
    let cptestctx = setup("snapshots_unsupported_for_hvm").await;
    let mut body = cptestctx.provision_body();
    body["brand"] = json!("bhyve");
    body["image_uuid"] = serde_json::Value::Null;
    body["disks"] = json!([
        {"image_uuid": cptestctx.image.to_string(), "size": 10240, "boot": true}
    ]);
    let vm = cptestctx.provision_and_wait(&body).await;
    let record = cptestctx.wait_vm_state(vm, "running").await;
    // For bhyve, disks replace quota.
    assert!(record.get("quota").map(|q| q.is_null()).unwrap_or(true));
    assert_eq!(record["disks"][0]["size"], 10240);

    let response = cptestctx
        .post(
            &format!("/vms/{}", vm),
            &json!({"action": "create_snapshot", "snapshot_name": "nope"}),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "BrandNotSupported");
}

#[tokio::test]
async fn test_add_and_remove_nics() {
    let cptestctx = setup("add_and_remove_nics").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    cptestctx
        .action_and_wait(
            vm,
            &json!({
                "action": "add_nics",
                "networks": [{"uuid": cptestctx.network.to_string()}],
            }),
        )
        .await;
    let record = cptestctx.get_json(&format!("/vms/{}", vm)).await;
    let nics = record["nics"].as_array().unwrap().clone();
    assert_eq!(nics.len(), 2);
    assert_eq!(cptestctx.sim.napi.nic_count(vm), 2);

    let mac = nics[1]["mac"].as_str().unwrap().to_string();
    cptestctx
        .action_and_wait(
            vm,
            &json!({"action": "remove_nics", "macs": [mac]}),
        )
        .await;
    let record = cptestctx.get_json(&format!("/vms/{}", vm)).await;
    assert_eq!(record["nics"].as_array().unwrap().len(), 1);
    assert_eq!(cptestctx.sim.napi.nic_count(vm), 1);

    // Removing an unknown MAC is a validation failure.
    let response = cptestctx
        .post(
            &format!("/vms/{}", vm),
            &json!({"action": "remove_nics", "macs": ["00:00:00:00:00:99"]}),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_reprovision() {
    let cptestctx = setup("reprovision").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let new_image = Uuid::new_v4();
    cptestctx.sim.imgapi.add_image(vmapi::clients::Image {
        uuid: new_image,
        name: "base-64-next".to_string(),
        generate_passwords: false,
    });
    cptestctx
        .action_and_wait(
            vm,
            &json!({
                "action": "reprovision",
                "image_uuid": new_image.to_string(),
            }),
        )
        .await;
    let record = cptestctx.get_json(&format!("/vms/{}", vm)).await;
    assert_eq!(record["image_uuid"], new_image.to_string());
}

#[tokio::test]
async fn test_destroy_is_terminal() {
    let cptestctx = setup("destroy_is_terminal").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}", vm)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    assert!(response.headers().contains_key("workflow-api"));
    let accepted: serde_json::Value = response.json().await.unwrap();
    let job: Uuid = accepted["job_uuid"].as_str().unwrap().parse().unwrap();
    let job = cptestctx.wait_job(job).await;
    assert_eq!(job["execution"], "succeeded");

    // Destroyed VMs drop out of active searches but stay retrievable by
    // uuid, with quota unknown.
    let record = cptestctx.wait_vm_state(vm, "destroyed").await;
    assert!(record["quota"].is_null());
    assert_eq!(cptestctx.sim.napi.nic_count(vm), 0);
    let active: Vec<serde_json::Value> = serde_json::from_value(
        cptestctx
            .get_json(&format!("/vms?uuid={}&state=active", vm))
            .await,
    )
    .unwrap();
    assert!(active.is_empty());

    // Acting on a destroyed VM is rejected.
    let response = cptestctx
        .post(&format!("/vms/{}", vm), &json!({"action": "start"}))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

// While a VM is provisioning, destructive and boot-changing actions are
// forbidden except destroy.
#[tokio::test]
async fn test_provisioning_gate() {
    let cptestctx = setup("provisioning_gate").await;
    // Exhaust capacity so provisioning blocks at allocation and the VM
    // lingers in state provisioning.
    let huge = json!({
        "owner_uuid": cptestctx.owner.to_string(),
        "brand": "joyent-minimal",
        "image_uuid": cptestctx.image.to_string(),
        "billing_id": vmapi::db::model::ZERO_UUID.to_string(),
        "ram": 1 << 20,
        "networks": [{"uuid": cptestctx.network.to_string()}],
    });
    let (vm, job) = cptestctx.provision(&huge).await;

    let response = cptestctx
        .post(&format!("/vms/{}", vm), &json!({"action": "stop"}))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    // Destroy goes through even while provisioning.
    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}", vm)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    cptestctx.wait_job(job).await;
}
