// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fabric NAT lifecycle: one NAT zone per fabric, reaped with its last
//! dependent VM

use crate::common::setup;
use serde_json::json;
use serde_json::Value;

#[tokio::test]
async fn test_fabric_nat_lifecycle() {
    let cptestctx = setup("fabric_nat_lifecycle").await;
    let nat_query = format!(
        "/vms?alias=nat-{}&state=active",
        cptestctx.fabric_network
    );

    // No user VM on the fabric: no NAT zone.
    let nats: Vec<Value> =
        serde_json::from_value(cptestctx.get_json(&nat_query).await).unwrap();
    assert!(nats.is_empty());

    // The first VM on the fabric brings up exactly one NAT zone.
    let mut body = cptestctx.provision_body();
    body["networks"] = json!([{"uuid": cptestctx.fabric_network.to_string()}]);
    let vm = cptestctx.provision_and_wait(&body).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let nats: Vec<Value> =
        serde_json::from_value(cptestctx.get_json(&nat_query).await).unwrap();
    assert_eq!(nats.len(), 1);
    assert_eq!(nats[0]["state"], "running");
    let nat_uuid = nats[0]["uuid"].as_str().unwrap().to_string();

    // A second VM on the same fabric reuses the NAT zone.
    let vm2 = cptestctx.provision_and_wait(&body).await;
    cptestctx.wait_vm_state(vm2, "running").await;
    let nats: Vec<Value> =
        serde_json::from_value(cptestctx.get_json(&nat_query).await).unwrap();
    assert_eq!(nats.len(), 1);

    // Destroying one dependent leaves the NAT zone alone.
    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}", vm2)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let accepted: Value = response.json().await.unwrap();
    cptestctx
        .wait_job(accepted["job_uuid"].as_str().unwrap().parse().unwrap())
        .await;
    let nats: Vec<Value> =
        serde_json::from_value(cptestctx.get_json(&nat_query).await).unwrap();
    assert_eq!(nats.len(), 1);

    // Destroying the last dependent reaps it.
    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}", vm)))
        .send()
        .await
        .unwrap();
    let accepted: Value = response.json().await.unwrap();
    let job = cptestctx
        .wait_job(accepted["job_uuid"].as_str().unwrap().parse().unwrap())
        .await;
    assert_eq!(job["execution"], "succeeded");

    let nats: Vec<Value> =
        serde_json::from_value(cptestctx.get_json(&nat_query).await).unwrap();
    assert!(nats.is_empty());
    let nat_record = cptestctx.get_json(&format!("/vms/{}", nat_uuid)).await;
    assert_eq!(nat_record["state"], "destroyed");
}
