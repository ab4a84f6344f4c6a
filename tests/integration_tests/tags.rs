// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tag reads, merges, replacement, deletion, and the reserved-tag policy

use crate::common::setup;
use crate::common::TestContext;
use serde_json::json;
use serde_json::Value;
use uuid::Uuid;

async fn wait_tag_job(cptestctx: &TestContext, response: reqwest::Response) {
    assert_eq!(
        response.status(),
        reqwest::StatusCode::ACCEPTED,
        "tag mutation rejected"
    );
    let accepted: Value = response.json().await.unwrap();
    let job: Uuid = accepted["job_uuid"].as_str().unwrap().parse().unwrap();
    let job = cptestctx.wait_job(job).await;
    assert_eq!(job["execution"], "succeeded", "tag job: {}", job);
}

#[tokio::test]
async fn test_tag_lifecycle() {
    let cptestctx = setup("tag_lifecycle").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let response = cptestctx
        .post(
            &format!("/vms/{}/tags", vm),
            &json!({"role": "database", "group": "deployment"}),
        )
        .await;
    wait_tag_job(&cptestctx, response).await;
    let tags = cptestctx.get_json(&format!("/vms/{}/tags", vm)).await;
    assert_eq!(tags, json!({"role": "database", "group": "deployment"}));

    let tag = cptestctx.get_json(&format!("/vms/{}/tags/role", vm)).await;
    assert_eq!(tag, json!("database"));

    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}/tags/role", vm)))
        .send()
        .await
        .unwrap();
    wait_tag_job(&cptestctx, response).await;
    let tags = cptestctx.get_json(&format!("/vms/{}/tags", vm)).await;
    assert_eq!(tags, json!({"group": "deployment"}));

    // Deleting an absent tag is a 404.
    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}/tags/role", vm)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}/tags", vm)))
        .send()
        .await
        .unwrap();
    wait_tag_job(&cptestctx, response).await;
    let tags = cptestctx.get_json(&format!("/vms/{}/tags", vm)).await;
    assert_eq!(tags, json!({}));
}

// PUT replaces the entire tag set; it is idempotent and total.
#[tokio::test]
async fn test_tag_put_is_total() {
    let cptestctx = setup("tag_put_is_total").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let response = cptestctx
        .post(&format!("/vms/{}/tags", vm), &json!({"old": "value"}))
        .await;
    wait_tag_job(&cptestctx, response).await;

    for _ in 0..2 {
        let response = cptestctx
            .client
            .put(cptestctx.url(&format!("/vms/{}/tags", vm)))
            .json(&json!({"a": 1}))
            .send()
            .await
            .unwrap();
        wait_tag_job(&cptestctx, response).await;
        let tags = cptestctx.get_json(&format!("/vms/{}/tags", vm)).await;
        assert_eq!(tags, json!({"a": 1}));
    }
}

#[tokio::test]
async fn test_docker_reserved_tag_rejected() {
    let cptestctx = setup("docker_reserved_tag_rejected").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let response = cptestctx
        .client
        .put(cptestctx.url(&format!("/vms/{}/tags", vm)))
        .json(&json!({"foo": "bar", "docker:label:com.docker.blah": "baz"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["message"],
        "Special tag \"docker:label:com.docker.blah\" not supported"
    );

    let response = cptestctx
        .post(&format!("/vms/{}/tags", vm), &json!({"sdc_docker": true}))
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

// Docker VMs get their reserved tags at provision time and may never
// delete them.
#[tokio::test]
async fn test_docker_vm_reserved_tag_deletion() {
    let cptestctx = setup("docker_vm_reserved_tag_deletion").await;
    let mut body = cptestctx.provision_body();
    body["brand"] = json!("lx");
    body["docker"] = json!(true);
    body["tags"] = json!({"sdc_docker": true});
    let vm = cptestctx.provision_and_wait(&body).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}/tags/sdc_docker", vm)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["message"],
        "Special tag \"sdc_docker\" may not be deleted"
    );

    // Deleting all tags would delete the reserved one too.
    let response = cptestctx
        .client
        .delete(cptestctx.url(&format!("/vms/{}/tags", vm)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cns_tag_validation() {
    let cptestctx = setup("cns_tag_validation").await;
    let vm = cptestctx.provision_and_wait(&cptestctx.provision_body()).await;
    cptestctx.wait_vm_state(vm, "running").await;

    let response = cptestctx
        .post(
            &format!("/vms/{}/tags", vm),
            &json!({"triton.cns.services": "web,db:5432"}),
        )
        .await;
    wait_tag_job(&cptestctx, response).await;

    let response = cptestctx
        .post(
            &format!("/vms/{}/tags", vm),
            &json!({"triton.cns.services": "Bad Label!"}),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["errors"][0]["message"],
        "invalid \"triton.cns.services\" tag: \
         Expected DNS name but \"Bad Label!\" found."
    );

    let response = cptestctx
        .post(
            &format!("/vms/{}/tags", vm),
            &json!({"triton.cns.disable": "yes"}),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["errors"][0]["message"],
        "Triton tag \"triton.cns.disable\" value must be a boolean: \
         yes (string)"
    );
}
