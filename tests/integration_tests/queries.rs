// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Search and filter over persisted VMs: structured filters, LDAP query
//! strings, predicate trees, projection, and pagination

use crate::common::setup;
use crate::common::TestContext;
use serde_json::json;
use serde_json::Value;
use uuid::Uuid;

async fn provision_fleet(cptestctx: &TestContext, count: usize) -> Vec<Uuid> {
    let mut vms = Vec::new();
    for i in 0..count {
        let mut body = cptestctx.provision_body();
        body["alias"] = json!(format!("web-{:02}", i));
        body["tags"] = json!({"role": "web", "index": i});
        vms.push(cptestctx.provision_and_wait(&body).await);
    }
    vms
}

#[tokio::test]
async fn test_empty_filter_result() {
    let cptestctx = setup("empty_filter_result").await;
    let owner = Uuid::new_v4();
    let body = cptestctx
        .get_json(&format!("/vms?ram=32&owner_uuid={}&state=active", owner))
        .await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_pagination_is_consistent() {
    let cptestctx = setup("pagination_is_consistent").await;
    provision_fleet(&cptestctx, 5).await;

    let all: Vec<Value> = serde_json::from_value(
        cptestctx.get_json("/vms?sort=alias.asc").await,
    )
    .unwrap();
    assert_eq!(all.len(), 5);

    // limit=L, offset=K equals the corresponding slice of the full list.
    for (limit, offset) in [(2usize, 0usize), (2, 3), (3, 4), (5, 0)] {
        let response = cptestctx
            .get(&format!("/vms?sort=alias.asc&limit={}&offset={}", limit, offset))
            .await;
        assert_eq!(
            response
                .headers()
                .get("x-joyent-resource-count")
                .unwrap()
                .to_str()
                .unwrap(),
            "5"
        );
        let page: Vec<Value> = response.json().await.unwrap();
        let expected: Vec<Value> =
            all.iter().skip(offset).take(limit).cloned().collect();
        assert_eq!(page, expected, "limit={} offset={}", limit, offset);
    }

    // Past the end is silently empty; the count is still the total.
    let response = cptestctx.get("/vms?limit=2&offset=100").await;
    assert_eq!(
        response
            .headers()
            .get("x-joyent-resource-count")
            .unwrap()
            .to_str()
            .unwrap(),
        "5"
    );
    let page: Vec<Value> = response.json().await.unwrap();
    assert!(page.is_empty());
}

#[tokio::test]
async fn test_head_vms_returns_count_only() {
    let cptestctx = setup("head_vms").await;
    provision_fleet(&cptestctx, 2).await;
    let response = cptestctx
        .client
        .head(cptestctx.url("/vms"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-joyent-resource-count")
            .unwrap()
            .to_str()
            .unwrap(),
        "2"
    );
}

#[tokio::test]
async fn test_fields_projection() {
    let cptestctx = setup("fields_projection").await;
    provision_fleet(&cptestctx, 1).await;
    let rows: Vec<Value> = serde_json::from_value(
        cptestctx.get_json("/vms?fields=uuid,alias").await,
    )
    .unwrap();
    assert_eq!(rows.len(), 1);
    let row = rows[0].as_object().unwrap();
    // Unlisted fields are absent, not null.
    assert_eq!(row.len(), 2);
    assert!(row.contains_key("uuid"));
    assert!(row.contains_key("alias"));
    assert!(!row.contains_key("ram"));
}

#[tokio::test]
async fn test_structured_filters() {
    let cptestctx = setup("structured_filters").await;
    let vms = provision_fleet(&cptestctx, 2).await;

    let rows: Vec<Value> = serde_json::from_value(
        cptestctx
            .get_json(&format!(
                "/vms?owner_uuid={}&brand=joyent-minimal&ram=256&alias=web-00",
                cptestctx.owner
            ))
            .await,
    )
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["uuid"], vms[0].to_string());

    // Tag filters AND with the rest.
    let rows: Vec<Value> = serde_json::from_value(
        cptestctx.get_json("/vms?tag.role=web&tag.index=1").await,
    )
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["uuid"], vms[1].to_string());

    let rows: Vec<Value> = serde_json::from_value(
        cptestctx.get_json("/vms?tag.role=database").await,
    )
    .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_ldap_query_strings() {
    let cptestctx = setup("ldap_query_strings").await;
    let mut body = cptestctx.provision_body();
    body["tags"] = json!({"smartdc_type": "core"});
    let vm = cptestctx.provision_and_wait(&body).await;
    cptestctx.provision_and_wait(&cptestctx.provision_body()).await;

    let query = "(&(ram>=128)(tags=*-smartdc_type=core-*))";
    let response = cptestctx
        .client
        .get(cptestctx.url("/vms"))
        .query(&[("query", query)])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let rows: Vec<Value> = response.json().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["uuid"], vm.to_string());

    // A malformed filter is a validation failure.
    let response = cptestctx
        .client
        .get(cptestctx.url("/vms"))
        .query(&[("query", "(ram>=128")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_json_predicates() {
    let cptestctx = setup("json_predicates").await;
    let vms = provision_fleet(&cptestctx, 3).await;

    let predicate = json!({
        "and": [
            {"eq": ["brand", "joyent-minimal"]},
            {"or": [
                {"eq": ["alias", "web-00"]},
                {"eq": ["alias", "web-02"]},
            ]},
        ],
    });
    let response = cptestctx
        .client
        .get(cptestctx.url("/vms"))
        .query(&[
            ("predicate", predicate.to_string()),
            ("sort", "alias.asc".to_string()),
        ])
        .send()
        .await
        .unwrap();
    let rows: Vec<Value> = response.json().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["uuid"], vms[0].to_string());
    assert_eq!(rows[1]["uuid"], vms[2].to_string());

    // Predicates intersect with structured filters.
    let response = cptestctx
        .client
        .get(cptestctx.url("/vms"))
        .query(&[
            ("predicate", predicate.to_string()),
            ("alias", "web-02".to_string()),
        ])
        .send()
        .await
        .unwrap();
    let rows: Vec<Value> = response.json().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["uuid"], vms[2].to_string());
}

#[tokio::test]
async fn test_sort_orders() {
    let cptestctx = setup("sort_orders").await;
    provision_fleet(&cptestctx, 3).await;
    let ascending: Vec<Value> = serde_json::from_value(
        cptestctx.get_json("/vms?sort=alias.asc&fields=alias").await,
    )
    .unwrap();
    let aliases: Vec<&str> =
        ascending.iter().map(|r| r["alias"].as_str().unwrap()).collect();
    assert_eq!(aliases, vec!["web-00", "web-01", "web-02"]);

    let descending: Vec<Value> = serde_json::from_value(
        cptestctx.get_json("/vms?sort=alias.desc&fields=alias").await,
    )
    .unwrap();
    let aliases: Vec<&str> =
        descending.iter().map(|r| r["alias"].as_str().unwrap()).collect();
    assert_eq!(aliases, vec!["web-02", "web-01", "web-00"]);
}
