//! End-to-end tests for the HTTP surface, driven through the router without
//! a real socket.

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::Router;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tidekv::store::Kv;
use tower::ServiceExt;

use tidekv_server::config::ConfigLoad;
use tidekv_server::routes;

fn app() -> Router {
    let kv = Kv::open_in_memory().unwrap();
    routes::router(kv, Arc::new(ConfigLoad::default()))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn put_get_delete_roundtrip() -> Result<()> {
    let app = app();

    let (status, body) = send(&app, json_request("PUT", "/keys/users/1", json!({"name": "ada"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    let stamp = body["versionstamp"].as_str().unwrap().to_string();

    let (status, body) = send(&app, get("/keys/users/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!({"name": "ada"}));
    assert_eq!(body["versionstamp"], json!(stamp));
    // Numeric path part coerced: the key is ["users", 1].
    assert_eq!(body["key"], json!(["users", 1.0]));

    let (status, body) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/keys/users/1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deletedCount"], json!(1));

    let (status, body) = send(&app, get("/keys/users/1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("not-found"));
    Ok(())
}

#[tokio::test]
async fn tree_delete_scenario() -> Result<()> {
    let app = app();
    send(&app, json_request("PUT", "/keys/u/1", json!({}))).await;
    send(&app, json_request("PUT", "/keys/u/1/p", json!({}))).await;
    send(&app, json_request("PUT", "/keys/u/2", json!({}))).await;

    let (_, body) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/keys/u/1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(body["deletedCount"], json!(2));

    let (_, body) = send(&app, get("/keys?prefix=u")).await;
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    assert_eq!(body["entries"][0]["key"], json!(["u", 2.0]));
    Ok(())
}

#[tokio::test]
async fn batch_get_preserves_order_and_caps_size() -> Result<()> {
    let app = app();
    send(&app, json_request("PUT", "/keys/a", json!(1))).await;

    let (status, body) = send(
        &app,
        json_request("POST", "/keys/batch", json!({"keys": [["missing"], ["a"]]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries[0]["value"], Value::Null);
    assert_eq!(entries[1]["value"], json!(1));

    let too_many: Vec<Value> = (0..1001).map(|i| json!([i])).collect();
    let (status, body) = send(
        &app,
        json_request("POST", "/keys/batch", json!({"keys": too_many})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("1001"));
    Ok(())
}

#[tokio::test]
async fn filtered_list_scenario() -> Result<()> {
    let app = app();
    for i in 0..4 {
        send(
            &app,
            json_request("PUT", &format!("/keys/s/{}", i), json!({"active": i % 2 == 0})),
        )
        .await;
    }

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/keys/list",
            json!({"prefix": ["s"], "where": {"active": {"eq": true}}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["key"], json!(["s", 0.0]));
    assert_eq!(entries[1]["key"], json!(["s", 2.0]));
    Ok(())
}

#[tokio::test]
async fn count_and_paginate() -> Result<()> {
    let app = app();
    for i in 0..5 {
        send(&app, json_request("PUT", &format!("/keys/p/{}", i), json!(i))).await;
    }

    let (_, body) = send(&app, get("/keys/count?prefix=p")).await;
    assert_eq!(body["count"], json!(5));

    let (_, first) = send(&app, get("/keys/paginate?prefix=p&limit=3")).await;
    assert_eq!(first["entries"].as_array().unwrap().len(), 3);
    assert_eq!(first["hasMore"], json!(true));
    let cursor = first["cursor"].as_str().unwrap();

    let (_, second) = send(
        &app,
        get(&format!("/keys/paginate?prefix=p&limit=3&cursor={}", urlencode(cursor))),
    )
    .await;
    assert_eq!(second["entries"].as_array().unwrap().len(), 2);
    assert_eq!(second["hasMore"], json!(false));
    Ok(())
}

fn urlencode(raw: &str) -> String {
    raw.replace('+', "%2B").replace('/', "%2F").replace('=', "%3D")
}

#[tokio::test]
async fn atomic_versioned_counter_scenario() -> Result<()> {
    let app = app();
    send(&app, json_request("PUT", "/keys/c", json!(0))).await;
    let (_, entry) = send(&app, get("/keys/c")).await;
    let stamp = entry["versionstamp"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/atomic",
            json!({
                "checks": [{"key": ["c"], "versionstamp": stamp}],
                "mutations": [{"type": "set", "key": ["c"], "value": 1}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));

    // Same (now stale) stamp: normal negative outcome, no side effects.
    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/atomic",
            json!({
                "checks": [{"key": ["c"], "versionstamp": stamp}],
                "mutations": [{"type": "set", "key": ["c"], "value": 2}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(false));

    let (_, entry) = send(&app, get("/keys/c")).await;
    assert_eq!(entry["value"], json!(1));
    Ok(())
}

#[tokio::test]
async fn atomic_validation_errors() -> Result<()> {
    let app = app();

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/atomic",
            json!({"mutations": [{"type": "upsert", "key": ["x"], "value": 1}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("mutation 0"));

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/atomic",
            json!({
                "checks": [{"key": ["x"], "versionstamp": "zzz"}],
                "mutations": [{"type": "set", "key": ["x"], "value": 1}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("check 0"));
    Ok(())
}

#[tokio::test]
async fn atomic_sum_endpoint() -> Result<()> {
    let app = app();
    for _ in 0..3 {
        send(
            &app,
            json_request(
                "POST",
                "/atomic",
                json!({"mutations": [{"type": "sum", "key": ["hits"], "value": 5}]}),
            ),
        )
        .await;
    }
    let (_, entry) = send(&app, get("/keys/hits")).await;
    assert_eq!(entry["value"], json!(15));
    Ok(())
}

#[tokio::test]
async fn queue_roundtrip_and_dlq() -> Result<()> {
    let app = app();

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/queue/enqueue",
            json!({
                "value": {"x": 1},
                "options": {"backoffSchedule": [], "keysIfUndelivered": [["f"]]}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let (_, body) = send(&app, get("/queue/poll")).await;
    assert_eq!(body["message"]["id"], json!(id));
    assert_eq!(body["message"]["attempts"], json!(1));

    // Empty backoff schedule: first nack dead-letters and writes fallback.
    let (status, body) = send(&app, json_request("POST", "/queue/nack", json!({"id": id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!("deadlettered"));

    let (_, stats) = send(&app, get("/queue/stats")).await;
    assert_eq!(stats["dlq"], json!(1));
    assert_eq!(stats["total"], json!(1));

    let (_, entry) = send(&app, get("/keys/f")).await;
    assert_eq!(entry["value"], json!({"x": 1}));

    // DLQ listing, requeue, ack the requeued message.
    let (_, page) = send(&app, get("/queue/dlq")).await;
    let dlq_id = page["messages"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(page["messages"][0]["errorMessage"], json!("Max attempts exceeded"));

    let (_, body) = send(
        &app,
        json_request("POST", "/queue/dlq/requeue", json!({"id": dlq_id})),
    )
    .await;
    let new_id = body["id"].as_str().unwrap().to_string();

    let (_, body) = send(&app, get("/queue/poll")).await;
    assert_eq!(body["message"]["id"], json!(new_id));
    let (_, body) = send(&app, json_request("POST", "/queue/ack", json!({"id": new_id}))).await;
    assert_eq!(body["acked"], json!(true));

    let (status, _) = send(&app, get(&format!("/queue/dlq/{}", dlq_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn index_and_search_endpoints() -> Result<()> {
    let app = app();
    send(
        &app,
        json_request("PUT", "/keys/posts/1", json!({"title": "ordered keys in sqlite"})),
    )
    .await;

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/indexes",
            json!({"prefix": ["posts"], "fields": ["title"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokenizer"], json!("unicode61"));

    let (_, body) = send(&app, get("/search?prefix=posts&q=sqlite")).await;
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/search",
            json!({"prefix": ["posts"], "query": "sqlite", "where": {"title": {"contains": "ordered"}}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);

    // Unknown prefix is a 404; empty fields a 400.
    let (status, _) = send(&app, get("/search?prefix=nothing&q=x")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &app,
        json_request("POST", "/indexes", json!({"prefix": ["x"], "fields": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&app, get("/indexes")).await;
    assert_eq!(body["indexes"].as_array().unwrap().len(), 1);
    let (status, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/indexes?prefix=posts")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn watch_poll_returns_only_deltas() -> Result<()> {
    let app = app();
    send(&app, json_request("PUT", "/keys/w/a", json!(1))).await;

    let (_, first) = send(&app, get("/watch/poll?keys=w/a,w/b")).await;
    assert_eq!(first["entries"].as_array().unwrap().len(), 2);
    let stamps: Vec<String> = first["versionstamps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .unwrap_or_else(|| "null".to_string())
        })
        .collect();

    let (_, second) = send(
        &app,
        get(&format!("/watch/poll?keys=w/a,w/b&versionstamps={}", stamps.join(","))),
    )
    .await;
    assert_eq!(second["entries"].as_array().unwrap().len(), 0);

    send(&app, json_request("PUT", "/keys/w/b", json!(2))).await;
    let (_, third) = send(
        &app,
        get(&format!("/watch/poll?keys=w/a,w/b&versionstamps={}", stamps.join(","))),
    )
    .await;
    assert_eq!(third["entries"].as_array().unwrap().len(), 1);
    assert_eq!(third["entries"][0]["key"], json!(["w", "b"]));
    Ok(())
}

#[tokio::test]
async fn metrics_and_status_endpoints() -> Result<()> {
    let app = app();
    send(&app, json_request("PUT", "/keys/m", json!(1))).await;
    send(&app, get("/keys/m")).await;

    let (status, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["ops"]["set"]["count"].as_u64().unwrap() >= 1);
    assert!(body["ops"]["get"]["count"].as_u64().unwrap() >= 1);

    let (status, body) = send(&app, get("/metrics/prometheus")).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("kv_op_total{op=\"set\"}"));
    assert!(text.contains("kv_entries_total 1"));

    let (_, status_body) = send(&app, get("/status")).await;
    assert_eq!(status_body["keys"], json!(1));
    Ok(())
}

#[tokio::test]
async fn oversize_paths_are_rejected_with_location() -> Result<()> {
    let app = app();

    let deep = vec!["x"; 21].join("/");
    let (status, body) = send(&app, get(&format!("/keys/{}", deep))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("21"));

    let long_part = "y".repeat(1025);
    let (status, body) = send(&app, get(&format!("/keys/ok/{}", long_part))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("part 1"));
    Ok(())
}

#[tokio::test]
async fn expire_in_hides_entries_after_deadline() -> Result<()> {
    let app = app();
    // One-millisecond TTL rounds up to the next whole second.
    send(&app, json_request("PUT", "/keys/ttl?expireIn=1", json!("gone soon"))).await;
    let (status, body) = send(&app, get("/keys/ttl")).await;
    // Immediately after the write the entry is still observable.
    assert_eq!(status, StatusCode::OK);
    assert!(body["expiresAt"].as_i64().is_some());

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let (status, _) = send(&app, get("/keys/ttl")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}
