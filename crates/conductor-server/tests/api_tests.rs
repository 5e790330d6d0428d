//! Integration tests for the Conductor API endpoints.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server, against a fully wired core (state manager,
//! dispatcher, no telemetry).

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use conductor_core::ConductorConfig;
use conductor_server::{Conductor, build_router, start};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn conductor() -> (Conductor, Router) {
    conductor_with(&ConductorConfig::default())
}

fn conductor_with(config: &ConductorConfig) -> (Conductor, Router) {
    let conductor = start(config, CancellationToken::new()).unwrap();
    let router = build_router(conductor.app());
    (conductor, router)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    read(router.clone().oneshot(req).await.unwrap()).await
}

async fn post(router: &Router, uri: &str, body: &Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    read(router.clone().oneshot(req).await.unwrap()).await
}

async fn read(resp: axum::response::Response) -> (StatusCode, Value) {
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn status_returns_initial_snapshot() {
    let (_conductor, router) = conductor();
    let (status, json) = get(&router, "/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "offline");
    assert_eq!(json["persona"]["style"], "neutral");
    assert_eq!(json["scene"], "starting");
    assert_eq!(json["modules"].as_object().unwrap().len(), 8);
    assert_eq!(json["modules"]["asr"]["state"], "offline");
    assert_eq!(json["memory"]["buffer_length"], 0);
}

#[tokio::test]
async fn persona_update_is_accepted_streamed_and_visible() {
    let (conductor, router) = conductor();
    let app = conductor.app();
    let subs = [app.dispatcher.subscribe(), app.dispatcher.subscribe()];

    let (status, json) = post(
        &router,
        "/persona",
        &json!({"style": "chaotic", "chaos_level": 0.9}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["ok"], true);
    assert_eq!(json["type"], "persona_update");
    let seq = json["seq"].as_u64().unwrap();

    for sub in &subs {
        let envelope = sub.recv().await.unwrap();
        assert_eq!(envelope.seq, seq);
        assert_eq!(envelope.kind(), "persona_update");
        assert!(sub.try_recv().is_none());
    }

    let (_, snapshot) = get(&router, "/status").await;
    assert_eq!(snapshot["persona"]["style"], "chaotic");
    assert_eq!(snapshot["persona"]["chaos_level"], 0.9);
    assert_eq!(snapshot["persona"]["energy"], 0.6);
}

#[tokio::test]
async fn unknown_module_toggle_is_not_found_and_emits_nothing() {
    let (conductor, router) = conductor();
    let app = conductor.app();
    let sub = app.dispatcher.subscribe();

    let (status, json) = post(&router, "/toggle/teleporter", &json!({"enabled": true})).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["status"], 404);
    assert!(json["error"].as_str().unwrap().contains("teleporter"));
    assert!(sub.try_recv().is_none());
    assert_eq!(app.dispatcher.stats().published, 0);
}

#[tokio::test]
async fn toggle_and_heartbeat_bring_status_online() {
    let (_conductor, router) = conductor();

    let (status, json) = post(&router, "/toggle/tts", &json!({"enabled": true})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["type"], "module.toggle");

    let (status, json) = post(
        &router,
        "/modules/asr/heartbeat",
        &json!({"latency_ms": 42.5}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["type"], "module.health");

    let (_, health) = get(&router, "/health").await;
    assert_eq!(health["status"], "online");
    assert_eq!(health["modules"]["tts"]["state"], "online");
    assert_eq!(health["modules"]["asr"]["latency_ms"], 42.5);
    assert!(health.get("persona").is_none());
}

#[tokio::test]
async fn out_of_range_values_are_unprocessable() {
    let (conductor, router) = conductor();
    let before = conductor.app().state.snapshot();

    let cases = [
        ("/persona", json!({"style": "calm", "energy": 1.5})),
        ("/persona", json!({})),
        ("/modules/llm/heartbeat", json!({"latency_ms": -1.0})),
        ("/tts", json!({"text": "   "})),
        ("/obs/scene", json!({"scene": ""})),
        ("/vts/expr", json!({"expression": "smile", "intensity": 2.0})),
        (
            "/events/asr",
            json!({"kind": "final", "text": "hi", "confidence": 1.2}),
        ),
        ("/memory/summary", json!({"text": ""})),
    ];
    for (uri, body) in &cases {
        let (status, json) = post(&router, uri, body).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{uri} {body}");
        assert_eq!(json["status"], 422);
    }

    assert_eq!(conductor.app().state.snapshot(), before);
    assert_eq!(conductor.app().dispatcher.stats().published, 0);
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let (_conductor, router) = conductor();
    let req = Request::builder()
        .method("POST")
        .uri("/persona")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn performance_controls_update_snapshot() {
    let (_conductor, router) = conductor();

    let (status, json) = post(&router, "/tts", &json!({"text": "hello chat", "voice": "v2"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["type"], "tts_request");

    let (_, json) = post(&router, "/obs/scene", &json!({"scene": "gaming"})).await;
    assert_eq!(json["type"], "obs_scene");

    let (_, json) = post(&router, "/vts/expr", &json!({"expression": "smile"})).await;
    assert_eq!(json["type"], "vts_expression");

    let (_, json) = post(
        &router,
        "/expression",
        &json!({"expression": "surprised", "intensity": 0.7}),
    )
    .await;
    assert_eq!(json["type"], "expression");

    let (_, snapshot) = get(&router, "/status").await;
    assert_eq!(snapshot["last_tts"]["text"], "hello chat");
    assert_eq!(snapshot["last_tts"]["voice"], "v2");
    assert_eq!(snapshot["scene"], "gaming");
    assert_eq!(snapshot["last_expression"]["target"], "avatar");
    assert_eq!(snapshot["last_expression"]["expression"], "surprised");
    assert_eq!(snapshot["last_expression"]["intensity"], 0.7);
}

#[tokio::test]
async fn asr_events_track_transcript_and_memory() {
    let (_conductor, router) = conductor();

    let (status, json) = post(
        &router,
        "/events/asr",
        &json!({"kind": "partial", "text": "hel", "confidence": 0.4}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["type"], "asr_partial");

    let (_, json) = post(
        &router,
        "/events/asr",
        &json!({"kind": "final", "text": "hello there", "confidence": 0.95}),
    )
    .await;
    assert_eq!(json["type"], "asr_final");

    let (_, snapshot) = get(&router, "/status").await;
    assert_eq!(snapshot["transcript"]["last_final"]["text"], "hello there");
    assert_eq!(snapshot["transcript"]["turns"], 1);
    assert_eq!(snapshot["memory"]["buffer_length"], 1);
    assert_eq!(snapshot["modules"]["asr"]["state"], "online");

    let (status, json) = post(&router, "/memory/summary", &json!({"text": "they said hi"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["type"], "memory_summary");

    let (_, snapshot) = get(&router, "/status").await;
    assert_eq!(snapshot["memory"]["buffer_length"], 0);
    assert_eq!(snapshot["memory"]["current_summary"]["text"], "they said hi");
    assert_eq!(snapshot["memory"]["current_summary"]["turn"], 1);
}

#[tokio::test]
async fn unknown_asr_kind_is_rejected() {
    let (_conductor, router) = conductor();
    let (status, _) = post(
        &router,
        "/events/asr",
        &json!({"kind": "maybe", "text": "x", "confidence": 0.5}),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn metrics_report_dispatcher_counters() {
    let (conductor, router) = conductor();
    let _sub = conductor.app().dispatcher.subscribe();
    post(&router, "/obs/scene", &json!({"scene": "chatting"})).await;

    let (status, json) = get(&router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "offline");
    assert_eq!(json["dispatcher"]["published"], 1);
    assert_eq!(json["dispatcher"]["subscribers"], 1);
    assert_eq!(json["subscribers"].as_array().unwrap().len(), 1);
    assert!(json["telemetry"].is_null());
}

#[tokio::test]
async fn ndjson_stream_replays_after_since_with_epoch() {
    let (conductor, router) = conductor();
    let app = conductor.app();

    for scene in ["one", "two", "three"] {
        let (status, _) = post(&router, "/obs/scene", &json!({ "scene": scene })).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let req = Request::builder()
        .uri("/stream?since=1")
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );
    assert_eq!(
        resp.headers()["x-conductor-epoch"].to_str().unwrap(),
        app.epoch
    );

    let mut body = resp.into_body().into_data_stream();
    let mut buf = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while buf.lines().filter(|l| !l.is_empty()).count() < 2 {
            let chunk = body.next().await.unwrap().unwrap();
            buf.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    })
    .await
    .unwrap();

    let lines: Vec<Value> = buf
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["seq"], 2);
    assert_eq!(lines[0]["type"], "obs_scene");
    assert_eq!(lines[0]["scene"], "two");
    assert_eq!(lines[1]["seq"], 3);
    assert_eq!(lines[1]["source"], "obs");
}

#[tokio::test]
async fn quiet_ndjson_stream_sends_blank_keepalive_lines() {
    let mut config = ConductorConfig::default();
    config.server.keepalive_ms = 50;
    let (_conductor, router) = conductor_with(&config);

    let req = Request::builder().uri("/stream").body(Body::empty()).unwrap();
    let resp = router.oneshot(req).await.unwrap();
    let mut body = resp.into_body().into_data_stream();

    for _ in 0..2 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&chunk[..], b"\n");
    }
}

#[tokio::test]
async fn ndjson_stream_ends_on_shutdown() {
    let (conductor, router) = conductor();
    let req = Request::builder().uri("/stream").body(Body::empty()).unwrap();
    let resp = router.oneshot(req).await.unwrap();
    let mut body = resp.into_body().into_data_stream();

    conductor.shutdown().await;

    let end = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn mutations_after_shutdown_are_unavailable() {
    let (conductor, router) = conductor();
    conductor.shutdown().await;

    let (status, json) = post(&router, "/obs/scene", &json!({"scene": "late"})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], 503);

    // Reads keep serving the last committed snapshot.
    let (status, _) = get(&router, "/status").await;
    assert_eq!(status, StatusCode::OK);
}
