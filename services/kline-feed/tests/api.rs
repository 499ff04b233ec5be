//! HTTP surface tests against a running engine.

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use kline_feed::api::{create_router, ApiState};
use kline_feed::{EngineHandle, FeedEngine};
use serde_json::Value;
use tower::ServiceExt;

async fn start_engine() -> (EngineHandle, Router, Arc<ManualClock>) {
    let clock = ManualClock::new(minute(5) + 1_000);
    let exchange = StubExchange::new((0..5).map(|m| closed(m, 100.0 + m as f64)));
    let connector = ChannelConnector::new();

    let engine = FeedEngine::new(test_config(), exchange, connector)
        .with_clock(clock.clone())
        .start();
    let view = engine.view();
    wait_for_series(&view, |s| s.len() == 5).await;
    wait_for_connectivity(&view, true).await;

    let router = create_router(ApiState::new(view).with_clock(clock.clone()));
    (engine, router, clock)
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_series_and_connectivity() {
    let (mut engine, router, _) = start_engine().await;

    let (status, body) = call(&router, get("/v1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], true);
    assert_eq!(body["connectionState"], "connected");
    assert_eq!(body["paused"], false);
    assert_eq!(body["candles"], 5);
    assert_eq!(body["firstBucket"], minute(0));
    assert_eq!(body["lastBucket"], minute(4));
    assert!(body["metrics"]["history_loaded"].as_u64().unwrap() == 5);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_series_selection() {
    let (mut engine, router, _) = start_engine().await;

    let (status, body) = call(&router, get("/v1/series")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["candles"].as_array().unwrap().len(), 5);
    assert!(body["domain"].is_null());

    let (status, body) = call(&router, get("/v1/series?minutes=2")).await;
    assert_eq!(status, StatusCode::OK);
    let closes: Vec<f64> = body["prices"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["value"].as_f64().unwrap())
        .collect();
    assert_eq!(closes, vec![103.0, 104.0]);
    assert_eq!(body["percentChange"][0]["value"], 0.0);
    assert_eq!(body["domain"][1], minute(5) + 1_000);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_series_rejects_zero_minutes() {
    let (mut engine, router, _) = start_engine().await;

    let (status, body) = call(&router, get("/v1/series?minutes=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BAD_REQUEST");

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_chart_window_padded_to_now() {
    let (mut engine, router, _) = start_engine().await;

    let (status, body) = call(&router, get("/v1/chart?limit=3")).await;
    assert_eq!(status, StatusCode::OK);
    let candles = body["candles"].as_array().unwrap();
    assert_eq!(candles.len(), 3);
    assert_eq!(candles[2]["bucketStart"], minute(5));
    assert_eq!(candles[2]["close"], 104.0);
    assert_eq!(candles[2]["isClosed"], false);

    let (status, _) = call(&router, get("/v1/chart?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_pause_toggle() {
    let (mut engine, router, _) = start_engine().await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/pause")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"paused":true}"#))
        .unwrap();
    let (status, body) = call(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], true);
    assert_eq!(body["previous"], false);

    let (_, body) = call(&router, get("/v1/status")).await;
    assert_eq!(body["paused"], true);

    engine.stop().await;
}
