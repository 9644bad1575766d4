//! HTTP boundary, driven through the router without a listener.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use notiq::api::{ApiServer, ApiServerConfig, AppState};
use notiq::broker::memory::MemoryBroker;
use notiq::domain::Notification;
use notiq::producer::{NotificationPublisher, Producer};
use notiq::{Error, Result};

const QUEUE: &str = "notifications";

struct BrokenPublisher;

#[async_trait]
impl NotificationPublisher for BrokenPublisher {
    async fn publish(&self, _notification: &Notification) -> Result<()> {
        Err(Error::ConnectionExhausted { attempts: 5 })
    }
}

fn router(publisher: Arc<dyn NotificationPublisher>) -> Router {
    ApiServer::new(ApiServerConfig::default(), AppState::new(publisher)).build_router()
}

fn broker_router() -> (MemoryBroker, Router) {
    let broker = MemoryBroker::new();
    let router = router(Arc::new(Producer::new(broker.clone(), QUEUE)));
    (broker, router)
}

async fn post(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn valid_request() -> Value {
    json!({
        "subject": "S",
        "message": "M",
        "recipients": ["a@b.com"],
        "priority": "high"
    })
}

#[tokio::test]
async fn accepted_notification_is_enqueued_once() {
    let (broker, router) = broker_router();

    let (status, body) = post(router, "/notifications/", valid_request()).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(!body["id"].as_str().unwrap().is_empty());
    assert_eq!(body["status"], "pending");
    assert_eq!(body["priority"], "high");
    assert!(body["created_at"].is_string());

    let messages = broker.ready_messages(QUEUE);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].persistent);
    assert_eq!(messages[0].content_type, "application/json");

    let queued = Notification::from_body(&messages[0].body).unwrap();
    assert_eq!(queued.id, body["id"].as_str().unwrap());
    assert_eq!(queued.subject, "S");
    assert_eq!(queued.recipients, vec!["a@b.com".to_string()]);
}

#[tokio::test]
async fn ids_are_unique_across_requests() {
    let (broker, router) = broker_router();

    let (_, first) = post(router.clone(), "/notifications/", valid_request()).await;
    let (_, second) = post(router, "/notifications", valid_request()).await;

    assert_ne!(first["id"], second["id"]);
    assert_eq!(broker.ready_count(QUEUE), 2);
}

#[tokio::test]
async fn priority_defaults_to_normal_and_is_not_validated() {
    let (_, router) = broker_router();

    let (status, body) = post(
        router.clone(),
        "/notifications/",
        json!({"subject": "S", "message": "M", "recipients": ["a@b.com"]}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["priority"], "normal");

    let (status, body) = post(
        router,
        "/notifications/",
        json!({"subject": "S", "message": "M", "recipients": ["a@b.com"], "priority": "urgent"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["priority"], "urgent");
}

#[tokio::test]
async fn invalid_recipients_are_rejected() {
    let (broker, router) = broker_router();

    for recipients in [json!([]), json!(["a@b.com", "not-an-address"])] {
        let (status, body) = post(
            router.clone(),
            "/notifications/",
            json!({"subject": "S", "message": "M", "recipients": recipients}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    assert_eq!(broker.ready_count(QUEUE), 0);
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    let (_, router) = broker_router();

    let (status, body) = post(router, "/notifications/", json!({"subject": "S"})).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn enqueue_failure_is_a_server_error() {
    let router = router(Arc::new(BrokenPublisher));

    let (status, body) = post(router, "/notifications/", valid_request()).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body,
        json!({"code": "INTERNAL_ERROR", "message": "Failed to process notification"})
    );
}

#[tokio::test]
async fn health_reports_healthy() {
    let (_, router) = broker_router();

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
}
