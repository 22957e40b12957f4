use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use crate::{
    convert::ValidationError,
    domain::{ObjectRef, StatusTag},
    http::{AppState, build_router},
    proxy_supervisor::ProxyHealthHandle,
    reconcile::ReconcileHandle,
    status::{LoopPhase, StatusBoard},
};

fn app_with(board: StatusBoard, reconcile: ReconcileHandle) -> axum::Router {
    build_router(AppState {
        board,
        proxy_health: ProxyHealthHandle::new_unknown(),
        reconcile,
    })
}

async fn seeded_board() -> StatusBoard {
    let board = StatusBoard::new();
    let errors = vec![ValidationError::MissingSecret {
        ingress: Some(ObjectRef::new("shop", "web")),
        host: Some("secure.example.com".to_string()),
        secret: ObjectRef::new("shop", "secure-tls"),
    }];
    board
        .record_entities(
            vec![
                ("rule:shop.example.com".to_string(), StatusTag::Unchanged),
                ("path:shop.example.com/api".to_string(), StatusTag::Added),
            ],
            &errors,
        )
        .await;
    board.set_phase(LoopPhase::Idle).await;
    board
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let res = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = res.status();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn healthz_returns_ok() {
    let app = app_with(StatusBoard::new(), ReconcileHandle::noop());
    let res = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn health_reports_proxy_status() {
    let app = app_with(StatusBoard::new(), ReconcileHandle::noop());
    let (status, body) = get_json(app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["proxy"]["status"], "unknown");
}

#[tokio::test]
async fn status_reports_phase_and_counters() {
    let board = seeded_board().await;
    let (status, body) = get_json(app_with(board, ReconcileHandle::noop()), "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sync"]["phase"], "idle");
    assert_eq!(body["sync"]["counters"]["cycles"], 0);
    assert_eq!(body["sync"]["last_cycle"], Value::Null);
    assert_eq!(body["proxy"]["status"], "unknown");
}

#[tokio::test]
async fn entities_list_includes_statuses_and_errors() {
    let board = seeded_board().await;
    let (status, body) =
        get_json(app_with(board, ReconcileHandle::noop()), "/api/entities").await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(
        items[0],
        json!({"entity": "path:shop.example.com/api", "kind": "status", "status": "added"})
    );
    assert_eq!(items[2]["entity"], "tls:secure.example.com");
    assert_eq!(items[2]["kind"], "error");
}

#[tokio::test]
async fn entities_can_be_filtered_by_status() {
    let board = seeded_board().await;
    let app = app_with(board, ReconcileHandle::noop());

    let (_, body) = get_json(app.clone(), "/api/entities?status=error").await;
    let entities: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["entity"].as_str().unwrap())
        .collect();
    assert_eq!(entities, vec!["tls:secure.example.com"]);

    let (status, body) = get_json(app, "/api/entities?status=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");
    assert!(body["error"]["details"]["allowed"].is_array());
}

#[tokio::test]
async fn single_entity_lookup_accepts_slashes() {
    let board = seeded_board().await;
    let app = app_with(board, ReconcileHandle::noop());

    let (status, body) = get_json(app.clone(), "/api/entities/path:shop.example.com/api").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "added");

    let (status, body) = get_json(app, "/api/entities/rule:missing.example.com").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn resync_endpoint_requests_a_resync() {
    let reconcile = ReconcileHandle::detached();
    let app = app_with(StatusBoard::new(), reconcile.clone());
    let res = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/resync")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert!(reconcile.resync_requested());
}

#[tokio::test]
async fn unknown_routes_use_error_envelope() {
    let app = app_with(StatusBoard::new(), ReconcileHandle::noop());
    let (status, body) = get_json(app, "/api/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}
