//! End-to-end API tests.
//!
//! Drives the production router through `tower::ServiceExt::oneshot`
//! with every backend swapped for its in-memory implementation — no
//! PostgreSQL, Redis, or broker required.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;
use tower_http::cors::CorsLayer;

use tollgate_core::audit::{AuditManager, MemoryAuditSink};
use tollgate_core::auth::{AuthConfig, Authenticator, Role};
use tollgate_core::breaker::{BreakerConfig, BreakerRegistry};
use tollgate_core::budget::{BudgetConfig, BudgetEngine};
use tollgate_core::dlq::{DlqStore, MemoryDlqStore, NewDlqRecord};
use tollgate_core::ledger::MemoryLedger;
use tollgate_core::token::TokenSigner;
use tollgate_core::users::{MemoryUserDirectory, UserDirectory};
use tollgate_store::{KvStore, MemoryKv};

use tollgate_server::metrics::Metrics;
use tollgate_server::routes;
use tollgate_server::state::{AppState, RateLimits};

const TEST_SECRET: &[u8] = b"integration-secret";
const TEST_BCRYPT_COST: u32 = 4;

struct TestApp {
    router: Router,
    ledger: Arc<MemoryLedger>,
    sink: Arc<MemoryAuditSink>,
    dlq: Arc<MemoryDlqStore>,
}

async fn spawn_app() -> TestApp {
    let kv = Arc::new(MemoryKv::new());
    let ledger = Arc::new(MemoryLedger::new());
    let dlq = Arc::new(MemoryDlqStore::new());

    let users = Arc::new(MemoryUserDirectory::new());
    users
        .add(
            "admin",
            &bcrypt::hash("admin123", TEST_BCRYPT_COST).unwrap(),
            Role::Admin,
        )
        .await;
    users
        .add(
            "watcher",
            &bcrypt::hash("watch123", TEST_BCRYPT_COST).unwrap(),
            Role::Observer,
        )
        .await;

    let audit = Arc::new(AuditManager::new());
    let sink = Arc::new(MemoryAuditSink::new());
    audit.add_sink(Arc::clone(&sink) as _).await;

    let signer = TokenSigner::new(TEST_SECRET, Duration::from_secs(86_400));
    let auth = Arc::new(Authenticator::new(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::clone(&users) as Arc<dyn UserDirectory>,
        signer,
        Arc::clone(&audit),
        AuthConfig {
            bcrypt_cost: TEST_BCRYPT_COST,
            ..AuthConfig::default()
        },
    ));

    let budget = Arc::new(BudgetEngine::new(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::clone(&ledger) as _,
        Arc::clone(&audit),
        BudgetConfig::default(),
    ));

    let breakers = Arc::new(BreakerRegistry::new());
    breakers.register("downstream-llm", BreakerConfig::default());
    breakers.register("sandbox", BreakerConfig::default());

    let state = Arc::new(AppState {
        kv: Arc::clone(&kv) as Arc<dyn KvStore>,
        auth,
        budget,
        dlq: Arc::clone(&dlq) as Arc<dyn DlqStore>,
        breakers,
        audit,
        metrics: Arc::new(Metrics::new().unwrap()),
        rate_limits: RateLimits::default(),
        started_at: Instant::now(),
    });

    TestApp {
        router: routes::app(state, CorsLayer::new()),
        ledger,
        sink,
        dlq,
    }
}

fn request(method: &str, path: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-forwarded-for", "1.2.3.4");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, value)
}

async fn login(app: &TestApp, username: &str, password: &str) -> (StatusCode, Value) {
    send(
        app,
        request(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({ "username": username, "password": password })),
        ),
    )
    .await
}

async fn admin_token(app: &TestApp) -> String {
    let (status, body) = login(app, "admin", "admin123").await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_owned()
}

// ── Auth ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn login_returns_token_role_and_permissions() {
    let app = spawn_app().await;
    let (status, body) = login(&app, "admin", "admin123").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "admin");
    assert!(body["token"].as_str().unwrap().contains('.'));
    let permissions = body["permissions"].as_array().unwrap();
    assert!(permissions.iter().any(|p| p == "system.admin"));
    assert!(permissions.iter().any(|p| p == "budget.view"));

    assert_eq!(app.sink.count_action("auth.login.success").await, 1);
}

#[tokio::test]
async fn bad_credentials_then_lockout_after_threshold() {
    let app = spawn_app().await;

    for _ in 0..5 {
        let (status, body) = login(&app, "admin", "wrong").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "auth.invalid_credentials");
    }

    // Sixth attempt is absorbed by the lockout, correct password included.
    let (status, body) = login(&app, "admin", "admin123").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error_code"], "rate_limit.exceeded");
    assert!(body["message"].as_str().unwrap().contains("15 minutes"));
}

#[tokio::test]
async fn missing_and_malformed_tokens_are_unauthorized() {
    let app = spawn_app().await;

    let (status, body) = send(&app, request("GET", "/api/v1/budget/state?tenant_id=T&project_id=P", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "auth.unauthorized");
    assert!(body["request_id"].as_str().is_some());

    let (status, _) = send(
        &app,
        request(
            "GET",
            "/api/v1/budget/state?tenant_id=T&project_id=P",
            Some("not-a-real-token"),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn provided_request_id_is_echoed_in_error_envelopes() {
    let app = spawn_app().await;

    let req = Request::builder()
        .method("GET")
        .uri("/api/v1/budget/state?tenant_id=T&project_id=P")
        .header("x-request-id", "req-abc-123")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(req).await.unwrap();

    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req-abc-123"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["request_id"], "req-abc-123");
}

#[tokio::test]
async fn observer_is_forbidden_from_budget_operations() {
    let app = spawn_app().await;
    let (status, body) = login(&app, "watcher", "watch123").await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_owned();

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/v1/budget/request",
            Some(&token),
            Some(json!({
                "tenant_id": "T", "project_id": "P", "task_id": "K1",
                "estimated_tokens": 100
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "auth.forbidden");
    let missing = body["details"]["missing_capabilities"].as_array().unwrap();
    assert!(missing.iter().any(|c| c == "budget.view"));
}

// ── Budget ───────────────────────────────────────────────────────────

#[tokio::test]
async fn budget_happy_path_request_commit_state() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;

    let (status, decision) = send(
        &app,
        request(
            "POST",
            "/api/v1/budget/request",
            Some(&token),
            Some(json!({
                "tenant_id": "T", "project_id": "P", "task_id": "K1",
                "model": "synth-large", "estimated_tokens": 10_000
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["approved"], true);
    assert_eq!(decision["allocated"], 10_000);
    let reservation_id = decision["reservation_id"].as_str().unwrap().to_owned();

    let (status, committed) = send(
        &app,
        request(
            "POST",
            "/api/v1/budget/commit",
            Some(&token),
            Some(json!({
                "tenant_id": "T", "project_id": "P",
                "reservation_id": reservation_id, "actual_tokens": 8_000
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(committed["status"], "committed");
    assert_eq!(committed["tokens"], 8_000);

    let (status, state) = send(
        &app,
        request(
            "GET",
            "/api/v1/budget/state?tenant_id=T&project_id=P",
            Some(&token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["total"], 100_000);
    assert_eq!(state["used"], 8_000);
    assert_eq!(state["reserved"], 0);
    assert_eq!(state["available"], 92_000);

    assert_eq!(app.sink.count_action("budget.commit").await, 1);
}

#[tokio::test]
async fn idempotent_retry_returns_same_reservation() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;

    let body = json!({
        "tenant_id": "T", "project_id": "P", "task_id": "K1",
        "estimated_tokens": 500, "request_id": "retry-me"
    });

    let (_, first) = send(
        &app,
        request("POST", "/api/v1/budget/request", Some(&token), Some(body.clone())),
    )
    .await;
    let (_, second) = send(
        &app,
        request("POST", "/api/v1/budget/request", Some(&token), Some(body)),
    )
    .await;

    assert_eq!(first, second);
    assert_eq!(first["reservation_id"], second["reservation_id"]);

    let reserves = app
        .ledger
        .transactions()
        .await
        .into_iter()
        .filter(|t| t.kind == tollgate_core::ledger::TxKind::Reserve)
        .count();
    assert_eq!(reserves, 1);
}

#[tokio::test]
async fn insufficient_budget_is_409_with_availability() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;
    app.ledger.set_limit("T", "P", 100).await;

    let (status, _) = send(
        &app,
        request(
            "POST",
            "/api/v1/budget/request",
            Some(&token),
            Some(json!({
                "tenant_id": "T", "project_id": "P", "task_id": "K0",
                "estimated_tokens": 50
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/v1/budget/request",
            Some(&token),
            Some(json!({
                "tenant_id": "T", "project_id": "P", "task_id": "K1",
                "estimated_tokens": 60
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "budget.insufficient");
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("Available 50, Requested 60")
    );
}

#[tokio::test]
async fn commit_of_unknown_reservation_is_404() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/v1/budget/commit",
            Some(&token),
            Some(json!({
                "tenant_id": "T", "project_id": "P",
                "reservation_id": uuid::Uuid::new_v4(), "actual_tokens": 10
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "resource.not_found");
}

#[tokio::test]
async fn release_is_idempotent_and_audited() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;

    let (_, decision) = send(
        &app,
        request(
            "POST",
            "/api/v1/budget/request",
            Some(&token),
            Some(json!({
                "tenant_id": "T", "project_id": "P", "task_id": "K1",
                "estimated_tokens": 400
            })),
        ),
    )
    .await;
    let reservation_id = decision["reservation_id"].as_str().unwrap().to_owned();

    for _ in 0..2 {
        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/v1/budget/release",
                Some(&token),
                Some(json!({
                    "tenant_id": "T", "project_id": "P",
                    "reservation_id": reservation_id
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "released");
    }

    assert_eq!(app.sink.count_action("budget.release").await, 2);
}

#[tokio::test]
async fn nonpositive_estimate_is_unprocessable() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/v1/budget/request",
            Some(&token),
            Some(json!({
                "tenant_id": "T", "project_id": "P", "task_id": "K1",
                "estimated_tokens": 0
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error_code"], "validation.unprocessable_entity");
}

// ── DLQ ──────────────────────────────────────────────────────────────

async fn seed_dlq_record(app: &TestApp) -> uuid::Uuid {
    app.dlq
        .insert(NewDlqRecord {
            original_subject: "escalation.p0".to_owned(),
            payload: b"stuck message".to_vec(),
            headers: std::collections::BTreeMap::new(),
            error_count: 5,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn dlq_list_get_resolve_roundtrip() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;
    let id = seed_dlq_record(&app).await;

    let (status, list) = send(&app, request("GET", "/api/v1/dlq?resolved=false", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, record) = send(
        &app,
        request("GET", &format!("/api/v1/dlq/{id}"), Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["original_subject"], "escalation.p0");
    assert_eq!(record["error_count"], 5);

    let (status, resolved) = send(
        &app,
        request(
            "POST",
            &format!("/api/v1/dlq/{id}/resolve"),
            Some(&token),
            Some(json!({ "note": "triaged", "requeue": true })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["requeue_requested"], true);

    assert_eq!(app.sink.count_action("dlq.resolve").await, 1);

    // Second resolve conflicts with the specialised code.
    let (status, body) = send(
        &app,
        request(
            "POST",
            &format!("/api/v1/dlq/{id}/resolve"),
            Some(&token),
            Some(json!({ "note": "again", "requeue": false })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], "dlq.already_resolved");
}

#[tokio::test]
async fn dlq_resolve_requires_system_admin() {
    let app = spawn_app().await;
    let id = seed_dlq_record(&app).await;

    let (_, body) = login(&app, "watcher", "watch123").await;
    let token = body["token"].as_str().unwrap().to_owned();

    // Observers cannot even read the DLQ.
    let (status, _) = send(&app, request("GET", "/api/v1/dlq", Some(&token), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        request(
            "POST",
            &format!("/api/v1/dlq/{id}/resolve"),
            Some(&token),
            Some(json!({ "note": "nope", "requeue": false })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_dlq_id_is_404() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;

    let (status, body) = send(
        &app,
        request(
            "GET",
            &format!("/api/v1/dlq/{}", uuid::Uuid::new_v4()),
            Some(&token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "resource.not_found");
}

// ── Circuit breakers ─────────────────────────────────────────────────

#[tokio::test]
async fn breaker_stats_and_reset_all() {
    let app = spawn_app().await;
    let token = admin_token(&app).await;

    let (status, stats) = send(
        &app,
        request("GET", "/api/v1/circuit-breakers", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = stats
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["downstream-llm", "sandbox"]);
    assert!(stats[0]["state"] == "closed");

    let (status, body) = send(
        &app,
        request("POST", "/api/v1/circuit-breakers/reset_all", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset_count"], 2);
    assert_eq!(
        body["breakers"].as_array().unwrap().len(),
        2
    );

    assert_eq!(app.sink.count_action("breakers.reset_all").await, 1);
}

#[tokio::test]
async fn breaker_reset_requires_system_admin() {
    let app = spawn_app().await;
    let (_, body) = login(&app, "watcher", "watch123").await;
    let token = body["token"].as_str().unwrap().to_owned();

    // Observers may view stats (metrics.view) but not reset.
    let (status, _) = send(
        &app,
        request("GET", "/api/v1/circuit-breakers", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        request("POST", "/api/v1/circuit-breakers/reset_all", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "auth.forbidden");
}

// ── Ambient surfaces ─────────────────────────────────────────────────

#[tokio::test]
async fn health_and_metrics_are_unauthenticated() {
    let app = spawn_app().await;

    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "tollgate");

    // Generate one counted request first.
    let _ = login(&app, "admin", "admin123").await;

    let response = app
        .router
        .clone()
        .oneshot(request("GET", "/metrics", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));
    assert!(text.contains("auth_logins_total"));
}

#[tokio::test]
async fn observer_hits_role_rate_limit() {
    let app = spawn_app().await;
    let (_, body) = login(&app, "watcher", "watch123").await;
    let token = body["token"].as_str().unwrap().to_owned();

    // Observer budget: 20/minute. The 21st request is rejected.
    for _ in 0..20 {
        let (status, _) = send(
            &app,
            request("GET", "/api/v1/circuit-breakers", Some(&token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(
        &app,
        request("GET", "/api/v1/circuit-breakers", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error_code"], "rate_limit.exceeded");
}
