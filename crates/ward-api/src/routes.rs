use std::hash::{Hash, Hasher};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use ward_core::remote::{
    AcceptInboxResponse, CheckInboxResponse, DeclineInboxResponse, EmptyTrashRequest,
    EmptyTrashResponse, HeartbeatRequest, HeartbeatResponse, InboxActionRequest, LoadRequest,
    LoadResponse, MoveToTrashRequest, MoveToTrashResponse, PushAck, PushRequest,
    RestoreFromTrashRequest, RestoreFromTrashResponse, SaveRequest, SaveResponse,
    SendPatientRequest, SendPatientResponse, USER_HEADER,
};
use ward_core::util::now_ms;
use ward_core::MemoryBackend;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub backend: Arc<MemoryBackend>,
}

impl AppState {
    pub const fn new(config: Arc<AppConfig>, backend: Arc<MemoryBackend>) -> Self {
        Self { config, backend }
    }
}

/// Account a request acts for, taken from the `x-ward-user` header
#[derive(Debug, Clone)]
struct AccountUser(String);

pub fn app_router(state: AppState) -> Router {
    let rpc_routes = Router::new()
        .route("/loadData", post(load_data))
        .route("/saveData", post(save_data))
        .route("/pushMutation", post(push_mutation))
        .route("/moveToTrash", post(move_to_trash))
        .route("/restoreFromTrash", post(restore_from_trash))
        .route("/emptyTrash", post(empty_trash))
        .route("/sendPatient", post(send_patient))
        .route("/checkInbox", post(check_inbox))
        .route("/acceptInboxPatient", post(accept_inbox_patient))
        .route("/declineInboxPatient", post(decline_inbox_patient))
        .route("/heartbeat", post(heartbeat))
        .route_layer(middleware::from_fn(require_user));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1/rpc", rpc_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_user(mut request: Request, next: Next) -> Result<Response, AppError> {
    let user = request
        .headers()
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::unauthorized(format!("missing {USER_HEADER} header")))?
        .to_string();
    request.extensions_mut().insert(AccountUser(user));
    Ok(next.run(request).await)
}

async fn load_data(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<LoadRequest>,
) -> Json<LoadResponse> {
    Json(state.backend.load_data(&user, &request))
}

async fn save_data(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, AppError> {
    let device = request.device_id.clone();
    let outcome = state.backend.save_data(&user, request)?;
    let response = SaveResponse::from(outcome);
    tracing::info!(
        rpc = "saveData",
        user = user_fingerprint(&user),
        device = %device,
        conflict = response.conflict,
        safeguard = response.safeguard,
        "Handled aggregate save"
    );
    Ok(Json(response))
}

async fn push_mutation(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushAck>, AppError> {
    let collection = request.collection;
    let operation = request.operation;
    let ack = state.backend.push_mutation(&user, request)?;
    tracing::debug!(
        rpc = "pushMutation",
        user = user_fingerprint(&user),
        collection = %collection,
        operation = %operation,
        rev = ack.rev,
        duplicate = ack.duplicate,
        "Applied pushed mutation"
    );
    Ok(Json(ack))
}

async fn move_to_trash(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<MoveToTrashRequest>,
) -> Result<Json<MoveToTrashResponse>, AppError> {
    Ok(Json(state.backend.move_to_trash(&user, &request, now_ms())?))
}

async fn restore_from_trash(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<RestoreFromTrashRequest>,
) -> Result<Json<RestoreFromTrashResponse>, AppError> {
    Ok(Json(
        state
            .backend
            .restore_from_trash(&user, &request, now_ms())?,
    ))
}

async fn empty_trash(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<EmptyTrashRequest>,
) -> Json<EmptyTrashResponse> {
    Json(state.backend.empty_trash(&user, &request))
}

async fn send_patient(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<SendPatientRequest>,
) -> Result<Json<SendPatientResponse>, AppError> {
    let response = state.backend.send_patient(&user, request, now_ms())?;
    tracing::info!(
        rpc = "sendPatient",
        user = user_fingerprint(&user),
        inbox_id = %response.inbox_id,
        "Queued patient handover"
    );
    Ok(Json(response))
}

async fn check_inbox(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
) -> Json<CheckInboxResponse> {
    Json(state.backend.check_inbox(&user))
}

async fn accept_inbox_patient(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<InboxActionRequest>,
) -> Result<Json<AcceptInboxResponse>, AppError> {
    Ok(Json(state.backend.accept_inbox_patient(&user, &request)?))
}

async fn decline_inbox_patient(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<InboxActionRequest>,
) -> Result<Json<DeclineInboxResponse>, AppError> {
    Ok(Json(state.backend.decline_inbox_patient(&user, &request)?))
}

async fn heartbeat(
    State(state): State<AppState>,
    Extension(AccountUser(user)): Extension<AccountUser>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    Json(state.backend.heartbeat(&user, request, now_ms()))
}

fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request as HttpRequest, StatusCode};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use ward_core::models::Operation;
    use ward_core::{Aggregate, Patient, RecordKind};

    fn router(backend: &Arc<MemoryBackend>) -> Router {
        app_router(AppState::new(
            Arc::new(AppConfig::default()),
            Arc::clone(backend),
        ))
    }

    async fn call(router: Router, rpc: &str, user: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(format!("/v1/rpc/{rpc}"))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        let response = router
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn push_body(patient: &Patient, key: &str) -> Value {
        serde_json::to_value(PushRequest {
            idempotency_key: key.to_string(),
            collection: RecordKind::Patient,
            operation: Operation::Add,
            doc_id: patient.id.clone(),
            payload: Some(patient.clone().into()),
            device_id: "device-a".to_string(),
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_is_public() {
        let backend = MemoryBackend::new();
        let response = router(&backend)
            .oneshot(
                HttpRequest::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rpc_requires_user_header() {
        let backend = MemoryBackend::new();
        let (status, body) = call(
            router(&backend),
            "loadData",
            None,
            json!({ "clientRev": 0, "deviceId": "d" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains(USER_HEADER));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_then_load_returns_new_revision() {
        let backend = MemoryBackend::new();
        let patient = Patient::new("Ada");

        let (status, ack) = call(
            router(&backend),
            "pushMutation",
            Some("ward-7"),
            push_body(&patient, "patients:a:add:1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack, json!({ "rev": 1, "duplicate": false }));

        let (_, replay) = call(
            router(&backend),
            "pushMutation",
            Some("ward-7"),
            push_body(&patient, "patients:a:add:1"),
        )
        .await;
        assert_eq!(replay, json!({ "rev": 1, "duplicate": true }));

        let (_, loaded) = call(
            router(&backend),
            "loadData",
            Some("ward-7"),
            json!({ "clientRev": 0, "deviceId": "device-b" }),
        )
        .await;
        assert_eq!(loaded["rev"], json!(1));
        assert_eq!(loaded["data"]["patients"][0]["name"], json!("Ada"));

        let (_, current) = call(
            router(&backend),
            "loadData",
            Some("ward-7"),
            json!({ "clientRev": 1, "deviceId": "device-b" }),
        )
        .await;
        assert_eq!(current, json!({ "rev": 1, "upToDate": true }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_save_returns_conflict_body() {
        let backend = MemoryBackend::new();
        backend.seed(
            "ward-7",
            3,
            Aggregate {
                patients: vec![Patient::new("Ada")],
                ..Aggregate::default()
            },
        );
        let body = serde_json::to_value(SaveRequest {
            payload: Aggregate::default(),
            base_rev: 1,
            force: false,
            confirm_wipe: false,
            device_id: "device-a".to_string(),
        })
        .unwrap();

        let (status, response) = call(router(&backend), "saveData", Some("ward-7"), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["conflict"], json!(true));
        assert_eq!(response["serverRev"], json!(3));
        assert_eq!(backend.rev("ward-7"), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_push_maps_to_status_and_code() {
        let backend = MemoryBackend::new();
        backend.set_read_only("ward-7", true);

        let (status, body) = call(
            router(&backend),
            "pushMutation",
            Some("ward-7"),
            push_body(&Patient::new("Ada"), "patients:a:add:2"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], json!("permission-denied"));

        let mut mismatched = push_body(&Patient::new("Ada"), "patients:b:add:3");
        mismatched["docId"] = json!("someone-else");
        backend.set_read_only("ward-7", false);
        let (status, body) = call(router(&backend), "pushMutation", Some("ward-7"), mismatched).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("invalid-argument"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inbox_round_trip_between_accounts() {
        let backend = MemoryBackend::new();
        let patient = Patient::new("Ada");
        let (status, sent) = call(
            router(&backend),
            "sendPatient",
            Some("alice"),
            json!({ "toUser": "bob", "patient": patient, "note": "bed 4" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, inbox) = call(router(&backend), "checkInbox", Some("bob"), json!({})).await;
        assert_eq!(inbox["items"].as_array().unwrap().len(), 1);

        let (status, accepted) = call(
            router(&backend),
            "acceptInboxPatient",
            Some("bob"),
            json!({ "inboxId": sent["inboxId"] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["rev"], json!(1));

        let (status, body) = call(
            router(&backend),
            "declineInboxPatient",
            Some("bob"),
            json!({ "inboxId": sent["inboxId"] }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], json!("not-found"));
    }
}
