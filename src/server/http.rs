//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::chat::ChatEvent;
use crate::db::schemas::OperationKind;
use crate::guard::{DispatchOutcome, Rejection};
use crate::recovery::OperationStatusView;
use crate::types::BailiffError;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Header carrying the webhook shared secret
pub const TOKEN_HEADER: &str = "x-bailiff-token";

/// Largest accepted `/events` body
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<(), BailiffError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Bailiff listening on {} (storage: {})",
        state.args.listen,
        state.storage.as_str()
    );
    if state.args.webhook_secret.is_none() {
        warn!("No webhook secret configured - /events accepts unauthenticated calls");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request<B>(state: Arc<AppState>, req: Request<B>) -> Result<Response<BoxBody>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => health_check(&state),
        (Method::GET, "/version") => version_info(),
        (Method::POST, "/events") => {
            if !authorized(&state, &req) {
                return Ok(to_boxed(json_response(
                    StatusCode::UNAUTHORIZED,
                    &json!({ "error": "Unauthorized" }),
                )));
            }
            match Limited::new(req.into_body(), MAX_EVENT_BYTES).collect().await {
                Ok(collected) => handle_event(&state, &collected.to_bytes()).await,
                Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => json_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &json!({ "error": "Payload Too Large", "limit": MAX_EVENT_BYTES }),
                ),
                Err(e) => {
                    warn!(error = %e, "Failed to read event body");
                    bad_request_response("Unreadable body")
                }
            }
        }
        (Method::GET, p) if p.starts_with("/operations/") => operation_status(&state, p).await,
        _ => not_found_response(&path),
    };

    Ok(to_boxed(response))
}

fn authorized<B>(state: &AppState, req: &Request<B>) -> bool {
    let Some(secret) = state.args.webhook_secret.as_deref() else {
        return true;
    };
    req.headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|token| token == secret)
}

/// Deserialize a chat event and hand it to the dispatcher
async fn handle_event(state: &AppState, body: &[u8]) -> Response<Full<Bytes>> {
    let event: ChatEvent = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(e) => return bad_request_response(&format!("Invalid event: {}", e)),
    };

    let event_id = event.event_id().to_string();
    debug!(event_id, community_id = event.community_id(), "Dispatching chat event");
    match state.dispatcher.handle(event).await {
        DispatchOutcome::Completed(handled) => json_response(
            StatusCode::OK,
            &json!({ "eventId": event_id, "outcome": "completed", "handled": format!("{:?}", handled) }),
        ),
        DispatchOutcome::Failed(reason) => json_response(
            StatusCode::OK,
            &json!({ "eventId": event_id, "outcome": "failed", "error": reason }),
        ),
        DispatchOutcome::Rejected(rejection) => {
            let status = match rejection {
                Rejection::CoolingDown { .. } => StatusCode::TOO_MANY_REQUESTS,
                Rejection::DuplicateEvent | Rejection::InFlight => StatusCode::CONFLICT,
            };
            json_response(
                status,
                &json!({ "eventId": event_id, "outcome": "rejected", "reason": rejection.to_string() }),
            )
        }
    }
}

/// `GET /operations/{community}/{type}`
async fn operation_status(state: &AppState, path: &str) -> Response<Full<Bytes>> {
    let rest = path.trim_start_matches("/operations/");
    let Some((community_id, operation_type)) = rest.split_once('/') else {
        return not_found_response(path);
    };
    let Some(kind) = OperationKind::parse(operation_type) else {
        return not_found_response(path);
    };
    let community_id = match urlencoding::decode(community_id) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => return bad_request_response("Invalid community id"),
    };

    let status = match state.recovery.get_operation_status(&community_id, kind).await {
        Ok(status) => status,
        Err(e) => {
            error!(community_id, operation = %kind, error = %e, "Failed to read operation status");
            return json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({ "error": "Operation status unavailable" }),
            );
        }
    };

    let body = match status {
        OperationStatusView::Active(record) => json!({
            "communityId": community_id,
            "operationType": kind.as_str(),
            "status": "in_progress",
            "recoveryId": record.recovery_id,
            "startTime": rfc3339(record.start_time),
            "lastHeartbeat": record.last_heartbeat.map(rfc3339),
            "initiatedBy": record.metadata.initiated_by,
            "recoveryAttempts": record.recovery_attempts,
            "progress": record.data,
        }),
        OperationStatusView::Completed(done) => json!({
            "communityId": community_id,
            "operationType": kind.as_str(),
            "status": "completed",
            "recoveryId": done.recovery_id,
            "startTime": rfc3339(done.start_time),
            "completedAt": rfc3339(done.completed_at),
            "initiatedBy": done.metadata.initiated_by,
            "recovered": done.recovered,
            "result": done.result,
        }),
        OperationStatusView::Unknown => json!({
            "communityId": community_id,
            "operationType": kind.as_str(),
            "status": "unknown",
        }),
    };
    json_response(StatusCode::OK, &body)
}

fn rfc3339(at: bson::DateTime) -> String {
    at.try_to_rfc3339_string().unwrap_or_default()
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    storage: &'static str,
    #[serde(rename = "inFlight")]
    in_flight: usize,
    #[serde(rename = "pendingPrompts")]
    pending_prompts: usize,
    recovering: bool,
}

/// Liveness probe: always 200 while the process runs
fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let response = HealthResponse {
        healthy: true,
        storage: state.storage.as_str(),
        in_flight: state.guard.in_flight_len(),
        pending_prompts: state.dispatcher.prompts().len(),
        recovering: state.recovery.is_recovering(),
    };
    json_response(StatusCode::OK, &response)
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    commit: &'static str,
    commit_full: &'static str,
    build_time: &'static str,
    service: &'static str,
}

fn version_info() -> Response<Full<Bytes>> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "bailiff",
    };
    json_response(StatusCode::OK, &response)
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(value)
        .unwrap_or_else(|_| r#"{"error":"Serialization failed"}"#.to_string());

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({ "error": "Not Found", "path": path }),
    )
}

fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::BAD_REQUEST,
        &json!({ "error": "Bad Request", "message": message }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::fixture;
    use crate::commands::{DispatchConfig, Dispatcher};
    use crate::config::Args;
    use crate::guard::{DispatchGuard, GuardConfig};
    use crate::server::StorageBackend;
    use clap::Parser;

    fn state(secret: Option<&str>) -> Arc<AppState> {
        let fx = fixture();
        let mut args = Args::try_parse_from(["bailiff"]).unwrap();
        args.webhook_secret = secret.map(str::to_string);

        let guard = DispatchGuard::new(&GuardConfig::default());
        let recovery = fx.runner.recovery().clone();
        let dispatcher = Dispatcher::new(
            guard.clone(),
            Arc::new(fx.runner.clone()),
            fx.chat.clone(),
            DispatchConfig::default(),
        );
        Arc::new(AppState::new(args, StorageBackend::Memory, dispatcher, guard, recovery))
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<BoxBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn warn_event(event_id: &str) -> String {
        json!({
            "type": "message",
            "eventId": event_id,
            "communityId": "g1",
            "channelId": "c1",
            "author": { "id": "mod-1", "isModerator": true },
            "content": "!warn <@u2> language"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let state = state(None);

        let health = handle_request(state.clone(), request(Method::GET, "/health", "")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(body_json(health).await["storage"], "memory");

        let version = handle_request(state, request(Method::GET, "/version", "")).await.unwrap();
        let version = body_json(version).await;
        assert_eq!(version["service"], "bailiff");
        assert!(version["commit_full"].is_string());
    }

    #[tokio::test]
    async fn test_events_require_secret_when_configured() {
        let state = state(Some("hunter2"));

        let denied = handle_request(state.clone(), request(Method::POST, "/events", &warn_event("e1")))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut allowed = request(Method::POST, "/events", &warn_event("e1"));
        allowed
            .headers_mut()
            .insert(TOKEN_HEADER, HeaderValue::from_static("hunter2"));
        let response = handle_request(state, allowed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["outcome"], "completed");
    }

    #[tokio::test]
    async fn test_duplicate_event_is_conflict() {
        let state = state(None);

        handle_request(state.clone(), request(Method::POST, "/events", &warn_event("e1")))
            .await
            .unwrap();
        let again = handle_request(state, request(Method::POST, "/events", &warn_event("e1")))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_event_is_bad_request() {
        let state = state(None);
        let response = handle_request(state, request(Method::POST, "/events", "{\"type\":\"typing\"}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_operation_status_routes() {
        let state = state(None);

        let unknown = handle_request(state.clone(), request(Method::GET, "/operations/g1/role_resync", ""))
            .await
            .unwrap();
        assert_eq!(body_json(unknown).await["status"], "unknown");

        let bad_type = handle_request(state, request(Method::GET, "/operations/g1/cleanup", ""))
            .await
            .unwrap();
        assert_eq!(bad_type.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oversized_event_is_rejected_unread() {
        let state = state(None);
        let padding = "x".repeat(MAX_EVENT_BYTES + 1);
        let body = json!({ "type": "message", "eventId": "big", "content": padding }).to_string();

        let response = handle_request(state.clone(), request(Method::POST, "/events", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // The event id was never admitted, so a normal event with it still runs
        let retry = handle_request(state, request(Method::POST, "/events", &warn_event("big")))
            .await
            .unwrap();
        assert_eq!(retry.status(), StatusCode::OK);
    }
}
