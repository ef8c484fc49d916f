//! REST surface for machine lifecycle.
//!
//! Both routes require a bearer token checked against the auth service.
//! Orchestrator failures come back as JSON `{error, details}` bodies with
//! 4xx/5xx statuses; nothing here panics over an unreachable control
//! plane.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use cabin_core::AgentError;

use crate::AppState;

/// The `/api/machine*` routes with their CORS policy applied.
pub fn rest_router() -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/machine", post(create_machine))
        .route("/api/machine/:id", get(get_machine))
        .layer(cors)
}

/// `POST /api/machine`: create a machine; the request body is ignored.
async fn create_machine(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(rejection) = require_bearer(&state, &headers).await {
        return rejection;
    }

    let client = match state.machines.get().await {
        Ok(client) => client,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "orchestrator unavailable", &e),
    };

    match client.create_machine().await {
        Ok(machine) => Json(json!({ "machine_id": machine.id })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "machine creation failed", &e),
    }
}

/// `GET /api/machine/:id`: inspect a machine.
async fn get_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = require_bearer(&state, &headers).await {
        return rejection;
    }

    let client = match state.machines.get().await {
        Ok(client) => client,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "orchestrator unavailable", &e),
    };

    match client.get_machine(&id).await {
        Ok(machine) => Json(json!({ "success": true, "machine": machine })).into_response(),
        Err(AgentError::MachineNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "machine not found", "details": id })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "machine lookup failed", &e),
    }
}

/// Check the `Authorization: Bearer` header against the auth service.
async fn require_bearer(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(token) = bearer_token(headers) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        )
            .into_response());
    };

    match state.auth.verify(token).await {
        Ok(true) => Ok(()),
        Ok(false) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid token" })),
        )
            .into_response()),
        Err(e) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "token verification failed", "details": e.to_string() })),
        )
            .into_response()),
    }
}

fn error_response(status: StatusCode, error: &str, details: &AgentError) -> Response {
    (
        status,
        Json(json!({ "error": error, "details": details.to_string() })),
    )
        .into_response()
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().expect("header"));
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, "Basic abc123".parse().expect("header"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn create_machine_without_token_is_unauthorized() {
        let (state, _guard) = test_state();
        let app = rest_router().with_state(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/machine")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn get_machine_without_token_is_unauthorized() {
        let (state, _guard) = test_state();
        let app = rest_router().with_state(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/machine/m1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn preflight_exposes_cors_policy() {
        let (state, _guard) = test_state();
        let app = rest_router().with_state(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/machine")
                    .header(header::ORIGIN, "https://ide.example.dev")
                    .header("Access-Control-Request-Method", "POST")
                    .header("Access-Control-Request-Headers", "authorization")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        let allow_origin = response
            .headers()
            .get("access-control-allow-origin")
            .expect("allow-origin header");
        assert_eq!(allow_origin, "*");
    }

    #[tokio::test]
    async fn unknown_paths_are_not_served() {
        let (state, _guard) = test_state();
        let app = rest_router().with_state(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/unknown")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
