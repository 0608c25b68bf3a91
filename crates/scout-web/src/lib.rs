//! Axum API surface: registration, token login, subscription CRUD and result
//! listing. Thin by design; all pipeline behavior lives in scout-pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Form, Json, Router,
};
use scout_core::{NewSubscription, NewUser, User};
use scout_store::Store;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-web";

type HandlerError = (StatusCode, String);

/// Shared handler state. Session tokens are process-local: losing them on
/// restart only forces a re-login, nothing durable depends on them.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    sessions: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub phone_number: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub query: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/register", post(register_handler))
        .route("/token", post(token_handler))
        .route(
            "/search-requests",
            get(list_subscriptions_handler).post(create_subscription_handler),
        )
        .route(
            "/search-requests/{id}",
            axum::routing::delete(deactivate_subscription_handler),
        )
        .route("/search-requests/{id}/results", get(list_results_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn internal_error(err: impl std::fmt::Display) -> HandlerError {
    error!(%err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

fn unauthorized() -> HandlerError {
    (
        StatusCode::UNAUTHORIZED,
        "Incorrect email or password".to_string(),
    )
}

fn hash_password(password: &str) -> Result<String, HandlerError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(internal_error)
}

fn password_matches(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Resolves the bearer token to an active user.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, HandlerError> {
    let not_authenticated = || (StatusCode::UNAUTHORIZED, "Not authenticated".to_string());

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(not_authenticated)?;

    let user_id = state
        .sessions
        .lock()
        .await
        .get(token)
        .copied()
        .ok_or_else(not_authenticated)?;

    let user = state
        .store
        .user_by_id(user_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(not_authenticated)?;
    if !user.active {
        return Err(not_authenticated());
    }
    Ok(user)
}

async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), HandlerError> {
    let existing = state
        .store
        .user_by_email(&req.email)
        .await
        .map_err(internal_error)?;
    if existing.is_some() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Email already registered".to_string(),
        ));
    }

    let user = state
        .store
        .create_user(NewUser {
            email: req.email,
            password_hash: hash_password(&req.password)?,
            phone_number: req.phone_number,
        })
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn token_handler(
    State(state): State<AppState>,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>, HandlerError> {
    let user = state
        .store
        .user_by_email(&form.username)
        .await
        .map_err(internal_error)?
        .ok_or_else(unauthorized)?;
    if !password_matches(&form.password, &user.password_hash) {
        return Err(unauthorized());
    }

    let token = Uuid::new_v4().to_string();
    state.sessions.lock().await.insert(token.clone(), user.id);
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
    }))
}

async fn create_subscription_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<scout_core::Subscription>), HandlerError> {
    let user = authenticate(&state, &headers).await?;
    let subscription = state
        .store
        .create_subscription(NewSubscription {
            user_id: user.id,
            query: req.query,
        })
        .await
        .map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn list_subscriptions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<scout_core::Subscription>>, HandlerError> {
    let user = authenticate(&state, &headers).await?;
    let subscriptions = state
        .store
        .subscriptions_for_user(user.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(subscriptions))
}

/// Loads a subscription and 404s unless the caller owns it.
async fn owned_subscription(
    state: &AppState,
    user: &User,
    id: Uuid,
) -> Result<scout_core::Subscription, HandlerError> {
    let not_found = || (StatusCode::NOT_FOUND, "Search request not found".to_string());
    let subscription = state
        .store
        .subscription_by_id(id)
        .await
        .map_err(internal_error)?
        .ok_or_else(not_found)?;
    if subscription.user_id != user.id {
        return Err(not_found());
    }
    Ok(subscription)
}

async fn deactivate_subscription_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, HandlerError> {
    let user = authenticate(&state, &headers).await?;
    let subscription = owned_subscription(&state, &user, id).await?;
    state
        .store
        .deactivate_subscription(subscription.id)
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_results_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<scout_core::SearchResult>>, HandlerError> {
    let user = authenticate(&state, &headers).await?;
    let subscription = owned_subscription(&state, &user, id).await?;
    let results = state
        .store
        .results_for_subscription(subscription.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use scout_store::MemStore;
    use tower::ServiceExt;

    fn test_app() -> (Router, AppState) {
        let state = AppState::new(Arc::new(MemStore::new()));
        (app(state.clone()), state)
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register(app: &Router, email: &str) {
        let resp = app
            .clone()
            .oneshot(json_request(
                "/register",
                serde_json::json!({
                    "email": email,
                    "password": "hunter2",
                    "phone_number": "+15550100",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    async fn login(app: &Router, email: &str, password: &str) -> Option<String> {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/token")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!("username={email}&password={password}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        if resp.status() != StatusCode::OK {
            return None;
        }
        let json = body_json(resp).await;
        Some(json["access_token"].as_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn register_rejects_a_duplicate_email() {
        let (app, _state) = test_app();
        register(&app, "u@example.com").await;

        let resp = app
            .oneshot(json_request(
                "/register",
                serde_json::json!({
                    "email": "u@example.com",
                    "password": "other",
                    "phone_number": "+15550101",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_response_never_leaks_the_password_hash() {
        let (app, _state) = test_app();
        let resp = app
            .oneshot(json_request(
                "/register",
                serde_json::json!({
                    "email": "u@example.com",
                    "password": "hunter2",
                    "phone_number": "+15550100",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert_eq!(json["email"], "u@example.com");
        assert!(json.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn login_succeeds_with_the_right_password_only() {
        let (app, _state) = test_app();
        register(&app, "u@example.com").await;

        assert!(login(&app, "u@example.com", "hunter2").await.is_some());
        assert!(login(&app, "u@example.com", "wrong").await.is_none());
        assert!(login(&app, "nobody@example.com", "hunter2").await.is_none());
    }

    #[tokio::test]
    async fn subscription_crud_requires_a_valid_token() {
        let (app, _state) = test_app();
        register(&app, "u@example.com").await;
        let token = login(&app, "u@example.com", "hunter2").await.unwrap();

        // Unauthenticated listing is rejected.
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/search-requests")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Create, then list.
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/search-requests")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::from(
                        serde_json::json!({"query": "vintage camera"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["query"], "vintage camera");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/search-requests")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn results_of_another_users_subscription_are_not_found() {
        let (app, _state) = test_app();
        register(&app, "owner@example.com").await;
        register(&app, "other@example.com").await;
        let owner_token = login(&app, "owner@example.com", "hunter2").await.unwrap();
        let other_token = login(&app, "other@example.com", "hunter2").await.unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/search-requests")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, format!("Bearer {owner_token}"))
                    .body(Body::from(
                        serde_json::json!({"query": "vintage camera"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let created = body_json(resp).await;
        let id = created["id"].as_str().unwrap().to_string();

        let uri = format!("/search-requests/{id}/results");
        let owner_resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(&uri)
                    .header(header::AUTHORIZATION, format!("Bearer {owner_token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(owner_resp.status(), StatusCode::OK);

        let other_resp = app
            .oneshot(
                Request::builder()
                    .uri(&uri)
                    .header(header::AUTHORIZATION, format!("Bearer {other_token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(other_resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_deactivates_instead_of_removing() {
        let (app, state) = test_app();
        register(&app, "u@example.com").await;
        let token = login(&app, "u@example.com", "hunter2").await.unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/search-requests")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::from(
                        serde_json::json!({"query": "vintage camera"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let created = body_json(resp).await;
        let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/search-requests/{id}"))
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let reloaded = state.store.subscription_by_id(id).await.unwrap().unwrap();
        assert!(!reloaded.active);
    }
}
