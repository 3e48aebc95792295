//! Router, shared state, and handlers.
//!
//! Core operations are synchronous `SQLite` round-trips, so every handler
//! runs them through [`tokio::task::spawn_blocking`].

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use subsync_core::account::SubscriptionView;
use subsync_core::credentials::{Argon2Hasher, CredentialError, CredentialHasher};
use subsync_core::store::{Account, AccountId};
use subsync_core::webhook::{SIGNATURE_HEADER, SignatureVerifier, WebhookError, WebhookProcessor};
use subsync_core::{
    AccountStore, ClaimWorkflow, Clock, Reconciler, RequestContext, SessionRegistry,
    SubscriptionBackend, SubsyncConfig,
};

use crate::auth::{Anonymous, Authenticated, REQUEST_ID_HEADER};
use crate::error::ApiError;

/// Services shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountStore>,
    pub claims: Arc<ClaimWorkflow>,
    pub sessions: Arc<SessionRegistry>,
    pub webhooks: Arc<WebhookProcessor>,
}

impl AppState {
    /// Wires the services over one backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential hasher cannot initialize.
    pub fn new(
        config: &SubsyncConfig,
        backend: Arc<dyn SubscriptionBackend>,
        hasher: Arc<dyn CredentialHasher>,
        webhook_secret: SecretString,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CredentialError> {
        let accounts = Arc::new(AccountStore::new(
            Arc::clone(&backend),
            hasher,
            Arc::clone(&clock),
            config.subscription_policy(),
        )?);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&accounts),
            Arc::clone(&backend),
            Arc::clone(&clock),
        ));
        let claims = Arc::new(ClaimWorkflow::new(
            Arc::clone(&accounts),
            Arc::clone(&backend),
            Arc::clone(&clock),
        ));
        let sessions = Arc::new(SessionRegistry::new(
            config.session.ttl(),
            config.session.max_sessions,
            Arc::clone(&clock),
        ));
        let verifier = SignatureVerifier::new(webhook_secret, config.webhook.tolerance(), clock);
        let webhooks = Arc::new(WebhookProcessor::new(verifier, reconciler));

        Ok(Self {
            accounts,
            claims,
            sessions,
            webhooks,
        })
    }

    /// Production wiring with the default Argon2id hasher.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential hasher cannot initialize.
    pub fn with_default_hasher(
        config: &SubsyncConfig,
        backend: Arc<dyn SubscriptionBackend>,
        webhook_secret: SecretString,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CredentialError> {
        Self::new(
            config,
            backend,
            Arc::new(Argon2Hasher::new()),
            webhook_secret,
            clock,
        )
    }
}

/// Builds the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/payments", post(payment_webhook))
        .route("/accounts", post(create_account))
        .route("/sessions", post(create_session).delete(delete_session))
        .route("/subscription", get(get_subscription))
        .route("/subscription/claim", post(claim_subscription))
        .with_state(state)
}

async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    ApiError: From<E>,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = RequestContext::from_request_id(
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let processed = tokio::task::spawn_blocking(move || {
        state.webhooks.process(&ctx, signature.as_deref(), &body)
    })
    .await;

    match processed {
        Ok(Ok(_)) => (StatusCode::OK, "OK").into_response(),
        Ok(Err(err)) => err.into_response(),
        Err(join) => WebhookError::Persistence(join.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct CreateAccountRequest {
    email: String,
    username: String,
    password: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct AccountResponse {
    id: AccountId,
    email: String,
    username: String,
    name: String,
    subscription: SubscriptionView,
}

impl AccountResponse {
    fn new(account: Account, subscription: SubscriptionView) -> Self {
        Self {
            id: account.id,
            email: account.email,
            username: account.username,
            name: account.name,
            subscription,
        }
    }
}

async fn create_account(
    State(state): State<AppState>,
    Anonymous(ctx): Anonymous,
    Json(req): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), ApiError> {
    let accounts = Arc::clone(&state.accounts);
    let account = blocking(move || {
        accounts.create_account(
            &ctx,
            &req.email,
            &req.username,
            &SecretString::from(req.password),
            &req.name,
        )
    })
    .await?;

    let subscription = state.accounts.view_of(&account);
    Ok((
        StatusCode::CREATED,
        Json(AccountResponse::new(account, subscription)),
    ))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct SessionResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

async fn create_session(
    State(state): State<AppState>,
    Anonymous(ctx): Anonymous,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let accounts = Arc::clone(&state.accounts);
    let password = SecretString::from(req.password);
    let username = req.username;
    let account = blocking(move || accounts.authenticate(&ctx, &username, &password))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let issued = state.sessions.issue(account.id, &account.username)?;
    Ok(Json(SessionResponse {
        token: issued.token.as_str().to_string(),
        expires_at: issued.expires_at,
    }))
}

async fn delete_session(State(state): State<AppState>, auth: Authenticated) -> StatusCode {
    state.sessions.revoke(&auth.token);
    tracing::info!(
        trace_id = %auth.ctx.trace_id(),
        operation = "revoke_session",
        outcome = "revoked",
        "signed out"
    );
    StatusCode::NO_CONTENT
}

async fn subscription_view(
    state: &AppState,
    account_id: AccountId,
) -> Result<Json<SubscriptionView>, ApiError> {
    let accounts = Arc::clone(&state.accounts);
    blocking(move || accounts.subscription(account_id))
        .await?
        .map(Json)
        .ok_or(ApiError::Unauthorized)
}

async fn get_subscription(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Result<Json<SubscriptionView>, ApiError> {
    let account_id = signed_in_account(&auth.ctx)?;
    subscription_view(&state, account_id).await
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    email: String,
}

async fn claim_subscription(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<SubscriptionView>, ApiError> {
    let account_id = signed_in_account(&auth.ctx)?;
    let claims = Arc::clone(&state.claims);
    let ctx = auth.ctx;
    blocking(move || claims.claim(&ctx, &req.email)).await?;

    subscription_view(&state, account_id).await
}

fn signed_in_account(ctx: &RequestContext) -> Result<AccountId, ApiError> {
    ctx.identity()
        .map(|identity| identity.account_id)
        .ok_or(ApiError::Unauthorized)
}
