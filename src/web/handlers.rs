//! HTTP request handlers.

use super::AppState;
use crate::aggregate::{summarize, Summary, WindowConfig};
use crate::db::{DbError, Tick, Website};
use crate::hub::{Allocation, Validator};

use axum::{
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ============================================================================
// Identity
// ============================================================================

/// Authenticated end user, as asserted by the upstream identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

pub const USER_HEADER: &str = "x-user-id";

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or((StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn is_valid_url(url: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").unwrap());
    re.is_match(url)
}

fn error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Website not found").into_response(),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Fetch a website, hiding other users' websites behind a 404.
fn owned_website(state: &AppState, user: &UserId, id: &str) -> Result<Website, DbError> {
    let website = state.store.get_website(id)?;
    if website.user_id != user.0 {
        return Err(DbError::NotFound);
    }
    Ok(website)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteStatus {
    pub id: String,
    pub url: String,
    pub disabled: bool,
    #[serde(flatten)]
    pub summary: Summary,
}

fn website_status(state: &AppState, website: Website) -> Result<WebsiteStatus, DbError> {
    let ticks = state.store.get_ticks(&website.id)?;
    let summary = summarize(&ticks, Utc::now(), &WindowConfig::from(&state.config));
    Ok(WebsiteStatus {
        id: website.id,
        url: website.url,
        disabled: website.disabled,
        summary,
    })
}

// ============================================================================
// API: Websites
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateWebsiteRequest {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWebsiteResponse {
    pub id: String,
}

pub async fn handle_create_website(
    State(state): State<AppState>,
    user: UserId,
    Json(req): Json<CreateWebsiteRequest>,
) -> impl IntoResponse {
    let url = req.url.trim();
    if !is_valid_url(url) {
        return (StatusCode::BAD_REQUEST, "Invalid URL").into_response();
    }

    match state.store.add_website(&user.0, url) {
        Ok(website) => {
            tracing::info!("Website {} added for {}", website.id, user.0);
            (StatusCode::CREATED, Json(CreateWebsiteResponse { id: website.id })).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub website_id: String,
}

pub async fn handle_website_status(
    State(state): State<AppState>,
    user: UserId,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    match owned_website(&state, &user, &query.website_id).and_then(|w| website_status(&state, w)) {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_list_websites(
    State(state): State<AppState>,
    user: UserId,
) -> impl IntoResponse {
    let websites = match state.store.get_user_websites(&user.0) {
        Ok(w) => w,
        Err(e) => return error_response(e),
    };

    let statuses: Result<Vec<WebsiteStatus>, DbError> = websites
        .into_iter()
        .map(|w| website_status(&state, w))
        .collect();

    match statuses {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteWebsiteRequest {
    pub website_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn handle_delete_website(
    State(state): State<AppState>,
    user: UserId,
    Json(req): Json<DeleteWebsiteRequest>,
) -> impl IntoResponse {
    match state.store.disable_website(&req.website_id, &user.0) {
        Ok(()) => {
            tracing::info!("Website {} disabled", req.website_id);
            Json(MessageResponse {
                message: "Website deleted successfully".to_string(),
            })
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: Rechecks
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecheckRequest {
    pub website_id: String,
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CheckOutcome {
    Resolved,
    TimedOut,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub correlation_id: String,
    pub validator_id: String,
    pub outcome: CheckOutcome,
    pub tick: Option<Tick>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecheckResponse {
    /// No validator was available; the website is checked once one connects
    pub queued: bool,
    pub dispatched: Vec<String>,
    pub coalesced: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<CheckResult>>,
}

pub async fn handle_recheck(
    State(state): State<AppState>,
    user: UserId,
    Json(req): Json<RecheckRequest>,
) -> impl IntoResponse {
    let website = match owned_website(&state, &user, &req.website_id) {
        Ok(w) if !w.disabled => w,
        Ok(_) => return (StatusCode::NOT_FOUND, "Website not found").into_response(),
        Err(e) => return error_response(e),
    };

    let allocations = state.scheduler.request_recheck(&website);
    let mut response = RecheckResponse {
        queued: allocations.is_empty(),
        ..Default::default()
    };
    for allocation in &allocations {
        match allocation {
            Allocation::Created(h) => response.dispatched.push(h.correlation_id.clone()),
            Allocation::Coalesced(h) => response.coalesced.push(h.correlation_id.clone()),
        }
    }

    if req.wait && !allocations.is_empty() {
        let limit = state.scheduler.settings().check_timeout;
        let waits = allocations.into_iter().map(|allocation| {
            let handle = allocation.handle().clone();
            async move {
                let correlation_id = handle.correlation_id.clone();
                let validator_id = handle.validator_id.clone();
                let tick = handle.tick(limit).await.ok();
                CheckResult {
                    correlation_id,
                    validator_id,
                    outcome: if tick.is_some() {
                        CheckOutcome::Resolved
                    } else {
                        CheckOutcome::TimedOut
                    },
                    tick,
                }
            }
        });
        response.results = Some(futures::future::join_all(waits).await);
        return Json(response).into_response();
    }

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

// ============================================================================
// API: Validators
// ============================================================================

pub async fn handle_list_validators(
    State(state): State<AppState>,
    _user: UserId,
) -> Json<Vec<Validator>> {
    Json(state.hub.registry().authenticated())
}
