use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::app_state::AppState;
use crate::crypto::ZERO_KEY;
use crate::db::models::Card;
use crate::db::queries;

/// The all-zero token answers with a fixed key triple for device
/// self-test, without touching any card.
const DIAGNOSTIC_TOKEN: &str = ZERO_KEY;

/// Failures on the device-auth surface. Unlike the LNURL endpoints the
/// programming app speaks plain HTTP, so these carry status codes.
#[derive(Debug)]
pub enum AuthFailure {
    NotFound,
    BadRequest(&'static str),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AuthFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        match self {
            AuthFailure::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({"detail": "Card does not exist."})),
            )
                .into_response(),
            AuthFailure::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, Json(json!({"detail": detail}))).into_response()
            }
            AuthFailure::Internal(err) => {
                tracing::error!("device auth failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthParams {
    a: String,
}

/// Replace the card's OTP; the presented one is single use.
async fn rotate_otp(state: &AppState, card: &Card) -> Result<(), AuthFailure> {
    let new_otp = queries::random_otp();
    queries::update_card_otp(&state.pool, &card.id, &new_otp).await?;
    tracing::info!(card = %card.id, "provisioning OTP rotated");
    Ok(())
}

/// GET /auth?a={otp}
///
/// Provisioning handshake: trades a card's current OTP for its key
/// bundle and scan endpoint.
pub async fn device_auth(
    Query(params): Query<AuthParams>,
    State(state): State<AppState>,
) -> Result<Json<Value>, AuthFailure> {
    if params.a == DIAGNOSTIC_TOKEN {
        return Ok(Json(json!({
            "k0": "0".repeat(32),
            "k1": "1".repeat(32),
            "k2": "2".repeat(32),
        })));
    }

    let card = queries::get_card_by_otp(&state.pool, &params.a)
        .await?
        .ok_or(AuthFailure::NotFound)?;
    rotate_otp(&state, &card).await?;

    Ok(Json(json!({
        "card_name": card.card_name,
        "id": "1",
        "k0": card.k0,
        "k1": card.k1,
        "k2": card.k2,
        "k3": card.k1,
        "k4": card.k2,
        "lnurlw_base": state.config.scan_base(&card.external_id),
        "protocol_name": "new_bolt_card_response",
        "protocol_version": "1",
    })))
}

#[derive(Debug, Deserialize)]
pub struct AuthPostParams {
    a: String,
    #[serde(default)]
    wipe: bool,
}

/// Programming-app payload; the LNURLW field it also sends is ignored.
#[derive(Debug, Deserialize)]
pub struct AuthPostBody {
    #[serde(rename = "UID", default)]
    pub uid: Option<String>,
}

/// POST /auth?a={otp}&wipe={bool} with body {"UID": .., "LNURLW": ..}
///
/// Programming-app variant of the handshake: uppercase response keys,
/// card resolution by UID unless wiping, and a wipe action marker.
pub async fn device_auth_post(
    Query(params): Query<AuthPostParams>,
    State(state): State<AppState>,
    Json(body): Json<AuthPostBody>,
) -> Result<Json<Value>, AuthFailure> {
    let card = if params.wipe {
        queries::get_card_by_otp(&state.pool, &params.a).await?
    } else {
        let uid = body
            .uid
            .as_deref()
            .filter(|uid| !uid.is_empty())
            .ok_or(AuthFailure::BadRequest("Missing UID."))?;
        queries::get_card_by_uid(&state.pool, uid).await?
    }
    .ok_or(AuthFailure::NotFound)?;

    rotate_otp(&state, &card).await?;

    let lnurlw_base = state
        .config
        .scan_base(&card.external_id)
        .replacen("lnurlw://", "LNURLW://", 1);

    let mut response = json!({
        "CARD_NAME": card.card_name,
        "ID": "1",
        "K0": card.k0,
        "K1": card.k1,
        "K2": card.k2,
        "K3": card.k1,
        "K4": card.k2,
        "LNURLW_BASE": lnurlw_base,
        "LNURLW": lnurlw_base,
        "PROTOCOL_NAME": "NEW_BOLT_CARD_RESPONSE",
        "PROTOCOL_VERSION": "1",
    });
    if params.wipe {
        response["action"] = json!("wipe");
    }

    Ok(Json(response))
}
