use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::db::models::{Card, CreateCardData, Hit, Refund};
use crate::db::queries;

/// Operator API failures, reported FastAPI-style as `{"detail": ..}`.
pub enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, Json(json!({"detail": detail}))).into_response()
            }
            ApiError::NotFound(detail) => {
                (StatusCode::NOT_FOUND, Json(json!({"detail": detail}))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!("card API failure: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WalletQuery {
    wallet: String,
}

fn wallet_ids(query: &WalletQuery) -> Vec<String> {
    query
        .wallet
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn require_hex(value: &str, len: usize, what: &str) -> Result<(), ApiError> {
    match hex::decode(value) {
        Ok(bytes) if bytes.len() == len => Ok(()),
        _ => Err(ApiError::BadRequest(format!("Invalid bytes for {what}."))),
    }
}

fn validate_card_data(data: &CreateCardData) -> Result<(), ApiError> {
    require_hex(&data.uid, 7, "card uid")?;
    require_hex(&data.k0, 16, "k0")?;
    require_hex(&data.k1, 16, "k1")?;
    require_hex(&data.k2, 16, "k2")?;
    require_hex(&data.prev_k0, 16, "prev_k0")?;
    require_hex(&data.prev_k1, 16, "prev_k1")?;
    require_hex(&data.prev_k2, 16, "prev_k2")?;
    Ok(())
}

/// GET /api/v1/cards?wallet=w1,w2
pub async fn list_cards(
    Query(query): Query<WalletQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Card>>, ApiError> {
    let cards = queries::get_cards(&state.pool, &wallet_ids(&query)).await?;
    Ok(Json(cards))
}

#[derive(Debug, Deserialize)]
pub struct CreateCardRequest {
    pub wallet: String,
    #[serde(flatten)]
    pub data: CreateCardData,
}

/// POST /api/v1/cards
pub async fn create_card(
    State(state): State<AppState>,
    Json(request): Json<CreateCardRequest>,
) -> Result<(StatusCode, Json<Card>), ApiError> {
    let mut data = request.data;
    validate_card_data(&data)?;

    if queries::get_card_by_uid(&state.pool, &data.uid)
        .await?
        .is_some()
    {
        return Err(ApiError::BadRequest(
            "UID already registered. Delete registered card and try again.".to_string(),
        ));
    }

    // A zero ceiling in the payload means "use the server default".
    if data.tx_limit == 0 {
        data.tx_limit = state.config.default_tx_limit;
    }
    if data.daily_limit == 0 {
        data.daily_limit = state.config.default_day_limit;
    }
    if data.monthly_limit == 0 {
        data.monthly_limit = state.config.default_month_limit;
    }

    let card = queries::create_card(&state.pool, &data, &request.wallet).await?;
    tracing::info!(card = %card.id, wallet = %request.wallet, "card created");
    Ok((StatusCode::CREATED, Json(card)))
}

/// PUT /api/v1/cards/{card_id}
pub async fn update_card(
    Path(card_id): Path<String>,
    State(state): State<AppState>,
    Json(data): Json<CreateCardData>,
) -> Result<Json<Card>, ApiError> {
    validate_card_data(&data)?;

    let mut card = queries::get_card(&state.pool, &card_id)
        .await?
        .ok_or(ApiError::NotFound("Card does not exist."))?;

    if let Some(other) = queries::get_card_by_uid(&state.pool, &data.uid).await? {
        if other.id != card.id {
            return Err(ApiError::BadRequest(
                "UID already registered. Delete registered card and try again.".to_string(),
            ));
        }
    }

    card.apply_update(&data);
    queries::update_card(&state.pool, &card).await?;
    Ok(Json(card))
}

/// GET /api/v1/cards/enable/{card_id}/{enable}
pub async fn enable_card(
    Path((card_id, enable)): Path<(String, bool)>,
    State(state): State<AppState>,
) -> Result<Json<Card>, ApiError> {
    let card = queries::enable_disable_card(&state.pool, &card_id, enable)
        .await?
        .ok_or(ApiError::NotFound("No card found."))?;
    tracing::info!(card = %card.id, enable, "card enable toggled");
    Ok(Json(card))
}

/// DELETE /api/v1/cards/{card_id}
pub async fn delete_card(
    Path(card_id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    queries::get_card(&state.pool, &card_id)
        .await?
        .ok_or(ApiError::NotFound("Card does not exist."))?;

    queries::delete_card(&state.pool, &card_id).await?;
    tracing::info!(card = %card_id, "card deleted");
    Ok(StatusCode::OK)
}

/// GET /api/v1/hits?wallet=w1,w2
pub async fn list_hits(
    Query(query): Query<WalletQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Hit>>, ApiError> {
    let cards = queries::get_cards(&state.pool, &wallet_ids(&query)).await?;
    let card_ids: Vec<String> = cards.into_iter().map(|card| card.id).collect();
    let hits = queries::get_hits(&state.pool, &card_ids).await?;
    Ok(Json(hits))
}

/// GET /api/v1/refunds?wallet=w1,w2
pub async fn list_refunds(
    Query(query): Query<WalletQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<Refund>>, ApiError> {
    let cards = queries::get_cards(&state.pool, &wallet_ids(&query)).await?;
    let card_ids: Vec<String> = cards.into_iter().map(|card| card.id).collect();
    let hits = queries::get_hits(&state.pool, &card_ids).await?;
    let hit_ids: Vec<String> = hits.into_iter().map(|hit| hit.id).collect();
    let refunds = queries::get_refunds(&state.pool, &hit_ids).await?;
    Ok(Json(refunds))
}
