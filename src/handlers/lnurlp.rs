use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use super::reply::Failure;
use crate::app_state::AppState;
use crate::bridge::{self, PayOffer};

/// GET /lnurlp/{hit_id}
///
/// Pay offer for refunding a settled hit.
pub async fn pay_request(
    Path(hit_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PayOffer>, Failure> {
    let offer = bridge::refund_offer(&state.pool, &state.config, &hit_id).await?;
    Ok(Json(offer))
}

#[derive(Debug, Deserialize)]
pub struct PayCallbackParams {
    amount: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PayCallbackResponse {
    pub pr: String,
    pub routes: Vec<serde_json::Value>,
}

/// GET /lnurlp/cb/{hit_id}?amount={msat}
pub async fn pay_callback(
    Path(hit_id): Path<String>,
    Query(params): Query<PayCallbackParams>,
    State(state): State<AppState>,
) -> Result<Json<PayCallbackResponse>, Failure> {
    // An unparseable amount is treated like a missing one.
    let amount_msat = params.amount.as_deref().and_then(|a| a.parse::<u64>().ok());

    let pr = bridge::refund_invoice(&state.pool, state.lightning.as_ref(), &hit_id, amount_msat)
        .await?;
    Ok(Json(PayCallbackResponse {
        pr,
        routes: Vec::new(),
    }))
}
