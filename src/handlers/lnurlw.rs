use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::reply::{Failure, StatusOk};
use crate::app_state::AppState;
use crate::bridge::{self, WithdrawOffer};

#[derive(Debug, Deserialize)]
pub struct ScanParams {
    p: String,
    c: String,
}

fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    for name in ["x-real-ip", "x-forwarded-for"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return value.to_string();
        }
    }
    addr.ip().to_string()
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// GET /scan/{external_id}?p={picc}&c={cmac}
///
/// Verifies the tap and answers with a withdraw offer keyed by the
/// recorded hit.
pub async fn scan(
    Path(external_id): Path<String>,
    Query(params): Query<ScanParams>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<WithdrawOffer>, Failure> {
    let offer = bridge::request_offer(
        &state.pool,
        state.lightning.as_ref(),
        &state.config,
        &external_id,
        &params.p,
        &params.c,
        &client_ip(&headers, &addr),
        &user_agent(&headers),
    )
    .await?;
    Ok(Json(offer))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    k1: Option<String>,
    pr: Option<String>,
    pin: Option<String>,
}

/// GET /lnurl/cb/{hit_id}?k1={hit_id}&pr={bolt11}[&pin={pin}]
pub async fn callback(
    Path(hit_id): Path<String>,
    Query(params): Query<CallbackParams>,
    State(state): State<AppState>,
) -> Result<Json<StatusOk>, Failure> {
    bridge::claim_offer(
        &state.pool,
        state.lightning.as_ref(),
        &hit_id,
        params.k1.as_deref(),
        params.pr.as_deref(),
        params.pin.as_deref(),
    )
    .await?;
    Ok(Json(StatusOk::ok()))
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: i64,
}

/// GET /balance/{external_id}?p={picc}&c={cmac}
pub async fn balance(
    Path(external_id): Path<String>,
    Query(params): Query<ScanParams>,
    State(state): State<AppState>,
) -> Result<Json<BalanceResponse>, Failure> {
    let balance = bridge::tap_balance(
        &state.pool,
        state.lightning.as_ref(),
        &external_id,
        &params.p,
        &params.c,
    )
    .await?;
    Ok(Json(BalanceResponse { balance }))
}
