use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::bridge::BridgeError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct StatusOk {
    pub status: &'static str,
}

impl StatusOk {
    pub fn ok() -> Self {
        Self { status: "OK" }
    }
}

/// Failure carrier for the LNURL surface.
///
/// Typed reasons go out as HTTP 200 `{"status":"ERROR","reason":...}` —
/// the tapping hardware cannot interpret status codes. Broken invariants
/// become an opaque 500.
pub enum Failure {
    Lnurl(String),
    Internal(anyhow::Error),
}

impl From<BridgeError> for Failure {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Internal(inner) => Failure::Internal(inner),
            other => Failure::Lnurl(other.to_string()),
        }
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        match self {
            Failure::Lnurl(reason) => (
                StatusCode::OK,
                Json(ErrorBody {
                    status: "ERROR",
                    reason,
                }),
            )
                .into_response(),
            Failure::Internal(err) => {
                tracing::error!("request aborted on internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        status: "ERROR",
                        reason: "Internal server error.".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::TapError;

    #[tokio::test]
    async fn typed_reasons_ship_as_http_200() {
        let response = Failure::from(BridgeError::Tap(TapError::Replayed)).into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ERROR");
        assert_eq!(value["reason"], "This link is already used.");
    }

    #[tokio::test]
    async fn internal_errors_stay_opaque() {
        let response = Failure::Internal(anyhow::anyhow!("hit row vanished")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["reason"], "Internal server error.");
    }
}
