mod app_state;
mod bridge;
mod config;
mod crypto;
mod db;
mod handlers;
mod lightning;
mod limits;
mod settlement;
mod validation;

use axum::{
    Router,
    routing::{get, put},
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app_state::AppState;
use config::Config;
use db::init_pool;
use handlers::{auth, cards, lnurlp, lnurlw};
use lightning::MockLightning;
use settlement::SettlementListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boltcard_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::parse());

    let pool = init_pool(&config.database_url).await?;

    // Settlement engine backend (mock until a node backend is wired in).
    let lightning: Arc<dyn lightning::LightningBackend> = Arc::new(MockLightning::new());

    let listener_task = SettlementListener::spawn(pool.clone(), lightning.clone());

    let state = AppState {
        pool,
        config: config.clone(),
        lightning,
    };

    let app = Router::new()
        // Tap / withdraw protocol
        .route("/scan/{external_id}", get(lnurlw::scan))
        .route("/balance/{external_id}", get(lnurlw::balance))
        .route("/lnurl/cb/{hit_id}", get(lnurlw::callback))
        // Refund protocol
        .route("/lnurlp/{hit_id}", get(lnurlp::pay_request))
        .route("/lnurlp/cb/{hit_id}", get(lnurlp::pay_callback))
        // Device provisioning
        .route(
            "/auth",
            get(auth::device_auth).post(auth::device_auth_post),
        )
        // Operator API
        .route(
            "/api/v1/cards",
            get(cards::list_cards).post(cards::create_card),
        )
        .route(
            "/api/v1/cards/{card_id}",
            put(cards::update_card).delete(cards::delete_card),
        )
        .route("/api/v1/cards/enable/{card_id}/{enable}", get(cards::enable_card))
        .route("/api/v1/hits", get(cards::list_hits))
        .route("/api/v1/refunds", get(cards::list_refunds))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.socket_addr()).await?;

    tracing::info!("Server running on {}", config.socket_addr());
    tracing::info!("Domain: {}", config.domain);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    listener_task.stop().await;

    Ok(())
}
