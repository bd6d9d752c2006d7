use crate::{config::Config, lightning::LightningBackend};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;

/// Shared state handed to every handler: the card store, server config
/// and the settlement engine.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<Sqlite>,
    pub config: Arc<Config>,
    pub lightning: Arc<dyn LightningBackend>,
}
