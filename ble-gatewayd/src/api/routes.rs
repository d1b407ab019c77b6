use std::sync::Arc;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tokio::sync::watch;
use shared::protocol::{CLAIM_PATH, CONFIG_PATH, PRESENCE_HASH_PATH, PRESENCE_PATH};
use shared::types::{ClaimResponse, PresenceView};
use crate::config::PresenceConfig;
use crate::presence::{PresenceTracker, ReportQueue};
use crate::registry::RegistryHandle;
use super::error::ApiError;

pub type GatewayTracker = PresenceTracker<RegistryHandle, ReportQueue>;

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub tracker: Arc<GatewayTracker>,
    pub digest_rx: watch::Receiver<String>,
    pub presence: Arc<PresenceConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(CONFIG_PATH, get(get_config))
        .route(CLAIM_PATH, post(claim_identifier))
        .route(PRESENCE_PATH, get(get_presence))
        .route(PRESENCE_HASH_PATH, get(get_presence_hash))
        .with_state(state)
}

async fn get_config(State(state): State<AppState>) -> Json<PresenceConfig> {
    Json(state.presence.as_ref().clone())
}

/// Hand out one identifier nobody has claimed yet
async fn claim_identifier(
    State(state): State<AppState>,
) -> Result<Json<ClaimResponse>, ApiError> {
    tracing::info!("Identifier claim request received");
    let identifier = state.registry.claim_one_inactive().await?;
    Ok(Json(ClaimResponse { identifier }))
}

async fn get_presence(State(state): State<AppState>) -> Json<Vec<PresenceView>> {
    Json(state.tracker.snapshot())
}

async fn get_presence_hash(State(state): State<AppState>) -> String {
    state.digest_rx.borrow().clone()
}
