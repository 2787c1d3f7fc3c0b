//! RPC surface for the ceremony control plane (spec.md §6).

use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::Principal;
use crate::blob::BlobStore;
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::finalizer::{self, FinalizeCircuitRequest};
use crate::store::Store;
use crate::verifier::{self, VerifyContributionRequest};
use crate::worker::WorkerPool;

/// Shared application state handed to every RPC handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub blob: Arc<dyn BlobStore>,
    pub workers: Arc<dyn WorkerPool>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<CoordinatorConfig>,
}

impl FromRef<AppState> for String {
    fn from_ref(state: &AppState) -> String {
        state.config.jwt_secret.clone()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/verifyContribution", post(verify_contribution))
        .route("/finalizeCircuit", post(finalize_circuit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn verify_contribution(
    State(state): State<AppState>,
    caller: Principal,
    Json(req): Json<VerifyContributionRequest>,
) -> Result<()> {
    verifier::verify_contribution(
        state.store.as_ref(),
        state.blob.as_ref(),
        state.workers.as_ref(),
        state.clock.as_ref(),
        &state.config,
        &caller,
        req,
    )
    .await
}

async fn finalize_circuit(
    State(state): State<AppState>,
    caller: Principal,
    Json(req): Json<FinalizeCircuitRequest>,
) -> Result<()> {
    finalizer::finalize_circuit(
        state.store.as_ref(),
        state.blob.as_ref(),
        state.clock.as_ref(),
        &caller,
        req,
    )
    .await
}
