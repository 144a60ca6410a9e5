//! Read-only query routes.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;

use super::StreamState;

pub(super) async fn all_stocks(State(state): State<Arc<StreamState>>) -> impl IntoResponse {
    Json(state.query.all_data())
}

pub(super) async fn stock(
    State(state): State<Arc<StreamState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.query.stock_data(&id))
}

pub(super) async fn summary(State(state): State<Arc<StreamState>>) -> impl IntoResponse {
    Json(state.query.all_stocks_summary())
}

pub(super) async fn all_metadata(State(state): State<Arc<StreamState>>) -> impl IntoResponse {
    Json(state.query.all_metadata())
}

pub(super) async fn metadata(
    State(state): State<Arc<StreamState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.query.stock_metadata(&id))
}

pub(super) async fn stock_ids(State(state): State<Arc<StreamState>>) -> impl IntoResponse {
    Json(state.query.stock_ids())
}
