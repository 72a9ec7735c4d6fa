use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheStatsSnapshot;

use super::AdminState;

const ALL_INDICES: &str = "_all";

#[derive(Serialize)]
struct IndexStats {
    query_result_cache: CacheStatsSnapshot,
}

#[derive(Serialize)]
struct Acknowledged {
    acknowledged: bool,
}

#[derive(Serialize)]
struct AdminError {
    error: &'static str,
}

#[derive(Debug, Deserialize)]
pub(super) struct IndexSettingsUpdate {
    enabled: bool,
}

fn stats_response(name: &str, snapshot: CacheStatsSnapshot) -> Response {
    let body = BTreeMap::from([(
        name.to_string(),
        IndexStats {
            query_result_cache: snapshot,
        },
    )]);
    Json(body).into_response()
}

fn acknowledged() -> Response {
    Json(Acknowledged { acknowledged: true }).into_response()
}

fn no_index_named() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(AdminError {
            error: "no index named in path",
        }),
    )
        .into_response()
}

/// Split a comma-separated index list, dropping blanks.
fn split_indices(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|index| !index.is_empty())
        .collect()
}

pub(super) async fn health(State(state): State<AdminState>) -> Response {
    if state.cache.is_closed() {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

pub(super) async fn stats_all(State(state): State<AdminState>) -> Response {
    stats_response(ALL_INDICES, state.cache.stats_snapshot())
}

pub(super) async fn stats_indices(
    State(state): State<AdminState>,
    Path(index): Path<String>,
) -> Response {
    let indices = split_indices(&index);
    if indices.is_empty() {
        return no_index_named();
    }
    stats_response(&indices.join(","), state.cache.stats_snapshot_for(&indices))
}

pub(super) async fn clear_all(State(state): State<AdminState>) -> Response {
    state.cache.mark_all_dirty();
    acknowledged()
}

pub(super) async fn clear_indices(
    State(state): State<AdminState>,
    Path(index): Path<String>,
) -> Response {
    let indices = split_indices(&index);
    if indices.is_empty() {
        return no_index_named();
    }
    state.cache.clear_scopes(&indices);
    acknowledged()
}

/// Toggle caching for one index, registering it if unknown. Disabling also
/// queues the index for sweeping so re-enabling never serves old entries.
pub(super) async fn update_index_settings(
    State(state): State<AdminState>,
    Path(index): Path<String>,
    Json(update): Json<IndexSettingsUpdate>,
) -> Response {
    let index = index.trim();
    if index.is_empty() || index.contains(',') {
        return no_index_named();
    }

    if !state.indices.set_enabled(index, update.enabled) {
        state.indices.register(index, update.enabled);
        info!(index, enabled = update.enabled, "Index registered");
    }
    if !update.enabled {
        state.cache.clear_scopes(&[index]);
    }
    acknowledged()
}
