use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use super::AdminState;
use crate::cache::flags::UnknownFlag;
use crate::cache::CacheFlag;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub store: &'static str,
    pub active_connections: u64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CacheStatus {
    pub enabled: bool,
    pub local_only: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FlagStatus {
    pub flag: &'static str,
    pub value: bool,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    UnknownFlag(#[from] UnknownFlag),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match self {
            AdminError::UnknownFlag(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        store: state.store_name,
        active_connections: state.connections.active_count(),
    })
}

pub async fn get_cache(State(state): State<AdminState>) -> Json<CacheStatus> {
    let policy = state.flags.snapshot();
    Json(CacheStatus {
        enabled: policy.enabled,
        local_only: policy.local_only,
    })
}

pub async fn get_flag(
    State(state): State<AdminState>,
    Path(flag): Path<String>,
) -> Result<Json<FlagStatus>, AdminError> {
    let flag: CacheFlag = flag.parse()?;
    Ok(Json(flag_status(&state, flag)))
}

pub async fn set_flag(
    State(state): State<AdminState>,
    Path(flag): Path<String>,
) -> Result<Json<FlagStatus>, AdminError> {
    let flag: CacheFlag = flag.parse()?;
    state.flags.flag(flag).set();
    tracing::info!(flag = %flag, "Cache flag set");
    Ok(Json(flag_status(&state, flag)))
}

pub async fn clear_flag(
    State(state): State<AdminState>,
    Path(flag): Path<String>,
) -> Result<Json<FlagStatus>, AdminError> {
    let flag: CacheFlag = flag.parse()?;
    state.flags.flag(flag).clear();
    tracing::info!(flag = %flag, "Cache flag cleared");
    Ok(Json(flag_status(&state, flag)))
}

fn flag_status(state: &AdminState, flag: CacheFlag) -> FlagStatus {
    FlagStatus {
        flag: flag.as_str(),
        value: state.flags.flag(flag).get(),
    }
}
