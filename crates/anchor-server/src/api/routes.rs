//! Route handlers.

use std::sync::Arc;

use anchor_core::db::unix_timestamp;
use anchor_core::model::LookupType;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::error::ApiError;
use crate::auth::check_authorized;
use crate::context::AppContext;
use crate::coresidency::HostCheck;
use crate::jobs::JobState;
use crate::tasks;

type Ctx = State<Arc<AppContext>>;

async fn authorize(ctx: &AppContext, headers: &HeaderMap, account: &str) -> Result<String, ApiError> {
    check_authorized(&ctx.cloud, headers, account)
        .await
        .ok_or(ApiError::Unauthorized)
}

/// Queue a snapshot refresh and return its task id.
async fn submit_refresh(
    ctx: &AppContext,
    account: String,
    token: String,
    region: String,
    lookup_type: LookupType,
) -> String {
    info!(account_number = %account, region = %region, lookup_type = %lookup_type, "Refresh requested");
    let job = tasks::refresh_account(
        ctx.store.clone(),
        ctx.builder.clone(),
        account,
        token,
        region,
        lookup_type,
    );
    ctx.jobs.submit("refresh_account", job).await
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// `GET /task/{task_id}`
pub async fn task_status(Path(task_id): Path<String>, State(ctx): Ctx) -> Json<Value> {
    let state = ctx.jobs.state(&task_id).await;
    Json(json!({"task_status": state}))
}

/// `POST /account/{account}/{region}`: refresh the host snapshot.
pub async fn refresh_account(
    Path((account, region)): Path<(String, String)>,
    headers: HeaderMap,
    State(ctx): Ctx,
) -> Result<Json<Value>, ApiError> {
    let token = authorize(&ctx, &headers, &account).await?;
    let task_id = submit_refresh(&ctx, account, token, region, LookupType::HostServer).await;
    Ok(Json(json!({"task_id": task_id})))
}

/// `GET /account/{account}/{region}`: servers of the fresh host snapshot, if any.
pub async fn get_account(
    Path((account, region)): Path<(String, String)>,
    headers: HeaderMap,
    State(ctx): Ctx,
) -> Result<Json<Value>, ApiError> {
    authorize(&ctx, &headers, &account).await?;
    let snapshot = ctx
        .store
        .read_fresh(&account, &region, LookupType::HostServer, unix_timestamp())
        .await?;
    let data = snapshot.map(|s| json!({"servers": s.servers()}));
    Ok(Json(json!({"data": data})))
}

/// `DELETE /account/{account}/{region}`
pub async fn delete_account(
    Path((account, region)): Path<(String, String)>,
    State(ctx): Ctx,
) -> Result<StatusCode, ApiError> {
    ctx.store.delete(&account, &region).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /account/{account}/{region}/server/{server_id}`: catalogue one new server.
pub async fn add_server(
    Path((account, region, server_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    State(ctx): Ctx,
) -> Result<Json<Value>, ApiError> {
    let token = authorize(&ctx, &headers, &account).await?;

    let Some(snapshot) = ctx
        .store
        .read_fresh(&account, &region, LookupType::HostServer, unix_timestamp())
        .await?
    else {
        return Err(ApiError::BadRequest(
            "You must initialize before checking a server".into(),
        ));
    };

    if ctx
        .store
        .server_cataloged(&account, &region, &server_id, unix_timestamp())
        .await?
    {
        return Err(ApiError::BadRequest(
            "Server has been catalogued already".into(),
        ));
    }

    let duplicate =
        tasks::check_add_server(&ctx.store, &ctx.cloud, &snapshot, &server_id, Some(&token))
            .await?;
    Ok(Json(json!({"duplicate": duplicate})))
}

/// `GET /account/{account}/{region}/server/{server_id}`: who shares this server's host.
pub async fn get_server(
    Path((account, region, server_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    State(ctx): Ctx,
) -> Result<Json<HostCheck>, ApiError> {
    authorize(&ctx, &headers, &account).await?;
    let check = ctx
        .coresidency
        .check_server(&account, &region, &server_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Server was not found".into()))?;
    Ok(Json(check))
}

#[derive(Debug, Deserialize)]
pub struct LookupRequest {
    pub account_number: String,
    pub region: String,
    pub lookup_type: LookupType,
}

/// `POST /lookup`: refresh a snapshot for any lookup dimension.
pub async fn submit_lookup(
    headers: HeaderMap,
    State(ctx): Ctx,
    Json(req): Json<LookupRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = authorize(&ctx, &headers, &req.account_number).await?;
    let task_id = submit_refresh(
        &ctx,
        req.account_number,
        token,
        req.region,
        req.lookup_type,
    )
    .await;
    Ok(Json(json!({"task_id": task_id})))
}

/// `GET /lookup/{task_id}`: state while running, then the stored breakdown.
pub async fn lookup_result(
    Path(task_id): Path<String>,
    State(ctx): Ctx,
) -> Result<Response, ApiError> {
    let state = ctx.jobs.state(&task_id).await;
    if !state.is_finished() {
        return Ok((StatusCode::ACCEPTED, Json(json!({"state": state}))).into_response());
    }

    let value = match ctx.jobs.try_result(&task_id).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            return Ok((StatusCode::ACCEPTED, Json(json!({"state": state}))).into_response());
        }
        Err(e) => {
            return Ok(Json(json!({"state": JobState::Failure, "message": e.to_string()}))
                .into_response());
        }
    };

    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::NotFound("Snapshot was not found".into()))?;
    let snapshot = ctx.store.read_by_id(id).await?;
    Ok(Json(json!({
        "state": JobState::Success,
        "mismatch": snapshot.mismatch(),
        "snapshot": snapshot.to_document(),
        "groups": snapshot.grouped(),
    }))
    .into_response())
}
