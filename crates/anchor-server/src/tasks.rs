//! Job bodies run on the [`JobQueue`](crate::jobs::JobQueue), plus the
//! synchronous single-server catalogue path.

use anchor_core::db::DatabaseError;
use anchor_core::model::{AccountSnapshot, LookupType};
use anchor_core::normalize::{CurrentServer, parse_server};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::builder::SnapshotBuilder;
use crate::cloud::CloudClient;
use crate::store::CacheStore;

/// Build a snapshot and store it.
///
/// Yields `{"id": <snapshot id>, "stored": bool}`. When a newer build already
/// landed, `stored` is false and `id` names the snapshot that was kept.
pub async fn refresh_account(
    store: CacheStore,
    builder: SnapshotBuilder,
    account_number: String,
    token: String,
    region: String,
    lookup_type: LookupType,
) -> Result<Value, DatabaseError> {
    let mut snapshot = builder
        .build(&account_number, &token, &region, lookup_type)
        .await;

    if store.upsert(&mut snapshot).await? {
        return Ok(json!({"id": snapshot.id, "stored": true}));
    }

    let kept = store.read(&account_number, &region, lookup_type).await?;
    Ok(json!({"id": kept.map(|s| s.id), "stored": false}))
}

/// Fetch one server, normalize it and append it to `snapshot`.
///
/// Uses `token` when given, otherwise the token the snapshot was built with.
/// Returns `Some(duplicate)` once stored, or `None` when the server could not
/// be fetched or parsed, in which case nothing is written.
pub async fn check_add_server(
    store: &CacheStore,
    cloud: &CloudClient,
    snapshot: &AccountSnapshot,
    server_id: &str,
    token: Option<&str>,
) -> Result<Option<bool>, DatabaseError> {
    let token = token.unwrap_or(&snapshot.token);
    let Some(raw) = cloud
        .server_details(&snapshot.account_number, token, &snapshot.region, server_id)
        .await
    else {
        return Ok(None);
    };
    let Some(record) = parse_server::<CurrentServer>(raw, snapshot.lookup_type) else {
        warn!(server_id, "Server detail could not be normalized");
        return Ok(None);
    };

    let duplicate = store.append_server(snapshot, &record).await?;
    info!(
        account_number = %snapshot.account_number,
        region = %snapshot.region,
        server_id,
        duplicate,
        "Server added to cache"
    );
    Ok(Some(duplicate))
}
