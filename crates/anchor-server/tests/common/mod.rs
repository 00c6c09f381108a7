#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! In-process mock of the cloud provider used by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anchor_core::config::{CloudConfig, Config};
use anchor_server::cloud::AUTH_TOKEN_HEADER;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};

pub const GOOD_TOKEN: &str = "good-token";
pub const ACCOUNT: &str = "123456";
pub const REGION: &str = "iad";

/// Canned provider data served by [`MockUpstream::spawn`].
#[derive(Debug, Default)]
pub struct MockUpstream {
    pub current: Vec<Value>,
    pub legacy: Vec<Value>,
    pub volumes: Vec<Value>,
    pub details: HashMap<String, Value>,
    /// Answer every current-generation listing request with HTTP 500.
    pub fail_current: bool,
}

struct MockState {
    data: MockUpstream,
    base_url: String,
    page_fetches: AtomicUsize,
    page_sizes: std::sync::Mutex<Vec<usize>>,
}

/// Handle to a running mock; the server lives until the test runtime shuts down.
pub struct RunningUpstream {
    pub base_url: String,
    state: Arc<MockState>,
}

impl RunningUpstream {
    /// Number of current-generation listing pages requested.
    pub fn page_fetches(&self) -> usize {
        self.state.page_fetches.load(Ordering::SeqCst)
    }

    /// Item count of every current-generation page served, in order.
    pub fn page_sizes(&self) -> Vec<usize> {
        self.state.page_sizes.lock().unwrap().clone()
    }

    pub fn cloud_config(&self) -> CloudConfig {
        CloudConfig {
            request_timeout_secs: 5,
            ..CloudConfig::with_base_url(&self.base_url)
        }
    }

    pub fn config(&self) -> Config {
        Config {
            cloud: self.cloud_config(),
            ..Config::default()
        }
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTH_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        == Some(GOOD_TOKEN)
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    marker: Option<usize>,
}

async fn list_current(
    Path((region, account)): Path<(String, String)>,
    Query(q): Query<PageQuery>,
    headers: HeaderMap,
    State(state): State<Arc<MockState>>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.page_fetches.fetch_add(1, Ordering::SeqCst);
    if state.data.fail_current {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let limit = q.limit.unwrap_or(1000);
    let start = q.marker.unwrap_or(0).min(state.data.current.len());
    let end = (start + limit).min(state.data.current.len());
    let page = &state.data.current[start..end];
    state.page_sizes.lock().unwrap().push(page.len());

    let mut body = json!({"servers": page});
    if page.len() == limit {
        body["servers_links"] = json!([{
            "href": format!(
                "{}/{region}/v2/{account}/servers/detail?limit={limit}&marker={end}",
                state.base_url
            ),
            "rel": "next",
        }]);
    }
    Json(body).into_response()
}

async fn server_detail(
    Path((_region, _account, id)): Path<(String, String, String)>,
    headers: HeaderMap,
    State(state): State<Arc<MockState>>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.data.details.get(&id) {
        Some(server) => Json(json!({"server": server})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"itemNotFound": {"message": "Instance could not be found"}})),
        )
            .into_response(),
    }
}

async fn list_legacy(headers: HeaderMap, State(state): State<Arc<MockState>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"servers": state.data.legacy})).into_response()
}

async fn list_volumes(headers: HeaderMap, State(state): State<Arc<MockState>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"volumes": state.data.volumes})).into_response()
}

async fn identity_users(headers: HeaderMap) -> StatusCode {
    if authorized(&headers) {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

impl MockUpstream {
    pub async fn spawn(self) -> RunningUpstream {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(MockState {
            data: self,
            base_url: base_url.clone(),
            page_fetches: AtomicUsize::new(0),
            page_sizes: std::sync::Mutex::new(Vec::new()),
        });

        let app = axum::Router::new()
            .route("/{region}/v2/{account}/servers/detail", get(list_current))
            .route("/{region}/v2/{account}/servers/{id}", get(server_detail))
            .route("/v1.0/{account}/servers/detail", get(list_legacy))
            .route("/{region}/volume/v1/{account}/volumes/detail", get(list_volumes))
            .route("/identity/v2.0/users", get(identity_users))
            .with_state(Arc::clone(&state));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        RunningUpstream { base_url, state }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn current_server(id: &str, host: &str) -> Value {
    json!({
        "id": id,
        "name": format!("web-{id}"),
        "hostId": host,
        "OS-EXT-STS:vm_state": "active",
        "created": "2024-03-01T12:00:00Z",
        "flavor": {"id": "performance1-1"},
        "accessIPv4": "104.104.104.104",
        "addresses": {
            "public": [{"version": 4, "addr": "10.0.0.1"}],
            "private": [{"version": 4, "addr": "10.176.0.1"}]
        },
        "metadata": {"rax:reboot_window": "2024-04-01T00:00:00Z;2024-04-01T03:00:00Z"}
    })
}

pub fn zoned_server(id: &str, host: &str, zone: &str) -> Value {
    let mut server = current_server(id, host);
    server["RAX-PUBLIC-IP-ZONE-ID:publicIPZoneId"] = json!(zone);
    server
}

pub fn legacy_server(id: u64, host: &str) -> Value {
    json!({
        "id": id,
        "name": format!("legacy-{id}"),
        "hostId": host,
        "status": "ACTIVE",
        "flavorId": 2,
        "addresses": {"public": ["67.23.10.1"], "private": ["10.180.1.1"]},
        "metadata": {}
    })
}

pub fn volume(id: &str, node: &str) -> Value {
    json!({
        "id": id,
        "display_name": format!("vol-{id}"),
        "status": "in-use",
        "size": 100,
        "bootable": "false",
        "availability_zone": "nova",
        "created_at": "2024-03-01T12:00:00.000000",
        "volume_type": "SSD",
        "metadata": {"storage-node": node}
    })
}

/// `count` current-generation servers, each on its own host.
pub fn many_servers(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| current_server(&format!("srv-{i:04}"), &format!("host-{i:04}")))
        .collect()
}
