//! Token extraction and verification for API requests.

use axum::http::HeaderMap;

use crate::cloud::{AUTH_TOKEN_HEADER, CloudClient};

/// Pull the caller's token from the `X-Auth-Token` header.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTH_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Validate `token` for `account_number` against the identity endpoint.
pub async fn verify(cloud: &CloudClient, account_number: &str, token: &str) -> bool {
    cloud.check_token(account_number, token).await
}

/// Extract and verify in one step, yielding the token only when it is valid.
pub async fn check_authorized(
    cloud: &CloudClient,
    headers: &HeaderMap,
    account_number: &str,
) -> Option<String> {
    let token = extract_token(headers)?;
    verify(cloud, account_number, &token).await.then_some(token)
}
