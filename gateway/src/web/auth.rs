//! API-key authentication for protected routes.
//!
//! Callers identify themselves with an `x-api-key` header. The key doubles as
//! the identity used for rate limiting.

use axum::http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

use super::handlers::ApiError;
use crate::limit::{identity_preview, ApiKeyRecord, ApiKeyRegistry};

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Client address as reported by a fronting proxy.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Authenticate the request and check it may use `permission`.
///
/// - missing key: 401
/// - unknown, inactive or expired key: 403
/// - key lacking the permission or used from a disallowed address: 403
pub fn authenticate<'a>(
    registry: &'a ApiKeyRegistry,
    headers: &HeaderMap,
    permission: &str,
) -> Result<&'a ApiKeyRecord, ApiError> {
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());

    let Some(provided) = provided else {
        warn!("api_key_missing");
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Missing API key: provide an x-api-key header",
        ));
    };

    let Some(record) = registry.validate(provided) else {
        warn!(key = %identity_preview(provided), "api_key_invalid");
        return Err(ApiError::new(StatusCode::FORBIDDEN, "Invalid API key"));
    };

    if !record.has_permission(permission) {
        warn!(key_id = %record.id, permission = permission, "api_key_permission_denied");
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            format!("API key lacks the '{permission}' permission"),
        ));
    }

    if !record.allowed_ips.is_empty() {
        let ip = client_ip(headers);
        let allowed = ip.as_deref().is_some_and(|ip| record.is_ip_allowed(ip));
        if !allowed {
            warn!(key_id = %record.id, ip = ?ip, "api_key_ip_denied");
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "API key not allowed from this address",
            ));
        }
    }

    debug!(key_id = %record.id, permission = permission, "api_key_authorized");
    Ok(record)
}
