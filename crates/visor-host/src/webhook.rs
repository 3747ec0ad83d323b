//! Webhook ingress: an axum router that authenticates HMAC-signed
//! deliveries, bounds body size, consults the rate limiter through the
//! trigger service and answers with the admission decision.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use visor_core::RateRequest;

use crate::trigger::{TriggerDecision, TriggerJob, TriggerService};

pub const SIGNATURE_HEADER: &str = "x-visor-signature";
pub const TIMESTAMP_HEADER: &str = "x-visor-timestamp";
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
/// Deliveries older or newer than this are replays or clock skew.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 5 * 60;

#[derive(Clone)]
pub struct WebhookConfig {
    /// Shared HMAC secret; `None` disables signature verification
    /// (local development only).
    pub secret: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

struct WebhookState {
    service: Arc<TriggerService>,
    config: WebhookConfig,
}

pub fn webhook_router(service: Arc<TriggerService>, config: WebhookConfig) -> Router {
    let max_body = config.max_body_bytes;
    let state = Arc::new(WebhookState { service, config });
    Router::new()
        .route("/webhook/{endpoint}", post(handle_webhook))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

/// Verify an HMAC-SHA256 signature over `"{timestamp}.{body}"` in constant
/// time. The signature may carry a `sha256=` prefix.
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], provided: &str) -> bool {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Reject timestamps outside the allowed skew window.
pub fn timestamp_fresh(timestamp: &str, now_epoch: i64) -> bool {
    let Ok(ts) = timestamp.trim().parse::<i64>() else {
        return false;
    };
    (now_epoch - ts).abs() <= MAX_TIMESTAMP_SKEW_SECS
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if body.len() > state.config.max_body_bytes {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    if let Some(secret) = &state.config.secret {
        let signature = header_str(&headers, SIGNATURE_HEADER);
        let timestamp = header_str(&headers, TIMESTAMP_HEADER);
        let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
            return unauthorized("missing signature headers");
        };
        if !timestamp_fresh(timestamp, Utc::now().timestamp()) {
            return unauthorized("timestamp outside the allowed window");
        }
        if !verify_signature(secret, timestamp, &body, signature) {
            return unauthorized("signature mismatch");
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid JSON body: {err}")})),
            )
                .into_response();
        }
    };

    let event_type = payload
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("webhook")
        .to_string();
    let identity = RateRequest {
        user: payload
            .get("user")
            .and_then(Value::as_str)
            .map(str::to_string),
        channel: Some(endpoint.clone()),
        bot: None,
    };

    let job = TriggerJob {
        endpoint: endpoint.clone(),
        event_type,
        payload,
        roots: Vec::new(),
        identity,
    };

    match state.service.submit(job, 0) {
        TriggerDecision::Accepted { work_id } => {
            debug!(endpoint = %endpoint, work_id = %work_id, "webhook accepted");
            (
                StatusCode::ACCEPTED,
                Json(json!({"status": "queued", "work_id": work_id})),
            )
                .into_response()
        }
        TriggerDecision::RateLimited { retry_after_secs } => (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", retry_after_secs.to_string())],
            Json(json!({
                "status": "rate_limited",
                "retry_after": retry_after_secs,
            })),
        )
            .into_response(),
        TriggerDecision::Busy => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "busy"})),
        )
            .into_response(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn unauthorized(reason: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": reason})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_round_trip_verifies() {
        let secret = "shh";
        let body = br#"{"event":"push"}"#;
        let signature = sign(secret, "1700000000", body);
        assert!(verify_signature(secret, "1700000000", body, &signature));
        assert!(verify_signature(
            secret,
            "1700000000",
            body,
            &format!("sha256={signature}")
        ));
    }

    #[test]
    fn tampered_body_or_timestamp_fails_verification() {
        let secret = "shh";
        let body = br#"{"event":"push"}"#;
        let signature = sign(secret, "1700000000", body);
        assert!(!verify_signature(secret, "1700000001", body, &signature));
        assert!(!verify_signature(
            secret,
            "1700000000",
            br#"{"event":"evil"}"#,
            &signature
        ));
        assert!(!verify_signature("other", "1700000000", body, &signature));
    }

    #[test]
    fn timestamps_outside_the_window_are_stale() {
        let now = 1_700_000_000;
        assert!(timestamp_fresh("1700000000", now));
        assert!(timestamp_fresh(&(now - 299).to_string(), now));
        assert!(!timestamp_fresh(&(now - 301).to_string(), now));
        assert!(!timestamp_fresh(&(now + 301).to_string(), now));
        assert!(!timestamp_fresh("not-a-number", now));
    }
}
