//! Webhook ingress with HMAC-SHA256 and bearer token authentication.
//!
//! Provides:
//! - `verify_hmac_sha256()` -- constant-time HMAC-SHA256 signature verification
//! - `verify_bearer_token()` -- constant-time bearer token comparison
//! - `WebhookIngress` -- authenticates a request against the webhook triggers
//!   registered at its path and hands the engine a `Stimulus::Webhook`
//!
//! Duplicate deliveries are not deduplicated; each accepted request is a
//! separate stimulus.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use stepwise_core::repository::workflow::WorkflowRepository;
use stepwise_core::workflow::engine::{StimulusReport, WorkflowEngine};
use stepwise_core::workflow::trigger::{Stimulus, WebhookRoute};
use stepwise_types::workflow::WebhookAuth;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during webhook handling.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// HMAC signature verification failed.
    #[error("HMAC signature verification failed")]
    HmacVerificationFailed,

    /// Bearer token verification failed.
    #[error("bearer token verification failed")]
    BearerVerificationFailed,

    /// No webhook trigger registered at the given path.
    #[error("no webhook registered at path: {0}")]
    PathNotFound(String),

    /// Invalid HMAC key.
    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),

    /// Missing authentication header.
    #[error("missing authentication: {0}")]
    MissingAuth(String),

    /// The trigger names a secret the ingress cannot resolve.
    #[error("unknown webhook secret '{0}'")]
    UnknownSecret(String),
}

// ---------------------------------------------------------------------------
// HMAC-SHA256 verification
// ---------------------------------------------------------------------------

/// Verify a hex-encoded HMAC-SHA256 signature against a request body.
///
/// Comparison is constant-time (via the `hmac` crate's `verify_slice`).
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature_hex: &str) -> Result<(), WebhookError> {
    let expected_bytes = hex_decode(signature_hex).ok_or(WebhookError::HmacVerificationFailed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);

    mac.verify_slice(&expected_bytes)
        .map_err(|_| WebhookError::HmacVerificationFailed)
}

/// Verify an HMAC-SHA256 signature with an optional `sha256=` prefix.
pub fn verify_hmac_sha256_with_prefix(secret: &[u8], body: &[u8], signature: &str) -> Result<(), WebhookError> {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify_hmac_sha256(secret, body, hex_sig)
}

/// Compute HMAC-SHA256 and return the hex-encoded signature.
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| WebhookError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// Bearer token verification
// ---------------------------------------------------------------------------

/// Verify a bearer token (with or without the `Bearer ` prefix) in constant time.
pub fn verify_bearer_token(expected: &str, provided: &str) -> Result<(), WebhookError> {
    let token = provided.strip_prefix("Bearer ").unwrap_or(provided);

    if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(WebhookError::BearerVerificationFailed)
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Resolves the secret names referenced by `WebhookAuth`.
pub trait SecretSource: Send + Sync {
    fn secret(&self, name: &str) -> Option<String>;
}

impl SecretSource for HashMap<String, String> {
    fn secret(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Reads secrets from environment variables named `{prefix}{NAME}`, with the
/// secret name upper-cased and `-` mapped to `_`.
#[derive(Debug, Clone)]
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_uppercase().replace('-', "_"))
    }
}

impl Default for EnvSecrets {
    fn default() -> Self {
        Self::new("STEPWISE_SECRET_")
    }
}

impl SecretSource for EnvSecrets {
    fn secret(&self, name: &str) -> Option<String> {
        std::env::var(self.var_name(name)).ok()
    }
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

/// An inbound webhook call.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub path: &'a str,
    pub body: &'a [u8],
    /// `X-Hub-Signature-256` (or equivalent) header.
    pub signature: Option<&'a str>,
    /// `Authorization` header.
    pub authorization: Option<&'a str>,
}

/// Authenticates webhook calls and converts them into stimuli.
pub struct WebhookIngress<S> {
    secrets: S,
}

impl<S: SecretSource> WebhookIngress<S> {
    pub fn new(secrets: S) -> Self {
        Self { secrets }
    }

    /// Check `request` against every trigger registered at its path.
    ///
    /// The stimulus reaches all of those workflows, so each route's
    /// authentication must accept the request.
    pub fn verify(&self, routes: &[WebhookRoute], request: &WebhookRequest<'_>) -> Result<Stimulus, WebhookError> {
        if routes.is_empty() {
            return Err(WebhookError::PathNotFound(request.path.to_string()));
        }
        for route in routes {
            if let Some(auth) = &route.auth {
                self.authenticate(auth, request).inspect_err(|e| {
                    tracing::warn!(
                        path = request.path,
                        workflow_id = %route.workflow_id,
                        trigger_id = %route.trigger_id,
                        error = %e,
                        "webhook rejected"
                    );
                })?;
            }
        }

        Ok(Stimulus::Webhook {
            path: request.path.to_string(),
            payload: parse_body(request.body),
        })
    }

    /// Verify `request` against the engine's webhook routes and deliver it.
    pub async fn deliver<R: WorkflowRepository + 'static>(
        &self,
        engine: &Arc<WorkflowEngine<R>>,
        request: &WebhookRequest<'_>,
    ) -> Result<StimulusReport, WebhookError> {
        let routes = engine.trigger_manager().webhook_routes(request.path);
        let stimulus = self.verify(&routes, request)?;
        let report = engine.handle_stimulus(&stimulus).await;
        tracing::info!(
            path = request.path,
            started = report.started.len(),
            errors = report.errors.len(),
            "webhook delivered"
        );
        Ok(report)
    }

    fn authenticate(&self, auth: &WebhookAuth, request: &WebhookRequest<'_>) -> Result<(), WebhookError> {
        match auth {
            WebhookAuth::HmacSha256 { secret_name } => {
                let secret = self.resolve(secret_name)?;
                let sig = request
                    .signature
                    .ok_or_else(|| WebhookError::MissingAuth("X-Hub-Signature-256 header required".to_string()))?;
                verify_hmac_sha256_with_prefix(secret.as_bytes(), request.body, sig)
            }
            WebhookAuth::BearerToken { secret_name } => {
                let token = self.resolve(secret_name)?;
                let header = request
                    .authorization
                    .ok_or_else(|| WebhookError::MissingAuth("Authorization header required".to_string()))?;
                verify_bearer_token(&token, header)
            }
        }
    }

    fn resolve(&self, name: &str) -> Result<String, WebhookError> {
        self.secrets
            .secret(name)
            .ok_or_else(|| WebhookError::UnknownSecret(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// JSON bodies pass through; anything else is wrapped as `{"body": "<text>"}`.
fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return json!({});
    }
    serde_json::from_slice(body).unwrap_or_else(|_| json!({ "body": String::from_utf8_lossy(body) }))
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time byte comparison (XOR-based).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn secrets() -> HashMap<String, String> {
        HashMap::from([
            ("github".to_string(), "gh-secret".to_string()),
            ("crm-token".to_string(), "tok-123".to_string()),
        ])
    }

    fn route(auth: Option<WebhookAuth>) -> WebhookRoute {
        WebhookRoute {
            workflow_id: Uuid::now_v7(),
            trigger_id: "hook".to_string(),
            auth,
        }
    }

    fn request<'a>(body: &'a [u8], signature: Option<&'a str>, authorization: Option<&'a str>) -> WebhookRequest<'a> {
        WebhookRequest {
            path: "/hooks/orders",
            body,
            signature,
            authorization,
        }
    }

    // RFC 4231 test case 2
    #[test]
    fn test_hmac_sha256_rfc4231_vector() {
        let key = b"Jefe";
        let data = b"what do ya want for nothing?";
        let expected = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";
        assert_eq!(compute_hmac_sha256_hex(key, data).unwrap(), expected);
        assert!(verify_hmac_sha256(key, data, expected).is_ok());
    }

    #[test]
    fn test_hmac_rejects_tampering() {
        let sig = compute_hmac_sha256_hex(b"k", b"body").unwrap();
        assert!(verify_hmac_sha256(b"k", b"other", &sig).is_err());
        assert!(verify_hmac_sha256(b"wrong", b"body", &sig).is_err());
        assert!(verify_hmac_sha256(b"k", b"body", "zz").is_err());
        assert!(verify_hmac_sha256(b"k", b"body", "é1").is_err());
        assert!(verify_hmac_sha256_with_prefix(b"k", b"body", &format!("sha256={sig}")).is_ok());
    }

    #[test]
    fn test_bearer_token() {
        assert!(verify_bearer_token("abc", "Bearer abc").is_ok());
        assert!(verify_bearer_token("abc", "abc").is_ok());
        assert!(verify_bearer_token("abc", "Bearer abd").is_err());
        assert!(verify_bearer_token("abc", "Bearer abcd").is_err());
    }

    #[test]
    fn test_verify_hmac_route() {
        let ingress = WebhookIngress::new(secrets());
        let body = br#"{"order_id": 42}"#;
        let sig = format!("sha256={}", compute_hmac_sha256_hex(b"gh-secret", body).unwrap());
        let routes = vec![route(Some(WebhookAuth::HmacSha256 {
            secret_name: "github".to_string(),
        }))];

        let stimulus = ingress.verify(&routes, &request(body, Some(&sig), None)).unwrap();
        assert_eq!(
            stimulus,
            Stimulus::Webhook {
                path: "/hooks/orders".to_string(),
                payload: json!({ "order_id": 42 }),
            }
        );

        let err = ingress.verify(&routes, &request(body, None, None)).unwrap_err();
        assert!(matches!(err, WebhookError::MissingAuth(_)));
    }

    #[test]
    fn test_every_route_must_accept() {
        let ingress = WebhookIngress::new(secrets());
        let routes = vec![
            route(None),
            route(Some(WebhookAuth::BearerToken {
                secret_name: "crm-token".to_string(),
            })),
        ];
        assert!(ingress.verify(&routes, &request(b"", None, Some("Bearer tok-123"))).is_ok());
        let err = ingress
            .verify(&routes, &request(b"", None, Some("Bearer nope")))
            .unwrap_err();
        assert!(matches!(err, WebhookError::BearerVerificationFailed));
    }

    #[test]
    fn test_unknown_path_and_secret() {
        let ingress = WebhookIngress::new(secrets());
        assert!(matches!(
            ingress.verify(&[], &request(b"", None, None)),
            Err(WebhookError::PathNotFound(_))
        ));
        let routes = vec![route(Some(WebhookAuth::BearerToken {
            secret_name: "missing".to_string(),
        }))];
        assert!(matches!(
            ingress.verify(&routes, &request(b"", None, Some("x"))),
            Err(WebhookError::UnknownSecret(_))
        ));
    }

    #[test]
    fn test_non_json_body_is_wrapped() {
        assert_eq!(parse_body(b"plain text"), json!({ "body": "plain text" }));
        assert_eq!(parse_body(b""), json!({}));
    }

    #[tokio::test]
    async fn test_deliver_starts_matching_workflow() {
        use crate::memory::InMemoryWorkflowRepository;
        use stepwise_core::workflow::capability::Capabilities;
        use stepwise_types::config::EngineConfig;
        use stepwise_types::workflow::{ExecutionStatus, WorkflowDefinition};

        let engine = WorkflowEngine::new(
            Arc::new(InMemoryWorkflowRepository::new()),
            Capabilities::new(),
            EngineConfig::default(),
        );
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "name": "order-intake",
            "triggers": [{
                "id": "hook",
                "config": {
                    "type": "webhook",
                    "path": "/hooks/orders",
                    "auth": { "type": "bearer_token", "secret_name": "crm-token" }
                }
            }],
            "steps": [{ "id": "settle", "order": 1, "config": { "type": "wait", "duration_ms": 1 } }]
        }))
        .unwrap();
        engine.register(def).await.unwrap();

        let ingress = WebhookIngress::new(secrets());
        let body = br#"{"order_id": 7}"#;
        let report = ingress
            .deliver(&engine, &request(body, None, Some("Bearer tok-123")))
            .await
            .unwrap();
        assert_eq!(report.started.len(), 1);
        let exec = report.started.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.input, json!({ "order_id": 7 }));

        let rejected = ingress
            .deliver(&engine, &request(body, None, Some("Bearer wrong")))
            .await;
        assert!(rejected.is_err());
    }

    #[test]
    fn test_env_secret_names() {
        let env = EnvSecrets::default();
        assert_eq!(env.var_name("crm-token"), "STEPWISE_SECRET_CRM_TOKEN");
    }
}
