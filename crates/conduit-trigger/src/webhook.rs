use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

/// How a webhook caller proves itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Bearer,
    ApiKey,
    Hmac,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::ApiKey => "apikey",
            Self::Hmac => "hmac",
        }
    }
}

/// `authentication` block of a webhook trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub secret: String,
    /// Header (or query parameter, for API keys) carrying the credential.
    #[serde(default)]
    pub token_field: Option<String>,
    /// HMAC digest: `sha256` (default) or `sha512`.
    #[serde(default)]
    pub algorithm: Option<String>,
}

/// The parts of an inbound request that authentication looks at.
/// Header names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Raw body bytes, as signed by the sender.
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub authenticated: bool,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthResult {
    fn accept(method: &str) -> Self {
        Self {
            authenticated: true,
            method: method.to_string(),
            reason: None,
        }
    }

    fn reject(method: &str, reason: &str) -> Self {
        Self {
            authenticated: false,
            method: method.to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

const DEFAULT_BEARER_FIELD: &str = "authorization";
const DEFAULT_API_KEY_FIELD: &str = "x-api-key";
const DEFAULT_SIGNATURE_FIELD: &str = "x-signature";

/// Authenticate a webhook request. Never errors: every problem is a rejection.
pub fn authenticate(config: &WebhookAuthConfig, request: &WebhookRequest) -> AuthResult {
    if !config.enabled {
        return AuthResult::accept("none");
    }
    let method = config.auth_type.as_str();
    if config.secret.is_empty() {
        return AuthResult::reject(method, "Webhook secret not configured");
    }

    match config.auth_type {
        AuthType::Bearer => {
            let field = config.token_field.as_deref().unwrap_or(DEFAULT_BEARER_FIELD);
            // A custom field may carry the bare token.
            let custom_field = config.token_field.is_some();
            let token = request
                .header(field)
                .and_then(|h| {
                    h.strip_prefix("Bearer ")
                        .or_else(|| h.strip_prefix("bearer "))
                        .or(custom_field.then_some(h))
                })
                .map(str::trim)
                .filter(|t| !t.is_empty());
            match token {
                None => AuthResult::reject(method, "Missing bearer token"),
                Some(t) if constant_time_eq(t.as_bytes(), config.secret.as_bytes()) => {
                    AuthResult::accept(method)
                }
                Some(_) => AuthResult::reject(method, "Invalid bearer token"),
            }
        }
        AuthType::ApiKey => {
            let field = config.token_field.as_deref().unwrap_or(DEFAULT_API_KEY_FIELD);
            let key = request
                .header(field)
                .or_else(|| request.query.get(field).map(String::as_str));
            match key {
                None => AuthResult::reject(method, "Missing API key"),
                Some(k) if constant_time_eq(k.as_bytes(), config.secret.as_bytes()) => {
                    AuthResult::accept(method)
                }
                Some(_) => AuthResult::reject(method, "Invalid API key"),
            }
        }
        AuthType::Hmac => {
            let field = config.token_field.as_deref().unwrap_or(DEFAULT_SIGNATURE_FIELD);
            let Some(header) = request.header(field) else {
                return AuthResult::reject(method, "Missing HMAC signature");
            };
            let algorithm = config.algorithm.as_deref().unwrap_or("sha256");
            let Some(expected) = sign(algorithm, config.secret.as_bytes(), &request.body) else {
                return AuthResult::reject(method, "Unsupported HMAC algorithm");
            };
            let provided = header
                .trim()
                .strip_prefix(&format!("{}=", algorithm))
                .unwrap_or(header.trim())
                .to_ascii_lowercase();
            if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
                AuthResult::accept(method)
            } else {
                AuthResult::reject(method, "Invalid HMAC signature")
            }
        }
    }
}

/// Hex-encoded HMAC of `body`, or `None` for an unknown algorithm.
pub fn sign(algorithm: &str, secret: &[u8], body: &[u8]) -> Option<String> {
    let digest = match algorithm {
        "sha256" => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret).ok()?;
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }
        "sha512" => {
            let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(secret).ok()?;
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        }
        _ => return None,
    };
    Some(hex::encode(digest))
}

/// Constant-time comparison; unequal lengths are simply unequal.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
