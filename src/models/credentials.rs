//! Google Drive authentication material.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// OAuth authorized-user token as written by Google's installed-app flow
/// (`token.json`).
#[derive(Deserialize, Clone)]
pub struct OAuthToken {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,

    /// Cached access token, reused until `expiry`.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,

    #[serde(default)]
    pub token_uri: Option<String>,
}

/// Service-account key file.
#[derive(Deserialize, Clone)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,

    #[serde(default)]
    pub private_key_id: Option<String>,

    #[serde(default)]
    pub token_uri: Option<String>,
}

/// Credentials used to obtain Drive access tokens.
#[derive(Clone)]
pub enum Credentials {
    OAuth(OAuthToken),
    ServiceAccount(ServiceAccountKey),
}

impl Credentials {
    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::OAuth(_) => "oauth token",
            Credentials::ServiceAccount(_) => "service account",
        }
    }

    pub fn token_uri(&self) -> &str {
        let uri = match self {
            Credentials::OAuth(token) => token.token_uri.as_deref(),
            Credentials::ServiceAccount(key) => key.token_uri.as_deref(),
        };
        uri.unwrap_or(DEFAULT_TOKEN_URI)
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::OAuth(token) => f
                .debug_struct("OAuth")
                .field("client_id", &token.client_id)
                .field("token_uri", &self.token_uri())
                .finish_non_exhaustive(),
            Credentials::ServiceAccount(key) => f
                .debug_struct("ServiceAccount")
                .field("client_email", &key.client_email)
                .field("token_uri", &self.token_uri())
                .finish_non_exhaustive(),
        }
    }
}
