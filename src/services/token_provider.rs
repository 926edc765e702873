//! Bearer tokens for the Drive API.
//!
//! OAuth credentials use the refresh-token grant; service accounts sign an
//! RS256 assertion and use the JWT-bearer grant. Tokens are cached until a
//! minute before they expire.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::credentials::{Credentials, OAuthToken, ServiceAccountKey};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("cannot sign service account assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > Utc::now()
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Hands out access tokens for one set of credentials.
pub struct TokenProvider {
    credentials: Credentials,
    http: reqwest::Client,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(credentials: Credentials, http: reqwest::Client) -> Self {
        // A token.json written by the OAuth flow may still hold a live token.
        let seeded = match &credentials {
            Credentials::OAuth(OAuthToken {
                token: Some(value),
                expiry: Some(expires_at),
                ..
            }) => Some(CachedToken {
                value: value.clone(),
                expires_at: *expires_at,
            }),
            _ => None,
        };
        Self {
            credentials,
            http,
            cache: Mutex::new(seeded),
        }
    }

    /// Current access token, refreshing it when missing or about to expire.
    pub async fn access_token(&self) -> Result<String, TokenError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let token = self.fetch().await?;
        let value = token.value.clone();
        *cache = Some(token);
        Ok(value)
    }

    /// Drop the cached token, e.g. after the API answered 401.
    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }

    async fn fetch(&self) -> Result<CachedToken, TokenError> {
        let token_uri = self.credentials.token_uri();
        let request = match &self.credentials {
            Credentials::OAuth(token) => self.http.post(token_uri).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", token.client_id.as_str()),
                ("client_secret", token.client_secret.as_str()),
                ("refresh_token", token.refresh_token.as_str()),
            ]),
            Credentials::ServiceAccount(key) => {
                let assertion = sign_assertion(key, token_uri, Utc::now())?;
                self.http
                    .post(token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            }
        };

        debug!(kind = self.credentials.kind(), %token_uri, "requesting access token");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response.json().await?;
        let lifetime = parsed.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
        Ok(CachedToken {
            value: parsed.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
        })
    }
}

/// RS256-signed JWT asserting the service account identity.
fn sign_assertion(
    key: &ServiceAccountKey,
    audience: &str,
    now: DateTime<Utc>,
) -> Result<String, TokenError> {
    let iat = now.timestamp();
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: DRIVE_SCOPE,
        aud: audience,
        iat,
        exp: iat + ASSERTION_LIFETIME_SECS,
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
    Ok(encode(&header, &claims, &signing_key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fake_drive::{FakeDrive, TEST_PRIVATE_KEY, oauth_credentials};
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};

    fn service_account(token_uri: String) -> Credentials {
        Credentials::ServiceAccount(ServiceAccountKey {
            client_email: "relay@project.iam.gserviceaccount.com".into(),
            private_key: TEST_PRIVATE_KEY.into(),
            private_key_id: Some("kid-1".into()),
            token_uri: Some(token_uri),
        })
    }

    #[test]
    fn assertion_carries_identity_and_scope() {
        let key = match service_account("https://oauth2.example/token".into()) {
            Credentials::ServiceAccount(key) => key,
            Credentials::OAuth(_) => unreachable!(),
        };
        let now = Utc::now();
        let jwt = sign_assertion(&key, "https://oauth2.example/token", now).unwrap();

        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["kid"], "kid-1");

        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["iss"], "relay@project.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], DRIVE_SCOPE);
        assert_eq!(claims["aud"], "https://oauth2.example/token");
        assert_eq!(claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(), 3600);
    }

    #[test]
    fn bad_private_key_is_a_signing_error() {
        let key = ServiceAccountKey {
            client_email: "x@y".into(),
            private_key: "not a pem".into(),
            private_key_id: None,
            token_uri: None,
        };
        assert!(matches!(
            sign_assertion(&key, "aud", Utc::now()),
            Err(TokenError::Signing(_))
        ));
    }

    #[tokio::test]
    async fn oauth_token_is_refreshed_once_and_cached() {
        let drive = FakeDrive::start().await;
        let provider = TokenProvider::new(oauth_credentials(&drive.base), reqwest::Client::new());

        let first = provider.access_token().await.unwrap();
        let second = provider.access_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(drive.token_requests(), 1);
        assert_eq!(drive.last_grant_type().as_deref(), Some("refresh_token"));

        provider.invalidate().await;
        let third = provider.access_token().await.unwrap();
        assert_ne!(first, third);
        assert_eq!(drive.token_requests(), 2);
    }

    #[tokio::test]
    async fn live_cached_oauth_token_skips_refresh() {
        let drive = FakeDrive::start().await;
        let mut credentials = oauth_credentials(&drive.base);
        if let Credentials::OAuth(token) = &mut credentials {
            token.token = Some("ya29.still-valid".into());
            token.expiry = Some(Utc::now() + Duration::minutes(30));
        }
        let provider = TokenProvider::new(credentials, reqwest::Client::new());

        assert_eq!(provider.access_token().await.unwrap(), "ya29.still-valid");
        assert_eq!(drive.token_requests(), 0);
    }

    #[tokio::test]
    async fn service_account_uses_jwt_bearer_grant() {
        let drive = FakeDrive::start().await;
        let provider = TokenProvider::new(
            service_account(format!("{}/token", drive.base)),
            reqwest::Client::new(),
        );

        provider.access_token().await.unwrap();
        assert_eq!(drive.last_grant_type().as_deref(), Some(JWT_BEARER_GRANT));
    }

    #[tokio::test]
    async fn rejected_refresh_is_reported() {
        let drive = FakeDrive::start().await;
        drive.reject_tokens();
        let provider = TokenProvider::new(oauth_credentials(&drive.base), reqwest::Client::new());

        match provider.access_token().await {
            Err(TokenError::Rejected { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
