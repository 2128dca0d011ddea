//! Bearer-token authorisation for socket actions and page views.
//!
//! Tokens are never stored in the clear: only their SHA-256 digest is kept
//! and compared.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::actions::ActionScope;
use crate::user::UserInfo;

/// What a stored token grants, as looked up by its digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenGrant {
    pub user: UserInfo,
    pub client: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// Result of authenticating a request. Truthy iff a user was
/// authenticated with every required scope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OAuthState {
    pub user: Option<UserInfo>,
    pub client: Option<String>,
    pub scopes: Vec<String>,
}

impl OAuthState {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Check `grant` against `required` scopes at `now`.
    pub fn validate(grant: Option<TokenGrant>, required: &[ActionScope], now: DateTime<Utc>) -> Self {
        let Some(grant) = grant else {
            return Self::anonymous();
        };
        if grant.expires_at <= now {
            return Self::anonymous();
        }
        let covered = required
            .iter()
            .all(|scope| grant.scopes.iter().any(|s| s == scope.as_str()));
        if !covered {
            return Self {
                user: None,
                client: Some(grant.client),
                scopes: grant.scopes,
            };
        }
        Self {
            user: Some(grant.user),
            client: Some(grant.client),
            scopes: grant.scopes,
        }
    }
}

/// Fresh random bearer token.
pub fn generate_token() -> SecretString {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    SecretString::from(URL_SAFE_NO_PAD.encode(bytes))
}

pub fn token_digest(token: &SecretString) -> String {
    let digest = Sha256::digest(token.expose_secret().as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<SecretString> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| SecretString::from(token.to_owned()))
}
