use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use secrecy::SecretString;
use tracing::{info, instrument};

use racetime_core::auth::{generate_token, token_digest, TokenGrant};
use racetime_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, parse_time, ts};
use crate::users::user_at;

/// OAuth bearer tokens, keyed by digest.
pub struct TokenRepo {
    db: Database,
}

impl TokenRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Mint a token. The clear value is returned once and never stored.
    #[instrument(skip(self, scopes), fields(user_id = %user))]
    pub fn issue(
        &self,
        user: &UserId,
        client: &str,
        scopes: &[&str],
        ttl: Duration,
    ) -> Result<SecretString, StoreError> {
        let token = generate_token();
        let now = Utc::now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO oauth_tokens (digest, user_id, client, scopes, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    token_digest(&token),
                    user.as_str(),
                    client,
                    scopes.join(" "),
                    ts(now + ttl),
                    ts(now),
                ],
            )?;
            Ok::<(), StoreError>(())
        })?;
        info!(client, "token issued");
        Ok(token)
    }

    /// The grant behind a token, if it exists and was not revoked. Expiry
    /// is left to the caller, who knows the clock.
    pub fn lookup(&self, token: &SecretString) -> Result<Option<TokenGrant>, StoreError> {
        let digest = token_digest(token);
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT u.id, u.name, u.is_staff, t.client, t.scopes, t.expires_at
                 FROM oauth_tokens t JOIN users u ON u.id = t.user_id
                 WHERE t.digest = ?1 AND t.revoked = 0",
                [digest.as_str()],
                |row| Ok(row_to_grant(row)),
            )
            .optional()?
            .transpose()
        })
    }

    pub fn revoke(&self, token: &SecretString) -> Result<bool, StoreError> {
        let digest = token_digest(token);
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE oauth_tokens SET revoked = 1 WHERE digest = ?1 AND revoked = 0",
                [digest.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Drop tokens that expired before `now`. Returns how many went.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM oauth_tokens WHERE expires_at < ?1",
                [ts(now)],
            )?;
            Ok(n)
        })
    }
}

fn row_to_grant(row: &rusqlite::Row<'_>) -> Result<TokenGrant, StoreError> {
    const T: &str = "oauth_tokens";
    let scopes: String = row_helpers::get(row, 4, T, "scopes")?;
    let expires_at: String = row_helpers::get(row, 5, T, "expires_at")?;
    Ok(TokenGrant {
        user: user_at(row, 0, T)?,
        client: row_helpers::get(row, 3, T, "client")?,
        scopes: scopes.split_whitespace().map(str::to_owned).collect(),
        expires_at: parse_time(&expires_at, T, "expires_at")?,
    })
}
