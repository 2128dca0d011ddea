use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use racetime_core::ids::UserId;
use racetime_core::UserInfo;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, ts};

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create(&self, name: &str, is_staff: bool) -> Result<UserInfo, StoreError> {
        let user = UserInfo {
            id: UserId::new(),
            name: name.to_string(),
            is_staff,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, is_staff, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user.id.as_str(), user.name, user.is_staff, ts(Utc::now())],
            )?;
            Ok(user)
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserInfo, StoreError> {
        self.db
            .with_conn(|conn| find_user(conn, id))?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    /// Look up a user by id, `None` if unknown.
    pub fn find(&self, id: &UserId) -> Result<Option<UserInfo>, StoreError> {
        self.db.with_conn(|conn| find_user(conn, id))
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<UserInfo>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, is_staff FROM users WHERE name = ?1",
                [name],
                |row| Ok(row_to_user(row)),
            )
            .optional()?
            .transpose()
        })
    }
}

pub(crate) fn find_user(conn: &Connection, id: &UserId) -> Result<Option<UserInfo>, StoreError> {
    conn.query_row(
        "SELECT id, name, is_staff FROM users WHERE id = ?1",
        [id.as_str()],
        |row| Ok(row_to_user(row)),
    )
    .optional()?
    .transpose()
}

/// Map `id, name, is_staff` starting at column 0.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserInfo, StoreError> {
    user_at(row, 0, "users")
}

/// Map `id, name, is_staff` starting at column `at`.
pub(crate) fn user_at(
    row: &rusqlite::Row<'_>,
    at: usize,
    table: &'static str,
) -> Result<UserInfo, StoreError> {
    let id: String = row_helpers::get(row, at, table, "user_id")?;
    Ok(UserInfo {
        id: UserId::from_raw(id),
        name: row_helpers::get(row, at + 1, table, "name")?,
        is_staff: row_helpers::get(row, at + 2, table, "is_staff")?,
    })
}
