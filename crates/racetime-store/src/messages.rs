use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::instrument;

use racetime_core::chat::ChatMessage;
use racetime_core::ids::{MessageId, RaceSlug, UserId};
use racetime_core::UserInfo;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, parse_time, ts};

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The newest `limit` messages of a race, oldest first.
    #[instrument(skip(self), fields(race = %race))]
    pub fn history(&self, race: &RaceSlug, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.posted_at, m.message, m.is_system, m.guid,
                        u.id, u.name, u.is_staff
                 FROM messages m LEFT JOIN users u ON u.id = m.user_id
                 WHERE m.race_slug = ?1
                 ORDER BY m.posted_at DESC, m.id DESC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![race.as_str(), limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_message(row)?);
            }
            out.reverse();
            Ok(out)
        })
    }

    /// Record a user's message after `check` accepts how many they already
    /// posted in `race` since `since`. Counting and inserting share one
    /// transaction; an `Err` from `check` writes nothing.
    #[instrument(skip(self, message, check), fields(race = %race, message_id = %message.id))]
    pub fn insert_rate_limited<E, F>(
        &self,
        race: &RaceSlug,
        message: &ChatMessage,
        since: DateTime<Utc>,
        check: F,
    ) -> Result<(), E>
    where
        E: From<StoreError>,
        F: FnOnce(usize) -> Result<(), E>,
    {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
            let recent = match &message.user {
                Some(user) => count_since(&tx, race, &user.id, since)?,
                None => 0,
            };
            check(recent)?;
            insert_message(&tx, race, message)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(())
        })
    }
}

/// Messages `user` posted in `race` at or after `since`.
fn count_since(
    conn: &Connection,
    race: &RaceSlug,
    user: &UserId,
    since: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE race_slug = ?1 AND user_id = ?2 AND posted_at >= ?3",
        [race.as_str(), user.as_str(), ts(since).as_str()],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

pub(crate) fn insert_message(
    conn: &Connection,
    race: &RaceSlug,
    message: &ChatMessage,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO messages (id, race_slug, user_id, posted_at, message, is_system, guid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            message.id.as_str(),
            race.as_str(),
            message.user.as_ref().map(|u| u.id.as_str()),
            ts(message.posted_at),
            message.message,
            message.is_system,
            message.guid,
        ],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    const T: &str = "messages";
    let id: String = row_helpers::get(row, 0, T, "id")?;
    let posted_at: String = row_helpers::get(row, 1, T, "posted_at")?;
    let user_id: Option<String> = row_helpers::get(row, 5, T, "user_id")?;
    let user = match user_id {
        Some(id) => Some(UserInfo {
            id: UserId::from_raw(id),
            name: row_helpers::get(row, 6, T, "name")?,
            is_staff: row_helpers::get(row, 7, T, "is_staff")?,
        }),
        None => None,
    };
    Ok(ChatMessage {
        id: MessageId::from_raw(id),
        user,
        posted_at: parse_time(&posted_at, T, "posted_at")?,
        message: row_helpers::get(row, 2, T, "message")?,
        is_system: row_helpers::get(row, 3, T, "is_system")?,
        guid: row_helpers::get(row, 4, T, "guid")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::tests::category;
    use crate::categories::CategoryRepo;
    use crate::races::RaceRepo;
    use crate::users::UserRepo;
    use chrono::{Duration, TimeZone};
    use racetime_core::chat::ChatPost;
    use racetime_core::{Goal, Race};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (MessageRepo, RaceSlug, UserInfo) {
        let db = Database::in_memory().unwrap();
        let cat = category("ootr", "Ocarina of Time Randomizer");
        CategoryRepo::new(db.clone()).create(&cat).unwrap();
        let user = UserRepo::new(db.clone()).create("Link", false).unwrap();
        let race = Race::new(
            RaceSlug::parse("chat-race-0001").unwrap(),
            cat,
            Goal {
                name: "Any%".into(),
                custom: true,
            },
            None,
            t0(),
        );
        RaceRepo::new(db.clone()).create(&race).unwrap();
        (MessageRepo::new(db), race.slug, user)
    }

    fn put(repo: &MessageRepo, race: &RaceSlug, message: &ChatMessage) {
        repo.db
            .with_conn(|conn| insert_message(conn, race, message))
            .unwrap();
    }

    fn say(user: &UserInfo, text: &str, at: DateTime<Utc>) -> ChatMessage {
        ChatMessage::from_user(
            user.clone(),
            ChatPost {
                message: text.into(),
                guid: None,
            },
            at,
        )
    }

    #[test]
    fn history_is_newest_window_oldest_first() {
        let (repo, race, user) = setup();
        for i in 0..5 {
            put(&repo, &race, &say(&user, &format!("msg {i}"), t0() + Duration::seconds(i)));
        }
        put(&repo, &race, &ChatMessage::system("a joins.", t0() + Duration::seconds(10)));

        let all = repo.history(&race, 100).unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].message, "msg 0");
        assert!(all[5].is_system);
        assert!(all[5].user.is_none());
        assert_eq!(all[0].user.as_ref().unwrap().name, "Link");

        let recent = repo.history(&race, 2).unwrap();
        let texts: Vec<&str> = recent.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["msg 4", "a joins."]);
    }

    #[test]
    fn rate_window_counts_only_recent_user_messages() {
        let (repo, race, user) = setup();
        put(&repo, &race, &say(&user, "old", t0() - Duration::seconds(120)));
        put(&repo, &race, &say(&user, "new", t0() - Duration::seconds(10)));
        put(&repo, &race, &ChatMessage::system("sys", t0()));

        let mut seen = None;
        repo.insert_rate_limited::<StoreError, _>(
            &race,
            &say(&user, "hi", t0()),
            t0() - Duration::seconds(60),
            |recent| {
                seen = Some(recent);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(seen, Some(1));
        assert_eq!(repo.history(&race, 100).unwrap().len(), 4);
    }

    #[test]
    fn rejected_post_writes_nothing() {
        let (repo, race, user) = setup();
        put(&repo, &race, &say(&user, "first", t0()));

        let result = repo.insert_rate_limited(
            &race,
            &say(&user, "second", t0()),
            t0() - Duration::seconds(60),
            |recent| {
                if recent >= 1 {
                    Err(StoreError::Conflict("slow down".into()))
                } else {
                    Ok(())
                }
            },
        );
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        let texts: Vec<String> = repo
            .history(&race, 100)
            .unwrap()
            .into_iter()
            .map(|m| m.message)
            .collect();
        assert_eq!(texts, vec!["first"]);
    }
}
