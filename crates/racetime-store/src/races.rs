use chrono::Duration;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};

use racetime_core::chat::ChatMessage;
use racetime_core::ids::{CategorySlug, RaceSlug, UserId};
use racetime_core::{Entrant, Goal, Race};

use crate::categories::find_category;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::insert_message;
use crate::row_helpers::{self, parse_time, parse_time_opt, ts};
use crate::users::{find_user, user_at};

const RACE_COLUMNS: &str = "slug, category_slug, goal_name, goal_custom, info, state, opened_by,
    opened_at, start_delay_secs, started_at, ended_at, cancelled_at, time_limit_secs,
    auto_start, recordable, recorded, allow_comments, allow_midrace_chat,
    allow_non_entrant_chat, version";

/// A race saved together with the chat messages its change produced.
#[derive(Clone, Debug)]
pub struct Committed {
    pub race: Race,
    pub messages: Vec<ChatMessage>,
}

pub struct RaceRepo {
    db: Database,
}

impl RaceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new race with its entrants and monitors.
    #[instrument(skip(self, race), fields(race = %race.slug))]
    pub fn create(&self, race: &Race) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                &format!("INSERT INTO races ({RACE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"),
                rusqlite::params![
                    race.slug.as_str(),
                    race.category.slug.as_str(),
                    race.goal.name,
                    race.goal.custom,
                    race.info,
                    race.state.as_str(),
                    race.opened_by.as_ref().map(|u| u.id.as_str()),
                    ts(race.opened_at),
                    race.start_delay.num_seconds(),
                    race.started_at.map(ts),
                    race.ended_at.map(ts),
                    race.cancelled_at.map(ts),
                    race.time_limit.num_seconds(),
                    race.auto_start,
                    race.recordable,
                    race.recorded,
                    race.allow_comments,
                    race.allow_midrace_chat,
                    race.allow_non_entrant_chat,
                    race.version,
                ],
            )?;
            write_members(&tx, race)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn find(&self, slug: &RaceSlug) -> Result<Option<Race>, StoreError> {
        self.db.with_conn(|conn| load_race(conn, slug))
    }

    /// Load, change and save a race in one transaction.
    ///
    /// `f` returns the chat messages to record alongside the change, or
    /// `None` when it left the race untouched; nothing is written then.
    /// An `Err` from `f` rolls everything back.
    #[instrument(skip(self, f), fields(race = %slug))]
    pub fn update<E, F>(&self, slug: &RaceSlug, f: F) -> Result<Option<Committed>, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Race) -> Result<Option<Vec<ChatMessage>>, E>,
    {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
            let mut race = load_race(&tx, slug)?
                .ok_or_else(|| StoreError::NotFound(format!("race {slug}")))?;

            let Some(messages) = f(&mut race)? else {
                return Ok(None);
            };

            write_race(&tx, &race)?;
            for message in &messages {
                insert_message(&tx, &race.slug, message)?;
            }
            tx.commit().map_err(StoreError::from)?;
            debug!(version = race.version, "race saved");
            Ok(Some(Committed { race, messages }))
        })
    }

    /// Races not yet finished or cancelled, newest first.
    #[instrument(skip(self), fields(category = %category))]
    pub fn list_current(&self, category: &CategorySlug) -> Result<Vec<Race>, StoreError> {
        self.db.with_conn(|conn| {
            let slugs = query_slugs(
                conn,
                "SELECT slug FROM races
                 WHERE category_slug = ?1 AND state NOT IN ('finished', 'cancelled')
                 ORDER BY opened_at DESC",
                rusqlite::params![category.as_str()],
            )?;
            load_all(conn, &slugs)
        })
    }

    /// One page of finished and cancelled races, most recently ended first.
    #[instrument(skip(self), fields(category = %category))]
    pub fn list_past(
        &self,
        category: &CategorySlug,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Race>, StoreError> {
        self.db.with_conn(|conn| {
            let slugs = query_slugs(
                conn,
                "SELECT slug FROM races
                 WHERE category_slug = ?1 AND state IN ('finished', 'cancelled')
                 ORDER BY COALESCE(ended_at, cancelled_at, opened_at) DESC
                 LIMIT ?2 OFFSET ?3",
                rusqlite::params![category.as_str(), limit as i64, offset as i64],
            )?;
            load_all(conn, &slugs)
        })
    }

    pub fn count_past(&self, category: &CategorySlug) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM races
                 WHERE category_slug = ?1 AND state IN ('finished', 'cancelled')",
                [category.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Races the clock can still move: pending or in progress.
    pub fn needing_tick(&self) -> Result<Vec<RaceSlug>, StoreError> {
        self.db.with_conn(|conn| {
            query_slugs(
                conn,
                "SELECT slug FROM races WHERE state IN ('pending', 'in_progress') ORDER BY slug",
                rusqlite::params![],
            )
        })
    }
}

fn query_slugs<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<RaceSlug>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let raw: String = row_helpers::get(row, 0, "races", "slug")?;
        out.push(row_helpers::parse_enum(&raw, "races", "slug")?);
    }
    Ok(out)
}

fn load_all(conn: &Connection, slugs: &[RaceSlug]) -> Result<Vec<Race>, StoreError> {
    slugs
        .iter()
        .map(|slug| {
            load_race(conn, slug)?.ok_or_else(|| StoreError::NotFound(format!("race {slug}")))
        })
        .collect()
}

/// Race row fields before members are attached.
struct RaceRow {
    race: Race,
    opened_by: Option<String>,
}

pub(crate) fn load_race(conn: &Connection, slug: &RaceSlug) -> Result<Option<Race>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {RACE_COLUMNS} FROM races WHERE slug = ?1"),
            [slug.as_str()],
            |row| Ok(row_to_race(conn, row)),
        )
        .optional()?
        .transpose()?;
    let Some(RaceRow { mut race, opened_by }) = row else {
        return Ok(None);
    };

    if let Some(id) = opened_by {
        race.opened_by = find_user(conn, &UserId::from_raw(id))?;
    }
    race.entrants = load_entrants(conn, slug)?;
    race.monitors = load_monitors(conn, slug)?;
    Ok(Some(race))
}

fn row_to_race(conn: &Connection, row: &rusqlite::Row<'_>) -> Result<RaceRow, StoreError> {
    const T: &str = "races";
    let slug: String = row_helpers::get(row, 0, T, "slug")?;
    let category_slug: String = row_helpers::get(row, 1, T, "category_slug")?;
    let category_slug: CategorySlug = row_helpers::parse_enum(&category_slug, T, "category_slug")?;
    let category = find_category(conn, &category_slug)?.ok_or(StoreError::CorruptRow {
        table: T,
        column: "category_slug",
        detail: format!("unknown category {category_slug}"),
    })?;
    let state: String = row_helpers::get(row, 5, T, "state")?;
    let opened_at: String = row_helpers::get(row, 7, T, "opened_at")?;
    let start_delay: i64 = row_helpers::get(row, 8, T, "start_delay_secs")?;
    let time_limit: i64 = row_helpers::get(row, 12, T, "time_limit_secs")?;

    let race = Race {
        slug: row_helpers::parse_enum(&slug, T, "slug")?,
        category,
        goal: Goal {
            name: row_helpers::get(row, 2, T, "goal_name")?,
            custom: row_helpers::get(row, 3, T, "goal_custom")?,
        },
        info: row_helpers::get(row, 4, T, "info")?,
        state: row_helpers::parse_enum(&state, T, "state")?,
        opened_by: None,
        monitors: Vec::new(),
        opened_at: parse_time(&opened_at, T, "opened_at")?,
        start_delay: Duration::seconds(start_delay),
        started_at: parse_time_opt(row_helpers::get(row, 9, T, "started_at")?, T, "started_at")?,
        ended_at: parse_time_opt(row_helpers::get(row, 10, T, "ended_at")?, T, "ended_at")?,
        cancelled_at: parse_time_opt(
            row_helpers::get(row, 11, T, "cancelled_at")?,
            T,
            "cancelled_at",
        )?,
        time_limit: Duration::seconds(time_limit),
        auto_start: row_helpers::get(row, 13, T, "auto_start")?,
        recordable: row_helpers::get(row, 14, T, "recordable")?,
        recorded: row_helpers::get(row, 15, T, "recorded")?,
        allow_comments: row_helpers::get(row, 16, T, "allow_comments")?,
        allow_midrace_chat: row_helpers::get(row, 17, T, "allow_midrace_chat")?,
        allow_non_entrant_chat: row_helpers::get(row, 18, T, "allow_non_entrant_chat")?,
        version: row_helpers::get(row, 19, T, "version")?,
        entrants: Vec::new(),
    };
    Ok(RaceRow {
        race,
        opened_by: row_helpers::get(row, 6, T, "opened_by")?,
    })
}

fn load_entrants(conn: &Connection, slug: &RaceSlug) -> Result<Vec<Entrant>, StoreError> {
    const T: &str = "entrants";
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.is_staff, e.state, e.ready, e.finish_time_us, e.place,
                e.dnf, e.dq, e.comment, e.joined_at
         FROM entrants e JOIN users u ON u.id = e.user_id
         WHERE e.race_slug = ?1
         ORDER BY e.position",
    )?;
    let mut rows = stmt.query([slug.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let state: String = row_helpers::get(row, 3, T, "state")?;
        let finish_us: Option<i64> = row_helpers::get(row, 5, T, "finish_time_us")?;
        let joined_at: String = row_helpers::get(row, 10, T, "joined_at")?;
        out.push(Entrant {
            user: user_at(row, 0, T)?,
            state: row_helpers::parse_enum(&state, T, "state")?,
            ready: row_helpers::get(row, 4, T, "ready")?,
            finish_time: finish_us.map(Duration::microseconds),
            place: row_helpers::get(row, 6, T, "place")?,
            dnf: row_helpers::get(row, 7, T, "dnf")?,
            dq: row_helpers::get(row, 8, T, "dq")?,
            comment: row_helpers::get(row, 9, T, "comment")?,
            joined_at: parse_time(&joined_at, T, "joined_at")?,
        });
    }
    Ok(out)
}

fn load_monitors(
    conn: &Connection,
    slug: &RaceSlug,
) -> Result<Vec<racetime_core::UserInfo>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.is_staff
         FROM race_monitors m JOIN users u ON u.id = m.user_id
         WHERE m.race_slug = ?1
         ORDER BY m.position",
    )?;
    let mut rows = stmt.query([slug.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(user_at(row, 0, "race_monitors")?);
    }
    Ok(out)
}

fn write_race(conn: &Connection, race: &Race) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE races SET goal_name = ?2, goal_custom = ?3, info = ?4, state = ?5,
            start_delay_secs = ?6, started_at = ?7, ended_at = ?8, cancelled_at = ?9,
            time_limit_secs = ?10, auto_start = ?11, recordable = ?12, recorded = ?13,
            allow_comments = ?14, allow_midrace_chat = ?15, allow_non_entrant_chat = ?16,
            version = ?17
         WHERE slug = ?1",
        rusqlite::params![
            race.slug.as_str(),
            race.goal.name,
            race.goal.custom,
            race.info,
            race.state.as_str(),
            race.start_delay.num_seconds(),
            race.started_at.map(ts),
            race.ended_at.map(ts),
            race.cancelled_at.map(ts),
            race.time_limit.num_seconds(),
            race.auto_start,
            race.recordable,
            race.recorded,
            race.allow_comments,
            race.allow_midrace_chat,
            race.allow_non_entrant_chat,
            race.version,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("race {}", race.slug)));
    }
    conn.execute("DELETE FROM entrants WHERE race_slug = ?1", [race.slug.as_str()])?;
    conn.execute("DELETE FROM race_monitors WHERE race_slug = ?1", [race.slug.as_str()])?;
    write_members(conn, race)
}

fn write_members(conn: &Connection, race: &Race) -> Result<(), StoreError> {
    let mut insert_entrant = conn.prepare(
        "INSERT INTO entrants (race_slug, user_id, position, state, ready, finish_time_us,
            place, dnf, dq, comment, joined_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for (position, e) in race.entrants.iter().enumerate() {
        insert_entrant.execute(rusqlite::params![
            race.slug.as_str(),
            e.user.id.as_str(),
            position as i64,
            e.state.to_string(),
            e.ready,
            e.finish_time.and_then(|t| t.num_microseconds()),
            e.place,
            e.dnf,
            e.dq,
            e.comment,
            ts(e.joined_at),
        ])?;
    }

    let mut insert_monitor = conn.prepare(
        "INSERT INTO race_monitors (race_slug, user_id, position) VALUES (?1, ?2, ?3)",
    )?;
    for (position, m) in race.monitors.iter().enumerate() {
        insert_monitor.execute(rusqlite::params![
            race.slug.as_str(),
            m.id.as_str(),
            position as i64
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::tests::category;
    use crate::categories::CategoryRepo;
    use crate::messages::MessageRepo;
    use crate::users::UserRepo;
    use chrono::{TimeZone, Utc};
    use racetime_core::actions::{self, Actor, RaceAction};
    use racetime_core::{ActionError, EntrantState, RaceState, UserInfo};

    struct Fixture {
        db: Database,
        races: RaceRepo,
        host: UserInfo,
        racer: UserInfo,
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        CategoryRepo::new(db.clone())
            .create(&category("ootr", "Ocarina of Time Randomizer"))
            .unwrap();
        let users = UserRepo::new(db.clone());
        Fixture {
            races: RaceRepo::new(db.clone()),
            host: users.create("host", false).unwrap(),
            racer: users.create("racer", false).unwrap(),
            db,
        }
    }

    fn new_race(f: &Fixture, slug: &str) -> Race {
        let mut race = Race::new(
            RaceSlug::parse(slug).unwrap(),
            category("ootr", "Ocarina of Time Randomizer"),
            Goal {
                name: "Beat the game".into(),
                custom: false,
            },
            Some(f.host.clone()),
            now(),
        );
        race.entrants
            .push(Entrant::new(f.racer.clone(), EntrantState::Joined, now()));
        race.monitors.push(f.racer.clone());
        f.races.create(&race).unwrap();
        race
    }

    #[test]
    fn create_then_find() {
        let f = fixture();
        let race = new_race(&f, "neat-map-0001");
        let loaded = f.races.find(&race.slug).unwrap().unwrap();
        assert_eq!(loaded, race);
    }

    #[test]
    fn find_missing() {
        let f = fixture();
        let slug = RaceSlug::parse("ghost-race-0000").unwrap();
        assert!(f.races.find(&slug).unwrap().is_none());
    }

    #[test]
    fn update_persists_race_and_messages() {
        let f = fixture();
        let race = new_race(&f, "neat-map-0001");
        let actor = Actor::new(f.racer.clone(), false);

        let committed = f
            .races
            .update::<StoreError, _>(&race.slug, |r| {
                let out = actions::apply(r, &actor, &RaceAction::Ready, None, now())
                    .map_err(|e| StoreError::Conflict(e.to_string()))?;
                Ok(Some(
                    out.system_messages
                        .into_iter()
                        .map(|m| ChatMessage::system(m, now()))
                        .collect(),
                ))
            })
            .unwrap()
            .unwrap();

        assert_eq!(committed.race.version, 2);
        let loaded = f.races.find(&race.slug).unwrap().unwrap();
        assert!(loaded.entrants[0].ready);
        assert_eq!(loaded.version, 2);

        let history = MessageRepo::new(f.db.clone()).history(&race.slug, 100).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "racer is ready!");
    }

    #[derive(Debug)]
    enum TestError {
        Store,
        Action(ActionError),
    }

    impl From<StoreError> for TestError {
        fn from(_: StoreError) -> Self {
            TestError::Store
        }
    }

    #[test]
    fn failed_update_writes_nothing() {
        let f = fixture();
        let race = new_race(&f, "neat-map-0001");
        let actor = Actor::new(f.racer.clone(), false);

        let result = f.races.update::<TestError, _>(&race.slug, |r| {
            r.info = "changed".into();
            actions::apply(r, &actor, &RaceAction::Join, None, now()).map_err(TestError::Action)?;
            Ok(Some(Vec::new()))
        });
        assert!(matches!(result, Err(TestError::Action(_))));
        assert_eq!(f.races.find(&race.slug).unwrap().unwrap(), race);

        let untouched = f
            .races
            .update::<TestError, _>(&race.slug, |r| {
                r.info = "also ignored".into();
                Ok(None)
            })
            .unwrap();
        assert!(untouched.is_none());
        assert_eq!(f.races.find(&race.slug).unwrap().unwrap().info, "");
    }

    #[test]
    fn listings() {
        let f = fixture();
        let cat = CategorySlug::parse("ootr").unwrap();
        new_race(&f, "open-race-0001");
        let done = new_race(&f, "done-race-0002");
        new_race(&f, "done-race-0003");
        for slug in ["done-race-0002", "done-race-0003"] {
            f.races
                .update::<StoreError, _>(&RaceSlug::parse(slug).unwrap(), |r| {
                    r.state = RaceState::Cancelled;
                    r.cancelled_at = Some(now());
                    Ok(Some(Vec::new()))
                })
                .unwrap();
        }

        let current = f.races.list_current(&cat).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].slug.as_str(), "open-race-0001");

        assert_eq!(f.races.count_past(&cat).unwrap(), 2);
        let page = f.races.list_past(&cat, 1, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert!(f.races.list_past(&cat, 0, 10).unwrap().iter().any(|r| r.slug == done.slug));
    }

    #[test]
    fn needing_tick_selects_live_races() {
        let f = fixture();
        let race = new_race(&f, "live-race-0001");
        new_race(&f, "idle-race-0002");
        f.races
            .update::<StoreError, _>(&race.slug, |r| {
                r.state = RaceState::Pending;
                r.started_at = Some(now());
                Ok(Some(Vec::new()))
            })
            .unwrap();
        let slugs = f.races.needing_tick().unwrap();
        assert_eq!(slugs, vec![race.slug]);
    }
}
