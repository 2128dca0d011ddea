//! Warnings and errors persisted to SQLite.
//!
//! Each row is tagged with the race, user and socket it concerns, taken
//! from the event itself or from an enclosing span, so an operator can
//! pull up everything that went wrong in one race room.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{named_params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Events at this level or more severe are written.
const PERSISTED: Level = Level::WARN;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS log_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at TEXT NOT NULL,
        severity INTEGER NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        race TEXT,
        user_id TEXT,
        client_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_log_events_race ON log_events(race, id);
    CREATE INDEX IF NOT EXISTS idx_log_events_user ON log_events(user_id, id);
";

/// 1 for errors, growing with verbosity.
fn severity(level: Level) -> i64 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        _ => 5,
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    pub race: Option<String>,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
}

impl LogRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            logged_at: row.get("logged_at")?,
            level: row.get("level")?,
            target: row.get("target")?,
            message: row.get("message")?,
            fields: row.get("fields")?,
            race: row.get("race")?,
            user_id: row.get("user_id")?,
            client_id: row.get("client_id")?,
        })
    }
}

/// Filter for [`SqliteLogSink::search`]. Unset fields match everything.
#[derive(Clone, Debug)]
pub struct LogQuery {
    /// Least severe level to include.
    pub min_level: Level,
    /// Substring of the event target, e.g. `racetime_server::client`.
    pub target: Option<String>,
    pub race: Option<String>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            min_level: PERSISTED,
            target: None,
            race: None,
            user_id: None,
            since: None,
            limit: 100,
        }
    }
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(&self, event: &CapturedEvent) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO log_events
                 (logged_at, severity, level, target, message, fields, race, user_id, client_id)
             VALUES (:logged_at, :severity, :level, :target, :message, :fields,
                     :race, :user_id, :client_id)",
        )?;
        stmt.execute(named_params! {
            ":logged_at": stamp(event.at),
            ":severity": severity(event.level),
            ":level": event.level.as_str(),
            ":target": event.target,
            ":message": event.fields.message,
            ":fields": event.fields.extra_json(),
            ":race": event.fields.tags.race,
            ":user_id": event.fields.tags.user_id,
            ":client_id": event.fields.tags.client_id,
        })?;
        Ok(())
    }

    /// Matching records, newest first.
    pub fn search(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, logged_at, level, target, message, fields, race, user_id, client_id
             FROM log_events
             WHERE severity <= :severity
               AND (:target IS NULL OR instr(target, :target) > 0)
               AND (:race IS NULL OR race = :race)
               AND (:user_id IS NULL OR user_id = :user_id)
               AND (:since IS NULL OR logged_at >= :since)
             ORDER BY id DESC
             LIMIT :limit",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":severity": severity(q.min_level),
                ":target": q.target,
                ":race": q.race,
                ":user_id": q.user_id,
                ":since": q.since.map(stamp),
                ":limit": q.limit,
            },
            LogRecord::from_row,
        )?;
        rows.collect()
    }
}

/// Fields that identify what an event is about. Spans carry them down to
/// the events recorded inside.
#[derive(Clone, Debug, Default)]
struct Tags {
    race: Option<String>,
    user_id: Option<String>,
    client_id: Option<String>,
}

impl Tags {
    fn is_empty(&self) -> bool {
        self.race.is_none() && self.user_id.is_none() && self.client_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.race.is_some() && self.user_id.is_some() && self.client_id.is_some()
    }

    /// Take any tag `self` lacks from `outer`.
    fn inherit(&mut self, outer: &Tags) {
        for (mine, theirs) in [
            (&mut self.race, &outer.race),
            (&mut self.user_id, &outer.user_id),
            (&mut self.client_id, &outer.client_id),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    tags: Tags,
    extra: serde_json::Map<String, Value>,
}

impl EventFields {
    fn keep(&mut self, name: &str, value: Value) {
        let slot = match name {
            "race" => &mut self.tags.race,
            "user_id" => &mut self.tags.user_id,
            "client_id" => &mut self.tags.client_id,
            "message" => {
                self.message = as_text(value);
                return;
            }
            _ => {
                self.extra.insert(name.to_owned(), value);
                return;
            }
        };
        *slot = Some(as_text(value));
    }

    fn extra_json(&self) -> Option<String> {
        if self.extra.is_empty() {
            None
        } else {
            serde_json::to_string(&self.extra).ok()
        }
    }
}

fn as_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.keep(field.name(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.keep(field.name(), Value::String(value.to_owned()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.keep(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.keep(field.name(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.keep(field.name(), value.into());
    }
}

struct CapturedEvent {
    at: DateTime<Utc>,
    level: Level,
    target: String,
    fields: EventFields,
}

/// Layer feeding warn and error events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.tags.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.tags);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > PERSISTED {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if fields.tags.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Tags>() {
                    fields.tags.inherit(outer);
                }
            }
        }

        let captured = CapturedEvent {
            at: Utc::now(),
            level: *meta.level(),
            target: meta.target().to_owned(),
            fields,
        };
        if let Err(e) = self.sink.write(&captured) {
            // Logging through tracing here would recurse into this layer.
            eprintln!("racetime-telemetry: failed to persist log event: {e}");
        }
    }
}
