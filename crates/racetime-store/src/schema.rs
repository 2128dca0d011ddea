/// SQL DDL for the race database.
/// Timestamps are RFC 3339 UTC text with microseconds, so they sort as text.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    is_staff INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
    slug TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    short_name TEXT NOT NULL,
    info TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS category_moderators (
    category_slug TEXT NOT NULL REFERENCES categories(slug),
    user_id TEXT NOT NULL REFERENCES users(id),
    PRIMARY KEY (category_slug, user_id)
);

CREATE TABLE IF NOT EXISTS favourites (
    user_id TEXT NOT NULL REFERENCES users(id),
    category_slug TEXT NOT NULL REFERENCES categories(slug),
    PRIMARY KEY (user_id, category_slug)
);

CREATE TABLE IF NOT EXISTS races (
    slug TEXT PRIMARY KEY,
    category_slug TEXT NOT NULL REFERENCES categories(slug),
    goal_name TEXT NOT NULL,
    goal_custom INTEGER NOT NULL DEFAULT 0,
    info TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL,
    opened_by TEXT REFERENCES users(id),
    opened_at TEXT NOT NULL,
    start_delay_secs INTEGER NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    cancelled_at TEXT,
    time_limit_secs INTEGER NOT NULL,
    auto_start INTEGER NOT NULL,
    recordable INTEGER NOT NULL,
    recorded INTEGER NOT NULL DEFAULT 0,
    allow_comments INTEGER NOT NULL,
    allow_midrace_chat INTEGER NOT NULL,
    allow_non_entrant_chat INTEGER NOT NULL,
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS entrants (
    race_slug TEXT NOT NULL REFERENCES races(slug),
    user_id TEXT NOT NULL REFERENCES users(id),
    position INTEGER NOT NULL,
    state TEXT NOT NULL,
    ready INTEGER NOT NULL DEFAULT 0,
    finish_time_us INTEGER,
    place INTEGER,
    dnf INTEGER NOT NULL DEFAULT 0,
    dq INTEGER NOT NULL DEFAULT 0,
    comment TEXT,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (race_slug, user_id)
);

CREATE TABLE IF NOT EXISTS race_monitors (
    race_slug TEXT NOT NULL REFERENCES races(slug),
    user_id TEXT NOT NULL REFERENCES users(id),
    position INTEGER NOT NULL,
    PRIMARY KEY (race_slug, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    race_slug TEXT NOT NULL REFERENCES races(slug),
    user_id TEXT REFERENCES users(id),
    posted_at TEXT NOT NULL,
    message TEXT NOT NULL,
    is_system INTEGER NOT NULL,
    guid TEXT
);

CREATE TABLE IF NOT EXISTS oauth_tokens (
    digest TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    client TEXT NOT NULL,
    scopes TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_races_category_state ON races(category_slug, state);
CREATE INDEX IF NOT EXISTS idx_races_state ON races(state);
CREATE INDEX IF NOT EXISTS idx_messages_race_posted ON messages(race_slug, posted_at);
CREATE INDEX IF NOT EXISTS idx_messages_user_posted ON messages(race_slug, user_id, posted_at);
CREATE INDEX IF NOT EXISTS idx_tokens_user ON oauth_tokens(user_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
