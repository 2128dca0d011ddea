//! # racetime
//!
//! Race room server binary. `serve` (the default) runs the HTTP and
//! WebSocket server; the other subcommands seed and administer the
//! database it serves from.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use tracing::Level;

use racetime_core::ids::CategorySlug;
use racetime_core::views::SiteInfo;
use racetime_core::{ActionScope, CategoryInfo, Goal};
use racetime_server::ServerConfig;
use racetime_store::{CategoryRepo, Database, TokenRepo, UserRepo};
use racetime_telemetry::{data_dir, init_telemetry, LogQuery, SqliteLogSink, TelemetryConfig};

/// Race room server.
#[derive(Parser, Debug)]
#[command(name = "racetime", about = "Race room server")]
struct Cli {
    /// Host to bind.
    #[arg(long, env = "RACETIME_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "RACETIME_PORT", default_value = "8000")]
    port: u16,

    /// Path to the `SQLite` database.
    #[arg(long, env = "RACETIME_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Default log level. `RUST_LOG` takes precedence.
    #[arg(long, env = "RACETIME_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Site title shown on every page.
    #[arg(long, env = "RACETIME_SITE_TITLE", default_value = "racetime")]
    site_title: String,

    /// Do not persist warnings and errors to the log database.
    #[arg(long)]
    no_log_db: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Create a user.
    CreateUser {
        name: String,
        #[arg(long)]
        staff: bool,
    },
    /// Create a category.
    CreateCategory {
        slug: String,
        name: String,
        short_name: String,
        #[arg(long, default_value = "")]
        info: String,
    },
    /// Make a user a moderator of a category.
    AddModerator { category: String, user: String },
    /// Pin a category to the top of a user's home page.
    AddFavourite { user: String, category: String },
    /// Unpin a favourite category.
    RemoveFavourite { user: String, category: String },
    /// Issue an OAuth token for a user and print it.
    IssueToken {
        user: String,
        #[arg(long, default_value = "cli")]
        client: String,
        /// Scopes to grant: chat_message, race_action.
        #[arg(long, value_delimiter = ',', default_value = "chat_message,race_action")]
        scopes: Vec<String>,
        #[arg(long, default_value = "24")]
        ttl_hours: i64,
    },
    /// Revoke a previously issued token.
    RevokeToken { token: String },
    /// Open a race in a category.
    OpenRace {
        category: String,
        goal: String,
        /// The goal is not one of the category's standard goals.
        #[arg(long)]
        custom: bool,
        /// Name of the opening user.
        #[arg(long)]
        opened_by: Option<String>,
    },
    /// Print persisted warnings and errors as JSON lines, newest first.
    Logs(LogsArgs),
}

#[derive(clap::Args, Debug)]
struct LogsArgs {
    /// Race slug.
    #[arg(long)]
    race: Option<String>,
    /// User id.
    #[arg(long)]
    user: Option<String>,
    /// Module path fragment, e.g. `racetime_server::client`.
    #[arg(long)]
    target: Option<String>,
    /// Least severe level to show.
    #[arg(long, default_value = "warn")]
    level: Level,
    #[arg(long, default_value = "50")]
    limit: u32,
}

impl LogsArgs {
    fn query(self) -> LogQuery {
        LogQuery {
            min_level: self.level,
            target: self.target,
            race: self.race,
            user_id: self.user,
            since: None,
            limit: self.limit,
        }
    }
}

impl Cli {
    fn default_db_path() -> PathBuf {
        data_dir().join("racetime.db")
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn find_user(db: &Database, name: &str) -> Result<racetime_core::UserInfo> {
    UserRepo::new(db.clone())
        .find_by_name(name)?
        .with_context(|| format!("No such user: {name}"))
}

fn category_slug(raw: &str) -> Result<CategorySlug> {
    CategorySlug::parse(raw).with_context(|| format!("Invalid category slug: {raw}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        log_level: cli.log_level,
        log_to_sqlite: !cli.no_log_db,
        ..TelemetryConfig::default()
    };
    if telemetry.log_to_sqlite {
        ensure_parent_dir(&telemetry.log_db_path)?;
    }
    let log_db_path = telemetry.log_db_path.clone();
    let _telemetry = init_telemetry(telemetry);

    if let Some(Command::Logs(args)) = cli.command {
        return show_logs(&log_db_path, args.query());
    }

    let db_path = cli.db_path.clone().unwrap_or_else(Cli::default_db_path);
    ensure_parent_dir(&db_path)?;
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    match cli.command {
        None | Some(Command::Serve) => {
            let config = ServerConfig {
                host: cli.host,
                port: cli.port,
                site: SiteInfo {
                    title: cli.site_title,
                    meta_image: None,
                },
                ..ServerConfig::default()
            };
            serve(config, db).await
        }
        Some(command) => {
            if let Some(output) = run(command, db).await? {
                println!("{output}");
            }
            Ok(())
        }
    }
}

/// Run an administrative subcommand. Returns what to print, if anything.
async fn run(command: Command, db: Database) -> Result<Option<String>> {
    match command {
        Command::Serve | Command::Logs(_) => bail!("not an administrative command"),
        Command::CreateUser { name, staff } => {
            let user = UserRepo::new(db).create(&name, staff)?;
            Ok(Some(user.id.to_string()))
        }
        Command::CreateCategory {
            slug,
            name,
            short_name,
            info,
        } => {
            CategoryRepo::new(db).create(&CategoryInfo {
                slug: category_slug(&slug)?,
                name,
                short_name,
                info,
                active: true,
            })?;
            Ok(Some(slug))
        }
        Command::AddModerator { category, user } => {
            let user = find_user(&db, &user)?;
            CategoryRepo::new(db).add_moderator(&category_slug(&category)?, &user.id)?;
            Ok(None)
        }
        Command::AddFavourite { user, category } => {
            let user = find_user(&db, &user)?;
            let categories = CategoryRepo::new(db);
            let slug = category_slug(&category)?;
            categories
                .get(&slug)
                .with_context(|| format!("No such category: {slug}"))?;
            categories.add_favourite(&user.id, &slug)?;
            Ok(None)
        }
        Command::RemoveFavourite { user, category } => {
            let user = find_user(&db, &user)?;
            CategoryRepo::new(db).remove_favourite(&user.id, &category_slug(&category)?)?;
            Ok(None)
        }
        Command::IssueToken {
            user,
            client,
            scopes,
            ttl_hours,
        } => {
            let known = [ActionScope::ChatMessage, ActionScope::RaceAction];
            for scope in &scopes {
                if !known.iter().any(|k| k.as_str() == scope) {
                    bail!("Unknown scope: {scope}");
                }
            }
            let user = find_user(&db, &user)?;
            let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
            let token = TokenRepo::new(db).issue(
                &user.id,
                &client,
                &scopes,
                chrono::Duration::hours(ttl_hours),
            )?;
            Ok(Some(token.expose_secret().to_owned()))
        }
        Command::RevokeToken { token } => {
            if !TokenRepo::new(db).revoke(&SecretString::from(token))? {
                bail!("Token not found or already revoked");
            }
            Ok(None)
        }
        Command::OpenRace {
            category,
            goal,
            custom,
            opened_by,
        } => {
            let opened_by = opened_by.map(|name| find_user(&db, &name)).transpose()?;
            let service = racetime_server::RaceService::new(db, 16);
            let race = service
                .open_race(
                    &category_slug(&category)?,
                    Goal { name: goal, custom },
                    opened_by,
                )
                .await?;
            Ok(Some(race.name()))
        }
    }
}

fn show_logs(path: &Path, query: LogQuery) -> Result<()> {
    if !path.exists() {
        bail!("No log database at {}", path.display());
    }
    let sink = SqliteLogSink::open(path)
        .with_context(|| format!("Failed to open log database: {}", path.display()))?;
    for record in sink.search(&query)? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

async fn serve(config: ServerConfig, db: Database) -> Result<()> {
    let handle = racetime_server::start(config, db)
        .await
        .context("Failed to start server")?;
    tracing::info!(addr = %handle.addr, "racetime ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}
