use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use racetime_core::ids::{CategorySlug, UserId};
use racetime_core::views::SortOrder;
use racetime_core::CategoryInfo;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, ts};

const CURRENT_STATES: &str = "('open', 'invitational', 'pending', 'in_progress')";

/// A category plus how many races it is running right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryListing {
    pub category: CategoryInfo,
    pub current_races: usize,
}

pub struct CategoryRepo {
    db: Database,
}

impl CategoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, category), fields(category = %category.slug))]
    pub fn create(&self, category: &CategoryInfo) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO categories (slug, name, short_name, info, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    category.slug.as_str(),
                    category.name,
                    category.short_name,
                    category.info,
                    category.active,
                    ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(category = %slug))]
    pub fn get(&self, slug: &CategorySlug) -> Result<CategoryInfo, StoreError> {
        self.db
            .with_conn(|conn| find_category(conn, slug))?
            .ok_or_else(|| StoreError::NotFound(format!("category {slug}")))
    }

    /// Active categories in the order the home page shows them.
    #[instrument(skip(self))]
    pub fn list(&self, sort: SortOrder) -> Result<Vec<CategoryListing>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {LISTING_COLUMNS} FROM categories c
                 WHERE c.active = 1
                 ORDER BY {}",
                order_clause(sort)
            );
            collect_listings(conn, &sql, rusqlite::params![])
        })
    }

    /// The user's favourite categories, same ordering as [`list`](Self::list).
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn favourites(
        &self,
        user: &UserId,
        sort: SortOrder,
    ) -> Result<Vec<CategoryListing>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {LISTING_COLUMNS} FROM categories c
                 JOIN favourites f ON f.category_slug = c.slug
                 WHERE c.active = 1 AND f.user_id = ?1
                 ORDER BY {}",
                order_clause(sort)
            );
            collect_listings(conn, &sql, [user.as_str()])
        })
    }

    pub fn add_favourite(&self, user: &UserId, slug: &CategorySlug) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO favourites (user_id, category_slug) VALUES (?1, ?2)",
                [user.as_str(), slug.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn remove_favourite(&self, user: &UserId, slug: &CategorySlug) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM favourites WHERE user_id = ?1 AND category_slug = ?2",
                [user.as_str(), slug.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn add_moderator(&self, slug: &CategorySlug, user: &UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO category_moderators (category_slug, user_id) VALUES (?1, ?2)",
                [slug.as_str(), user.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn is_moderator(&self, slug: &CategorySlug, user: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM category_moderators WHERE category_slug = ?1 AND user_id = ?2",
                    [slug.as_str(), user.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }
}

const LISTING_COLUMNS: &str = "c.slug, c.name, c.short_name, c.info, c.active,
    (SELECT COUNT(*) FROM races r WHERE r.category_slug = c.slug
        AND r.state IN ('open', 'invitational', 'pending', 'in_progress')) AS current_races";

fn order_clause(sort: SortOrder) -> String {
    match sort {
        SortOrder::Default => "current_races DESC, c.name COLLATE NOCASE ASC".to_string(),
        SortOrder::Name => "c.name COLLATE NOCASE ASC".to_string(),
        SortOrder::Recordable => format!(
            "(SELECT COUNT(*) FROM races r WHERE r.category_slug = c.slug
                AND r.recordable = 1 AND r.recorded = 0 AND r.state NOT IN {CURRENT_STATES}) DESC,
             c.name COLLATE NOCASE ASC"
        ),
    }
}

fn collect_listings<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<CategoryListing>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let count: i64 = row_helpers::get(row, 5, "categories", "current_races")?;
        out.push(CategoryListing {
            category: row_to_category(row)?,
            current_races: count as usize,
        });
    }
    Ok(out)
}

pub(crate) fn find_category(
    conn: &Connection,
    slug: &CategorySlug,
) -> Result<Option<CategoryInfo>, StoreError> {
    conn.query_row(
        "SELECT slug, name, short_name, info, active FROM categories WHERE slug = ?1",
        [slug.as_str()],
        |row| Ok(row_to_category(row)),
    )
    .optional()?
    .transpose()
}

fn row_to_category(row: &rusqlite::Row<'_>) -> Result<CategoryInfo, StoreError> {
    let slug: String = row_helpers::get(row, 0, "categories", "slug")?;
    Ok(CategoryInfo {
        slug: row_helpers::parse_enum(&slug, "categories", "slug")?,
        name: row_helpers::get(row, 1, "categories", "name")?,
        short_name: row_helpers::get(row, 2, "categories", "short_name")?,
        info: row_helpers::get(row, 3, "categories", "info")?,
        active: row_helpers::get(row, 4, "categories", "active")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::users::UserRepo;

    pub(crate) fn category(slug: &str, name: &str) -> CategoryInfo {
        CategoryInfo {
            slug: CategorySlug::parse(slug).unwrap(),
            name: name.into(),
            short_name: slug.to_uppercase(),
            info: String::new(),
            active: true,
        }
    }

    fn seeded() -> (Database, CategoryRepo) {
        let db = Database::in_memory().unwrap();
        let repo = CategoryRepo::new(db.clone());
        repo.create(&category("smw", "Super Mario World")).unwrap();
        repo.create(&category("alttp", "A Link to the Past")).unwrap();
        repo.create(&category("ootr", "Ocarina of Time Randomizer")).unwrap();
        (db, repo)
    }

    fn add_race(db: &Database, category: &str, slug: &str, state: &str) {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO races (slug, category_slug, goal_name, state, opened_at,
                    start_delay_secs, time_limit_secs, auto_start, recordable,
                    allow_comments, allow_midrace_chat, allow_non_entrant_chat, version)
                 VALUES (?1, ?2, 'Any%', ?3, '2024-01-01T00:00:00.000000Z', 15, 86400, 1, 1, 1, 1, 1, 1)",
                [slug, category, state],
            )
            .map_err(StoreError::from)
        })
        .unwrap();
    }

    fn slugs(list: &[CategoryListing]) -> Vec<&str> {
        list.iter().map(|c| c.category.slug.as_str()).collect()
    }

    #[test]
    fn get_roundtrip() {
        let (_db, repo) = seeded();
        let slug = CategorySlug::parse("ootr").unwrap();
        assert_eq!(repo.get(&slug).unwrap().name, "Ocarina of Time Randomizer");
        let missing = CategorySlug::parse("nope").unwrap();
        assert!(matches!(repo.get(&missing), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn default_order_is_by_activity() {
        let (db, repo) = seeded();
        add_race(&db, "smw", "a-race-0001", "open");
        add_race(&db, "smw", "a-race-0002", "in_progress");
        add_race(&db, "ootr", "a-race-0003", "pending");
        add_race(&db, "ootr", "a-race-0004", "finished");

        let list = repo.list(SortOrder::Default).unwrap();
        assert_eq!(slugs(&list), vec!["smw", "ootr", "alttp"]);
        assert_eq!(list[0].current_races, 2);
        assert_eq!(list[1].current_races, 1);

        let by_name = repo.list(SortOrder::Name).unwrap();
        assert_eq!(slugs(&by_name), vec!["alttp", "ootr", "smw"]);
    }

    #[test]
    fn recordable_order() {
        let (db, repo) = seeded();
        add_race(&db, "alttp", "a-race-0001", "finished");
        let list = repo.list(SortOrder::Recordable).unwrap();
        assert_eq!(list[0].category.slug.as_str(), "alttp");
    }

    #[test]
    fn favourites_and_moderators() {
        let (db, repo) = seeded();
        let user = UserRepo::new(db).create("Link", false).unwrap();
        let ootr = CategorySlug::parse("ootr").unwrap();

        repo.add_favourite(&user.id, &ootr).unwrap();
        repo.add_favourite(&user.id, &ootr).unwrap();
        assert_eq!(slugs(&repo.favourites(&user.id, SortOrder::Name).unwrap()), vec!["ootr"]);
        repo.remove_favourite(&user.id, &ootr).unwrap();
        assert!(repo.favourites(&user.id, SortOrder::Name).unwrap().is_empty());

        assert!(!repo.is_moderator(&ootr, &user.id).unwrap());
        repo.add_moderator(&ootr, &user.id).unwrap();
        assert!(repo.is_moderator(&ootr, &user.id).unwrap());
    }
}
