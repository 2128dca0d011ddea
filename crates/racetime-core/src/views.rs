//! View models for the home, category and race pages.
//!
//! These are the contexts a page renderer consumes. They are built from
//! already-loaded domain data and never touch storage.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::race::{Race, RaceState};
use crate::user::{CategoryInfo, UserInfo};

pub const RACES_PER_PAGE: usize = 10;
pub const NO_CURRENT_RACES: &str = "No current races in this category.";
pub const NO_PAST_RACES: &str = "No completed races in this category.";

const LOGIN_OR_REGISTER_URL: &str = "/account/auth";
const HOME_URL: &str = "/";
const REQUEST_CATEGORY_URL: &str = "/request/category";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SiteInfo {
    pub title: String,
    pub meta_image: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ViewerContext {
    pub is_authenticated: bool,
    pub name: Option<String>,
    pub is_staff: bool,
}

impl ViewerContext {
    pub fn new(user: Option<&UserInfo>) -> Self {
        Self {
            is_authenticated: user.is_some(),
            name: user.map(|u| u.name.clone()),
            is_staff: user.is_some_and(|u| u.is_staff),
        }
    }
}

/// Named routes the pages link to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteUrls {
    pub login_or_register: String,
    pub home: String,
    pub request_category: String,
    pub race_spectate: Option<String>,
}

impl RouteUrls {
    fn new(race_spectate: Option<String>) -> Self {
        Self {
            login_or_register: LOGIN_OR_REGISTER_URL.to_owned(),
            home: HOME_URL.to_owned(),
            request_category: REQUEST_CATEGORY_URL.to_owned(),
            race_spectate,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Most active categories first.
    #[default]
    Default,
    Name,
    Recordable,
}

impl SortOrder {
    /// Read `?sort=`. `recordable` only counts when it is offered.
    pub fn from_query(raw: Option<&str>, show_recordable: bool) -> Self {
        match raw {
            Some("name") => Self::Name,
            Some("recordable") if show_recordable => Self::Recordable,
            _ => Self::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Name => "name",
            Self::Recordable => "recordable",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Default => "Popular",
            Self::Name => "Name",
            Self::Recordable => "Recordable races",
        }
    }

    fn url(&self) -> String {
        match self {
            Self::Default => HOME_URL.to_owned(),
            other => format!("{HOME_URL}?sort={}", other.as_str()),
        }
    }
}

/// One entry of the sort selector. The current one has no link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SortOption {
    pub value: SortOrder,
    pub label: &'static str,
    pub current: bool,
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CategorySummary {
    pub name: String,
    pub short_name: String,
    pub slug: String,
    pub info: String,
    pub url: String,
    pub current_race_count: usize,
}

impl CategorySummary {
    pub fn new(category: &CategoryInfo, current_race_count: usize) -> Self {
        Self {
            name: category.name.clone(),
            short_name: category.short_name.clone(),
            slug: category.slug.to_string(),
            info: category.info.clone(),
            url: format!("/{}", category.slug),
            current_race_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HomeView {
    pub site_info: SiteInfo,
    pub user: ViewerContext,
    pub sort: SortOrder,
    pub show_recordable: bool,
    pub sort_options: Vec<SortOption>,
    pub favourites: Vec<CategorySummary>,
    pub categories: Vec<CategorySummary>,
    pub welcome_banner: Option<String>,
    pub request_category_link: Option<String>,
    pub urls: RouteUrls,
}

impl HomeView {
    /// `categories` and `favourites` arrive already ordered by `sort`.
    pub fn build(
        site: &SiteInfo,
        viewer: Option<&UserInfo>,
        sort: SortOrder,
        show_recordable: bool,
        categories: Vec<CategorySummary>,
        favourites: Vec<CategorySummary>,
    ) -> Self {
        let mut orders = vec![SortOrder::Default, SortOrder::Name];
        if show_recordable {
            orders.push(SortOrder::Recordable);
        }
        let sort_options = orders
            .into_iter()
            .map(|order| SortOption {
                value: order,
                label: order.label(),
                current: order == sort,
                url: (order != sort).then(|| order.url()),
            })
            .collect();

        Self {
            site_info: site.clone(),
            user: ViewerContext::new(viewer),
            sort,
            show_recordable,
            sort_options,
            favourites,
            categories,
            welcome_banner: viewer.map(|u| format!("Welcome to {}, {}!", site.title, u.name)),
            request_category_link: viewer.map(|_| REQUEST_CATEGORY_URL.to_owned()),
            urls: RouteUrls::new(None),
        }
    }
}

/// The view-model fields pages use for a race.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RaceSummary {
    pub name: String,
    pub slug: String,
    pub url: String,
    pub state: RaceState,
    pub state_info: StateInfo,
    pub category: RaceCategory,
    pub goal_str: String,
    pub entrants_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub timer_str: String,
    pub is_preparing: bool,
    pub is_pending: bool,
    pub is_in_progress: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StateInfo {
    pub value: &'static str,
    pub verbose_value: &'static str,
    pub help_text: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RaceCategory {
    pub name: String,
    pub slug: String,
}

impl RaceSummary {
    pub fn new(race: &Race, now: DateTime<Utc>) -> Self {
        Self {
            name: race.name(),
            slug: race.slug.to_string(),
            url: spectate_url(race),
            state: race.state,
            state_info: StateInfo {
                value: race.state.as_str(),
                verbose_value: race.state.verbose_value(),
                help_text: race.state.help_text(),
            },
            category: RaceCategory {
                name: race.category.name.clone(),
                slug: race.category.slug.to_string(),
            },
            goal_str: race.goal_str().to_owned(),
            entrants_count: race.entrants_count(),
            started_at: race.started_at,
            timer_str: race.timer_str(now),
            is_preparing: race.is_preparing(),
            is_pending: race.is_pending(),
            is_in_progress: race.is_in_progress(),
        }
    }
}

fn spectate_url(race: &Race) -> String {
    format!("/{}/{}", race.category.slug, race.slug)
}

/// One page of a longer listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub number: usize,
    pub num_pages: usize,
    pub total: usize,
    pub previous_url: Option<String>,
    pub next_url: Option<String>,
}

impl<T> Page<T> {
    /// `items` is already the slice for page `number` (1-based).
    pub fn new(items: Vec<T>, number: usize, total: usize, base_url: &str) -> Self {
        let num_pages = page_count(total);
        let link = |n: usize| format!("{base_url}?page={n}");
        Self {
            items,
            number,
            num_pages,
            total,
            previous_url: (number > 1).then(|| link(number - 1)),
            next_url: (number < num_pages).then(|| link(number + 1)),
        }
    }
}

pub fn page_count(total: usize) -> usize {
    total.div_ceil(RACES_PER_PAGE).max(1)
}

/// Clamp a requested page into range. Missing, zero or garbage values mean
/// the first page; anything past the end means the last one.
pub fn clamp_page(requested: Option<&str>, total: usize) -> usize {
    let wanted = requested
        .and_then(|p| p.trim().parse::<usize>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(1);
    wanted.min(page_count(total))
}

pub fn page_offset(page: usize) -> usize {
    (page.saturating_sub(1)) * RACES_PER_PAGE
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CategoryView {
    pub site_info: SiteInfo,
    pub user: ViewerContext,
    pub category: CategorySummary,
    pub can_moderate: bool,
    pub current_races: Vec<RaceSummary>,
    pub current_races_placeholder: Option<&'static str>,
    pub past_races: Page<RaceSummary>,
    pub past_races_placeholder: Option<&'static str>,
    pub urls: RouteUrls,
}

impl CategoryView {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        site: &SiteInfo,
        viewer: Option<&UserInfo>,
        category: &CategoryInfo,
        can_moderate: bool,
        current: &[Race],
        past: &[Race],
        page: usize,
        past_total: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let summary = CategorySummary::new(category, current.len());
        let current_races: Vec<RaceSummary> =
            current.iter().map(|r| RaceSummary::new(r, now)).collect();
        let past_items: Vec<RaceSummary> = past.iter().map(|r| RaceSummary::new(r, now)).collect();

        Self {
            site_info: site.clone(),
            user: ViewerContext::new(viewer),
            current_races_placeholder: current_races.is_empty().then_some(NO_CURRENT_RACES),
            past_races_placeholder: past_items.is_empty().then_some(NO_PAST_RACES),
            past_races: Page::new(past_items, page, past_total, &summary.url),
            current_races,
            category: summary,
            can_moderate,
            urls: RouteUrls::new(None),
        }
    }
}

/// Values handed to the race page's client script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JsVars {
    pub race_slug: String,
    pub data_url: String,
    pub websocket_url: String,
    pub websocket_oauth_url: String,
    pub user: Option<String>,
    pub can_moderate: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RaceView {
    pub site_info: SiteInfo,
    pub user: ViewerContext,
    pub race: RaceSummary,
    pub meta_description: String,
    pub meta_image: Option<String>,
    pub js_vars: JsVars,
    pub can_moderate: bool,
    pub urls: RouteUrls,
}

impl RaceView {
    pub fn build(
        site: &SiteInfo,
        viewer: Option<&UserInfo>,
        race: &Race,
        can_moderate: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let can_moderate = can_moderate || viewer.is_some_and(|u| race.is_monitor(u));
        let summary = RaceSummary::new(race, now);
        Self {
            site_info: site.clone(),
            user: ViewerContext::new(viewer),
            meta_description: meta_description(&summary),
            meta_image: site.meta_image.clone(),
            js_vars: JsVars {
                race_slug: race.slug.to_string(),
                data_url: format!("{}/data", summary.url),
                websocket_url: format!("/ws/race/{}", race.slug),
                websocket_oauth_url: format!("/ws/o/race/{}", race.slug),
                user: viewer.map(|u| u.id.to_string()),
                can_moderate,
            },
            urls: RouteUrls::new(Some(summary.url.clone())),
            race: summary,
            can_moderate,
        }
    }
}

/// Page description for a race, chosen by its lifecycle stage.
pub fn meta_description(race: &RaceSummary) -> String {
    let category = &race.category.name;
    let goal = &race.goal_str;
    if race.is_preparing {
        format!("A {category} race is open for entry. Goal: {goal}. Join in or watch the entrants get ready.")
    } else if race.is_pending {
        format!("A {category} race is about to begin! Goal: {goal}.")
    } else if race.is_in_progress {
        format!(
            "A {category} race is in progress with {} entrants. Goal: {goal}. Watch it live!",
            race.entrants_count
        )
    } else if race.state == RaceState::Finished {
        format!(
            "A {category} race with {} entrants, finished in {}. Goal: {goal}.",
            race.entrants_count, race.timer_str
        )
    } else {
        format!("This {category} race was cancelled.")
    }
}
