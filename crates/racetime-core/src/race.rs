use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RaceSlug, UserId};
use crate::user::{CategoryInfo, UserInfo};

pub const DEFAULT_START_DELAY_SECS: i64 = 15;
pub const DEFAULT_TIME_LIMIT_HOURS: i64 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceState {
    Open,
    Invitational,
    Pending,
    InProgress,
    Finished,
    Cancelled,
}

impl RaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Invitational => "invitational",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn verbose_value(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Invitational => "Invitational",
            Self::Pending => "Starting",
            Self::InProgress => "In progress",
            Self::Finished => "Finished",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn help_text(&self) -> &'static str {
        match self {
            Self::Open => "Anyone may join this race",
            Self::Invitational => "Only invited users may join this race",
            Self::Pending => "Waiting for the race to start",
            Self::InProgress => "Race is in progress",
            Self::Finished => "This race has been completed",
            Self::Cancelled => "This race has been cancelled",
        }
    }

    pub fn is_preparing(&self) -> bool {
        matches!(self, Self::Open | Self::Invitational)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

impl std::fmt::Display for RaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RaceState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "invitational" => Ok(Self::Invitational),
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown race state: {other}")),
        }
    }
}

/// How a user relates to a race, before any racing happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrantState {
    Requested,
    Invited,
    Declined,
    Joined,
}

impl std::fmt::Display for EntrantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Invited => write!(f, "invited"),
            Self::Declined => write!(f, "declined"),
            Self::Joined => write!(f, "joined"),
        }
    }
}

impl std::str::FromStr for EntrantState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "invited" => Ok(Self::Invited),
            "declined" => Ok(Self::Declined),
            "joined" => Ok(Self::Joined),
            other => Err(format!("unknown entrant state: {other}")),
        }
    }
}

/// Status shown to spectators, derived from the entrant's fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrantStatus {
    Requested,
    Invited,
    Declined,
    NotReady,
    Ready,
    InProgress,
    Done,
    Dnf,
    Dq,
}

impl EntrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Invited => "invited",
            Self::Declined => "declined",
            Self::NotReady => "not_ready",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Dnf => "dnf",
            Self::Dq => "dq",
        }
    }

    pub fn verbose_value(&self) -> &'static str {
        match self {
            Self::Requested => "Requested to join",
            Self::Invited => "Invited",
            Self::Declined => "Declined invite",
            Self::NotReady => "Not ready",
            Self::Ready => "Ready",
            Self::InProgress => "In progress",
            Self::Done => "Finished",
            Self::Dnf => "Did not finish",
            Self::Dq => "Disqualified",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub name: String,
    pub custom: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entrant {
    pub user: UserInfo,
    pub state: EntrantState,
    pub ready: bool,
    pub finish_time: Option<Duration>,
    pub place: Option<u32>,
    pub dnf: bool,
    pub dq: bool,
    pub comment: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl Entrant {
    pub fn new(user: UserInfo, state: EntrantState, now: DateTime<Utc>) -> Self {
        Self {
            user,
            state,
            ready: false,
            finish_time: None,
            place: None,
            dnf: false,
            dq: false,
            comment: None,
            joined_at: now,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.state == EntrantState::Joined
    }

    /// Still racing: joined, and neither finished nor out.
    pub fn is_racing(&self) -> bool {
        self.is_joined() && self.finish_time.is_none() && !self.dnf && !self.dq
    }

    pub fn status(&self, race_state: RaceState) -> EntrantStatus {
        if self.dq {
            EntrantStatus::Dq
        } else if self.dnf {
            EntrantStatus::Dnf
        } else if self.finish_time.is_some() {
            EntrantStatus::Done
        } else {
            match self.state {
                EntrantState::Requested => EntrantStatus::Requested,
                EntrantState::Invited => EntrantStatus::Invited,
                EntrantState::Declined => EntrantStatus::Declined,
                EntrantState::Joined if race_state == RaceState::InProgress => {
                    EntrantStatus::InProgress
                }
                EntrantState::Joined if self.ready => EntrantStatus::Ready,
                EntrantState::Joined => EntrantStatus::NotReady,
            }
        }
    }
}

/// A single timed competitive session.
#[derive(Clone, Debug, PartialEq)]
pub struct Race {
    pub slug: RaceSlug,
    pub category: CategoryInfo,
    pub goal: Goal,
    pub info: String,
    pub state: RaceState,
    pub opened_by: Option<UserInfo>,
    pub monitors: Vec<UserInfo>,
    pub opened_at: DateTime<Utc>,
    pub start_delay: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub time_limit: Duration,
    pub auto_start: bool,
    pub recordable: bool,
    pub recorded: bool,
    pub allow_comments: bool,
    pub allow_midrace_chat: bool,
    pub allow_non_entrant_chat: bool,
    pub version: u32,
    pub entrants: Vec<Entrant>,
}

impl Race {
    pub fn new(
        slug: RaceSlug,
        category: CategoryInfo,
        goal: Goal,
        opened_by: Option<UserInfo>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            slug,
            category,
            goal,
            info: String::new(),
            state: RaceState::Open,
            opened_by,
            monitors: Vec::new(),
            opened_at: now,
            start_delay: Duration::seconds(DEFAULT_START_DELAY_SECS),
            started_at: None,
            ended_at: None,
            cancelled_at: None,
            time_limit: Duration::hours(DEFAULT_TIME_LIMIT_HOURS),
            auto_start: true,
            recordable: true,
            recorded: false,
            allow_comments: true,
            allow_midrace_chat: true,
            allow_non_entrant_chat: true,
            version: 1,
            entrants: Vec::new(),
        }
    }

    /// `category/slug`, the race's public name.
    pub fn name(&self) -> String {
        format!("{}/{}", self.category.slug, self.slug)
    }

    pub fn is_preparing(&self) -> bool {
        self.state.is_preparing()
    }

    pub fn is_pending(&self) -> bool {
        self.state == RaceState::Pending
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == RaceState::InProgress
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    pub fn goal_str(&self) -> &str {
        &self.goal.name
    }

    pub fn entrant(&self, user_id: &UserId) -> Option<&Entrant> {
        self.entrants.iter().find(|e| &e.user.id == user_id)
    }

    pub fn entrant_mut(&mut self, user_id: &UserId) -> Option<&mut Entrant> {
        self.entrants.iter_mut().find(|e| &e.user.id == user_id)
    }

    pub fn remove_entrant(&mut self, user_id: &UserId) -> Option<Entrant> {
        let idx = self.entrants.iter().position(|e| &e.user.id == user_id)?;
        Some(self.entrants.remove(idx))
    }

    /// Joined entrants; requests, invites and declines are not counted.
    pub fn entrants_count(&self) -> usize {
        self.entrants.iter().filter(|e| e.is_joined()).count()
    }

    pub fn entrants_count_finished(&self) -> usize {
        self.entrants.iter().filter(|e| e.finish_time.is_some() && !e.dq).count()
    }

    pub fn entrants_count_inactive(&self) -> usize {
        self.entrants.iter().filter(|e| e.dnf || e.dq).count()
    }

    pub fn ready_count(&self) -> usize {
        self.entrants.iter().filter(|e| e.is_joined() && e.ready).count()
    }

    pub fn is_monitor(&self, user: &UserInfo) -> bool {
        user.is_staff
            || self.opened_by.as_ref().is_some_and(|u| u.id == user.id)
            || self.monitors.iter().any(|m| m.id == user.id)
    }

    /// Re-rank finishers by time. Equal times share a place.
    pub fn recompute_places(&mut self) {
        let mut finishers: Vec<(usize, Duration)> = self
            .entrants
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.dq && !e.dnf)
            .filter_map(|(i, e)| e.finish_time.map(|t| (i, t)))
            .collect();
        finishers.sort_by_key(|(_, t)| *t);

        for entrant in &mut self.entrants {
            entrant.place = None;
        }
        let mut previous: Option<(Duration, u32)> = None;
        for (rank, (idx, time)) in finishers.into_iter().enumerate() {
            let place = match previous {
                Some((prev_time, prev_place)) if prev_time == time => prev_place,
                _ => rank as u32 + 1,
            };
            self.entrants[idx].place = Some(place);
            previous = Some((time, place));
        }
    }

    /// Elapsed (or remaining, while pending) race time as `H:MM:SS`.
    pub fn timer_str(&self, now: DateTime<Utc>) -> String {
        match (self.state, self.started_at, self.ended_at) {
            (RaceState::Pending, Some(start), _) => format_timer(now - start),
            (RaceState::InProgress, Some(start), _) => format_timer(now - start),
            (_, Some(start), Some(end)) => format_timer(end - start),
            _ => format_timer(Duration::zero()),
        }
    }

    pub fn to_data(&self, now: DateTime<Utc>) -> RaceData {
        RaceData {
            version: self.version,
            name: self.name(),
            slug: self.slug.to_string(),
            status: StatusData {
                value: self.state.as_str().to_string(),
                verbose_value: self.state.verbose_value().to_string(),
                help_text: self.state.help_text().to_string(),
            },
            url: format!("/{}/{}", self.category.slug, self.slug),
            data_url: format!("/{}/{}/data", self.category.slug, self.slug),
            websocket_url: format!("/ws/race/{}", self.slug),
            websocket_oauth_url: format!("/ws/o/race/{}", self.slug),
            category: RaceCategoryData {
                name: self.category.name.clone(),
                short_name: self.category.short_name.clone(),
                slug: self.category.slug.to_string(),
            },
            goal: self.goal.clone(),
            info: self.info.clone(),
            entrants_count: self.entrants_count(),
            entrants_count_finished: self.entrants_count_finished(),
            entrants_count_inactive: self.entrants_count_inactive(),
            entrants: self
                .entrants
                .iter()
                .map(|e| {
                    let status = e.status(self.state);
                    EntrantData {
                        user: e.user.clone(),
                        status: StatusData {
                            value: status.as_str().to_string(),
                            verbose_value: status.verbose_value().to_string(),
                            help_text: String::new(),
                        },
                        finish_time: e.finish_time.map(format_duration_iso),
                        place: e.place,
                        place_ordinal: e.place.map(ordinal),
                        comment: e.comment.clone(),
                    }
                })
                .collect(),
            opened_at: self.opened_at,
            opened_by: self.opened_by.clone(),
            monitors: self.monitors.clone(),
            start_delay: format_duration_iso(self.start_delay),
            started_at: self.started_at,
            ended_at: self.ended_at,
            cancelled_at: self.cancelled_at,
            time_limit: format_duration_iso(self.time_limit),
            timer: self.timer_str(now),
            auto_start: self.auto_start,
            recordable: self.recordable,
            recorded: self.recorded,
            allow_comments: self.allow_comments,
            allow_midrace_chat: self.allow_midrace_chat,
            allow_non_entrant_chat: self.allow_non_entrant_chat,
        }
    }
}

/// Serialisable race snapshot, delivered as the `race.data` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceData {
    pub version: u32,
    pub name: String,
    pub slug: String,
    pub status: StatusData,
    pub url: String,
    pub data_url: String,
    pub websocket_url: String,
    pub websocket_oauth_url: String,
    pub category: RaceCategoryData,
    pub goal: Goal,
    pub info: String,
    pub entrants_count: usize,
    pub entrants_count_finished: usize,
    pub entrants_count_inactive: usize,
    pub entrants: Vec<EntrantData>,
    pub opened_at: DateTime<Utc>,
    pub opened_by: Option<UserInfo>,
    pub monitors: Vec<UserInfo>,
    pub start_delay: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub time_limit: String,
    pub timer: String,
    pub auto_start: bool,
    pub recordable: bool,
    pub recorded: bool,
    pub allow_comments: bool,
    pub allow_midrace_chat: bool,
    pub allow_non_entrant_chat: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub value: String,
    pub verbose_value: String,
    pub help_text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceCategoryData {
    pub name: String,
    pub short_name: String,
    pub slug: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntrantData {
    pub user: UserInfo,
    pub status: StatusData,
    pub finish_time: Option<String>,
    pub place: Option<u32>,
    pub place_ordinal: Option<String>,
    pub comment: Option<String>,
}

/// `H:MM:SS`, with a leading `-` for negative spans (countdowns).
pub fn format_timer(span: Duration) -> String {
    let sign = if span < Duration::zero() { "-" } else { "" };
    let total = span.num_seconds().abs();
    format!(
        "{sign}{}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// ISO 8601 duration, e.g. `P0DT01H02M03.450000S`.
pub fn format_duration_iso(span: Duration) -> String {
    let micros = span.num_microseconds().unwrap_or(i64::MAX).abs();
    let secs = micros / 1_000_000;
    format!(
        "{}P{}DT{:02}H{:02}M{:02}.{:06}S",
        if span < Duration::zero() { "-" } else { "" },
        secs / 86_400,
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        micros % 1_000_000
    )
}

pub fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ids::CategorySlug;
    use chrono::TimeZone;

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    pub(crate) fn user(name: &str) -> UserInfo {
        UserInfo::new(UserId::from_raw(format!("user_{name}")), name)
    }

    pub(crate) fn race() -> Race {
        Race::new(
            RaceSlug::parse("quick-map-0001").unwrap(),
            CategoryInfo {
                slug: CategorySlug::parse("ootr").unwrap(),
                name: "Ocarina of Time Randomizer".into(),
                short_name: "OoTR".into(),
                info: String::new(),
                active: true,
            },
            Goal {
                name: "Beat the game".into(),
                custom: false,
            },
            Some(user("host")),
            t0(),
        )
    }

    #[test]
    fn state_strings_roundtrip() {
        for state in [
            RaceState::Open,
            RaceState::Invitational,
            RaceState::Pending,
            RaceState::InProgress,
            RaceState::Finished,
            RaceState::Cancelled,
        ] {
            let parsed: RaceState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("racing".parse::<RaceState>().is_err());
    }

    #[test]
    fn preparing_covers_open_and_invitational() {
        assert!(RaceState::Open.is_preparing());
        assert!(RaceState::Invitational.is_preparing());
        assert!(!RaceState::Pending.is_preparing());
        assert!(RaceState::Cancelled.is_done());
        assert!(!RaceState::InProgress.is_done());
    }

    #[test]
    fn entrant_status_priority() {
        let mut e = Entrant::new(user("a"), EntrantState::Joined, t0());
        assert_eq!(e.status(RaceState::Open), EntrantStatus::NotReady);
        e.ready = true;
        assert_eq!(e.status(RaceState::Open), EntrantStatus::Ready);
        assert_eq!(e.status(RaceState::InProgress), EntrantStatus::InProgress);
        e.finish_time = Some(Duration::seconds(100));
        assert_eq!(e.status(RaceState::InProgress), EntrantStatus::Done);
        e.dq = true;
        assert_eq!(e.status(RaceState::Finished), EntrantStatus::Dq);
    }

    #[test]
    fn timer_formats() {
        assert_eq!(format_timer(Duration::seconds(3723)), "1:02:03");
        assert_eq!(format_timer(Duration::seconds(-15)), "-0:00:15");
        assert_eq!(format_timer(Duration::zero()), "0:00:00");
    }

    #[test]
    fn timer_str_follows_state() {
        let mut r = race();
        assert_eq!(r.timer_str(t0()), "0:00:00");

        r.state = RaceState::Pending;
        r.started_at = Some(t0() + Duration::seconds(15));
        assert_eq!(r.timer_str(t0()), "-0:00:15");

        r.state = RaceState::InProgress;
        assert_eq!(r.timer_str(t0() + Duration::seconds(75)), "0:01:00");

        r.state = RaceState::Finished;
        r.ended_at = Some(t0() + Duration::seconds(3615));
        assert_eq!(r.timer_str(t0() + Duration::days(3)), "1:00:00");
    }

    #[test]
    fn iso_duration() {
        assert_eq!(
            format_duration_iso(Duration::milliseconds(3_723_450)),
            "P0DT01H02M03.450000S"
        );
        assert_eq!(format_duration_iso(Duration::hours(24)), "P1DT00H00M00.000000S");
    }

    #[test]
    fn ordinals() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(3), "3rd");
        assert_eq!(ordinal(4), "4th");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(22), "22nd");
        assert_eq!(ordinal(113), "113th");
    }

    #[test]
    fn places_ranked_with_ties() {
        let mut r = race();
        for (name, secs) in [("a", 300), ("b", 200), ("c", 300), ("d", 0)] {
            let mut e = Entrant::new(user(name), EntrantState::Joined, t0());
            if secs > 0 {
                e.finish_time = Some(Duration::seconds(secs));
            } else {
                e.dnf = true;
            }
            r.entrants.push(e);
        }
        r.recompute_places();
        let places: Vec<Option<u32>> = r.entrants.iter().map(|e| e.place).collect();
        assert_eq!(places, vec![Some(2), Some(1), Some(2), None]);
    }

    #[test]
    fn counts_ignore_non_joined() {
        let mut r = race();
        r.entrants.push(Entrant::new(user("a"), EntrantState::Joined, t0()));
        r.entrants.push(Entrant::new(user("b"), EntrantState::Invited, t0()));
        r.entrants.push(Entrant::new(user("c"), EntrantState::Requested, t0()));
        assert_eq!(r.entrants_count(), 1);
    }

    #[test]
    fn monitor_includes_opener_and_staff() {
        let r = race();
        assert!(r.is_monitor(&user("host")));
        assert!(!r.is_monitor(&user("rando")));
        let mut staff = user("admin");
        staff.is_staff = true;
        assert!(r.is_monitor(&staff));
    }

    #[test]
    fn data_snapshot_shape() {
        let mut r = race();
        r.entrants.push(Entrant::new(user("a"), EntrantState::Joined, t0()));
        let json = serde_json::to_value(r.to_data(t0())).unwrap();
        assert_eq!(json["name"], "ootr/quick-map-0001");
        assert_eq!(json["status"]["value"], "open");
        assert_eq!(json["status"]["verbose_value"], "Open");
        assert_eq!(json["entrants_count"], 1);
        assert_eq!(json["entrants"][0]["status"]["value"], "not_ready");
        assert_eq!(json["websocket_oauth_url"], "/ws/o/race/quick-map-0001");
    }
}
