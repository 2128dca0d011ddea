use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actions::Actor;
use crate::errors::ActionError;
use crate::ids::MessageId;
use crate::race::Race;
use crate::user::UserInfo;

pub const MAX_MESSAGE_LEN: usize = 1000;
pub const RATE_LIMIT_COUNT: usize = 20;
pub const RATE_LIMIT_WINDOW_SECS: i64 = 60;
pub const CHAT_CLOSES_AFTER_SECS: i64 = 3600;
pub const HISTORY_LIMIT: usize = 100;
const MAX_GUID_LEN: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub user: Option<UserInfo>,
    pub posted_at: DateTime<Utc>,
    pub message: String,
    pub is_system: bool,
    /// Client-chosen id echoed back so senders can match their own message.
    pub guid: Option<String>,
}

impl ChatMessage {
    pub fn system(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            user: None,
            posted_at: now,
            message: message.into(),
            is_system: true,
            guid: None,
        }
    }

    pub fn from_user(user: UserInfo, post: ChatPost, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            user: Some(user),
            posted_at: now,
            message: post.message,
            is_system: false,
            guid: post.guid,
        }
    }
}

/// Validated payload of a `message` action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatPost {
    pub message: String,
    pub guid: Option<String>,
}

impl ChatPost {
    pub fn parse(data: Option<&Value>) -> Result<Self, ActionError> {
        let message = data
            .and_then(|d| d.get("message"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if message.is_empty() {
            return Err(ActionError::rejected("Message is empty."));
        }
        if message.chars().count() > MAX_MESSAGE_LEN {
            return Err(ActionError::rejected(format!(
                "Messages may be at most {MAX_MESSAGE_LEN} characters."
            )));
        }
        let guid = data
            .and_then(|d| d.get("guid"))
            .and_then(Value::as_str)
            .filter(|g| !g.is_empty())
            .map(|g| g.chars().take(MAX_GUID_LEN).collect());
        Ok(Self {
            message: message.to_owned(),
            guid,
        })
    }
}

/// Whether `actor` may post in `race` right now. `recent` is how many
/// messages they posted in this race during the last rate window.
pub fn check_can_post(
    race: &Race,
    actor: &Actor,
    recent: usize,
    now: DateTime<Utc>,
) -> Result<(), ActionError> {
    if let Some(done_at) = race.ended_at.or(race.cancelled_at) {
        if now >= done_at + Duration::seconds(CHAT_CLOSES_AFTER_SECS) {
            return Err(ActionError::rejected("This race chat is now closed."));
        }
    }

    let monitor = actor.is_monitor(race);
    if race.is_in_progress() && !monitor {
        match race.entrant(&actor.user.id) {
            Some(e) if e.is_racing() && !race.allow_midrace_chat => {
                return Err(ActionError::rejected(
                    "You cannot chat while the race is in progress.",
                ));
            }
            Some(e) if e.is_joined() => {}
            _ if !race.allow_non_entrant_chat => {
                return Err(ActionError::rejected(
                    "Only entrants may chat while the race is in progress.",
                ));
            }
            _ => {}
        }
    }

    if !monitor && recent >= RATE_LIMIT_COUNT {
        return Err(ActionError::rejected(
            "You are chatting too fast. Please wait a moment.",
        ));
    }
    Ok(())
}

pub fn rate_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(RATE_LIMIT_WINDOW_SECS)
}
