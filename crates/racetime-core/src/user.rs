use serde::{Deserialize, Serialize};

use crate::ids::{CategorySlug, UserId};

/// Public view of a user, as embedded in races and chat messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub is_staff: bool,
}

impl UserInfo {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_staff: false,
        }
    }
}

/// A game/race-type grouping under which races are organised.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryInfo {
    pub slug: CategorySlug,
    pub name: String,
    pub short_name: String,
    #[serde(default)]
    pub info: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}
