use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::SlugError;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(UserId, "user");
branded_id!(MessageId, "msg");
branded_id!(ClientId, "client");

const MAX_SLUG_LEN: usize = 64;

fn validate_slug(raw: &str) -> Result<(), SlugError> {
    if raw.is_empty() || raw.len() > MAX_SLUG_LEN {
        return Err(SlugError::Length(raw.len()));
    }
    if let Some(bad) = raw
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(SlugError::InvalidChar(bad));
    }
    Ok(())
}

/// Slugs are URL path segments, so unlike ids they are checked on parse.
macro_rules! slug {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, SlugError> {
                validate_slug(raw)?;
                Ok(Self(raw.to_owned()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = SlugError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = SlugError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                validate_slug(&s)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(slug: $name) -> String {
                slug.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

slug!(RaceSlug);
slug!(CategorySlug);

const ADJECTIVES: &[&str] = &[
    "amazing", "bonus", "clumsy", "crafty", "cursed", "daring", "dizzy", "epic", "fancy",
    "frantic", "gnarly", "hungry", "lucky", "mysterious", "neat", "odd", "perfect", "quick",
    "salty", "sleepy", "smart", "speedy", "tricky", "wild",
];

const NOUNS: &[&str] = &[
    "arrow", "boomerang", "bottle", "bow", "compass", "dungeon", "fairy", "hammer", "hookshot",
    "key", "lantern", "map", "mirror", "ocarina", "rupee", "shield", "skull", "slingshot",
    "sword", "tunic", "warp", "zora",
];

impl RaceSlug {
    /// Random `adjective-noun-NNNN` slug. Uniqueness is the caller's concern.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("race");
        let number: u16 = rng.gen_range(0..10_000);
        Self(format!("{adjective}-{noun}-{number:04}"))
    }
}
