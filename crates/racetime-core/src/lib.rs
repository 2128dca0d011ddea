//! Domain model for races: identifiers, the race lifecycle, race actions,
//! chat rules, OAuth state and page view models.

pub mod actions;
pub mod auth;
pub mod chat;
pub mod errors;
pub mod ids;
pub mod race;
pub mod user;
pub mod views;

pub use actions::{ActionOutcome, ActionScope, RaceAction};
pub use errors::{ActionError, SlugError};
pub use race::{Entrant, EntrantState, EntrantStatus, Goal, Race, RaceState};
pub use user::{CategoryInfo, UserInfo};
