//! Race actions: the commands entrants and monitors send over the race
//! socket, and the lifecycle ticks the server applies on its own.
//!
//! Every action works on an in-memory [`Race`]. On success the race's
//! `version` is bumped and the outcome lists the system chat messages to
//! post; on failure nothing is touched beyond what the caller discards.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::ActionError;
use crate::ids::UserId;
use crate::race::{format_timer, ordinal, Entrant, EntrantState, Race, RaceState};
use crate::user::UserInfo;

pub const MAX_COMMENT_LEN: usize = 200;
pub const MAX_INFO_LEN: usize = 1000;

/// Token scope an incoming socket action requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionScope {
    ChatMessage,
    RaceAction,
}

impl ActionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::RaceAction => "race_action",
        }
    }

    /// `None` for actions that are neither chat nor a known command.
    pub fn for_action(action: &str) -> Option<Self> {
        if action == "message" {
            Some(Self::ChatMessage)
        } else if COMMANDS.contains(&action) {
            Some(Self::RaceAction)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ActionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const COMMANDS: &[&str] = &[
    "join",
    "leave",
    "request_invite",
    "cancel_invite",
    "accept_invite",
    "decline_invite",
    "ready",
    "unready",
    "done",
    "undone",
    "forfeit",
    "unforfeit",
    "add_comment",
    "begin",
    "cancel_race",
    "invite",
    "accept_request",
    "force_unready",
    "remove_entrant",
    "disqualify",
    "undisqualify",
    "make_open",
    "make_invitational",
    "add_monitor",
    "remove_monitor",
    "setinfo",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaceAction {
    Join,
    Leave,
    RequestInvite,
    CancelInvite,
    AcceptInvite,
    DeclineInvite,
    Ready,
    Unready,
    Done,
    Undone,
    Forfeit,
    Unforfeit,
    AddComment { comment: String },
    Begin,
    CancelRace,
    Invite { user: UserId },
    AcceptRequest { user: UserId },
    ForceUnready { user: UserId },
    RemoveEntrant { user: UserId },
    Disqualify { user: UserId },
    Undisqualify { user: UserId },
    MakeOpen,
    MakeInvitational,
    AddMonitor { user: UserId },
    RemoveMonitor { user: UserId },
    SetInfo { info: String },
}

impl RaceAction {
    /// Build a command from its socket name and `data` payload.
    pub fn parse(action: &str, data: Option<&Value>) -> Result<Self, ActionError> {
        let parsed = match action {
            "join" => Self::Join,
            "leave" => Self::Leave,
            "request_invite" => Self::RequestInvite,
            "cancel_invite" => Self::CancelInvite,
            "accept_invite" => Self::AcceptInvite,
            "decline_invite" => Self::DeclineInvite,
            "ready" => Self::Ready,
            "unready" => Self::Unready,
            "done" => Self::Done,
            "undone" => Self::Undone,
            "forfeit" => Self::Forfeit,
            "unforfeit" => Self::Unforfeit,
            "add_comment" => Self::AddComment {
                comment: text_field(data, "comment")?.to_owned(),
            },
            "begin" => Self::Begin,
            "cancel_race" => Self::CancelRace,
            "invite" => Self::Invite {
                user: user_field(data)?,
            },
            "accept_request" => Self::AcceptRequest {
                user: user_field(data)?,
            },
            "force_unready" => Self::ForceUnready {
                user: user_field(data)?,
            },
            "remove_entrant" => Self::RemoveEntrant {
                user: user_field(data)?,
            },
            "disqualify" => Self::Disqualify {
                user: user_field(data)?,
            },
            "undisqualify" => Self::Undisqualify {
                user: user_field(data)?,
            },
            "make_open" => Self::MakeOpen,
            "make_invitational" => Self::MakeInvitational,
            "add_monitor" => Self::AddMonitor {
                user: user_field(data)?,
            },
            "remove_monitor" => Self::RemoveMonitor {
                user: user_field(data)?,
            },
            "setinfo" => Self::SetInfo {
                info: text_field(data, "info")?.to_owned(),
            },
            _ => {
                return Err(ActionError::rejected(
                    "Action is missing or not recognised. Check your input and try again.",
                ))
            }
        };
        Ok(parsed)
    }

    /// The other user this command acts upon, if any.
    pub fn target(&self) -> Option<&UserId> {
        match self {
            Self::Invite { user }
            | Self::AcceptRequest { user }
            | Self::ForceUnready { user }
            | Self::RemoveEntrant { user }
            | Self::Disqualify { user }
            | Self::Undisqualify { user }
            | Self::AddMonitor { user }
            | Self::RemoveMonitor { user } => Some(user),
            _ => None,
        }
    }

    pub fn requires_monitor(&self) -> bool {
        matches!(
            self,
            Self::Begin
                | Self::CancelRace
                | Self::Invite { .. }
                | Self::AcceptRequest { .. }
                | Self::ForceUnready { .. }
                | Self::RemoveEntrant { .. }
                | Self::Disqualify { .. }
                | Self::Undisqualify { .. }
                | Self::MakeOpen
                | Self::MakeInvitational
                | Self::AddMonitor { .. }
                | Self::RemoveMonitor { .. }
                | Self::SetInfo { .. }
        )
    }
}

fn text_field<'a>(data: Option<&'a Value>, key: &str) -> Result<&'a str, ActionError> {
    data.and_then(|d| d.get(key))
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::rejected(format!("Missing required field: {key}.")))
}

fn user_field(data: Option<&Value>) -> Result<UserId, ActionError> {
    let raw = text_field(data, "user")?;
    if raw.trim().is_empty() {
        return Err(ActionError::rejected("Missing required field: user."));
    }
    Ok(UserId::from_raw(raw.trim()))
}

/// The authenticated user performing an action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user: UserInfo,
    /// Category moderator; race-level monitors are checked on the race.
    pub can_moderate: bool,
}

impl Actor {
    pub fn new(user: UserInfo, can_moderate: bool) -> Self {
        Self { user, can_moderate }
    }

    pub fn is_monitor(&self, race: &Race) -> bool {
        self.can_moderate || race.is_monitor(&self.user)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub system_messages: Vec<String>,
}

impl ActionOutcome {
    fn say(&mut self, msg: impl Into<String>) {
        self.system_messages.push(msg.into());
    }
}

/// Apply `action` for `actor`. `target` is the resolved user for commands
/// that name one (see [`RaceAction::target`]).
pub fn apply(
    race: &mut Race,
    actor: &Actor,
    action: &RaceAction,
    target: Option<&UserInfo>,
    now: DateTime<Utc>,
) -> Result<ActionOutcome, ActionError> {
    if action.requires_monitor() && !actor.is_monitor(race) {
        return Err(ActionError::rejected(
            "Only race monitors can do that.",
        ));
    }
    if action.target().is_some() && target.is_none() {
        return Err(ActionError::rejected("That user does not exist."));
    }

    let mut out = ActionOutcome::default();
    let me = &actor.user;

    match action {
        RaceAction::Join => {
            if race.state != RaceState::Open {
                return Err(ActionError::rejected("You cannot join this race."));
            }
            match race.entrant_mut(&me.id) {
                Some(e) if e.state == EntrantState::Invited => {
                    e.state = EntrantState::Joined;
                }
                Some(_) => return Err(ActionError::rejected("You are already an entrant.")),
                None => race
                    .entrants
                    .push(Entrant::new(me.clone(), EntrantState::Joined, now)),
            }
            out.say(format!("{} joins.", me.name));
        }
        RaceAction::Leave => {
            require_preparing(race, "You can only leave a race before it starts.")?;
            joined(race, &me.id)?;
            race.remove_entrant(&me.id);
            out.say(format!("{} quits.", me.name));
        }
        RaceAction::RequestInvite => {
            if race.state != RaceState::Invitational {
                return Err(ActionError::rejected(
                    "You can only request to join an invitational race.",
                ));
            }
            if race.entrant(&me.id).is_some() {
                return Err(ActionError::rejected("You are already an entrant."));
            }
            race.entrants
                .push(Entrant::new(me.clone(), EntrantState::Requested, now));
            out.say(format!("{} requests to join.", me.name));
        }
        RaceAction::CancelInvite => {
            require_entrant_state(race, &me.id, EntrantState::Requested, "You have not requested to join.")?;
            race.remove_entrant(&me.id);
            out.say(format!("{} withdraws a request to join.", me.name));
        }
        RaceAction::AcceptInvite => {
            require_preparing(race, "This race has already started.")?;
            require_entrant_state(race, &me.id, EntrantState::Invited, "You have not been invited.")?;
            set_state(race, &me.id, EntrantState::Joined);
            out.say(format!("{} accepts an invitation to join.", me.name));
        }
        RaceAction::DeclineInvite => {
            require_entrant_state(race, &me.id, EntrantState::Invited, "You have not been invited.")?;
            set_state(race, &me.id, EntrantState::Declined);
            out.say(format!("{} declines an invitation to join.", me.name));
        }
        RaceAction::Ready => {
            require_preparing(race, "You can only ready up before the race starts.")?;
            let e = joined_mut(race, &me.id)?;
            if e.ready {
                return Err(ActionError::rejected("You are already ready."));
            }
            e.ready = true;
            out.say(format!("{} is ready!", me.name));
        }
        RaceAction::Unready => {
            require_preparing(race, "You can only unready before the race starts.")?;
            let e = joined_mut(race, &me.id)?;
            if !e.ready {
                return Err(ActionError::rejected("You are not ready."));
            }
            e.ready = false;
            out.say(format!("{} is not ready.", me.name));
        }
        RaceAction::Done => {
            require_in_progress(race)?;
            let started_at = race.started_at.unwrap_or(now);
            let e = joined_mut(race, &me.id)?;
            if !e.is_racing() {
                return Err(ActionError::rejected("You are no longer racing."));
            }
            let time = now - started_at;
            e.finish_time = Some(time);
            race.recompute_places();
            let place = race
                .entrant(&me.id)
                .and_then(|e| e.place)
                .map(ordinal)
                .unwrap_or_default();
            out.say(format!(
                "{} has finished in {} place with a time of {}!",
                me.name,
                place,
                format_timer(time)
            ));
        }
        RaceAction::Undone => {
            require_in_progress(race)?;
            let e = joined_mut(race, &me.id)?;
            if e.finish_time.is_none() || e.dq {
                return Err(ActionError::rejected("You have not finished."));
            }
            e.finish_time = None;
            e.comment = None;
            race.recompute_places();
            out.say(format!("{} is no longer done.", me.name));
        }
        RaceAction::Forfeit => {
            require_in_progress(race)?;
            let e = joined_mut(race, &me.id)?;
            if !e.is_racing() {
                return Err(ActionError::rejected("You are no longer racing."));
            }
            e.dnf = true;
            out.say(format!("{} has forfeited from the race.", me.name));
        }
        RaceAction::Unforfeit => {
            require_in_progress(race)?;
            let e = joined_mut(race, &me.id)?;
            if !e.dnf || e.dq {
                return Err(ActionError::rejected("You have not forfeited."));
            }
            e.dnf = false;
            e.comment = None;
            out.say(format!("{} has un-forfeited from the race.", me.name));
        }
        RaceAction::AddComment { comment } => {
            if !race.allow_comments {
                return Err(ActionError::rejected("Comments are disabled for this race."));
            }
            if !matches!(race.state, RaceState::InProgress | RaceState::Finished) {
                return Err(ActionError::rejected(
                    "You can only comment once you have finished.",
                ));
            }
            let comment = comment.trim();
            if comment.is_empty() || comment.chars().count() > MAX_COMMENT_LEN {
                return Err(ActionError::rejected(format!(
                    "Comments must be between 1 and {MAX_COMMENT_LEN} characters."
                )));
            }
            let e = joined_mut(race, &me.id)?;
            if e.dq || (e.finish_time.is_none() && !e.dnf) {
                return Err(ActionError::rejected(
                    "You can only comment once you have finished.",
                ));
            }
            if e.comment.is_some() {
                return Err(ActionError::rejected("You have already submitted a comment."));
            }
            e.comment = Some(comment.to_owned());
            out.say(format!("{} added a comment.", me.name));
        }
        RaceAction::Begin => {
            require_preparing(race, "The race has already begun.")?;
            if race.ready_count() < 2 {
                return Err(ActionError::rejected(
                    "At least two entrants must be ready before the race can begin.",
                ));
            }
            race.entrants.retain(|e| e.is_joined() && e.ready);
            start_countdown(race, now, &mut out);
        }
        RaceAction::CancelRace => {
            if race.is_done() {
                return Err(ActionError::rejected("This race is already over."));
            }
            race.state = RaceState::Cancelled;
            race.cancelled_at = Some(now);
            out.say(format!("This race has been cancelled by {}.", me.name));
        }
        RaceAction::Invite { .. } => {
            let target = resolved(target)?;
            require_preparing(race, "This race has already started.")?;
            if race.entrant(&target.id).is_some() {
                return Err(ActionError::rejected(format!(
                    "{} is already an entrant.",
                    target.name
                )));
            }
            race.entrants
                .push(Entrant::new(target.clone(), EntrantState::Invited, now));
            out.say(format!("{} invites {} to join the race.", me.name, target.name));
        }
        RaceAction::AcceptRequest { .. } => {
            let target = resolved(target)?;
            require_preparing(race, "This race has already started.")?;
            require_entrant_state(
                race,
                &target.id,
                EntrantState::Requested,
                "That user has not requested to join.",
            )?;
            set_state(race, &target.id, EntrantState::Joined);
            out.say(format!(
                "{} accepts a request to join from {}.",
                me.name, target.name
            ));
        }
        RaceAction::ForceUnready { .. } => {
            let target = resolved(target)?;
            require_preparing(race, "This race has already started.")?;
            let e = joined_mut(race, &target.id)?;
            if !e.ready {
                return Err(ActionError::rejected("That entrant is not ready."));
            }
            e.ready = false;
            out.say(format!("{} has been unreadied by {}.", target.name, me.name));
        }
        RaceAction::RemoveEntrant { .. } => {
            let target = resolved(target)?;
            require_preparing(race, "This race has already started.")?;
            if race.remove_entrant(&target.id).is_none() {
                return Err(ActionError::NotFound);
            }
            out.say(format!(
                "{} has been removed from the race by {}.",
                target.name, me.name
            ));
        }
        RaceAction::Disqualify { .. } => {
            let target = resolved(target)?;
            if !matches!(race.state, RaceState::InProgress | RaceState::Finished) {
                return Err(ActionError::rejected(
                    "Entrants can only be disqualified once the race has started.",
                ));
            }
            let e = joined_mut(race, &target.id)?;
            if e.dq {
                return Err(ActionError::rejected("That entrant is already disqualified."));
            }
            e.dq = true;
            race.recompute_places();
            out.say(format!(
                "{} has been disqualified from the race by {}.",
                target.name, me.name
            ));
        }
        RaceAction::Undisqualify { .. } => {
            let target = resolved(target)?;
            if race.state != RaceState::InProgress {
                return Err(ActionError::rejected(
                    "Entrants can only be un-disqualified while the race is in progress.",
                ));
            }
            let e = joined_mut(race, &target.id)?;
            if !e.dq {
                return Err(ActionError::rejected("That entrant is not disqualified."));
            }
            e.dq = false;
            race.recompute_places();
            out.say(format!(
                "{} has been un-disqualified from the race by {}.",
                target.name, me.name
            ));
        }
        RaceAction::MakeOpen => {
            if race.state != RaceState::Invitational {
                return Err(ActionError::rejected("This race is not invitational."));
            }
            race.state = RaceState::Open;
            out.say(format!("{} has made this race open.", me.name));
        }
        RaceAction::MakeInvitational => {
            if race.state != RaceState::Open {
                return Err(ActionError::rejected("This race is not open."));
            }
            race.state = RaceState::Invitational;
            out.say(format!("{} has made this race invitational.", me.name));
        }
        RaceAction::AddMonitor { .. } => {
            let target = resolved(target)?;
            if race.is_done() {
                return Err(ActionError::rejected("This race is already over."));
            }
            if race.monitors.iter().any(|m| m.id == target.id) {
                return Err(ActionError::rejected(format!(
                    "{} is already a race monitor.",
                    target.name
                )));
            }
            race.monitors.push(target.clone());
            out.say(format!("{} adds {} as a race monitor.", me.name, target.name));
        }
        RaceAction::RemoveMonitor { .. } => {
            let target = resolved(target)?;
            let before = race.monitors.len();
            race.monitors.retain(|m| m.id != target.id);
            if race.monitors.len() == before {
                return Err(ActionError::rejected(format!(
                    "{} is not a race monitor.",
                    target.name
                )));
            }
            out.say(format!(
                "{} removes {} as a race monitor.",
                me.name, target.name
            ));
        }
        RaceAction::SetInfo { info } => {
            if info.chars().count() > MAX_INFO_LEN {
                return Err(ActionError::rejected(format!(
                    "Race info may be at most {MAX_INFO_LEN} characters."
                )));
            }
            race.info = info.trim().to_owned();
            out.say(format!("{} updated the race information.", me.name));
        }
    }

    maybe_auto_start(race, now, &mut out);
    maybe_finish(race, now, &mut out);
    race.version += 1;
    Ok(out)
}

/// Advance a race by the clock. Returns `None` when nothing changed.
pub fn tick(race: &mut Race, now: DateTime<Utc>) -> Option<ActionOutcome> {
    let mut out = ActionOutcome::default();
    match (race.state, race.started_at) {
        (RaceState::Pending, Some(start)) if now >= start => {
            race.state = RaceState::InProgress;
            out.say("The race has begun! Good luck!");
        }
        (RaceState::InProgress, Some(start)) if now >= start + race.time_limit => {
            for e in race.entrants.iter_mut().filter(|e| e.is_racing()) {
                e.dnf = true;
            }
            out.say("The race time limit has elapsed. Remaining entrants have been forfeited.");
            maybe_finish(race, now, &mut out);
        }
        _ => return None,
    }
    race.version += 1;
    Some(out)
}

fn start_countdown(race: &mut Race, now: DateTime<Utc>, out: &mut ActionOutcome) {
    race.state = RaceState::Pending;
    race.started_at = Some(now + race.start_delay);
    out.say(format!(
        "The race will begin in {} seconds!",
        race.start_delay.num_seconds()
    ));
}

fn maybe_auto_start(race: &mut Race, now: DateTime<Utc>, out: &mut ActionOutcome) {
    if !race.is_preparing() || !race.auto_start {
        return;
    }
    let outstanding = race.entrants.iter().any(|e| {
        matches!(e.state, EntrantState::Requested | EntrantState::Invited)
    });
    let joined = race.entrants_count();
    if !outstanding && joined >= 2 && race.ready_count() == joined {
        start_countdown(race, now, out);
    }
}

fn maybe_finish(race: &mut Race, now: DateTime<Utc>, out: &mut ActionOutcome) {
    if race.state != RaceState::InProgress || race.entrants_count() == 0 {
        return;
    }
    if race.entrants.iter().any(|e| e.is_racing()) {
        return;
    }
    race.state = RaceState::Finished;
    race.ended_at = Some(now);
    out.say(format!("Race finished in {}.", race.timer_str(now)));
}

fn require_preparing(race: &Race, msg: &str) -> Result<(), ActionError> {
    if race.is_preparing() {
        Ok(())
    } else {
        Err(ActionError::rejected(msg))
    }
}

fn require_in_progress(race: &Race) -> Result<(), ActionError> {
    if race.is_in_progress() {
        Ok(())
    } else {
        Err(ActionError::rejected("The race is not in progress."))
    }
}

fn require_entrant_state(
    race: &Race,
    user: &UserId,
    state: EntrantState,
    msg: &str,
) -> Result<(), ActionError> {
    match race.entrant(user) {
        Some(e) if e.state == state => Ok(()),
        _ => Err(ActionError::rejected(msg)),
    }
}

fn set_state(race: &mut Race, user: &UserId, state: EntrantState) {
    if let Some(e) = race.entrant_mut(user) {
        e.state = state;
    }
}

fn joined(race: &Race, user: &UserId) -> Result<(), ActionError> {
    match race.entrant(user) {
        Some(e) if e.is_joined() => Ok(()),
        _ => Err(ActionError::rejected("You are not an entrant of this race.")),
    }
}

fn joined_mut<'a>(race: &'a mut Race, user: &UserId) -> Result<&'a mut Entrant, ActionError> {
    match race.entrant_mut(user) {
        Some(e) if e.is_joined() => Ok(e),
        _ => Err(ActionError::rejected("You are not an entrant of this race.")),
    }
}

fn resolved(target: Option<&UserInfo>) -> Result<&UserInfo, ActionError> {
    target.ok_or(ActionError::NotFound)
}
