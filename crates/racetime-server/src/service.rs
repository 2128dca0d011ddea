//! Race operations shared by the socket consumers, the pages and the ticker.
//!
//! Store calls are synchronous SQLite work, so every one of them runs on the
//! blocking pool. Changes are announced on a broadcast channel that the
//! event bridge fans out to the race groups.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use racetime_core::actions::{self, Actor, ActionScope, RaceAction};
use racetime_core::auth::OAuthState;
use racetime_core::chat::{self, ChatMessage, ChatPost, HISTORY_LIMIT};
use racetime_core::ids::{CategorySlug, RaceSlug};
use racetime_core::race::RaceData;
use racetime_core::{Goal, Race, UserInfo};
use racetime_store::{
    CategoryRepo, Committed, Database, MessageRepo, RaceRepo, StoreError, TokenRepo, UserRepo,
};

use crate::error::ServerError;
use crate::protocol::{RaceBroadcast, ServerMessage};

const SLUG_ATTEMPTS: usize = 5;

/// Every repository, over one database.
pub struct Stores {
    pub users: UserRepo,
    pub categories: CategoryRepo,
    pub races: RaceRepo,
    pub messages: MessageRepo,
    pub tokens: TokenRepo,
}

impl Stores {
    pub fn new(db: Database) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            categories: CategoryRepo::new(db.clone()),
            races: RaceRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            tokens: TokenRepo::new(db),
        }
    }

    /// Staff and category moderators may moderate every race in the category.
    pub fn can_moderate(&self, user: &UserInfo, category: &CategorySlug) -> Result<bool, StoreError> {
        if user.is_staff {
            return Ok(true);
        }
        self.categories.is_moderator(category, &user.id)
    }

    fn require_race(&self, slug: &RaceSlug) -> Result<Race, ServerError> {
        self.races
            .find(slug)?
            .ok_or_else(|| ServerError::NotFound(format!("race {slug}")))
    }
}

pub struct RaceService {
    stores: Arc<Stores>,
    events: broadcast::Sender<RaceBroadcast>,
}

impl RaceService {
    pub fn new(db: Database, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            stores: Arc::new(Stores::new(db)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaceBroadcast> {
        self.events.subscribe()
    }

    /// Run store work on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Stores) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        let stores = Arc::clone(&self.stores);
        tokio::task::spawn_blocking(move || f(&stores)).await?
    }

    fn publish(&self, race: &RaceSlug, message: ServerMessage) {
        // No receivers just means nobody is watching.
        let _ = self.events.send(RaceBroadcast {
            race: race.clone(),
            message,
        });
    }

    /// Announce a committed change: its chat messages, then the new race state.
    fn publish_committed(&self, committed: Committed) {
        let slug = committed.race.slug.clone();
        for message in committed.messages {
            self.publish(&slug, ServerMessage::ChatMessage { message });
        }
        self.publish(&slug, ServerMessage::race(committed.race.to_data(Utc::now())));
    }

    pub async fn find_race(&self, slug: &RaceSlug) -> Result<Option<Race>, ServerError> {
        let slug = slug.clone();
        self.blocking(move |s| Ok(s.races.find(&slug)?)).await
    }

    pub async fn race_data(&self, slug: &RaceSlug) -> Result<Option<RaceData>, ServerError> {
        Ok(self
            .find_race(slug)
            .await?
            .map(|race| race.to_data(Utc::now())))
    }

    pub async fn chat_history(&self, slug: &RaceSlug) -> Result<Vec<ChatMessage>, ServerError> {
        let slug = slug.clone();
        self.blocking(move |s| Ok(s.messages.history(&slug, HISTORY_LIMIT)?))
            .await
    }

    /// Resolve a bearer token against the scopes an action needs.
    pub async fn authenticate(
        &self,
        token: Option<Arc<SecretString>>,
        required: Vec<ActionScope>,
    ) -> Result<OAuthState, ServerError> {
        let Some(token) = token else {
            return Ok(OAuthState::anonymous());
        };
        self.blocking(move |s| {
            let grant = s.tokens.lookup(&token)?;
            Ok(OAuthState::validate(grant, &required, Utc::now()))
        })
        .await
    }

    /// The user behind a page request, if its token is valid.
    pub async fn viewer(
        &self,
        token: Option<Arc<SecretString>>,
    ) -> Result<Option<UserInfo>, ServerError> {
        Ok(self.authenticate(token, Vec::new()).await?.user)
    }

    /// Open a new race with a fresh slug.
    #[instrument(skip(self, goal, opened_by), fields(category = %category))]
    pub async fn open_race(
        &self,
        category: &CategorySlug,
        goal: Goal,
        opened_by: Option<UserInfo>,
    ) -> Result<Race, ServerError> {
        let category = category.clone();
        let race = self
            .blocking(move |s| {
                let info = s.categories.get(&category)?;
                let mut last_err = None;
                for _ in 0..SLUG_ATTEMPTS {
                    let race = Race::new(
                        RaceSlug::generate(),
                        info.clone(),
                        goal.clone(),
                        opened_by.clone(),
                        Utc::now(),
                    );
                    match s.races.create(&race) {
                        Ok(()) => return Ok(race),
                        Err(StoreError::Conflict(e)) => last_err = Some(e),
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(StoreError::Conflict(last_err.unwrap_or_default()).into())
            })
            .await?;
        info!(race = %race.slug, "race opened");
        self.publish(&race.slug, ServerMessage::race(race.to_data(Utc::now())));
        Ok(race)
    }

    /// Apply a race action for `user` and announce the result.
    #[instrument(skip(self, user, data), fields(race = %slug, user_id = %user.id))]
    pub async fn call_race_action(
        &self,
        slug: &RaceSlug,
        user: UserInfo,
        action: &str,
        data: Option<Value>,
    ) -> Result<(), ServerError> {
        let action = RaceAction::parse(action, data.as_ref())?;
        let slug = slug.clone();
        let committed = self
            .blocking(move |s| {
                let target = match action.target() {
                    Some(id) => s.users.find(id)?,
                    None => None,
                };
                let race = s.require_race(&slug)?;
                let actor = Actor::new(user.clone(), s.can_moderate(&user, &race.category.slug)?);
                s.races.update::<ServerError, _>(&slug, |race| {
                    let now = Utc::now();
                    let outcome = actions::apply(race, &actor, &action, target.as_ref(), now)?;
                    Ok(Some(
                        outcome
                            .system_messages
                            .into_iter()
                            .map(|m| ChatMessage::system(m, now))
                            .collect(),
                    ))
                })
            })
            .await?;

        if let Some(committed) = committed {
            info!(version = committed.race.version, "race action applied");
            self.publish_committed(committed);
        }
        Ok(())
    }

    /// Post a chat message as `user`.
    #[instrument(skip(self, user, data), fields(race = %slug, user_id = %user.id))]
    pub async fn post_message(
        &self,
        slug: &RaceSlug,
        user: UserInfo,
        data: Option<Value>,
    ) -> Result<ChatMessage, ServerError> {
        let post = ChatPost::parse(data.as_ref())?;
        let slug_for_store = slug.clone();
        let message = self
            .blocking(move |s| {
                let slug = slug_for_store;
                let race = s.require_race(&slug)?;
                let now = Utc::now();
                let actor = Actor::new(user.clone(), s.can_moderate(&user, &race.category.slug)?);
                let message = ChatMessage::from_user(user, post, now);
                s.messages.insert_rate_limited(
                    &slug,
                    &message,
                    chat::rate_window_start(now),
                    |recent| chat::check_can_post(&race, &actor, recent, now).map_err(ServerError::from),
                )?;
                Ok(message)
            })
            .await?;
        debug!(message_id = %message.id, "chat message posted");
        self.publish(
            slug,
            ServerMessage::ChatMessage {
                message: message.clone(),
            },
        );
        Ok(message)
    }

    pub async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, ServerError> {
        self.blocking(move |s| Ok(s.tokens.purge_expired(now)?)).await
    }

    /// Advance every race the clock can move. Returns how many changed.
    pub async fn tick_all(&self, now: DateTime<Utc>) -> Result<usize, ServerError> {
        let changed = self
            .blocking(move |s| {
                let mut changed = Vec::new();
                for slug in s.races.needing_tick()? {
                    let result = s.races.update::<StoreError, _>(&slug, |race| {
                        Ok(actions::tick(race, now).map(|outcome| {
                            outcome
                                .system_messages
                                .into_iter()
                                .map(|m| ChatMessage::system(m, now))
                                .collect()
                        }))
                    });
                    match result {
                        Ok(Some(committed)) => changed.push(committed),
                        Ok(None) => {}
                        Err(e) => warn!(race = %slug, error = %e, "race tick failed"),
                    }
                }
                Ok(changed)
            })
            .await?;

        let count = changed.len();
        for committed in changed {
            info!(race = %committed.race.slug, state = %committed.race.state, "race advanced");
            self.publish_committed(committed);
        }
        Ok(count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use racetime_core::{CategoryInfo, RaceState};

    pub(crate) struct Fixture {
        pub service: Arc<RaceService>,
        pub race: Race,
        pub host: UserInfo,
        pub runner: UserInfo,
        pub db: Database,
    }

    pub(crate) async fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let stores = Stores::new(db.clone());
        stores
            .categories
            .create(&CategoryInfo {
                slug: CategorySlug::parse("ootr").unwrap(),
                name: "Ocarina of Time Randomizer".into(),
                short_name: "OoTR".into(),
                info: String::new(),
                active: true,
            })
            .unwrap();
        let host = stores.users.create("Host", false).unwrap();
        let runner = stores.users.create("Runner", false).unwrap();
        let service = Arc::new(RaceService::new(db.clone(), 64));
        let race = service
            .open_race(
                &CategorySlug::parse("ootr").unwrap(),
                Goal {
                    name: "Beat the game".into(),
                    custom: false,
                },
                Some(host.clone()),
            )
            .await
            .unwrap();
        Fixture {
            service,
            race,
            host,
            runner,
            db,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<RaceBroadcast>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.message);
        }
        out
    }

    #[tokio::test]
    async fn join_publishes_chat_then_race_data() {
        let f = fixture().await;
        let mut rx = f.service.subscribe();
        f.service
            .call_race_action(&f.race.slug, f.runner.clone(), "join", None)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert!(events.len() >= 2);
        assert!(events[0].is_system_chat());
        let ServerMessage::RaceData { race } = events.last().unwrap() else {
            panic!("expected race.data last, got {events:?}");
        };
        assert_eq!(race.entrants.len(), 1);

        let history = f.service.chat_history(&f.race.slug).await.unwrap();
        assert!(history.iter().all(|m| m.is_system));
        assert!(!history.is_empty());
    }

    #[tokio::test]
    async fn rejected_action_changes_nothing() {
        let f = fixture().await;
        let mut rx = f.service.subscribe();
        let err = f
            .service
            .call_race_action(&f.race.slug, f.runner.clone(), "cancel_race", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Action(_)));
        assert!(drain(&mut rx).is_empty());

        let race = f.service.find_race(&f.race.slug).await.unwrap().unwrap();
        assert_eq!(race.version, f.race.version);
    }

    #[tokio::test]
    async fn category_moderators_can_moderate() {
        let f = fixture().await;
        let stores = Stores::new(f.db.clone());
        stores
            .categories
            .add_moderator(&f.race.category.slug, &f.runner.id)
            .unwrap();
        f.service
            .call_race_action(&f.race.slug, f.runner.clone(), "cancel_race", None)
            .await
            .unwrap();
        let race = f.service.find_race(&f.race.slug).await.unwrap().unwrap();
        assert_eq!(race.state, RaceState::Cancelled);
    }

    #[tokio::test]
    async fn unknown_race_is_not_found() {
        let f = fixture().await;
        let err = f
            .service
            .call_race_action(
                &RaceSlug::parse("missing-race-0000").unwrap(),
                f.runner,
                "join",
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_is_stored_and_published() {
        let f = fixture().await;
        let mut rx = f.service.subscribe();
        let msg = f
            .service
            .post_message(
                &f.race.slug,
                f.runner.clone(),
                Some(serde_json::json!({"message": "  good luck  "})),
            )
            .await
            .unwrap();
        assert_eq!(msg.message, "good luck");
        assert_eq!(drain(&mut rx), vec![ServerMessage::ChatMessage { message: msg }]);

        let err = f
            .service
            .post_message(&f.race.slug, f.runner, Some(serde_json::json!({"message": ""})))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Action(_)));
    }

    #[tokio::test]
    async fn concurrent_posts_respect_rate_limit() {
        let f = fixture().await;
        let posts = (0..chat::RATE_LIMIT_COUNT + 10).map(|i| {
            let service = Arc::clone(&f.service);
            let slug = f.race.slug.clone();
            let user = f.runner.clone();
            tokio::spawn(async move {
                service
                    .post_message(&slug, user, Some(serde_json::json!({"message": format!("m{i}")})))
                    .await
                    .is_ok()
            })
        });
        let accepted = futures::future::join_all(posts)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(accepted, chat::RATE_LIMIT_COUNT);
        let history = f.service.chat_history(&f.race.slug).await.unwrap();
        assert_eq!(history.len(), chat::RATE_LIMIT_COUNT);
    }

    #[tokio::test]
    async fn tick_starts_pending_races() {
        let f = fixture().await;
        for user in [&f.runner, &f.host] {
            for action in ["join", "ready"] {
                f.service
                    .call_race_action(&f.race.slug, user.clone(), action, None)
                    .await
                    .unwrap();
            }
        }
        let race = f.service.find_race(&f.race.slug).await.unwrap().unwrap();
        assert_eq!(race.state, RaceState::Pending);

        assert_eq!(f.service.tick_all(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + Duration::seconds(60);
        assert_eq!(f.service.tick_all(later).await.unwrap(), 1);
        let race = f.service.find_race(&f.race.slug).await.unwrap().unwrap();
        assert_eq!(race.state, RaceState::InProgress);
    }

    #[tokio::test]
    async fn authentication_checks_scopes() {
        let f = fixture().await;
        let stores = Stores::new(f.db.clone());
        let token = Arc::new(
            stores
                .tokens
                .issue(&f.runner.id, "bot", &["chat_message"], Duration::hours(1))
                .unwrap(),
        );

        let state = f
            .service
            .authenticate(Some(Arc::clone(&token)), vec![ActionScope::ChatMessage])
            .await
            .unwrap();
        assert_eq!(state.user.as_ref(), Some(&f.runner));

        let state = f
            .service
            .authenticate(Some(Arc::clone(&token)), vec![ActionScope::RaceAction])
            .await
            .unwrap();
        assert!(!state.is_authenticated());

        assert_eq!(f.service.viewer(Some(token)).await.unwrap(), Some(f.runner));
        assert_eq!(f.service.viewer(None).await.unwrap(), None);
    }
}
