//! Per-connection race consumers.
//!
//! A consumer is bound to one race. It caches the latest race snapshot,
//! answers frames from its own client, and relays race group events.
//! Methods return the frames to send instead of writing to the socket, so
//! the socket loop in [`crate::http`] stays a thin shell.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, error, warn};

use racetime_core::actions::ActionScope;
use racetime_core::ids::RaceSlug;
use racetime_core::race::RaceData;

use crate::error::ServerError;
use crate::protocol::{
    ClientRequest, ServerMessage, INTERNAL_ERROR, INVALID_DATA, NO_HISTORY, PERMISSION_DENIED,
    UNKNOWN_ACTION,
};
use crate::service::RaceService;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Spectators. Incoming frames are ignored.
    Public,
    /// Bots and the race page, acting with an OAuth token.
    OAuth,
}

pub struct RaceConsumer {
    kind: ConsumerKind,
    slug: RaceSlug,
    race: RaceData,
    token: Option<Arc<SecretString>>,
    service: Arc<RaceService>,
}

impl RaceConsumer {
    /// Bind to `slug`. `Ok(None)` means the race does not exist and the
    /// connection should be refused.
    pub async fn connect(
        service: Arc<RaceService>,
        kind: ConsumerKind,
        slug: RaceSlug,
        token: Option<SecretString>,
    ) -> Result<Option<Self>, ServerError> {
        let Some(race) = service.race_data(&slug).await? else {
            return Ok(None);
        };
        Ok(Some(Self {
            kind,
            slug,
            race,
            token: token.map(Arc::new),
            service,
        }))
    }

    pub fn slug(&self) -> &RaceSlug {
        &self.slug
    }

    pub fn kind(&self) -> ConsumerKind {
        self.kind
    }

    /// First frame after the socket is accepted.
    pub fn greeting(&self) -> ServerMessage {
        ServerMessage::race(self.race.clone())
    }

    /// Handle a text frame from the client.
    pub async fn receive(&mut self, text: &str) -> Vec<ServerMessage> {
        if self.kind == ConsumerKind::Public {
            return Vec::new();
        }
        let request = match ClientRequest::parse(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(race = %self.slug, error = %e, "undecodable frame");
                return vec![ServerMessage::error(INVALID_DATA)];
            }
        };
        let action = request.action.as_deref().unwrap_or_default();

        match action {
            "getrace" => return vec![self.greeting()],
            "gethistory" => return vec![self.history().await],
            "ping" => return vec![ServerMessage::Pong],
            _ => {}
        }

        let Some(scope) = ActionScope::for_action(action) else {
            return vec![ServerMessage::error(UNKNOWN_ACTION)];
        };
        let state = match self
            .service
            .authenticate(self.token.clone(), vec![scope])
            .await
        {
            Ok(state) => state,
            Err(e) => return vec![self.failure(e)],
        };
        let Some(user) = state.user else {
            return vec![ServerMessage::error(PERMISSION_DENIED)];
        };

        let result = match scope {
            ActionScope::ChatMessage => self
                .service
                .post_message(&self.slug, user, request.data)
                .await
                .map(|_| ()),
            ActionScope::RaceAction => {
                self.service
                    .call_race_action(&self.slug, user, action, request.data)
                    .await
            }
        };
        match result {
            // Success shows up as group events.
            Ok(()) => Vec::new(),
            Err(e) => vec![self.failure(e)],
        }
    }

    /// Handle an event published to this consumer's race group.
    pub async fn on_group_event(&mut self, message: ServerMessage) -> ServerMessage {
        match &message {
            ServerMessage::RaceData { race } => self.race = (**race).clone(),
            _ if message.is_system_chat() => self.reload().await,
            _ => {}
        }
        message
    }

    async fn reload(&mut self) {
        match self.service.race_data(&self.slug).await {
            Ok(Some(race)) => self.race = race,
            Ok(None) => warn!(race = %self.slug, "race vanished while connected"),
            Err(e) => error!(race = %self.slug, error = %e, "failed to reload race"),
        }
    }

    async fn history(&self) -> ServerMessage {
        match self.service.chat_history(&self.slug).await {
            Ok(messages) if !messages.is_empty() => ServerMessage::ChatHistory { messages },
            Ok(_) => ServerMessage::error(NO_HISTORY),
            Err(e) => {
                error!(race = %self.slug, error = %e, "failed to load chat history");
                ServerMessage::error(NO_HISTORY)
            }
        }
    }

    fn failure(&self, e: ServerError) -> ServerMessage {
        match e {
            ServerError::Action(e) => ServerMessage::Error {
                errors: e.messages(),
            },
            other => {
                error!(race = %self.slug, error = %other, "race action failed");
                ServerMessage::error(INTERNAL_ERROR)
            }
        }
    }
}
