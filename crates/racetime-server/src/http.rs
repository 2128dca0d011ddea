//! HTTP handlers: the page contexts, race JSON and the race sockets.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, info, warn};

use racetime_core::auth::bearer_token;
use racetime_core::ids::{CategorySlug, RaceSlug};
use racetime_core::race::RaceData;
use racetime_core::views::{
    clamp_page, page_offset, CategorySummary, CategoryView, HomeView, RaceView, SortOrder,
    RACES_PER_PAGE,
};
use racetime_core::UserInfo;
use racetime_store::CategoryListing;

use crate::client::{ClientRegistry, HEARTBEAT_INTERVAL};
use crate::consumer::{ConsumerKind, RaceConsumer};
use crate::error::ServerError;
use crate::protocol::ServerMessage;
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub sort: Option<String>,
    pub page: Option<String>,
    pub token: Option<String>,
}

/// Bearer token from the `Authorization` header, else from `?token=`.
pub fn request_token(headers: &HeaderMap, query_token: Option<String>) -> Option<SecretString> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .or_else(|| {
            query_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from)
        })
}

async fn viewer(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<String>,
) -> Result<Option<UserInfo>, ServerError> {
    let token = request_token(headers, query_token).map(Arc::new);
    state.service.viewer(token).await
}

fn category_slug(raw: &str) -> Result<CategorySlug, ServerError> {
    CategorySlug::parse(raw).map_err(|_| ServerError::NotFound(format!("category {raw}")))
}

fn race_slug(raw: &str) -> Result<RaceSlug, ServerError> {
    RaceSlug::parse(raw).map_err(|_| ServerError::NotFound(format!("race {raw}")))
}

fn summaries(listings: Vec<CategoryListing>) -> Vec<CategorySummary> {
    listings
        .iter()
        .map(|l| CategorySummary::new(&l.category, l.current_races))
        .collect()
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "clients": state.registry.client_count(),
    }))
}

pub async fn home(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<HomeView>, ServerError> {
    let viewer = viewer(&state, &headers, query.token).await?;
    let show_recordable = viewer.as_ref().is_some_and(|u| u.is_staff);
    let sort = SortOrder::from_query(query.sort.as_deref(), show_recordable);

    let viewer_id = viewer.as_ref().map(|u| u.id.clone());
    let (categories, favourites) = state
        .service
        .blocking(move |s| {
            let categories = s.categories.list(sort)?;
            let favourites = match viewer_id {
                Some(id) => s.categories.favourites(&id, sort)?,
                None => Vec::new(),
            };
            Ok((categories, favourites))
        })
        .await?;

    Ok(Json(HomeView::build(
        &state.site,
        viewer.as_ref(),
        sort,
        show_recordable,
        summaries(categories),
        summaries(favourites),
    )))
}

pub async fn category(
    State(state): State<AppState>,
    Path(category): Path<String>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<CategoryView>, ServerError> {
    let slug = category_slug(&category)?;
    let viewer = viewer(&state, &headers, query.token).await?;

    let moderator_check = viewer.clone();
    let requested_page = query.page;
    let (info, can_moderate, current, past, page, past_total) = state
        .service
        .blocking(move |s| {
            let info = s.categories.get(&slug)?;
            if !info.active {
                return Err(ServerError::NotFound(format!("category {slug}")));
            }
            let can_moderate = match &moderator_check {
                Some(user) => s.can_moderate(user, &slug)?,
                None => false,
            };
            let current = s.races.list_current(&slug)?;
            let past_total = s.races.count_past(&slug)?;
            let page = clamp_page(requested_page.as_deref(), past_total);
            let past = s.races.list_past(&slug, page_offset(page), RACES_PER_PAGE)?;
            Ok((info, can_moderate, current, past, page, past_total))
        })
        .await?;

    Ok(Json(CategoryView::build(
        &state.site,
        viewer.as_ref(),
        &info,
        can_moderate,
        &current,
        &past,
        page,
        past_total,
        Utc::now(),
    )))
}

pub async fn race(
    State(state): State<AppState>,
    Path((category, race)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<RaceView>, ServerError> {
    let category = category_slug(&category)?;
    let slug = race_slug(&race)?;
    let viewer = viewer(&state, &headers, query.token).await?;

    let moderator_check = viewer.clone();
    let (race, can_moderate) = state
        .service
        .blocking(move |s| {
            let race = s
                .races
                .find(&slug)?
                .filter(|r| r.category.slug == category)
                .ok_or_else(|| ServerError::NotFound(format!("race {category}/{slug}")))?;
            let can_moderate = match &moderator_check {
                Some(user) => s.can_moderate(user, &category)?,
                None => false,
            };
            Ok((race, can_moderate))
        })
        .await?;

    Ok(Json(RaceView::build(
        &state.site,
        viewer.as_ref(),
        &race,
        can_moderate,
        Utc::now(),
    )))
}

pub async fn race_data(
    State(state): State<AppState>,
    Path((category, race)): Path<(String, String)>,
) -> Result<Json<RaceData>, ServerError> {
    let category = category_slug(&category)?;
    let slug = race_slug(&race)?;
    state
        .service
        .find_race(&slug)
        .await?
        .filter(|r| r.category.slug == category)
        .map(|r| Json(r.to_data(Utc::now())))
        .ok_or_else(|| ServerError::NotFound(format!("race {category}/{slug}")))
}

pub async fn ws_public(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(race): Path<String>,
) -> Result<Response, ServerError> {
    upgrade(ws, state, ConsumerKind::Public, &race, None).await
}

pub async fn ws_oauth(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(race): Path<String>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Response, ServerError> {
    let token = request_token(&headers, query.token);
    upgrade(ws, state, ConsumerKind::OAuth, &race, token).await
}

/// Refuse unknown races with a 404 before the handshake completes.
async fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    kind: ConsumerKind,
    race: &str,
    token: Option<SecretString>,
) -> Result<Response, ServerError> {
    let slug = race_slug(race)?;
    let consumer = RaceConsumer::connect(Arc::clone(&state.service), kind, slug, token)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("race {race}")))?;
    let registry = Arc::clone(&state.registry);
    Ok(ws.on_upgrade(move |socket| handle_race_socket(socket, consumer, registry)))
}

async fn send_frame<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), axum::Error>
where
    S: SinkExt<WsMessage, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(WsMessage::Text(json.into())).await,
        Err(e) => {
            warn!(event = msg.event_type(), error = %e, "failed to serialise frame");
            Ok(())
        }
    }
}

/// Run one race socket until either side goes away.
pub async fn handle_race_socket(
    socket: WebSocket,
    mut consumer: RaceConsumer,
    registry: Arc<ClientRegistry>,
) {
    let (client, mut rx) = registry.register();
    let slug = consumer.slug().clone();
    registry.group_add(&slug, &client.id);
    info!(client_id = %client.id, race = %slug, kind = ?consumer.kind(), "race socket connected");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    if send_frame(&mut sink, &consumer.greeting()).await.is_ok() {
        'conn: loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        client.mark_alive();
                        for reply in consumer.receive(text.as_str()).await {
                            if send_frame(&mut sink, &reply).await.is_err() {
                                break 'conn;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => client.mark_alive(),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id = %client.id, error = %e, "socket read failed");
                        break;
                    }
                },
                event = rx.recv() => {
                    // `None` once the registry has dropped this client.
                    let Some(event) = event else { break };
                    let event = consumer.on_group_event(event).await;
                    if send_frame(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    registry.group_discard(&slug, &client.id);
    registry.unregister(&client.id);
    info!(client_id = %client.id, race = %slug, "race socket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use secrecy::ExposeSecret;

    #[test]
    fn header_token_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        let token = request_token(&headers, Some("xyz".into())).unwrap();
        assert_eq!(token.expose_secret(), "abc");
    }

    #[test]
    fn query_token_fallback() {
        let headers = HeaderMap::new();
        let token = request_token(&headers, Some("xyz".into())).unwrap();
        assert_eq!(token.expose_secret(), "xyz");
        assert!(request_token(&headers, Some(String::new())).is_none());
        assert!(request_token(&headers, None).is_none());
    }

    #[test]
    fn bad_slugs_are_not_found() {
        assert_eq!(
            category_slug("Not A Slug!").unwrap_err().status(),
            axum::http::StatusCode::NOT_FOUND
        );
        assert!(race_slug("quick-map-0001").is_ok());
    }
}
