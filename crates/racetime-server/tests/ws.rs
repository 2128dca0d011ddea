use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use racetime_core::ids::CategorySlug;
use racetime_core::{CategoryInfo, Goal, Race, UserInfo};
use racetime_server::{start, ServerConfig, ServerHandle};
use racetime_store::{CategoryRepo, Database, TokenRepo, UserRepo};

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Site {
    handle: ServerHandle,
    race: Race,
    runner: UserInfo,
    token: SecretString,
}

impl Site {
    fn http(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.handle.port())
    }

    fn ws(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}{path}", self.handle.port())
    }
}

async fn site() -> Site {
    let db = Database::in_memory().unwrap();
    let ootr = CategoryInfo {
        slug: CategorySlug::parse("ootr").unwrap(),
        name: "Ocarina of Time Randomizer".into(),
        short_name: "OoTR".into(),
        info: String::new(),
        active: true,
    };
    CategoryRepo::new(db.clone()).create(&ootr).unwrap();
    let users = UserRepo::new(db.clone());
    let host = users.create("Host", false).unwrap();
    let runner = users.create("Runner", false).unwrap();
    let token = TokenRepo::new(db.clone())
        .issue(
            &runner.id,
            "test-bot",
            &["race_action", "chat_message"],
            ChronoDuration::hours(1),
        )
        .unwrap();

    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let handle = start(config, db).await.unwrap();
    let race = handle
        .service()
        .open_race(
            &ootr.slug,
            Goal {
                name: "Beat the game".into(),
                custom: false,
            },
            Some(host),
        )
        .await
        .unwrap();

    Site {
        handle,
        race,
        runner,
        token,
    }
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn pages_render_seeded_data() {
    let site = site().await;

    let home: Value = reqwest::get(site.http("/")).await.unwrap().json().await.unwrap();
    assert_eq!(home["categories"][0]["slug"], "ootr");

    let category: Value = reqwest::get(site.http("/ootr")).await.unwrap().json().await.unwrap();
    assert_eq!(category["current_races"].as_array().unwrap().len(), 1);
    assert_eq!(category["past_races_placeholder"], "No completed races in this category.");

    let page = site.http(&format!("/ootr/{}", site.race.slug));
    let view: Value = reqwest::Client::new()
        .get(&page)
        .bearer_auth(site.token.expose_secret())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["user"]["name"], "Runner");
    assert_eq!(
        view["js_vars"]["websocket_oauth_url"],
        format!("/ws/o/race/{}", site.race.slug)
    );

    let data: Value = reqwest::get(format!("{page}/data"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(data["name"], format!("ootr/{}", site.race.slug));
    assert_eq!(data["status"]["value"], "open");

    let wrong_category = site.http(&format!("/other/{}", site.race.slug));
    assert_eq!(reqwest::get(wrong_category).await.unwrap().status(), 404);

    site.handle.shutdown();
}

#[tokio::test]
async fn unknown_race_socket_is_refused() {
    let site = site().await;
    let result = tokio_tungstenite::connect_async(site.ws("/ws/race/no-such-race-0000")).await;
    assert!(result.is_err());
    site.handle.shutdown();
}

#[tokio::test]
async fn actions_reach_every_watcher() {
    let site = site().await;
    let slug = site.race.slug.to_string();

    let (mut spectator, _) = tokio_tungstenite::connect_async(site.ws(&format!("/ws/race/{slug}")))
        .await
        .unwrap();
    let hello = next_json(&mut spectator).await;
    assert_eq!(hello["type"], "race.data");
    assert_eq!(hello["race"]["entrants_count"], 0);

    let bot_url = site.ws(&format!(
        "/ws/o/race/{slug}?token={}",
        site.token.expose_secret()
    ));
    let (mut bot, _) = tokio_tungstenite::connect_async(bot_url).await.unwrap();
    assert_eq!(next_json(&mut bot).await["type"], "race.data");

    send(&mut bot, json!({"action": "ping"})).await;
    assert_eq!(next_json(&mut bot).await["type"], "pong");

    send(&mut bot, json!({"action": "join"})).await;
    let joined = next_json(&mut spectator).await;
    assert_eq!(joined["type"], "chat.message");
    assert_eq!(joined["message"]["is_system"], true);
    assert_eq!(joined["message"]["message"], format!("{} joins.", site.runner.name));
    let update = next_json(&mut spectator).await;
    assert_eq!(update["type"], "race.data");
    assert_eq!(update["race"]["entrants_count"], 1);

    send(&mut bot, json!({"action": "message", "data": {"message": "glhf"}})).await;
    // The bot sees its own join broadcast first.
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next_json(&mut bot).await);
    }
    assert!(seen
        .iter()
        .any(|f| f["type"] == "chat.message" && f["message"]["message"] == "glhf"));

    send(&mut bot, json!({"action": "join"})).await;
    let err = next_json(&mut bot).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["errors"][0], "You are already an entrant.");

    site.handle.shutdown();
}

#[tokio::test]
async fn public_socket_cannot_act() {
    let site = site().await;
    let url = site.ws(&format!("/ws/race/{}", site.race.slug));
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    next_json(&mut socket).await;

    send(&mut socket, json!({"action": "join"})).await;
    let quiet = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(quiet.is_err(), "public sockets must not answer frames");

    let data: Value = reqwest::get(site.http(&format!("/ootr/{}/data", site.race.slug)))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(data["entrants_count"], 0);
    site.handle.shutdown();
}

#[tokio::test]
async fn oauth_socket_without_token_is_denied() {
    let site = site().await;
    let url = site.ws(&format!("/ws/o/race/{}", site.race.slug));
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    next_json(&mut socket).await;

    send(&mut socket, json!({"action": "join"})).await;
    let err = next_json(&mut socket).await;
    assert_eq!(
        err["errors"][0],
        "Permission denied, you may need to re-authorise this application."
    );

    socket.send(Message::Text("not json".into())).await.unwrap();
    let err = next_json(&mut socket).await;
    assert_eq!(err["type"], "error");
    site.handle.shutdown();
}
