use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use serenity::client::Client;
use serenity::http::Http;
use serenity::model::id::UserId;
use serenity::prelude::GatewayIntents;
use songbird::{SerenityInit, Songbird};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use groove_bot::ack::AckChannel;
use groove_bot::discord::{Bot, DiscordAckChannel, QueueRenderer, SongbirdTransport, YtdlResolver};
use groove_bot::models::DEFAULT_PAGE_LIMIT;
use groove_bot::player::PlaybackEngine;
use groove_bot::registry::GuildRegistry;
use groove_bot::render::Renderer;
use groove_bot::store::{MemoryStore, PersistentStore};
use groove_bot::transaction::Coordinator;

const DEFAULT_INACTIVE_TTL_SECONDS: u64 = 3600;

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    let _ = dotenv();

    tracing_subscriber::fmt::init();

    let token = env::var("DISCORD_TOKEN").expect("Expected a token in the environment");
    let client_id = UserId(
        env::var("DISCORD_CLIENT_ID")
            .expect("Expected the application id in the environment")
            .parse()
            .expect("DISCORD_CLIENT_ID must be a numeric id"),
    );
    let inactive_ttl = Duration::from_secs(
        env_i64(
            "INACTIVE_SONG_TTL_SECONDS",
            DEFAULT_INACTIVE_TTL_SECONDS as i64,
        )
        .max(1) as u64,
    );
    let page_limit = env_i64("QUEUE_PAGE_LIMIT", DEFAULT_PAGE_LIMIT);

    let manager = Songbird::serenity();
    let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(GuildRegistry::new());
    let voice = Arc::new(SongbirdTransport::new(Arc::clone(&manager)));
    let resolver = Arc::new(YtdlResolver);
    let ack: Arc<dyn AckChannel> = Arc::new(DiscordAckChannel::new(Arc::new(Http::new(&token))));
    let renderer: Arc<dyn Renderer> = Arc::new(QueueRenderer);
    let (ready_tx, ready_rx) = watch::channel(false);
    let cancel = CancellationToken::new();

    let coordinator = Arc::new(Coordinator::new(
        client_id,
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&voice),
        Arc::clone(&ack),
        Arc::clone(&renderer),
        ready_rx,
        cancel.clone(),
    ));
    let engine = Arc::new(PlaybackEngine::new(
        client_id,
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&voice),
        resolver,
        Arc::clone(&coordinator),
        cancel.clone(),
    ));

    let bot = Bot {
        client_id,
        store,
        registry,
        voice,
        renderer,
        ack,
        coordinator,
        engine,
        page_limit,
        inactive_ttl,
        cancel: cancel.clone(),
        ready_tx,
        janitor_started: AtomicBool::new(false),
    };

    let intents = GatewayIntents::non_privileged();

    let mut client = Client::builder(&token, intents)
        .event_handler(bot)
        .register_songbird_with(manager)
        .await
        .expect("Err creating client");

    tokio::spawn(async move {
        let _ = client
            .start()
            .await
            .map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");
    cancel.cancel();
}
