use std::sync::Arc;

use anyhow::Context;
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod crypto;
mod db;
mod error;
mod models;
mod server;
mod services;
mod time;

use crate::config::AppConfig;
use crate::crypto::PasswordCipher;
use crate::db::{Database, IdAllocator, Store};
use crate::models::{MessageType, Sender};
use crate::server::ExchangeContext;
use crate::services::journal::Journal;
use crate::services::matching::MatchingEngine;
use crate::services::session::{SessionController, SessionState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bourse_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        anyhow::bail!("usage: bourse-server [init|reset|reset_prices|play]");
    };

    let launch_ms = time::now_ms();
    let db = Database::connect(&config.database_url)
        .await
        .context("failed to open database")?;

    match command.as_str() {
        "init" => init(&db, launch_ms).await,
        "reset" => reset(&db).await,
        "reset_prices" => {
            db.reset_prices(time::date_part(launch_ms), time::intraday_part(launch_ms))
                .await?;
            tracing::info!("price history truncated to latest ticks");
            Ok(())
        }
        "play" => play(config, db, launch_ms).await,
        other => anyhow::bail!("unknown command {other:?}: use init, reset, reset_prices or play"),
    }
}

/// Seed the hand-made starter market: two securities, two clients.
async fn init(db: &Database, launch_ms: i64) -> anyhow::Result<()> {
    let store = db.store();
    let cipher = load_or_create_cipher(&store).await?;
    let (date, intraday) = (time::date_part(launch_ms), time::intraday_part(launch_ms));

    store.upsert_action(1, "CAC40", 20).await?;
    store.append_price(1, Decimal::from(10), date, intraday).await?;
    store.upsert_action(2, "SP500", 10).await?;
    store.append_price(2, Decimal::from(20), date, intraday).await?;

    let blob = cipher.encrypt("123")?;
    store.insert_client(1, "Client1", &blob, Decimal::from(1000), &[]).await?;
    store
        .insert_client(2, "Client2", &blob, Decimal::from(100), &[(1, 20), (2, 10)])
        .await?;

    tracing::info!("seeded 2 actions and 2 clients");
    Ok(())
}

/// Wipe the database and regenerate the encryption key material.
async fn reset(db: &Database) -> anyhow::Result<()> {
    db.reset().await?;
    load_or_create_cipher(&db.store()).await?;
    tracing::info!("database reset");
    Ok(())
}

async fn play(config: AppConfig, db: Database, launch_ms: i64) -> anyhow::Result<()> {
    let store = db.store();
    let cipher = Arc::new(load_or_create_cipher(&store).await?);
    let ids = Arc::new(IdAllocator::load(&store).await?);
    let journal = Journal::new(store.clone(), ids.clone());
    let engine = Arc::new(MatchingEngine::new(store.clone(), ids.clone(), journal.clone()));

    let rebuilt = engine.rebuild_books().await?;
    if rebuilt > 0 {
        tracing::info!(rebuilt, "pending market orders restored into the books");
    }
    engine.seed_last_prices().await?;

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    tracing::info!("waiting for connections on {}", config.bind_addr());
    tracing::info!("initial market state: {}", server::market_report(&store).await?);

    journal
        .record_at(0, Sender::Server, MessageType::ServerRestart, "Server launched", launch_ms)
        .await;

    let state = Arc::new(SessionState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = SessionController::new(
        config.clone(),
        engine.clone(),
        journal.clone(),
        state.clone(),
        shutdown_tx,
    );
    let session = tokio::spawn(controller.run());

    let ctx = ExchangeContext {
        store: store.clone(),
        ids,
        journal: journal.clone(),
        engine,
        session: state,
        cipher,
        process_delay_ms: config.process_delay_ms,
    };
    server::serve(listener, ctx, shutdown_rx).await;
    session.await.ok();

    tracing::info!("market session ended, closing all client connections");
    journal.record(0, Sender::Server, MessageType::ServerShutdown, "Server shutdown").await;

    // Balance the audit log: clients still marked connected at shutdown get
    // synthetic disconnect entries.
    for client_id in store.unbalanced_connected_clients(launch_ms).await? {
        journal
            .record(client_id, Sender::Server, MessageType::ClientDisconnected, "Client disconnected")
            .await;
    }

    for message in store.list_messages().await? {
        tracing::info!("{message}");
    }
    Ok(())
}

/// Fetch the persisted key/nonce pair, generating and storing one if absent
/// or malformed.
async fn load_or_create_cipher(store: &Store) -> anyhow::Result<PasswordCipher> {
    if let Some((key, iv)) = store.encryption_parts().await? {
        if key.len() == crypto::KEY_SIZE && iv.len() == crypto::NONCE_SIZE {
            return Ok(PasswordCipher::from_parts(&key, &iv)?);
        }
        tracing::warn!("stored key material malformed, regenerating");
    }
    let (key, iv) = PasswordCipher::generate_parts();
    store.insert_encryption_parts(&key, &iv).await?;
    Ok(PasswordCipher::from_parts(&key, &iv)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cipher_lifecycle_is_stable() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let store = db.store();

        let first = load_or_create_cipher(&store).await.unwrap();
        let second = load_or_create_cipher(&store).await.unwrap();
        // Same persisted key material: same ciphertext for the same password.
        assert_eq!(first.encrypt("123").unwrap(), second.encrypt("123").unwrap());
    }

    #[tokio::test]
    async fn test_init_seeds_starter_market() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        init(&db, 1_000_000).await.unwrap();

        let store = db.store();
        let actions = store.list_actions().await.unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name, "CAC40");
        assert_eq!(store.balance(1).await.unwrap(), Decimal::from(1000));
        assert_eq!(store.holding_quantity(2, 1).await.unwrap(), 20);
        assert_eq!(store.holding_quantity(2, 2).await.unwrap(), 10);
        assert_eq!(store.market_value().await.unwrap(), Decimal::from(400));

        // Credentials seeded with the stored cipher authenticate.
        let cipher = load_or_create_cipher(&store).await.unwrap();
        let blob = cipher.encrypt("123").unwrap();
        assert_eq!(
            store.client_id_by_name_and_password("Client1", &blob).await.unwrap(),
            Some(1)
        );
    }
}
