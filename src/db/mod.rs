//! SQLite system-of-record.
//!
//! The pool is capped at one connection so store mutations serialize on the
//! database side; the core treats every adapter call as a single synchronous
//! statement.

mod store;

pub use store::{IdAllocator, IdSeeds, MarketOrderRow, Store};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

const TABLES: &[&str] = &[
    "clients",
    "client_portfolio",
    "actions",
    "prices",
    "orders",
    "messages",
    "encryption_keys",
];

impl Database {
    /// Open (creating if needed) the database and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    pub fn store(&self) -> Store {
        Store::new(self.pool.clone())
    }

    async fn create_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS clients (
                client_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                encrypted_password BLOB NOT NULL,
                balance TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS client_portfolio (
                client_id INTEGER NOT NULL,
                action_id INTEGER NOT NULL,
                quantity INTEGER NOT NULL,
                PRIMARY KEY (client_id, action_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS actions (
                action_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                quantity INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prices (
                action_id INTEGER NOT NULL,
                price TEXT NOT NULL,
                date_time INTEGER NOT NULL,
                daily_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id INTEGER PRIMARY KEY,
                client_id INTEGER NOT NULL,
                action_id INTEGER NOT NULL,
                order_type TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT,
                trigger_price_lower TEXT NOT NULL,
                trigger_price_upper TEXT,
                order_time_date INTEGER NOT NULL,
                order_time_daily INTEGER NOT NULL,
                expiration_time_date INTEGER,
                expiration_time_daily INTEGER NOT NULL,
                order_status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id INTEGER PRIMARY KEY,
                client_id INTEGER NOT NULL,
                sender TEXT NOT NULL,
                message_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                date_time INTEGER NOT NULL,
                daily_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS encryption_keys (
                key BLOB NOT NULL,
                iv BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Wipe everything and recreate the schema.
    pub async fn reset(&self) -> Result<(), sqlx::Error> {
        for table in TABLES {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await?;
        }
        self.create_schema().await
    }

    /// Truncate each security's price history to its latest tick, restamped
    /// at the given time.
    pub async fn reset_prices(&self, date_part: i64, intraday_part: i64) -> Result<(), sqlx::Error> {
        let store = self.store();
        for action in store.list_actions().await? {
            let last = store.last_price(action.action_id).await?;
            sqlx::query("DELETE FROM prices WHERE action_id = ?")
                .bind(action.action_id)
                .execute(&self.pool)
                .await?;
            if let Some(tick) = last {
                store
                    .append_price(action.action_id, tick.price, date_part, intraday_part)
                    .await?;
            }
        }
        Ok(())
    }
}
