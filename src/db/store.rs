//! Narrow persistence capability used by the core.
//!
//! Every mutation is one statement from the caller's point of view; failures
//! surface as `sqlx::Error` and are mapped by the caller's error policy.
//! Monetary values are stored as decimal text.

use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::models::{
    Action, Client, Holding, Message, MessageType, Order, OrderStatus, Price, PriceTick, Sender,
    Side, Trigger,
};
use crate::time::MS_PER_DAY;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Pending-order row joined with client and action names, for the market
/// report.
#[derive(Debug, Clone)]
pub struct MarketOrderRow {
    pub order_date: i64,
    pub order_intraday: i64,
    pub client_name: String,
    pub side: Side,
    pub quantity: i64,
    pub action_name: String,
    pub trigger: Trigger,
    pub price: Price,
    pub trigger_price_lower: Decimal,
    pub trigger_price_upper: Option<Decimal>,
    pub expiration_date: Option<i64>,
    pub expiration_intraday: i64,
}

impl MarketOrderRow {
    pub fn report_row(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {}",
            crate::time::format_parts(self.order_date, self.order_intraday),
            self.client_name,
            self.side,
            self.quantity,
            self.action_name,
            self.trigger,
            self.price,
            self.trigger_price_lower,
            self.trigger_price_upper
                .map(|u| u.to_string())
                .unwrap_or_else(|| "-".to_string()),
            match self.expiration_date {
                None => "GTC".to_string(),
                Some(date) => crate::time::format_parts(date, self.expiration_intraday),
            },
        )
    }
}

fn parse_dec(raw: &str) -> Result<Decimal, sqlx::Error> {
    raw.parse::<Decimal>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn decode_err(what: &str, raw: &str) -> sqlx::Error {
    sqlx::Error::Decode(format!("unrecognized {what}: {raw}").into())
}

type OrderRow = (
    i64,            // order_id
    i64,            // client_id
    i64,            // action_id
    String,         // order_type
    String,         // trigger_type
    i64,            // quantity
    Option<String>, // price (NULL for market)
    String,         // trigger_price_lower
    Option<String>, // trigger_price_upper
    i64,            // order_time_date
    i64,            // order_time_daily
    Option<i64>,    // expiration_time_date
    i64,            // expiration_time_daily
    String,         // order_status
);

fn order_from_row(row: OrderRow) -> Result<Order, sqlx::Error> {
    let (
        order_id,
        client_id,
        action_id,
        side,
        trigger,
        quantity,
        price,
        lower,
        upper,
        order_date,
        order_intraday,
        expiration_date,
        expiration_intraday,
        status,
    ) = row;
    Ok(Order {
        order_id,
        client_id,
        action_id,
        side: Side::parse(&side).ok_or_else(|| decode_err("order_type", &side))?,
        trigger: Trigger::parse(&trigger).ok_or_else(|| decode_err("trigger_type", &trigger))?,
        quantity,
        price: match price {
            None => Price::Market,
            Some(raw) => Price::Limit(parse_dec(&raw)?),
        },
        trigger_price_lower: parse_dec(&lower)?,
        trigger_price_upper: upper.as_deref().map(parse_dec).transpose()?,
        order_date,
        order_intraday,
        expiration_date,
        expiration_intraday,
        status: match status.as_str() {
            "PENDING" => OrderStatus::Pending,
            "COMPLETED" => OrderStatus::Completed,
            other => return Err(decode_err("order_status", other)),
        },
    })
}

const ORDER_COLUMNS: &str = "order_id, client_id, action_id, order_type, trigger_type, quantity, \
     price, trigger_price_lower, trigger_price_upper, order_time_date, order_time_daily, \
     expiration_time_date, expiration_time_daily, order_status";

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Encryption key lifecycle
    // ========================================================================

    pub async fn encryption_parts(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, sqlx::Error> {
        sqlx::query_as::<_, (Vec<u8>, Vec<u8>)>("SELECT key, iv FROM encryption_keys LIMIT 1")
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn insert_encryption_parts(&self, key: &[u8], iv: &[u8]) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO encryption_keys (key, iv) VALUES (?, ?)")
            .bind(key)
            .bind(iv)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Clients
    // ========================================================================

    pub async fn get_client(&self, client_id: i64) -> Result<Option<Client>, sqlx::Error> {
        let row: Option<(i64, String, String)> =
            sqlx::query_as("SELECT client_id, name, balance FROM clients WHERE client_id = ?")
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(client_id, name, balance)| {
            Ok(Client { client_id, name, balance: parse_dec(&balance)? })
        })
        .transpose()
    }

    pub async fn client_exists(&self, client_id: i64) -> Result<bool, sqlx::Error> {
        Ok(self.get_client(client_id).await?.is_some())
    }

    pub async fn client_id_by_name(&self, name: &str) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT client_id FROM clients WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn client_id_by_name_and_password(
        &self,
        name: &str,
        encrypted_password: &[u8],
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT client_id FROM clients WHERE name = ? AND encrypted_password = ?")
            .bind(name)
            .bind(encrypted_password)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn insert_client(
        &self,
        client_id: i64,
        name: &str,
        encrypted_password: &[u8],
        balance: Decimal,
        portfolio: &[(i64, i64)],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO clients (client_id, name, encrypted_password, balance) VALUES (?, ?, ?, ?)",
        )
        .bind(client_id)
        .bind(name)
        .bind(encrypted_password)
        .bind(balance.to_string())
        .execute(&self.pool)
        .await?;

        for (action_id, quantity) in portfolio {
            sqlx::query(
                "INSERT INTO client_portfolio (client_id, action_id, quantity) VALUES (?, ?, ?)",
            )
            .bind(client_id)
            .bind(action_id)
            .bind(quantity)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Remove a client; cascades through its portfolio and orders.
    pub async fn delete_client(&self, client_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM clients WHERE client_id = ?")
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM client_portfolio WHERE client_id = ?")
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM orders WHERE client_id = ?")
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn balance(&self, client_id: i64) -> Result<Decimal, sqlx::Error> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT balance FROM clients WHERE client_id = ?")
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?;
        match raw {
            Some(raw) => parse_dec(&raw),
            None => Err(sqlx::Error::RowNotFound),
        }
    }

    pub async fn credit_balance(&self, client_id: i64, amount: Decimal) -> Result<(), sqlx::Error> {
        let balance = self.balance(client_id).await?;
        sqlx::query("UPDATE clients SET balance = ? WHERE client_id = ?")
            .bind((balance + amount).to_string())
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn debit_balance(&self, client_id: i64, amount: Decimal) -> Result<(), sqlx::Error> {
        self.credit_balance(client_id, -amount).await
    }

    pub async fn holdings(&self, client_id: i64) -> Result<Vec<Holding>, sqlx::Error> {
        let rows: Vec<(i64, String, i64)> = sqlx::query_as(
            "SELECT p.action_id, a.name, p.quantity \
             FROM client_portfolio p JOIN actions a ON p.action_id = a.action_id \
             WHERE p.client_id = ? ORDER BY p.action_id",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(action_id, action_name, quantity)| Holding { action_id, action_name, quantity })
            .collect())
    }

    pub async fn holding_quantity(
        &self,
        client_id: i64,
        action_id: i64,
    ) -> Result<i64, sqlx::Error> {
        let quantity: Option<i64> = sqlx::query_scalar(
            "SELECT quantity FROM client_portfolio WHERE client_id = ? AND action_id = ?",
        )
        .bind(client_id)
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(quantity.unwrap_or(0))
    }

    pub async fn adjust_holding(
        &self,
        client_id: i64,
        action_id: i64,
        delta: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO client_portfolio (client_id, action_id, quantity) VALUES (?, ?, ?) \
             ON CONFLICT (client_id, action_id) DO UPDATE SET quantity = quantity + ?",
        )
        .bind(client_id)
        .bind(action_id)
        .bind(delta)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Actions
    // ========================================================================

    pub async fn get_action(&self, action_id: i64) -> Result<Option<Action>, sqlx::Error> {
        let row: Option<(i64, String, i64)> =
            sqlx::query_as("SELECT action_id, name, quantity FROM actions WHERE action_id = ?")
                .bind(action_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(action_id, name, quantity)| Action { action_id, name, quantity }))
    }

    pub async fn action_exists(&self, action_id: i64) -> Result<bool, sqlx::Error> {
        Ok(self.get_action(action_id).await?.is_some())
    }

    pub async fn action_by_name(&self, name: &str) -> Result<Option<Action>, sqlx::Error> {
        let row: Option<(i64, String, i64)> =
            sqlx::query_as("SELECT action_id, name, quantity FROM actions WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(action_id, name, quantity)| Action { action_id, name, quantity }))
    }

    /// Insert a security, or add shares to an existing one.
    pub async fn upsert_action(
        &self,
        action_id: i64,
        name: &str,
        quantity: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO actions (action_id, name, quantity) VALUES (?, ?, ?) \
             ON CONFLICT (action_id) DO UPDATE SET quantity = quantity + ?",
        )
        .bind(action_id)
        .bind(name)
        .bind(quantity)
        .bind(quantity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a security; cascades through prices, orders, and portfolios.
    pub async fn delete_action(&self, action_id: i64) -> Result<(), sqlx::Error> {
        for table in ["actions", "prices", "orders", "client_portfolio"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE action_id = ?"))
                .bind(action_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn list_actions(&self) -> Result<Vec<Action>, sqlx::Error> {
        let rows: Vec<(i64, String, i64)> =
            sqlx::query_as("SELECT action_id, name, quantity FROM actions ORDER BY action_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(action_id, name, quantity)| Action { action_id, name, quantity })
            .collect())
    }

    pub async fn append_price(
        &self,
        action_id: i64,
        price: Decimal,
        date_part: i64,
        intraday_part: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO prices (action_id, price, date_time, daily_time) VALUES (?, ?, ?, ?)")
            .bind(action_id)
            .bind(price.to_string())
            .bind(date_part)
            .bind(intraday_part)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_price(&self, action_id: i64) -> Result<Option<PriceTick>, sqlx::Error> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT price, date_time, daily_time FROM prices WHERE action_id = ? \
             ORDER BY date_time DESC, daily_time DESC LIMIT 1",
        )
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(price, date_part, intraday_part)| {
            Ok(PriceTick { price: parse_dec(&price)?, date_part, intraday_part })
        })
        .transpose()
    }

    /// Sum over securities of outstanding shares times last price.
    pub async fn market_value(&self) -> Result<Decimal, sqlx::Error> {
        let mut total = Decimal::ZERO;
        for action in self.list_actions().await? {
            if let Some(tick) = self.last_price(action.action_id).await? {
                total += tick.price * Decimal::from(action.quantity);
            }
        }
        Ok(total)
    }

    // ========================================================================
    // Orders
    // ========================================================================

    async fn insert_order(&self, order: &Order) -> Result<(), sqlx::Error> {
        sqlx::query(&format!("INSERT INTO orders ({ORDER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"))
            .bind(order.order_id)
            .bind(order.client_id)
            .bind(order.action_id)
            .bind(order.side.to_string())
            .bind(order.trigger.to_string())
            .bind(order.quantity)
            .bind(order.price.limit().map(|p| p.to_string()))
            .bind(order.trigger_price_lower.to_string())
            .bind(order.trigger_price_upper.map(|u| u.to_string()))
            .bind(order.order_date)
            .bind(order.order_intraday)
            .bind(order.expiration_date)
            .bind(order.expiration_intraday)
            .bind(order.status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_pending_order(&self, order: &Order) -> Result<(), sqlx::Error> {
        debug_assert_eq!(order.status, OrderStatus::Pending);
        self.insert_order(order).await
    }

    /// Persist one side's executed fragment of a fill as a completed row.
    pub async fn insert_completed_order(&self, order: &Order) -> Result<(), sqlx::Error> {
        debug_assert_eq!(order.status, OrderStatus::Completed);
        self.insert_order(order).await
    }

    pub async fn delete_pending_order(
        &self,
        client_id: i64,
        order_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "DELETE FROM orders WHERE order_id = ? AND client_id = ? AND order_status = 'PENDING'",
        )
        .bind(order_id)
        .bind(client_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_pending_orders(&self) -> Result<Vec<Order>, sqlx::Error> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_status = 'PENDING' ORDER BY order_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }

    pub async fn pending_orders_for_client(
        &self,
        client_id: i64,
    ) -> Result<Vec<Order>, sqlx::Error> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE client_id = ? AND order_status = 'PENDING' ORDER BY order_id"
        ))
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }

    pub async fn completed_orders_for_client(
        &self,
        client_id: i64,
    ) -> Result<Vec<Order>, sqlx::Error> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE client_id = ? AND order_status = 'COMPLETED' ORDER BY order_id"
        ))
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }

    /// Pending orders of one side joined with client and action names,
    /// for the market report.
    pub async fn pending_order_rows(&self, side: Side) -> Result<Vec<MarketOrderRow>, sqlx::Error> {
        let rows: Vec<(
            i64,
            i64,
            String,
            i64,
            String,
            String,
            Option<String>,
            String,
            Option<String>,
            Option<i64>,
            i64,
        )> = sqlx::query_as(
            "SELECT o.order_time_date, o.order_time_daily, c.name, o.quantity, a.name, \
                    o.trigger_type, o.price, o.trigger_price_lower, o.trigger_price_upper, \
                    o.expiration_time_date, o.expiration_time_daily \
             FROM orders o \
             JOIN actions a ON o.action_id = a.action_id \
             JOIN clients c ON o.client_id = c.client_id \
             WHERE o.order_type = ? AND o.order_status = 'PENDING' ORDER BY o.order_id",
        )
        .bind(side.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(
                    order_date,
                    order_intraday,
                    client_name,
                    quantity,
                    action_name,
                    trigger,
                    price,
                    lower,
                    upper,
                    expiration_date,
                    expiration_intraday,
                )| {
                    Ok(MarketOrderRow {
                        order_date,
                        order_intraday,
                        client_name,
                        side,
                        quantity,
                        action_name,
                        trigger: Trigger::parse(&trigger)
                            .ok_or_else(|| decode_err("trigger_type", &trigger))?,
                        price: match price {
                            None => Price::Market,
                            Some(raw) => Price::Limit(parse_dec(&raw)?),
                        },
                        trigger_price_lower: parse_dec(&lower)?,
                        trigger_price_upper: upper.as_deref().map(parse_dec).transpose()?,
                        expiration_date,
                        expiration_intraday,
                    })
                },
            )
            .collect()
    }

    // ========================================================================
    // Message log
    // ========================================================================

    pub async fn append_message(&self, message: &Message) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO messages (message_id, client_id, sender, message_type, payload, date_time, daily_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.message_id)
        .bind(message.client_id)
        .bind(message.sender.to_string())
        .bind(message.message_type.to_string())
        .bind(&message.payload)
        .bind(message.date_part)
        .bind(message.intraday_part)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_messages(&self) -> Result<Vec<Message>, sqlx::Error> {
        let rows: Vec<(i64, i64, String, String, String, i64, i64)> = sqlx::query_as(
            "SELECT message_id, client_id, sender, message_type, payload, date_time, daily_time \
             FROM messages ORDER BY date_time ASC, daily_time ASC, message_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(message_id, client_id, sender, message_type, payload, date_part, intraday_part)| {
                Ok(Message {
                    message_id,
                    client_id,
                    sender: Sender::parse(&sender).ok_or_else(|| decode_err("sender", &sender))?,
                    message_type: MessageType::parse(&message_type)
                        .ok_or_else(|| decode_err("message_type", &message_type))?,
                    payload,
                    date_part,
                    intraday_part,
                })
            })
            .collect()
    }

    /// Clients whose connect count exceeds their disconnect count since
    /// `since_ms`, for the shutdown audit.
    pub async fn unbalanced_connected_clients(
        &self,
        since_ms: i64,
    ) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT client_id FROM messages \
             WHERE (date_time * ? + daily_time) >= ? \
               AND message_type IN ('CLIENT_CONNECTED', 'CLIENT_DISCONNECTED') \
               AND client_id <> 0 \
             GROUP BY client_id \
             HAVING SUM(CASE WHEN message_type = 'CLIENT_CONNECTED' THEN 1 ELSE 0 END) \
                  > SUM(CASE WHEN message_type = 'CLIENT_DISCONNECTED' THEN 1 ELSE 0 END) \
             ORDER BY client_id",
        )
        .bind(MS_PER_DAY)
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await
    }

    // ========================================================================
    // Identifier seeds
    // ========================================================================

    pub async fn load_id_seeds(&self) -> Result<IdSeeds, sqlx::Error> {
        let orders: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(order_id), 0) FROM orders")
            .fetch_one(&self.pool)
            .await?;
        let messages: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(message_id), 0) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        let clients: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(client_id), 0) FROM clients")
            .fetch_one(&self.pool)
            .await?;
        let actions: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(action_id), 0) FROM actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(IdSeeds { orders, messages, clients, actions })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdSeeds {
    pub orders: i64,
    pub messages: i64,
    pub clients: i64,
    pub actions: i64,
}

/// Strictly increasing identifier allocator per entity class, seeded from
/// the store's current maxima at startup.
pub struct IdAllocator {
    orders: AtomicI64,
    messages: AtomicI64,
    clients: AtomicI64,
    actions: AtomicI64,
}

impl IdAllocator {
    pub fn from_seeds(seeds: IdSeeds) -> Self {
        Self {
            orders: AtomicI64::new(seeds.orders),
            messages: AtomicI64::new(seeds.messages),
            clients: AtomicI64::new(seeds.clients),
            actions: AtomicI64::new(seeds.actions),
        }
    }

    pub async fn load(store: &Store) -> Result<Self, sqlx::Error> {
        Ok(Self::from_seeds(store.load_id_seeds().await?))
    }

    pub fn next_order_id(&self) -> i64 {
        self.orders.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_message_id(&self) -> i64 {
        self.messages.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_client_id(&self) -> i64 {
        self.clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_action_id(&self) -> i64 {
        self.actions.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use rust_decimal_macros::dec;

    async fn memory_store() -> Store {
        Database::connect("sqlite::memory:").await.unwrap().store()
    }

    fn pending_order(order_id: i64, client_id: i64, side: Side, qty: i64, price: Price) -> Order {
        Order {
            order_id,
            client_id,
            action_id: 1,
            side,
            trigger: Trigger::Market,
            quantity: qty,
            price,
            trigger_price_lower: Decimal::ZERO,
            trigger_price_upper: None,
            order_date: 19_000,
            order_intraday: 3_600_000,
            expiration_date: None,
            expiration_intraday: 0,
            status: OrderStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_client_roundtrip() {
        let store = memory_store().await;
        store
            .insert_client(1, "Client1", b"blob", dec!(1000), &[(1, 20)])
            .await
            .unwrap();

        let client = store.get_client(1).await.unwrap().unwrap();
        assert_eq!(client.name, "Client1");
        assert_eq!(client.balance, dec!(1000));
        assert!(store.client_exists(1).await.unwrap());
        assert!(!store.client_exists(2).await.unwrap());
        assert_eq!(store.client_id_by_name("Client1").await.unwrap(), Some(1));
        assert_eq!(
            store.client_id_by_name_and_password("Client1", b"blob").await.unwrap(),
            Some(1)
        );
        assert_eq!(
            store.client_id_by_name_and_password("Client1", b"bad").await.unwrap(),
            None
        );

        store.credit_balance(1, dec!(50)).await.unwrap();
        store.debit_balance(1, dec!(30)).await.unwrap();
        assert_eq!(store.balance(1).await.unwrap(), dec!(1020));

        store.adjust_holding(1, 1, -5).await.unwrap();
        assert_eq!(store.holding_quantity(1, 1).await.unwrap(), 15);

        store.delete_client(1).await.unwrap();
        assert!(!store.client_exists(1).await.unwrap());
        assert_eq!(store.holding_quantity(1, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_action_prices_and_market_value() {
        let store = memory_store().await;
        store.upsert_action(1, "CAC40", 20).await.unwrap();
        store.upsert_action(2, "SP500", 10).await.unwrap();
        // Re-upserting an existing security adds shares.
        store.upsert_action(1, "CAC40", 5).await.unwrap();
        assert_eq!(store.get_action(1).await.unwrap().unwrap().quantity, 25);

        store.append_price(1, dec!(10), 100, 0).await.unwrap();
        store.append_price(1, dec!(11), 100, 500).await.unwrap();
        store.append_price(2, dec!(20), 100, 0).await.unwrap();

        let tick = store.last_price(1).await.unwrap().unwrap();
        assert_eq!(tick.price, dec!(11));

        // 25 * 11 + 10 * 20
        assert_eq!(store.market_value().await.unwrap(), dec!(475));

        let by_name = store.action_by_name("SP500").await.unwrap().unwrap();
        assert_eq!(by_name.action_id, 2);

        // Removal cascades through prices.
        store.delete_action(1).await.unwrap();
        assert!(!store.action_exists(1).await.unwrap());
        assert!(store.last_price(1).await.unwrap().is_none());
        assert_eq!(store.market_value().await.unwrap(), dec!(200));
    }

    #[tokio::test]
    async fn test_order_roundtrip() {
        let store = memory_store().await;
        let order = pending_order(7, 1, Side::Buy, 5, Price::Limit(dec!(25)));
        store.insert_pending_order(&order).await.unwrap();

        let pending = store.list_pending_orders().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_id, 7);
        assert_eq!(pending[0].price, Price::Limit(dec!(25)));
        assert_eq!(pending[0].status, OrderStatus::Pending);

        // A market order persists its price as NULL and reads back as Market.
        let market = pending_order(8, 1, Side::Sell, 3, Price::Market);
        store.insert_pending_order(&market).await.unwrap();
        let pending = store.pending_orders_for_client(1).await.unwrap();
        assert_eq!(pending[1].price, Price::Market);

        store.delete_pending_order(1, 7).await.unwrap();
        assert_eq!(store.list_pending_orders().await.unwrap().len(), 1);

        let mut completed = pending_order(9, 1, Side::Buy, 5, Price::Limit(dec!(20)));
        completed.status = OrderStatus::Completed;
        store.insert_completed_order(&completed).await.unwrap();
        let completed = store.completed_orders_for_client(1).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_id_allocator_seeds_from_maxima() {
        let store = memory_store().await;
        let order = pending_order(41, 1, Side::Buy, 1, Price::Market);
        store.insert_pending_order(&order).await.unwrap();

        let ids = IdAllocator::load(&store).await.unwrap();
        assert_eq!(ids.next_order_id(), 42);
        assert_eq!(ids.next_order_id(), 43);
        assert_eq!(ids.next_message_id(), 1);
        assert_eq!(ids.next_client_id(), 1);
        assert_eq!(ids.next_action_id(), 1);
    }

    #[tokio::test]
    async fn test_message_log_and_audit() {
        let store = memory_store().await;
        let mut id = 0;
        let mut log = |client_id: i64, message_type: MessageType| {
            id += 1;
            Message {
                message_id: id,
                client_id,
                sender: Sender::Server,
                message_type,
                payload: String::new(),
                date_part: 100,
                intraday_part: id * 10,
            }
        };
        let entries = [
            log(1, MessageType::ClientConnected),
            log(1, MessageType::ClientDisconnected),
            log(2, MessageType::ClientConnected),
            log(3, MessageType::ClientConnected),
            log(3, MessageType::ClientDisconnected),
            log(3, MessageType::ClientConnected),
        ];
        for entry in &entries {
            store.append_message(entry).await.unwrap();
        }

        // Client 2 never disconnected; client 3 reconnected without a final
        // disconnect; client 1 is balanced.
        let unbalanced = store.unbalanced_connected_clients(0).await.unwrap();
        assert_eq!(unbalanced, vec![2, 3]);

        let all = store.list_messages().await.unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].message_type, MessageType::ClientConnected);
    }

    #[tokio::test]
    async fn test_encryption_parts_roundtrip() {
        let store = memory_store().await;
        assert!(store.encryption_parts().await.unwrap().is_none());
        store.insert_encryption_parts(&[1u8; 32], &[2u8; 12]).await.unwrap();
        let (key, iv) = store.encryption_parts().await.unwrap().unwrap();
        assert_eq!(key, vec![1u8; 32]);
        assert_eq!(iv, vec![2u8; 12]);
    }
}
