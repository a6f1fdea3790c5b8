//! Per-connection command dispatch.
//!
//! Requests are whitespace-delimited text frames. One bad request never
//! tears down the connection: validation failures reply with an `Error: …`
//! line and are journaled. Authentication failures reply with their failure
//! code and close.
//!
//! Recognized commands:
//!
//! ```text
//! Authentification Request: <name> <password>
//! <id> CLIENT_CONNECTED
//! <id> exit
//! <id> display {portfolio|pending_orders|completed_orders|market|<action_name>}
//! <id> <amount> {deposit|withdraw}
//! <id> <BUY|SELL> <qty> <action_id> <trigger> [price] [lower] [upper] [YYYY-MM-DD [HH:MM:SS]]
//! ```

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::crypto::PasswordCipher;
use crate::db::{IdAllocator, Store};
use crate::error::ExchangeError;
use crate::models::{
    portfolio_report, MessageType, Order, OrderStatus, Price, Sender, Side, Trigger,
};
use crate::services::journal::Journal;
use crate::services::matching::MatchingEngine;
use crate::services::session::SessionState;
use crate::time;

const AUTH_PREFIX: &str = "Authentification Request: ";

/// Everything a connection handler needs.
#[derive(Clone)]
pub struct ExchangeContext {
    pub store: Store,
    pub ids: Arc<IdAllocator>,
    pub journal: Journal,
    pub engine: Arc<MatchingEngine>,
    pub session: Arc<SessionState>,
    pub cipher: Arc<PasswordCipher>,
    pub process_delay_ms: u64,
}

/// What the connection loop should do with the command's result.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    ReplyAndClose(String),
    Close,
    Silent,
}

/// Parse and execute one request.
pub async fn dispatch(ctx: &ExchangeContext, input: &str) -> Outcome {
    let input = input.trim();
    tracing::debug!(%input, "client input");

    let result = if ctx.session.is_closed() {
        Err(ExchangeError::SessionShutdown)
    } else if let Some(rest) = input.strip_prefix(AUTH_PREFIX) {
        authenticate(ctx, rest).await
    } else {
        command(ctx, input).await
    };

    match result {
        Ok(outcome) => outcome,
        Err(ExchangeError::SessionShutdown) => Outcome::Close,
        Err(e) if e.is_client_facing() => {
            let reply = e.to_string();
            ctx.journal.record(0, Sender::Server, MessageType::Error, reply.clone()).await;
            Outcome::Reply(reply)
        }
        Err(e) => {
            tracing::error!("request failed: {e}");
            ctx.journal
                .record(0, Sender::Server, MessageType::Error, format!("request failed: {e}"))
                .await;
            Outcome::Reply("Error: internal server error".to_string())
        }
    }
}

async fn authenticate(ctx: &ExchangeContext, rest: &str) -> Result<Outcome, ExchangeError> {
    let mut parts = rest.split_whitespace();
    let (Some(name), Some(password)) = (parts.next(), parts.next()) else {
        ctx.journal
            .record(0, Sender::Server, MessageType::AuthentificationFailureInput, "Invalid input")
            .await;
        return Ok(Outcome::ReplyAndClose("AUTHENTIFICATION_FAILURE_INPUT".to_string()));
    };

    let Ok(blob) = ctx.cipher.encrypt(password) else {
        ctx.journal
            .record(0, Sender::Server, MessageType::AuthentificationFailureInput, "Invalid input")
            .await;
        return Ok(Outcome::ReplyAndClose("AUTHENTIFICATION_FAILURE_INPUT".to_string()));
    };

    if let Some(client_id) = ctx.store.client_id_by_name_and_password(name, &blob).await? {
        ctx.journal
            .record(
                client_id,
                Sender::Server,
                MessageType::AuthentificationSuccess,
                "Authentification success",
            )
            .await;
        return Ok(Outcome::Reply(format!("AUTHENTIFICATION_SUCCESS {client_id}")));
    }

    if let Some(client_id) = ctx.store.client_id_by_name(name).await? {
        ctx.journal
            .record(
                client_id,
                Sender::Server,
                MessageType::AuthentificationFailurePassword,
                "Wrong password",
            )
            .await;
        Ok(Outcome::ReplyAndClose("AUTHENTIFICATION_FAILURE_PASSWORD".to_string()))
    } else {
        ctx.journal
            .record(
                0,
                Sender::Server,
                MessageType::AuthentificationFailureUsername,
                "Unknown username",
            )
            .await;
        Ok(Outcome::ReplyAndClose("AUTHENTIFICATION_FAILURE_USERNAME".to_string()))
    }
}

async fn command(ctx: &ExchangeContext, input: &str) -> Result<Outcome, ExchangeError> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    let client_id = tokens
        .first()
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or_else(|| ExchangeError::InvalidInput("Command not recognized".to_string()))?;

    match tokens.get(1).copied() {
        Some("CLIENT_CONNECTED") => {
            ctx.journal
                .record(client_id, Sender::Server, MessageType::ClientConnected, "Client connected")
                .await;
            Ok(Outcome::Silent)
        }
        Some("exit") => {
            ctx.journal
                .record(
                    client_id,
                    Sender::Server,
                    MessageType::ClientDisconnected,
                    "Client disconnected",
                )
                .await;
            Ok(Outcome::Close)
        }
        Some("display") => display(ctx, client_id, tokens.get(2).copied().unwrap_or("")).await,
        Some(second) if is_balance_command(&tokens) => {
            let amount = second
                .parse::<Decimal>()
                .map_err(|_| ExchangeError::InvalidInput("Amount not recognized".to_string()))?;
            balance_adjust(ctx, client_id, amount, tokens[2]).await
        }
        Some(_) => order_entry(ctx, client_id, &tokens).await,
        None => Err(ExchangeError::InvalidInput("Command not recognized".to_string())),
    }
}

fn is_balance_command(tokens: &[&str]) -> bool {
    matches!(tokens.get(2).copied(), Some("deposit") | Some("withdraw"))
}

// ============================================================================
// Display reports
// ============================================================================

async fn display(
    ctx: &ExchangeContext,
    client_id: i64,
    what: &str,
) -> Result<Outcome, ExchangeError> {
    match what {
        "portfolio" => {
            let report = portfolio_report(&ctx.store.holdings(client_id).await?);
            let reply = if report.is_empty() { "Empty portfolio".to_string() } else { report };
            ctx.journal
                .record(client_id, Sender::Client, MessageType::DisplayPortfolio, "Display portfolio")
                .await;
            Ok(Outcome::Reply(reply))
        }
        "pending_orders" => {
            let orders = ctx.store.pending_orders_for_client(client_id).await?;
            let reply = order_rows(ctx, &orders).await?;
            let reply =
                if reply.is_empty() { "No pending orders".to_string() } else { reply };
            ctx.journal
                .record(
                    client_id,
                    Sender::Client,
                    MessageType::DisplayPendingOrders,
                    "Display pending orders",
                )
                .await;
            Ok(Outcome::Reply(reply))
        }
        "completed_orders" => {
            let orders = ctx.store.completed_orders_for_client(client_id).await?;
            let reply = order_rows(ctx, &orders).await?;
            let reply =
                if reply.is_empty() { "No completed orders".to_string() } else { reply };
            ctx.journal
                .record(
                    client_id,
                    Sender::Client,
                    MessageType::DisplayCompletedOrders,
                    "Display completed orders",
                )
                .await;
            Ok(Outcome::Reply(reply))
        }
        "market" => {
            let reply = market_report(&ctx.store).await?;
            ctx.journal
                .record(client_id, Sender::Client, MessageType::DisplayMarket, "Display market")
                .await;
            Ok(Outcome::Reply(reply))
        }
        name => {
            if let Some(action) = ctx.store.action_by_name(name).await? {
                let reply = match ctx.store.last_price(action.action_id).await? {
                    Some(tick) => action.report_row(&tick),
                    None => format!("{} {}", action.name, action.quantity),
                };
                ctx.journal
                    .record(
                        client_id,
                        Sender::Client,
                        MessageType::DisplayAction,
                        format!("Display action: {name}"),
                    )
                    .await;
                Ok(Outcome::Reply(reply))
            } else {
                let reply = format!(
                    "Error: Display type '{name}' not recognized, or action does not exist"
                );
                ctx.journal
                    .record(
                        client_id,
                        Sender::Server,
                        MessageType::Error,
                        "Display type not recognized",
                    )
                    .await;
                Ok(Outcome::Reply(reply))
            }
        }
    }
}

async fn order_rows(ctx: &ExchangeContext, orders: &[Order]) -> Result<String, ExchangeError> {
    let names: HashMap<i64, String> = ctx
        .store
        .list_actions()
        .await?
        .into_iter()
        .map(|a| (a.action_id, a.name))
        .collect();
    Ok(orders
        .iter()
        .map(|o| {
            let name = names.get(&o.action_id).map(String::as_str).unwrap_or("?");
            o.report_row(name)
        })
        .collect::<Vec<_>>()
        .join(","))
}

/// `market_value;orders_csv;actions_csv` with BUY rows before SELL rows.
pub async fn market_report(store: &Store) -> Result<String, ExchangeError> {
    let market_value = store.market_value().await?;

    let mut order_rows = Vec::new();
    for side in [Side::Buy, Side::Sell] {
        for row in store.pending_order_rows(side).await? {
            order_rows.push(row.report_row());
        }
    }

    let mut action_rows = Vec::new();
    for action in store.list_actions().await? {
        if let Some(tick) = store.last_price(action.action_id).await? {
            action_rows.push(action.report_row(&tick));
        }
    }

    Ok(format!("{};{};{}", market_value, order_rows.join(","), action_rows.join(",")))
}

// ============================================================================
// Balance adjustments
// ============================================================================

async fn balance_adjust(
    ctx: &ExchangeContext,
    client_id: i64,
    amount: Decimal,
    direction: &str,
) -> Result<Outcome, ExchangeError> {
    if !ctx.store.client_exists(client_id).await? {
        let reply = format!("Client {client_id} does not exist");
        ctx.journal.record(0, Sender::Server, MessageType::Error, reply.clone()).await;
        return Ok(Outcome::Reply(reply));
    }
    if amount <= Decimal::ZERO {
        return Err(ExchangeError::InvalidInput("Amount must be positive".to_string()));
    }

    if direction == "deposit" {
        ctx.store.credit_balance(client_id, amount).await?;
        let reply = format!("Deposited {amount}$ to client {client_id}");
        ctx.journal.record(client_id, Sender::Client, MessageType::Deposit, reply.clone()).await;
        Ok(Outcome::Reply(reply))
    } else {
        if ctx.store.balance(client_id).await? < amount {
            let reply = format!("Insufficient balance for client {client_id} to withdraw {amount}");
            ctx.journal.record(client_id, Sender::Server, MessageType::Error, reply.clone()).await;
            return Ok(Outcome::Reply(reply));
        }
        ctx.store.debit_balance(client_id, amount).await?;
        let reply = format!("Withdrew {amount}$ from client {client_id}");
        ctx.journal.record(client_id, Sender::Client, MessageType::Withdraw, reply.clone()).await;
        Ok(Outcome::Reply(reply))
    }
}

// ============================================================================
// Order entry
// ============================================================================

struct ParsedTrigger {
    trigger: Trigger,
    price: Price,
    lower: Decimal,
    upper: Option<Decimal>,
    /// Index of the first token after the trigger fields.
    rest: usize,
}

fn parse_positive(raw: Option<&&str>, missing: &str, negative: &str) -> Result<Decimal, ExchangeError> {
    let value = raw
        .and_then(|t| t.parse::<Decimal>().ok())
        .ok_or_else(|| ExchangeError::InvalidInput(missing.to_string()))?;
    if value <= Decimal::ZERO {
        return Err(ExchangeError::InvalidInput(negative.to_string()));
    }
    Ok(value)
}

fn parse_trigger_fields(tokens: &[&str]) -> Result<ParsedTrigger, ExchangeError> {
    let trigger = Trigger::parse(tokens[4]).ok_or_else(|| {
        ExchangeError::InvalidInput(
            "Trigger type not recognized (use MARKET, LIMIT, STOP or LIMIT_STOP)".to_string(),
        )
    })?;

    match trigger {
        Trigger::Market => Ok(ParsedTrigger {
            trigger,
            price: Price::Market,
            lower: Decimal::ZERO,
            upper: None,
            rest: 5,
        }),
        Trigger::Limit => {
            let price = parse_positive(
                tokens.get(5),
                "Price must be provided for a limit order",
                "Price must be positive for a limit order",
            )?;
            let lower = parse_positive(
                tokens.get(6),
                "Trigger price lower must be provided for a limit order",
                "Trigger price lower must be positive for a limit order",
            )?;
            Ok(ParsedTrigger { trigger, price: Price::Limit(price), lower, upper: None, rest: 7 })
        }
        Trigger::Stop => {
            let price = parse_positive(
                tokens.get(5),
                "Price must be provided for a stop order",
                "Price must be positive for a stop order",
            )?;
            let upper = parse_positive(
                tokens.get(6),
                "Trigger price upper must be provided for a stop order",
                "Trigger price upper must be positive for a stop order",
            )?;
            Ok(ParsedTrigger {
                trigger,
                price: Price::Limit(price),
                lower: Decimal::ZERO,
                upper: Some(upper),
                rest: 7,
            })
        }
        Trigger::LimitStop => {
            let price = parse_positive(
                tokens.get(5),
                "Price must be provided for a limit-stop order",
                "Price must be positive for a limit-stop order",
            )?;
            let lower = parse_positive(
                tokens.get(6),
                "Trigger price lower must be provided for a limit stop order",
                "Trigger price lower must be positive for a limit stop order",
            )?;
            let upper = parse_positive(
                tokens.get(7),
                "Trigger price upper must be provided for a limit stop order",
                "Trigger price upper must be positive for a limit stop order",
            )?;
            Ok(ParsedTrigger {
                trigger,
                price: Price::Limit(price),
                lower,
                upper: Some(upper),
                rest: 8,
            })
        }
    }
}

async fn order_entry(
    ctx: &ExchangeContext,
    client_id: i64,
    tokens: &[&str],
) -> Result<Outcome, ExchangeError> {
    if tokens.len() < 5 {
        return Err(ExchangeError::InvalidInput("Command not recognized".to_string()));
    }
    let side = Side::parse(tokens[1]).ok_or_else(|| {
        ExchangeError::InvalidInput("Order type not recognized (use BUY or SELL)".to_string())
    })?;
    let quantity = tokens[2]
        .parse::<i64>()
        .ok()
        .filter(|q| *q > 0)
        .ok_or_else(|| ExchangeError::InvalidInput("Quantity must be a positive integer".to_string()))?;
    let action_id = tokens[3]
        .parse::<i64>()
        .map_err(|_| ExchangeError::InvalidInput("Action id not recognized".to_string()))?;
    let parsed = parse_trigger_fields(tokens)?;

    // Optional validity date and time of day.
    let expiration_date = match tokens.get(parsed.rest) {
        None => None,
        Some(raw) => Some(
            time::parse_date(raw)
                .ok_or_else(|| ExchangeError::InvalidInput("Invalid validity date".to_string()))?,
        ),
    };
    let expiration_intraday = match tokens.get(parsed.rest + 1) {
        None => 0,
        Some(raw) => time::parse_daily(raw)
            .ok_or_else(|| ExchangeError::InvalidInput("Invalid validity time".to_string()))?,
    };

    if !ctx.store.client_exists(client_id).await? {
        return Err(ExchangeError::UnknownClient(client_id));
    }
    if !ctx.store.action_exists(action_id).await? {
        return Err(ExchangeError::UnknownAction(action_id));
    }

    // Affordability for buys, inventory for sells. A market buy is checked
    // against the security's last price, the sentinel not being chargeable.
    match side {
        Side::Buy => {
            let reference = match parsed.price.limit() {
                Some(limit) => Some(limit),
                None => ctx.engine.last_price(action_id).await?,
            };
            if let Some(reference) = reference {
                if ctx.store.balance(client_id).await? < reference * Decimal::from(quantity) {
                    return Err(ExchangeError::InsufficientFunds);
                }
            }
        }
        Side::Sell => {
            if ctx.store.holding_quantity(client_id, action_id).await? < quantity {
                return Err(ExchangeError::InsufficientShares);
            }
        }
    }

    let order_id = ctx.ids.next_order_id();
    let now = time::now_ms();
    let order = Order {
        order_id,
        client_id,
        action_id,
        side,
        trigger: parsed.trigger,
        quantity,
        price: parsed.price,
        trigger_price_lower: parsed.lower,
        trigger_price_upper: parsed.upper,
        order_date: time::date_part(now),
        order_intraday: time::intraday_part(now),
        expiration_date,
        expiration_intraday,
        status: OrderStatus::Pending,
    };

    let reply = format!(
        "Order created with ID: {} for client {} to {} {} actions of {} at the price of {}$ at time {} \
         with trigger type {} and trigger price lower {} and trigger price upper {} until validity date {}",
        order_id,
        client_id,
        side,
        quantity,
        action_id,
        order.price,
        time::format_ms(now),
        parsed.trigger,
        order.trigger_price_lower,
        order.trigger_price_upper.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string()),
        order.expiry_text(),
    );
    ctx.journal.record_at(client_id, Sender::Client, MessageType::Order, reply.clone(), now).await;

    ctx.store.insert_pending_order(&order).await?;

    // Market-trigger orders are booked immediately and, during continuous
    // trading, attempt a single-flight match pass after the simulated
    // processing delay. Triggered orders rest until activation.
    if parsed.trigger == Trigger::Market {
        ctx.engine.accumulate(&order).await;
        ctx.journal
            .record(0, Sender::Server, MessageType::AccumulatingOrder, "Accumulating the order")
            .await;
        if ctx.session.is_continuous() {
            if ctx.process_delay_ms > 0 {
                sleep(Duration::from_millis(ctx.process_delay_ms)).await;
            }
            if let Err(e) = ctx.engine.try_run_continuous().await {
                tracing::error!("continuous pass failed: {e}");
            }
        }
    }

    Ok(Outcome::Reply(reply))
}
