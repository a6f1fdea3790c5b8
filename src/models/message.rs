use serde::{Deserialize, Serialize};
use std::fmt;

use crate::time;

/// Message originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sender {
    Server,
    Client,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::Server => write!(f, "SERVER"),
            Sender::Client => write!(f, "CLIENT"),
        }
    }
}

impl Sender {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SERVER" => Some(Sender::Server),
            "CLIENT" => Some(Sender::Client),
            _ => None,
        }
    }
}

/// Audit-log event kinds. Stored as their text form; the shutdown audit and
/// session replay both key on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    ServerRestart,
    ServerShutdown,
    PreOpenPhase,
    OpenPhase,
    ContinuousTradingPhase,
    PreClosePhase,
    ClosePhase,
    AuthentificationSuccess,
    AuthentificationFailureInput,
    AuthentificationFailureUsername,
    AuthentificationFailurePassword,
    ClientConnected,
    ClientDisconnected,
    DisplayPortfolio,
    DisplayPendingOrders,
    DisplayCompletedOrders,
    DisplayMarket,
    DisplayAction,
    Deposit,
    Withdraw,
    Order,
    AccumulatingOrder,
    OrderExpired,
    Transaction,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::ServerRestart => "SERVER_RESTART",
            MessageType::ServerShutdown => "SERVER_SHUTDOWN",
            MessageType::PreOpenPhase => "PRE_OPEN_PHASE",
            MessageType::OpenPhase => "OPEN_PHASE",
            MessageType::ContinuousTradingPhase => "CONTINUOUS_TRADING_PHASE",
            MessageType::PreClosePhase => "PRE_CLOSE_PHASE",
            MessageType::ClosePhase => "CLOSE_PHASE",
            MessageType::AuthentificationSuccess => "AUTHENTIFICATION_SUCCESS",
            MessageType::AuthentificationFailureInput => "AUTHENTIFICATION_FAILURE_INPUT",
            MessageType::AuthentificationFailureUsername => "AUTHENTIFICATION_FAILURE_USERNAME",
            MessageType::AuthentificationFailurePassword => "AUTHENTIFICATION_FAILURE_PASSWORD",
            MessageType::ClientConnected => "CLIENT_CONNECTED",
            MessageType::ClientDisconnected => "CLIENT_DISCONNECTED",
            MessageType::DisplayPortfolio => "DISPLAY_PORTFOLIO",
            MessageType::DisplayPendingOrders => "DISPLAY_PENDING_ORDERS",
            MessageType::DisplayCompletedOrders => "DISPLAY_COMPLETED_ORDERS",
            MessageType::DisplayMarket => "DISPLAY_MARKET",
            MessageType::DisplayAction => "DISPLAY_ACTION",
            MessageType::Deposit => "DEPOSIT",
            MessageType::Withdraw => "WITHDRAW",
            MessageType::Order => "ORDER",
            MessageType::AccumulatingOrder => "ACCUMULATING_ORDER",
            MessageType::OrderExpired => "ORDER_EXPIRED",
            MessageType::Transaction => "TRANSACTION",
            MessageType::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "SERVER_RESTART" => MessageType::ServerRestart,
            "SERVER_SHUTDOWN" => MessageType::ServerShutdown,
            "PRE_OPEN_PHASE" => MessageType::PreOpenPhase,
            "OPEN_PHASE" => MessageType::OpenPhase,
            "CONTINUOUS_TRADING_PHASE" => MessageType::ContinuousTradingPhase,
            "PRE_CLOSE_PHASE" => MessageType::PreClosePhase,
            "CLOSE_PHASE" => MessageType::ClosePhase,
            "AUTHENTIFICATION_SUCCESS" => MessageType::AuthentificationSuccess,
            "AUTHENTIFICATION_FAILURE_INPUT" => MessageType::AuthentificationFailureInput,
            "AUTHENTIFICATION_FAILURE_USERNAME" => MessageType::AuthentificationFailureUsername,
            "AUTHENTIFICATION_FAILURE_PASSWORD" => MessageType::AuthentificationFailurePassword,
            "CLIENT_CONNECTED" => MessageType::ClientConnected,
            "CLIENT_DISCONNECTED" => MessageType::ClientDisconnected,
            "DISPLAY_PORTFOLIO" => MessageType::DisplayPortfolio,
            "DISPLAY_PENDING_ORDERS" => MessageType::DisplayPendingOrders,
            "DISPLAY_COMPLETED_ORDERS" => MessageType::DisplayCompletedOrders,
            "DISPLAY_MARKET" => MessageType::DisplayMarket,
            "DISPLAY_ACTION" => MessageType::DisplayAction,
            "DEPOSIT" => MessageType::Deposit,
            "WITHDRAW" => MessageType::Withdraw,
            "ORDER" => MessageType::Order,
            "ACCUMULATING_ORDER" => MessageType::AccumulatingOrder,
            "ORDER_EXPIRED" => MessageType::OrderExpired,
            "TRANSACTION" => MessageType::Transaction,
            "ERROR" => MessageType::Error,
            _ => return None,
        };
        Some(kind)
    }
}

/// One audit-log entry. Server-originated entries use `client_id = 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub client_id: i64,
    pub sender: Sender,
    pub message_type: MessageType,
    pub payload: String,
    pub date_part: i64,
    pub intraday_part: i64,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} client={} {}",
            time::format_parts(self.date_part, self.intraday_part),
            self.sender,
            self.message_type,
            self.client_id,
            self.payload,
        )
    }
}
