use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::time;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Trigger kind controlling when and at what price an order participates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    Market,
    Limit,
    Stop,
    LimitStop,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Market => write!(f, "MARKET"),
            Trigger::Limit => write!(f, "LIMIT"),
            Trigger::Stop => write!(f, "STOP"),
            Trigger::LimitStop => write!(f, "LIMIT_STOP"),
        }
    }
}

impl Trigger {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Trigger::Market),
            "LIMIT" => Some(Trigger::Limit),
            "STOP" => Some(Trigger::Stop),
            "LIMIT_STOP" => Some(Trigger::LimitStop),
            _ => None,
        }
    }
}

/// Order price: a market order carries no limit and sorts ahead of any
/// limit on both book sides. The print price of a fill is never `Market`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Price {
    Market,
    Limit(Decimal),
}

impl Price {
    pub fn limit(&self) -> Option<Decimal> {
        match self {
            Price::Market => None,
            Price::Limit(p) => Some(*p),
        }
    }

    pub fn is_market(&self) -> bool {
        matches!(self, Price::Market)
    }

    /// Whether a buy at `self` crosses a sell at `ask`. A market order on
    /// either side crosses anything.
    pub fn crosses(&self, ask: &Price) -> bool {
        match (self, ask) {
            (Price::Market, _) | (_, Price::Market) => true,
            (Price::Limit(bid), Price::Limit(ask)) => bid >= ask,
        }
    }

    /// Rank for the buy book: market first, then higher limits.
    pub fn cmp_buy(&self, other: &Price) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        match (self, other) {
            (Price::Market, Price::Market) => Equal,
            (Price::Market, Price::Limit(_)) => Less,
            (Price::Limit(_), Price::Market) => Greater,
            (Price::Limit(a), Price::Limit(b)) => b.cmp(a),
        }
    }

    /// Rank for the sell book: market first, then lower limits.
    pub fn cmp_sell(&self, other: &Price) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        match (self, other) {
            (Price::Market, Price::Market) => Equal,
            (Price::Market, Price::Limit(_)) => Less,
            (Price::Limit(_), Price::Market) => Greater,
            (Price::Limit(a), Price::Limit(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Price::Market => write!(f, "MARKET"),
            Price::Limit(p) => write!(f, "{p}"),
        }
    }
}

/// Persisted order status. Deletion of pending rows is physical; there is
/// no cancelled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Completed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Completed => write!(f, "COMPLETED"),
        }
    }
}

/// An order. Immutable once created except for `quantity`, which tracks the
/// remaining unfilled amount during matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub client_id: i64,
    pub action_id: i64,
    pub side: Side,
    pub trigger: Trigger,
    pub quantity: i64,
    pub price: Price,
    /// Lower bound of the triggering window (zero when unconstrained).
    pub trigger_price_lower: Decimal,
    /// Upper bound of the triggering window; `None` is unbounded.
    pub trigger_price_upper: Option<Decimal>,
    pub order_date: i64,
    pub order_intraday: i64,
    /// Expiration date part; `None` is good-till-close.
    pub expiration_date: Option<i64>,
    pub expiration_intraday: i64,
    pub status: OrderStatus,
}

impl Order {
    /// Whether the triggering window contains `last_price`.
    pub fn window_contains(&self, last_price: Decimal) -> bool {
        last_price >= self.trigger_price_lower
            && self.trigger_price_upper.map_or(true, |upper| last_price <= upper)
    }

    /// Whether the order is past its expiration at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.expiration_date {
            None => false,
            Some(date) => time::combine(date, self.expiration_intraday) < now_ms,
        }
    }

    pub fn expiry_text(&self) -> String {
        match self.expiration_date {
            None => "GTC".to_string(),
            Some(date) => time::format_parts(date, self.expiration_intraday),
        }
    }

    /// Report row used by the pending/completed order displays.
    pub fn report_row(&self, action_name: &str) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {}",
            time::format_parts(self.order_date, self.order_intraday),
            self.order_id,
            self.side,
            self.quantity,
            action_name,
            self.trigger,
            self.price,
            self.trigger_price_lower,
            self.trigger_price_upper
                .map(|u| u.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.expiry_text(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_cross() {
        assert!(Price::Limit(dec!(25)).crosses(&Price::Limit(dec!(20))));
        assert!(Price::Limit(dec!(20)).crosses(&Price::Limit(dec!(20))));
        assert!(!Price::Limit(dec!(19)).crosses(&Price::Limit(dec!(20))));
        assert!(Price::Market.crosses(&Price::Limit(dec!(1000))));
        assert!(Price::Limit(dec!(1)).crosses(&Price::Market));
    }

    #[test]
    fn test_price_ranking() {
        use std::cmp::Ordering::*;
        // Buy book: market first, then higher limits.
        assert_eq!(Price::Market.cmp_buy(&Price::Limit(dec!(100))), Less);
        assert_eq!(Price::Limit(dec!(25)).cmp_buy(&Price::Limit(dec!(20))), Less);
        assert_eq!(Price::Limit(dec!(20)).cmp_buy(&Price::Limit(dec!(25))), Greater);
        // Sell book: market first, then lower limits.
        assert_eq!(Price::Market.cmp_sell(&Price::Limit(dec!(1))), Less);
        assert_eq!(Price::Limit(dec!(20)).cmp_sell(&Price::Limit(dec!(25))), Less);
    }

    #[test]
    fn test_window_and_expiry() {
        let mut order = Order {
            order_id: 1,
            client_id: 1,
            action_id: 1,
            side: Side::Buy,
            trigger: Trigger::Limit,
            quantity: 5,
            price: Price::Limit(dec!(20)),
            trigger_price_lower: dec!(10),
            trigger_price_upper: None,
            order_date: 0,
            order_intraday: 0,
            expiration_date: None,
            expiration_intraday: 0,
            status: OrderStatus::Pending,
        };
        assert!(order.window_contains(dec!(10)));
        assert!(order.window_contains(dec!(1000)));
        assert!(!order.window_contains(dec!(9)));

        order.trigger_price_upper = Some(dec!(15));
        assert!(order.window_contains(dec!(12)));
        assert!(!order.window_contains(dec!(16)));

        assert!(!order.is_expired(i64::MAX));
        order.expiration_date = Some(0);
        order.expiration_intraday = 1000;
        assert!(order.is_expired(2000));
        assert!(!order.is_expired(500));
    }
}
