use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A registered client account. The encrypted password is kept out of this
/// row and only ever handled as an opaque blob by the authentication path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: i64,
    pub name: String,
    pub balance: Decimal,
}

/// One portfolio line: how many shares of a security a client holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub action_id: i64,
    pub action_name: String,
    pub quantity: i64,
}

/// Comma-joined `name quantity` pairs; empty when the client holds nothing.
pub fn portfolio_report(holdings: &[Holding]) -> String {
    holdings
        .iter()
        .filter(|h| h.quantity > 0)
        .map(|h| format!("{} {}", h.action_name, h.quantity))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portfolio_report() {
        let holdings = vec![
            Holding { action_id: 1, action_name: "CAC40".into(), quantity: 20 },
            Holding { action_id: 2, action_name: "SP500".into(), quantity: 0 },
            Holding { action_id: 3, action_name: "DAX".into(), quantity: 3 },
        ];
        assert_eq!(portfolio_report(&holdings), "CAC40 20,DAX 3");
        assert_eq!(portfolio_report(&[]), "");
    }
}
