use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::time;

/// A listed security ("action"): total outstanding shares plus a
/// time-indexed price history whose tail is the last price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_id: i64,
    pub name: String,
    pub quantity: i64,
}

/// One entry of a security's price history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: Decimal,
    pub date_part: i64,
    pub intraday_part: i64,
}

impl Action {
    /// `name quantity last_price time` row for the action display.
    pub fn report_row(&self, last: &PriceTick) -> String {
        format!(
            "{} {} {} {}",
            self.name,
            self.quantity,
            last.price,
            time::format_parts(last.date_part, last.intraday_part),
        )
    }
}
