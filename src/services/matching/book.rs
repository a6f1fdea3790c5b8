//! Per-security order books with price-time priority.
//!
//! Each side is an ordered sequence kept sorted on insert: market orders
//! first, then better prices, ties broken by order time then order id.
//! The pair of books for every security lives behind one process-wide
//! mutex; the matcher clones the map, works on the clone, and writes
//! residuals back under the same lock.

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, MutexGuard};

use crate::models::{Order, Price, Side, Trigger};

/// A resting order as the matcher sees it. `remaining` is decremented as
/// fills execute; `order_id` is replaced whenever a residual re-insert
/// supersedes the original pending row.
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub order_id: i64,
    pub client_id: i64,
    pub side: Side,
    pub trigger: Trigger,
    pub price: Price,
    pub remaining: i64,
    pub trigger_price_lower: Decimal,
    pub trigger_price_upper: Option<Decimal>,
    pub order_date: i64,
    pub order_intraday: i64,
    pub expiration_date: Option<i64>,
    pub expiration_intraday: i64,
}

impl BookEntry {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            client_id: order.client_id,
            side: order.side,
            trigger: order.trigger,
            price: order.price,
            remaining: order.quantity,
            trigger_price_lower: order.trigger_price_lower,
            trigger_price_upper: order.trigger_price_upper,
            order_date: order.order_date,
            order_intraday: order.order_intraday,
            expiration_date: order.expiration_date,
            expiration_intraday: order.expiration_intraday,
        }
    }
}

fn priority(side: Side, a: &BookEntry, b: &BookEntry) -> Ordering {
    let by_price = match side {
        Side::Buy => a.price.cmp_buy(&b.price),
        Side::Sell => a.price.cmp_sell(&b.price),
    };
    by_price
        .then(a.order_date.cmp(&b.order_date))
        .then(a.order_intraday.cmp(&b.order_intraday))
        .then(a.order_id.cmp(&b.order_id))
}

/// One side of a security's book, kept sorted by the side's priority.
#[derive(Debug, Clone)]
pub struct SideBook {
    side: Side,
    entries: Vec<BookEntry>,
}

impl SideBook {
    pub fn new(side: Side) -> Self {
        Self { side, entries: Vec::new() }
    }

    /// Insert at the sorted position; equal-priority entries keep FIFO order.
    pub fn insert(&mut self, entry: BookEntry) {
        debug_assert_eq!(entry.side, self.side);
        let side = self.side;
        let idx = self
            .entries
            .partition_point(|resting| priority(side, resting, &entry) != Ordering::Greater);
        self.entries.insert(idx, entry);
    }

    pub fn remove(&mut self, order_id: i64) -> Option<BookEntry> {
        let idx = self.entries.iter().position(|e| e.order_id == order_id)?;
        Some(self.entries.remove(idx))
    }

    pub fn entries(&self) -> &[BookEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [BookEntry] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop fully consumed entries.
    pub fn purge_filled(&mut self) {
        self.entries.retain(|e| e.remaining > 0);
    }
}

/// The buy/sell book pair of one security.
#[derive(Debug, Clone)]
pub struct BookPair {
    pub buys: SideBook,
    pub sells: SideBook,
}

impl BookPair {
    pub fn new() -> Self {
        Self { buys: SideBook::new(Side::Buy), sells: SideBook::new(Side::Sell) }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SideBook {
        match side {
            Side::Buy => &mut self.buys,
            Side::Sell => &mut self.sells,
        }
    }
}

impl Default for BookPair {
    fn default() -> Self {
        Self::new()
    }
}

/// All securities' books behind the process-wide mutex.
pub struct MarketBooks {
    inner: Mutex<HashMap<i64, BookPair>>,
}

impl MarketBooks {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub async fn lock(&self) -> MutexGuard<'_, HashMap<i64, BookPair>> {
        self.inner.lock().await
    }

    pub async fn insert_entry(&self, action_id: i64, entry: BookEntry) {
        let mut books = self.inner.lock().await;
        books.entry(action_id).or_default().side_mut(entry.side).insert(entry);
    }

    pub async fn remove_entry(&self, action_id: i64, side: Side, order_id: i64) -> Option<BookEntry> {
        let mut books = self.inner.lock().await;
        books.get_mut(&action_id)?.side_mut(side).remove(order_id)
    }

    /// Order ids currently resting in any book.
    pub async fn booked_ids(&self) -> HashSet<i64> {
        let books = self.inner.lock().await;
        books
            .values()
            .flat_map(|pair| pair.buys.entries().iter().chain(pair.sells.entries().iter()))
            .map(|e| e.order_id)
            .collect()
    }

    /// Deep copy of every security's book pair.
    pub async fn snapshot(&self) -> HashMap<i64, BookPair> {
        self.inner.lock().await.clone()
    }
}

impl Default for MarketBooks {
    fn default() -> Self {
        Self::new()
    }
}
