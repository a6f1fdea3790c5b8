//! The matching engine.
//!
//! Two procedures share one fill-application routine: the call-auction
//! *fixing* run at market open and close, and *continuous trading* run
//! opportunistically while the market is open. Both operate per security on
//! a snapshot of the books, apply fills to the store as they are found, and
//! reconcile the live books afterwards. The original recursive
//! match-until-quiescent is rendered as a bounded loop: rounds repeat until
//! a round produces no fills (total tradable quantity never increases).

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::book::{BookEntry, BookPair, MarketBooks};
use crate::db::{IdAllocator, Store};
use crate::error::ExchangeError;
use crate::models::{MessageType, Order, OrderStatus, Price, Sender, Side, Trigger};
use crate::services::journal::Journal;
use crate::time;

/// One executed trade.
#[derive(Debug, Clone)]
pub struct Fill {
    pub action_id: i64,
    pub buyer_client_id: i64,
    pub seller_client_id: i64,
    pub quantity: i64,
    pub price: Decimal,
    pub executed_at_ms: i64,
}

#[derive(Debug, Clone, Copy)]
enum MatchMode {
    Fixing,
    Continuous,
}

/// Live-book reconciliation produced while matching on the snapshot.
/// Applied in order under the books mutex once the round is walked.
#[derive(Debug)]
enum BookEdit {
    Remove { action_id: i64, side: Side, order_id: i64 },
    Insert { action_id: i64, entry: BookEntry },
}

pub struct MatchingEngine {
    store: Store,
    ids: Arc<IdAllocator>,
    journal: Journal,
    books: MarketBooks,
    /// Single-flight gate: continuous passes skip when held, fixing waits.
    match_gate: Mutex<()>,
    last_prices: DashMap<i64, Decimal>,
}

impl MatchingEngine {
    pub fn new(store: Store, ids: Arc<IdAllocator>, journal: Journal) -> Self {
        Self {
            store,
            ids,
            journal,
            books: MarketBooks::new(),
            match_gate: Mutex::new(()),
            last_prices: DashMap::new(),
        }
    }

    pub fn books(&self) -> &MarketBooks {
        &self.books
    }

    /// Insert an accepted order into its security's book.
    pub async fn accumulate(&self, order: &Order) {
        self.books
            .insert_entry(order.action_id, BookEntry::from_order(order))
            .await;
    }

    /// Rebuild the in-memory books from pending market-trigger orders.
    /// Triggered orders re-enter through activation.
    pub async fn rebuild_books(&self) -> Result<usize, ExchangeError> {
        let mut count = 0;
        for order in self.store.list_pending_orders().await? {
            if order.trigger == Trigger::Market {
                self.accumulate(&order).await;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Warm the last-price cache from the store.
    pub async fn seed_last_prices(&self) -> Result<(), ExchangeError> {
        for action in self.store.list_actions().await? {
            if let Some(tick) = self.store.last_price(action.action_id).await? {
                self.last_prices.insert(action.action_id, tick.price);
            }
        }
        Ok(())
    }

    /// Last traded/recorded price of a security, cache first.
    pub async fn last_price(&self, action_id: i64) -> Result<Option<Decimal>, ExchangeError> {
        if let Some(price) = self.last_prices.get(&action_id) {
            return Ok(Some(*price));
        }
        Ok(self.store.last_price(action_id).await?.map(|tick| {
            self.last_prices.insert(action_id, tick.price);
            tick.price
        }))
    }

    /// Run the call auction across all securities. Waits for any in-flight
    /// continuous pass to finish.
    pub async fn run_fixing(&self) -> Result<Vec<Fill>, ExchangeError> {
        let _gate = self.match_gate.lock().await;
        self.run_rounds(MatchMode::Fixing).await
    }

    /// Attempt a continuous-trading pass; skipped (returns `None`) when a
    /// pass is already running. Arrivals during a pass rely on the next
    /// arrival to trigger re-entry.
    pub async fn try_run_continuous(&self) -> Result<Option<Vec<Fill>>, ExchangeError> {
        let _gate = match self.match_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                tracing::debug!("match pass already in flight, skipping");
                return Ok(None);
            }
        };
        Ok(Some(self.run_rounds(MatchMode::Continuous).await?))
    }

    async fn run_rounds(&self, mode: MatchMode) -> Result<Vec<Fill>, ExchangeError> {
        let mut all_fills = Vec::new();
        loop {
            let fills = self.run_round(mode).await?;
            if fills.is_empty() {
                break;
            }
            all_fills.extend(fills);
        }
        if !all_fills.is_empty() {
            tracing::info!(mode = ?mode, fills = all_fills.len(), "match pass complete");
        }
        Ok(all_fills)
    }

    async fn run_round(&self, mode: MatchMode) -> Result<Vec<Fill>, ExchangeError> {
        let mut snapshot = self.books.snapshot().await;
        let mut action_ids: Vec<i64> = snapshot.keys().copied().collect();
        action_ids.sort_unstable();

        let mut fills = Vec::new();
        let mut edits = Vec::new();
        for action_id in action_ids {
            if let Some(pair) = snapshot.get_mut(&action_id) {
                match mode {
                    MatchMode::Fixing => {
                        self.match_security_fixing(action_id, pair, &mut fills, &mut edits)
                            .await?
                    }
                    MatchMode::Continuous => {
                        self.match_security_continuous(action_id, pair, &mut fills, &mut edits)
                            .await?
                    }
                }
            }
        }

        if !edits.is_empty() {
            let mut books = self.books.lock().await;
            for edit in edits {
                match edit {
                    BookEdit::Remove { action_id, side, order_id } => {
                        if let Some(pair) = books.get_mut(&action_id) {
                            pair.side_mut(side).remove(order_id);
                        }
                    }
                    BookEdit::Insert { action_id, entry } => {
                        books.entry(action_id).or_default().side_mut(entry.side).insert(entry);
                    }
                }
            }
        }
        Ok(fills)
    }

    /// Walk the crossed region top-of-book to top-of-book, best buys against
    /// best sells, until prices no longer cross.
    async fn match_security_fixing(
        &self,
        action_id: i64,
        pair: &mut BookPair,
        fills: &mut Vec<Fill>,
        edits: &mut Vec<BookEdit>,
    ) -> Result<(), ExchangeError> {
        let BookPair { buys, sells } = pair;
        let buys = buys.entries_mut();
        let sells = sells.entries_mut();

        let (mut bi, mut si) = (0, 0);
        while bi < buys.len() && si < sells.len() {
            if !buys[bi].price.crosses(&sells[si].price) {
                break;
            }
            if buys[bi].remaining <= 0 || sells[si].remaining <= 0 {
                break;
            }
            if !self.counterparties_exist(&buys[bi], &sells[si]).await? {
                break;
            }
            let Some(fill) = self
                .apply_fill(action_id, &mut buys[bi], &mut sells[si], edits)
                .await?
            else {
                break;
            };
            fills.push(fill);
            if buys[bi].remaining == 0 {
                bi += 1;
            }
            if sells[si].remaining == 0 {
                si += 1;
            }
        }
        Ok(())
    }

    /// Each buy from the top walks the sell book; fills wherever prices
    /// cross, moving on once the buy is exhausted.
    async fn match_security_continuous(
        &self,
        action_id: i64,
        pair: &mut BookPair,
        fills: &mut Vec<Fill>,
        edits: &mut Vec<BookEdit>,
    ) -> Result<(), ExchangeError> {
        let BookPair { buys, sells } = pair;
        let buys = buys.entries_mut();
        let sells = sells.entries_mut();

        'buys: for bi in 0..buys.len() {
            for si in 0..sells.len() {
                let crossed = buys[bi].remaining > 0
                    && sells[si].remaining > 0
                    && buys[bi].price.crosses(&sells[si].price);
                if !crossed {
                    continue;
                }
                if !self.counterparties_exist(&buys[bi], &sells[si]).await? {
                    continue;
                }
                let Some(fill) = self
                    .apply_fill(action_id, &mut buys[bi], &mut sells[si], edits)
                    .await?
                else {
                    return Ok(());
                };
                fills.push(fill);
                if buys[bi].remaining == 0 {
                    continue 'buys;
                }
            }
        }
        Ok(())
    }

    async fn counterparties_exist(
        &self,
        buy: &BookEntry,
        sell: &BookEntry,
    ) -> Result<bool, ExchangeError> {
        for client_id in [buy.client_id, sell.client_id] {
            if !self.store.client_exists(client_id).await? {
                tracing::error!("client {client_id} missing, halting match for this security");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The print price is the resting seller's limit; a market sell falls
    /// back to the security's last price, then to the buyer's limit.
    async fn print_price(
        &self,
        action_id: i64,
        buy: &BookEntry,
        sell: &BookEntry,
    ) -> Result<Option<Decimal>, ExchangeError> {
        if let Some(price) = sell.price.limit() {
            return Ok(Some(price));
        }
        if let Some(price) = self.last_price(action_id).await? {
            return Ok(Some(price));
        }
        Ok(buy.price.limit())
    }

    /// Execute one fill: move cash and shares, retire the consumed pending
    /// rows, persist the completed fragments, re-insert residuals under
    /// fresh ids, log the transaction, and print the price tick.
    async fn apply_fill(
        &self,
        action_id: i64,
        buy: &mut BookEntry,
        sell: &mut BookEntry,
        edits: &mut Vec<BookEdit>,
    ) -> Result<Option<Fill>, ExchangeError> {
        let quantity = buy.remaining.min(sell.remaining);
        let Some(price) = self.print_price(action_id, buy, sell).await? else {
            tracing::warn!("no price reference for action {action_id}, halting pass");
            return Ok(None);
        };

        let now = time::now_ms();
        let (date, intraday) = (time::date_part(now), time::intraday_part(now));
        let gross = price * Decimal::from(quantity);

        self.store.debit_balance(buy.client_id, gross).await?;
        self.store.credit_balance(sell.client_id, gross).await?;
        self.store.adjust_holding(buy.client_id, action_id, quantity).await?;
        self.store.adjust_holding(sell.client_id, action_id, -quantity).await?;

        self.store.delete_pending_order(buy.client_id, buy.order_id).await?;
        self.store.delete_pending_order(sell.client_id, sell.order_id).await?;
        edits.push(BookEdit::Remove { action_id, side: Side::Buy, order_id: buy.order_id });
        edits.push(BookEdit::Remove { action_id, side: Side::Sell, order_id: sell.order_id });

        for entry in [&*buy, &*sell] {
            let completed =
                completed_fragment(self.ids.next_order_id(), entry, action_id, quantity, price, date, intraday);
            self.store.insert_completed_order(&completed).await?;
        }

        buy.remaining -= quantity;
        sell.remaining -= quantity;

        // Residuals supersede the consumed rows under fresh ids; the walk
        // continues on the superseding entry.
        for entry in [&mut *buy, &mut *sell] {
            if entry.remaining > 0 {
                let residual_id = self.ids.next_order_id();
                entry.order_id = residual_id;
                let residual = residual_order(residual_id, entry, action_id);
                self.store.insert_pending_order(&residual).await?;
                edits.push(BookEdit::Insert { action_id, entry: entry.clone() });
            }
        }

        let details = format!(
            "Transaction of {} actions {} at the price of {}$ between buyer {} and seller {} at time {}",
            quantity,
            action_id,
            price,
            buy.client_id,
            sell.client_id,
            time::format_ms(now),
        );
        self.journal
            .record_at(0, Sender::Server, MessageType::Transaction, details, now)
            .await;

        self.store.append_price(action_id, price, date, intraday).await?;
        self.last_prices.insert(action_id, price);

        tracing::info!(
            action_id,
            quantity,
            %price,
            buyer = buy.client_id,
            seller = sell.client_id,
            "fill"
        );

        Ok(Some(Fill {
            action_id,
            buyer_client_id: buy.client_id,
            seller_client_id: sell.client_id,
            quantity,
            price,
            executed_at_ms: now,
        }))
    }

    // ========================================================================
    // Keeper duties (continuous-phase ticks)
    // ========================================================================

    /// Book pending triggered orders whose window contains the last price.
    pub async fn activate_triggered_orders(&self) -> Result<usize, ExchangeError> {
        let booked = self.books.booked_ids().await;
        let now = time::now_ms();
        let mut activated = 0;
        for order in self.store.list_pending_orders().await? {
            if order.trigger == Trigger::Market
                || booked.contains(&order.order_id)
                || order.is_expired(now)
            {
                continue;
            }
            let Some(last) = self.last_price(order.action_id).await? else {
                continue;
            };
            if order.window_contains(last) {
                self.accumulate(&order).await;
                self.journal
                    .record(
                        order.client_id,
                        Sender::Server,
                        MessageType::AccumulatingOrder,
                        format!("Order {} activated at price {last}", order.order_id),
                    )
                    .await;
                activated += 1;
            }
        }
        Ok(activated)
    }

    /// Delete pending orders past their expiration, store and book both.
    pub async fn expire_pending_orders(&self) -> Result<usize, ExchangeError> {
        let now = time::now_ms();
        let mut expired = 0;
        for order in self.store.list_pending_orders().await? {
            if !order.is_expired(now) {
                continue;
            }
            self.store.delete_pending_order(order.client_id, order.order_id).await?;
            self.books.remove_entry(order.action_id, order.side, order.order_id).await;
            self.journal
                .record(
                    order.client_id,
                    Sender::Server,
                    MessageType::OrderExpired,
                    format!("Order {} expired", order.order_id),
                )
                .await;
            expired += 1;
        }
        Ok(expired)
    }
}

fn completed_fragment(
    order_id: i64,
    entry: &BookEntry,
    action_id: i64,
    quantity: i64,
    price: Decimal,
    date: i64,
    intraday: i64,
) -> Order {
    Order {
        order_id,
        client_id: entry.client_id,
        action_id,
        side: entry.side,
        trigger: entry.trigger,
        quantity,
        price: Price::Limit(price),
        trigger_price_lower: entry.trigger_price_lower,
        trigger_price_upper: entry.trigger_price_upper,
        order_date: date,
        order_intraday: intraday,
        expiration_date: entry.expiration_date,
        expiration_intraday: entry.expiration_intraday,
        status: OrderStatus::Completed,
    }
}

fn residual_order(order_id: i64, entry: &BookEntry, action_id: i64) -> Order {
    Order {
        order_id,
        client_id: entry.client_id,
        action_id,
        side: entry.side,
        trigger: entry.trigger,
        quantity: entry.remaining,
        price: entry.price,
        trigger_price_lower: entry.trigger_price_lower,
        trigger_price_upper: entry.trigger_price_upper,
        order_date: entry.order_date,
        order_intraday: entry.order_intraday,
        expiration_date: entry.expiration_date,
        expiration_intraday: entry.expiration_intraday,
        status: OrderStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use rust_decimal_macros::dec;

    struct Harness {
        store: Store,
        ids: Arc<IdAllocator>,
        engine: MatchingEngine,
    }

    async fn harness() -> Harness {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let store = db.store();
        let ids = Arc::new(IdAllocator::load(&store).await.unwrap());
        let journal = Journal::new(store.clone(), ids.clone());
        let engine = MatchingEngine::new(store.clone(), ids.clone(), journal);
        Harness { store, ids, engine }
    }

    impl Harness {
        async fn add_client(&self, name: &str, balance: Decimal, portfolio: &[(i64, i64)]) -> i64 {
            let id = self.ids.next_client_id();
            self.store
                .insert_client(id, name, name.as_bytes(), balance, portfolio)
                .await
                .unwrap();
            id
        }

        async fn add_action(&self, name: &str, quantity: i64, price: Decimal) -> i64 {
            let id = self.ids.next_action_id();
            self.store.upsert_action(id, name, quantity).await.unwrap();
            self.store.append_price(id, price, 0, 0).await.unwrap();
            id
        }

        /// Persist a pending order and book it, as order entry does.
        async fn submit(
            &self,
            client_id: i64,
            action_id: i64,
            side: Side,
            quantity: i64,
            price: Price,
            at_ms: i64,
        ) -> i64 {
            let order = Order {
                order_id: self.ids.next_order_id(),
                client_id,
                action_id,
                side,
                trigger: if price.is_market() { Trigger::Market } else { Trigger::Limit },
                quantity,
                price,
                trigger_price_lower: Decimal::ZERO,
                trigger_price_upper: None,
                order_date: crate::time::date_part(at_ms),
                order_intraday: crate::time::intraday_part(at_ms),
                expiration_date: None,
                expiration_intraday: 0,
                status: OrderStatus::Pending,
            };
            self.store.insert_pending_order(&order).await.unwrap();
            self.engine.accumulate(&order).await;
            order.order_id
        }

        async fn transaction_count(&self) -> usize {
            self.store
                .list_messages()
                .await
                .unwrap()
                .iter()
                .filter(|m| m.message_type == MessageType::Transaction)
                .count()
        }
    }

    #[tokio::test]
    async fn test_basic_crossed_pair() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(10)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;
        let b = h.add_client("B", dec!(0), &[(sec, 10)]).await;

        h.submit(b, sec, Side::Sell, 5, Price::Limit(dec!(20)), 1_000).await;
        h.submit(a, sec, Side::Buy, 5, Price::Limit(dec!(25)), 2_000).await;

        let fills = h.engine.run_fixing().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].quantity, 5);
        assert_eq!(fills[0].price, dec!(20));
        assert_eq!(fills[0].buyer_client_id, a);
        assert_eq!(fills[0].seller_client_id, b);

        assert_eq!(h.store.balance(a).await.unwrap(), dec!(900));
        assert_eq!(h.store.balance(b).await.unwrap(), dec!(100));
        assert_eq!(h.store.holding_quantity(a, sec).await.unwrap(), 5);
        assert_eq!(h.store.holding_quantity(b, sec).await.unwrap(), 5);

        assert_eq!(h.transaction_count().await, 1);
        assert!(h.store.list_pending_orders().await.unwrap().is_empty());
        assert!(h.engine.books().booked_ids().await.is_empty());

        // Completed rows, one fragment per side.
        assert_eq!(h.store.completed_orders_for_client(a).await.unwrap().len(), 1);
        assert_eq!(h.store.completed_orders_for_client(b).await.unwrap().len(), 1);

        // The fill printed a tick at the seller's price.
        assert_eq!(h.engine.last_price(sec).await.unwrap(), Some(dec!(20)));
    }

    #[tokio::test]
    async fn test_partial_fill_leaves_residual() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(10)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;
        let b = h.add_client("B", dec!(0), &[(sec, 10)]).await;

        let sell_id = h.submit(b, sec, Side::Sell, 10, Price::Limit(dec!(20)), 1_000).await;
        h.submit(a, sec, Side::Buy, 3, Price::Limit(dec!(25)), 2_000).await;

        let fills = h.engine.run_fixing().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].quantity, 3);

        assert_eq!(h.store.holding_quantity(a, sec).await.unwrap(), 3);
        assert_eq!(h.store.holding_quantity(b, sec).await.unwrap(), 7);

        // The residual sell re-entered store and book under a fresh id.
        let pending = h.store.list_pending_orders().await.unwrap();
        assert_eq!(pending.len(), 1);
        let residual = &pending[0];
        assert_ne!(residual.order_id, sell_id);
        assert_eq!(residual.side, Side::Sell);
        assert_eq!(residual.quantity, 7);
        assert_eq!(residual.price, Price::Limit(dec!(20)));
        assert!(h.engine.books().booked_ids().await.contains(&residual.order_id));

        // One 3-share fragment on each side.
        let a_completed = h.store.completed_orders_for_client(a).await.unwrap();
        let b_completed = h.store.completed_orders_for_client(b).await.unwrap();
        assert_eq!(a_completed.len(), 1);
        assert_eq!(b_completed.len(), 1);
        assert_eq!(a_completed[0].quantity, 3);
        assert_eq!(b_completed[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_price_time_priority() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(10)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;
        let c = h.add_client("C", dec!(1000), &[]).await;
        let b = h.add_client("B", dec!(0), &[(sec, 10)]).await;

        h.submit(a, sec, Side::Buy, 1, Price::Limit(dec!(20)), 1_000).await;
        let later = h.submit(c, sec, Side::Buy, 1, Price::Limit(dec!(20)), 2_000).await;
        h.submit(b, sec, Side::Sell, 1, Price::Limit(dec!(20)), 3_000).await;

        let fills = h.engine.run_fixing().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].buyer_client_id, a);

        assert_eq!(h.store.holding_quantity(a, sec).await.unwrap(), 1);
        assert_eq!(h.store.holding_quantity(c, sec).await.unwrap(), 0);

        // C's order is still pending and booked.
        let pending = h.store.list_pending_orders().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_id, later);
    }

    #[tokio::test]
    async fn test_market_buy_walks_the_sell_book() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(10)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;
        let b = h.add_client("B", dec!(0), &[(sec, 10)]).await;

        h.submit(b, sec, Side::Sell, 3, Price::Limit(dec!(15)), 1_000).await;
        h.submit(b, sec, Side::Sell, 2, Price::Limit(dec!(18)), 2_000).await;
        h.submit(a, sec, Side::Buy, 4, Price::Market, 3_000).await;

        let fills = h.engine.try_run_continuous().await.unwrap().unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!((fills[0].quantity, fills[0].price), (3, dec!(15)));
        assert_eq!((fills[1].quantity, fills[1].price), (1, dec!(18)));

        // 3*15 + 1*18 = 63
        assert_eq!(h.store.balance(a).await.unwrap(), dec!(937));
        assert_eq!(h.store.balance(b).await.unwrap(), dec!(63));
        assert_eq!(h.store.holding_quantity(a, sec).await.unwrap(), 4);

        // The 1-share remainder of the second sell stays.
        let pending = h.store.list_pending_orders().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].quantity, 1);
        assert_eq!(pending[0].price, Price::Limit(dec!(18)));
    }

    #[tokio::test]
    async fn test_no_cross_no_fills() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(10)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;
        let b = h.add_client("B", dec!(0), &[(sec, 10)]).await;

        h.submit(a, sec, Side::Buy, 5, Price::Limit(dec!(15)), 1_000).await;
        h.submit(b, sec, Side::Sell, 5, Price::Limit(dec!(20)), 2_000).await;

        let fills = h.engine.run_fixing().await.unwrap();
        assert!(fills.is_empty());
        assert_eq!(h.transaction_count().await, 0);
        assert_eq!(h.store.list_pending_orders().await.unwrap().len(), 2);
        assert_eq!(h.engine.books().booked_ids().await.len(), 2);
        assert_eq!(h.store.balance(a).await.unwrap(), dec!(1000));
    }

    #[tokio::test]
    async fn test_fixing_reentry_is_idempotent() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(10)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;
        let b = h.add_client("B", dec!(0), &[(sec, 10)]).await;

        h.submit(b, sec, Side::Sell, 10, Price::Limit(dec!(20)), 1_000).await;
        h.submit(a, sec, Side::Buy, 3, Price::Limit(dec!(25)), 2_000).await;

        let first = h.engine.run_fixing().await.unwrap();
        assert_eq!(first.len(), 1);

        // No new orders: a second fixing produces no fills and no new rows.
        let second = h.engine.run_fixing().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(h.transaction_count().await, 1);
        assert_eq!(h.store.list_pending_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_independent_securities_commute() {
        let h = harness().await;
        let sec1 = h.add_action("CAC40", 100, dec!(10)).await;
        let sec2 = h.add_action("SP500", 100, dec!(20)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;
        let b = h.add_client("B", dec!(0), &[(sec1, 10), (sec2, 10)]).await;

        h.submit(b, sec1, Side::Sell, 2, Price::Limit(dec!(10)), 1_000).await;
        h.submit(b, sec2, Side::Sell, 2, Price::Limit(dec!(20)), 1_000).await;
        h.submit(a, sec1, Side::Buy, 2, Price::Limit(dec!(10)), 2_000).await;
        h.submit(a, sec2, Side::Buy, 2, Price::Limit(dec!(20)), 2_000).await;

        let fills = h.engine.run_fixing().await.unwrap();
        assert_eq!(fills.len(), 2);

        // 1000 - 2*10 - 2*20
        assert_eq!(h.store.balance(a).await.unwrap(), dec!(940));
        assert_eq!(h.store.holding_quantity(a, sec1).await.unwrap(), 2);
        assert_eq!(h.store.holding_quantity(a, sec2).await.unwrap(), 2);
        assert_eq!(h.store.holding_quantity(b, sec1).await.unwrap(), 8);
        assert_eq!(h.store.holding_quantity(b, sec2).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_shares_conserved_across_fills() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 10, dec!(10)).await;
        let a = h.add_client("A", dec!(10000), &[]).await;
        let b = h.add_client("B", dec!(0), &[(sec, 10)]).await;

        h.submit(b, sec, Side::Sell, 4, Price::Limit(dec!(10)), 1_000).await;
        h.submit(b, sec, Side::Sell, 6, Price::Limit(dec!(12)), 1_500).await;
        h.submit(a, sec, Side::Buy, 7, Price::Limit(dec!(12)), 2_000).await;

        h.engine.run_fixing().await.unwrap();

        let total = h.store.holding_quantity(a, sec).await.unwrap()
            + h.store.holding_quantity(b, sec).await.unwrap();
        assert_eq!(total, 10);
        let action = h.store.get_action(sec).await.unwrap().unwrap();
        assert!(total <= action.quantity);
    }

    #[tokio::test]
    async fn test_trigger_activation_books_pending_order() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(18)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;
        h.engine.seed_last_prices().await.unwrap();

        // Window [15, 20] contains the last price 18; [25, inf) does not.
        let in_window = Order {
            order_id: h.ids.next_order_id(),
            client_id: a,
            action_id: sec,
            side: Side::Buy,
            trigger: Trigger::LimitStop,
            quantity: 1,
            price: Price::Limit(dec!(19)),
            trigger_price_lower: dec!(15),
            trigger_price_upper: Some(dec!(20)),
            order_date: 0,
            order_intraday: 0,
            expiration_date: None,
            expiration_intraday: 0,
            status: OrderStatus::Pending,
        };
        let mut out_of_window = in_window.clone();
        out_of_window.order_id = h.ids.next_order_id();
        out_of_window.trigger = Trigger::Limit;
        out_of_window.trigger_price_lower = dec!(25);
        out_of_window.trigger_price_upper = None;
        h.store.insert_pending_order(&in_window).await.unwrap();
        h.store.insert_pending_order(&out_of_window).await.unwrap();

        let activated = h.engine.activate_triggered_orders().await.unwrap();
        assert_eq!(activated, 1);
        let booked = h.engine.books().booked_ids().await;
        assert!(booked.contains(&in_window.order_id));
        assert!(!booked.contains(&out_of_window.order_id));

        // A second tick does not re-book the already-activated order.
        assert_eq!(h.engine.activate_triggered_orders().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expiry_sweep_removes_stale_orders() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(10)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;

        let stale = h.submit(a, sec, Side::Buy, 1, Price::Limit(dec!(10)), 1_000).await;
        let mut orders = h.store.list_pending_orders().await.unwrap();
        let mut expired = orders.remove(0);
        // Rewrite with an expiration far in the past.
        h.store.delete_pending_order(a, stale).await.unwrap();
        expired.expiration_date = Some(0);
        expired.expiration_intraday = 1;
        h.store.insert_pending_order(&expired).await.unwrap();

        let fresh = h.submit(a, sec, Side::Buy, 1, Price::Limit(dec!(10)), 2_000).await;

        let swept = h.engine.expire_pending_orders().await.unwrap();
        assert_eq!(swept, 1);
        let pending = h.store.list_pending_orders().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_id, fresh);
        assert!(!h.engine.books().booked_ids().await.contains(&stale));

        let expired_logged = h
            .store
            .list_messages()
            .await
            .unwrap()
            .iter()
            .any(|m| m.message_type == MessageType::OrderExpired);
        assert!(expired_logged);
    }

    #[tokio::test]
    async fn test_rebuild_books_from_pending_market_orders() {
        let h = harness().await;
        let sec = h.add_action("CAC40", 100, dec!(10)).await;
        let a = h.add_client("A", dec!(1000), &[]).await;

        let booked = h.submit(a, sec, Side::Buy, 1, Price::Market, 1_000).await;
        let limit = Order {
            order_id: h.ids.next_order_id(),
            client_id: a,
            action_id: sec,
            side: Side::Buy,
            trigger: Trigger::Limit,
            quantity: 1,
            price: Price::Limit(dec!(9)),
            trigger_price_lower: dec!(1),
            trigger_price_upper: None,
            order_date: 0,
            order_intraday: 0,
            expiration_date: None,
            expiration_intraday: 0,
            status: OrderStatus::Pending,
        };
        h.store.insert_pending_order(&limit).await.unwrap();

        // A fresh engine over the same store rebuilds market orders only.
        let journal = Journal::new(h.store.clone(), h.ids.clone());
        let fresh = MatchingEngine::new(h.store.clone(), h.ids.clone(), journal);
        let count = fresh.rebuild_books().await.unwrap();
        assert_eq!(count, 1);
        let ids = fresh.books().booked_ids().await;
        assert!(ids.contains(&booked));
        assert!(!ids.contains(&limit.order_id));
    }
}
