//! Trading session lifecycle.
//!
//! The controller walks the phases on wall-clock sleeps, runs the fixing at
//! open and close, owns the continuous-trading flag, and performs the keeper
//! duties each continuous tick (order expiry, trigger activation). It is the
//! only writer of the phase and flag; everyone else reads.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

use crate::config::AppConfig;
use crate::models::{MessageType, Sender};
use crate::services::journal::Journal;
use crate::services::matching::MatchingEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    PreOpen,
    OpenFixing,
    Continuous,
    PreClose,
    CloseFixing,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::PreOpen => "pre-open",
            SessionPhase::OpenFixing => "open-fixing",
            SessionPhase::Continuous => "continuous",
            SessionPhase::PreClose => "pre-close",
            SessionPhase::CloseFixing => "close-fixing",
            SessionPhase::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Shared session flags: the dispatcher reads, the controller writes.
pub struct SessionState {
    phase: parking_lot::RwLock<SessionPhase>,
    continuous: AtomicBool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: parking_lot::RwLock::new(SessionPhase::PreOpen),
            continuous: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == SessionPhase::Closed
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.write() = phase;
        tracing::info!(%phase, "session phase");
    }

    fn set_continuous(&self, active: bool) {
        self.continuous.store(active, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn begin_continuous_for_test(&self) {
        self.set_continuous(true);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SessionController {
    config: AppConfig,
    engine: Arc<MatchingEngine>,
    journal: Journal,
    state: Arc<SessionState>,
    shutdown: watch::Sender<bool>,
}

impl SessionController {
    pub fn new(
        config: AppConfig,
        engine: Arc<MatchingEngine>,
        journal: Journal,
        state: Arc<SessionState>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self { config, engine, journal, state, shutdown }
    }

    /// Drive the whole session, then signal shutdown.
    pub async fn run(self) {
        self.state.set_phase(SessionPhase::PreOpen);
        self.journal
            .record(
                0,
                Sender::Server,
                MessageType::PreOpenPhase,
                "Market pre-open phase, accumulating orders",
            )
            .await;
        sleep(Duration::from_millis(self.config.pre_open_ms)).await;

        self.state.set_phase(SessionPhase::OpenFixing);
        if let Err(e) = self.engine.run_fixing().await {
            tracing::error!("open fixing failed: {e}");
        }
        self.journal
            .record(0, Sender::Server, MessageType::OpenPhase, "Market open phase (fixing)")
            .await;
        sleep(Duration::from_millis(self.config.open_ms)).await;

        self.state.set_phase(SessionPhase::Continuous);
        self.journal
            .record(
                0,
                Sender::Server,
                MessageType::ContinuousTradingPhase,
                "Market continuous trading phase",
            )
            .await;
        self.state.set_continuous(true);
        let end = Instant::now() + Duration::from_millis(self.config.continuous_ms);
        while Instant::now() < end {
            sleep(Duration::from_millis(self.config.loop_ms)).await;
            self.keeper_tick().await;
        }
        self.state.set_continuous(false);

        self.state.set_phase(SessionPhase::PreClose);
        self.journal
            .record(0, Sender::Server, MessageType::PreClosePhase, "Market pre-close phase")
            .await;
        sleep(Duration::from_millis(self.config.pre_close_ms)).await;

        self.state.set_phase(SessionPhase::CloseFixing);
        if let Err(e) = self.engine.run_fixing().await {
            tracing::error!("close fixing failed: {e}");
        }
        self.journal
            .record(0, Sender::Server, MessageType::ClosePhase, "Market close phase (fixing)")
            .await;

        self.state.set_phase(SessionPhase::Closed);
        let _ = self.shutdown.send(true);
    }

    /// Expire stale orders, then activate triggered ones; activation may
    /// open crossing opportunities, so attempt a pass when it happens.
    async fn keeper_tick(&self) {
        if let Err(e) = self.engine.expire_pending_orders().await {
            tracing::error!("expiry sweep failed: {e}");
        }
        match self.engine.activate_triggered_orders().await {
            Ok(activated) if activated > 0 => {
                tracing::debug!(activated, "triggered orders booked");
                if let Err(e) = self.engine.try_run_continuous().await {
                    tracing::error!("continuous pass failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!("trigger activation failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, IdAllocator};
    use crate::models::{Order, OrderStatus, Price, Side, Trigger};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn test_config() -> AppConfig {
        AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "sqlite::memory:".into(),
            pre_open_ms: 10,
            open_ms: 10,
            continuous_ms: 50,
            loop_ms: 10,
            pre_close_ms: 10,
            process_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_full_session_lifecycle() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let store = db.store();
        let ids = Arc::new(IdAllocator::load(&store).await.unwrap());
        let journal = Journal::new(store.clone(), ids.clone());
        let engine = Arc::new(MatchingEngine::new(store.clone(), ids.clone(), journal.clone()));
        let state = Arc::new(SessionState::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        // Seed a crossable pair before the session starts (pre-open entry).
        store.upsert_action(1, "CAC40", 100).await.unwrap();
        store.append_price(1, dec!(10), 0, 0).await.unwrap();
        store.insert_client(1, "A", b"a", dec!(1000), &[]).await.unwrap();
        store.insert_client(2, "B", b"b", Decimal::ZERO, &[(1, 10)]).await.unwrap();
        for (client_id, side, price) in
            [(2, Side::Sell, dec!(20)), (1, Side::Buy, dec!(25))]
        {
            let order = Order {
                order_id: ids.next_order_id(),
                client_id,
                action_id: 1,
                side,
                trigger: Trigger::Market,
                quantity: 5,
                price: Price::Limit(price),
                trigger_price_lower: Decimal::ZERO,
                trigger_price_upper: None,
                order_date: 0,
                order_intraday: 0,
                expiration_date: None,
                expiration_intraday: 0,
                status: OrderStatus::Pending,
            };
            store.insert_pending_order(&order).await.unwrap();
            engine.accumulate(&order).await;
        }

        let controller = SessionController::new(
            test_config(),
            engine.clone(),
            journal,
            state.clone(),
            shutdown_tx,
        );
        controller.run().await;

        // The session closed and signalled shutdown.
        assert!(state.is_closed());
        assert!(!state.is_continuous());
        assert!(*shutdown_rx.borrow_and_update());

        // Open fixing matched the pre-open pair.
        assert_eq!(store.balance(1).await.unwrap(), dec!(900));
        assert_eq!(store.holding_quantity(1, 1).await.unwrap(), 5);

        // Every phase left an audit entry.
        let messages = store.list_messages().await.unwrap();
        for kind in [
            MessageType::PreOpenPhase,
            MessageType::OpenPhase,
            MessageType::ContinuousTradingPhase,
            MessageType::PreClosePhase,
            MessageType::ClosePhase,
            MessageType::Transaction,
        ] {
            assert!(
                messages.iter().any(|m| m.message_type == kind),
                "missing {kind} entry"
            );
        }
    }
}
