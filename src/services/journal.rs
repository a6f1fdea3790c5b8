//! Append-only audit log of typed events.
//!
//! The dispatcher records every command (including validation failures), the
//! session controller records phase transitions, and the matcher records
//! transactions. Appends are best-effort: a store failure is traced and the
//! triggering operation continues.

use std::sync::Arc;

use crate::db::{IdAllocator, Store};
use crate::models::{Message, MessageType, Sender};
use crate::time;

#[derive(Clone)]
pub struct Journal {
    store: Store,
    ids: Arc<IdAllocator>,
}

impl Journal {
    pub fn new(store: Store, ids: Arc<IdAllocator>) -> Self {
        Self { store, ids }
    }

    /// Append an entry stamped with the current time.
    pub async fn record(
        &self,
        client_id: i64,
        sender: Sender,
        message_type: MessageType,
        payload: impl Into<String>,
    ) {
        self.record_at(client_id, sender, message_type, payload, time::now_ms())
            .await;
    }

    /// Append an entry stamped with an explicit time.
    pub async fn record_at(
        &self,
        client_id: i64,
        sender: Sender,
        message_type: MessageType,
        payload: impl Into<String>,
        at_ms: i64,
    ) {
        let message = Message {
            message_id: self.ids.next_message_id(),
            client_id,
            sender,
            message_type,
            payload: payload.into(),
            date_part: time::date_part(at_ms),
            intraday_part: time::intraday_part(at_ms),
        };
        if let Err(e) = self.store.append_message(&message).await {
            tracing::error!("failed to append {} message: {}", message.message_type, e);
        }
    }
}
