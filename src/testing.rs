//! Store doubles shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Barrier;

use crate::error::StoreError;
use crate::store::{MemoryStore, TicketStore};
use crate::types::{InstanceStatus, NewMessage, NewTicket, Ticket, TicketStatus};

pub fn sample_ticket(phone: &str, instance: &str) -> NewTicket {
    NewTicket {
        title: "WhatsApp - Ana".to_string(),
        subject: "Conversation with Ana".to_string(),
        description: String::new(),
        status: TicketStatus::Pending,
        priority: "medium".to_string(),
        channel: "whatsapp".to_string(),
        metadata: json!({ "client_phone": phone, "instance_name": instance }),
        unread: true,
        tags: vec!["whatsapp".to_string()],
        last_message_at: Utc::now(),
    }
}

/// Wraps a [`MemoryStore`], counting bumps and optionally injecting faults
/// or holding the first lookups at a barrier.
#[derive(Default)]
pub struct InstrumentedStore {
    pub inner: MemoryStore,
    pub fail_lookups: bool,
    pub fail_ticket_inserts: bool,
    pub fail_bumps: bool,
    /// First `n` lookups wait here after reading, so concurrent callers all
    /// observe the same (empty) state before anyone creates.
    pub lookup_gate: Option<(Barrier, usize)>,
    lookups: AtomicUsize,
    bumps: AtomicUsize,
}

impl InstrumentedStore {
    pub fn gated(inner: MemoryStore, callers: usize) -> Self {
        Self {
            inner,
            lookup_gate: Some((Barrier::new(callers), callers)),
            ..Self::default()
        }
    }

    pub fn failing_lookups() -> Self {
        Self {
            fail_lookups: true,
            ..Self::default()
        }
    }

    pub fn failing_ticket_inserts() -> Self {
        Self {
            fail_ticket_inserts: true,
            ..Self::default()
        }
    }

    pub fn failing_bumps() -> Self {
        Self {
            fail_bumps: true,
            ..Self::default()
        }
    }

    pub fn bump_count(&self) -> usize {
        self.bumps.load(Ordering::SeqCst)
    }
}

fn injected() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl TicketStore for InstrumentedStore {
    async fn find_open_ticket(
        &self,
        phone: &str,
        instance: &str,
    ) -> Result<Option<String>, StoreError> {
        if self.fail_lookups {
            return Err(injected());
        }
        let found = self.inner.find_open_ticket(phone, instance).await;
        let seen = self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some((barrier, callers)) = &self.lookup_gate {
            if seen < *callers {
                barrier.wait().await;
            }
        }
        found
    }

    async fn insert_ticket(&self, ticket: &NewTicket) -> Result<String, StoreError> {
        if self.fail_ticket_inserts {
            return Err(injected());
        }
        self.inner.insert_ticket(ticket).await
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError> {
        self.inner.get_ticket(ticket_id).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<String, StoreError> {
        self.inner.insert_message(message).await
    }

    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<Vec<String>, StoreError> {
        self.inner.insert_messages(messages).await
    }

    async fn bump_ticket(&self, ticket_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if self.fail_bumps {
            return Err(injected());
        }
        self.bumps.fetch_add(1, Ordering::SeqCst);
        self.inner.bump_ticket(ticket_id, at).await
    }

    async fn mark_message_deleted(&self, gateway_message_id: &str) -> Result<u64, StoreError> {
        self.inner.mark_message_deleted(gateway_message_id).await
    }

    async fn upsert_instance_status(&self, status: &InstanceStatus) -> Result<(), StoreError> {
        self.inner.upsert_instance_status(status).await
    }
}
