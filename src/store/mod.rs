mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{InstanceStatus, NewMessage, NewTicket, Ticket};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// The two tables the router touches, plus the per-instance status row.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Most recently created open ticket for a canonical phone on an instance.
    async fn find_open_ticket(
        &self,
        phone: &str,
        instance: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Inserts a ticket and returns the id the store assigned.
    async fn insert_ticket(&self, ticket: &NewTicket) -> Result<String, StoreError>;

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError>;

    async fn insert_message(&self, message: &NewMessage) -> Result<String, StoreError>;

    /// Inserts several messages all-or-nothing; ids come back in input order.
    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<Vec<String>, StoreError>;

    /// Sets `last_message_at` and flags the ticket unread.
    async fn bump_ticket(&self, ticket_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Replaces the content of messages carrying this gateway id. Returns the
    /// number of rows touched.
    async fn mark_message_deleted(&self, gateway_message_id: &str) -> Result<u64, StoreError>;

    async fn upsert_instance_status(&self, status: &InstanceStatus) -> Result<(), StoreError>;
}
