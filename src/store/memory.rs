use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::TicketStore;
use crate::error::StoreError;
use crate::types::{
    InstanceStatus, MessageRecord, NewMessage, NewTicket, Ticket, DELETED_MESSAGE_PLACEHOLDER,
};

#[derive(Default)]
struct MemoryTables {
    tickets: Vec<Ticket>,
    messages: Vec<MessageRecord>,
    instances: HashMap<String, InstanceStatus>,
}

/// In-process store. Without the open-ticket constraint it behaves like the
/// bare tables: concurrent first contacts can each insert a ticket.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    enforce_open_ticket_constraint: bool,
}

fn metadata_text<'a>(metadata: &'a Value, key: &str) -> &'a str {
    metadata.get(key).and_then(Value::as_str).unwrap_or("")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors the partial unique index of the Postgres schema.
    pub fn with_open_ticket_constraint() -> Self {
        Self {
            enforce_open_ticket_constraint: true,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub async fn tickets(&self) -> Vec<Ticket> {
        self.tables.lock().await.tickets.clone()
    }

    #[cfg(test)]
    pub async fn messages(&self) -> Vec<MessageRecord> {
        self.tables.lock().await.messages.clone()
    }

    #[cfg(test)]
    pub async fn instance_status(&self, instance: &str) -> Option<InstanceStatus> {
        self.tables.lock().await.instances.get(instance).cloned()
    }

    #[cfg(test)]
    pub async fn set_ticket_status(&self, ticket_id: &str, status: crate::types::TicketStatus) {
        let mut tables = self.tables.lock().await;
        if let Some(ticket) = tables.tickets.iter_mut().find(|t| t.id == ticket_id) {
            ticket.status = status;
        }
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn find_open_ticket(
        &self,
        phone: &str,
        instance: &str,
    ) -> Result<Option<String>, StoreError> {
        let tables = self.tables.lock().await;
        let found = tables
            .tickets
            .iter()
            .filter(|t| {
                t.status.is_open()
                    && t.client_phone() == Some(phone)
                    && t.instance_name() == Some(instance)
            })
            .max_by_key(|t| t.created_at)
            .map(|t| t.id.clone());
        Ok(found)
    }

    async fn insert_ticket(&self, ticket: &NewTicket) -> Result<String, StoreError> {
        let mut tables = self.tables.lock().await;
        let phone = metadata_text(&ticket.metadata, "client_phone");
        let instance = metadata_text(&ticket.metadata, "instance_name");
        if self.enforce_open_ticket_constraint && ticket.status.is_open() {
            let taken = tables.tickets.iter().any(|t| {
                t.status.is_open()
                    && t.channel == ticket.channel
                    && t.client_phone() == Some(phone)
                    && t.instance_name() == Some(instance)
            });
            if taken {
                return Err(StoreError::Conflict {
                    phone: phone.to_string(),
                    instance: instance.to_string(),
                });
            }
        }
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        tables.tickets.push(Ticket {
            id: id.clone(),
            title: ticket.title.clone(),
            subject: ticket.subject.clone(),
            description: ticket.description.clone(),
            status: ticket.status,
            priority: ticket.priority.clone(),
            channel: ticket.channel.clone(),
            metadata: ticket.metadata.clone(),
            unread: ticket.unread,
            tags: ticket.tags.clone(),
            is_internal: false,
            last_message_at: Some(ticket.last_message_at),
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.tickets.iter().find(|t| t.id == ticket_id).cloned())
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<String, StoreError> {
        let mut ids = self.insert_messages(std::slice::from_ref(message)).await?;
        ids.pop().ok_or_else(|| StoreError::NotFound {
            entity: "message",
            id: message.ticket_id.clone(),
        })
    }

    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<Vec<String>, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(orphan) = messages
            .iter()
            .find(|m| !tables.tickets.iter().any(|t| t.id == m.ticket_id))
        {
            return Err(StoreError::NotFound {
                entity: "ticket",
                id: orphan.ticket_id.clone(),
            });
        }
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let id = Uuid::new_v4().to_string();
            tables.messages.push(MessageRecord {
                id: id.clone(),
                ticket_id: message.ticket_id.clone(),
                content: message.content.clone(),
                message_type: message.message_type,
                sender_name: message.sender_name.clone(),
                sender_id: message.sender_id.clone(),
                is_internal: false,
                is_read: false,
                metadata: message.metadata.clone(),
                created_at: message.created_at,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn bump_ticket(&self, ticket_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let ticket = tables
            .tickets
            .iter_mut()
            .find(|t| t.id == ticket_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "ticket",
                id: ticket_id.to_string(),
            })?;
        ticket.last_message_at = Some(at);
        ticket.unread = true;
        ticket.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_message_deleted(&self, gateway_message_id: &str) -> Result<u64, StoreError> {
        if gateway_message_id.is_empty() {
            return Ok(0);
        }
        let mut tables = self.tables.lock().await;
        let mut touched = 0;
        for message in tables.messages.iter_mut().filter(|m| {
            metadata_text(&m.metadata, "gateway_message_id") == gateway_message_id
        }) {
            message.content = DELETED_MESSAGE_PLACEHOLDER.to_string();
            if let Some(meta) = message.metadata.as_object_mut() {
                meta.insert("deleted".to_string(), json!(true));
            }
            touched += 1;
        }
        Ok(touched)
    }

    async fn upsert_instance_status(&self, status: &InstanceStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .instances
            .entry(status.instance_name.clone())
            .or_insert_with(|| status.clone());
        entry.last_event = status.last_event.clone();
        entry.last_event_at = status.last_event_at;
        entry.payload = status.payload.clone();
        if status.connection_state.is_some() {
            entry.connection_state = status.connection_state.clone();
        }
        if status.qrcode.is_some() {
            entry.qrcode = status.qrcode.clone();
        }
        Ok(())
    }
}
