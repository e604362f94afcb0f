use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::TicketStore;
use crate::error::StoreError;
use crate::types::{
    InstanceStatus, NewMessage, NewTicket, Ticket, TicketStatus, DELETED_MESSAGE_PLACEHOLDER,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn open_statuses() -> Vec<String> {
    TicketStatus::OPEN
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn metadata_text(metadata: &Value, key: &str) -> String {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn parse_ticket_row(row: PgRow) -> Ticket {
    let status: String = row.get("status");
    Ticket {
        id: row.get("id"),
        title: row.get("title"),
        subject: row.get("subject"),
        description: row.get("description"),
        status: TicketStatus::parse(&status).unwrap_or(TicketStatus::Pending),
        priority: row.get("priority"),
        channel: row.get("channel"),
        metadata: row.get("metadata"),
        unread: row.get("unread"),
        tags: row.get("tags"),
        is_internal: row.get("is_internal"),
        last_message_at: row.get("last_message_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl TicketStore for PgStore {
    async fn find_open_ticket(
        &self,
        phone: &str,
        instance: &str,
    ) -> Result<Option<String>, StoreError> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM tickets \
             WHERE metadata->>'client_phone' = $1 \
               AND metadata->>'instance_name' = $2 \
               AND status = ANY($3::text[]) \
             ORDER BY created_at DESC \
             LIMIT 1",
        )
        .bind(phone)
        .bind(instance)
        .bind(open_statuses())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_ticket(&self, ticket: &NewTicket) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            "INSERT INTO tickets \
             (id, title, subject, description, status, priority, channel, metadata, unread, tags, is_internal, last_message_at, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,false,$11,NOW(),NOW())",
        )
        .bind(&id)
        .bind(&ticket.title)
        .bind(&ticket.subject)
        .bind(&ticket.description)
        .bind(ticket.status.as_str())
        .bind(&ticket.priority)
        .bind(&ticket.channel)
        .bind(&ticket.metadata)
        .bind(ticket.unread)
        .bind(&ticket.tags)
        .bind(ticket.last_message_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict {
                    phone: metadata_text(&ticket.metadata, "client_phone"),
                    instance: metadata_text(&ticket.metadata, "instance_name"),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, subject, description, status, priority, channel, metadata, unread, tags, \
                    is_internal, last_message_at, created_at, updated_at \
             FROM tickets WHERE id = $1",
        )
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_ticket_row))
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO messages \
             (id, ticket_id, content, type, sender_name, sender_id, is_internal, is_read, metadata, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,false,false,$7,$8)",
        )
        .bind(&id)
        .bind(&message.ticket_id)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(&message.sender_name)
        .bind(&message.sender_id)
        .bind(&message.metadata)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_messages(&self, messages: &[NewMessage]) -> Result<Vec<String>, StoreError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let ids = messages
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect::<Vec<_>>();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO messages \
             (id, ticket_id, content, type, sender_name, sender_id, is_internal, is_read, metadata, created_at) ",
        );
        builder.push_values(ids.iter().zip(messages), |mut row, (id, message)| {
            row.push_bind(id.clone())
                .push_bind(message.ticket_id.clone())
                .push_bind(message.content.clone())
                .push_bind(message.message_type.as_str())
                .push_bind(message.sender_name.clone())
                .push_bind(message.sender_id.clone())
                .push_bind(false)
                .push_bind(false)
                .push_bind(message.metadata.clone())
                .push_bind(message.created_at);
        });
        builder.build().execute(&self.pool).await?;
        Ok(ids)
    }

    async fn bump_ticket(&self, ticket_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tickets SET last_message_at = $1, unread = true, updated_at = NOW() WHERE id = $2",
        )
        .bind(at)
        .bind(ticket_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "ticket",
                id: ticket_id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_message_deleted(&self, gateway_message_id: &str) -> Result<u64, StoreError> {
        if gateway_message_id.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE messages \
             SET content = $1, metadata = metadata || '{\"deleted\": true}'::jsonb \
             WHERE metadata->>'gateway_message_id' = $2",
        )
        .bind(DELETED_MESSAGE_PLACEHOLDER)
        .bind(gateway_message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_instance_status(&self, status: &InstanceStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO instance_status (instance_name, connection_state, qrcode, last_event, last_event_at, payload)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (instance_name) DO UPDATE SET
                connection_state = COALESCE(EXCLUDED.connection_state, instance_status.connection_state),
                qrcode = COALESCE(EXCLUDED.qrcode, instance_status.qrcode),
                last_event = EXCLUDED.last_event,
                last_event_at = EXCLUDED.last_event_at,
                payload = EXCLUDED.payload
            "#,
        )
        .bind(&status.instance_name)
        .bind(&status.connection_state)
        .bind(&status.qrcode)
        .bind(&status.last_event)
        .bind(status.last_event_at)
        .bind(&status.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
