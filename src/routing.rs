use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::persist::Persister;
use crate::store::TicketStore;
use crate::types::{
    MessageType, NewMessage, NewTicket, NormalizedMessage, SenderRole, TicketStatus,
    AUTO_CREATED_TAG, DEFAULT_PRIORITY, TICKET_CHANNEL,
};

const DESCRIPTION_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketResolution {
    /// An open ticket already existed for the contact.
    Existing(String),
    Created(String),
    /// Creation lost a race to a concurrent insert; the winner is reused.
    Reused(String),
}

impl TicketResolution {
    pub fn ticket_id(&self) -> &str {
        match self {
            TicketResolution::Existing(id)
            | TicketResolution::Created(id)
            | TicketResolution::Reused(id) => id,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, TicketResolution::Created(_))
    }
}

/// An outbound message as the agent sent it.
pub struct AgentReply<'a> {
    pub ticket_id: &'a str,
    pub content: String,
    pub message_type: MessageType,
    pub agent_name: &'a str,
    pub agent_id: Option<String>,
    pub media_url: Option<&'a str>,
    pub gateway_message_id: Option<&'a str>,
    pub instance: &'a str,
}

/// Resolver, creator and persister over a single store.
pub struct TicketRouter {
    store: Arc<dyn TicketStore>,
    persister: Persister,
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn new_ticket(
    phone: &str,
    display_name: &str,
    instance: &str,
    first_message: &str,
    at: DateTime<Utc>,
) -> NewTicket {
    NewTicket {
        title: format!("WhatsApp - {display_name}"),
        subject: format!("Conversation with {display_name}"),
        description: truncate_chars(first_message, DESCRIPTION_LIMIT),
        status: TicketStatus::Pending,
        priority: DEFAULT_PRIORITY.to_string(),
        channel: TICKET_CHANNEL.to_string(),
        metadata: json!({
            "client_name": display_name,
            "client_phone": phone,
            "instance_name": instance,
            "created_from": "whatsapp_webhook",
            "auto_created": true,
            "is_whatsapp": true,
        }),
        unread: true,
        tags: vec![TICKET_CHANNEL.to_string(), AUTO_CREATED_TAG.to_string()],
        last_message_at: at,
    }
}

fn message_metadata(phone: &str, message: &NormalizedMessage) -> Value {
    json!({
        "sender_role": message.sender_role().as_str(),
        "sender_phone": phone,
        "remote_jid": message.remote_jid,
        "gateway_message_id": message.gateway_message_id,
        "instance_name": message.instance,
        "from_me": message.from_me,
        "media_url": message.media_url,
        "media_caption": message.media_caption,
        "media_mimetype": message.media_mimetype,
        "file_name": message.file_name,
        "quoted": message.quoted,
        "gateway_event": message.raw,
    })
}

impl TicketRouter {
    pub fn new(store: Arc<dyn TicketStore>, persister: Persister) -> Self {
        Self { store, persister }
    }

    /// Store errors count as "no open ticket": a spare ticket is preferred
    /// over a lost message.
    pub async fn find_open_ticket(&self, phone: &str, instance: &str) -> Option<String> {
        match self.store.find_open_ticket(phone, instance).await {
            Ok(found) => found,
            Err(err) => {
                warn!(phone = %phone, instance = %instance, error = %err, "open ticket lookup failed; treating as none");
                None
            }
        }
    }

    pub async fn create_ticket(
        &self,
        phone: &str,
        display_name: &str,
        instance: &str,
        first_message: &str,
        at: DateTime<Utc>,
    ) -> Result<TicketResolution, StoreError> {
        let ticket = new_ticket(phone, display_name, instance, first_message, at);
        match self.store.insert_ticket(&ticket).await {
            Ok(id) => {
                info!(ticket_id = %id, phone = %phone, instance = %instance, "ticket created");
                Ok(TicketResolution::Created(id))
            }
            Err(StoreError::Conflict { phone, instance }) => {
                match self.find_open_ticket(&phone, &instance).await {
                    Some(id) => {
                        info!(ticket_id = %id, phone = %phone, instance = %instance, "concurrent ticket creation, reusing winner");
                        Ok(TicketResolution::Reused(id))
                    }
                    None => Err(StoreError::Conflict { phone, instance }),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn resolve_or_create(
        &self,
        phone: &str,
        message: &NormalizedMessage,
    ) -> Result<TicketResolution, StoreError> {
        if let Some(id) = self.find_open_ticket(phone, &message.instance).await {
            return Ok(TicketResolution::Existing(id));
        }
        self.create_ticket(
            phone,
            &message.sender_name,
            &message.instance,
            &message.content,
            message.timestamp,
        )
        .await
    }

    /// Appends an inbound message to its ticket and bumps the ticket.
    pub async fn persist(
        &self,
        ticket_id: &str,
        phone: &str,
        message: &NormalizedMessage,
    ) -> Result<String, StoreError> {
        let row = NewMessage {
            ticket_id: ticket_id.to_string(),
            content: message.content.clone(),
            message_type: message.message_type,
            sender_name: message.sender_name.clone(),
            sender_id: None,
            metadata: message_metadata(phone, message),
            created_at: message.timestamp,
        };
        self.persister.write(row).await
    }

    /// Records a reply an agent already sent through the gateway. The
    /// gateway's echo of it is filtered as self-sent, so this is its only row.
    pub async fn record_agent_reply(&self, reply: AgentReply<'_>) -> Result<String, StoreError> {
        let row = NewMessage {
            ticket_id: reply.ticket_id.to_string(),
            content: reply.content,
            message_type: reply.message_type,
            sender_name: reply.agent_name.to_string(),
            sender_id: reply.agent_id,
            metadata: json!({
                "sender_role": SenderRole::Agent.as_str(),
                "gateway_message_id": reply.gateway_message_id,
                "instance_name": reply.instance,
                "media_url": reply.media_url,
                "from_me": true,
            }),
            created_at: Utc::now(),
        };
        self.store.insert_message(&row).await
    }

    pub async fn close(&self) {
        self.persister.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::InstrumentedStore;

    fn inbound(id: &str, text: &str) -> NormalizedMessage {
        NormalizedMessage {
            raw_phone: "5511988887766".to_string(),
            remote_jid: "5511988887766@s.whatsapp.net".to_string(),
            sender_name: "Ana".to_string(),
            content: text.to_string(),
            message_type: MessageType::Text,
            media_url: None,
            media_caption: None,
            media_mimetype: None,
            file_name: None,
            quoted: None,
            instance: "support1".to_string(),
            gateway_message_id: id.to_string(),
            timestamp: Utc::now(),
            from_me: false,
            raw: json!({}),
        }
    }

    fn router(store: Arc<InstrumentedStore>) -> TicketRouter {
        TicketRouter::new(store.clone(), Persister::Direct(store))
    }

    #[tokio::test]
    async fn creates_ticket_with_contact_metadata() {
        let store = Arc::new(InstrumentedStore::default());
        let router = router(store.clone());

        let resolution = router
            .resolve_or_create("11988887766", &inbound("m1", "Hello"))
            .await
            .expect("resolution");
        assert!(resolution.created());

        let tickets = store.inner.tickets().await;
        assert_eq!(tickets.len(), 1);
        let ticket = &tickets[0];
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert_eq!(ticket.channel, "whatsapp");
        assert!(ticket.unread);
        assert!(ticket.tags.iter().any(|t| t == AUTO_CREATED_TAG));
        assert_eq!(ticket.client_phone(), Some("11988887766"));
        assert_eq!(ticket.instance_name(), Some("support1"));
        assert_eq!(ticket.metadata["client_name"], "Ana");
        assert_eq!(ticket.description, "Hello");
    }

    #[tokio::test]
    async fn sequential_messages_reuse_open_ticket() {
        let store = Arc::new(InstrumentedStore::default());
        let router = router(store.clone());

        let first = router
            .resolve_or_create("11988887766", &inbound("m1", "Hello"))
            .await
            .expect("first");
        let second = router
            .resolve_or_create("11988887766", &inbound("m2", "Again"))
            .await
            .expect("second");

        assert_eq!(second, TicketResolution::Existing(first.ticket_id().to_string()));
        assert_eq!(store.inner.tickets().await.len(), 1);
    }

    #[tokio::test]
    async fn resolved_tickets_and_other_instances_are_not_reused() {
        let store = Arc::new(InstrumentedStore::default());
        let router = router(store.clone());

        let first = router
            .resolve_or_create("11988887766", &inbound("m1", "Hello"))
            .await
            .expect("first");
        store
            .inner
            .set_ticket_status(first.ticket_id(), TicketStatus::Resolved)
            .await;

        let after_resolve = router
            .resolve_or_create("11988887766", &inbound("m2", "New issue"))
            .await
            .expect("after resolve");
        assert!(after_resolve.created());

        let mut other = inbound("m3", "Hi");
        other.instance = "sales".to_string();
        let other_instance = router
            .resolve_or_create("11988887766", &other)
            .await
            .expect("other instance");
        assert!(other_instance.created());
        assert_eq!(store.inner.tickets().await.len(), 3);
    }

    #[tokio::test]
    async fn lookup_failure_biases_toward_creating() {
        let store = Arc::new(InstrumentedStore::failing_lookups());
        let router = router(store.clone());

        let resolution = router
            .resolve_or_create("11988887766", &inbound("m1", "Hello"))
            .await
            .expect("resolution");
        assert!(resolution.created());
    }

    #[tokio::test]
    async fn failed_insert_is_reported_not_faked() {
        let store = Arc::new(InstrumentedStore::failing_ticket_inserts());
        let router = router(store);

        let result = router
            .resolve_or_create("11988887766", &inbound("m1", "Hello"))
            .await;
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn concurrent_first_contacts_can_split_without_constraint() {
        let store = Arc::new(InstrumentedStore::gated(MemoryStore::new(), 2));
        let router = router(store.clone());
        let (a, b) = (inbound("m1", "Hello"), inbound("m2", "Anyone?"));

        let (first, second) = tokio::join!(
            router.resolve_or_create("11988887766", &a),
            router.resolve_or_create("11988887766", &b),
        );

        let (first, second) = (first.expect("first"), second.expect("second"));
        assert!(first.created() && second.created());
        assert_ne!(first.ticket_id(), second.ticket_id());
        assert_eq!(store.inner.tickets().await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_contacts_converge_with_constraint() {
        let store = Arc::new(InstrumentedStore::gated(
            MemoryStore::with_open_ticket_constraint(),
            2,
        ));
        let router = router(store.clone());
        let (a, b) = (inbound("m1", "Hello"), inbound("m2", "Anyone?"));

        let (first, second) = tokio::join!(
            router.resolve_or_create("11988887766", &a),
            router.resolve_or_create("11988887766", &b),
        );

        let (first, second) = (first.expect("first"), second.expect("second"));
        assert_eq!(first.ticket_id(), second.ticket_id());
        assert_eq!(
            [first.created(), second.created()]
                .iter()
                .filter(|c| **c)
                .count(),
            1
        );
        assert!(matches!(second, TicketResolution::Reused(_)) || matches!(first, TicketResolution::Reused(_)));
        assert_eq!(store.inner.tickets().await.len(), 1);
    }

    #[tokio::test]
    async fn persist_writes_one_row_and_one_bump() {
        let store = Arc::new(InstrumentedStore::default());
        let router = router(store.clone());
        let message = inbound("m1", "Hello");

        let ticket = router
            .resolve_or_create("11988887766", &message)
            .await
            .expect("ticket");
        router
            .persist(ticket.ticket_id(), "11988887766", &message)
            .await
            .expect("persist");

        let rows = store.inner.messages().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "Hello");
        assert_eq!(rows[0].sender_name, "Ana");
        assert_eq!(rows[0].metadata["sender_role"], "client");
        assert_eq!(rows[0].metadata["gateway_message_id"], "m1");
        assert_eq!(store.bump_count(), 1);
    }

    #[test]
    fn description_is_truncated_on_char_boundary() {
        let long = "é".repeat(DESCRIPTION_LIMIT + 10);
        let cut = truncate_chars(&long, DESCRIPTION_LIMIT);
        assert_eq!(cut.chars().count(), DESCRIPTION_LIMIT + 3);
        assert_eq!(truncate_chars("short", DESCRIPTION_LIMIT), "short");
    }
}
