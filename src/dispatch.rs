use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::extract;
use crate::phone;
use crate::routing::TicketRouter;
use crate::store::TicketStore;
use crate::types::{DispatchOutcome, InstanceStatus, WebhookEnvelope};

/// What the dispatcher does with an event tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Inbound chat message: extract, resolve, create, persist.
    MessagesUpsert,
    MessagesDelete,
    ConnectionUpdate,
    QrcodeUpdated,
    /// Known gateway event with nothing to route; only the instance status
    /// row is touched.
    Minor,
    Unknown,
}

const EVENT_TABLE: &[(&str, EventKind)] = &[
    ("MESSAGES_UPSERT", EventKind::MessagesUpsert),
    ("MESSAGES_DELETE", EventKind::MessagesDelete),
    ("CONNECTION_UPDATE", EventKind::ConnectionUpdate),
    ("QRCODE_UPDATED", EventKind::QrcodeUpdated),
    ("APPLICATION_STARTUP", EventKind::Minor),
    ("MESSAGES_SET", EventKind::Minor),
    ("MESSAGES_UPDATE", EventKind::Minor),
    ("SEND_MESSAGE", EventKind::Minor),
    ("CONTACTS_SET", EventKind::Minor),
    ("CONTACTS_UPSERT", EventKind::Minor),
    ("CONTACTS_UPDATE", EventKind::Minor),
    ("PRESENCE_UPDATE", EventKind::Minor),
    ("CHATS_SET", EventKind::Minor),
    ("CHATS_UPSERT", EventKind::Minor),
    ("CHATS_UPDATE", EventKind::Minor),
    ("CHATS_DELETE", EventKind::Minor),
    ("GROUPS_UPSERT", EventKind::Minor),
    ("GROUP_UPDATE", EventKind::Minor),
    ("GROUP_PARTICIPANTS_UPDATE", EventKind::Minor),
    ("LABELS_EDIT", EventKind::Minor),
    ("LABELS_ASSOCIATION", EventKind::Minor),
    ("CALL", EventKind::Minor),
    ("TYPEBOT_START", EventKind::Minor),
    ("TYPEBOT_CHANGE_STATUS", EventKind::Minor),
    ("LOGOUT_INSTANCE", EventKind::Minor),
    ("REMOVE_INSTANCE", EventKind::Minor),
];

/// `messages.upsert`, `messages-upsert` and `MESSAGES_UPSERT` all name the
/// same event.
pub fn canonical_event(tag: &str) -> String {
    tag.trim()
        .chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

impl EventKind {
    pub fn parse(tag: &str) -> Self {
        let canonical = canonical_event(tag);
        EVENT_TABLE
            .iter()
            .find(|(name, _)| *name == canonical)
            .map(|(_, kind)| *kind)
            .unwrap_or(EventKind::Unknown)
    }
}

fn nested_text(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |node, key| node.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub struct Dispatcher {
    router: Arc<TicketRouter>,
    store: Arc<dyn TicketStore>,
}

impl Dispatcher {
    pub fn new(router: Arc<TicketRouter>, store: Arc<dyn TicketStore>) -> Self {
        Self { router, store }
    }

    /// Handles one webhook envelope. Failures are logged and folded into the
    /// outcome; nothing here propagates to the HTTP layer.
    pub async fn dispatch(&self, envelope: &WebhookEnvelope) -> DispatchOutcome {
        let kind = EventKind::parse(&envelope.event);
        debug!(
            event = %envelope.event,
            instance = %envelope.instance,
            sender = envelope.sender.as_deref().unwrap_or(""),
            server_url = envelope.server_url.as_deref().unwrap_or(""),
            ?kind,
            "dispatching webhook event"
        );
        match kind {
            EventKind::MessagesUpsert => self.route_message(envelope).await,
            EventKind::MessagesDelete => self.delete_message(envelope).await,
            EventKind::ConnectionUpdate => {
                let state = nested_text(&envelope.data, &["state"]);
                self.record_status(envelope, state, None).await
            }
            EventKind::QrcodeUpdated => {
                let qrcode = nested_text(&envelope.data, &["qrcode", "base64"])
                    .or_else(|| nested_text(&envelope.data, &["qrcode", "code"]));
                self.record_status(envelope, None, qrcode).await
            }
            EventKind::Minor => self.record_status(envelope, None, None).await,
            EventKind::Unknown => {
                info!(event = %envelope.event, instance = %envelope.instance, "unknown webhook event acknowledged");
                DispatchOutcome::processed("event acknowledged")
            }
        }
    }

    async fn route_message(&self, envelope: &WebhookEnvelope) -> DispatchOutcome {
        let message = match extract::extract(envelope) {
            Ok(message) => message,
            Err(reason) => {
                info!(instance = %envelope.instance, reason = %reason, "message skipped");
                return DispatchOutcome::skipped(reason.to_string());
            }
        };

        let phone = phone::normalize(&message.raw_phone);
        if phone.is_empty() {
            info!(instance = %message.instance, jid = %message.remote_jid, "message skipped: sender has no digits");
            return DispatchOutcome::skipped(extract::SkipReason::MissingSender.to_string());
        }

        let resolution = match self.router.resolve_or_create(&phone, &message).await {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(phone = %phone, instance = %message.instance, gateway_message_id = %message.gateway_message_id, error = %err, "ticket resolution failed; message not stored");
                return DispatchOutcome::degraded(format!("ticket could not be created: {err}"));
            }
        };
        let ticket_id = resolution.ticket_id().to_string();

        if let Err(err) = self.router.persist(&ticket_id, &phone, &message).await {
            error!(ticket_id = %ticket_id, gateway_message_id = %message.gateway_message_id, error = %err, "message persist failed");
            return DispatchOutcome {
                ticket_id: Some(ticket_id),
                ticket_created: Some(resolution.created()),
                ..DispatchOutcome::degraded(format!("message could not be stored: {err}"))
            };
        }

        info!(ticket_id = %ticket_id, phone = %phone, instance = %message.instance, created = resolution.created(), "message routed");
        let text = if resolution.created() {
            "message routed to new ticket"
        } else {
            "message routed to existing ticket"
        };
        DispatchOutcome {
            ticket_id: Some(ticket_id),
            ticket_created: Some(resolution.created()),
            ..DispatchOutcome::processed(text)
        }
    }

    async fn delete_message(&self, envelope: &WebhookEnvelope) -> DispatchOutcome {
        let data = &envelope.data;
        let Some(gateway_message_id) =
            nested_text(data, &["key", "id"]).or_else(|| nested_text(data, &["id"]))
        else {
            return DispatchOutcome::skipped("delete event has no message id");
        };
        match self.store.mark_message_deleted(&gateway_message_id).await {
            Ok(0) => {
                debug!(gateway_message_id = %gateway_message_id, "deleted message was never stored");
                DispatchOutcome::processed("no stored message matched")
            }
            Ok(count) => {
                info!(gateway_message_id = %gateway_message_id, count, "message marked deleted");
                DispatchOutcome::processed("message marked deleted")
            }
            Err(err) => {
                warn!(gateway_message_id = %gateway_message_id, error = %err, "message delete failed");
                DispatchOutcome::degraded(format!("message delete failed: {err}"))
            }
        }
    }

    async fn record_status(
        &self,
        envelope: &WebhookEnvelope,
        connection_state: Option<String>,
        qrcode: Option<String>,
    ) -> DispatchOutcome {
        let instance = envelope.instance.trim();
        if instance.is_empty() {
            return DispatchOutcome::skipped("event has no instance");
        }
        let status = InstanceStatus {
            instance_name: instance.to_string(),
            connection_state,
            qrcode,
            last_event: canonical_event(&envelope.event),
            last_event_at: Utc::now(),
            payload: envelope.data.clone(),
        };
        match self.store.upsert_instance_status(&status).await {
            Ok(()) => DispatchOutcome::processed("instance status recorded"),
            Err(err) => {
                warn!(instance = %instance, event = %status.last_event, error = %err, "instance status upsert failed");
                DispatchOutcome::degraded(format!("instance status not recorded: {err}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::Persister;
    use crate::testing::InstrumentedStore;
    use crate::types::DELETED_MESSAGE_PLACEHOLDER;
    use serde_json::json;

    fn dispatcher(store: Arc<InstrumentedStore>) -> Dispatcher {
        let router = Arc::new(TicketRouter::new(store.clone(), Persister::Direct(store.clone())));
        Dispatcher::new(router, store)
    }

    fn envelope(event: &str, data: Value) -> WebhookEnvelope {
        WebhookEnvelope {
            event: event.to_string(),
            instance: "support1".to_string(),
            data,
            ..WebhookEnvelope::default()
        }
    }

    fn hello(id: &str) -> WebhookEnvelope {
        envelope(
            "MESSAGES_UPSERT",
            json!({
                "key": { "remoteJid": "5511988887766@s.whatsapp.net", "fromMe": false, "id": id },
                "message": { "conversation": "Hello" },
                "messageTimestamp": 1700000000,
                "pushName": "Ana"
            }),
        )
    }

    #[test]
    fn event_tags_parse_in_every_spelling() {
        assert_eq!(EventKind::parse("MESSAGES_UPSERT"), EventKind::MessagesUpsert);
        assert_eq!(EventKind::parse("messages.upsert"), EventKind::MessagesUpsert);
        assert_eq!(EventKind::parse("messages-upsert"), EventKind::MessagesUpsert);
        assert_eq!(EventKind::parse("connection.update"), EventKind::ConnectionUpdate);
        assert_eq!(EventKind::parse("presence.update"), EventKind::Minor);
        assert_eq!(EventKind::parse("SOMETHING_NEW"), EventKind::Unknown);
        assert_eq!(EventKind::parse(""), EventKind::Unknown);
    }

    #[tokio::test]
    async fn upsert_creates_then_reuses_ticket() {
        let store = Arc::new(InstrumentedStore::default());
        let dispatcher = dispatcher(store.clone());

        let first = dispatcher.dispatch(&hello("m1")).await;
        assert!(first.processed);
        assert_eq!(first.ticket_created, Some(true));

        let second = dispatcher.dispatch(&hello("m2")).await;
        assert!(second.processed);
        assert_eq!(second.ticket_created, Some(false));
        assert_eq!(second.ticket_id, first.ticket_id);

        let tickets = store.inner.tickets().await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].client_phone(), Some("11988887766"));
        assert_eq!(store.inner.messages().await.len(), 2);
        assert_eq!(store.bump_count(), 2);
    }

    #[tokio::test]
    async fn self_sent_upsert_is_skipped_without_writes() {
        let store = Arc::new(InstrumentedStore::default());
        let dispatcher = dispatcher(store.clone());
        let mut event = hello("m1");
        event.data["key"]["fromMe"] = json!(true);

        let outcome = dispatcher.dispatch(&event).await;

        assert!(!outcome.processed);
        assert!(!outcome.degraded);
        assert!(outcome.ticket_id.is_none());
        assert!(store.inner.tickets().await.is_empty());
        assert!(store.inner.messages().await.is_empty());
    }

    #[tokio::test]
    async fn failed_ticket_creation_is_degraded_and_writes_nothing() {
        let store = Arc::new(InstrumentedStore::failing_ticket_inserts());
        let dispatcher = dispatcher(store.clone());

        let outcome = dispatcher.dispatch(&hello("m1")).await;

        assert!(!outcome.processed);
        assert!(outcome.degraded);
        assert!(outcome.ticket_id.is_none());
        assert!(store.inner.messages().await.is_empty());
    }

    #[tokio::test]
    async fn delete_event_replaces_stored_content() {
        let store = Arc::new(InstrumentedStore::default());
        let dispatcher = dispatcher(store.clone());
        dispatcher.dispatch(&hello("m1")).await;

        let outcome = dispatcher
            .dispatch(&envelope(
                "messages.delete",
                json!({ "id": "m1", "remoteJid": "5511988887766@s.whatsapp.net", "fromMe": false }),
            ))
            .await;

        assert!(outcome.processed);
        let rows = store.inner.messages().await;
        assert_eq!(rows[0].content, DELETED_MESSAGE_PLACEHOLDER);
        assert_eq!(rows[0].metadata["deleted"], true);
    }

    #[tokio::test]
    async fn connection_and_qrcode_events_upsert_instance_status() {
        let store = Arc::new(InstrumentedStore::default());
        let dispatcher = dispatcher(store.clone());

        dispatcher
            .dispatch(&envelope("QRCODE_UPDATED", json!({ "qrcode": { "base64": "data:image/png;base64,AAA" } })))
            .await;
        let outcome = dispatcher
            .dispatch(&envelope("CONNECTION_UPDATE", json!({ "state": "open" })))
            .await;
        assert!(outcome.processed);

        let status = store.inner.instance_status("support1").await.expect("status row");
        assert_eq!(status.connection_state.as_deref(), Some("open"));
        assert_eq!(status.qrcode.as_deref(), Some("data:image/png;base64,AAA"));
        assert_eq!(status.last_event, "CONNECTION_UPDATE");

        dispatcher
            .dispatch(&envelope("presence.update", json!({ "id": "x" })))
            .await;
        let status = store.inner.instance_status("support1").await.expect("status row");
        assert_eq!(status.connection_state.as_deref(), Some("open"));
        assert_eq!(status.last_event, "PRESENCE_UPDATE");
    }

    #[tokio::test]
    async fn unknown_event_is_acknowledged() {
        let store = Arc::new(InstrumentedStore::default());
        let dispatcher = dispatcher(store.clone());

        let outcome = dispatcher
            .dispatch(&envelope("BRAND_NEW_EVENT", json!({})))
            .await;

        assert!(outcome.processed);
        assert!(store.inner.instance_status("support1").await.is_none());
    }
}
