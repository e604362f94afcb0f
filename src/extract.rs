use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::phone::{self, JidKind};
use crate::types::{MessageType, NormalizedMessage, QuotedMessage, WebhookEnvelope};

/// Keys of a protocol message that never carry content on their own.
const NON_CONTENT_KEYS: [&str; 4] = ["messageContextInfo", "base64", "mediaUrl", "senderKeyDistributionMessage"];

/// Why an upsert event was filtered instead of routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingMessageId,
    SelfSent,
    NotDirectChat,
    MissingSender,
    NoContent,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::MissingMessageId => "message has no id",
            SkipReason::SelfSent => "self-sent message ignored",
            SkipReason::NotDirectChat => "group or broadcast message ignored",
            SkipReason::MissingSender => "message has no sender phone",
            SkipReason::NoContent => "message has no text or media",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedContent {
    content: String,
    message_type: MessageType,
    media_url: Option<String>,
    caption: Option<String>,
    mimetype: Option<String>,
    file_name: Option<String>,
    context_info: Option<Value>,
}

impl ResolvedContent {
    fn text(content: String, message_type: MessageType) -> Self {
        Self {
            content,
            message_type,
            media_url: None,
            caption: None,
            mimetype: None,
            file_name: None,
            context_info: None,
        }
    }

    fn has_payload(&self) -> bool {
        !self.content.trim().is_empty() || self.media_url.is_some()
    }
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The upsert body is a single message object in current gateway versions;
/// older versions wrap it in an array or under `messages`.
fn upsert_record(data: &Value) -> &Value {
    if let Some(first) = data.as_array().and_then(|items| items.first()) {
        return first;
    }
    if let Some(first) = data
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
    {
        return first;
    }
    data
}

fn parse_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    let seconds = match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(long) if long.is_object() => {
            let low = long.get("low").and_then(Value::as_i64).unwrap_or(0) & 0xFFFF_FFFF;
            let high = long.get("high").and_then(Value::as_i64).unwrap_or(0);
            Some((high << 32) | low)
        }
        _ => None,
    };
    // Some senders use milliseconds.
    let seconds = seconds.map(|s| if s > 10_000_000_000 { s / 1000 } else { s });
    seconds
        .filter(|s| *s > 0)
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .unwrap_or_else(Utc::now)
}

fn media_url(record: &Value, message: &Value, sub: &Value) -> Option<String> {
    text_field(record, "mediaUrl")
        .or_else(|| text_field(message, "mediaUrl"))
        .or_else(|| text_field(sub, "url"))
}

fn media_content(
    record: &Value,
    message: &Value,
    sub: &Value,
    message_type: MessageType,
    placeholder: String,
) -> ResolvedContent {
    let caption = text_field(sub, "caption");
    ResolvedContent {
        content: caption.clone().unwrap_or(placeholder),
        message_type,
        media_url: media_url(record, message, sub),
        caption,
        mimetype: text_field(sub, "mimetype"),
        file_name: text_field(sub, "fileName"),
        context_info: sub.get("contextInfo").cloned(),
    }
}

fn location_label(sub: &Value) -> String {
    if let Some(name) = text_field(sub, "name").or_else(|| text_field(sub, "address")) {
        return format!("[Location: {name}]");
    }
    let lat = sub.get("degreesLatitude").and_then(Value::as_f64);
    let lng = sub.get("degreesLongitude").and_then(Value::as_f64);
    match (lat, lng) {
        (Some(lat), Some(lng)) => format!("[Location: {lat}, {lng}]"),
        _ => "[Location]".to_string(),
    }
}

fn with_context(mut resolved: ResolvedContent, sub: &Value) -> ResolvedContent {
    resolved.context_info = sub.get("contextInfo").cloned();
    resolved
}

/// Resolves the first populated message sub-type in priority order. Plain
/// text wins over everything else when several fields are present.
fn resolve_content(record: &Value, message: &Value) -> Option<ResolvedContent> {
    if let Some(text) = text_field(message, "conversation") {
        return Some(ResolvedContent::text(text, MessageType::Text));
    }

    if let Some(sub) = message.get("extendedTextMessage") {
        if let Some(text) = text_field(sub, "text") {
            return Some(with_context(
                ResolvedContent::text(text, MessageType::Text),
                sub,
            ));
        }
    }

    if let Some(sub) = message.get("imageMessage") {
        return Some(media_content(record, message, sub, MessageType::Image, "[Image]".into()));
    }

    if let Some(sub) = message.get("videoMessage") {
        return Some(media_content(record, message, sub, MessageType::Video, "[Video]".into()));
    }

    if let Some(sub) = message.get("audioMessage") {
        let placeholder = if sub.get("ptt").and_then(Value::as_bool).unwrap_or(false) {
            "[Voice message]"
        } else {
            "[Audio]"
        };
        return Some(media_content(record, message, sub, MessageType::Audio, placeholder.into()));
    }

    let document = message.get("documentMessage").or_else(|| {
        message
            .get("documentWithCaptionMessage")
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("documentMessage"))
    });
    if let Some(sub) = document {
        let placeholder = match text_field(sub, "fileName").or_else(|| text_field(sub, "title")) {
            Some(name) => format!("[Document: {name}]"),
            None => "[Document]".to_string(),
        };
        return Some(media_content(record, message, sub, MessageType::Document, placeholder));
    }

    if let Some(sub) = message.get("stickerMessage") {
        return Some(media_content(record, message, sub, MessageType::Sticker, "[Sticker]".into()));
    }

    if let Some(sub) = message.get("locationMessage") {
        return Some(with_context(
            ResolvedContent::text(location_label(sub), MessageType::Location),
            sub,
        ));
    }

    if let Some(sub) = message.get("contactMessage") {
        let label = match text_field(sub, "displayName") {
            Some(name) => format!("[Contact: {name}]"),
            None => "[Contact]".to_string(),
        };
        return Some(ResolvedContent::text(label, MessageType::Contact));
    }

    if let Some(sub) = message.get("contactsArrayMessage") {
        let count = sub
            .get("contacts")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let label = match text_field(sub, "displayName") {
            Some(name) => format!("[Contacts: {name}]"),
            None => format!("[Contacts: {count}]"),
        };
        return Some(ResolvedContent::text(label, MessageType::Contact));
    }

    if let Some(sub) = message.get("liveLocationMessage") {
        let label = match text_field(sub, "caption") {
            Some(caption) => format!("[Live location: {caption}]"),
            None => "[Live location]".to_string(),
        };
        return Some(ResolvedContent::text(label, MessageType::LiveLocation));
    }

    let poll = ["pollCreationMessage", "pollCreationMessageV2", "pollCreationMessageV3"]
        .iter()
        .find_map(|key| message.get(*key));
    if let Some(sub) = poll {
        let label = match text_field(sub, "name") {
            Some(name) => format!("[Poll: {name}]"),
            None => "[Poll]".to_string(),
        };
        return Some(ResolvedContent::text(label, MessageType::Poll));
    }

    if let Some(sub) = message.get("listMessage") {
        let label = match text_field(sub, "title").or_else(|| text_field(sub, "description")) {
            Some(title) => format!("[List: {title}]"),
            None => "[List]".to_string(),
        };
        return Some(ResolvedContent::text(label, MessageType::List));
    }

    if let Some(sub) = message.get("listResponseMessage") {
        let label = text_field(sub, "title")
            .or_else(|| {
                sub.get("singleSelectReply")
                    .and_then(|v| text_field(v, "selectedRowId"))
            })
            .unwrap_or_else(|| "[List reply]".to_string());
        return Some(with_context(ResolvedContent::text(label, MessageType::List), sub));
    }

    if let Some(sub) = message.get("buttonsMessage") {
        let label = match text_field(sub, "contentText") {
            Some(text) => format!("[Buttons: {text}]"),
            None => "[Buttons]".to_string(),
        };
        return Some(ResolvedContent::text(label, MessageType::Buttons));
    }

    if let Some(sub) = message.get("buttonsResponseMessage") {
        let label = text_field(sub, "selectedDisplayText")
            .or_else(|| text_field(sub, "selectedButtonId"))
            .unwrap_or_else(|| "[Button reply]".to_string());
        return Some(with_context(ResolvedContent::text(label, MessageType::Buttons), sub));
    }

    if let Some(sub) = message.get("templateMessage") {
        let label = sub
            .get("hydratedTemplate")
            .and_then(|v| text_field(v, "hydratedContentText"))
            .map(|text| format!("[Template: {text}]"))
            .unwrap_or_else(|| "[Template]".to_string());
        return Some(ResolvedContent::text(label, MessageType::Template));
    }

    if let Some(sub) = message.get("templateButtonReplyMessage") {
        let label = text_field(sub, "selectedDisplayText")
            .unwrap_or_else(|| "[Template reply]".to_string());
        return Some(with_context(ResolvedContent::text(label, MessageType::Template), sub));
    }

    if let Some(sub) = message.get("reactionMessage") {
        let label = match text_field(sub, "text") {
            Some(emoji) => format!("[Reaction: {emoji}]"),
            None => "[Reaction removed]".to_string(),
        };
        return Some(ResolvedContent::text(label, MessageType::Reaction));
    }

    let unknown = message.as_object().and_then(|obj| {
        obj.iter()
            .find(|(key, value)| {
                !NON_CONTENT_KEYS.contains(&key.as_str()) && !is_known_key(key) && !value.is_null()
            })
            .map(|(key, _)| key.clone())
    })?;
    let label = text_field(record, "messageType").unwrap_or(unknown);
    Some(ResolvedContent::text(
        format!("[Unsupported: {label}]"),
        MessageType::Unsupported,
    ))
}

fn is_known_key(key: &str) -> bool {
    matches!(
        key,
        "conversation"
            | "extendedTextMessage"
            | "imageMessage"
            | "videoMessage"
            | "audioMessage"
            | "documentMessage"
            | "documentWithCaptionMessage"
            | "stickerMessage"
            | "locationMessage"
            | "contactMessage"
            | "contactsArrayMessage"
            | "liveLocationMessage"
            | "pollCreationMessage"
            | "pollCreationMessageV2"
            | "pollCreationMessageV3"
            | "listMessage"
            | "listResponseMessage"
            | "buttonsMessage"
            | "buttonsResponseMessage"
            | "templateMessage"
            | "templateButtonReplyMessage"
            | "reactionMessage"
    )
}

fn quoted_summary(context_info: Option<&Value>) -> Option<QuotedMessage> {
    let info = context_info?;
    let stanza_id = text_field(info, "stanzaId");
    let quoted = info.get("quotedMessage").filter(|v| v.is_object());
    if stanza_id.is_none() && quoted.is_none() {
        return None;
    }
    let preview = quoted
        .and_then(|q| resolve_content(&Value::Null, q))
        .map(|resolved| resolved.content);
    Some(QuotedMessage {
        stanza_id,
        participant: text_field(info, "participant"),
        preview,
    })
}

fn sender_phone(key: &Value, record: &Value) -> Option<String> {
    let remote_jid = text_field(key, "remoteJid")?;
    let jid = match phone::jid_kind(&remote_jid) {
        JidKind::LinkedIdentity => text_field(key, "senderPn")
            .or_else(|| text_field(key, "remoteJidAlt"))
            .or_else(|| text_field(record, "senderPn"))
            .unwrap_or(remote_jid),
        _ => remote_jid,
    };
    let user = phone::jid_user(&jid).to_string();
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

/// Maps a `MESSAGES_UPSERT` envelope onto a routable message, or says why it
/// should be skipped.
pub fn extract(envelope: &WebhookEnvelope) -> Result<NormalizedMessage, SkipReason> {
    let record = upsert_record(&envelope.data);
    let key = record.get("key").cloned().unwrap_or(Value::Null);

    let gateway_message_id = text_field(&key, "id").ok_or(SkipReason::MissingMessageId)?;
    let from_me = key.get("fromMe").and_then(Value::as_bool).unwrap_or(false);
    if from_me {
        return Err(SkipReason::SelfSent);
    }

    let remote_jid = text_field(&key, "remoteJid").unwrap_or_default();
    if matches!(
        phone::jid_kind(&remote_jid),
        JidKind::Group | JidKind::Broadcast
    ) {
        return Err(SkipReason::NotDirectChat);
    }
    let raw_phone = sender_phone(&key, record).ok_or(SkipReason::MissingSender)?;

    let message = record.get("message").cloned().unwrap_or(Value::Null);
    let resolved = resolve_content(record, &message)
        .filter(ResolvedContent::has_payload)
        .ok_or(SkipReason::NoContent)?;

    let context_info = resolved
        .context_info
        .as_ref()
        .or_else(|| record.get("contextInfo"));
    let quoted = quoted_summary(context_info);

    let sender_name = text_field(record, "pushName")
        .or_else(|| text_field(record, "verifiedBizName"))
        .or_else(|| text_field(record, "verifiedName"))
        .unwrap_or_else(|| phone::format_display(&raw_phone));

    Ok(NormalizedMessage {
        raw_phone,
        remote_jid,
        sender_name,
        content: resolved.content,
        message_type: resolved.message_type,
        media_url: resolved.media_url,
        media_caption: resolved.caption,
        media_mimetype: resolved.mimetype,
        file_name: resolved.file_name,
        quoted,
        instance: envelope.instance.trim().to_string(),
        gateway_message_id,
        timestamp: parse_timestamp(record.get("messageTimestamp")),
        from_me,
        raw: record.clone(),
    })
}
