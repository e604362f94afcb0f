use std::sync::OnceLock;

use regex::Regex;

const BRAZIL_COUNTRY_CODE: &str = "55";

fn jid_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?P<user>[^@:]+)(?::\d+)?@(?P<server>[a-z.]+)$").ok())
        .as_ref()
}

/// Which side of the gateway a JID points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JidKind {
    User,
    Group,
    Broadcast,
    LinkedIdentity,
    Other,
}

pub fn jid_kind(jid: &str) -> JidKind {
    let jid = jid.trim();
    if jid == "status@broadcast" || jid.ends_with("@broadcast") {
        return JidKind::Broadcast;
    }
    let Some(caps) = jid_pattern().and_then(|re| re.captures(jid)) else {
        return JidKind::Other;
    };
    match caps.name("server").map(|m| m.as_str()).unwrap_or("") {
        "s.whatsapp.net" | "c.us" => JidKind::User,
        "g.us" => JidKind::Group,
        "lid" => JidKind::LinkedIdentity,
        _ => JidKind::Other,
    }
}

/// User part of a JID (`5511988887766@s.whatsapp.net` -> `5511988887766`),
/// dropping any device suffix. Non-JID input is returned trimmed.
pub fn jid_user(jid: &str) -> &str {
    let jid = jid.trim();
    match jid_pattern()
        .and_then(|re| re.captures(jid))
        .and_then(|caps| caps.name("user"))
    {
        Some(user) => user.as_str(),
        None => jid,
    }
}

fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Canonical search key for a phone number in any of the shapes the gateway
/// and the UI hand us (JID, E.164, punctuated, legacy 10-digit).
///
/// A 13-digit number with the `55` prefix loses the prefix and is returned as
/// is; a 12-digit `55` number (country code plus legacy 10 digits) is left
/// untouched and therefore never gains the mobile `9`.
pub fn normalize(raw: &str) -> String {
    let digits = digits_only(jid_user(raw));
    match digits.len() {
        13 if digits.starts_with(BRAZIL_COUNTRY_CODE) => digits[2..].to_string(),
        11 => digits,
        10 => format!("{}9{}", &digits[..2], &digits[2..]),
        _ => digits,
    }
}

/// Number the gateway expects in send calls: canonical national numbers get
/// the country code back, anything else goes out as bare digits.
pub fn to_gateway_number(canonical: &str) -> String {
    let digits = digits_only(jid_user(canonical));
    match digits.len() {
        10 | 11 => format!("{BRAZIL_COUNTRY_CODE}{digits}"),
        _ => digits,
    }
}

/// Human-readable phone used as a last-resort display name. The input is a
/// JID user part, so it carries its country code; only `55` numbers get the
/// Brazilian layout.
pub fn format_display(raw: &str) -> String {
    let digits = digits_only(jid_user(raw));
    let national = match digits.len() {
        0 => return String::new(),
        12 | 13 if digits.starts_with(BRAZIL_COUNTRY_CODE) => &digits[2..],
        _ => return format!("+{digits}"),
    };
    let (area, number) = national.split_at(2);
    let split = number.len() - 4;
    format!(
        "+{BRAZIL_COUNTRY_CODE} ({area}) {}-{}",
        &number[..split],
        &number[split..]
    )
}
