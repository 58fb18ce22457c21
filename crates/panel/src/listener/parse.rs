//! OneBot 11 frame decoding into activity-log events.

use protocol::NewEvent;
use serde_json::{Map, Value};

const SENT_SUMMARY_CHARS: usize = 100;
const RECEIVED_SUMMARY_CHARS: usize = 80;

/// Decodes one inbound frame. Heartbeats, undecodable payloads and unknown
/// post types yield `None`.
pub(crate) fn parse_frame(raw: &[u8], now_ms: i64) -> Option<NewEvent> {
    let Ok(Value::Object(frame)) = serde_json::from_slice::<Value>(raw) else {
        return None;
    };
    match str_field(&frame, "post_type") {
        "message" => Some(parse_message(&frame, now_ms)),
        "notice" => Some(parse_notice(&frame, now_ms)),
        "request" => Some(parse_request(&frame, now_ms)),
        _ => None,
    }
}

fn parse_message(frame: &Map<String, Value>, now_ms: i64) -> NewEvent {
    let mut text = str_field(frame, "raw_message").to_string();
    if text.is_empty() {
        if let Some(Value::Array(segments)) = frame.get("message") {
            text = flatten_segments(segments);
        }
    }

    let user_id = id_field(frame, "user_id");
    let is_self = !user_id.is_empty() && user_id == id_field(frame, "self_id");
    let sender = frame
        .get("sender")
        .and_then(Value::as_object)
        .map(|sender| {
            let card = str_field(sender, "card");
            if card.is_empty() {
                str_field(sender, "nickname")
            } else {
                card
            }
        })
        .filter(|name| !name.is_empty())
        .unwrap_or(user_id.as_str())
        .to_string();

    let (scope, kind_scope) = if str_field(frame, "message_type") == "group" {
        (format!("[group {}]", id_field(frame, "group_id")), "group")
    } else {
        ("[private]".to_string(), "private")
    };

    let (source, kind, summary) = if is_self {
        (
            "openclaw",
            format!("message.{kind_scope}.sent"),
            format!("{scope} → {}", truncate_chars(&text, SENT_SUMMARY_CHARS)),
        )
    } else {
        (
            "qq",
            format!("message.{kind_scope}.received"),
            format!(
                "{scope} {sender}: {}",
                truncate_chars(&text, RECEIVED_SUMMARY_CHARS)
            ),
        )
    };
    NewEvent::new(now_ms, source, kind, summary).with_detail(text)
}

fn flatten_segments(segments: &[Value]) -> String {
    let mut flat = String::new();
    for segment in segments.iter().filter_map(Value::as_object) {
        match str_field(segment, "type") {
            "text" => {
                if let Some(data) = segment.get("data").and_then(Value::as_object) {
                    flat.push_str(str_field(data, "text"));
                }
            }
            "image" => flat.push_str("[image]"),
            "face" => flat.push_str("[face]"),
            "at" => flat.push_str("[at]"),
            other => {
                flat.push('[');
                flat.push_str(other);
                flat.push(']');
            }
        }
    }
    flat
}

fn parse_notice(frame: &Map<String, Value>, now_ms: i64) -> NewEvent {
    let notice_type = str_field(frame, "notice_type");
    let user_id = id_field(frame, "user_id");
    let summary = match notice_type {
        "group_increase" => format!(
            "user {user_id} joined group {}",
            id_field(frame, "group_id")
        ),
        "group_decrease" => format!("user {user_id} left group {}", id_field(frame, "group_id")),
        "friend_add" => format!("new friend: {user_id}"),
        "group_recall" => "group message recalled".to_string(),
        "friend_recall" => "friend message recalled".to_string(),
        "poke" => "poke".to_string(),
        other => format!("notice: {other}"),
    };
    NewEvent::new(now_ms, "qq", format!("notice.{notice_type}"), summary)
}

fn parse_request(frame: &Map<String, Value>, now_ms: i64) -> NewEvent {
    let request_type = str_field(frame, "request_type");
    let comment = str_field(frame, "comment");
    let user_id = id_field(frame, "user_id");
    let mut summary = match request_type {
        "friend" => format!("friend request: {user_id}"),
        "group" => format!(
            "group join request: {user_id} → group {}",
            id_field(frame, "group_id")
        ),
        other => format!("request: {other} from {user_id}"),
    };
    if matches!(request_type, "friend" | "group") && !comment.is_empty() {
        summary.push_str(&format!(" ({comment})"));
    }
    NewEvent::new(now_ms, "qq", format!("request.{request_type}"), summary).with_detail(comment)
}

fn str_field<'a>(object: &'a Map<String, Value>, key: &str) -> &'a str {
    object.get(key).and_then(Value::as_str).unwrap_or("")
}

/// OneBot ids arrive as numbers from most implementations and as strings
/// from a few.
fn id_field(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
