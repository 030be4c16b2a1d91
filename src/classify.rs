use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    consts::LOG_PAYLOAD_MAX_CHARS,
    model::Notification,
    util::truncate_message,
};

pub(crate) const NOTIFICATION_TAG: &str = "notification";
pub(crate) const UNREAD_LIST_TAG: &str = "unread_notifications";

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Notification(Notification),
    UnreadList(Vec<Notification>),
    Unrecognized,
}

impl StreamMessage {
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized)
    }
}

pub fn classify_text(text: &str) -> StreamMessage {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => classify(&value),
        Err(error) => {
            debug!(
                "stream decode failed: {error} payload={}",
                truncate_message(text, LOG_PAYLOAD_MAX_CHARS)
            );
            StreamMessage::Unrecognized
        }
    }
}

/// Checks the `type` discriminator first, then validates the structure it
/// promises. The declared type alone is never trusted.
pub fn classify(value: &Value) -> StreamMessage {
    match value.get("type").and_then(Value::as_str) {
        Some(NOTIFICATION_TAG) => classify_notification(value),
        Some(UNREAD_LIST_TAG) => classify_unread_list(value),
        other => {
            debug!("unrecognized stream frame type={other:?}");
            StreamMessage::Unrecognized
        }
    }
}

fn classify_notification(value: &Value) -> StreamMessage {
    let Some(payload) = value.get(NOTIFICATION_TAG).filter(|v| v.is_object()) else {
        debug!("notification frame without notification object");
        return StreamMessage::Unrecognized;
    };
    match decode_notification(payload) {
        Some(notification) => StreamMessage::Notification(notification),
        None => StreamMessage::Unrecognized,
    }
}

fn classify_unread_list(value: &Value) -> StreamMessage {
    let Some(items) = value.get("notifications").and_then(Value::as_array) else {
        debug!("unread frame without notifications array");
        return StreamMessage::Unrecognized;
    };
    StreamMessage::UnreadList(decode_notifications(items))
}

/// Decodes the entries that carry an integer id and a string title, skipping
/// the rest.
pub(crate) fn decode_notifications(items: &[Value]) -> Vec<Notification> {
    let decoded: Vec<Notification> = items.iter().filter_map(decode_notification).collect();
    if decoded.len() != items.len() {
        debug!(
            "skipped {} undecodable notifications out of {}",
            items.len() - decoded.len(),
            items.len()
        );
    }
    decoded
}

fn decode_notification(value: &Value) -> Option<Notification> {
    match Notification::deserialize(value) {
        Ok(notification) => Some(notification),
        Err(error) => {
            debug!(
                "notification decode failed: {error} payload={}",
                truncate_message(&value.to_string(), LOG_PAYLOAD_MAX_CHARS)
            );
            None
        }
    }
}
