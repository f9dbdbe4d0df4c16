//! Payloads pushed over the room event stream.

use serde::Serialize;
use utoipa::ToSchema;

use crate::{dto::session::RoomResponse, services::change_notifier::RoomNotice};

/// Event name carrying a full room snapshot.
pub const ROOM_SNAPSHOT_EVENT: &str = "room.snapshot";
/// Event name sent once the session is gone.
pub const ROOM_CLOSED_EVENT: &str = "room.closed";

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// SSE `event:` name; `None` sends an unnamed message.
    pub event: Option<String>,
    /// Serialised JSON body.
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }

    /// Map a room notice of session `code` to its SSE payload.
    pub fn from_notice(code: &str, notice: RoomNotice) -> serde_json::Result<Self> {
        match notice {
            RoomNotice::Snapshot(room) => Self::json(
                Some(ROOM_SNAPSHOT_EVENT.to_string()),
                &RoomResponse::from(room),
            ),
            RoomNotice::Closed => Self::json(
                Some(ROOM_CLOSED_EVENT.to_string()),
                &RoomClosedEvent {
                    code: code.to_string(),
                },
            ),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the followed session was removed or never existed.
pub struct RoomClosedEvent {
    /// Join code of the closed session.
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_notice_names_the_session() {
        let event = ServerEvent::from_notice("123456", RoomNotice::Closed).unwrap();
        assert_eq!(event.event.as_deref(), Some(ROOM_CLOSED_EVENT));
        assert_eq!(event.data, r#"{"code":"123456"}"#);
    }
}
