//! Wire protocol payload types.
//!
//! Messages are JSON text frames, internally tagged on `type` with camelCase
//! fields. `payload`/`state` blobs are opaque and passed through verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::AsRefStr;

use crate::ws::ConnId;

pub(crate) fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Application-defined event name relayed between endpoints.
///
/// The reserved names are the events the built-in controller widgets emit;
/// anything else passes through as a custom event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum EventName {
    #[serde(rename = "cursor-move")]
    CursorMove,
    #[serde(rename = "tap")]
    Tap,
    #[serde(rename = "key-press")]
    KeyPress,
    #[serde(rename = "button")]
    Button,
    #[serde(untagged)]
    Custom(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, AsRefStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InboundPayload {
    RegisterAppRoom(EmptyPayload),
    RejoinAppRoom(RoomCodePayload),
    RegisterControllerRoom(RoomCodePayload),
    ReportAppState(ReportAppStatePayload),
    SendEventToApp(AppBoundEventPayload),
    SendEventToControllers(ControllersBoundEventPayload),
    SendEventToController(ControllerBoundEventPayload),
}

impl std::fmt::Display for InboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, AsRefStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboundPayload {
    YourRoomId(RoomIdPayload),
    InitialState(InitialStatePayload),
    RejoinFailed(RoomCodePayload),
    JoinSuccess(RoomIdPayload),
    InvalidRoom(RoomCodePayload),
    ControllerPresenceChanged(ControllerPresencePayload),
    ControllerJoined(ControllerIdPayload),
    ControllerDisconnected(ControllerIdPayload),
    ControllerEvent(ControllerEventPayload),
    AppDisconnected(EmptyPayload),
    AppReconnected(EmptyPayload),
    ControllerRefresh(RoomCodePayload),
    AppEvent(AppEventPayload),
}

impl std::fmt::Display for OutboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmptyPayload {}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomCodePayload {
    pub room_code: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomIdPayload {
    pub room_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportAppStatePayload {
    pub room_id: String,
    #[serde(default = "empty_object")]
    pub state: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitialStatePayload {
    pub state: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppBoundEventPayload {
    pub room_id: String,
    pub event_name: EventName,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllersBoundEventPayload {
    pub room_id: String,
    pub event_name: EventName,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerBoundEventPayload {
    pub room_id: String,
    pub target_id: ConnId,
    pub event_name: EventName,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPresencePayload {
    pub controller_count: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerIdPayload {
    pub controller_id: ConnId,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerEventPayload {
    pub event_name: EventName,
    pub payload: Value,
    pub controller_id: ConnId,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppEventPayload {
    pub event_name: EventName,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_register_app_room() {
        let payload: InboundPayload =
            serde_json::from_str(r#"{"type":"register_app_room"}"#).unwrap();

        assert_eq!(payload, InboundPayload::RegisterAppRoom(EmptyPayload {}));
    }

    #[test]
    fn parses_controller_event_with_reserved_name() {
        let payload: InboundPayload = serde_json::from_str(
            r#"{"type":"send_event_to_app","roomId":"ABCD","eventName":"tap","payload":{"x":3}}"#,
        )
        .unwrap();

        assert_eq!(
            payload,
            InboundPayload::SendEventToApp(AppBoundEventPayload {
                room_id: "ABCD".to_string(),
                event_name: EventName::Tap,
                payload: json!({"x": 3}),
            })
        );
    }

    #[test]
    fn unreserved_event_names_fall_through_to_custom() {
        let name: EventName = serde_json::from_str(r#""quiz:join""#).unwrap();

        assert_eq!(name, EventName::Custom("quiz:join".to_string()));
        assert_eq!(serde_json::to_string(&name).unwrap(), r#""quiz:join""#);
    }

    #[test]
    fn reserved_event_names_use_hyphenated_wire_form() {
        assert_eq!(
            serde_json::to_string(&EventName::CursorMove).unwrap(),
            r#""cursor-move""#
        );
        let name: EventName = serde_json::from_str(r#""key-press""#).unwrap();
        assert_eq!(name, EventName::KeyPress);
    }

    #[test]
    fn missing_payload_defaults_to_empty_object() {
        let payload: InboundPayload = serde_json::from_str(
            r#"{"type":"send_event_to_controllers","roomId":"ABCD","eventName":"button"}"#,
        )
        .unwrap();

        let InboundPayload::SendEventToControllers(event) = payload else {
            panic!("wrong variant");
        };
        assert_eq!(event.payload, json!({}));
    }

    #[test]
    fn serializes_outbound_with_snake_case_tag() {
        let msg = OutboundPayload::ControllerPresenceChanged(ControllerPresencePayload {
            controller_count: 2,
        });

        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"controller_presence_changed","controllerCount":2}"#
        );
    }
}
