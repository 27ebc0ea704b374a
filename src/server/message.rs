//! Wire protocol messages exchanged over the WebSocket connection.
//!
//! Every message is a JSON object with a `type` tag and an optional
//! `payload`. Outbound payload field names are kept compatible with the
//! existing browser client (`meetingStarted`, `semaphoreGreen`, `isMaster`).

use serde::{Deserialize, Serialize};

/// Connection handshake: the first frame a client sends after upgrading.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub name: String,
}

/// Commands a participant may issue over an established connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    StartMeeting,
    StartSemaphore,
    PressButton,
    EndTurn,
    ForceEndTurn,
    SkipTurn,
    ResetMeeting,
    AddVirtualUser,
    /// Master-only: the full desired queue order, as display names.
    ReorderTurnOrder(Vec<String>),
}

/// Notifications the server sends, either broadcast or targeted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Targeted at a participant right after they connect.
    InitialRole {
        #[serde(rename = "isMaster")]
        is_master: bool,
    },
    MeetingState {
        #[serde(rename = "meetingStarted")]
        meeting_started: bool,
        #[serde(rename = "semaphoreGreen")]
        semaphore_green: bool,
    },
    /// Connected participant names, in join order.
    UserList(Vec<String>),
    /// Queued participant names, in speaking order.
    TurnOrder(Vec<String>),
    NextSpeaker(String),
    MeetingEnd(String),
    MeetingReset,
    /// Targeted at the newly elected master after the old one leaves.
    YouAreMaster,
}

impl ServerEvent {
    /// Serialize for transmission. The event enum contains nothing that can
    /// fail to serialize, so this is infallible.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server event serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_command_without_payload_deserializes() {
        // given (precondition):
        let raw = r#"{"type":"press_button"}"#;

        // when (operation):
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();

        // then (expected result):
        assert_eq!(cmd, ClientCommand::PressButton);
    }

    #[test]
    fn test_client_command_with_null_payload_deserializes() {
        // given (precondition): the browser client sends an explicit null payload
        let raw = r#"{"type":"start_meeting","payload":null}"#;

        // when (operation):
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();

        // then (expected result):
        assert_eq!(cmd, ClientCommand::StartMeeting);
    }

    #[test]
    fn test_reorder_turn_order_carries_name_list() {
        // given (precondition):
        let raw = r#"{"type":"reorder_turn_order","payload":["bob","alice"]}"#;

        // when (operation):
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();

        // then (expected result):
        assert_eq!(
            cmd,
            ClientCommand::ReorderTurnOrder(vec!["bob".to_string(), "alice".to_string()])
        );
    }

    #[test]
    fn test_unknown_command_type_is_rejected() {
        // given (precondition):
        let raw = r#"{"type":"fire_the_missiles"}"#;

        // when (operation):
        let result = serde_json::from_str::<ClientCommand>(raw);

        // then (expected result):
        assert!(result.is_err());
    }

    #[test]
    fn test_meeting_state_wire_format_matches_client_expectations() {
        // given (precondition):
        let event = ServerEvent::MeetingState {
            meeting_started: true,
            semaphore_green: false,
        };

        // when (operation):
        let json = event.to_json();

        // then (expected result):
        assert_eq!(
            json,
            r#"{"type":"meeting_state","payload":{"meetingStarted":true,"semaphoreGreen":false}}"#
        );
    }

    #[test]
    fn test_initial_role_wire_format_matches_client_expectations() {
        // given (precondition):
        let event = ServerEvent::InitialRole { is_master: true };

        // when (operation):
        let json = event.to_json();

        // then (expected result):
        assert_eq!(json, r#"{"type":"initial_role","payload":{"isMaster":true}}"#);
    }

    #[test]
    fn test_turn_order_serializes_names_in_order() {
        // given (precondition):
        let event = ServerEvent::TurnOrder(vec!["alice".to_string(), "bob".to_string()]);

        // when (operation):
        let json = event.to_json();

        // then (expected result):
        assert_eq!(json, r#"{"type":"turn_order","payload":["alice","bob"]}"#);
    }

    #[test]
    fn test_meeting_reset_has_no_payload() {
        // given (precondition):
        let event = ServerEvent::MeetingReset;

        // when (operation):
        let json = event.to_json();

        // then (expected result):
        assert_eq!(json, r#"{"type":"meeting_reset"}"#);
    }
}
