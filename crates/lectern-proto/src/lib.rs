//! Wire protocol shared by the lectern relay and its client tooling.
//! Keeping the frame shapes in a dedicated crate allows regeneration of
//! bindings for the extension/dashboard without pulling in server code.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Loose JSON object payload carried by relayed envelopes. The relay treats
/// these as opaque: keys and values pass through byte-for-byte.
pub type JsonObject = serde_json::Map<String, Value>;

/// Frames accepted from a connected client. The `type` tag selects the
/// variant; unknown tags and malformed payloads fail deserialization and the
/// relay discards the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame of a student session.
    IdentifyStudent { data: StudentIdentity },
    /// First frame of the teacher dashboard session.
    IdentifyTeacher,
    TabsUpdate {
        #[serde(default)]
        data: JsonObject,
    },
    TabCreated {
        #[serde(default)]
        data: JsonObject,
    },
    TabUpdated {
        #[serde(default)]
        data: JsonObject,
    },
    TabRemoved {
        #[serde(default)]
        data: JsonObject,
    },
    /// Screen capture from a student. Large; relayed on the fast lane.
    CaptureFrame {
        #[serde(default)]
        data: JsonObject,
    },
    CaptureError {
        #[serde(default)]
        data: JsonObject,
    },
    CaptureSkipped {
        #[serde(default)]
        data: JsonObject,
    },
    /// Application-level liveness probe; answered with [`ServerFrame::Pong`].
    KeepalivePing,
    /// Teacher-issued command addressed at a single student.
    Command { data: CommandRequest },
}

/// Identity a student presents when joining.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentIdentity {
    pub client_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Teacher command envelope. `data` is opaque to the relay and handed to the
/// target student unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub target_client_id: String,
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

/// Frames the relay emits. Every variant except `Error` nests its payload
/// under `data`; `Error` keeps `message` at the top level because deployed
/// clients match on that shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Error { message: String },
    ServerAck { data: AckPayload },
    /// Roster snapshot sent to a teacher right after registration.
    InitialRoster { data: Vec<RosterEntry> },
    StudentConnected { data: RosterEntry },
    StudentDisconnected { data: StudentRef },
    StudentTabsUpdate { data: StudentEvent },
    StudentTabCreated { data: StudentEvent },
    StudentTabUpdated { data: StudentEvent },
    StudentTabRemoved { data: StudentEvent },
    StudentCaptureFrame { data: StudentEvent },
    StudentCaptureError { data: StudentEvent },
    StudentCaptureSkipped { data: StudentEvent },
    Pong { data: PongPayload },
    CommandFailed { data: CommandFailure },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub message: String,
}

/// One student as the teacher dashboard sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub client_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub client_id: String,
}

/// A student-originated event re-addressed for the teacher: the original
/// `data` object rides along untouched as `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentEvent {
    pub client_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    /// Server clock at response time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailure {
    pub target_client_id: String,
    pub reason: String,
}

/// Command as delivered to the target student. Deliberately a bare
/// `{command, data}` object rather than a tagged envelope; the extension's
/// command handler predates the envelope scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandForward {
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_identify_student() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"identify_student","data":{"clientId":"s-1","email":"kim@school.edu"}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::IdentifyStudent { data } => {
                assert_eq!(data.client_id, "s-1");
                assert_eq!(data.email.as_deref(), Some("kim@school.edu"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn identify_student_without_client_id_is_rejected() {
        let result = serde_json::from_str::<ClientFrame>(
            r#"{"type":"identify_student","data":{"email":"kim@school.edu"}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn identify_student_email_is_optional() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"identify_student","data":{"clientId":"s-1"}}"#)
                .unwrap();
        match frame {
            ClientFrame::IdentifyStudent { data } => assert!(data.email.is_none()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let result = serde_json::from_str::<ClientFrame>(r#"{"type":"shutdown","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn keepalive_ping_tolerates_extra_fields() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"keepalive_ping","data":{"seq":42}}"#).unwrap();
        assert!(matches!(frame, ClientFrame::KeepalivePing));
    }

    #[test]
    fn tabs_update_defaults_to_empty_object() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"tabs_update"}"#).unwrap();
        match frame {
            ClientFrame::TabsUpdate { data } => assert!(data.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_command_with_null_data() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"command","data":{"targetClientId":"s-9","command":"close_tab"}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Command { data } => {
                assert_eq!(data.target_client_id, "s-9");
                assert_eq!(data.command, "close_tab");
                assert!(data.data.is_null());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn error_keeps_message_at_top_level() {
        let frame = ServerFrame::Error {
            message: "Class is full".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "error", "message": "Class is full"})
        );
    }

    #[test]
    fn ack_nests_message_under_data() {
        let frame = ServerFrame::ServerAck {
            data: AckPayload {
                message: "registered".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "server_ack", "data": {"message": "registered"}})
        );
    }

    #[test]
    fn roster_serializes_camel_case_entries() {
        let frame = ServerFrame::InitialRoster {
            data: vec![RosterEntry {
                client_id: "s-1".to_string(),
                email: "N/A".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "initial_roster", "data": [{"clientId": "s-1", "email": "N/A"}]})
        );
    }

    #[test]
    fn student_event_carries_payload_verbatim() {
        let frame = ServerFrame::StudentTabsUpdate {
            data: StudentEvent {
                client_id: "s-1".to_string(),
                payload: json!({"tabs": {"7": {"url": "https://example.com"}}}),
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "student_tabs_update",
                "data": {
                    "clientId": "s-1",
                    "payload": {"tabs": {"7": {"url": "https://example.com"}}}
                }
            })
        );
    }

    #[test]
    fn command_forward_is_a_bare_object() {
        let forward = CommandForward {
            command: "focus_tab".to_string(),
            data: json!({"tabId": 7}),
        };
        assert_eq!(
            serde_json::to_value(&forward).unwrap(),
            json!({"command": "focus_tab", "data": {"tabId": 7}})
        );
    }

    #[test]
    fn server_frames_round_trip_through_the_tag() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"command_failed","data":{"targetClientId":"s-9","reason":"Student not found"}}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::CommandFailed { data } => {
                assert_eq!(data.target_client_id, "s-9");
                assert_eq!(data.reason, "Student not found");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
