use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, TimestampMilliSeconds};
use uuid::Uuid;

use crate::error::{ErrorCode, SyncError};
use crate::models::{AcceptedOperation, Edit, PresenceSet};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    pub doc_id: String,
    pub user_id: String,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpMessage {
    pub op_id: Uuid,
    pub doc_id: String,
    pub base_version: u64,
    pub payload: Value,
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatchupMessage {
    pub doc_id: String,
    pub since_version: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub doc_id: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaveMessage {
    pub doc_id: String,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PingMessage {}

/// Messages a client sends to the server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "join")]
    Join(JoinMessage),
    #[serde(rename = "op")]
    Op(OpMessage),
    #[serde(rename = "catchup")]
    Catchup(CatchupMessage),
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatMessage),
    #[serde(rename = "leave")]
    Leave(LeaveMessage),
    #[serde(rename = "ping")]
    Ping(PingMessage),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinedMessage {
    pub doc_id: String,
    pub version: u64,
    pub content: String,
    pub presence: PresenceSet,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    pub op_id: Uuid,
    pub sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMessage {
    pub op_id: Uuid,
    pub sequence: u64,
    pub author_id: String,
    /// The edit as its author submitted it
    pub payload: Value,
    /// The same edit positioned against the document at `sequence - 1`
    pub edits: Vec<Edit>,
}

impl From<&AcceptedOperation> for AppliedMessage {
    fn from(accepted: &AcceptedOperation) -> Self {
        AppliedMessage {
            op_id: accepted.operation.op_id,
            sequence: accepted.sequence,
            author_id: accepted.operation.author_id.clone(),
            payload: accepted.operation.payload.clone(),
            edits: accepted.edits.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub doc_id: String,
    pub operations: Vec<AcceptedOperation>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub doc_id: String,
    pub set: PresenceSet,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<Uuid>,
}

impl ErrorMessage {
    pub fn from_error(err: &SyncError, op_id: Option<Uuid>) -> Self {
        ErrorMessage {
            code: err.code(),
            message: err.to_string(),
            op_id,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

/// Messages the server sends to a client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "joined")]
    Joined(JoinedMessage),
    #[serde(rename = "ack")]
    Ack(AckMessage),
    #[serde(rename = "applied")]
    Applied(AppliedMessage),
    #[serde(rename = "history")]
    History(HistoryMessage),
    #[serde(rename = "presence")]
    Presence(PresenceMessage),
    #[serde(rename = "error")]
    Error(ErrorMessage),
    #[serde(rename = "pong")]
    Pong(PongMessage),
}

impl ServerMessage {
    pub fn error(err: &SyncError, op_id: Option<Uuid>) -> Self {
        ServerMessage::Error(ErrorMessage::from_error(err, op_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_are_tagged_by_type() {
        let raw = json!({
            "type": "op",
            "opId": "6f0b4a1e-52e1-4d8e-9d8a-2f5c4e7f0a11",
            "docId": "task-1",
            "baseVersion": 3,
            "payload": {"kind": "insert", "position": 5, "text": "hi"},
            "timestamp": 1_700_000_000_000i64
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::Op(op) => {
                assert_eq!(op.doc_id, "task-1");
                assert_eq!(op.base_version, 3);
                assert_eq!(op.timestamp.timestamp_millis(), 1_700_000_000_000);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn catchup_uses_camel_case_fields() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"catchup","docId":"d","sinceVersion":7}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Catchup(CatchupMessage { doc_id: "d".into(), since_version: 7 })
        );
    }

    #[test]
    fn applied_carries_the_submitted_payload_and_resolved_edits() {
        let accepted = AcceptedOperation {
            sequence: 4,
            operation: crate::models::Operation {
                op_id: Uuid::new_v4(),
                doc_id: "task-1".into(),
                author_id: "alice".into(),
                base_version: 2,
                payload: json!({"kind": "insert", "position": 1, "text": "hi"}),
                timestamp: Utc::now(),
            },
            edits: vec![Edit::Insert {
                position: 3,
                text: "hi".into(),
            }],
        };
        let value = serde_json::to_value(ServerMessage::Applied(AppliedMessage::from(&accepted))).unwrap();
        assert_eq!(value["type"], "applied");
        assert_eq!(value["sequence"], 4);
        assert_eq!(value["authorId"], "alice");
        assert_eq!(value["payload"], json!({"kind": "insert", "position": 1, "text": "hi"}));
        assert_eq!(value["edits"][0]["position"], 3);
    }

    #[test]
    fn error_message_omits_missing_op_id() {
        let msg = ServerMessage::error(&SyncError::StaleSession, None);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "STALE_SESSION");
        assert!(value.get("opId").is_none());
    }
}
