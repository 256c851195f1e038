//! Wire messages exchanged with the document service.
//!
//! Messages are JSON text frames keyed by the action field `a`. Incoming
//! frames are classified before decoding: a top-level `error` is fatal, and
//! frames carrying a `wa` key belong to another protocol multiplexed on the
//! same socket and are skipped.

use mirror_core::Component;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum frame and message size (20MB).
pub const MAX_MESSAGE_SIZE: usize = 20 * 1024 * 1024;

/// Short name of the operation type documents are created with.
pub const JSON0_TYPE: &str = "json0";

/// Type URI the service reports for json0 documents.
pub const JSON0_TYPE_URI: &str = "http://sharejs.org/types/JSONv0";

/// Whether a reported document type is json0.
pub fn is_json0(doc_type: &str) -> bool {
    doc_type == JSON0_TYPE || doc_type == JSON0_TYPE_URI
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Payload of a create request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateData {
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Messages this client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ClientMessage {
    #[serde(rename = "hs")]
    Handshake,

    #[serde(rename = "s")]
    Subscribe {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "d")]
        document: String,
    },

    #[serde(rename = "op")]
    Op {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "d")]
        document: String,
        /// Version the op applies to; `null` for a create
        v: Option<u64>,
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op: Option<Vec<Component>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        create: Option<CreateData>,
    },
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Snapshot delivered with a subscription reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SnapshotData {
    #[serde(default)]
    pub v: u64,
    /// Document type; absent while the document has not been created
    #[serde(rename = "type", default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// An operation broadcast, or the acknowledgement of one of ours.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct OpMessage {
    #[serde(rename = "c", default)]
    pub collection: Option<String>,
    #[serde(rename = "d", default)]
    pub document: Option<String>,
    #[serde(default)]
    pub v: Option<u64>,
    /// Client id of the submitter
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub op: Option<Vec<Component>>,
    #[serde(default)]
    pub create: Option<CreateData>,
    #[serde(default)]
    pub del: Option<bool>,
}

/// Decoded server messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "a")]
pub enum ServerMessage {
    /// Sent by the service when the socket opens
    #[serde(rename = "init")]
    Init {
        #[serde(default)]
        id: Option<String>,
    },

    /// Reply to our handshake
    #[serde(rename = "hs")]
    Handshake {
        #[serde(default)]
        id: Option<String>,
    },

    /// Reply to a subscribe request
    #[serde(rename = "s")]
    Subscribed {
        #[serde(rename = "c", default)]
        collection: Option<String>,
        #[serde(rename = "d", default)]
        document: Option<String>,
        #[serde(default)]
        data: Option<SnapshotData>,
    },

    #[serde(rename = "op")]
    Op(OpMessage),
}

/// Result of classifying an incoming text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// The service reported an error; the session must end
    Error(String),
    /// A frame for another protocol sharing the socket
    Ignored,
    /// An action this client does not handle
    Unknown(String),
    Message(ServerMessage),
}

const KNOWN_ACTIONS: &[&str] = &["init", "hs", "s", "op"];

/// Classify and decode one incoming frame.
pub fn classify(text: &str) -> Result<Incoming, MessageError> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let reason = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Ok(Incoming::Error(reason));
    }

    if value.get("wa").is_some() {
        return Ok(Incoming::Ignored);
    }

    let action = value.get("a").and_then(Value::as_str).unwrap_or_default();
    if !KNOWN_ACTIONS.contains(&action) {
        return Ok(Incoming::Unknown(action.to_string()));
    }

    Ok(Incoming::Message(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{Action, skeleton};
    use serde_json::json;

    fn to_json(msg: &ClientMessage) -> Value {
        serde_json::from_str(&msg.to_text().unwrap()).unwrap()
    }

    #[test]
    fn test_client_messages_wire_shape() {
        assert_eq!(to_json(&ClientMessage::Handshake), json!({"a": "hs"}));

        let subscribe = ClientMessage::Subscribe {
            collection: "webstrates".into(),
            document: "contenteditable".into(),
        };
        assert_eq!(
            to_json(&subscribe),
            json!({"a": "s", "c": "webstrates", "d": "contenteditable"})
        );
    }

    #[test]
    fn test_create_message_has_null_version() {
        let create = ClientMessage::Op {
            collection: "webstrates".into(),
            document: "doc".into(),
            v: None,
            seq: 1,
            op: None,
            create: Some(CreateData {
                doc_type: JSON0_TYPE.into(),
                data: None,
            }),
        };
        assert_eq!(
            to_json(&create),
            json!({"a": "op", "c": "webstrates", "d": "doc", "v": null, "seq": 1,
                   "create": {"type": "json0"}})
        );
    }

    #[test]
    fn test_op_message_uses_json0_components() {
        let op = ClientMessage::Op {
            collection: "webstrates".into(),
            document: "doc".into(),
            v: Some(4),
            seq: 2,
            op: Some(vec![Component::replace_root(skeleton())]),
            create: None,
        };
        assert_eq!(
            to_json(&op),
            json!({"a": "op", "c": "webstrates", "d": "doc", "v": 4, "seq": 2,
                   "op": [{"p": [], "oi": ["html", {}, ["body", {}]]}]})
        );
    }

    #[test]
    fn test_classify_error_is_fatal() {
        let incoming = classify(r#"{"a":"op","error":{"code":4001,"message":"Op already submitted"}}"#).unwrap();
        assert_eq!(incoming, Incoming::Error("Op already submitted".into()));

        let incoming = classify(r#"{"error":"bad"}"#).unwrap();
        assert_eq!(incoming, Incoming::Error("\"bad\"".into()));
    }

    #[test]
    fn test_classify_ignores_wa_frames() {
        assert_eq!(classify(r#"{"wa":"publish","d":"x"}"#).unwrap(), Incoming::Ignored);
    }

    #[test]
    fn test_classify_unknown_action() {
        assert_eq!(
            classify(r#"{"a":"bs","c":"x"}"#).unwrap(),
            Incoming::Unknown("bs".into())
        );
    }

    #[test]
    fn test_classify_subscription_reply() {
        let incoming = classify(
            r#"{"a":"s","c":"webstrates","d":"doc",
                "data":{"v":3,"type":"http://sharejs.org/types/JSONv0","data":["html",{}]}}"#,
        )
        .unwrap();

        let Incoming::Message(ServerMessage::Subscribed { data: Some(snapshot), .. }) = incoming else {
            panic!("expected subscription reply, got {incoming:?}");
        };
        assert_eq!(snapshot.v, 3);
        assert!(is_json0(snapshot.doc_type.as_deref().unwrap()));
        assert_eq!(snapshot.data, Some(json!(["html", {}])));
    }

    #[test]
    fn test_classify_uncreated_snapshot() {
        let incoming = classify(r#"{"a":"s","c":"webstrates","d":"doc","data":{"v":0}}"#).unwrap();
        let Incoming::Message(ServerMessage::Subscribed { data: Some(snapshot), .. }) = incoming else {
            panic!("expected subscription reply");
        };
        assert_eq!(snapshot.doc_type, None);
    }

    #[test]
    fn test_classify_remote_op() {
        let incoming = classify(
            r#"{"a":"op","c":"webstrates","d":"doc","v":7,"src":"other","seq":3,
                "op":[{"p":[2,2],"li":"hello"}]}"#,
        )
        .unwrap();

        let Incoming::Message(ServerMessage::Op(op)) = incoming else {
            panic!("expected op");
        };
        assert_eq!(op.v, Some(7));
        assert_eq!(op.src.as_deref(), Some("other"));
        assert_eq!(
            op.op,
            Some(vec![Component::new(
                vec![2.into(), 2.into()],
                Action::ListInsert(json!("hello"))
            )])
        );
    }

    #[test]
    fn test_classify_init() {
        assert_eq!(
            classify(r#"{"a":"init","protocol":1,"id":"abc","type":"http://sharejs.org/types/JSONv0"}"#)
                .unwrap(),
            Incoming::Message(ServerMessage::Init { id: Some("abc".into()) })
        );
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(classify("not json"), Err(MessageError::Json(_))));
    }
}
