//! RemoteDocument: a `SharedDocument` backed by the document service.
//!
//! Local submissions are applied to the snapshot immediately and queued.
//! One operation is in flight at a time; the next is sent once the service
//! acknowledges the previous one. Messages to send collect in an outbox the
//! event loop drains after every reaction, so the document itself never
//! touches the socket.
//!
//! A remote operation that arrives while our submissions are unacknowledged
//! was built against a version without them. It is transformed against the
//! in-flight and pending operations (ours on the left, as the service does
//! when it transforms our later submission), and those are rewritten to
//! their transformed form before anything else is sent. A remote operation
//! that still does not apply is reported as an error; the caller
//! resubscribes for a fresh snapshot.

use crate::message::{ClientMessage, CreateData, JSON0_TYPE, OpMessage, SnapshotData, is_json0};
use mirror_core::document::{Change, DocumentError, Origin, Result, SharedDocument};
use mirror_core::ot::{self, Component};
use mirror_core::transform::transform_x;
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// What an outgoing submission carries.
#[derive(Debug, Clone, PartialEq)]
enum Payload {
    Create,
    Op(Vec<Component>),
}

#[derive(Debug, Clone, PartialEq)]
struct Pending {
    seq: u64,
    payload: Payload,
}

/// How an incoming `op` frame was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    /// Our in-flight submission was acknowledged
    Acknowledged,
    /// Another collaborator's change was applied
    Applied(Change),
    /// A frame for another document, or one already seen
    Ignored,
}

/// Client-side state for one subscribed document.
#[derive(Debug)]
pub struct RemoteDocument {
    collection: String,
    id: String,
    client_id: Option<String>,
    version: u64,
    doc_type: Option<String>,
    data: Option<Value>,
    next_seq: u64,
    inflight: Option<Pending>,
    pending: VecDeque<Pending>,
    outbox: Vec<ClientMessage>,
}

impl RemoteDocument {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            client_id: None,
            version: 0,
            doc_type: None,
            data: None,
            next_seq: 1,
            inflight: None,
            pending: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Whether submissions are waiting for acknowledgement.
    pub fn has_unacknowledged(&self) -> bool {
        self.inflight.is_some() || !self.pending.is_empty()
    }

    /// Subscribe request for this document.
    pub fn subscribe_message(&self) -> ClientMessage {
        ClientMessage::Subscribe {
            collection: self.collection.clone(),
            document: self.id.clone(),
        }
    }

    /// The service assigned this connection a client id.
    pub fn set_client_id(&mut self, id: Option<String>) {
        if let Some(id) = &id {
            debug!("Client id assigned: {}", id);
        }
        self.client_id = id;
    }

    /// Install the snapshot from a subscription reply.
    ///
    /// Anything still queued from a previous connection is dropped; the
    /// caller rewrites the mirror from this snapshot.
    pub fn on_subscribed(&mut self, snapshot: SnapshotData) {
        let dropped = self.inflight.take().into_iter().count() + self.pending.len();
        if dropped > 0 {
            warn!("Discarding {} unacknowledged submission(s) after resubscribe", dropped);
        }
        self.pending.clear();
        self.outbox.clear();

        self.version = snapshot.v;
        match snapshot.doc_type {
            Some(doc_type) => {
                if !is_json0(&doc_type) {
                    warn!("Document type is {}, expected json0", doc_type);
                }
                self.doc_type = Some(doc_type);
                self.data = Some(snapshot.data.unwrap_or(Value::Null));
            }
            None => {
                self.doc_type = None;
                self.data = None;
            }
        }
        debug!(
            "Subscribed to {}/{} at version {} (created: {})",
            self.collection,
            self.id,
            self.version,
            self.doc_type.is_some()
        );
    }

    /// Handle an `op` frame: an acknowledgement or a remote change.
    pub fn on_op(&mut self, msg: OpMessage) -> Result<OpOutcome> {
        if msg.collection.as_deref().is_some_and(|c| c != self.collection)
            || msg.document.as_deref().is_some_and(|d| d != self.id)
        {
            return Ok(OpOutcome::Ignored);
        }

        if self.is_acknowledgement(&msg) {
            if let Some(v) = msg.v {
                self.version = v + 1;
            } else {
                self.version += 1;
            }
            self.inflight = None;
            self.flush();
            return Ok(OpOutcome::Acknowledged);
        }

        if let Some(v) = msg.v {
            if v < self.version {
                debug!("Ignoring op at version {} (at {})", v, self.version);
                return Ok(OpOutcome::Ignored);
            }
            if v > self.version {
                warn!("Missed operations: got version {}, expected {}", v, self.version);
            }
        }

        let change = if let Some(create) = msg.create {
            self.doc_type = Some(create.doc_type);
            self.data = Some(create.data.unwrap_or(Value::Null));
            Change {
                op: Vec::new(),
                origin: Origin::Remote,
            }
        } else if msg.del == Some(true) {
            warn!("Document {} was deleted remotely", self.id);
            self.doc_type = None;
            self.data = None;
            Change {
                op: Vec::new(),
                origin: Origin::Remote,
            }
        } else {
            let current = self.data.as_ref().ok_or(DocumentError::NotCreated)?;
            let (op, ours) = self.transform_incoming(msg.op.unwrap_or_default())?;
            self.data = Some(ot::apply(current, &op)?);
            self.replace_unacknowledged(ours);
            Change {
                op,
                origin: Origin::Remote,
            }
        };

        self.version = msg.v.map_or(self.version + 1, |v| v + 1);
        Ok(OpOutcome::Applied(change))
    }

    /// Messages queued since the last call, in send order.
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    fn is_acknowledgement(&self, msg: &OpMessage) -> bool {
        let Some(inflight) = &self.inflight else {
            return false;
        };
        let ours = match (&msg.src, &self.client_id) {
            (Some(src), Some(id)) => src == id,
            // Acknowledgements may omit src
            (None, _) => true,
            (Some(_), None) => false,
        };
        ours && msg.seq == Some(inflight.seq)
    }

    /// Transform a remote operation past our unacknowledged ones.
    ///
    /// Returns the remote operation as it applies to the local snapshot and
    /// our operations as they apply after it, in queue order. Nothing is
    /// changed until the caller commits the result.
    fn transform_incoming(&self, mut op: Vec<Component>) -> Result<(Vec<Component>, Vec<Payload>)> {
        let mut ours = Vec::with_capacity(self.pending.len() + 1);
        for queued in self.inflight.iter().chain(&self.pending) {
            let payload = match &queued.payload {
                Payload::Op(local) if !op.is_empty() => {
                    let (local, remote) = transform_x(local, &op)?;
                    op = remote;
                    Payload::Op(local)
                }
                payload => payload.clone(),
            };
            ours.push(payload);
        }
        Ok((op, ours))
    }

    fn replace_unacknowledged(&mut self, ours: Vec<Payload>) {
        let slots = self.inflight.iter_mut().chain(self.pending.iter_mut());
        for (queued, payload) in slots.zip(ours) {
            queued.payload = payload;
        }
    }

    fn enqueue(&mut self, payload: Payload) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(Pending { seq, payload });
        self.flush();
    }

    /// Send the next queued submission if none is in flight.
    fn flush(&mut self) {
        if self.inflight.is_some() {
            return;
        }
        let Some(next) = self.pending.pop_front() else {
            return;
        };

        let message = match &next.payload {
            Payload::Create => ClientMessage::Op {
                collection: self.collection.clone(),
                document: self.id.clone(),
                v: None,
                seq: next.seq,
                op: None,
                create: Some(CreateData {
                    doc_type: JSON0_TYPE.to_string(),
                    data: None,
                }),
            },
            Payload::Op(op) => ClientMessage::Op {
                collection: self.collection.clone(),
                document: self.id.clone(),
                v: Some(self.version),
                seq: next.seq,
                op: Some(op.clone()),
                create: None,
            },
        };
        self.outbox.push(message);
        self.inflight = Some(next);
    }
}

impl SharedDocument for RemoteDocument {
    fn snapshot(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    fn exists(&self) -> bool {
        self.doc_type.is_some()
    }

    fn create(&mut self) -> Result<()> {
        if self.doc_type.is_some() {
            return Err(DocumentError::AlreadyExists);
        }
        self.doc_type = Some(JSON0_TYPE.to_string());
        self.data = Some(Value::Null);
        self.enqueue(Payload::Create);
        Ok(())
    }

    fn submit(&mut self, op: Vec<Component>) -> Result<()> {
        let current = self.data.as_ref().ok_or(DocumentError::NotCreated)?;
        let next = ot::apply(current, &op)?;
        self.data = Some(next);
        self.enqueue(Payload::Op(op));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::ot::{Action, OtError};
    use mirror_core::skeleton;
    use serde_json::json;

    fn subscribed(data: Option<Value>, v: u64) -> RemoteDocument {
        let mut doc = RemoteDocument::new("webstrates", "doc");
        doc.set_client_id(Some("me".into()));
        doc.on_subscribed(SnapshotData {
            v,
            doc_type: data.as_ref().map(|_| "http://sharejs.org/types/JSONv0".to_string()),
            data,
        });
        doc
    }

    fn ack(v: u64, seq: u64) -> OpMessage {
        OpMessage {
            collection: Some("webstrates".into()),
            document: Some("doc".into()),
            v: Some(v),
            src: Some("me".into()),
            seq: Some(seq),
            ..Default::default()
        }
    }

    fn remote(v: u64, op: Vec<Component>) -> OpMessage {
        OpMessage {
            collection: Some("webstrates".into()),
            document: Some("doc".into()),
            v: Some(v),
            src: Some("other".into()),
            seq: Some(1),
            op: Some(op),
            ..Default::default()
        }
    }

    #[test]
    fn test_uncreated_snapshot() {
        let doc = subscribed(None, 0);
        assert!(!doc.exists());
        assert!(doc.snapshot().is_none());
    }

    #[test]
    fn test_create_then_submit_sends_one_at_a_time() {
        let mut doc = subscribed(None, 0);

        doc.create().unwrap();
        doc.submit(vec![Component::replace_root(skeleton())]).unwrap();
        assert_eq!(doc.snapshot(), Some(&skeleton()));

        let sent = doc.take_outgoing();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            ClientMessage::Op { v: None, seq: 1, create: Some(_), .. }
        ));

        assert_eq!(doc.on_op(ack(0, 1)).unwrap(), OpOutcome::Acknowledged);
        assert_eq!(doc.version(), 1);

        let sent = doc.take_outgoing();
        assert_eq!(
            sent,
            vec![ClientMessage::Op {
                collection: "webstrates".into(),
                document: "doc".into(),
                v: Some(1),
                seq: 2,
                op: Some(vec![Component::replace_root(skeleton())]),
                create: None,
            }]
        );

        assert_eq!(doc.on_op(ack(1, 2)).unwrap(), OpOutcome::Acknowledged);
        assert_eq!(doc.version(), 2);
        assert!(!doc.has_unacknowledged());
        assert!(doc.take_outgoing().is_empty());
    }

    #[test]
    fn test_rejected_submit_is_not_sent() {
        let mut doc = subscribed(Some(skeleton()), 3);
        let err = doc
            .submit(vec![Component::new(vec![7.into()], Action::ListDelete(json!("x")))])
            .unwrap_err();
        assert!(matches!(err, DocumentError::Rejected(_)));
        assert_eq!(doc.snapshot(), Some(&skeleton()));
        assert!(doc.take_outgoing().is_empty());
    }

    #[test]
    fn test_remote_op_is_applied() {
        let mut doc = subscribed(Some(skeleton()), 5);
        let op = vec![Component::new(
            vec![2.into(), 2.into()],
            Action::ListInsert(json!(["p", {}, "hi"])),
        )];

        let outcome = doc.on_op(remote(5, op.clone())).unwrap();

        assert_eq!(
            outcome,
            OpOutcome::Applied(Change {
                op,
                origin: Origin::Remote
            })
        );
        assert_eq!(doc.version(), 6);
        assert_eq!(
            doc.snapshot(),
            Some(&json!(["html", {}, ["body", {}, ["p", {}, "hi"]]]))
        );
    }

    #[test]
    fn test_stale_remote_op_is_ignored() {
        let mut doc = subscribed(Some(skeleton()), 5);
        let outcome = doc
            .on_op(remote(4, vec![Component::new(vec![2.into(), 2.into()], Action::ListInsert(json!("x")))]))
            .unwrap();
        assert_eq!(outcome, OpOutcome::Ignored);
        assert_eq!(doc.snapshot(), Some(&skeleton()));
    }

    #[test]
    fn test_inapplicable_remote_op_is_an_error() {
        let mut doc = subscribed(Some(skeleton()), 2);
        let err = doc
            .on_op(remote(2, vec![Component::new(vec![9.into()], Action::ListDelete(json!("x")))]))
            .unwrap_err();
        assert!(matches!(
            err,
            DocumentError::Rejected(OtError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_other_documents_are_ignored() {
        let mut doc = subscribed(Some(skeleton()), 1);
        let mut msg = remote(1, Vec::new());
        msg.document = Some("elsewhere".into());
        assert_eq!(doc.on_op(msg).unwrap(), OpOutcome::Ignored);
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_remote_op_while_inflight_is_not_an_ack() {
        let mut doc = subscribed(Some(skeleton()), 1);
        doc.submit(vec![Component::new(
            vec![2.into(), 2.into()],
            Action::ListInsert(json!("mine")),
        )])
        .unwrap();
        doc.take_outgoing();

        let theirs = remote(1, vec![Component::new(vec![1.into(), "lang".into()], Action::ObjectInsert(json!("en")))]);
        assert!(matches!(doc.on_op(theirs).unwrap(), OpOutcome::Applied(_)));
        assert!(doc.has_unacknowledged());

        assert_eq!(doc.on_op(ack(2, 1)).unwrap(), OpOutcome::Acknowledged);
        assert_eq!(doc.version(), 3);
        assert_eq!(
            doc.snapshot(),
            Some(&json!(["html", {"lang": "en"}, ["body", {}, "mine"]]))
        );
    }

    #[test]
    fn test_concurrent_insert_at_same_index_matches_service_order() {
        let mut doc = subscribed(Some(skeleton()), 1);
        doc.submit(vec![Component::new(
            vec![2.into(), 2.into()],
            Action::ListInsert(json!("mine")),
        )])
        .unwrap();
        doc.take_outgoing();

        // The service ordered theirs first and will put ours in front of it
        let theirs = remote(1, vec![Component::new(vec![2.into(), 2.into()], Action::ListInsert(json!("theirs")))]);
        let OpOutcome::Applied(change) = doc.on_op(theirs).unwrap() else {
            panic!("expected a remote change");
        };
        assert_eq!(
            change.op,
            vec![Component::new(vec![2.into(), 3.into()], Action::ListInsert(json!("theirs")))]
        );

        assert_eq!(doc.on_op(ack(2, 1)).unwrap(), OpOutcome::Acknowledged);
        assert_eq!(
            doc.snapshot(),
            Some(&json!(["html", {}, ["body", {}, "mine", "theirs"]]))
        );
    }

    #[test]
    fn test_remote_edit_inside_locally_deleted_item_is_dropped() {
        let paragraph = json!(["p", {}, "hello"]);
        let mut doc = subscribed(Some(json!(["html", {}, ["body", {}, paragraph.clone()]])), 1);
        doc.submit(vec![Component::new(vec![2.into(), 2.into()], Action::ListDelete(paragraph))])
            .unwrap();
        doc.take_outgoing();

        let edit = remote(
            1,
            vec![Component::new(
                vec![2.into(), 2.into(), 2.into(), 5.into()],
                Action::StringInsert(" world".into()),
            )],
        );
        let outcome = doc.on_op(edit).unwrap();

        assert_eq!(
            outcome,
            OpOutcome::Applied(Change {
                op: Vec::new(),
                origin: Origin::Remote
            })
        );
        assert_eq!(doc.version(), 2);
        assert_eq!(doc.snapshot(), Some(&json!(["html", {}, ["body", {}]])));
    }

    #[test]
    fn test_pending_ops_are_sent_transformed() {
        let mut doc = subscribed(Some(skeleton()), 1);
        doc.submit(vec![Component::new(vec![2.into(), 2.into()], Action::ListInsert(json!("a")))])
            .unwrap();
        doc.submit(vec![Component::new(vec![2.into(), 3.into()], Action::ListInsert(json!("b")))])
            .unwrap();
        assert_eq!(doc.take_outgoing().len(), 1);

        let theirs = remote(1, vec![Component::new(vec![2.into(), 2.into()], Action::ListInsert(json!("x")))]);
        assert!(matches!(doc.on_op(theirs).unwrap(), OpOutcome::Applied(_)));
        assert_eq!(
            doc.snapshot(),
            Some(&json!(["html", {}, ["body", {}, "a", "b", "x"]]))
        );

        assert_eq!(doc.on_op(ack(2, 1)).unwrap(), OpOutcome::Acknowledged);
        assert_eq!(
            doc.take_outgoing(),
            vec![ClientMessage::Op {
                collection: "webstrates".into(),
                document: "doc".into(),
                v: Some(3),
                seq: 2,
                op: Some(vec![Component::new(vec![2.into(), 3.into()], Action::ListInsert(json!("b")))]),
                create: None,
            }]
        );
    }

    #[test]
    fn test_resubscribe_discards_queue() {
        let mut doc = subscribed(Some(skeleton()), 1);
        doc.submit(vec![Component::new(vec![2.into(), 2.into()], Action::ListInsert(json!("a")))])
            .unwrap();
        doc.submit(vec![Component::new(vec![2.into(), 3.into()], Action::ListInsert(json!("b")))])
            .unwrap();

        doc.on_subscribed(SnapshotData {
            v: 9,
            doc_type: Some("json0".into()),
            data: Some(skeleton()),
        });

        assert!(!doc.has_unacknowledged());
        assert!(doc.take_outgoing().is_empty());
        assert_eq!(doc.version(), 9);
        assert_eq!(doc.snapshot(), Some(&skeleton()));
    }

    #[test]
    fn test_subscribe_message() {
        let mut doc = RemoteDocument::new("webstrates", "contenteditable");
        assert_eq!(doc.collection(), "webstrates");
        assert_eq!(doc.id(), "contenteditable");
        assert_eq!(doc.client_id(), None);
        doc.set_client_id(Some("abc".into()));
        assert_eq!(doc.client_id(), Some("abc"));
        assert_eq!(
            doc.subscribe_message(),
            ClientMessage::Subscribe {
                collection: "webstrates".into(),
                document: "contenteditable".into()
            }
        );
    }
}
