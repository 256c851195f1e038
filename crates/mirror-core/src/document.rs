//! SharedDocument trait: the seam to the collaboratively edited document.
//!
//! Implementations:
//! - `InMemoryDocument` - In-process document, used by tests and local runs
//! - `RemoteDocument` (in mirror-daemon) - ShareDB-style document over WebSocket
//!
//! The document owns the current tree. Everything else changes it only by
//! submitting operations, which the document may reject.

use crate::ot::{self, Component, OtError};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Operation rejected: {0}")]
    Rejected(#[from] OtError),

    #[error("Document already exists")]
    AlreadyExists,

    #[error("Document has not been created")]
    NotCreated,

    #[error("Document session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Submitted by this process
    Local,
    /// Received from another collaborator
    Remote,
}

/// A change notification: the operation that was applied and its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub op: Vec<Component>,
    pub origin: Origin,
}

/// A shared document holding a JsonML tree.
pub trait SharedDocument {
    /// Current tree, or `None` while the document has no type (not created).
    fn snapshot(&self) -> Option<&Value>;

    /// Whether the document has been created.
    fn exists(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Create the document with the json0 type and empty content.
    fn create(&mut self) -> Result<()>;

    /// Apply and submit an operation. On error the tree is unchanged.
    fn submit(&mut self, op: Vec<Component>) -> Result<()>;
}

/// In-process document.
#[derive(Debug, Default)]
pub struct InMemoryDocument {
    data: Option<Value>,
    version: u64,
    submitted: Vec<Vec<Component>>,
}

impl InMemoryDocument {
    /// A document that has not been created yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A created document holding `data`.
    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            version: 1,
            submitted: Vec::new(),
        }
    }

    /// Number of operations applied since creation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Operations submitted through [`SharedDocument::submit`], oldest first.
    pub fn submitted(&self) -> &[Vec<Component>] {
        &self.submitted
    }

    /// Apply an operation from another collaborator.
    pub fn apply_remote(&mut self, op: Vec<Component>) -> Result<Change> {
        self.apply(&op)?;
        Ok(Change {
            op,
            origin: Origin::Remote,
        })
    }

    fn apply(&mut self, op: &[Component]) -> Result<()> {
        let current = self.data.as_ref().ok_or(DocumentError::NotCreated)?;
        self.data = Some(ot::apply(current, op)?);
        self.version += 1;
        Ok(())
    }
}

impl SharedDocument for InMemoryDocument {
    fn snapshot(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    fn create(&mut self) -> Result<()> {
        if self.data.is_some() {
            return Err(DocumentError::AlreadyExists);
        }
        self.data = Some(Value::Null);
        self.version = 1;
        Ok(())
    }

    fn submit(&mut self, op: Vec<Component>) -> Result<()> {
        self.apply(&op)?;
        self.submitted.push(op);
        Ok(())
    }
}
