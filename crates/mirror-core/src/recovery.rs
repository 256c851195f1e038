//! Conflict recovery: reset the shared document to the skeleton tree.
//!
//! Used when an operation cannot be applied. Whatever edit triggered the
//! conflict is discarded; both sides converge on `<html><body></body></html>`.

use crate::document::{Result, SharedDocument};
use crate::ot::Component;
use crate::tree::skeleton;

/// The single root-level insert that replaces the whole document.
pub fn reset_op() -> Vec<Component> {
    vec![Component::replace_root(skeleton())]
}

/// Replace the document content with the skeleton tree.
///
/// Creates the document first if it does not exist. An error here means the
/// document refuses even a root replacement, which the caller must treat as
/// fatal for the session.
pub fn recover<D: SharedDocument + ?Sized>(document: &mut D) -> Result<()> {
    if !document.exists() {
        document.create()?;
    }
    document.submit(reset_op())
}
