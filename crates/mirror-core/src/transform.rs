//! json0 transform of concurrent operations.
//!
//! When a remote operation arrives while our own submissions are still
//! unacknowledged, both sides were built against the same version. The
//! service transforms our later submission against the remote one with our
//! operation on the left; the client has to do the mirror image so the two
//! replicas agree. [`transform_x`] returns both transformed operations.
//!
//! Ties go to the left side: two inserts at the same list index keep the
//! left insert first, and two inserts at the same key keep the left value.
//! String components transform like text0, with UTF-16 offsets.

use crate::ot::{self, Action, Component, OtError, PathSegment, Result, utf16_len};
use serde_json::Value;

/// Which side of a concurrent pair a component is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Transform two concurrent operations against each other.
///
/// Returns `(left', right')` such that applying `left` then `right'` gives
/// the same document as applying `right` then `left'`.
pub fn transform_x(left: &[Component], right: &[Component]) -> Result<(Vec<Component>, Vec<Component>)> {
    let mut left = left.to_vec();
    let mut new_right = Vec::new();

    for component in right {
        let mut right_component = Some(component.clone());
        let mut new_left = Vec::new();
        let mut k = 0;

        while k < left.len() {
            let Some(rc) = right_component.take() else {
                break;
            };
            let mut next = Vec::new();
            transform_component(&mut new_left, &left[k], &rc, Side::Left)?;
            transform_component(&mut next, &rc, &left[k], Side::Right)?;
            k += 1;

            match next.len() {
                1 => right_component = next.pop(),
                0 => {
                    new_left.extend_from_slice(&left[k..]);
                    break;
                }
                _ => {
                    let (rest_left, rest_right) = transform_x(&left[k..], &next)?;
                    new_left.extend(rest_left);
                    new_right.extend(rest_right);
                    break;
                }
            }
        }

        if let Some(rc) = right_component {
            new_right.push(rc);
        }
        left = new_left;
    }

    Ok((left, new_right))
}

/// Transform `op` so it applies after `other`, from the point of view of `side`.
pub fn transform(op: &[Component], other: &[Component], side: Side) -> Result<Vec<Component>> {
    match side {
        Side::Left => transform_x(op, other).map(|(left, _)| left),
        Side::Right => transform_x(other, op).map(|(_, right)| right),
    }
}

/// Transform one component against another, pushing zero or more results.
pub fn transform_component(
    dest: &mut Vec<Component>,
    c: &Component,
    other: &Component,
    side: Side,
) -> Result<()> {
    let mut c = c.clone();
    let clen = c.path.len();
    let olen = other.path.len();

    // A value we delete or replace was edited underneath; keep our copy current
    if olen > clen && other.path.starts_with(&c.path) {
        if let Some(before) = deleted_value_mut(&mut c.action) {
            let inner = Component::new(other.path[clen..].to_vec(), other.action.clone());
            *before = ot::apply(before, &[inner])?;
        }
    }

    if olen == 0 {
        return transform_against_root(dest, c, other, side);
    }

    let Some(common) = common_length(&other.path, &c.path) else {
        dest.push(c);
        return Ok(());
    };
    let common_operand = clen == olen;
    let same_slot = c.path[common] == other.path[common];

    if is_text(&c.action) && is_text(&other.action) {
        return transform_text(dest, &c, other, side);
    }

    match &other.action {
        Action::ListReplace { after, .. } => {
            if same_slot {
                if !common_operand {
                    return Ok(());
                }
                match &mut c.action {
                    Action::ListReplace { before, .. } if side == Side::Left => {
                        *before = after.clone();
                    }
                    Action::ListReplace { .. } | Action::ListDelete(_) => return Ok(()),
                    _ => {}
                }
            }
        }
        Action::ListInsert(_) => {
            let both_insert = matches!(c.action, Action::ListInsert(_));
            if both_insert && common_operand && same_slot {
                if side == Side::Right {
                    shift_index(&mut c.path[common], 1);
                }
            } else if index_le(&other.path[common], &c.path[common]) {
                shift_index(&mut c.path[common], 1);
            }
        }
        Action::ListDelete(_) => {
            if index_lt(&other.path[common], &c.path[common]) {
                shift_index(&mut c.path[common], -1);
            } else if same_slot {
                if olen < clen {
                    // Inside the deleted item
                    return Ok(());
                }
                match &c.action {
                    Action::ListReplace { after, .. } => {
                        c.action = Action::ListInsert(after.clone());
                    }
                    Action::ListDelete(_) => return Ok(()),
                    _ => {}
                }
            }
        }
        Action::ObjectReplace { after, .. } => {
            if same_slot {
                match &c.action {
                    Action::ObjectInsert(ours) | Action::ObjectReplace { after: ours, .. }
                        if common_operand =>
                    {
                        if side == Side::Right {
                            return Ok(());
                        }
                        c.action = Action::ObjectReplace {
                            before: after.clone(),
                            after: ours.clone(),
                        };
                    }
                    _ => return Ok(()),
                }
            }
        }
        Action::ObjectInsert(theirs) => {
            if same_slot && common_operand {
                if let Action::ObjectInsert(ours) | Action::ObjectReplace { after: ours, .. } =
                    &c.action
                {
                    if side == Side::Right {
                        return Ok(());
                    }
                    c.action = Action::ObjectReplace {
                        before: theirs.clone(),
                        after: ours.clone(),
                    };
                }
            }
        }
        Action::ObjectDelete(_) => {
            if same_slot {
                if !common_operand {
                    return Ok(());
                }
                match &c.action {
                    Action::ObjectReplace { after, .. } => {
                        c.action = Action::ObjectInsert(after.clone());
                    }
                    Action::ObjectInsert(_) => {}
                    _ => return Ok(()),
                }
            }
        }
        // Text edits never move anything outside their string
        Action::StringInsert(_) | Action::StringDelete(_) => {}
    }

    dest.push(c);
    Ok(())
}

/// `other` replaced or removed the whole document.
fn transform_against_root(
    dest: &mut Vec<Component>,
    mut c: Component,
    other: &Component,
    side: Side,
) -> Result<()> {
    if !c.path.is_empty() {
        return Ok(());
    }
    let theirs = match &other.action {
        Action::ObjectInsert(v) | Action::ObjectReplace { after: v, .. } => v.clone(),
        _ => Value::Null,
    };
    if side == Side::Left {
        if let Action::ObjectInsert(ours) | Action::ObjectReplace { after: ours, .. } = &c.action {
            c.action = Action::ObjectReplace {
                before: theirs,
                after: ours.clone(),
            };
            dest.push(c);
        }
    }
    Ok(())
}

/// Index in `c` of the last segment of `other`, when `other` addresses a
/// sibling of (or an ancestor of) the value at `c`.
fn common_length(other: &[PathSegment], c: &[PathSegment]) -> Option<usize> {
    let parent = other.len().checked_sub(1)?;
    if c.is_empty() || other.len() > c.len() {
        return None;
    }
    (other[..parent] == c[..parent]).then_some(parent)
}

fn is_text(action: &Action) -> bool {
    matches!(action, Action::StringInsert(_) | Action::StringDelete(_))
}

fn deleted_value_mut(action: &mut Action) -> Option<&mut Value> {
    match action {
        Action::ListDelete(v) | Action::ObjectDelete(v) => Some(v),
        Action::ListReplace { before, .. } | Action::ObjectReplace { before, .. } => Some(before),
        _ => None,
    }
}

fn index_le(a: &PathSegment, b: &PathSegment) -> bool {
    matches!((a, b), (PathSegment::Index(a), PathSegment::Index(b)) if a <= b)
}

fn index_lt(a: &PathSegment, b: &PathSegment) -> bool {
    matches!((a, b), (PathSegment::Index(a), PathSegment::Index(b)) if a < b)
}

fn shift_index(seg: &mut PathSegment, by: isize) {
    if let PathSegment::Index(i) = seg {
        *i = i.saturating_add_signed(by);
    }
}

// ============================================================================
// Text components
// ============================================================================

/// A text edit at a UTF-16 offset within one string.
#[derive(Debug, Clone)]
enum TextEdit {
    Insert { at: usize, text: String },
    Delete { at: usize, text: String },
}

impl TextEdit {
    fn from_component(c: &Component) -> Option<Self> {
        let at = match c.path.last()? {
            PathSegment::Index(at) => *at,
            PathSegment::Key(_) => return None,
        };
        match &c.action {
            Action::StringInsert(text) => Some(TextEdit::Insert { at, text: text.clone() }),
            Action::StringDelete(text) => Some(TextEdit::Delete { at, text: text.clone() }),
            _ => None,
        }
    }
}

/// Both components edit the same string.
fn transform_text(dest: &mut Vec<Component>, c: &Component, other: &Component, side: Side) -> Result<()> {
    let (Some(ours), Some(theirs)) = (TextEdit::from_component(c), TextEdit::from_component(other)) else {
        dest.push(c.clone());
        return Ok(());
    };
    let string_path = &c.path[..c.path.len() - 1];
    let mut push = |at: usize, action: Action| {
        let mut path = string_path.to_vec();
        path.push(PathSegment::Index(at));
        dest.push(Component::new(path, action));
    };

    match (ours, &theirs) {
        (TextEdit::Insert { at, text }, _) => {
            push(transform_position(at, &theirs, side == Side::Right), Action::StringInsert(text));
        }
        (TextEdit::Delete { at, text }, TextEdit::Insert { at: their_at, text: inserted }) => {
            let mut rest = text;
            if at < *their_at {
                let split = (*their_at - at).min(utf16_len(&rest));
                let (head, tail) = split_utf16(&rest, split);
                push(at, Action::StringDelete(head));
                rest = tail;
            }
            if !rest.is_empty() {
                push(at + utf16_len(inserted), Action::StringDelete(rest));
            }
        }
        (TextEdit::Delete { at, text }, TextEdit::Delete { at: their_at, text: removed }) => {
            let len = utf16_len(&text);
            let their_len = utf16_len(removed);
            let their_end = their_at + their_len;

            if at >= their_end {
                push(at - their_len, Action::StringDelete(text));
            } else if at + len <= *their_at {
                push(at, Action::StringDelete(text));
            } else {
                // Overlap: the shared range must hold the same text on both sides
                let start = at.max(*their_at);
                let end = (at + len).min(their_end);
                if slice_utf16(&text, start - at, end - at)
                    != slice_utf16(removed, start - their_at, end - their_at)
                {
                    return Err(OtError::TextMismatch(format!("{:?}", c.path)));
                }

                let mut remaining = String::new();
                if at < *their_at {
                    remaining.push_str(&slice_utf16(&text, 0, *their_at - at));
                }
                if at + len > their_end {
                    remaining.push_str(&slice_utf16(&text, their_end - at, len));
                }
                if !remaining.is_empty() {
                    push(transform_position(at, &theirs, false), Action::StringDelete(remaining));
                }
            }
        }
    }
    Ok(())
}

fn transform_position(pos: usize, other: &TextEdit, insert_after: bool) -> usize {
    match other {
        TextEdit::Insert { at, text } => {
            if *at < pos || (*at == pos && insert_after) {
                pos + utf16_len(text)
            } else {
                pos
            }
        }
        TextEdit::Delete { at, text } => {
            let len = utf16_len(text);
            if pos <= *at {
                pos
            } else if pos <= at + len {
                *at
            } else {
                pos - len
            }
        }
    }
}

fn slice_utf16(s: &str, start: usize, end: usize) -> String {
    let units: Vec<u16> = s.encode_utf16().collect();
    let end = end.min(units.len());
    let start = start.min(end);
    String::from_utf16_lossy(&units[start..end])
}

fn split_utf16(s: &str, at: usize) -> (String, String) {
    let len = utf16_len(s);
    (slice_utf16(s, 0, at), slice_utf16(s, at, len))
}
