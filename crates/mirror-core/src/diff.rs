//! Structural diff between two JsonML trees.
//!
//! Walks both values in parallel and emits json0 components at each point
//! where they diverge, recursing into positions that still match. Lists are
//! trimmed of their common prefix and suffix first, so an edit deep inside a
//! large document yields components proportional to the edit rather than a
//! rewrite of the document.
//!
//! The result is deterministic and `apply(old, &diff(old, new)) == new`.

use crate::ot::{utf16_len, Action, Component, Path, PathSegment};
use serde_json::{Map, Value};

/// Upper bound on alignment probes for one list; larger lists align at the front.
const MAX_ALIGNMENT_PROBES: usize = 4096;

/// How the value under diff is addressed by its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Root,
    Key,
    Index,
}

/// Compute the operation turning `old` into `new`.
pub fn diff(old: &Value, new: &Value) -> Vec<Component> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_value(&mut ops, &mut path, Slot::Root, old, new);
    ops
}

fn diff_value(ops: &mut Vec<Component>, path: &mut Path, slot: Slot, old: &Value, new: &Value) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::String(a), Value::String(b)) => diff_text(ops, path, a, b),
        (Value::Object(a), Value::Object(b)) => diff_object(ops, path, a, b),
        (Value::Array(a), Value::Array(b)) if same_identity(old, new) => {
            diff_list(ops, path, a, b)
        }
        _ => replace(ops, path, slot, old, new),
    }
}

/// Whether two values can be patched in place rather than replaced.
///
/// Element arrays keep their identity only while the tag is unchanged.
fn same_identity(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::String(_), Value::String(_)) | (Value::Object(_), Value::Object(_)) => true,
        (Value::Array(a), Value::Array(b)) => match (a.first(), b.first()) {
            (Some(Value::String(x)), Some(Value::String(y))) => x == y,
            (Some(Value::String(_)), _) | (_, Some(Value::String(_))) => false,
            _ => true,
        },
        _ => false,
    }
}

fn replace(ops: &mut Vec<Component>, path: &Path, slot: Slot, old: &Value, new: &Value) {
    let action = match slot {
        Slot::Index => Action::ListReplace {
            before: old.clone(),
            after: new.clone(),
        },
        Slot::Root | Slot::Key => Action::ObjectReplace {
            before: old.clone(),
            after: new.clone(),
        },
    };
    ops.push(Component::new(path.clone(), action));
}

fn diff_text(ops: &mut Vec<Component>, path: &Path, old: &str, new: &str) {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();

    let removed: String = a[prefix..a.len() - suffix].iter().collect();
    let inserted: String = b[prefix..b.len() - suffix].iter().collect();
    let offset = utf16_len(&old[..byte_index(old, prefix)]);

    let mut at = path.clone();
    at.push(PathSegment::Index(offset));
    if !removed.is_empty() {
        ops.push(Component::new(at.clone(), Action::StringDelete(removed)));
    }
    if !inserted.is_empty() {
        ops.push(Component::new(at, Action::StringInsert(inserted)));
    }
}

fn byte_index(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

fn diff_object(ops: &mut Vec<Component>, path: &mut Path, old: &Map<String, Value>, new: &Map<String, Value>) {
    let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        path.push(PathSegment::Key(key.clone()));
        match (old.get(key), new.get(key)) {
            (Some(before), None) => {
                ops.push(Component::new(path.clone(), Action::ObjectDelete(before.clone())));
            }
            (None, Some(after)) => {
                ops.push(Component::new(path.clone(), Action::ObjectInsert(after.clone())));
            }
            (Some(before), Some(after)) => diff_value(ops, path, Slot::Key, before, after),
            (None, None) => {}
        }
        path.pop();
    }
}

fn diff_list(ops: &mut Vec<Component>, path: &mut Path, old: &[Value], new: &[Value]) {
    let prefix = old.iter().zip(new).take_while(|(x, y)| x == y).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    let base = prefix;

    if new_mid.len() >= old_mid.len() {
        // Insertions: new_mid[..shift] and new_mid[shift + paired..] are new.
        let paired = old_mid.len();
        let shift = best_alignment(old_mid, new_mid);

        for (j, item) in new_mid[..shift].iter().enumerate() {
            push_list(ops, path, base + j, Action::ListInsert(item.clone()));
        }
        for i in 0..paired {
            path.push(PathSegment::Index(base + shift + i));
            diff_value(ops, path, Slot::Index, &old_mid[i], &new_mid[shift + i]);
            path.pop();
        }
        for (j, item) in new_mid[shift + paired..].iter().enumerate() {
            push_list(ops, path, base + shift + paired + j, Action::ListInsert(item.clone()));
        }
    } else {
        // Deletions: old_mid[..shift] and old_mid[shift + paired..] go away.
        let paired = new_mid.len();
        let shift = best_alignment(new_mid, old_mid);

        for item in &old_mid[..shift] {
            push_list(ops, path, base, Action::ListDelete(item.clone()));
        }
        for i in 0..paired {
            path.push(PathSegment::Index(base + i));
            diff_value(ops, path, Slot::Index, &old_mid[shift + i], &new_mid[i]);
            path.pop();
        }
        for item in &old_mid[shift + paired..] {
            push_list(ops, path, base + paired, Action::ListDelete(item.clone()));
        }
    }
}

fn push_list(ops: &mut Vec<Component>, path: &Path, index: usize, action: Action) {
    let mut at = path.clone();
    at.push(PathSegment::Index(index));
    ops.push(Component::new(at, action));
}

/// Pick where the shorter run lines up inside the longer one.
///
/// Each candidate offset is scored by how many paired items are equal, then
/// by how many keep their identity; the earliest best offset wins.
fn best_alignment(short: &[Value], long: &[Value]) -> usize {
    let extra = long.len() - short.len();
    if extra == 0 || short.is_empty() || (extra + 1) * short.len() > MAX_ALIGNMENT_PROBES {
        return 0;
    }

    let mut best = (0, (0usize, 0usize));
    for shift in 0..=extra {
        let mut equal = 0;
        let mut kept = 0;
        for (a, b) in short.iter().zip(&long[shift..]) {
            if a == b {
                equal += 1;
            } else if same_identity(a, b) {
                kept += 1;
            }
        }
        if (equal, kept) > best.1 {
            best = (shift, (equal, kept));
        }
    }
    best.0
}
