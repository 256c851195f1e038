//! json0 operation vocabulary and the reference apply routine.
//!
//! An operation is an ordered list of [`Component`]s. Each component
//! addresses a value by path from the document root and carries one
//! directive, serialized with the json0 keys (`li`/`ld` for lists,
//! `oi`/`od` for objects, `si`/`sd` for text). String offsets count UTF-16
//! code units, like every other json0 implementation.
//!
//! Composition and transform of concurrent operations belong to the remote
//! service; this module only builds and applies operations.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Type mismatch at {path}: expected {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("Index {index} out of bounds at {path}")]
    IndexOutOfBounds { path: String, index: usize },

    #[error("Deleted text does not match document at {0}")]
    TextMismatch(String),

    #[error("Invalid component: {0}")]
    InvalidComponent(String),
}

pub type Result<T> = std::result::Result<T, OtError>;

/// One step of a path: a list index or an object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{}", i),
            PathSegment::Key(k) => write!(f, "{}", k),
        }
    }
}

pub type Path = Vec<PathSegment>;

fn format_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(|seg| format!("/{}", seg)).collect()
}

/// The mutation a component performs at its path.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ListInsert(Value),
    ListDelete(Value),
    ListReplace { before: Value, after: Value },
    ObjectInsert(Value),
    ObjectDelete(Value),
    ObjectReplace { before: Value, after: Value },
    StringInsert(String),
    StringDelete(String),
}

/// A single json0 patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawComponent", into = "RawComponent")]
pub struct Component {
    pub path: Path,
    pub action: Action,
}

impl Component {
    pub fn new(path: Path, action: Action) -> Self {
        Self { path, action }
    }

    /// Replace the whole document. This is how a document is reset.
    pub fn replace_root(value: Value) -> Self {
        Self::new(Vec::new(), Action::ObjectInsert(value))
    }
}

/// Wire shape of a component.
#[derive(Serialize, Deserialize)]
struct RawComponent {
    p: Path,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    li: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    ld: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    oi: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    od: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    si: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sd: Option<String>,
}

/// Deserialize a key that is present, keeping an explicit `null` as `Some(Null)`.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawComponent> for Component {
    type Error = OtError;

    fn try_from(raw: RawComponent) -> Result<Self> {
        let action = match (raw.li, raw.ld, raw.oi, raw.od, raw.si, raw.sd) {
            (Some(v), None, None, None, None, None) => Action::ListInsert(v),
            (None, Some(v), None, None, None, None) => Action::ListDelete(v),
            (Some(after), Some(before), None, None, None, None) => {
                Action::ListReplace { before, after }
            }
            (None, None, Some(v), None, None, None) => Action::ObjectInsert(v),
            (None, None, None, Some(v), None, None) => Action::ObjectDelete(v),
            (None, None, Some(after), Some(before), None, None) => {
                Action::ObjectReplace { before, after }
            }
            (None, None, None, None, Some(s), None) => Action::StringInsert(s),
            (None, None, None, None, None, Some(s)) => Action::StringDelete(s),
            _ => {
                return Err(OtError::InvalidComponent(format!(
                    "unsupported directive combination at {}",
                    format_path(&raw.p)
                )))
            }
        };
        Ok(Component {
            path: raw.p,
            action,
        })
    }
}

impl From<Component> for RawComponent {
    fn from(c: Component) -> Self {
        let mut raw = RawComponent {
            p: c.path,
            li: None,
            ld: None,
            oi: None,
            od: None,
            si: None,
            sd: None,
        };
        match c.action {
            Action::ListInsert(v) => raw.li = Some(v),
            Action::ListDelete(v) => raw.ld = Some(v),
            Action::ListReplace { before, after } => {
                raw.ld = Some(before);
                raw.li = Some(after);
            }
            Action::ObjectInsert(v) => raw.oi = Some(v),
            Action::ObjectDelete(v) => raw.od = Some(v),
            Action::ObjectReplace { before, after } => {
                raw.od = Some(before);
                raw.oi = Some(after);
            }
            Action::StringInsert(s) => raw.si = Some(s),
            Action::StringDelete(s) => raw.sd = Some(s),
        }
        raw
    }
}

/// Apply an operation to a document snapshot.
///
/// Atomic: on error the input is untouched and no partial result escapes.
pub fn apply(doc: &Value, op: &[Component]) -> Result<Value> {
    let mut out = doc.clone();
    for component in op {
        apply_component(&mut out, component)?;
    }
    Ok(out)
}

fn apply_component(doc: &mut Value, component: &Component) -> Result<()> {
    let path = &component.path;

    if path.is_empty() {
        return match &component.action {
            Action::ObjectInsert(v) | Action::ObjectReplace { after: v, .. } => {
                *doc = v.clone();
                Ok(())
            }
            Action::ObjectDelete(_) => {
                *doc = Value::Null;
                Ok(())
            }
            _ => Err(OtError::InvalidComponent(
                "only object directives may address the root".to_string(),
            )),
        };
    }

    let (last, parent_path) = path.split_last().ok_or(OtError::PathNotFound("/".into()))?;
    let parent = get_mut(doc, parent_path)?;

    match &component.action {
        Action::ObjectInsert(v) | Action::ObjectReplace { after: v, .. } => {
            let (map, key) = object_slot(parent, last, path)?;
            map.insert(key.to_string(), v.clone());
        }
        Action::ObjectDelete(_) => {
            let (map, key) = object_slot(parent, last, path)?;
            map.remove(key)
                .ok_or_else(|| OtError::PathNotFound(format_path(path)))?;
        }
        Action::ListInsert(v) => {
            let (list, index) = list_slot(parent, last, path)?;
            if index > list.len() {
                return Err(OtError::IndexOutOfBounds {
                    path: format_path(parent_path),
                    index,
                });
            }
            list.insert(index, v.clone());
        }
        Action::ListDelete(_) => {
            let (list, index) = list_slot(parent, last, path)?;
            if index >= list.len() {
                return Err(OtError::IndexOutOfBounds {
                    path: format_path(parent_path),
                    index,
                });
            }
            list.remove(index);
        }
        Action::ListReplace { after, .. } => {
            let (list, index) = list_slot(parent, last, path)?;
            let slot = list.get_mut(index).ok_or(OtError::IndexOutOfBounds {
                path: format_path(parent_path),
                index,
            })?;
            *slot = after.clone();
        }
        Action::StringInsert(text) => {
            let (s, offset) = string_slot(parent, last, path)?;
            let byte = utf16_to_byte(s, offset).ok_or(OtError::IndexOutOfBounds {
                path: format_path(parent_path),
                index: offset,
            })?;
            s.insert_str(byte, text);
        }
        Action::StringDelete(text) => {
            let (s, offset) = string_slot(parent, last, path)?;
            let byte = utf16_to_byte(s, offset).ok_or(OtError::IndexOutOfBounds {
                path: format_path(parent_path),
                index: offset,
            })?;
            if !s[byte..].starts_with(text.as_str()) {
                return Err(OtError::TextMismatch(format_path(path)));
            }
            s.replace_range(byte..byte + text.len(), "");
        }
    }
    Ok(())
}

fn get_mut<'a>(doc: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    let mut cur = doc;
    for (depth, seg) in path.iter().enumerate() {
        cur = match (cur, seg) {
            (Value::Array(list), PathSegment::Index(i)) => list
                .get_mut(*i)
                .ok_or_else(|| OtError::PathNotFound(format_path(&path[..=depth])))?,
            (Value::Object(map), PathSegment::Key(k)) => map
                .get_mut(k)
                .ok_or_else(|| OtError::PathNotFound(format_path(&path[..=depth])))?,
            _ => return Err(OtError::PathNotFound(format_path(&path[..=depth]))),
        };
    }
    Ok(cur)
}

fn object_slot<'a, 'b>(
    parent: &'a mut Value,
    last: &'b PathSegment,
    path: &[PathSegment],
) -> Result<(&'a mut serde_json::Map<String, Value>, &'b str)> {
    match (parent, last) {
        (Value::Object(map), PathSegment::Key(key)) => Ok((map, key.as_str())),
        _ => Err(OtError::TypeMismatch {
            path: format_path(path),
            expected: "an object key",
        }),
    }
}

fn list_slot<'a>(
    parent: &'a mut Value,
    last: &PathSegment,
    path: &[PathSegment],
) -> Result<(&'a mut Vec<Value>, usize)> {
    match (parent, last) {
        (Value::Array(list), PathSegment::Index(index)) => Ok((list, *index)),
        _ => Err(OtError::TypeMismatch {
            path: format_path(path),
            expected: "a list index",
        }),
    }
}

fn string_slot<'a>(
    parent: &'a mut Value,
    last: &PathSegment,
    path: &[PathSegment],
) -> Result<(&'a mut String, usize)> {
    match (parent, last) {
        (Value::String(s), PathSegment::Index(offset)) => Ok((s, *offset)),
        _ => Err(OtError::TypeMismatch {
            path: format_path(path),
            expected: "a text offset",
        }),
    }
}

/// Number of UTF-16 code units in `s`.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Byte index of a UTF-16 offset, or `None` if it is past the end or splits
/// a surrogate pair.
pub fn utf16_to_byte(s: &str, offset: usize) -> Option<usize> {
    let mut units = 0;
    for (byte, ch) in s.char_indices() {
        if units == offset {
            return Some(byte);
        }
        units += ch.len_utf16();
        if units > offset {
            return None;
        }
    }
    (units == offset).then_some(s.len())
}
