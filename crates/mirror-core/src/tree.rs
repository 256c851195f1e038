//! Document tree model and normalization.
//!
//! The shared document stores its tree as JsonML: `["tag", {attrs}, child...]`,
//! with text leaves as plain JSON strings. Producers are allowed to omit the
//! attributes slot, so every tree goes through [`normalize`] before it is
//! diffed or serialized.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedTreeError {
    #[error("Expected an element or text node, found {0}")]
    UnexpectedValue(&'static str),

    #[error("Element has no tag")]
    MissingTag,

    #[error("Element tag must be a string, found {0}")]
    InvalidTag(&'static str),

    #[error("Tag name {0:?} cannot be written as markup")]
    InvalidTagName(String),

    #[error("Attribute name {name:?} of <{tag}> cannot be written as markup")]
    InvalidAttributeName { tag: String, name: String },

    #[error("Attributes of <{tag}> must be an object, found {found}")]
    InvalidAttributes { tag: String, found: &'static str },

    #[error("Attribute {name:?} of <{tag}> has a non-scalar value")]
    InvalidAttributeValue { tag: String, name: String },

    #[error("Void element <{0}> cannot have children")]
    VoidWithChildren(String),
}

/// A node of the document tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Element(Element),
}

/// An element node. Attributes are always present, possibly empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<Node>,
}

impl Element {
    /// Create an empty element. The tag is lowercased.
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_lowercase(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Convert to the JsonML shape stored in the shared document.
    pub fn to_value(&self) -> Value {
        let attributes: Map<String, Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        let mut items = Vec::with_capacity(self.children.len() + 2);
        items.push(Value::String(self.tag.clone()));
        items.push(Value::Object(attributes));
        items.extend(self.children.iter().map(Node::to_value));
        Value::Array(items)
    }
}

impl Node {
    pub fn text(content: &str) -> Self {
        Node::Text(content.to_string())
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Node::Text(s) => Value::String(s.clone()),
            Node::Element(el) => el.to_value(),
        }
    }
}

impl From<Element> for Node {
    fn from(el: Element) -> Self {
        Node::Element(el)
    }
}

impl TryFrom<&Value> for Node {
    type Error = MalformedTreeError;

    /// Read a normalized JsonML value. Unnormalized input (e.g. a missing
    /// attributes slot) is rejected; run [`normalize`] first.
    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(Node::Text(s.clone())),
            Value::Array(items) => element_from_items(items).map(Node::Element),
            other => Err(MalformedTreeError::UnexpectedValue(kind_of(other))),
        }
    }
}

fn element_from_items(items: &[Value]) -> Result<Element, MalformedTreeError> {
    let (tag, rest) = items.split_first().ok_or(MalformedTreeError::MissingTag)?;
    let tag = match tag {
        Value::String(s) if is_valid_tag_name(s) => s.clone(),
        Value::String(s) => return Err(MalformedTreeError::InvalidTagName(s.clone())),
        other => return Err(MalformedTreeError::InvalidTag(kind_of(other))),
    };

    let (attributes, children) = match rest.split_first() {
        Some((Value::Object(map), children)) => (read_attributes(&tag, map)?, children),
        Some((other, _)) => {
            return Err(MalformedTreeError::InvalidAttributes {
                tag,
                found: kind_of(other),
            })
        }
        None => (BTreeMap::new(), rest),
    };

    let children = children
        .iter()
        .map(Node::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Element {
        tag,
        attributes,
        children,
    })
}

fn read_attributes(
    tag: &str,
    map: &Map<String, Value>,
) -> Result<BTreeMap<String, String>, MalformedTreeError> {
    map.iter()
        .map(|(name, value)| {
            if !is_valid_attribute_name(name) {
                return Err(MalformedTreeError::InvalidAttributeName {
                    tag: tag.to_string(),
                    name: name.clone(),
                });
            }
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(MalformedTreeError::InvalidAttributeValue {
                        tag: tag.to_string(),
                        name: name.clone(),
                    })
                }
            };
            Ok((name.clone(), value))
        })
        .collect()
}

/// Whether `tag` reads back as the same element name after rendering.
pub fn is_valid_tag_name(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b':' | b'.'))
}

/// Whether `name` reads back as one attribute after rendering.
pub fn is_valid_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '>' | '/' | '=' | '<'))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Canonicalize a JsonML value.
///
/// - `null` and `[]` become `[]`.
/// - Strings pass through.
/// - For `[tag, second, ...rest]`, an object `second` is the attributes map;
///   a `null` or missing `second` is replaced by `{}`; any other `second` is
///   the first child and `{}` is synthesized in front of it.
/// - Children are normalized recursively and the tag is lowercased.
///
/// Other values are returned unchanged and rejected later by
/// `Node::try_from`. The function is idempotent.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Null => Value::Array(Vec::new()),
        Value::Array(items) if items.is_empty() => Value::Array(Vec::new()),
        Value::Array(items) => normalize_element(items),
        other => other.clone(),
    }
}

fn normalize_element(items: &[Value]) -> Value {
    let (tag, rest) = match items.split_first() {
        Some(split) => split,
        None => return Value::Array(Vec::new()),
    };

    let tag = match tag {
        Value::String(s) => Value::String(s.to_lowercase()),
        other => other.clone(),
    };

    let (attributes, children) = match rest.split_first() {
        Some((Value::Object(map), children)) => (Value::Object(map.clone()), children),
        Some((Value::Null, children)) => (Value::Object(Map::new()), children),
        _ => (Value::Object(Map::new()), rest),
    };

    let mut out = Vec::with_capacity(children.len() + 2);
    out.push(tag);
    out.push(attributes);
    out.extend(children.iter().map(normalize));
    Value::Array(out)
}

/// The minimal document: an `html` element holding an empty `body`.
pub fn skeleton() -> Value {
    Element::new("html")
        .with_child(Element::new("body"))
        .to_value()
}
