//! Markup serialization and parsing for document trees.
//!
//! Handles the conversion between the mirror file's markup text and the
//! JsonML tree held by the shared document. Escaping is scoped by the parent
//! element: text inside raw-content elements (`script`, `style`) is written
//! and read verbatim, everything else escapes `&`, `<` and `>`.

use crate::tree::{
    is_valid_attribute_name, is_valid_tag_name, normalize, Element, MalformedTreeError, Node,
};
use serde_json::Value;
use thiserror::Error;

/// Elements whose text content is never entity-escaped.
pub const RAW_CONTENT_ELEMENTS: &[&str] = &["script", "style"];

/// Elements serialized without a closing tag.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "keygen", "link", "menuitem",
    "meta", "param", "source", "track", "wbr",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("Invalid tag name at byte {0}")]
    InvalidTagName(usize),

    #[error("Malformed attribute at byte {0}")]
    InvalidAttribute(usize),

    #[error("Unexpected closing tag </{tag}> at byte {offset}")]
    UnexpectedCloseTag { tag: String, offset: usize },

    #[error("Closing tag </{found}> does not match <{expected}> at byte {offset}")]
    MismatchedCloseTag {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("Element <{0}> is never closed")]
    Unclosed(String),

    #[error("Document has no root element")]
    NoRoot,

    #[error("Content outside the root element at byte {0}")]
    ContentOutsideRoot(usize),
}

pub fn is_void(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

pub fn is_raw_content(tag: &str) -> bool {
    RAW_CONTENT_ELEMENTS.contains(&tag)
}

/// Escape a text leaf. Ampersand goes first so the other entities are not
/// escaped twice.
pub fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Reverse of [`escape_text`]. Ampersand goes last so decoded content cannot
/// form a new entity. Any other entity is left as written.
pub fn unescape_text(text: &str) -> String {
    text.replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

fn unescape_attribute(value: &str) -> String {
    value.replace("&quot;", "\"").replace("&amp;", "&")
}

// ============================================================================
// Serialization
// ============================================================================

/// Serialize a JsonML tree to markup.
///
/// The tree is normalized first, so a document missing attribute slots still
/// serializes. Fails if the value is not a representable tree.
pub fn to_markup(tree: &Value) -> Result<String, MalformedTreeError> {
    let node = Node::try_from(&normalize(tree))?;
    render(&node)
}

/// Serialize a typed node to markup.
pub fn render(node: &Node) -> Result<String, MalformedTreeError> {
    let mut out = String::new();
    write_node(&mut out, node, None)?;
    Ok(out)
}

fn write_node(out: &mut String, node: &Node, parent: Option<&str>) -> Result<(), MalformedTreeError> {
    match node {
        Node::Text(text) => {
            if parent.is_some_and(is_raw_content) {
                out.push_str(text);
            } else {
                out.push_str(&escape_text(text));
            }
        }
        Node::Element(el) => write_element(out, el)?,
    }
    Ok(())
}

fn write_element(out: &mut String, el: &Element) -> Result<(), MalformedTreeError> {
    if !is_valid_tag_name(&el.tag) {
        return Err(MalformedTreeError::InvalidTagName(el.tag.clone()));
    }
    if let Some(name) = el.attributes.keys().find(|name| !is_valid_attribute_name(name)) {
        return Err(MalformedTreeError::InvalidAttributeName {
            tag: el.tag.clone(),
            name: name.clone(),
        });
    }

    let void = is_void(&el.tag);
    if void && !el.children.is_empty() {
        return Err(MalformedTreeError::VoidWithChildren(el.tag.clone()));
    }

    out.push('<');
    out.push_str(&el.tag);
    for (name, value) in &el.attributes {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_attribute(value));
        out.push('"');
    }
    out.push('>');

    if void {
        return Ok(());
    }

    for child in &el.children {
        write_node(out, child, Some(&el.tag))?;
    }

    out.push_str("</");
    out.push_str(&el.tag);
    out.push('>');
    Ok(())
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse markup into a typed tree.
///
/// The input must hold exactly one root element; surrounding whitespace,
/// doctype declarations, processing instructions and comments are ignored.
pub fn from_markup(markup: &str) -> Result<Node, ParseError> {
    Parser::new(markup.trim()).parse()
}

/// Parse markup straight into the JsonML value stored by the shared document.
pub fn from_markup_value(markup: &str) -> Result<Value, ParseError> {
    from_markup(markup).map(|node| node.to_value())
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    stack: Vec<Element>,
    root: Option<Element>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            stack: Vec::new(),
            root: None,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn parse(mut self) -> Result<Node, ParseError> {
        while self.pos < self.src.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                self.skip_past(">")?;
            } else if rest.starts_with("</") {
                self.close_tag()?;
            } else if rest.len() > 1 && rest.as_bytes()[0] == b'<' && rest.as_bytes()[1].is_ascii_alphabetic() {
                self.open_tag()?;
            } else {
                self.text()?;
            }
        }

        if let Some(open) = self.stack.pop() {
            return Err(ParseError::Unclosed(open.tag));
        }
        self.root.map(Node::Element).ok_or(ParseError::NoRoot)
    }

    fn skip_past(&mut self, terminator: &str) -> Result<(), ParseError> {
        match self.rest().find(terminator) {
            Some(idx) => {
                self.pos += idx + terminator.len();
                Ok(())
            }
            None => Err(ParseError::UnexpectedEof(self.src.len())),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn name(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b':' | b'.'))
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(ParseError::InvalidTagName(start));
        }
        Ok(self.src[start..self.pos].to_ascii_lowercase())
    }

    fn text(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        // A '<' that did not start markup is literal text; consume at least it.
        let first = self.rest().chars().next().map_or(1, char::len_utf8);
        let end = match self.src[start + first..].find('<') {
            Some(idx) => start + first + idx,
            None => self.src.len(),
        };
        self.pos = end;
        let text = unescape_text(&self.src[start..end]);
        self.attach(Node::Text(text), start)
    }

    fn open_tag(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        let mut element = Element::new(&self.name()?);

        let self_closing = loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.pos += 2;
                break true;
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break false;
            }
            if rest.is_empty() {
                return Err(ParseError::UnexpectedEof(self.src.len()));
            }
            let (name, value) = self.attribute()?;
            element.attributes.insert(name, value);
        };

        if self_closing || is_void(&element.tag) {
            return self.attach(Node::Element(element), start);
        }

        if is_raw_content(&element.tag) {
            let closing = format!("</{}", element.tag);
            let content_end = find_ascii_case_insensitive(self.rest(), &closing)
                .map(|idx| self.pos + idx)
                .ok_or_else(|| ParseError::Unclosed(element.tag.clone()))?;
            if content_end > self.pos {
                let raw = self.src[self.pos..content_end].to_string();
                element.children.push(Node::Text(raw));
            }
            self.pos = content_end;
        }

        self.stack.push(element);
        Ok(())
    }

    fn attribute(&mut self) -> Result<(String, String), ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|b| {
            !b.is_ascii_whitespace() && !matches!(b, b'=' | b'>' | b'/' | b'"' | b'\'')
        }) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(ParseError::InvalidAttribute(start));
        }
        let name = self.src[start..self.pos].to_ascii_lowercase();

        self.skip_whitespace();
        if self.peek() != Some(b'=') {
            return Ok((name, String::new()));
        }
        self.pos += 1;
        self.skip_whitespace();

        let value = match self.peek() {
            Some(quote @ (b'"' | b'\'')) => {
                self.pos += 1;
                let len = self.rest().find(quote as char).ok_or(ParseError::UnexpectedEof(self.src.len()))?;
                let raw = &self.src[self.pos..self.pos + len];
                self.pos += len + 1;
                raw
            }
            Some(_) => {
                let value_start = self.pos;
                while self.peek().is_some_and(|b| !b.is_ascii_whitespace() && b != b'>') {
                    self.pos += 1;
                }
                &self.src[value_start..self.pos]
            }
            None => return Err(ParseError::UnexpectedEof(self.src.len())),
        };

        Ok((name, unescape_attribute(value)))
    }

    fn close_tag(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 2;
        let tag = self.name()?;
        self.skip_whitespace();
        match self.peek() {
            Some(b'>') => self.pos += 1,
            Some(_) => return Err(ParseError::InvalidTagName(self.pos)),
            None => return Err(ParseError::UnexpectedEof(self.src.len())),
        }

        if is_void(&tag) {
            return Ok(());
        }

        match self.stack.pop() {
            Some(open) if open.tag == tag => self.attach(Node::Element(open), start),
            Some(open) => Err(ParseError::MismatchedCloseTag {
                expected: open.tag,
                found: tag,
                offset: start,
            }),
            None => Err(ParseError::UnexpectedCloseTag { tag, offset: start }),
        }
    }

    fn attach(&mut self, node: Node, offset: usize) -> Result<(), ParseError> {
        if let Some(parent) = self.stack.last_mut() {
            match (parent.children.last_mut(), node) {
                (Some(Node::Text(prev)), Node::Text(text)) => prev.push_str(&text),
                (_, node) => parent.children.push(node),
            }
            return Ok(());
        }

        match node {
            Node::Text(text) if text.trim().is_empty() => Ok(()),
            Node::Element(el) if self.root.is_none() => {
                self.root = Some(el);
                Ok(())
            }
            _ => Err(ParseError::ContentOutsideRoot(offset)),
        }
    }
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}
