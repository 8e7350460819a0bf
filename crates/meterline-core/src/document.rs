//! Generic topology documents
//!
//! Probe documents arrive as XML (or as JSON that was already converted from
//! XML). Both are decoded into the same compact tree: an element becomes a
//! [`Document::Mapping`] whose attributes sit under [`ATTRIBUTES_KEY`], whose
//! text sits under [`TEXT_KEY`], and whose child elements are keyed by tag.
//! Repeated child tags collapse into a [`Document::Sequence`].

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::node::Scalar;

/// Reserved key holding an element's attributes
pub const ATTRIBUTES_KEY: &str = "_attributes";
/// Reserved key holding an element's text content
pub const TEXT_KEY: &str = "_text";

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Failed to parse XML document: {0}")]
    Xml(String),
    #[error("Failed to parse JSON document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unbalanced XML document: {0}")]
    Unbalanced(String),
    #[error("Unrecognized document format")]
    UnknownFormat,
}

/// Encoding of a document on the wire or on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Sniff from the first non-whitespace character
    #[default]
    Auto,
    Xml,
    Json,
}

/// A node of the generic document tree
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// Keyed children in document order
    Mapping(Vec<(String, Document)>),
    Sequence(Vec<Document>),
    Scalar(Scalar),
}

impl Document {
    /// Parse document text in the given format
    pub fn parse(content: &str, format: Format) -> Result<Self, DocumentError> {
        match format {
            Format::Xml => Self::from_xml(content),
            Format::Json => Self::from_json_str(content),
            Format::Auto => match content.trim_start().chars().next() {
                Some('<') => Self::from_xml(content),
                Some('{') | Some('[') => Self::from_json_str(content),
                _ => Err(DocumentError::UnknownFormat),
            },
        }
    }

    /// Load a document from a file, using the extension when it says JSON
    pub fn from_file(path: &Path) -> Result<Self, DocumentError> {
        let content = std::fs::read_to_string(path)?;
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Format::Json,
            Some("xml") => Format::Xml,
            _ => Format::Auto,
        };
        Self::parse(&content, format)
    }

    pub fn from_json_str(content: &str) -> Result<Self, DocumentError> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        Ok(Self::from_json(&value))
    }

    /// Convert a JSON value, keeping key order
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self::Mapping(
                map.iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect(),
            ),
            serde_json::Value::Array(items) => {
                Self::Sequence(items.iter().map(Self::from_json).collect())
            }
            scalar => Self::Scalar(Scalar::from_json(scalar).unwrap_or(Scalar::Null)),
        }
    }

    /// Decode an XML document into the compact tree shape
    pub fn from_xml(xml: &str) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack = vec![OpenElement::root()];

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => stack.push(OpenElement::from_start(&e)?),
                Ok(Event::Empty(e)) => {
                    let element = OpenElement::from_start(&e)?;
                    close_into(&mut stack, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .filter(|_| !stack.is_empty())
                        .ok_or_else(|| DocumentError::Unbalanced("unexpected end tag".into()))?;
                    close_into(&mut stack, element)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| DocumentError::Xml(e.to_string()))?;
                    push_text(&mut stack, &text);
                }
                Ok(Event::CData(c)) => {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    push_text(&mut stack, &text);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(DocumentError::Xml(format!(
                        "at position {}: {}",
                        reader.error_position(),
                        e
                    )))
                }
            }
        }

        match stack.pop() {
            Some(root) if stack.is_empty() => Ok(Self::Mapping(root.entries)),
            Some(open) => Err(DocumentError::Unbalanced(format!(
                "element <{}> is never closed",
                open.tag
            ))),
            None => Err(DocumentError::Unbalanced("empty element stack".into())),
        }
    }

    /// Look up a key of a mapping
    pub fn get(&self, key: &str) -> Option<&Document> {
        match self {
            Self::Mapping(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

/// An element whose end tag has not been seen yet
struct OpenElement {
    tag: String,
    entries: Vec<(String, Document)>,
    text: String,
}

impl OpenElement {
    fn root() -> Self {
        Self {
            tag: String::new(),
            entries: Vec::new(),
            text: String::new(),
        }
    }

    fn from_start(e: &BytesStart<'_>) -> Result<Self, DocumentError> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| DocumentError::Xml(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| DocumentError::Xml(e.to_string()))?
                .into_owned();
            attributes.push((key, Document::Scalar(Scalar::Text(value))));
        }

        let mut entries = Vec::new();
        if !attributes.is_empty() {
            entries.push((ATTRIBUTES_KEY.to_string(), Document::Mapping(attributes)));
        }
        Ok(Self {
            tag,
            entries,
            text: String::new(),
        })
    }

    fn finish(mut self) -> (String, Document) {
        if !self.text.is_empty() {
            self.entries
                .push((TEXT_KEY.to_string(), Document::Scalar(Scalar::Text(self.text))));
        }
        (self.tag, Document::Mapping(self.entries))
    }
}

fn push_text(stack: &mut [OpenElement], text: &str) {
    if let Some(top) = stack.last_mut() {
        top.text.push_str(text);
    }
}

/// Attach a finished element to its parent, turning repeated tags into a sequence
fn close_into(stack: &mut [OpenElement], element: OpenElement) -> Result<(), DocumentError> {
    let parent = stack
        .last_mut()
        .ok_or_else(|| DocumentError::Unbalanced("element without parent".into()))?;
    let (tag, doc) = element.finish();

    match parent.entries.iter_mut().find(|(k, _)| *k == tag) {
        Some((_, Document::Sequence(items))) => items.push(doc),
        Some((_, existing)) => {
            let first = std::mem::replace(existing, Document::Sequence(Vec::new()));
            *existing = Document::Sequence(vec![first, doc]);
        }
        None => parent.entries.push((tag, doc)),
    }
    Ok(())
}

/// SHA256 fingerprint of raw document content, as lowercase hex
pub fn fingerprint(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
