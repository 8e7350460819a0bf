//! Flattening of a document tree into the elements of interest
//!
//! The walker visits every mapping of a [`Document`], treating the key it was
//! reached under as its tag. Attribute and text children are merged into the
//! element instead of becoming elements themselves. Elements whose tag is in
//! the keep set are returned in document order together with their ancestor
//! chain, which the path canonicalizer needs.

use std::collections::HashSet;

use crate::document::{Document, ATTRIBUTES_KEY, TEXT_KEY};
use crate::node::Scalar;

/// Element attributes in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(Vec<(String, Scalar)>);

impl Attributes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or overwrite an attribute, keeping its original position
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Scalar>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Attribute rendered as trimmed text; blank values count as missing
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.to_string().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Self::new();
        for (key, value) in iter {
            attributes.insert(key, value);
        }
        attributes
    }
}

/// A typed element found while walking a document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Key the element was reached under, eg `DataItem`
    pub tag: String,
    pub attributes: Attributes,
    pub text: Option<String>,
    /// Position among siblings sharing the same tag
    pub ordinal: usize,
    /// Outermost first; the ancestors' own chains are left empty
    pub ancestors: Vec<Element>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_ancestors(mut self, ancestors: Vec<Element>) -> Self {
        self.ancestors = ancestors;
        self
    }

    pub fn attr(&self, key: &str) -> Option<String> {
        self.attributes.text(key)
    }
}

/// Walk configuration: which tags are returned and which subtrees are skipped
#[derive(Debug, Clone)]
pub struct Walker {
    keep: HashSet<String>,
    skip: HashSet<String>,
}

impl Default for Walker {
    fn default() -> Self {
        Self::new(["Device", "DataItem"], ["Agent"])
    }
}

/// Working element while the walk is in progress
struct Frame {
    tag: String,
    attributes: Attributes,
    text: Option<String>,
    ordinal: usize,
    parent: Option<usize>,
}

impl Walker {
    pub fn new<K, S>(keep: K, skip: S) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            keep: keep.into_iter().map(Into::into).collect(),
            skip: skip.into_iter().map(Into::into).collect(),
        }
    }

    /// Flatten a document into its kept elements, in document order
    pub fn walk(&self, document: &Document) -> Vec<Element> {
        let mut frames = Vec::new();
        let mut kept = Vec::new();
        self.visit(document, "", None, 0, &mut frames, &mut kept);

        kept.into_iter()
            .map(|index| {
                let mut ancestors = Vec::new();
                let mut cursor = frames[index].parent;
                while let Some(parent) = cursor {
                    let frame: &Frame = &frames[parent];
                    if !frame.tag.is_empty() {
                        ancestors.push(frame_to_element(frame));
                    }
                    cursor = frame.parent;
                }
                ancestors.reverse();
                frame_to_element(&frames[index]).with_ancestors(ancestors)
            })
            .collect()
    }

    fn visit(
        &self,
        node: &Document,
        tag: &str,
        parent: Option<usize>,
        ordinal: usize,
        frames: &mut Vec<Frame>,
        kept: &mut Vec<usize>,
    ) {
        match node {
            Document::Mapping(entries) => {
                let index = frames.len();
                frames.push(Frame {
                    tag: tag.to_string(),
                    attributes: Attributes::new(),
                    text: None,
                    ordinal,
                    parent,
                });
                if self.keep.contains(tag) {
                    kept.push(index);
                }

                for (key, value) in entries {
                    if self.skip.contains(key) {
                        continue;
                    }
                    match key.as_str() {
                        ATTRIBUTES_KEY => merge_attributes(&mut frames[index].attributes, value),
                        TEXT_KEY => {
                            if let Document::Scalar(text) = value {
                                frames[index].text = Some(text.to_string());
                            }
                        }
                        _ => self.visit(value, key, Some(index), 0, frames, kept),
                    }
                }
            }
            Document::Sequence(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.visit(item, tag, parent, ordinal + i, frames, kept);
                }
            }
            Document::Scalar(_) => {}
        }
    }
}

fn merge_attributes(attributes: &mut Attributes, value: &Document) {
    if let Document::Mapping(entries) = value {
        for (key, value) in entries {
            if let Document::Scalar(scalar) = value {
                attributes.insert(key.clone(), scalar.clone());
            }
        }
    }
}

fn frame_to_element(frame: &Frame) -> Element {
    Element {
        tag: frame.tag.clone(),
        attributes: frame.attributes.clone(),
        text: frame.text.clone(),
        ordinal: frame.ordinal,
        ancestors: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> Document {
        Document::from_xml(
            r#"<MTConnectDevices>
                <Devices>
                    <Agent id="agent" name="Agent" uuid="A1">
                        <DataItems><DataItem id="agent_avail" type="AVAILABILITY"/></DataItems>
                    </Agent>
                    <Device id="d1" name="M1" uuid="U1">
                        <DataItems>
                            <DataItem id="d1-avail" type="AVAILABILITY"/>
                        </DataItems>
                        <Components>
                            <Axes id="a1">
                                <Components>
                                    <Linear id="x" name="X">
                                        <DataItems>
                                            <DataItem id="xpos" type="POSITION" subType="ACTUAL"/>
                                        </DataItems>
                                    </Linear>
                                </Components>
                            </Axes>
                        </Components>
                    </Device>
                </Devices>
            </MTConnectDevices>"#,
        )
        .unwrap()
    }

    #[test]
    fn test_walk_keeps_devices_and_dataitems_in_order() {
        let elements = Walker::default().walk(&probe());
        let ids: Vec<String> = elements.iter().filter_map(|e| e.attr("id")).collect();
        assert_eq!(ids, vec!["d1", "d1-avail", "xpos"]);
    }

    #[test]
    fn test_walk_skips_agent_subtree() {
        let elements = Walker::default().walk(&probe());
        assert!(elements.iter().all(|e| e.attr("id").as_deref() != Some("agent_avail")));
    }

    #[test]
    fn test_ancestor_chain() {
        let elements = Walker::default().walk(&probe());
        let xpos = elements
            .iter()
            .find(|e| e.attr("id").as_deref() == Some("xpos"))
            .unwrap();
        let tags: Vec<&str> = xpos.ancestors.iter().map(|a| a.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec![
                "MTConnectDevices",
                "Devices",
                "Device",
                "Components",
                "Axes",
                "Components",
                "Linear",
                "DataItems"
            ]
        );
        assert_eq!(xpos.ancestors[2].attr("name").as_deref(), Some("M1"));
    }

    #[test]
    fn test_attributes_after_children_reach_ancestors() {
        let doc = Document::from_json_str(
            r#"{"Device": {
                "DataItems": {"DataItem": {"_attributes": {"id": "a", "type": "X"}}},
                "_attributes": {"id": "d9", "name": "Late", "uuid": "L9"}
            }}"#,
        )
        .unwrap();
        let elements = Walker::default().walk(&doc);
        let item = elements.iter().find(|e| e.tag == "DataItem").unwrap();
        assert_eq!(item.ancestors[0].attr("name").as_deref(), Some("Late"));
    }

    #[test]
    fn test_bare_kept_element_is_retained() {
        let doc = Document::from_xml("<Devices><Device/></Devices>").unwrap();
        let elements = Walker::default().walk(&doc);
        assert_eq!(elements.len(), 1);
        assert!(elements[0].attributes.is_empty());
        assert_eq!(elements[0].text, None);
    }

    #[test]
    fn test_sequence_ordinals() {
        let doc = Document::from_xml(
            r#"<Device name="m" uuid="u"><Path id="p1"/><Path id="p2"/></Device>"#,
        )
        .unwrap();
        let walker = Walker::new(["Path"], Vec::<String>::new());
        let ordinals: Vec<usize> = walker.walk(&doc).iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1]);
    }

    #[test]
    fn test_text_is_merged() {
        let doc = Document::from_xml(r#"<Device id="d"><Description>Lathe</Description></Device>"#)
            .unwrap();
        let walker = Walker::new(["Description"], Vec::<String>::new());
        let elements = walker.walk(&doc);
        assert_eq!(elements[0].text.as_deref(), Some("Lathe"));
    }

    #[test]
    fn test_attribute_overwrite_keeps_position() {
        let mut attributes: Attributes = [("b", "1"), ("a", "2")].into_iter().collect();
        attributes.insert("b", "3");
        let keys: Vec<&str> = attributes.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(attributes.text("b").as_deref(), Some("3"));
    }
}
