//! Canonical paths for walked elements
//!
//! Every kept element gets a deterministic, human readable path built from
//! per-tag steps, eg `Device(m1, u1)/axes/x/position-actual`. The path is the
//! identity of a node in the store, so the rules here must not depend on
//! attribute declaration order or on anything outside the element's own
//! attributes and ancestor chain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::node::{NodeId, NodeKind};
use crate::walker::{Element, Walker};

/// Separator between path steps
pub const SEPARATOR: &str = "/";

/// How steps of plain (singleton) containers appear in paths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlainSteps {
    /// Lower-cased tag; same-tag siblings share one path
    #[default]
    Keep,
    /// Omitted from paths entirely
    Drop,
    /// Lower-cased tag plus the 1-based ordinal from the second sibling on
    Indexed,
}

fn tags(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn default_keep_tags() -> BTreeSet<String> {
    tags(&["Device", "DataItem"])
}

fn default_skip_tags() -> BTreeSet<String> {
    tags(&["Agent"])
}

fn default_ignore_tags() -> BTreeSet<String> {
    tags(&[
        "Adapters",
        "AssetCounts",
        "Components",
        "DataItems",
        "Devices",
        "Filters",
        "Specifications",
    ])
}

fn default_plain_tags() -> BTreeSet<String> {
    tags(&[
        "Axes",
        "Controller",
        "EndEffector",
        "Feeder",
        "PartOccurrence",
        "Path",
        "Personnel",
        "ProcessOccurrence",
        "Resources",
        "Systems",
    ])
}

fn default_device_tags() -> BTreeSet<String> {
    tags(&["Device"])
}

fn default_dataitem_tags() -> BTreeSet<String> {
    tags(&["DataItem"])
}

fn default_ignore_attributes() -> BTreeSet<String> {
    tags(&[
        "id",
        "name",
        "type",
        "subType",
        "compositionId",
        "category",
        "discrete",
        "units",
        "nativeUnits",
    ])
}

/// Tag sets and policies driving the walker and the canonicalizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathRules {
    /// Tags whose elements are returned by the walker
    #[serde(default = "default_keep_tags")]
    pub keep_tags: BTreeSet<String>,

    /// Tags whose subtrees are never traversed
    #[serde(default = "default_skip_tags")]
    pub skip_tags: BTreeSet<String>,

    /// Structural wrappers that contribute no step
    #[serde(default = "default_ignore_tags")]
    pub ignore_tags: BTreeSet<String>,

    /// Containers expected at most once per parent
    #[serde(default = "default_plain_tags")]
    pub plain_tags: BTreeSet<String>,

    #[serde(default = "default_device_tags")]
    pub device_tags: BTreeSet<String>,

    #[serde(default = "default_dataitem_tags")]
    pub dataitem_tags: BTreeSet<String>,

    /// DataItem attributes left out of the parameter list
    #[serde(default = "default_ignore_attributes")]
    pub ignore_attributes: BTreeSet<String>,

    #[serde(default)]
    pub plain: PlainSteps,
}

impl Default for PathRules {
    fn default() -> Self {
        Self {
            keep_tags: default_keep_tags(),
            skip_tags: default_skip_tags(),
            ignore_tags: default_ignore_tags(),
            plain_tags: default_plain_tags(),
            device_tags: default_device_tags(),
            dataitem_tags: default_dataitem_tags(),
            ignore_attributes: default_ignore_attributes(),
            plain: PlainSteps::default(),
        }
    }
}

/// A walked element with its canonical path and resolved ids
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalElement {
    /// The element itself; its ancestor chain has been released
    pub element: Element,
    pub kind: NodeKind,
    pub path: String,
    /// Canonical path of the owning device, if any
    pub device: Option<String>,
    pub device_id: Option<NodeId>,
    pub dataitem_id: Option<NodeId>,
}

impl CanonicalElement {
    /// Key used to address the element from samples: its `id`, else its path
    pub fn element_id(&self) -> String {
        self.element.attr("id").unwrap_or_else(|| self.path.clone())
    }
}

impl PathRules {
    /// Walker configured with this rule set's keep and skip tags
    pub fn walker(&self) -> Walker {
        Walker::new(self.keep_tags.iter().cloned(), self.skip_tags.iter().cloned())
    }

    pub fn is_device(&self, tag: &str) -> bool {
        self.device_tags.contains(tag)
    }

    pub fn is_dataitem(&self, tag: &str) -> bool {
        self.dataitem_tags.contains(tag)
    }

    pub fn kind(&self, tag: &str) -> NodeKind {
        if self.is_device(tag) {
            NodeKind::Device
        } else if self.is_dataitem(tag) {
            NodeKind::DataItem
        } else {
            NodeKind::Other(tag.to_string())
        }
    }

    /// Path step contributed by a single element; empty when it contributes none
    pub fn step(&self, element: &Element) -> String {
        let tag = element.tag.as_str();

        if self.ignore_tags.contains(tag) || self.skip_tags.contains(tag) {
            return String::new();
        }

        if self.plain_tags.contains(tag) {
            let step = tag.to_lowercase();
            return match self.plain {
                PlainSteps::Keep => step,
                PlainSteps::Drop => String::new(),
                PlainSteps::Indexed if element.ordinal == 0 => step,
                PlainSteps::Indexed => format!("{}{}", step, element.ordinal + 1),
            };
        }

        if self.is_device(tag) {
            return match (element.attr("name"), element.attr("uuid")) {
                (Some(name), Some(uuid)) => {
                    format!("Device({}, {})", name.to_lowercase(), uuid.to_lowercase())
                }
                _ => String::new(),
            };
        }

        if self.is_dataitem(tag) {
            return self.dataitem_step(element);
        }

        element
            .attr("name")
            .or_else(|| element.attr("id"))
            .map(|s| s.to_lowercase())
            .unwrap_or_default()
    }

    /// `type[-subType]` followed by the remaining attributes as sorted `key=value`
    fn dataitem_step(&self, element: &Element) -> String {
        let Some(kind) = element.attr("type") else {
            return String::new();
        };

        let mut params = vec![kind];
        if let Some(sub_type) = element.attr("subType") {
            params.push(sub_type);
        }

        let mut named: Vec<(&str, String)> = element
            .attributes
            .iter()
            .filter(|(key, _)| !self.ignore_attributes.contains(*key))
            .map(|(key, value)| (key, value.to_string().trim().to_string()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        params.extend(named.into_iter().map(|(key, value)| format!("{}={}", key, value)));

        params
            .iter()
            .map(|p| p.to_lowercase())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Index of the nearest device among the element's ancestors
    fn nearest_device(&self, element: &Element) -> Option<usize> {
        element.ancestors.iter().rposition(|a| self.is_device(&a.tag))
    }

    /// Canonical path of the element's owning device
    pub fn device_path(&self, element: &Element) -> Option<String> {
        let step = if self.is_device(&element.tag) {
            self.step(element)
        } else {
            let index = self.nearest_device(element)?;
            self.step(&element.ancestors[index])
        };
        Some(step).filter(|s| !s.is_empty())
    }

    /// Join the non-empty steps from the nearest device (or the root) down to the element
    pub fn full_path(&self, element: &Element) -> String {
        if self.is_device(&element.tag) {
            return self.step(element);
        }

        let start = self.nearest_device(element).unwrap_or(0);
        element.ancestors[start..]
            .iter()
            .chain(std::iter::once(element))
            .map(|e| self.step(e))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(SEPARATOR)
    }

    /// Compute path and device association, releasing the ancestor chain
    pub fn canonicalize(&self, mut element: Element) -> CanonicalElement {
        let path = self.full_path(&element);
        let device = self.device_path(&element);
        element.ancestors = Vec::new();
        CanonicalElement {
            kind: self.kind(&element.tag),
            element,
            path,
            device,
            device_id: None,
            dataitem_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::walker::Attributes;
    use proptest::prelude::*;

    fn device(name: &str, uuid: &str) -> Element {
        Element::new("Device").with_attributes([("name", name), ("uuid", uuid)].into_iter().collect())
    }

    fn dataitem(attrs: &[(&str, &str)], ancestors: Vec<Element>) -> Element {
        Element::new("DataItem")
            .with_attributes(attrs.iter().copied().collect())
            .with_ancestors(ancestors)
    }

    #[test]
    fn test_device_and_dataitem_scenario() {
        let doc = Document::from_xml(
            r#"<MTConnectDevices><Devices>
                <Device id="d1" name="M1" uuid="U1">
                    <DataItems>
                        <DataItem id="pos" type="POSITION" subType="ACTUAL"/>
                    </DataItems>
                </Device>
            </Devices></MTConnectDevices>"#,
        )
        .unwrap();
        let rules = PathRules::default();
        let elements: Vec<CanonicalElement> = rules
            .walker()
            .walk(&doc)
            .into_iter()
            .map(|e| rules.canonicalize(e))
            .collect();

        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].kind, NodeKind::Device);
        assert_eq!(elements[0].path, "Device(m1, u1)");
        assert_eq!(elements[1].kind, NodeKind::DataItem);
        assert_eq!(elements[1].path, "Device(m1, u1)/position-actual");
        assert_eq!(elements[1].device.as_deref(), Some("Device(m1, u1)"));
        assert!(elements[1].element.ancestors.is_empty());
        assert_eq!(elements[1].element_id(), "pos");
    }

    #[test]
    fn test_dataitem_params_sorted_and_lowercased() {
        let item = dataitem(
            &[
                ("type", "TEMPERATURE"),
                ("statistic", "AVERAGE"),
                ("id", "t1"),
                ("coordinateSystem", "MACHINE"),
                ("units", "CELSIUS"),
            ],
            vec![],
        );
        assert_eq!(
            PathRules::default().step(&item),
            "temperature-coordinatesystem=machine-statistic=average"
        );
    }

    #[test]
    fn test_dataitem_without_type_has_empty_step() {
        let item = dataitem(&[("id", "x")], vec![]);
        assert_eq!(PathRules::default().step(&item), "");
    }

    #[test]
    fn test_attribute_whitespace_is_ignored() {
        let rules = PathRules::default();
        let padded = dataitem(
            &[("type", " POSITION "), ("subType", "ACTUAL\n"), ("statistic", "  AVERAGE")],
            vec![device(" M1", "U1 ")],
        );
        let clean = dataitem(
            &[("type", "POSITION"), ("subType", "ACTUAL"), ("statistic", "AVERAGE")],
            vec![device("M1", "U1")],
        );
        assert_eq!(rules.full_path(&padded), rules.full_path(&clean));
        assert_eq!(rules.full_path(&clean), "Device(m1, u1)/position-actual-statistic=average");

        let blank = Element::new("Device").with_attributes([("name", "M1"), ("uuid", "  ")].into_iter().collect());
        assert_eq!(rules.step(&blank), "");
    }

    #[test]
    fn test_device_requires_name_and_uuid() {
        let rules = PathRules::default();
        let bare = Element::new("Device").with_attributes([("name", "M1")].into_iter().collect());
        assert_eq!(rules.step(&bare), "");
        assert_eq!(rules.device_path(&bare), None);
    }

    #[test]
    fn test_intermediate_steps() {
        let ancestors = vec![
            Element::new("MTConnectDevices"),
            Element::new("Devices"),
            device("M1", "U1"),
            Element::new("Components"),
            Element::new("Axes"),
            Element::new("Components"),
            Element::new("Linear").with_attributes([("id", "x1"), ("name", "X")].into_iter().collect()),
            Element::new("DataItems"),
        ];
        let item = dataitem(&[("type", "POSITION"), ("subType", "ACTUAL")], ancestors);
        assert_eq!(
            PathRules::default().full_path(&item),
            "Device(m1, u1)/axes/x/position-actual"
        );
    }

    #[test]
    fn test_default_step_falls_back_to_id() {
        let rules = PathRules::default();
        let named = Element::new("Rotary").with_attributes([("id", "C1"), ("name", "Spindle")].into_iter().collect());
        let unnamed = Element::new("Rotary").with_attributes([("id", "C1")].into_iter().collect());
        assert_eq!(rules.step(&named), "spindle");
        assert_eq!(rules.step(&unnamed), "c1");
        assert_eq!(rules.step(&Element::new("Rotary")), "");
    }

    #[test]
    fn test_plain_step_policies() {
        let mut second_path = Element::new("Path");
        second_path.ordinal = 1;
        let first_path = Element::new("Path");

        let mut rules = PathRules::default();
        assert_eq!(rules.step(&first_path), "path");
        assert_eq!(rules.step(&second_path), "path");

        rules.plain = PlainSteps::Indexed;
        assert_eq!(rules.step(&first_path), "path");
        assert_eq!(rules.step(&second_path), "path2");

        rules.plain = PlainSteps::Drop;
        assert_eq!(rules.step(&second_path), "");
    }

    #[test]
    fn test_plain_siblings_collapse_by_default() {
        let doc = Document::from_xml(
            r#"<Device name="M" uuid="U">
                <Path><DataItem type="EXECUTION"/></Path>
                <Path><DataItem type="EXECUTION"/></Path>
            </Device>"#,
        )
        .unwrap();
        let rules = PathRules::default();
        let paths: Vec<String> = rules.walker().walk(&doc).iter().map(|e| rules.full_path(e)).collect();
        assert_eq!(paths[1], paths[2]);
        assert_eq!(paths[1], "Device(m, u)/path/execution");

        let indexed = PathRules {
            plain: PlainSteps::Indexed,
            ..PathRules::default()
        };
        let paths: Vec<String> = indexed.walker().walk(&doc).iter().map(|e| indexed.full_path(e)).collect();
        assert_eq!(paths[1], "Device(m, u)/path/execution");
        assert_eq!(paths[2], "Device(m, u)/path2/execution");
    }

    #[test]
    fn test_element_without_device_uses_root() {
        let item = dataitem(
            &[("type", "AVAILABILITY")],
            vec![Element::new("Adapters"), Element::new("Adapter").with_attributes([("id", "A1")].into_iter().collect())],
        );
        let rules = PathRules::default();
        assert_eq!(rules.full_path(&item), "a1/availability");
        assert_eq!(rules.device_path(&item), None);
    }

    #[test]
    fn test_rules_from_toml() {
        let rules: PathRules = toml::from_str("plain = \"indexed\"\nskip_tags = []").unwrap();
        assert_eq!(rules.plain, PlainSteps::Indexed);
        assert!(rules.skip_tags.is_empty());
        assert!(rules.ignore_tags.contains("Components"));
    }

    fn attribute_sets() -> impl Strategy<Value = (Vec<(String, String)>, Vec<(String, String)>)> {
        prop::collection::btree_map("[a-zA-Z]{1,8}", "[A-Za-z0-9_]{1,6}", 0..8).prop_flat_map(|mut map| {
            map.remove("type");
            let mut attrs: Vec<(String, String)> = map.into_iter().collect();
            attrs.push(("type".to_string(), "POSITION".to_string()));
            (Just(attrs.clone()), Just(attrs).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn test_path_independent_of_attribute_order((ordered, shuffled) in attribute_sets()) {
            let rules = PathRules::default();
            let ancestors = vec![device("M1", "U1")];
            let a = Element::new("DataItem")
                .with_attributes(ordered.into_iter().collect::<Attributes>())
                .with_ancestors(ancestors.clone());
            let b = Element::new("DataItem")
                .with_attributes(shuffled.into_iter().collect::<Attributes>())
                .with_ancestors(ancestors);
            prop_assert_eq!(rules.full_path(&a), rules.full_path(&b));
        }
    }
}
