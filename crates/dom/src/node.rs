//! DOM snapshot model
//!
//! Browser backends capture a live subtree into these types (usually as
//! JSON) and the serializer canonicalises them. Only element and text nodes
//! are represented; comments and processing instructions are dropped at
//! capture time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::Result;

/// A captured DOM node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Element(Element),
    Text { text: String },
}

impl Node {
    /// Create a text node
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text { text: text.into() }
    }

    /// Parse a snapshot produced by a browser backend
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a snapshot from an already decoded JSON value
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl From<Element> for Node {
    fn from(element: Element) -> Self {
        Node::Element(element)
    }
}

/// A captured element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    /// Local name of the element as rendered
    pub tag: String,

    /// Real attributes in declaration order
    #[serde(default)]
    pub attributes: Vec<Attribute>,

    /// Component-framework property metadata, if the element exposes any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflected: Option<Reflected>,

    /// Children of the open shadow root, if the element hosts one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_root: Option<Vec<Node>>,

    /// Light-DOM children
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// Reflected-property metadata of a custom element.
///
/// Two framework shapes exist. The capture side probes each element once and
/// records whichever shape it found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum Reflected {
    /// Property name mapped to a descriptor (`el.properties`)
    Observed {
        properties: BTreeMap<String, ObservedProperty>,
    },
    /// Collection of property definitions (`el.constructor.elementProperties`)
    Declared { properties: Vec<DeclaredProperty> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedProperty {
    #[serde(default)]
    pub read_only: bool,
    /// Stringified current value; `None` when the property is undefined
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredProperty {
    pub name: String,
    #[serde(default)]
    pub attribute: AttributeBinding,
    /// Stringified current value; `None` when the property is undefined
    #[serde(default)]
    pub value: Option<String>,
}

/// How a declared property maps onto an attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeBinding {
    /// `true` reflects under the property name, `false` disables reflection
    Reflect(bool),
    /// Reflects under an explicit attribute name
    Named(String),
}

impl Default for AttributeBinding {
    fn default() -> Self {
        AttributeBinding::Reflect(true)
    }
}

/// Reflected properties flattened for one element
#[derive(Debug, Default)]
pub(crate) struct ResolvedProperties<'a> {
    /// Real attribute names superseded by a property
    pub superseded: HashSet<&'a str>,
    /// Synthetic attributes: printed name and current value
    pub synthetic: Vec<(&'a str, Option<&'a str>)>,
}

impl Reflected {
    pub(crate) fn resolve(&self) -> ResolvedProperties<'_> {
        let mut resolved = ResolvedProperties::default();
        match self {
            Reflected::Observed { properties } => {
                for (name, property) in properties.iter().filter(|(_, p)| !p.read_only) {
                    resolved.superseded.insert(name.as_str());
                    resolved.synthetic.push((name.as_str(), property.value.as_deref()));
                }
            }
            Reflected::Declared { properties } => {
                for property in properties {
                    let key = match &property.attribute {
                        AttributeBinding::Named(attribute) => attribute.as_str(),
                        AttributeBinding::Reflect(_) => property.name.as_str(),
                    };
                    resolved.superseded.insert(key);
                    if property.attribute != AttributeBinding::Reflect(false) {
                        resolved.synthetic.push((key, property.value.as_deref()));
                    }
                }
            }
        }
        resolved
    }
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn child(mut self, node: impl Into<Node>) -> Self {
        self.children.push(node.into());
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.child(Node::text(text))
    }

    /// Attach an open shadow root with the given children
    pub fn shadow(mut self, nodes: Vec<Node>) -> Self {
        self.shadow_root = Some(nodes);
        self
    }

    pub fn reflected(mut self, reflected: Reflected) -> Self {
        self.reflected = Some(reflected);
        self
    }

    /// Value of a real attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Tag name used for output and tag-based rules.
    ///
    /// A `data-tag-name` attribute overrides the rendered tag so scoped or
    /// lazily upgraded elements print under their canonical name.
    pub fn effective_tag(&self) -> &str {
        match self.attribute("data-tag-name") {
            Some(name) if !name.is_empty() => name,
            _ => &self.tag,
        }
    }
}
