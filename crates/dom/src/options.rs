//! Canonicalisation options

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{DomError, Result};

/// Tags never printed, together with their subtrees
pub const DEFAULT_IGNORE_TAGS: &[&str] = &["script", "style"];

/// Tags printed without their children
pub const DEFAULT_IGNORE_CHILDREN: &[&str] = &["ha-icon", "ha-slider", "paper-input"];

/// Attributes dropped when their value is blank
pub const DEFAULT_EMPTY_ATTRS: &[&str] = &["class", "id"];

/// Elements that never have a closing tag or children
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "keygen", "link", "menuitem",
    "meta", "param", "source", "track", "wbr",
];

/// An attribute to leave out of the output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IgnoreAttribute {
    /// Ignored on every tag
    Global(String),
    /// Ignored only on the listed tags
    Scoped {
        tags: Vec<String>,
        attributes: Vec<String>,
    },
}

/// Options controlling which parts of a subtree are printed.
///
/// `ignore_tags` and `ignore_children` extend the built-in defaults;
/// `strip_empty_attributes` replaces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiffOptions {
    pub ignore_attributes: Vec<IgnoreAttribute>,
    pub ignore_tags: Vec<String>,
    pub ignore_children: Vec<String>,
    pub strip_empty_attributes: Vec<String>,
    /// Drop reflected properties whose current value is undefined
    pub strip_undefined_attributes: bool,
    /// Also elide `svg` subtrees
    pub ignore_svg: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            ignore_attributes: Vec::new(),
            ignore_tags: Vec::new(),
            ignore_children: Vec::new(),
            strip_empty_attributes: DEFAULT_EMPTY_ATTRS.iter().map(|s| s.to_string()).collect(),
            strip_undefined_attributes: true,
            ignore_svg: false,
        }
    }
}

impl DiffOptions {
    pub fn ignore_attribute(mut self, name: impl Into<String>) -> Self {
        self.ignore_attributes
            .push(IgnoreAttribute::Global(name.into()));
        self
    }

    pub fn ignore_attribute_on<T, A>(mut self, tags: T, attributes: A) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        self.ignore_attributes.push(IgnoreAttribute::Scoped {
            tags: tags.into_iter().map(Into::into).collect(),
            attributes: attributes.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn ignore_tag(mut self, tag: impl Into<String>) -> Self {
        self.ignore_tags.push(tag.into());
        self
    }

    pub fn ignore_children_of(mut self, tag: impl Into<String>) -> Self {
        self.ignore_children.push(tag.into());
        self
    }

    pub fn strip_empty<I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.strip_empty_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Print undefined reflected properties as `"undefined"`
    pub fn keep_undefined(mut self) -> Self {
        self.strip_undefined_attributes = false;
        self
    }

    pub fn with_svg_ignored(mut self) -> Self {
        self.ignore_svg = true;
        self
    }

    pub(crate) fn compile(&self) -> Result<Rules<'_>> {
        let mut rules = Rules {
            ignore_attributes: HashSet::new(),
            scoped: Vec::new(),
            ignore_tags: DEFAULT_IGNORE_TAGS.iter().copied().collect(),
            ignore_children: DEFAULT_IGNORE_CHILDREN.iter().copied().collect(),
            strip_empty: self.strip_empty_attributes.iter().map(String::as_str).collect(),
            strip_undefined: self.strip_undefined_attributes,
        };

        for entry in &self.ignore_attributes {
            match entry {
                IgnoreAttribute::Global(name) => {
                    rules.ignore_attributes.insert(name.as_str());
                }
                IgnoreAttribute::Scoped { tags, attributes } => {
                    if tags.is_empty() || attributes.is_empty() {
                        return Err(DomError::InvalidOption(
                            "scoped ignoreAttributes entries need both tags and attributes"
                                .to_string(),
                        ));
                    }
                    rules.scoped.push((
                        tags.iter().map(String::as_str).collect(),
                        attributes.iter().map(String::as_str).collect(),
                    ));
                }
            }
        }

        rules.ignore_tags.extend(self.ignore_tags.iter().map(String::as_str));
        if self.ignore_svg {
            rules.ignore_tags.insert("svg");
        }
        rules
            .ignore_children
            .extend(self.ignore_children.iter().map(String::as_str));

        Ok(rules)
    }
}

/// Options flattened into lookup sets for one serialisation pass
pub(crate) struct Rules<'a> {
    pub ignore_attributes: HashSet<&'a str>,
    pub scoped: Vec<(HashSet<&'a str>, HashSet<&'a str>)>,
    pub ignore_tags: HashSet<&'a str>,
    pub ignore_children: HashSet<&'a str>,
    pub strip_empty: HashSet<&'a str>,
    pub strip_undefined: bool,
}

impl Rules<'_> {
    pub fn is_void(tag: &str) -> bool {
        VOID_ELEMENTS.contains(&tag)
    }

    pub fn is_ignored_attribute(&self, tag: &str, name: &str, value: &str) -> bool {
        if self.ignore_attributes.contains(name) {
            return true;
        }
        if self.strip_empty.contains(name) && value.trim().is_empty() {
            return true;
        }
        self.scoped
            .iter()
            .any(|(tags, attributes)| tags.contains(tag) && attributes.contains(name))
    }
}
