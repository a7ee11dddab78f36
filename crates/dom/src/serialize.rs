//! Depth-first serializer producing canonical DOM text

use std::borrow::Cow;

use crate::error::Result;
use crate::node::{Element, Node};
use crate::options::{DiffOptions, Rules};

const ELLIPSIS: char = '…';

/// Serialize `root` into diffable text.
///
/// Output is a pure function of the snapshot and the options: attribute
/// declaration order and `class` token order never affect it.
pub fn diffable_html(root: &Node, options: &DiffOptions) -> Result<String> {
    let rules = options.compile()?;
    let mut walker = Walker {
        rules: &rules,
        out: String::new(),
    };
    walker.walk(root, 0);
    Ok(walker.out)
}

struct Walker<'r, 'o> {
    rules: &'r Rules<'o>,
    out: String,
}

impl Walker<'_, '_> {
    fn walk(&mut self, node: &Node, depth: usize) {
        match node {
            Node::Text { text } => self.print_text(text, depth),
            Node::Element(el) => self.walk_element(el, depth),
        }
    }

    fn walk_element(&mut self, el: &Element, depth: usize) {
        let tag = el.effective_tag();
        if self.rules.ignore_tags.contains(tag) {
            return;
        }

        let children = self.children(el, tag);
        self.print_open(el, tag, !children.is_empty(), depth);
        for child in &children {
            self.walk(child, depth + 1);
        }
        self.print_close(tag, !children.is_empty(), depth);
    }

    /// Shadow-root children first, then light-DOM children
    fn children<'n>(&self, el: &'n Element, tag: &str) -> Vec<&'n Node> {
        if Rules::is_void(tag) || self.rules.ignore_children.contains(tag) {
            return Vec::new();
        }
        el.shadow_root
            .iter()
            .flatten()
            .chain(el.children.iter())
            .collect()
    }

    fn print_text(&mut self, text: &str, depth: usize) {
        let value = text.trim();
        if !value.is_empty() {
            self.indent(depth);
            self.out.push_str(value);
            self.out.push('\n');
        }
    }

    fn print_open(&mut self, el: &Element, tag: &str, has_children: bool, depth: usize) {
        self.indent(depth);
        self.out.push('<');
        self.out.push_str(tag);
        for (name, value) in self.attributes(el, tag) {
            self.out.push(' ');
            self.out.push_str(name);
            self.out.push_str("=\"");
            if name == "class" {
                self.out.push_str(&escape(&sorted_class_list(&value)));
            } else {
                self.out.push_str(&escape(&value));
            }
            self.out.push('"');
        }
        self.out.push('>');

        if has_children || Rules::is_void(tag) {
            self.out.push('\n');
        }
        if self.rules.ignore_children.contains(tag) {
            self.out.push(ELLIPSIS);
        }
    }

    fn print_close(&mut self, tag: &str, has_children: bool, depth: usize) {
        if Rules::is_void(tag) {
            return;
        }
        if has_children {
            self.indent(depth);
        }
        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push_str(">\n");
    }

    /// Real attributes merged with reflected properties, filtered and sorted
    fn attributes<'e>(&self, el: &'e Element, tag: &str) -> Vec<(&'e str, Cow<'e, str>)> {
        let resolved = el.reflected.as_ref().map(|r| r.resolve()).unwrap_or_default();

        let real = el
            .attributes
            .iter()
            .filter(|a| !resolved.superseded.contains(a.name.as_str()))
            .map(|a| (a.name.as_str(), Cow::Borrowed(a.value.as_str())));

        let synthetic = resolved
            .synthetic
            .iter()
            .filter(|(_, value)| !(self.rules.strip_undefined && value.is_none()))
            .map(|(name, value)| (*name, Cow::Borrowed(value.unwrap_or("undefined"))));

        let mut attributes: Vec<_> = real
            .chain(synthetic)
            .filter(|(name, value)| !self.rules.is_ignored_attribute(tag, name, value))
            .collect();
        attributes.sort_by(|a, b| a.0.cmp(b.0));
        attributes
    }

    fn indent(&mut self, depth: usize) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
    }
}

/// Sorted, de-duplicated class tokens
fn sorted_class_list(value: &str) -> String {
    let mut tokens: Vec<&str> = value.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens.join(" ")
}

fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '"']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}
