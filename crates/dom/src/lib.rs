//! HassTest semantic DOM diff
//!
//! Turns a snapshot of a rendered DOM subtree, open shadow roots included,
//! into deterministic text suitable for snapshot comparison:
//! - one tag or text node per line, indented two spaces per level
//! - attributes sorted by name, `class` tokens sorted
//! - reflected component properties printed with their live values
//! - configurable tags, subtrees and attributes removed
//!
//! # Example
//!
//! ```
//! use hasstest_dom::{diffable_html, DiffOptions, Element, Node};
//!
//! let card: Node = Element::new("ha-card")
//!     .attr("class", "type-entities ha-card")
//!     .child(Element::new("div").text("30"))
//!     .into();
//!
//! let html = diffable_html(&card, &DiffOptions::default()).unwrap();
//! assert_eq!(
//!     html,
//!     "<ha-card class=\"ha-card type-entities\">\n  <div>\n    30\n  </div>\n</ha-card>\n"
//! );
//! ```

pub mod error;
pub mod node;
pub mod options;
pub mod serialize;

pub use error::{DomError, Result};
pub use node::{
    Attribute, AttributeBinding, DeclaredProperty, Element, Node, ObservedProperty, Reflected,
};
pub use options::{DiffOptions, IgnoreAttribute};
pub use serialize::diffable_html;
