//! Browser automation seam
//!
//! The harness drives dashboards through these traits. A backend opens pages
//! on deep links and answers element queries; canonical HTML is produced by
//! [`hasstest_dom`] from the snapshot the backend captures.

use async_trait::async_trait;
use hasstest_dom::DiffOptions;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod playwright;

pub use playwright::{BrowserKind, PlaywrightBrowser, PlaywrightConfig, PlaywrightPage};

/// Preferred color scheme emulated for a page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorScheme {
    Light,
    Dark,
    #[default]
    NoPreference,
}

/// How a dashboard page is opened
#[derive(Debug, Clone, Default)]
pub struct DashboardOptions {
    /// Dashboard title; defaults to "Dashboard N"
    pub title: Option<String>,
    pub color_scheme: Option<ColorScheme>,
}

impl DashboardOptions {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_color_scheme(mut self, scheme: ColorScheme) -> Self {
        self.color_scheme = Some(scheme);
        self
    }
}

#[async_trait]
pub trait BrowserIntegration: Send + Sync + 'static {
    type Page: BrowserPage;

    /// Open `url` in a fresh headless page
    async fn open(&self, url: &str, options: &DashboardOptions) -> Result<Self::Page>;

    /// Open `url` in a visible window and return once the window is closed
    async fn open_in_headed(&self, url: &str) -> Result<()>;

    /// Shut the browser down; later calls are no-ops
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrowserPage: Send + Sync + 'static {
    type Element: Clone + Send + Sync + 'static;

    /// The `n`th card (zero based) of the dashboard's view
    async fn nth_card(&self, n: usize) -> Result<Self::Element>;

    /// Canonical HTML of the element's subtree, shadow roots included
    async fn shadow_html(&self, element: &Self::Element, options: &DiffOptions) -> Result<String>;

    async fn text_content(&self, element: &Self::Element) -> Result<String>;

    /// PNG screenshot of the element
    async fn screenshot(&self, element: &Self::Element) -> Result<Vec<u8>>;

    /// First descendant of `element` matching `selector`, piercing shadow roots
    async fn find(&self, element: &Self::Element, selector: &str) -> Result<Option<Self::Element>>;

    /// Drop the backend's reference to `element`
    async fn release(&self, _element: Self::Element) -> Result<()> {
        Ok(())
    }
}

/// Placeholder backend for instances created without a browser.
///
/// It has no values, so no page can ever be opened through it.
#[derive(Debug, Clone, Copy)]
pub enum NoBrowser {}

#[async_trait]
impl BrowserIntegration for NoBrowser {
    type Page = NoBrowser;

    async fn open(&self, _url: &str, _options: &DashboardOptions) -> Result<Self::Page> {
        match *self {}
    }

    async fn open_in_headed(&self, _url: &str) -> Result<()> {
        match *self {}
    }

    async fn close(&self) -> Result<()> {
        match *self {}
    }
}

#[async_trait]
impl BrowserPage for NoBrowser {
    type Element = NoBrowser;

    async fn nth_card(&self, _n: usize) -> Result<Self::Element> {
        match *self {}
    }

    async fn shadow_html(&self, _element: &Self::Element, _options: &DiffOptions) -> Result<String> {
        match *self {}
    }

    async fn text_content(&self, _element: &Self::Element) -> Result<String> {
        match *self {}
    }

    async fn screenshot(&self, _element: &Self::Element) -> Result<Vec<u8>> {
        match *self {}
    }

    async fn find(&self, _element: &Self::Element, _selector: &str) -> Result<Option<Self::Element>> {
        match *self {}
    }
}

pub(crate) fn no_browser() -> Error {
    Error::Precondition("no browser integration was supplied".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_scheme_wire_names() {
        assert_eq!(serde_json::to_value(ColorScheme::NoPreference).unwrap(), "no-preference");
        assert_eq!(serde_json::to_value(ColorScheme::Dark).unwrap(), "dark");
    }

    #[test]
    fn test_dashboard_options_builder() {
        let options = DashboardOptions::titled("Thermostat").with_color_scheme(ColorScheme::Light);
        assert_eq!(options.title.as_deref(), Some("Thermostat"));
        assert_eq!(options.color_scheme, Some(ColorScheme::Light));
    }
}
