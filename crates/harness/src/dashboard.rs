//! Dashboards opened in a browser and the cards they show

use hasstest_dom::DiffOptions;
use std::sync::Arc;

use crate::auth::AuthClient;
use crate::browser::{BrowserIntegration, BrowserPage};
use crate::error::{Error, Result};

/// One card on an open dashboard, optionally narrowed to a descendant.
///
/// Narrowing appends a selector and shares the page with the parent card.
pub struct Card<P: BrowserPage> {
    index: usize,
    selectors: Vec<String>,
    page: Arc<P>,
}

impl<P: BrowserPage> Clone for Card<P> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            selectors: self.selectors.clone(),
            page: Arc::clone(&self.page),
        }
    }
}

impl<P: BrowserPage> Card<P> {
    pub(crate) fn new(index: usize, page: Arc<P>) -> Self {
        Self {
            index,
            selectors: Vec::new(),
            page,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }

    /// Card scoped to the first descendant matching `selector`
    pub fn narrow(&self, selector: impl Into<String>) -> Self {
        let mut selectors = self.selectors.clone();
        selectors.push(selector.into());
        Self {
            index: self.index,
            selectors,
            page: Arc::clone(&self.page),
        }
    }

    /// Resolve the card root, then each selector in turn.
    ///
    /// Intermediate handles are released; the caller owns the returned one.
    pub async fn element(&self) -> Result<P::Element> {
        let mut element = self.page.nth_card(self.index).await?;
        for selector in &self.selectors {
            let found = self.page.find(&element, selector).await;
            self.page.release(element).await?;
            element = found?.ok_or_else(|| {
                Error::Browser(format!(
                    "card {} has no element matching {}",
                    self.index, selector
                ))
            })?;
        }
        Ok(element)
    }

    /// Canonical HTML for snapshot comparison
    pub async fn html(&self, options: &DiffOptions) -> Result<String> {
        let element = self.element().await?;
        let html = self.page.shadow_html(&element, options).await;
        self.page.release(element).await?;
        html
    }

    /// Text content with surrounding whitespace trimmed
    pub async fn text(&self) -> Result<String> {
        let element = self.element().await?;
        let text = self.page.text_content(&element).await;
        self.page.release(element).await?;
        Ok(text?.trim().to_string())
    }

    /// PNG screenshot
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let element = self.element().await?;
        let png = self.page.screenshot(&element).await;
        self.page.release(element).await?;
        png
    }
}

/// A storage-mode dashboard opened in a browser page
pub struct Dashboard<B: BrowserIntegration> {
    path: String,
    cards: Vec<Card<B::Page>>,
    page: Arc<B::Page>,
    auth: AuthClient,
    browser: Arc<B>,
}

impl<B: BrowserIntegration> Dashboard<B> {
    pub(crate) fn new(
        path: String,
        card_count: usize,
        page: B::Page,
        auth: AuthClient,
        browser: Arc<B>,
    ) -> Self {
        let page = Arc::new(page);
        let cards = (0..card_count)
            .map(|n| Card::new(n, Arc::clone(&page)))
            .collect();
        Self {
            path,
            cards,
            page,
            auth,
            browser,
        }
    }

    /// URL path of the dashboard, e.g. `lovelace-1`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cards(&self) -> &[Card<B::Page>] {
        &self.cards
    }

    pub fn card(&self, n: usize) -> Option<&Card<B::Page>> {
        self.cards.get(n)
    }

    pub fn page(&self) -> &B::Page {
        &self.page
    }

    /// Fresh logged-in deep link to this dashboard
    pub async fn link(&self) -> Result<String> {
        let code = self.auth.fetch_login_code().await?;
        self.auth.deep_link(&self.path, code)
    }

    /// Open the dashboard in a visible window and wait for it to close
    pub async fn open_in_browser(&self) -> Result<()> {
        let link = self.link().await?;
        self.browser.open_in_headed(&link).await
    }
}
