use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use crate::config::SourceConfig;
use crate::error::{AppError, Result};
use crate::services::{RenderPool, Renderer};

use super::SourceAdapter;

/// Renders listing pages and collects grant links with a CSS selector.
pub struct ListingAdapter {
    name: String,
    first_page: String,
    page_url_template: Option<String>,
    max_pages: u32,
    link_selector: Selector,
    link_pattern: Option<String>,
    next_page_selector: Option<Selector>,
    pool: RenderPool,
}

fn parse_selector(source: &str, css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| AppError::Config(format!("source '{}': invalid selector '{}': {}", source, css, e)))
}

impl ListingAdapter {
    pub fn new(config: &SourceConfig, renderer: Arc<dyn Renderer>, timeout: Duration) -> Result<Self> {
        let link_css = config.link_selector.as_deref().ok_or_else(|| {
            AppError::Config(format!("listing source '{}' has no link_selector", config.name))
        })?;
        let next_page_selector = config
            .next_page_selector
            .as_deref()
            .map(|css| parse_selector(&config.name, css))
            .transpose()?;

        Ok(Self {
            name: config.name.clone(),
            first_page: config.url.clone(),
            page_url_template: config.page_url_template.clone(),
            max_pages: config.max_pages.max(1),
            link_selector: parse_selector(&config.name, link_css)?,
            link_pattern: config.link_pattern.clone(),
            next_page_selector,
            pool: RenderPool::new(renderer, 1, timeout),
        })
    }

    fn page_url(&self, page: u32) -> Option<String> {
        if page == 1 {
            return Some(self.first_page.clone());
        }
        self.page_url_template
            .as_ref()
            .map(|template| template.replace("{page}", &page.to_string()))
    }

    fn has_next_page(&self, html: &str) -> bool {
        match &self.next_page_selector {
            Some(selector) => Html::parse_document(html).select(selector).next().is_some(),
            None => true,
        }
    }
}

#[async_trait]
impl SourceAdapter for ListingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for page in 1..=self.max_pages {
            let Some(page_url) = self.page_url(page) else {
                break;
            };

            let html = match self.pool.render(&page_url).await {
                Ok(html) => html,
                Err(e) if page == 1 => {
                    return Err(anyhow::anyhow!("Failed to render listing {}: {}", page_url, e).into());
                }
                Err(e) => {
                    tracing::warn!(source = %self.name, page, error = %e, "Stopping pagination");
                    break;
                }
            };

            let page_links = extract_links(
                &html,
                &page_url,
                &self.link_selector,
                self.link_pattern.as_deref(),
            );
            tracing::debug!(source = %self.name, page, links = page_links.len(), "Scanned listing page");
            if page_links.is_empty() {
                break;
            }
            for link in page_links {
                if seen.insert(link.clone()) {
                    links.push(link);
                }
            }

            if !self.has_next_page(&html) {
                break;
            }
        }

        tracing::info!(source = %self.name, count = links.len(), "Discovered links");
        Ok(links)
    }

    async fn cleanup(&self) {
        self.pool.close();
        tracing::debug!(source = %self.name, "Closed rendering pool");
    }
}

/// Absolute http(s) links matched by `selector`, fragments removed,
/// in document order.
pub fn extract_links(
    html: &str,
    page_url: &str,
    selector: &Selector,
    pattern: Option<&str>,
) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(mut resolved) = base.join(href.trim()) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);
        let resolved = resolved.to_string();

        if pattern.is_some_and(|p| !resolved.contains(p)) {
            continue;
        }
        if seen.insert(resolved.clone()) {
            links.push(resolved);
        }
    }

    links
}
