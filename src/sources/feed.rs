use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use feed_rs::parser;
use reqwest::Client;

use crate::config::SourceConfig;
use crate::error::Result;

use super::SourceAdapter;

/// Takes grant links from an RSS/Atom feed instead of rendering a listing.
pub struct FeedAdapter {
    name: String,
    url: String,
    link_pattern: Option<String>,
    client: Client,
}

impl FeedAdapter {
    pub fn new(config: &SourceConfig, user_agent: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            link_pattern: config.link_pattern.clone(),
            client,
        }
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<String>> {
        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Failed to fetch feed: HTTP {}", response.status()).into());
        }

        let bytes = response.bytes().await?;
        let links = feed_links(&bytes, self.link_pattern.as_deref())?;
        tracing::info!(source = %self.name, count = links.len(), "Discovered links");
        Ok(links)
    }
}

/// First link of every entry, in feed order.
pub(crate) fn feed_links(bytes: &[u8], pattern: Option<&str>) -> Result<Vec<String>> {
    let feed = parser::parse(bytes)?;
    let mut seen = HashSet::new();

    Ok(feed
        .entries
        .into_iter()
        .filter_map(|entry| entry.links.into_iter().next().map(|l| l.href))
        .filter(|href| pattern.map_or(true, |p| href.contains(p)))
        .filter(|href| seen.insert(href.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Opportunity Desk</title>
    <link>https://opportunitydesk.org</link>
    <description>Grants</description>
    <item>
      <title>Youth Innovation Fund</title>
      <link>https://opportunitydesk.org/2024/01/10/youth-innovation-fund/</link>
    </item>
    <item>
      <title>Sponsored</title>
      <link>https://ads.example/offer</link>
    </item>
    <item>
      <title>Youth Innovation Fund (repost)</title>
      <link>https://opportunitydesk.org/2024/01/10/youth-innovation-fund/</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn takes_entry_links_matching_pattern() {
        let links = feed_links(RSS.as_bytes(), Some("https://opportunitydesk.org/")).unwrap();
        assert_eq!(
            links,
            vec!["https://opportunitydesk.org/2024/01/10/youth-innovation-fund/".to_string()]
        );
    }

    #[test]
    fn without_pattern_all_links_are_kept() {
        let links = feed_links(RSS.as_bytes(), None).unwrap();
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn garbage_is_a_feed_error() {
        assert!(feed_links(b"not a feed", None).is_err());
    }
}
