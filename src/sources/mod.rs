mod feed;
mod listing;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, SourceKind};
use crate::error::Result;
use crate::services::Renderer;

pub use feed::FeedAdapter;
pub use listing::ListingAdapter;

/// A grant source: yields candidate URLs and owns whatever it needs to do so.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn discover(&self) -> Result<Vec<String>>;

    /// Releases resources held by the adapter. Called after every run.
    async fn cleanup(&self) {}
}

/// Adapters for every enabled source in the configuration.
pub fn build_sources(
    config: &Config,
    renderer: Arc<dyn Renderer>,
) -> Result<Vec<Box<dyn SourceAdapter>>> {
    let mut sources: Vec<Box<dyn SourceAdapter>> = Vec::new();

    for source in config.sources.iter().filter(|s| s.enabled) {
        match source.kind {
            SourceKind::Listing => sources.push(Box::new(ListingAdapter::new(
                source,
                renderer.clone(),
                config.renderer.timeout(),
            )?)),
            SourceKind::Feed => sources.push(Box::new(FeedAdapter::new(
                source,
                &config.renderer.user_agent,
            ))),
        }
    }

    tracing::info!(count = sources.len(), "Configured sources");
    Ok(sources)
}
