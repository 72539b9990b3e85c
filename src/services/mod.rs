pub mod content_fetcher;
pub mod notifier;
pub mod renderer;

pub use content_fetcher::{ContentFetcher, FetchError, FetchSettings};
pub use notifier::{LogNotifier, Notifier, TelegramNotifier};
pub use renderer::{build_renderer, RenderPool, Renderer};
