use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use url::Url;

use crate::config::{RendererBackend, RendererConfig};
use crate::error::{AppError, Result};
use crate::pipeline::retry::{RetryClass, Retryable};

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Navigation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Navigation failed (status {status}): {message}")]
    Navigation { status: u16, message: String },

    #[error("Page rejected (status {status})")]
    Rejected { status: u16 },

    #[error("Rendering pool closed")]
    PoolClosed,
}

impl RenderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RenderError::Timeout(_) | RenderError::Network(_) | RenderError::Navigation { .. }
        )
    }

    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            RenderError::Timeout(timeout)
        } else {
            // The request URL may carry credentials.
            RenderError::Network(err.without_url().to_string())
        }
    }

    fn from_status(status: StatusCode, message: String) -> Self {
        let transient = status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT;
        if transient {
            RenderError::Navigation {
                status: status.as_u16(),
                message,
            }
        } else {
            RenderError::Rejected {
                status: status.as_u16(),
            }
        }
    }
}

impl Retryable for RenderError {
    fn retry_class(&self) -> RetryClass {
        if self.is_transient() {
            RetryClass::Transient
        } else {
            RetryClass::Permanent
        }
    }
}

/// Turns a URL into rendered HTML.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str, timeout: Duration) -> std::result::Result<String, RenderError>;

    fn name(&self) -> &str;
}

/// Plain GET with a browser user agent. No JavaScript.
pub struct HttpRenderer {
    client: Client,
    user_agent: String,
}

impl HttpRenderer {
    pub fn new(user_agent: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            user_agent: user_agent.to_string(),
        }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(&self, url: &str, timeout: Duration) -> std::result::Result<String, RenderError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RenderError::from_reqwest(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url, %status, "Failed to fetch page");
            return Err(RenderError::from_status(status, String::new()));
        }

        response
            .text()
            .await
            .map_err(|e| RenderError::from_reqwest(e, timeout))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Headless Chrome through a Browserless `/content` endpoint.
pub struct BrowserlessRenderer {
    client: Client,
    endpoint: Url,
    user_agent: String,
    settle: Duration,
}

impl BrowserlessRenderer {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        user_agent: &str,
        settle: Duration,
    ) -> Result<Self> {
        let endpoint = content_endpoint(base_url, token).map_err(|e| {
            AppError::Config(format!("Invalid browserless_url {base_url}: {e}"))
        })?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Ok(Self {
            client,
            endpoint,
            user_agent: user_agent.to_string(),
            settle,
        })
    }
}

fn content_endpoint(base_url: &str, token: Option<&str>) -> std::result::Result<Url, url::ParseError> {
    let mut endpoint = Url::parse(&format!("{}/content", base_url.trim_end_matches('/')))?;
    if let Some(token) = token {
        endpoint.query_pairs_mut().append_pair("token", token);
    }
    Ok(endpoint)
}

#[async_trait]
impl Renderer for BrowserlessRenderer {
    async fn render(&self, url: &str, timeout: Duration) -> std::result::Result<String, RenderError> {
        let body = serde_json::json!({
            "url": url,
            "userAgent": self.user_agent,
            "gotoOptions": {
                "timeout": timeout.as_millis() as u64,
                "waitUntil": "domcontentloaded",
            },
            "waitForTimeout": self.settle.as_millis() as u64,
        });

        // Navigation timeout plus settle time plus slack for the round trip.
        let request_timeout = timeout + self.settle + Duration::from_secs(5);
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .timeout(request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| RenderError::from_reqwest(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RenderError::from_status(status, message));
        }

        resp.text()
            .await
            .map_err(|e| RenderError::from_reqwest(e, timeout))
    }

    fn name(&self) -> &str {
        "browserless"
    }
}

pub fn build_renderer(config: &RendererConfig) -> Result<Arc<dyn Renderer>> {
    match config.backend {
        RendererBackend::Http => Ok(Arc::new(HttpRenderer::new(&config.user_agent))),
        RendererBackend::Browserless => {
            let base_url = config.browserless_url.as_deref().ok_or_else(|| {
                AppError::Config("browserless backend requires browserless_url".into())
            })?;
            Ok(Arc::new(BrowserlessRenderer::new(
                base_url,
                config.browserless_token.as_deref(),
                &config.user_agent,
                config.settle(),
            )?))
        }
    }
}

/// Bounded set of rendering contexts shared by one source run.
pub struct RenderPool {
    renderer: Arc<dyn Renderer>,
    slots: Semaphore,
    timeout: Duration,
}

impl RenderPool {
    pub fn new(renderer: Arc<dyn Renderer>, size: usize, timeout: Duration) -> Self {
        Self {
            renderer,
            slots: Semaphore::new(size.max(1)),
            timeout,
        }
    }

    /// Waits for a free context. The slot is released when the returned
    /// guard is dropped.
    pub async fn acquire(&self) -> std::result::Result<RenderContext<'_>, RenderError> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| RenderError::PoolClosed)?;
        Ok(RenderContext {
            pool: self,
            _permit: permit,
        })
    }

    /// Renders with a context held only for the duration of the call.
    pub async fn render(&self, url: &str) -> std::result::Result<String, RenderError> {
        let context = self.acquire().await?;
        context.render(url).await
    }

    /// Stops handing out contexts. In-flight renders finish normally.
    pub fn close(&self) {
        self.slots.close();
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

pub struct RenderContext<'a> {
    pool: &'a RenderPool,
    _permit: SemaphorePermit<'a>,
}

impl RenderContext<'_> {
    pub async fn render(&self, url: &str) -> std::result::Result<String, RenderError> {
        tracing::debug!(url, renderer = self.pool.renderer.name(), "Rendering page");
        self.pool.renderer.render(url, self.pool.timeout).await
    }
}
