use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Grant;

const TELEGRAM_API_URL: &str = "https://api.telegram.org";
const MAX_MESSAGE_CHARS: usize = 4096;
const NOTHING_NEW: &str =
    "Щотижнева перевірка грантів завершена. Нових можливостей не знайдено.";

/// Receives the grants inserted by a run. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, grants: &[Grant]) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: TELEGRAM_API_URL.to_string(),
            bot_token,
            chat_id,
        }
    }

    async fn send(&self, text: &str, html: bool) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: html.then_some("HTML"),
            disable_web_page_preview: true,
        };

        // The bot token is part of the URL, keep it out of error messages.
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Http(e.without_url()))?;
        let status = response.status();
        let body: TelegramResponse = response
            .json()
            .await
            .map_err(|e| AppError::Http(e.without_url()))?;
        if !status.is_success() || !body.ok {
            return Err(AppError::Notify(format!(
                "sendMessage failed ({}): {}",
                status,
                body.description.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, grants: &[Grant]) -> Result<()> {
        if grants.is_empty() {
            return self.send(NOTHING_NEW, false).await;
        }

        let parts = split_message(&format_grants(grants), MAX_MESSAGE_CHARS);
        let total = parts.len();
        for (i, part) in parts.iter().enumerate() {
            self.send(&part.text, part.html).await?;
            tracing::debug!(part = i + 1, total, "Sent Telegram message");
        }
        tracing::info!(grants = grants.len(), "Telegram notification sent");
        Ok(())
    }
}

/// Fallback when no chat credentials are configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, grants: &[Grant]) -> Result<()> {
        if grants.is_empty() {
            tracing::info!("No new grants found");
        }
        for grant in grants {
            tracing::info!(
                title = %grant.title,
                category = %grant.category,
                deadline = %deadline_label(grant),
                url = %grant.url,
                "New grant"
            );
        }
        Ok(())
    }
}

fn deadline_label(grant: &Grant) -> String {
    grant
        .deadline
        .map(|d| d.format("%d-%m-%Y").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// One HTML block per grant under a counted header.
pub fn format_grants(grants: &[Grant]) -> Vec<String> {
    let mut blocks = Vec::with_capacity(grants.len() + 1);
    blocks.push(format!(
        "<b>Знайдено нові гранти ({}):</b>\n\n",
        grants.len()
    ));
    for grant in grants {
        blocks.push(format!(
            "<b>Назва:</b> {}\n<b>Категорія:</b> {}\n<b>Дедлайн:</b> {}\n<a href=\"{}\">Посилання</a>\n\n",
            escape_html(&grant.title),
            escape_html(&grant.category),
            deadline_label(grant),
            escape_html(&grant.url),
        ));
    }
    blocks
}

/// One outgoing message and whether Telegram should parse it as HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    pub text: String,
    pub html: bool,
}

/// Packs blocks into messages of at most `max_chars` characters without
/// splitting a block. A block that is too long on its own is converted to
/// plain text first, since cutting markup would break the HTML parse.
pub fn split_message(blocks: &[String], max_chars: usize) -> Vec<MessagePart> {
    let mut messages = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for block in blocks {
        let block_len = block.chars().count();
        if current_len + block_len > max_chars && !current.is_empty() {
            messages.push(MessagePart {
                text: std::mem::take(&mut current),
                html: true,
            });
            current_len = 0;
        }
        if block_len > max_chars {
            let chars: Vec<char> = html_to_plain(block).chars().collect();
            for piece in chars.chunks(max_chars) {
                messages.push(MessagePart {
                    text: piece.iter().collect(),
                    html: false,
                });
            }
            continue;
        }
        current.push_str(block);
        current_len += block_len;
    }
    if !current.is_empty() {
        messages.push(MessagePart {
            text: current,
            html: true,
        });
    }
    messages
}

fn html_to_plain(block: &str) -> String {
    static LINK: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    let link = LINK.get_or_init(|| Regex::new(r#"<a href="([^"]*)">([^<]*)</a>"#).unwrap());
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]+>").unwrap());

    let text = link.replace_all(block, "$2: $1");
    tag.replace_all(&text, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}
