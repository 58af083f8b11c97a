// =============================================================================
// Telegram Bot API notifier
// =============================================================================

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{AlertChannel, Notifier};

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    /// Wait after the API answered with a non-success status.
    pub status_delay: Duration,
    /// Wait after the request itself failed.
    pub transport_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            status_delay: Duration::from_secs(5),
            transport_delay: Duration::from_secs(2),
        }
    }
}

/// Chat ids per alert channel. An empty id disables that channel.
#[derive(Debug, Clone, Default)]
pub struct ChatIds {
    pub main: String,
    pub averaging: String,
    pub tech: String,
}

impl ChatIds {
    fn for_channel(&self, channel: AlertChannel) -> Option<&str> {
        let id = match channel {
            AlertChannel::Main => &self.main,
            AlertChannel::Averaging => &self.averaging,
            AlertChannel::Tech => &self.tech,
        };
        (!id.is_empty()).then_some(id.as_str())
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

/// What one `sendMessage` call came back with.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PostOutcome {
    Sent,
    /// 400: the message itself is unacceptable, usually broken HTML.
    BadRequest,
    /// Anything else non-2xx: rate limits, server trouble.
    Rejected,
}

pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    bot_token: String,
    chats: ChatIds,
    policy: DeliveryPolicy,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>, chats: ChatIds, policy: DeliveryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build Telegram HTTP client")?;
        Ok(Self {
            client,
            base_url: TELEGRAM_API.to_string(),
            bot_token: bot_token.into(),
            chats,
            policy,
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post_once(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> std::result::Result<PostOutcome, reqwest::Error> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
        let request = SendMessageRequest {
            chat_id,
            text,
            parse_mode,
        };
        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(PostOutcome::Sent);
        }
        let body = response.text().await.unwrap_or_default();
        error!(%status, body = %body, "Telegram rejected message");
        if status == StatusCode::BAD_REQUEST {
            Ok(PostOutcome::BadRequest)
        } else {
            Ok(PostOutcome::Rejected)
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, channel: AlertChannel, text: &str) -> Result<()> {
        let Some(chat_id) = self.chats.for_channel(channel) else {
            debug!(%channel, "no chat configured, alert only logged");
            return Ok(());
        };

        let mut parse_mode = Some("HTML");
        for attempt in 1..=self.policy.max_attempts {
            match self.post_once(chat_id, text, parse_mode).await {
                Ok(PostOutcome::Sent) => {
                    info!(%channel, attempt, html = parse_mode.is_some(), "Telegram message sent");
                    return Ok(());
                }
                // Markup Telegram cannot parse: resend as plain text straight away.
                Ok(PostOutcome::BadRequest) if parse_mode.is_some() => {
                    warn!(%channel, attempt, "HTML rejected, resending as plain text");
                    parse_mode = None;
                }
                Ok(PostOutcome::BadRequest) => {
                    return Err(anyhow!("Telegram refused message for {channel} even as plain text"));
                }
                Ok(PostOutcome::Rejected) => tokio::time::sleep(self.policy.status_delay).await,
                Err(e) => {
                    error!(%channel, attempt, error = %e, "Telegram request failed");
                    tokio::time::sleep(self.policy.transport_delay).await;
                }
            }
        }
        Err(anyhow!(
            "Telegram delivery to {channel} failed after {} attempts",
            self.policy.max_attempts
        ))
    }
}
