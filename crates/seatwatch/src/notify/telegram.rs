//! Telegram Bot API notifier: `sendMessage` for delivery, long-polled
//! `getUpdates` for inbound commands.

use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{InboundCommand, Notifier};
use crate::error::{Error, Result};
use crate::types::SubscriberId;

const API_BASE: &str = "https://api.telegram.org";

/// Telegram channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Seconds between `getUpdates` calls.
    pub poll_interval_secs: u64,
    /// Long-poll timeout passed to Telegram.
    pub long_poll_timeout_secs: u64,
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            poll_interval_secs: 3,
            long_poll_timeout_secs: 30,
            api_base: API_BASE.to_string(),
        }
    }
}

pub struct TelegramNotifier {
    config: TelegramConfig,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl TelegramNotifier {
    /// The command poller started by [`Notifier::receive_commands`] stops
    /// when `cancel` fires.
    pub fn new(config: TelegramConfig, cancel: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.long_poll_timeout_secs + 15))
            .build()
            .map_err(|e| Error::config(format!("Failed to build Telegram client: {e}")))?;

        Ok(Self {
            config,
            client,
            cancel,
        })
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.config, method)
    }
}

fn api_url(config: &TelegramConfig, method: &str) -> String {
    format!("{}/bot{}/{}", config.api_base, config.bot_token, method)
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, subscriber: SubscriberId, text: &str) -> Result<()> {
        let failure = |message: String| Error::DeliveryFailure {
            subscriber,
            message,
        };

        let body = serde_json::json!({
            "chat_id": subscriber,
            "text": text,
        });

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| failure(format!("sendMessage failed: {e}")))?;

        let result: ApiResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| failure(format!("Invalid sendMessage response: {e}")))?;

        if !result.ok {
            return Err(failure(result.description.unwrap_or_default()));
        }

        debug!(subscriber, "Telegram message sent");
        Ok(())
    }

    fn receive_commands(&self) -> BoxStream<'static, InboundCommand> {
        let (tx, rx) = mpsc::unbounded();
        let poller = UpdatePoller {
            config: self.config.clone(),
            client: self.client.clone(),
            offset: 0,
        };
        tokio::spawn(poller.run(tx, self.cancel.clone()));
        rx.boxed()
    }
}

struct UpdatePoller {
    config: TelegramConfig,
    client: reqwest::Client,
    offset: i64,
}

impl UpdatePoller {
    async fn run(mut self, tx: mpsc::UnboundedSender<InboundCommand>, cancel: CancellationToken) {
        info!("Telegram command polling started");

        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                updates = self.get_updates() => updates,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        let Some(command) = update.into_command() else {
                            continue;
                        };
                        if tx.unbounded_send(command).is_err() {
                            info!("Telegram polling stopped (receiver dropped)");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Telegram polling error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
            }
        }

        info!("Telegram command polling stopped");
    }

    async fn get_updates(&mut self) -> Result<Vec<Update>> {
        let response = self
            .client
            .get(api_url(&self.config, "getUpdates"))
            .query(&[
                ("offset", (self.offset + 1).to_string()),
                ("timeout", self.config.long_poll_timeout_secs.to_string()),
                ("allowed_updates", "[\"message\"]".to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport(format!("Telegram getUpdates failed: {e}")))?;

        let body: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|e| transport(format!("Invalid Telegram response: {e}")))?;

        if !body.ok {
            return Err(transport(format!(
                "Telegram API error: {}",
                body.description.unwrap_or_default()
            )));
        }

        let updates = body.result.unwrap_or_default();
        if let Some(last) = updates.last() {
            self.offset = last.update_id;
        }
        Ok(updates)
    }
}

fn transport(message: String) -> Error {
    Error::Transport { message }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

impl Update {
    fn into_command(self) -> Option<InboundCommand> {
        let message = self.message?;
        InboundCommand::parse(message.chat.id, message.text.as_deref()?)
    }
}
