use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::Serialize;
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    config::{Config, ConfigSource},
    notify::{Notification, NotificationKind},
};

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const TRIES_PER_ADMIN: usize = 2;

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
}

/// Bot token and chats a notification of `kind` should go to, or `None` if
/// the configured message mode drops it or no bot is configured.
fn recipients(config: &Config, kind: NotificationKind) -> Option<(&str, &[i64])> {
    if !config.message_mode.allows(kind) {
        return None;
    }

    let bot_token = config.bot_token.as_deref().filter(|token| !token.is_empty())?;
    Some((bot_token, &config.admins))
}

#[derive(Clone, Debug)]
pub(crate) struct TelegramBot {
    client: reqwest::Client,
}

impl TelegramBot {
    pub(crate) fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Deliver notifications until cancelled or every `Notifier` is dropped.
    /// Delivery problems are logged and otherwise ignored.
    pub(crate) async fn run(
        &self,
        config: &ConfigSource,
        mut notifications: UnboundedReceiver<Notification>,
        cancel: CancellationToken,
    ) {
        loop {
            let notification = tokio::select! {
                () = cancel.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => notification,
                    None => break,
                },
            };

            let config = match config.current().await {
                Ok(config) => config,
                Err(err) => {
                    warn!("Dropping notification, config unavailable: {err:#}");
                    continue;
                }
            };

            let Some((bot_token, admins)) = recipients(&config, notification.kind) else {
                trace!(kind = ?notification.kind, "Notification filtered by message mode");
                continue;
            };

            for &chat_id in admins {
                self.deliver(bot_token, chat_id, &notification.text).await;
            }
        }

        info!("Notification delivery stopped");
    }

    async fn deliver(&self, bot_token: &str, chat_id: i64, text: &str) {
        for attempt in 1..=TRIES_PER_ADMIN {
            match self.send_message(bot_token, chat_id, text).await {
                Ok(()) => return,
                Err(err) => warn!(chat_id, attempt, "Failed to send Telegram message: {err:#}"),
            }
        }
    }

    #[instrument(level = "error", name = "Telegram", skip(self, bot_token, text))]
    async fn send_message(&self, bot_token: &str, chat_id: i64, text: &str) -> anyhow::Result<()> {
        let url = format!("{TELEGRAM_API}/bot{bot_token}/sendMessage");
        debug!("Sending Telegram message");

        let response = match timeout(
            SEND_TIMEOUT,
            self.client
                .post(&url)
                .json(&SendMessage {
                    chat_id,
                    text,
                    parse_mode: "HTML",
                })
                .send(),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(anyhow!(err.without_url()).context("Request to Telegram failed"));
            }
            Err(_) => bail!("Sending Telegram message timed out ({SEND_TIMEOUT:?})"),
        };

        let status = response.status();
        if !status.is_success() {
            match timeout(SEND_TIMEOUT, response.text()).await {
                Ok(Ok(body)) => bail!("Telegram responded with {status}: {body}"),
                _ => bail!("Telegram responded with {status}"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> Config {
        Config::parse(&format!(
            r#"{{
                "PANEL_DOMAIN": "panel.example",
                "PANEL_USERNAME": "admin",
                "PANEL_PASSWORD": "secret",
                "CHECK_INTERVAL": 60,
                "GENERAL_LIMIT": 2,
                {extra}
                "ADMINS": [1, 2]
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn always_mode_sends_everything() {
        let config = config(r#""BOT_TOKEN": "123:abc","#);

        assert_eq!(
            recipients(&config, NotificationKind::Log),
            Some(("123:abc", [1, 2].as_slice()))
        );
        assert!(recipients(&config, NotificationKind::Ban).is_some());
    }

    #[test]
    fn on_ban_mode_drops_log_messages() {
        let config = config(r#""BOT_TOKEN": "123:abc", "TELEGRAM_MESSAGE_MODE": "on_ban","#);

        assert_eq!(recipients(&config, NotificationKind::Log), None);
        assert!(recipients(&config, NotificationKind::Ban).is_some());
    }

    #[test]
    fn silent_mode_and_missing_bot_drop_everything() {
        let silent = config(r#""BOT_TOKEN": "123:abc", "TELEGRAM_MESSAGE_MODE": "silent","#);
        assert_eq!(recipients(&silent, NotificationKind::Ban), None);

        let no_bot = config(r#""BOT_TOKEN": "","#);
        assert_eq!(recipients(&no_bot, NotificationKind::Ban), None);
    }

    #[test]
    fn send_message_payload() {
        let payload = serde_json::to_value(SendMessage {
            chat_id: 42,
            text: "<b>hi</b>",
            parse_mode: "HTML",
        })
        .unwrap();

        assert_eq!(
            payload,
            serde_json::json!({"chat_id": 42, "text": "<b>hi</b>", "parse_mode": "HTML"})
        );
    }
}
