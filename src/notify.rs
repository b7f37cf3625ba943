use serde::Deserialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NotificationKind {
    Log,
    Ban,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Notification {
    pub(crate) text: String,
    pub(crate) kind: NotificationKind,
}

/// Escape text for Telegram's HTML parse mode.
pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Which notifications operators want delivered.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum MessageMode {
    #[default]
    Always,
    OnBan,
    Silent,
}

impl MessageMode {
    pub(crate) fn allows(self, kind: NotificationKind) -> bool {
        match self {
            MessageMode::Always => true,
            MessageMode::OnBan => kind == NotificationKind::Ban,
            MessageMode::Silent => false,
        }
    }
}

/// Fire-and-forget handle onto the notification channel.
///
/// Sending never blocks and never fails the caller; if the delivery side has
/// gone away the message is dropped.
#[derive(Clone, Debug)]
pub(crate) struct Notifier {
    tx: UnboundedSender<Notification>,
}

impl Notifier {
    pub(crate) fn channel() -> (Self, UnboundedReceiver<Notification>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn log(&self, text: impl Into<String>) {
        self.send(text.into(), NotificationKind::Log);
    }

    pub(crate) fn ban(&self, text: impl Into<String>) {
        self.send(text.into(), NotificationKind::Ban);
    }

    fn send(&self, text: String, kind: NotificationKind) {
        if self.tx.send(Notification { text, kind }).is_err() {
            trace!("Notification receiver closed, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_mode_filters_by_kind() {
        assert!(MessageMode::Always.allows(NotificationKind::Log));
        assert!(MessageMode::Always.allows(NotificationKind::Ban));
        assert!(!MessageMode::OnBan.allows(NotificationKind::Log));
        assert!(MessageMode::OnBan.allows(NotificationKind::Ban));
        assert!(!MessageMode::Silent.allows(NotificationKind::Ban));
    }

    #[test]
    fn sending_after_receiver_dropped_is_harmless() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.log("nobody is listening");
    }

    #[test]
    fn html_markup_is_escaped() {
        assert_eq!(
            escape_html("<html>502 & more</html>"),
            "&lt;html&gt;502 &amp; more&lt;/html&gt;"
        );
        assert_eq!(escape_html("alice"), "alice");
    }

    #[test]
    fn message_mode_parses_config_values() {
        let mode: MessageMode = serde_json::from_str("\"on_ban\"").unwrap();
        assert_eq!(mode, MessageMode::OnBan);
    }
}
