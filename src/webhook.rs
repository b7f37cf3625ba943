use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};
use url::Url;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum UserStatus {
    Enabled,
    Disabled,
}

#[derive(Serialize)]
struct Payload<'a> {
    username: &'a str,
    status: UserStatus,
}

/// Operator-configured endpoint told about every enable/disable.
#[derive(Clone, Debug)]
pub(crate) struct Webhook {
    client: reqwest::Client,
    url: Url,
}

impl Webhook {
    pub(crate) fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }

    /// Never fails the caller; problems are logged.
    pub(crate) async fn notify(&self, username: &str, status: UserStatus) {
        if let Err(err) = self.send(username, status).await {
            warn!("Webhook delivery failed: {err:#}");
        }
    }

    #[instrument(level = "error", name = "Webhook", skip(self), fields(url = %self.url))]
    async fn send(&self, username: &str, status: UserStatus) -> anyhow::Result<()> {
        let url = &self.url;
        debug!(?status, "Sending webhook");

        let response = match timeout(
            WEBHOOK_TIMEOUT,
            self.client
                .post(url.clone())
                .json(&Payload { username, status })
                .send(),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(anyhow!(err).context(format!("Failed to send webhook to {url}")));
            }
            Err(_) => bail!("Sending webhook to {url} timed out ({WEBHOOK_TIMEOUT:?})"),
        };

        let status = response.status();
        if !status.is_success() {
            bail!("Webhook endpoint {url} responded with {status}");
        }

        Ok(())
    }
}
