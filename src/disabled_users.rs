use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    json_file::{self, StoreError},
    notify::{Notifier, escape_html},
    panel::{PanelClient, transport::PanelTransport},
    webhook::{UserStatus, Webhook},
};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DisabledUser {
    pub(crate) user: String,
    pub(crate) disabled_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DisabledFile {
    #[serde(rename = "disabledUsers", default)]
    disabled_users: Vec<DisabledUser>,
}

/// Users disabled by enforcement and waiting to be re-enabled.
#[derive(Debug)]
pub(crate) struct DisabledUsers {
    path: PathBuf,
    users: Mutex<BTreeMap<String, DisabledUser>>,
}

impl DisabledUsers {
    #[instrument]
    pub(crate) async fn open(path: &Path) -> Result<Self, StoreError> {
        let file: DisabledFile = json_file::load_or_create(path).await?;

        let users = file
            .disabled_users
            .into_iter()
            .map(|user| (user.user.clone(), user))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            users: Mutex::new(users),
        })
    }

    /// Keeps the original timestamp if the user is already tracked.
    pub(crate) async fn add(&self, user: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        if users.contains_key(user) {
            return Ok(());
        }
        let mut updated = users.clone();
        updated.insert(
            user.to_owned(),
            DisabledUser {
                user: user.to_owned(),
                disabled_at: now,
            },
        );
        self.persist(&updated).await?;
        *users = updated;
        Ok(())
    }

    pub(crate) async fn remove(&self, user: &str) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        if !users.contains_key(user) {
            return Ok(());
        }
        let mut updated = users.clone();
        updated.remove(user);
        self.persist(&updated).await?;
        *users = updated;
        Ok(())
    }

    pub(crate) async fn list(&self) -> Vec<DisabledUser> {
        self.users.lock().await.values().cloned().collect()
    }

    async fn persist(&self, users: &BTreeMap<String, DisabledUser>) -> Result<(), StoreError> {
        let file = DisabledFile {
            disabled_users: users.values().cloned().collect(),
        };
        json_file::persist(&self.path, &file).await
    }
}

/// Re-enable every tracked user. Users the panel could not be reached for
/// stay tracked for the next round. Returns the number re-enabled.
#[instrument(skip_all)]
pub(crate) async fn reenable_disabled_users<T: PanelTransport>(
    panel: &PanelClient<T>,
    disabled_users: &DisabledUsers,
    webhook: Option<&Webhook>,
    notifier: &Notifier,
) -> Result<usize, StoreError> {
    let mut enabled = 0;

    for DisabledUser { user, disabled_at } in disabled_users.list().await {
        match panel.set_user_enabled(&user, true).await {
            Ok(()) => {
                info!(%user, %disabled_at, "Re-enabled user");
                disabled_users.remove(&user).await?;
                if let Some(webhook) = webhook {
                    webhook.notify(&user, UserStatus::Enabled).await;
                }
                enabled += 1;
            }
            Err(err) => {
                let message = format!("Failed to re-enable user {user}: {err}");
                warn!("{message}");
                notifier.log(escape_html(&message));
            }
        }
    }

    Ok(enabled)
}
