//! Concurrent-IP limit enforcement.
//!
//! Each detection cycle hands the engine the window's [`UsageReport`]s. Users
//! move between two states:
//!
//! - **Normal**: no detection record.
//! - **Flagged**: a record holds the IPs seen when the user was last over the
//!   limit and how many consecutive cycles that has been true.
//!
//! A flagged user is only disabled after reusing more than `limit` of the
//! *recorded* addresses for `outOfLimitNumber` cycles; one cycle at or under
//! the limit clears the flag. Users with no usage in a cycle are not visited
//! and keep their state.

pub(crate) mod limits;
pub(crate) mod state;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    detection_store::{DetectionRecord, DetectionStore},
    disabled_users::DisabledUsers,
    json_file::StoreError,
    notify::{Notifier, escape_html},
    observation::UsageReport,
    panel::{PanelClient, transport::PanelTransport},
    webhook::{UserStatus, Webhook},
};
pub(crate) use limits::{LimitConfig, LimitSettings};
use state::{Transition, evaluate};

/// What happened during one cycle, for logging and tests.
#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct CycleOutcome {
    pub(crate) flagged: Vec<String>,
    pub(crate) escalated: Vec<String>,
    pub(crate) recovered: Vec<String>,
    pub(crate) disabled: Vec<String>,
    pub(crate) enforcement_failures: Vec<String>,
}

pub(crate) struct LimitEngine<'a, T> {
    panel: &'a PanelClient<T>,
    store: &'a DetectionStore,
    disabled_users: &'a DisabledUsers,
    notifier: &'a Notifier,
    webhook: Option<&'a Webhook>,
}

impl<'a, T: PanelTransport> LimitEngine<'a, T> {
    pub(crate) fn new(
        panel: &'a PanelClient<T>,
        store: &'a DetectionStore,
        disabled_users: &'a DisabledUsers,
        notifier: &'a Notifier,
        webhook: Option<&'a Webhook>,
    ) -> Self {
        Self {
            panel,
            store,
            disabled_users,
            notifier,
            webhook,
        }
    }

    /// Store failures abort the cycle; panel failures while disabling do not.
    #[instrument(skip_all, fields(users = reports.len()))]
    pub(crate) async fn run_cycle(
        &self,
        reports: &[UsageReport],
        settings: &LimitSettings,
    ) -> Result<CycleOutcome, StoreError> {
        let mut outcome = CycleOutcome::default();

        for report in reports {
            let user = report.name.as_str();

            if settings.limits.is_exempt(user) {
                debug!(user, "Skipping excepted user");
                continue;
            }

            let limit = settings.limits.limit_for(user);
            let record = self.store.get(user).await;

            match evaluate(
                user,
                record.as_ref(),
                &report.ips,
                limit,
                settings.out_of_limit_threshold,
            ) {
                Transition::Stay => {}
                Transition::Flag(record) => {
                    info!(user, ips = record.ips.len(), limit, "User over IP limit, flagging");
                    self.store.put(record).await?;
                    outcome.flagged.push(user.to_owned());
                }
                Transition::Escalate(record) => {
                    info!(
                        user,
                        count = record.out_of_limit_count,
                        threshold = settings.out_of_limit_threshold,
                        "User still over IP limit"
                    );
                    self.store.put(record).await?;
                    outcome.escalated.push(user.to_owned());
                }
                Transition::Enforce(record) => {
                    if self.enforce(record).await? {
                        outcome.disabled.push(user.to_owned());
                    } else {
                        outcome.enforcement_failures.push(user.to_owned());
                    }
                }
                Transition::Recover => {
                    debug!(user, "User back within IP limit");
                    self.store.delete(user).await?;
                    outcome.recovered.push(user.to_owned());
                }
            }
        }

        Ok(outcome)
    }

    /// Disable the user. The record is cleared whatever the panel said, and a
    /// failure to track the disabled user is only reported. Returns whether
    /// the disable succeeded.
    async fn enforce(&self, record: DetectionRecord) -> Result<bool, StoreError> {
        let user = record.user.clone();
        let ips = record.ips.iter().cloned().collect::<Vec<_>>();

        self.store.put(record).await?;

        let message = format!("User {user} has {} active ips. {{{}}}", ips.len(), ips.join(", "));
        warn!("{message}");
        self.notifier.log(format!("<b>Warning: </b>{}", escape_html(&message)));

        let disabled = match self.panel.set_user_enabled(&user, false).await {
            Ok(()) => {
                if let Err(err) = self.disabled_users.add(&user, Utc::now()).await {
                    let message = format!(
                        "Disabled user {user} could not be tracked for re-enabling: {err}"
                    );
                    error!("{message}");
                    self.notifier.log(escape_html(&message));
                }
                if let Some(webhook) = self.webhook {
                    webhook.notify(&user, UserStatus::Disabled).await;
                }
                true
            }
            Err(err) => {
                let message = format!("Error disabling user {user}: {err}");
                error!("{message}");
                self.notifier.log(escape_html(&message));
                false
            }
        };

        self.store.delete(&user).await?;
        Ok(disabled)
    }
}
