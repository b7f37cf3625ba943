//! Scheduling of detection cycles and of the automatic re-enable round.
//!
//! A cycle fetches the panel's user directory, drains the observation window,
//! posts the active-IP summary and hands the reports to the [`LimitEngine`].
//! The first cycle runs at start-up, the next ones `CHECK_INTERVAL` seconds
//! after the previous one finished, or immediately on `SIGUSR1`. A failed cycle is logged and
//! notified and the next one runs at the usual time.

use std::{collections::HashSet, time::Duration};

use anyhow::Context as _;
use tokio::{
    select,
    signal::unix::{Signal, SignalKind, signal},
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::ConfigSource,
    detection_store::DetectionStore,
    disabled_users::{DisabledUsers, reenable_disabled_users},
    limit_enforcement::{CycleOutcome, LimitEngine},
    notify::{Notifier, escape_html},
    observation::ObservationWindow,
    panel::{PanelClient, transport::PanelTransport},
    summary,
    webhook::Webhook,
};

/// How often to look again at the config while automatic re-enabling is off.
const REENABLE_RECHECK: Duration = Duration::from_secs(60);

pub(crate) struct Poller<'a, T> {
    pub(crate) config: &'a ConfigSource,
    pub(crate) panel: &'a PanelClient<T>,
    pub(crate) window: &'a ObservationWindow,
    pub(crate) store: &'a DetectionStore,
    pub(crate) disabled_users: &'a DisabledUsers,
    pub(crate) notifier: &'a Notifier,
    pub(crate) http: &'a reqwest::Client,
}

impl<T: PanelTransport> Poller<'_, T> {
    /// Run detection cycles until `cancel` fires. Cancellation also abandons a
    /// cycle that is in flight.
    pub(crate) async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

        let flagged = self.store.list().await;
        if !flagged.is_empty() {
            info!(users = flagged.len(), "Resuming with flagged users");
            debug!(?flagged, "Flagged users");
        }

        let mut interval = self.config.current().await?.check_interval();
        let mut deadline = Instant::now();

        loop {
            select! {
                biased;
                () = cancel.cancelled() => break,
                () = cycle_trigger(&mut sigusr1, deadline) => {},
            }

            let result = select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Detection cycle cancelled");
                    break;
                },
                result = self.run_cycle() => result,
            };

            if let Err(err) = result {
                error!("Detection cycle failed: {err:#}");
                let message = format!("Detection cycle failed: {err:#}");
                self.notifier.log(escape_html(&message));
            }

            match self.config.current().await {
                Ok(config) => interval = config.check_interval(),
                Err(err) => warn!("Keeping check interval of {interval:?}: {err:#}"),
            }
            deadline = Instant::now() + interval;
        }

        Ok(())
    }

    /// One detection cycle. If the user directory cannot be fetched the cycle
    /// stops before draining, so the window's sightings carry over.
    #[instrument(skip_all)]
    pub(crate) async fn run_cycle(&self) -> anyhow::Result<CycleOutcome> {
        let config = self.config.current().await?;
        let settings = config.limit_settings()?;

        let known_users = self
            .panel
            .list_users(config.owner_username.as_deref())
            .await
            .context("Failed to fetch panel users")?
            .into_iter()
            .map(|user| user.name)
            .collect::<HashSet<_>>();

        let reports = self.window.drain(Some(&known_users)).await;

        for message in summary::active_ip_messages(&reports) {
            self.notifier.log(message);
        }

        let webhook = self.webhook(config.webhook_url.clone());
        let outcome = LimitEngine::new(
            self.panel,
            self.store,
            self.disabled_users,
            self.notifier,
            webhook.as_ref(),
        )
        .run_cycle(&reports, &settings)
        .await?;

        info!(
            active = reports.len(),
            flagged = outcome.flagged.len(),
            escalated = outcome.escalated.len(),
            recovered = outcome.recovered.len(),
            disabled = outcome.disabled.len(),
            failed = outcome.enforcement_failures.len(),
            "Detection cycle complete"
        );

        Ok(outcome)
    }

    /// Periodically re-enable users disabled by enforcement, every
    /// `TIME_TO_ACTIVE_USERS` seconds while that is configured.
    pub(crate) async fn reenable_loop(&self, cancel: &CancellationToken) {
        loop {
            let wait = match self.config.current().await {
                Ok(config) => config.reenable_after(),
                Err(err) => {
                    warn!("Config unavailable for re-enable round: {err:#}");
                    None
                }
            };

            let Some(wait) = wait else {
                select! {
                    () = cancel.cancelled() => break,
                    () = sleep(REENABLE_RECHECK) => {},
                }
                continue;
            };

            select! {
                () = cancel.cancelled() => break,
                () = sleep(wait) => {},
            }

            let webhook = match self.config.current().await {
                Ok(config) => self.webhook(config.webhook_url.clone()),
                Err(_) => None,
            };

            let round = reenable_disabled_users(
                self.panel,
                self.disabled_users,
                webhook.as_ref(),
                self.notifier,
            );

            select! {
                () = cancel.cancelled() => break,
                result = round => match result {
                    Ok(0) => debug!("No users to re-enable"),
                    Ok(count) => info!(count, "Re-enabled users"),
                    Err(err) => error!("Re-enable round failed: {err}"),
                },
            }
        }
    }

    fn webhook(&self, url: Option<url::Url>) -> Option<Webhook> {
        url.map(|url| Webhook::new(self.http.clone(), url))
    }
}

async fn cycle_trigger(sigusr1: &mut Signal, deadline: Instant) {
    select! {
        () = sleep_until(deadline) => {},
        _ = sigusr1.recv() => info!("Received SIGUSR1, running detection cycle now"),
    }
}
