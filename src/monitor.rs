use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Args;
use tokio::{
    select,
    signal::{
        self,
        unix::{SignalKind, signal},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::ConfigSource,
    detection_store::DetectionStore,
    disabled_users::DisabledUsers,
    global_opts::GlobalOpts,
    ingest::IngestListener,
    notify::Notifier,
    observation::ObservationWindow,
    panel::PanelClient,
    poller::Poller,
    telegram::TelegramBot,
};

#[derive(Args, Debug)]
pub(crate) struct MonitorCommand {
    #[clap(flatten)]
    global_opts: GlobalOpts,

    /// Unix socket the IP collector writes `<username> <ip>` lines to
    #[arg(
        short,
        long,
        env = "IPGUARD_INGEST_SOCKET",
        default_value = "/run/ipguard/ingest.sock"
    )]
    ingest_socket: PathBuf,
}

pub(crate) async fn handle_monitor_command(command: MonitorCommand) -> anyhow::Result<()> {
    let MonitorCommand {
        global_opts:
            GlobalOpts {
                config,
                detection_store,
                disabled_users,
            },
        ingest_socket,
    } = command;

    let config = ConfigSource::new(config);
    let initial = config.current().await?;
    debug!(path = %config.path().display(), general_limit = initial.general_limit, "Config loaded");

    let (notifier, notifications) = Notifier::channel();
    let panel = PanelClient::connect(&initial, notifier.clone())?;

    panel
        .acquire_token()
        .await
        .context("Failed to log in to the panel")?;

    let store = DetectionStore::open(&detection_store)
        .await
        .context("Failed to open detection store")?;
    let disabled_users = DisabledUsers::open(&disabled_users)
        .await
        .context("Failed to open disabled users list")?;

    let window = Arc::new(ObservationWindow::new());
    let cancel = CancellationToken::new();

    let ingest = IngestListener::bind(&ingest_socket)?;
    let ingest_task = tokio::spawn(ingest.run(Arc::clone(&window), cancel.clone()));

    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let telegram = TelegramBot::new(http.clone());
    let poller = Poller {
        config: &config,
        panel: &panel,
        window: &*window,
        store: &store,
        disabled_users: &disabled_users,
        notifier: &notifier,
        http: &http,
    };

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let shutdown = async {
        select! {
            _ = signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            () = cancel.cancelled() => {},
        }
        cancel.cancel();
    };

    let detection = async {
        let result = poller.run(&cancel).await;
        cancel.cancel();
        result
    };

    info!(
        panel = %initial.panel_domain,
        interval = ?initial.check_interval(),
        "IP limit monitor is ready"
    );
    notifier.log("IP limit monitor started");

    let (result, (), (), ()) = tokio::join!(
        detection,
        poller.reenable_loop(&cancel),
        telegram.run(&config, notifications, cancel.clone()),
        shutdown,
    );

    ingest_task.await.context("Ingest listener panicked")?;

    result
}
