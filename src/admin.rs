//! One-shot operator commands.

use anyhow::{Context as _, ensure};
use clap::Args;
use tracing::{info, warn};

use crate::{
    config::{self, ConfigSource},
    disabled_users::DisabledUsers,
    global_opts::GlobalOpts,
    notify::Notifier,
    panel::{PanelClient, PanelNode},
};

#[derive(Args, Debug)]
pub(crate) struct EnableAllCommand {
    #[clap(flatten)]
    global_opts: GlobalOpts,
}

#[derive(Args, Debug)]
pub(crate) struct NodesCommand {
    #[clap(flatten)]
    global_opts: GlobalOpts,
}

#[derive(Args, Debug)]
pub(crate) struct SetLimitCommand {
    #[clap(flatten)]
    global_opts: GlobalOpts,

    /// Panel username
    user: String,

    /// Number of concurrent IPs the user may use
    limit: usize,
}

/// Enable every user in the panel directory, including users disabled by
/// enforcement, which stop being tracked.
pub(crate) async fn handle_enable_all_command(command: EnableAllCommand) -> anyhow::Result<()> {
    let GlobalOpts {
        config,
        disabled_users,
        ..
    } = command.global_opts;

    let config = ConfigSource::new(config).current().await?;
    // One-shot commands have no notification delivery.
    let (notifier, _notifications) = Notifier::channel();
    let panel = PanelClient::connect(&config, notifier)?;
    let disabled_users = DisabledUsers::open(&disabled_users)
        .await
        .context("Failed to open disabled users list")?;

    let users = panel.list_users(config.owner_username.as_deref()).await?;

    let mut failed = Vec::new();
    for user in &users {
        match panel.set_user_enabled(&user.name, true).await {
            Ok(()) => disabled_users.remove(&user.name).await?,
            Err(err) => {
                warn!(user = %user.name, "{err}");
                failed.push(user.name.as_str());
            }
        }
    }

    info!(enabled = users.len() - failed.len(), total = users.len(), "Enabled users");
    ensure!(failed.is_empty(), "Failed to enable users: {}", failed.join(", "));

    Ok(())
}

pub(crate) async fn handle_nodes_command(command: NodesCommand) -> anyhow::Result<()> {
    let config = ConfigSource::new(command.global_opts.config).current().await?;
    let (notifier, _notifications) = Notifier::channel();
    let panel = PanelClient::connect(&config, notifier)?;

    for node in panel.list_nodes().await? {
        println!("{}", format_node(&node));
    }

    Ok(())
}

fn format_node(node: &PanelNode) -> String {
    let mut line = format!(
        "{:>4}  {:<20} {:<30} {}",
        node.id, node.name, node.address, node.status
    );
    if let Some(message) = node.message.as_deref().filter(|message| !message.is_empty()) {
        line.push_str("  ");
        line.push_str(message);
    }
    line
}

pub(crate) async fn handle_set_limit_command(command: SetLimitCommand) -> anyhow::Result<()> {
    let SetLimitCommand {
        global_opts: GlobalOpts { config, .. },
        user,
        limit,
    } = command;

    let updated = config::set_special_limit(&config, &user, limit).await?;

    // Make sure the edited file still loads before reporting success.
    ConfigSource::new(&config)
        .current()
        .await
        .context("Config file is invalid after the edit")?;

    if updated {
        info!(%user, limit, "Updated special limit");
    } else {
        info!(%user, limit, "Added special limit");
    }

    Ok(())
}
