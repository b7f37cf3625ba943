mod admin;
mod config;
mod detection_store;
mod disabled_users;
mod global_opts;
mod ingest;
mod json_file;
pub(crate) mod limit_enforcement;
mod monitor;
mod notify;
mod observation;
mod panel;
mod poller;
mod summary;
mod telegram;
mod webhook;

use std::env;

use admin::{
    EnableAllCommand, NodesCommand, SetLimitCommand, handle_enable_all_command,
    handle_nodes_command, handle_set_limit_command,
};
use clap::{Parser, command};
use monitor::{MonitorCommand, handle_monitor_command};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Watch active IPs and disable users over their limit
    Monitor(MonitorCommand),

    /// Enable every user in the panel
    EnableAll(EnableAllCommand),

    /// List the panel's nodes
    Nodes(NodesCommand),

    /// Set a user's special IP limit in the config file
    SetLimit(SetLimitCommand),
}

fn setup_logging() {
    use std::io::IsTerminal;
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        fmt,
    };

    let color = std::io::stdout().is_terminal()
        && (match env::var("COLORTERM") {
            Ok(value) => value == "truecolor" || value == "24bit",
            _ => false,
        } || match env::var("TERM") {
            Ok(value) => value == "direct" || value == "truecolor",
            _ => false,
        });

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt = fmt().with_env_filter(env_filter);

    if color {
        fmt.event_format(fmt::format().pretty())
            .with_file(false)
            .with_line_number(false)
            .with_ansi(color)
            .init();
    } else {
        fmt.with_file(false)
            .with_line_number(false)
            .with_ansi(false)
            .init();
    }
}

fn setup_crypto() {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        debug!("TLS crypto provider already installed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    setup_logging();
    setup_crypto();

    match opts.command {
        Commands::Monitor(monitor_command) => {
            Box::pin(handle_monitor_command(monitor_command)).await?;
        }
        Commands::EnableAll(enable_all_command) => {
            handle_enable_all_command(enable_all_command).await?;
        }
        Commands::Nodes(nodes_command) => handle_nodes_command(nodes_command).await?,
        Commands::SetLimit(set_limit_command) => {
            handle_set_limit_command(set_limit_command).await?;
        }
    }

    Ok(())
}
