use std::path::PathBuf;

use clap::Args;

#[derive(Debug, Args)]
pub(crate) struct GlobalOpts {
    /// Path to the JSON config file
    ///
    /// Limits, exceptions, the check interval, the webhook and the Telegram
    /// message mode are re-read whenever the file changes. Panel credentials
    /// are read once at start-up.
    #[arg(short, long, env = "IPGUARD_CONFIG", default_value = "config.json")]
    pub(crate) config: PathBuf,

    /// Where flagged users are persisted between cycles and restarts
    #[arg(
        long,
        env = "IPGUARD_DETECTION_STORE",
        default_value = "detected_users.json"
    )]
    pub(crate) detection_store: PathBuf,

    /// Where users disabled by enforcement are tracked until re-enabled
    #[arg(
        long,
        env = "IPGUARD_DISABLED_USERS",
        default_value = "disabled_users.json"
    )]
    pub(crate) disabled_users: PathBuf,
}
