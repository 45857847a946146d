use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[clap(
    name = "mailstash",
    about = "Archive the most recent INBOX messages as HTML, PDF and attachments"
)]
pub struct CliArgs {
    /// Path to a TOML config file (defaults to ~/.config/mailstash/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Archive root directory, overrides MAIL_STORAGE_PATH
    #[arg(long)]
    pub target: Option<String>,

    /// Regular expression the sender must match, overrides EMAIL_FROM_REGEX
    #[arg(long)]
    pub sender_filter: Option<String>,

    /// Don't write anything to disk
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}
