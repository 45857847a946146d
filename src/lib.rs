pub mod archive;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod perms;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod session;
pub mod writer;

use std::sync::Arc;

use crate::archive::Archiver;
use crate::cli::CliArgs;
use crate::render::CommandRenderer;

pub async fn run(args: CliArgs) -> anyhow::Result<()> {
    let settings = Arc::new(config::load_settings(&args)?);
    let renderer = Arc::new(CommandRenderer::new(
        &settings.renderer,
        settings.page_format.as_str(),
    ));
    let archiver = Arc::new(Archiver::new(Arc::clone(&settings), renderer)?);

    let mut session = session::connect(&settings).await?;
    pipeline::archive_mailbox(&mut session, archiver).await?;
    Ok(())
}
