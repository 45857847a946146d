use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::info;

use crate::archive::{ArchiveOutcome, Archiver};
use crate::client::MailTransport;
use crate::error::Result;
use crate::report;
use crate::session::MailboxSession;

/// Per-run tally of archive outcomes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub dispatched: usize,
    pub archived: usize,
    pub planned: usize,
    pub rejected: usize,
    pub failed: usize,
    pub artifacts_written: usize,
    pub artifacts_existing: usize,
    pub artifacts_failed: usize,
}

impl RunStats {
    fn record(&mut self, outcome: &ArchiveOutcome) {
        match outcome {
            ArchiveOutcome::Archived {
                written,
                existing,
                failed,
                ..
            } => {
                self.archived += 1;
                self.artifacts_written += written;
                self.artifacts_existing += existing;
                self.artifacts_failed += failed;
            }
            ArchiveOutcome::Planned { .. } => self.planned += 1,
            ArchiveOutcome::Rejected { .. } => self.rejected += 1,
            ArchiveOutcome::DecodeFailed | ArchiveOutcome::DirectoryFailed => self.failed += 1,
        }
    }
}

/// Drive `session` to completion, archiving every dispatched message on a
/// blocking worker. Dispatched messages are always archived to the end, even
/// when the fetch stream fails part way.
pub async fn archive_mailbox<T: MailTransport>(
    session: &mut MailboxSession<T>,
    archiver: Arc<Archiver>,
) -> Result<RunStats> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message("Archiving messages");

    let mut tasks = JoinSet::new();
    let result = session
        .run_observed(
            |range| pb.set_length(u64::from(range.len())),
            |raw| {
                let archiver = Arc::clone(&archiver);
                tasks.spawn_blocking(move || archiver.archive(&raw));
            },
        )
        .await;

    let mut stats = RunStats::default();
    while let Some(joined) = tasks.join_next().await {
        stats.dispatched += 1;
        match joined {
            Ok(outcome) => stats.record(&outcome),
            Err(e) => {
                report::failure(&format!("Archive worker died: {e}"));
                stats.failed += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        dispatched = stats.dispatched,
        archived = stats.archived,
        rejected = stats.rejected,
        failed = stats.failed,
        written = stats.artifacts_written,
        existing = stats.artifacts_existing,
        "run finished"
    );

    result.map(|_| stats)
}
