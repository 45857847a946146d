use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::Settings;
use crate::error::{MailstashError, Result};
use crate::message::{DecodedMessage, RawMessage};
use crate::perms::{self, Ownership};
use crate::render::Renderer;
use crate::report::{self, ArtifactKind};
use crate::writer::{self, WriteOutcome};

/// Partition levels (message, month, year) that get ownership applied.
const OWNED_LEVELS: usize = 3;

/// Upper bound for the subject part of a directory name, keeping the whole
/// component well under the usual 255 byte limit.
const MAX_SUBJECT_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived {
        target: PathBuf,
        written: usize,
        existing: usize,
        failed: usize,
    },
    /// Dry run: where the message would have gone.
    Planned { target: PathBuf },
    Rejected { sender: String },
    DecodeFailed,
    DirectoryFailed,
}

/// Archives single messages. Cheap to share between worker tasks.
pub struct Archiver {
    settings: Arc<Settings>,
    sender_filter: Regex,
    renderer: Arc<dyn Renderer>,
}

impl Archiver {
    pub fn new(settings: Arc<Settings>, renderer: Arc<dyn Renderer>) -> Result<Self> {
        let sender_filter = Regex::new(&settings.sender_filter)?;
        Ok(Self {
            settings,
            sender_filter,
            renderer,
        })
    }

    pub fn archive(&self, raw: &RawMessage) -> ArchiveOutcome {
        match DecodedMessage::parse(raw) {
            Ok(message) => self.archive_decoded(&message, raw.seq),
            Err(e) => {
                report::failure(&format!("Skipping message #{}: {e}", raw.seq));
                ArchiveOutcome::DecodeFailed
            }
        }
    }

    pub fn archive_decoded(&self, message: &DecodedMessage, id: u32) -> ArchiveOutcome {
        if !self.sender_filter.is_match(&message.sender) {
            report::warning(&format!(
                "Invalid email sender \"{}\"! Only allowed regex: \"{}\"",
                message.sender,
                self.sender_filter.as_str()
            ));
            return ArchiveOutcome::Rejected {
                sender: message.sender.clone(),
            };
        }

        let subject = self
            .settings
            .slug_with_subject
            .then_some(message.subject.as_str());
        let target = archive_target(&self.settings.archive_root, &message.date, id, subject);

        if self.settings.dry_run {
            tracing::info!(id, target = %target.display(), "dry run, nothing written");
            return ArchiveOutcome::Planned { target };
        }

        if let Err(e) = prepare_directory(&target, &self.settings.ownership, perms::secure_dir) {
            report::failure(&format!("Cannot archive message #{id}: {e}"));
            return ArchiveOutcome::DirectoryFailed;
        }

        let mut outcomes = Vec::new();
        if self.settings.generate_html {
            outcomes.push((
                ArtifactKind::Html,
                writer::write_html(&target, &message.html, &self.settings.ownership),
            ));
        }
        if self.settings.generate_pdf {
            outcomes.push((
                ArtifactKind::Pdf,
                writer::write_pdf(
                    &target,
                    &message.html,
                    self.renderer.as_ref(),
                    &self.settings.ownership,
                ),
            ));
        }
        if self.settings.save_attachments {
            tracing::info!(id, count = message.attachments.len(), "attachments");
            outcomes.extend(writer::write_attachments(
                &target,
                &message.attachments,
                &self.settings.ownership,
            ));
            let offset = message.attachments.len();
            for (index, broken) in message.broken_attachments.iter().enumerate() {
                let name = writer::attachment_file_name(&broken.filename, offset + index);
                outcomes.push((
                    ArtifactKind::Attachment(name),
                    Err(MailstashError::Decode(broken.reason.clone())),
                ));
            }
        }

        let (mut written, mut existing, mut failed) = (0, 0, 0);
        for (kind, outcome) in &outcomes {
            report::artifact(kind, id, outcome);
            match outcome {
                Ok(WriteOutcome::Written(_)) => written += 1,
                Ok(WriteOutcome::AlreadyExists(_)) => existing += 1,
                Err(_) => failed += 1,
            }
        }

        ArchiveOutcome::Archived {
            target,
            written,
            existing,
            failed,
        }
    }
}

/// Create the directory chain, then hand the partition directories to the
/// configured owner before anything is written into them. Directories this
/// call creates above the partitions (a fresh archive root) are handed over
/// too; pre-existing ones are left alone.
fn prepare_directory<F>(target: &Path, ownership: &Ownership, secure: F) -> Result<()>
where
    F: Fn(&Path, &Ownership) -> io::Result<()>,
{
    let created = target
        .ancestors()
        .take_while(|dir| !dir.as_os_str().is_empty() && !dir.exists())
        .count();

    fs::create_dir_all(target).map_err(|source| MailstashError::Directory {
        path: target.to_path_buf(),
        source,
    })?;

    if !ownership.is_configured() {
        return Ok(());
    }
    for dir in target.ancestors().take(created.max(OWNED_LEVELS)) {
        if let Err(source) = secure(dir, ownership) {
            if ownership.matches(dir).unwrap_or(false) {
                report::warning(&format!(
                    "Could not update permissions of {}: {source}",
                    dir.display()
                ));
                continue;
            }
            return Err(MailstashError::Directory {
                path: dir.to_path_buf(),
                source,
            });
        }
    }
    Ok(())
}

/// `<root>/<YYYY>/<MM>/<dd>_<HH>-<mm>-<ss>_ID-<id>[_<subject>]`
pub fn archive_target(
    root: &Path,
    date: &DateTime<Utc>,
    id: u32,
    subject: Option<&str>,
) -> PathBuf {
    let mut slug = format!("{}_ID-{id}", date.format("%d_%H-%M-%S"));
    if let Some(subject) = subject.map(sanitize_subject).filter(|s| !s.is_empty()) {
        slug.push('_');
        slug.push_str(&subject);
    }
    root.join(date.format("%Y").to_string())
        .join(date.format("%m").to_string())
        .join(slug)
}

fn sanitize_subject(subject: &str) -> String {
    let kept: String = subject
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || *c == ' ' || *c == '\'')
        .take(MAX_SUBJECT_LEN)
        .collect();
    kept.trim().to_string()
}
