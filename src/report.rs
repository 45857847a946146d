//! Categorized status lines for everything a run does.

use std::fmt;

use tracing::{error, info, warn};

use crate::error::MailstashError;
use crate::writer::WriteOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Html,
    Pdf,
    Attachment(String),
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Html => write!(f, "HTML"),
            ArtifactKind::Pdf => write!(f, "PDF"),
            ArtifactKind::Attachment(name) => write!(f, "attachment {name}"),
        }
    }
}

pub fn success(text: &str) {
    info!(status = "success", "{text}");
}

pub fn warning(text: &str) {
    warn!(status = "warning", "{text}");
}

pub fn failure(text: &str) {
    error!(status = "error", "{text}");
}

/// Report the outcome of one artifact write for message `id`.
pub fn artifact(kind: &ArtifactKind, id: u32, outcome: &Result<WriteOutcome, MailstashError>) {
    match outcome {
        Ok(WriteOutcome::Written(_)) => success(&format!("Created {kind} of #{id}")),
        Ok(WriteOutcome::AlreadyExists(_)) => warning(&format!("{kind} of #{id} already exists")),
        Err(e) => failure(&format!("Failed to write {kind} of #{id}: {e}")),
    }
}
