use std::fmt;
use std::future::Future;

use futures::StreamExt;
use tracing::debug;

use crate::client::{ImapTransport, MailTransport};
use crate::config::Settings;
use crate::error::{MailstashError, Result};
use crate::message::RawMessage;
use crate::report;

pub const MAILBOX: &str = "INBOX";

/// How many of the most recent messages one run fetches.
pub const FETCH_WINDOW: u32 = 5;

/// Inclusive sequence-number interval fetched in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    pub start: u32,
    pub end: u32,
}

impl FetchRange {
    /// The last `FETCH_WINDOW` messages of a mailbox holding `total`, or
    /// nothing for an empty mailbox.
    pub fn for_total(total: u32) -> Option<Self> {
        if total == 0 {
            return None;
        }
        let start = total.saturating_sub(FETCH_WINDOW - 1).max(1);
        Some(Self { start, end: total })
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl fmt::Display for FetchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Fetching,
    Draining,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub total: u32,
    pub range: Option<FetchRange>,
    pub dispatched: usize,
}

/// One connection, one fetch, one dispatch per message.
pub struct MailboxSession<T> {
    transport: Option<T>,
    state: SessionState,
}

impl<T: MailTransport> Default for MailboxSession<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MailTransport> MailboxSession<T> {
    pub fn new() -> Self {
        Self {
            transport: None,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, to: SessionState) {
        debug!(from = ?self.state, to = ?to, "session state");
        self.state = to;
    }

    /// Wait for `connecting` to yield a logged-in transport.
    pub async fn connect<F>(&mut self, connecting: F) -> Result<()>
    where
        F: Future<Output = Result<T>>,
    {
        self.transition(SessionState::Connecting);
        match connecting.await {
            Ok(transport) => {
                self.transport = Some(transport);
                Ok(())
            }
            Err(e) => {
                self.transition(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Examine the mailbox, fetch the most recent messages and hand each one
    /// to `on_message` as it arrives. A stream error stops dispatch but
    /// leaves already dispatched messages alone.
    pub async fn run<F>(&mut self, on_message: F) -> Result<RunSummary>
    where
        F: FnMut(RawMessage),
    {
        self.run_observed(|_| {}, on_message).await
    }

    /// Like [`run`](Self::run), announcing the fetch range to `on_range`
    /// before the first message is dispatched.
    pub async fn run_observed<R, F>(
        &mut self,
        mut on_range: R,
        mut on_message: F,
    ) -> Result<RunSummary>
    where
        R: FnMut(FetchRange),
        F: FnMut(RawMessage),
    {
        let Some(mut transport) = self.transport.take() else {
            return Err(MailstashError::Connection(
                "session is not connected".to_string(),
            ));
        };

        let total = match transport.examine(MAILBOX).await {
            Ok(total) => total,
            Err(e) => {
                self.abort(transport).await;
                return Err(e);
            }
        };
        self.transition(SessionState::Ready);

        let Some(range) = FetchRange::for_total(total) else {
            report::warning(&format!("{MAILBOX} is empty!"));
            self.close(transport).await;
            return Ok(RunSummary {
                total,
                range: None,
                dispatched: 0,
            });
        };

        self.transition(SessionState::Fetching);
        debug!(%range, total, "fetching");
        on_range(range);
        let mut dispatched = 0;
        let mut failure = None;
        match transport.fetch(range).await {
            Ok(mut messages) => {
                while let Some(item) = messages.next().await {
                    match item {
                        Ok(raw) => {
                            dispatched += 1;
                            on_message(raw);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
            Err(e) => failure = Some(e),
        }

        if let Some(e) = failure {
            self.abort(transport).await;
            return Err(e);
        }

        self.close(transport).await;
        Ok(RunSummary {
            total,
            range: Some(range),
            dispatched,
        })
    }

    async fn close(&mut self, mut transport: T) {
        self.transition(SessionState::Draining);
        if let Err(e) = transport.logout().await {
            report::warning(&e.to_string());
        }
        self.transition(SessionState::Closed);
    }

    /// Give up on the session. The caller reports the error that caused it.
    async fn abort(&mut self, mut transport: T) {
        self.transition(SessionState::Failed);
        if let Err(e) = transport.logout().await {
            report::warning(&format!("Logout after failure: {e}"));
        }
    }
}

/// Open an authenticated IMAP session for `settings`.
pub async fn connect(settings: &Settings) -> Result<MailboxSession<ImapTransport>> {
    report::success("Open IMAP connection");
    let mut session = MailboxSession::new();
    session.connect(ImapTransport::connect(settings)).await?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_covers_the_five_most_recent() {
        assert_eq!(FetchRange::for_total(0), None);
        assert_eq!(FetchRange::for_total(1), Some(FetchRange { start: 1, end: 1 }));
        assert_eq!(FetchRange::for_total(3), Some(FetchRange { start: 1, end: 3 }));
        assert_eq!(FetchRange::for_total(5), Some(FetchRange { start: 1, end: 5 }));
        assert_eq!(FetchRange::for_total(6), Some(FetchRange { start: 2, end: 6 }));
        assert_eq!(
            FetchRange::for_total(1000),
            Some(FetchRange { start: 996, end: 1000 })
        );
    }

    #[test]
    fn range_matches_formula_for_all_totals() {
        for total in 1..=200u32 {
            let range = FetchRange::for_total(total).unwrap();
            assert_eq!(range.start, total.saturating_sub(4).max(1));
            assert_eq!(range.end, total);
            assert!(range.len() <= FETCH_WINDOW);
        }
    }

    #[test]
    fn range_renders_as_sequence_set() {
        assert_eq!(FetchRange::for_total(3).unwrap().to_string(), "1:3");
        assert_eq!(FetchRange::for_total(12).unwrap().to_string(), "8:12");
    }
}
