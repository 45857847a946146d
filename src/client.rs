use async_trait::async_trait;
use chrono::Utc;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use tokio::net::TcpStream;
use tokio_native_tls::native_tls;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::debug;

use crate::config::Settings;
use crate::error::{MailstashError, Result};
use crate::message::RawMessage;
use crate::session::FetchRange;

/// Full message bytes without touching the \Seen flag, plus the server's
/// arrival date as a fallback timestamp.
const FETCH_QUERY: &str = "(INTERNALDATE BODY.PEEK[])";

/// What the mailbox session needs from a mail server connection.
#[async_trait]
pub trait MailTransport: Send {
    /// Open `mailbox` read-only and return how many messages it holds.
    async fn examine(&mut self, mailbox: &str) -> Result<u32>;

    /// Stream the messages in `range`, in whatever order the server sends them.
    async fn fetch<'a>(
        &'a mut self,
        range: FetchRange,
    ) -> Result<BoxStream<'a, Result<RawMessage>>>;

    async fn logout(&mut self) -> Result<()>;
}

trait ImapStream:
    futures::io::AsyncRead + futures::io::AsyncWrite + Unpin + Send + std::fmt::Debug
{
}
impl<T> ImapStream for T where
    T: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin + Send + std::fmt::Debug
{
}

pub struct ImapTransport {
    session: async_imap::Session<Box<dyn ImapStream>>,
}

impl ImapTransport {
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let tcp = TcpStream::connect((settings.host.as_str(), settings.port))
            .await
            .map_err(|e| {
                MailstashError::Connection(format!(
                    "cannot reach {}:{}: {e}",
                    settings.host, settings.port
                ))
            })?;

        let stream: Box<dyn ImapStream> = if settings.tls {
            let connector = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| MailstashError::Connection(format!("TLS setup failed: {e}")))?;
            let tls = tokio_native_tls::TlsConnector::from(connector)
                .connect(&settings.host, tcp)
                .await
                .map_err(|e| {
                    MailstashError::Connection(format!(
                        "TLS handshake with {} failed: {e}",
                        settings.host
                    ))
                })?;
            Box::new(tls.compat())
        } else {
            Box::new(tcp.compat())
        };

        let client = async_imap::Client::new(stream);
        let session = client
            .login(&settings.user, &settings.password)
            .await
            .map_err(|(e, _)| {
                MailstashError::Connection(format!("login failed for {}: {e}", settings.user))
            })?;
        debug!(host = %settings.host, user = %settings.user, "IMAP session established");

        Ok(Self { session })
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn examine(&mut self, mailbox: &str) -> Result<u32> {
        let mailbox = self.session.examine(mailbox).await.map_err(|e| {
            MailstashError::Connection(format!("cannot open {mailbox}: {e}"))
        })?;
        Ok(mailbox.exists)
    }

    async fn fetch<'a>(
        &'a mut self,
        range: FetchRange,
    ) -> Result<BoxStream<'a, Result<RawMessage>>> {
        let stream = self
            .session
            .fetch(range.to_string(), FETCH_QUERY)
            .await
            .map_err(|e| MailstashError::Fetch(e.to_string()))?;

        let messages = stream.filter_map(|item| {
            future::ready(match item {
                Ok(fetch) => match fetch.body() {
                    Some(body) => Some(Ok(RawMessage {
                        seq: fetch.message,
                        body: body.to_vec(),
                        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                    })),
                    // Unsolicited FETCH responses (flag updates) carry no body.
                    None => None,
                },
                Err(e) => Some(Err(MailstashError::Fetch(e.to_string()))),
            })
        });
        Ok(messages.boxed())
    }

    async fn logout(&mut self) -> Result<()> {
        self.session
            .logout()
            .await
            .map_err(|e| MailstashError::Connection(format!("logout failed: {e}")))
    }
}
