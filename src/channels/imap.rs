//! IMAP mailbox source.
//!
//! Speaks a minimal subset of IMAP4rev1 over TLS (rustls + webpki roots):
//! LOGIN, SELECT, UID SEARCH, UID FETCH with BODY.PEEK[] (so fetching never
//! sets `\Seen`), UID STORE, LOGOUT. The protocol is blocking, so every
//! session operation runs on the blocking pool with the session moved in
//! and back out.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::channels::MessageSource;
use crate::config::MailboxConfig;
use crate::error::SourceError;
use crate::pipeline::types::RawMessage;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

// ── Protocol session ────────────────────────────────────────────────

/// A tagged command's complete response.
#[derive(Debug, Default)]
struct Response {
    /// Untagged (`* ...`) and continuation lines, CRLF stripped.
    untagged: Vec<String>,
    /// Literal payloads (`{N}` blocks) in arrival order.
    literals: Vec<Vec<u8>>,
    /// `OK`, `NO`, or `BAD`.
    status: String,
    /// Text after the status on the tagged line.
    text: String,
}

/// Synchronous IMAP session over any byte stream.
pub struct ImapSession<S: Read + Write> {
    reader: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    /// Wrap a stream and consume the server greeting.
    pub fn start(stream: S) -> Result<Self, SourceError> {
        let mut session = Self {
            reader: BufReader::new(stream),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        let greeting = greeting.trim_end();
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(SourceError::Protocol(format!(
                "unexpected greeting: {greeting}"
            )));
        }
        Ok(session)
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<(), SourceError> {
        let command = format!("LOGIN {} {}", quote(username), quote(password));
        let response = self.command(&command)?;
        if response.status != "OK" {
            return Err(SourceError::AuthFailed {
                user: username.to_string(),
            });
        }
        Ok(())
    }

    pub fn select(&mut self, mailbox: &str) -> Result<(), SourceError> {
        let response = self.command(&format!("SELECT {}", quote(mailbox)))?;
        expect_ok("SELECT", &response)
    }

    /// UIDs of unseen messages received on or after `since`.
    pub fn search_unseen_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, SourceError> {
        let command = format!("UID SEARCH UNSEEN SINCE {}", since.format("%d-%b-%Y"));
        let response = self.command(&command)?;
        expect_ok("UID SEARCH", &response)?;

        let uids = response
            .untagged
            .iter()
            .filter_map(|line| line.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|uid| uid.parse::<u32>().ok())
            .collect();
        Ok(uids)
    }

    /// Full message bytes, without touching flags. `None` when the server
    /// returned no body (message expunged meanwhile).
    pub fn fetch_peek(&mut self, uid: u32) -> Result<Option<Vec<u8>>, SourceError> {
        let response = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        expect_ok("UID FETCH", &response)?;
        Ok(response.literals.into_iter().next())
    }

    pub fn mark_seen(&mut self, uid: u32) -> Result<(), SourceError> {
        let response = self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
        expect_ok("UID STORE", &response)
    }

    pub fn logout(&mut self) -> Result<(), SourceError> {
        let response = self.command("LOGOUT")?;
        expect_ok("LOGOUT", &response)
    }

    fn command(&mut self, command: &str) -> Result<Response, SourceError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        stream.flush()?;

        let prefix = format!("{tag} ");
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            if let Some(rest) = line.strip_prefix(&prefix) {
                let rest = rest.trim_end();
                let (status, text) = rest.split_once(' ').unwrap_or((rest, ""));
                response.status = status.to_ascii_uppercase();
                response.text = text.to_string();
                return Ok(response);
            }

            if let Some(size) = literal_size(&line) {
                let mut literal = vec![0u8; size];
                self.reader.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            response.untagged.push(line.trim_end().to_string());
        }
    }

    fn read_line(&mut self) -> Result<String, SourceError> {
        let mut buf = Vec::new();
        let read = self.reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Err(SourceError::Protocol("IMAP connection closed".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Size of a trailing `{N}` / `{N+}` literal marker.
fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let inner = trimmed.strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn expect_ok(command: &str, response: &Response) -> Result<(), SourceError> {
    if response.status == "OK" {
        Ok(())
    } else {
        Err(SourceError::Command {
            command: command.to_string(),
            reason: format!("{} {}", response.status, response.text),
        })
    }
}

/// Open TCP + TLS with bounded connect/read/write timeouts.
fn open_tls(host: &str, port: u16, timeout: Duration) -> Result<TlsStream, SourceError> {
    let addrs = (host, port).to_socket_addrs().map_err(|e| SourceError::Unreachable {
        host: host.to_string(),
        reason: e.to_string(),
    })?;

    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| SourceError::Unreachable {
        host: host.to_string(),
        reason: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses resolved".into()),
    })?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| SourceError::Tls(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| SourceError::Tls(e.to_string()))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

// ── MessageSource implementation ────────────────────────────────────

/// Mailbox source backed by an IMAP server.
pub struct ImapSource {
    config: MailboxConfig,
    session: Option<ImapSession<TlsStream>>,
}

impl ImapSource {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Run a blocking session operation on the blocking pool.
    ///
    /// The session is dropped after an I/O failure since the stream state
    /// is unknown; later calls then report `NotConnected`.
    async fn with_session<T, F>(&mut self, op: F) -> Result<T, SourceError>
    where
        F: FnOnce(&mut ImapSession<TlsStream>) -> Result<T, SourceError> + Send + 'static,
        T: Send + 'static,
    {
        let mut session = self.session.take().ok_or(SourceError::NotConnected)?;
        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await
        .map_err(|e| SourceError::Protocol(format!("IMAP task failed: {e}")))?;

        if !matches!(result, Err(SourceError::Io(_)) | Err(SourceError::Protocol(_))) {
            self.session = Some(session);
        }
        result
    }
}

#[async_trait]
impl MessageSource for ImapSource {
    fn name(&self) -> &str {
        &self.config.provider
    }

    async fn connect(&mut self) -> bool {
        if self.session.is_some() {
            return true;
        }

        let host = self.config.imap_host.clone();
        let port = self.config.imap_port;
        let timeout = self.config.timeout;
        let username = self.config.username.clone();
        let password = self.config.password.clone();
        let mailbox = self.config.mailbox.clone();

        let result = tokio::task::spawn_blocking(move || {
            let stream = open_tls(&host, port, timeout)?;
            let mut session = ImapSession::start(stream)?;
            session.login(&username, password.expose_secret())?;
            session.select(&mailbox)?;
            Ok::<_, SourceError>(session)
        })
        .await;

        match result {
            Ok(Ok(session)) => {
                info!(
                    host = %self.config.imap_host,
                    mailbox = %self.config.mailbox,
                    "Connected to mailbox"
                );
                self.session = Some(session);
                true
            }
            Ok(Err(e)) => {
                warn!(host = %self.config.imap_host, error = %e, "Mailbox connection failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "Mailbox connection task failed");
                false
            }
        }
    }

    async fn fetch_unread(&mut self, lookback: Duration) -> Vec<RawMessage> {
        let lookback = chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::days(3));
        let since = (Utc::now() - lookback).date_naive();

        let uids = match self
            .with_session(move |session| session.search_unseen_since(since))
            .await
        {
            Ok(uids) => uids,
            Err(e) => {
                warn!(error = %e, "Unread search failed");
                return Vec::new();
            }
        };
        debug!(count = uids.len(), since = %since, "Unread messages found");

        let mut messages = Vec::with_capacity(uids.len());
        for uid in uids {
            match self.with_session(move |session| session.fetch_peek(uid)).await {
                Ok(Some(bytes)) => {
                    let blob = String::from_utf8_lossy(&bytes);
                    messages.push(RawMessage::from_blob(
                        &uid.to_string(),
                        &self.config.provider,
                        &self.config.mailbox,
                        &blob,
                    ));
                }
                Ok(None) => warn!(uid, "Message has no body, skipping"),
                Err(SourceError::NotConnected) => {
                    warn!(uid, "Connection lost mid-batch, remaining messages deferred");
                    break;
                }
                Err(e) => warn!(uid, error = %e, "Failed to fetch message, skipping"),
            }
        }
        messages
    }

    async fn acknowledge(&mut self, source_id: &str) -> bool {
        if !self.config.mark_as_seen {
            debug!(uid = source_id, "Acknowledge disabled, leaving message unread");
            return true;
        }

        let Ok(uid) = source_id.parse::<u32>() else {
            warn!(uid = source_id, "Not an IMAP UID, cannot acknowledge");
            return false;
        };

        match self.with_session(move |session| session.mark_seen(uid)).await {
            Ok(()) => {
                debug!(uid, "Message marked as seen");
                true
            }
            Err(e) => {
                warn!(uid, error = %e, "Failed to mark message as seen");
                false
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.session.is_none() {
            return;
        }
        if let Err(e) = self.with_session(|session| session.logout()).await {
            debug!(error = %e, "Logout failed");
        }
        self.session = None;
    }
}
