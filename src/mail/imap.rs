//! IMAP over implicit TLS.
//!
//! `ImapSession` is a small blocking client speaking just the commands the
//! poller needs. `ImapMailStore` adapts it to the async `MailStore` trait,
//! running each call on the blocking pool under a deadline and reusing one
//! authenticated session until `close_session`.

use std::collections::HashSet;
use std::io::{BufReader, Write as IoWrite};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::Config;
use crate::error::MailError;
use crate::mail::parse::{self, Response};
use crate::mail::{DeleteBatches, Envelope, FolderScanResult, FullMessage, MailStore, Uid};

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Connection settings for the IMAP server.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Socket timeout and per-call deadline.
    pub timeout: Duration,
}

impl From<&Config> for ImapConfig {
    fn from(config: &Config) -> Self {
        Self {
            host: config.imap_host.clone(),
            port: config.imap_port,
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.imap_timeout,
        }
    }
}

/// A blocking, authenticated IMAP session.
pub struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapSession {
    /// Connect, complete the TLS handshake, read the greeting and log in.
    pub fn open(config: &ImapConfig) -> Result<Self, MailError> {
        let mut session = Self::connect(config)?;
        session.login(&config.username, &config.password)?;
        Ok(session)
    }

    fn connect(config: &ImapConfig) -> Result<Self, MailError> {
        let connect_err = |reason: String| MailError::Connect {
            host: config.host.clone(),
            reason,
        };

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("no address resolved".into()))?;
        let tcp = TcpStream::connect_timeout(&addr, config.timeout)
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(config.timeout))?;
        tcp.set_write_timeout(Some(config.timeout))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| MailError::Tls(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailError::Tls(e.to_string()))?;

        let mut stream = BufReader::new(rustls::StreamOwned::new(conn, tcp));
        let greeting = parse::read_logical_line(&mut stream)?;
        if !greeting.text.to_ascii_uppercase().starts_with("* OK") {
            return Err(MailError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.text
            )));
        }

        Ok(Self {
            stream,
            next_tag: 1,
        })
    }

    fn login(&mut self, username: &str, password: &SecretString) -> Result<(), MailError> {
        let cmd = format!(
            "LOGIN {} {}",
            parse::quote(username),
            parse::quote(password.expose_secret())
        );
        let resp = self.command(&cmd)?;
        if !resp.is_ok() {
            return Err(MailError::Auth {
                username: username.to_string(),
            });
        }
        Ok(())
    }

    /// Send one tagged command and read its full response.
    fn command(&mut self, cmd: &str) -> Result<Response, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let line = format!("{tag} {cmd}\r\n");
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.flush()?;

        parse::read_response(&mut self.stream, &tag)
    }

    /// Like `command`, but a NO/BAD completion is an error.
    fn checked(&mut self, name: &str, cmd: &str) -> Result<Response, MailError> {
        let resp = self.command(cmd)?;
        if !resp.is_ok() {
            return Err(MailError::Command {
                command: name.to_string(),
                reason: resp.detail,
            });
        }
        Ok(resp)
    }

    pub fn noop(&mut self) -> Result<(), MailError> {
        self.checked("NOOP", "NOOP").map(|_| ())
    }

    pub fn logout(&mut self) -> Result<(), MailError> {
        self.command("LOGOUT").map(|_| ())
    }

    pub fn list(&mut self) -> Result<Vec<String>, MailError> {
        let resp = self.checked("LIST", "LIST \"\" \"*\"")?;
        Ok(resp.untagged.iter().filter_map(parse::parse_list).collect())
    }

    /// Select a folder, returning its message count.
    pub fn select(&mut self, folder: &str) -> Result<u32, MailError> {
        let resp = self.command(&format!("SELECT {}", parse::quote(folder)))?;
        if !resp.is_ok() {
            return Err(MailError::FolderSelect {
                folder: folder.to_string(),
                reason: resp.detail,
            });
        }
        Ok(resp.untagged.iter().find_map(parse::parse_exists).unwrap_or(0))
    }

    /// Create a folder; an existing folder is not an error.
    pub fn create(&mut self, folder: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("CREATE {}", parse::quote(folder)))?;
        let detail = resp.detail.to_ascii_lowercase();
        if resp.is_ok() || detail.contains("alreadyexists") || detail.contains("already exists") {
            return Ok(());
        }
        Err(MailError::Command {
            command: "CREATE".into(),
            reason: resp.detail,
        })
    }

    pub fn fetch_envelopes(&mut self, folder: &str) -> Result<Vec<Envelope>, MailError> {
        if self.select(folder)? == 0 {
            return Ok(Vec::new());
        }
        let resp = self.checked(
            "UID FETCH",
            "UID FETCH 1:* (UID FLAGS BODY.PEEK[HEADER.FIELDS (FROM SUBJECT MESSAGE-ID)])",
        )?;
        Ok(resp
            .untagged
            .iter()
            .filter_map(parse::parse_fetch)
            .map(|(uid, flags, headers)| {
                parse::envelope_from_headers(uid, flags, headers.unwrap_or_default())
            })
            .collect())
    }

    pub fn fetch_full(&mut self, folder: &str, uids: &[Uid]) -> Result<Vec<FullMessage>, MailError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(folder)?;
        let resp = self.checked(
            "UID FETCH",
            &format!("UID FETCH {} (UID BODY.PEEK[])", parse::uid_set(uids)),
        )?;

        let mut messages = Vec::new();
        for (uid, _, raw) in resp.untagged.iter().filter_map(parse::parse_fetch) {
            let Some(raw) = raw else { continue };
            match parse::full_message(uid, raw) {
                Some(msg) => messages.push(msg),
                None => tracing::warn!(folder = %folder, uid, "Failed to parse message"),
            }
        }
        Ok(messages)
    }

    /// Flag the messages `\Deleted` and expunge the folder.
    pub fn delete(&mut self, folder: &str, uids: &[Uid]) -> Result<(), MailError> {
        if uids.is_empty() {
            return Ok(());
        }
        self.select(folder)?;
        self.checked(
            "UID STORE",
            &format!("UID STORE {} +FLAGS.SILENT (\\Deleted)", parse::uid_set(uids)),
        )?;
        self.checked("EXPUNGE", "EXPUNGE")?;
        Ok(())
    }

    pub fn scan_for_senders(
        &mut self,
        folders: &[String],
        senders: &HashSet<String>,
    ) -> Result<Vec<FolderScanResult>, MailError> {
        let mut results = Vec::new();
        for folder in folders {
            let envelopes = match self.fetch_envelopes(folder) {
                Ok(envelopes) => envelopes,
                Err(e) if !e.breaks_session() => {
                    tracing::warn!(folder = %folder, error = %e, "Skipping folder");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let matched: Vec<Envelope> = envelopes
                .into_iter()
                .filter(|env| senders.contains(&env.from))
                .collect();
            if !matched.is_empty() {
                tracing::debug!(folder = %folder, count = matched.len(), "Matched senders");
                results.push(FolderScanResult {
                    folder: folder.clone(),
                    envelopes: matched,
                });
            }
        }
        Ok(results)
    }

    /// Delete per folder, continuing past failures. Returns the first error.
    pub fn delete_across_folders(&mut self, batches: &DeleteBatches) -> Result<(), MailError> {
        let mut first_err = None;
        for (folder, uids) in batches {
            if let Err(e) = self.delete(folder, uids) {
                tracing::warn!(folder = %folder, count = uids.len(), error = %e, "Delete failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// `MailStore` backed by a live IMAP server.
#[derive(Clone)]
pub struct ImapMailStore {
    config: Arc<ImapConfig>,
    session: Arc<Mutex<Option<ImapSession>>>,
}

impl ImapMailStore {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `op` against the shared session on the blocking pool.
    ///
    /// `units` scales the deadline for calls that walk several folders.
    async fn with_session<T, F>(&self, operation: &'static str, units: usize, op: F) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, MailError> + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        let session = Arc::clone(&self.session);

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = session
                .lock()
                .map_err(|_| MailError::TaskFailed("IMAP session lock poisoned".into()))?;

            let reusable = match guard.as_mut() {
                Some(existing) => existing.noop().is_ok(),
                None => false,
            };
            if !reusable {
                *guard = Some(ImapSession::open(&config)?);
                tracing::debug!(host = %config.host, "IMAP session opened");
            }
            let Some(active) = guard.as_mut() else {
                return Err(MailError::Protocol("no IMAP session".into()));
            };

            let result = op(active);
            if let Err(e) = &result
                && e.breaks_session()
            {
                *guard = None;
            }
            result
        });

        let after = self.config.timeout * u32::try_from(units.max(1)).unwrap_or(u32::MAX);
        match tokio::time::timeout(after, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(MailError::TaskFailed(join.to_string())),
            Err(_) => Err(MailError::Timeout {
                operation: operation.to_string(),
                after,
            }),
        }
    }
}

#[async_trait]
impl MailStore for ImapMailStore {
    async fn list_folders(&self) -> Result<Vec<String>, MailError> {
        self.with_session("list folders", 1, |s| s.list()).await
    }

    async fn ensure_folder(&self, name: &str) -> Result<(), MailError> {
        let name = name.to_string();
        self.with_session("create folder", 1, move |s| s.create(&name))
            .await
    }

    async fn fetch_envelopes(&self, folder: &str) -> Result<Vec<Envelope>, MailError> {
        let folder = folder.to_string();
        self.with_session("fetch envelopes", 1, move |s| s.fetch_envelopes(&folder))
            .await
    }

    async fn fetch_full(&self, folder: &str, uids: &[Uid]) -> Result<Vec<FullMessage>, MailError> {
        let folder = folder.to_string();
        let uids = uids.to_vec();
        self.with_session("fetch messages", 1, move |s| s.fetch_full(&folder, &uids))
            .await
    }

    async fn scan_for_senders(
        &self,
        folders: &[String],
        senders: &HashSet<String>,
    ) -> Result<Vec<FolderScanResult>, MailError> {
        let folders = folders.to_vec();
        let senders = senders.clone();
        self.with_session("scan folders", folders.len(), move |s| {
            s.scan_for_senders(&folders, &senders)
        })
        .await
    }

    async fn delete_by_uids(&self, folder: &str, uids: &[Uid]) -> Result<(), MailError> {
        if uids.is_empty() {
            return Ok(());
        }
        let folder = folder.to_string();
        let uids = uids.to_vec();
        self.with_session("delete messages", 1, move |s| s.delete(&folder, &uids))
            .await
    }

    async fn delete_across_folders(&self, batches: &DeleteBatches) -> Result<(), MailError> {
        if batches.is_empty() {
            return Ok(());
        }
        let batches = batches.clone();
        self.with_session("delete across folders", batches.len(), move |s| {
            s.delete_across_folders(&batches)
        })
        .await
    }

    async fn close_session(&self) {
        let session = Arc::clone(&self.session);
        let task = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = session.lock()
                && let Some(mut active) = guard.take()
            {
                let _ = active.logout();
            }
        });
        if tokio::time::timeout(self.config.timeout, task).await.is_err() {
            tracing::warn!("Timed out closing IMAP session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ImapConfig {
        ImapConfig {
            host: "127.0.0.1".into(),
            port: 1,
            username: "me@icloud.com".into(),
            password: SecretString::from("pw".to_string()),
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn config_from_service_config() {
        let cfg = Config::from_lookup(|key| match key {
            "ICLOUD_EMAIL" => Some("me@icloud.com".into()),
            "ICLOUD_APP_PASSWORD" => Some("pw".into()),
            "IMAP_TIMEOUT_SECS" => Some("5".into()),
            _ => None,
        })
        .unwrap();
        let imap = ImapConfig::from(&cfg);
        assert_eq!(imap.host, "imap.mail.me.com");
        assert_eq!(imap.port, 993);
        assert_eq!(imap.timeout, Duration::from_secs(5));
        assert_eq!(imap.password.expose_secret(), "pw");
    }

    #[tokio::test]
    async fn unreachable_server_is_connect_error() {
        let store = ImapMailStore::new(config());
        let err = store.list_folders().await.unwrap_err();
        assert!(matches!(err, MailError::Connect { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn empty_deletes_skip_the_network() {
        let store = ImapMailStore::new(config());
        store.delete_by_uids("INBOX", &[]).await.unwrap();
        store.delete_across_folders(&DeleteBatches::new()).await.unwrap();
    }

    #[tokio::test]
    async fn close_without_session_is_noop() {
        let store = ImapMailStore::new(config());
        store.close_session().await;
    }
}
