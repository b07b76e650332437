use crate::config::MailConfig;
use crate::traits::{MailboxSession, MessageId, ParsedMessage, SearchCriteria};
use async_imap::Session;
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use futures::io::{AsyncRead, AsyncWrite};
use log::{debug, error, info, warn};
use mail_parser::{MessageParser, PartType};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;

/// Anything async-imap can drive: a plain TCP stream or a TLS stream on top of one.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug {}

impl<T> ImapStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug {}

type ImapSession = Session<Box<dyn ImapStream>>;

/// Connection lifecycle as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connected, authenticated and a mailbox is selected
    Ready,
    /// A command or the connection failed; the session will be rebuilt on next use
    Error,
    /// The connection was closed
    End,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Ready => f.write_str("ready"),
            SessionEvent::Error => f.write_str("error"),
            SessionEvent::End => f.write_str("end"),
        }
    }
}

/// One long-lived IMAP connection scoped to a single selected mailbox.
pub struct ImapMailbox {
    config: MailConfig,
    timeout: Duration,
    session: Option<ImapSession>,
    // remembered so a dropped session can be rebuilt transparently
    selected: Option<(String, bool)>,
}

impl ImapMailbox {
    pub fn new(config: MailConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_seconds.max(1));
        Self {
            config,
            timeout,
            session: None,
            selected: None,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let mailbox = self.selected.as_ref().map_or("-", |(name, _)| name.as_str());
        match event {
            SessionEvent::Error => warn!(
                "[{}] IMAP session {} (mailbox {})",
                self.config.username, event, mailbox
            ),
            _ => info!(
                "[{}] IMAP session {} (mailbox {})",
                self.config.username, event, mailbox
            ),
        }
    }

    async fn open_connection(&self) -> anyhow::Result<ImapSession> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(
            "Connecting to IMAP server {} as {} (tls: {})",
            addr, self.config.username, self.config.use_tls
        );

        let tcp_stream = within(self.timeout, "TCP connect", async {
            TcpStream::connect(&addr)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", addr, e))
        })
        .await?;

        let stream: Box<dyn ImapStream> = if self.config.use_tls {
            let tls = TlsConnector::new();
            let tls_stream = within(self.timeout, "TLS handshake", async {
                tls.connect(&self.config.host, tcp_stream.compat())
                    .await
                    .map_err(|e| anyhow::anyhow!("TLS connection failed: {}", e))
            })
            .await?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp_stream.compat())
        };

        let client = async_imap::Client::new(stream);

        within(self.timeout, "IMAP login", async {
            client
                .login(&self.config.username, &self.config.password)
                .await
                .map_err(|e| anyhow::anyhow!("Login failed: {:?}", e.0))
        })
        .await
    }

    async fn select(&mut self, name: &str, read_only: bool) -> anyhow::Result<()> {
        let timeout = self.timeout;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("IMAP session is not connected"))?;

        within(timeout, "SELECT", async {
            let result = if read_only {
                session.examine(name).await
            } else {
                session.select(name).await
            };
            result.map_err(|e| anyhow::anyhow!("Failed to select mailbox {}: {}", name, e))
        })
        .await?;

        Ok(())
    }

    /// Returns the live session, rebuilding it after an earlier failure.
    async fn session(&mut self) -> anyhow::Result<&mut ImapSession> {
        if self.session.is_none() {
            let (name, read_only) = self
                .selected
                .clone()
                .ok_or_else(|| anyhow::anyhow!("No mailbox selected"))?;

            info!("[{}] Re-establishing IMAP session", self.config.username);
            self.session = Some(self.open_connection().await?);
            if let Err(e) = self.select(&name, read_only).await {
                self.session = None;
                return Err(e);
            }
            self.emit(SessionEvent::Ready);
        }

        self.session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("IMAP session is not connected"))
    }

    /// Drops the session when a command failed so the next call reconnects.
    fn discard_on_error<T>(&mut self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(e) = &result {
            error!("[{}] IMAP command failed: {:#}", self.config.username, e);
            self.session = None;
            self.emit(SessionEvent::Error);
        }
        result
    }

    async fn fetch_raw(&mut self, id: MessageId) -> anyhow::Result<Vec<u8>> {
        let timeout = self.timeout;
        let uid = id.to_string();
        let session = self.session().await?;

        // BODY.PEEK keeps the \Seen flag untouched
        let messages = within(timeout, "UID FETCH", async {
            session
                .uid_fetch(&uid, "BODY.PEEK[]")
                .await
                .map_err(|e| anyhow::anyhow!("Fetch failed for message {}: {}", uid, e))?
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| anyhow::anyhow!("Error reading fetch result: {}", e))
        })
        .await;

        let messages = self.discard_on_error(messages)?;

        messages
            .iter()
            .find_map(|message| message.body())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| anyhow::anyhow!("Message {} has no body or no longer exists", id))
    }
}

#[async_trait]
impl MailboxSession for ImapMailbox {
    async fn connect(&mut self) -> anyhow::Result<()> {
        let session = self.open_connection().await?;
        self.session = Some(session);
        info!("[{}] IMAP login successful", self.config.username);
        Ok(())
    }

    async fn open_mailbox(&mut self, name: &str, read_only: bool) -> anyhow::Result<()> {
        self.select(name, read_only).await?;
        self.selected = Some((name.to_string(), read_only));
        self.emit(SessionEvent::Ready);
        Ok(())
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> anyhow::Result<Vec<MessageId>> {
        let timeout = self.timeout;
        let query = criteria.to_imap_query();
        debug!("IMAP search query: {}", query);

        let session = self.session().await?;
        let result = within(timeout, "UID SEARCH", async {
            session
                .uid_search(&query)
                .await
                .map_err(|e| anyhow::anyhow!("Search failed: {}", e))
        })
        .await;

        let mut ids: Vec<MessageId> = self.discard_on_error(result)?.into_iter().collect();
        // the server reply is an unordered set
        ids.sort_unstable();
        Ok(ids)
    }

    async fn fetch(&mut self, id: MessageId) -> anyhow::Result<ParsedMessage> {
        let raw = self.fetch_raw(id).await?;
        parse_message(&raw).map_err(|e| anyhow::anyhow!("Message {}: {}", id, e))
    }

    async fn mark_seen(&mut self, id: MessageId) -> anyhow::Result<()> {
        let timeout = self.timeout;
        let uid = id.to_string();
        let session = self.session().await?;

        let result = within(timeout, "UID STORE", async {
            session
                .uid_store(&uid, "+FLAGS (\\Seen)")
                .await
                .map_err(|e| anyhow::anyhow!("Failed to mark message {} as seen: {}", uid, e))?
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| anyhow::anyhow!("Error reading store result: {}", e))
        })
        .await;

        self.discard_on_error(result)?;
        Ok(())
    }

    async fn logout(&mut self) -> anyhow::Result<()> {
        let timeout = self.timeout;
        if let Some(mut session) = self.session.take() {
            within(timeout, "LOGOUT", async {
                session
                    .logout()
                    .await
                    .map_err(|e| anyhow::anyhow!("Logout failed: {}", e))
            })
            .await?;
        }
        self.emit(SessionEvent::End);
        Ok(())
    }
}

async fn within<T, F>(timeout: Duration, what: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", what, timeout))?
}

/// Parses a raw RFC 5322 message into the fields the relay needs.
///
/// Messages without a usable `Date` header are stamped with the current time.
pub fn parse_message(raw: &[u8]) -> anyhow::Result<ParsedMessage> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| anyhow::anyhow!("unparseable message"))?;

    let received_at = message
        .date()
        .and_then(|date| DateTime::<Utc>::from_timestamp(date.to_timestamp(), 0))
        .unwrap_or_else(|| {
            warn!("Message has no valid Date header, using current time");
            Utc::now()
        });

    // mail-parser lists converted alternatives too, so only keep genuine parts
    let body_html = message.html_part(0).and_then(|part| match &part.body {
        PartType::Html(html) => Some(html.to_string()),
        _ => None,
    });
    let body_text = message.text_part(0).and_then(|part| match &part.body {
        PartType::Text(text) => Some(text.to_string()),
        _ => None,
    });

    if body_html.is_none() && body_text.is_none() {
        return Err(anyhow::anyhow!("message has no text or HTML body"));
    }

    Ok(ParsedMessage {
        received_at,
        body_html,
        body_text,
    })
}

#[cfg(test)]
mod imap_mailbox_tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn local_config(port: u16) -> MailConfig {
        MailConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: "user".to_string(),
            password: "pass".to_string(),
            use_tls: false,
            mailbox: "OTP".to_string(),
            read_only: false,
            timeout_seconds: 5,
        }
    }

    fn otp_criteria() -> SearchCriteria {
        SearchCriteria {
            unseen_only: true,
            since: None,
            senders: vec!["otp@example.com".to_string()],
            subject: "code".to_string(),
        }
    }

    /// Minimal IMAP server. The first connection is closed right after its
    /// SELECT; later connections answer normally. Every command is recorded
    /// as `<connection>: <command>`.
    async fn serve_imap(listener: TcpListener, commands: Arc<Mutex<Vec<String>>>) {
        let mut connection = 0;
        while let Ok((socket, _)) = listener.accept().await {
            connection += 1;
            let current = connection;
            let commands = commands.clone();

            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                if write.write_all(b"* OK IMAP4rev1 ready\r\n").await.is_err() {
                    return;
                }

                while let Ok(Some(line)) = lines.next_line().await {
                    let (tag, command) = line.split_once(' ').unwrap_or((line.as_str(), ""));
                    commands.lock().unwrap().push(format!("{}: {}", current, command));

                    let verb = command.to_ascii_uppercase();
                    let reply = if verb.starts_with("LOGIN") {
                        format!("{} OK LOGIN completed\r\n", tag)
                    } else if verb.starts_with("SELECT") || verb.starts_with("EXAMINE") {
                        format!(
                            "* 2 EXISTS\r\n* 0 RECENT\r\n* FLAGS (\\Seen)\r\n{} OK [READ-WRITE] SELECT completed\r\n",
                            tag
                        )
                    } else if verb.starts_with("UID SEARCH") {
                        format!("* SEARCH 7 3\r\n{} OK SEARCH completed\r\n", tag)
                    } else if verb.starts_with("LOGOUT") {
                        format!("* BYE logging out\r\n{} OK LOGOUT completed\r\n", tag)
                    } else {
                        format!("{} BAD unsupported\r\n", tag)
                    };

                    if write.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                    if current == 1 && verb.starts_with("SELECT") {
                        return;
                    }
                }
            });
        }
    }

    #[test]
    fn test_mailbox_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ImapMailbox>();
    }

    #[tokio::test]
    async fn test_dropped_session_reconnects_and_reselects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve_imap(listener, commands.clone()));

        let mut mailbox = ImapMailbox::new(local_config(port));
        mailbox.connect().await.unwrap();
        mailbox.open_mailbox("OTP", false).await.unwrap();

        // the server hung up after SELECT
        assert!(mailbox.search(&otp_criteria()).await.is_err());
        assert!(mailbox.session.is_none());

        let ids = mailbox.search(&otp_criteria()).await.unwrap();
        assert_eq!(ids, vec![3, 7]);
        let _ = mailbox.logout().await;

        let commands = commands.lock().unwrap();
        let second: Vec<&String> = commands.iter().filter(|c| c.starts_with("2: ")).collect();
        assert!(second[0].starts_with("2: LOGIN"));
        assert!(second[1].starts_with("2: SELECT") && second[1].contains("OTP"));
        assert!(second[2].starts_with("2: UID SEARCH"));
    }

    #[test]
    fn test_parse_html_message() {
        let raw = concat!(
            "From: Disney+ <disneyplus@mail.disneyplus.com>\r\n",
            "Subject: Your one-time passcode for Disney+\r\n",
            "Date: Mon, 2 Mar 2026 08:30:15 +0000\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Your code is 482913\r\n",
            "--b1\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<html><body><p>482913</p></body></html>\r\n",
            "--b1--\r\n",
        );

        let parsed = parse_message(raw.as_bytes()).unwrap();

        assert_eq!(
            parsed.received_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 15).unwrap()
        );
        assert!(parsed.body_html.as_deref().unwrap().contains("<p>482913</p>"));
        assert!(parsed.body_text.as_deref().unwrap().contains("Your code is 482913"));
        assert!(parsed.body().contains("<p>"));
    }

    #[test]
    fn test_parse_plain_text_message() {
        let raw = concat!(
            "From: otp@example.com\r\n",
            "Subject: code\r\n",
            "Date: Mon, 2 Mar 2026 10:00:00 +0200\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Use 123456 to log in.\r\n",
        );

        let parsed = parse_message(raw.as_bytes()).unwrap();

        assert_eq!(
            parsed.received_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
        );
        assert!(parsed.body_html.is_none());
        assert!(parsed.body().contains("123456"));
    }

    #[test]
    fn test_missing_date_falls_back_to_now() {
        let raw = "From: otp@example.com\r\nSubject: code\r\n\r\n999999\r\n";
        let before = Utc::now();

        let parsed = parse_message(raw.as_bytes()).unwrap();

        assert!(parsed.received_at >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_commands_require_selected_mailbox() {
        let mut mailbox = ImapMailbox::new(MailConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "user".to_string(),
            password: "pass".to_string(),
            use_tls: false,
            mailbox: "INBOX".to_string(),
            read_only: false,
            timeout_seconds: 1,
        });

        let criteria = SearchCriteria {
            unseen_only: true,
            since: None,
            senders: vec!["a@example.com".to_string()],
            subject: "s".to_string(),
        };

        let err = mailbox.search(&criteria).await.unwrap_err();
        assert!(err.to_string().contains("No mailbox selected"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // nothing listens on port 1
        let mut mailbox = ImapMailbox::new(MailConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "user".to_string(),
            password: "pass".to_string(),
            use_tls: false,
            mailbox: "INBOX".to_string(),
            read_only: false,
            timeout_seconds: 1,
        });

        assert!(mailbox.connect().await.is_err());
    }
}
