use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// UID of a message inside the currently selected mailbox.
///
/// Only meaningful for the session that returned it from a search.
pub type MessageId = u32;

/// Filters for one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCriteria {
    pub unseen_only: bool,
    /// Lower bound on the received time, `None` when historical mail is forwarded too.
    pub since: Option<DateTime<Utc>>,
    pub senders: Vec<String>,
    pub subject: String,
}

/// The parts of a fetched message the relay cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub received_at: DateTime<Utc>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
}

impl ParsedMessage {
    /// Preferred body: HTML when the message has an HTML part, otherwise plain text.
    pub fn body(&self) -> &str {
        self.body_html
            .as_deref()
            .or(self.body_text.as_deref())
            .unwrap_or_default()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailboxSession: Send {
    /// Opens the transport and authenticates
    async fn connect(&mut self) -> anyhow::Result<()>;

    /// Selects the mailbox every later command operates on
    async fn open_mailbox(&mut self, name: &str, read_only: bool) -> anyhow::Result<()>;

    /// Returns the ids of all messages currently matching `criteria`
    async fn search(&mut self, criteria: &SearchCriteria) -> anyhow::Result<Vec<MessageId>>;

    /// Retrieves and parses exactly one message
    async fn fetch(&mut self, id: MessageId) -> anyhow::Result<ParsedMessage>;

    /// Sets the \Seen flag on one message
    async fn mark_seen(&mut self, id: MessageId) -> anyhow::Result<()>;

    /// Closes the connection
    async fn logout(&mut self) -> anyhow::Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a pre-formatted message to a single destination chat
    async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;
}
