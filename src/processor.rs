use crate::notifications::{self, DeliveryOutcome};
use crate::passcode::{self, MatchPolicy};
use crate::traits::{MailboxSession, MessageId, Notifier};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[cfg(test)]
#[path = "./processor_tests.rs"]
mod processor_tests;

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Notification attempted; `delivered` targets succeeded
    Notified { delivered: usize, marked_seen: bool },
    /// Received before the deploy time, left untouched
    TooOld,
}

/// Totals for one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub notified: usize,
    pub marked_seen: usize,
    pub skipped: usize,
}

/// Turns one fetched message into a notification.
pub struct MessageProcessor {
    notifier: Arc<dyn Notifier>,
    targets: Vec<String>,
    policy: MatchPolicy,
    mark_forwarded_seen: bool,
    not_before: Option<DateTime<Utc>>,
    // stay UNSEEN and keep matching the search, so only fetch them once
    too_old: Mutex<HashSet<MessageId>>,
}

impl MessageProcessor {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        targets: Vec<String>,
        policy: MatchPolicy,
        mark_forwarded_seen: bool,
    ) -> Self {
        Self {
            notifier,
            targets,
            policy,
            mark_forwarded_seen,
            not_before: None,
            too_old: Mutex::new(HashSet::new()),
        }
    }

    /// Skip messages received before `instant`. The IMAP SINCE filter only
    /// compares dates, so this tightens it to the exact time.
    pub fn with_not_before(mut self, instant: Option<DateTime<Utc>>) -> Self {
        self.not_before = instant;
        self
    }

    /// fetch -> extract -> notify -> optional mark seen, for exactly one message.
    pub async fn process(
        &self,
        mailbox: &mut dyn MailboxSession,
        id: MessageId,
    ) -> anyhow::Result<MessageOutcome> {
        if self.is_known_too_old(id) {
            debug!("Message {} already skipped as too old", id);
            return Ok(MessageOutcome::TooOld);
        }

        let message = mailbox.fetch(id).await?;

        if let Some(bound) = self.not_before.filter(|bound| message.received_at < *bound) {
            info!(
                "Message {} received at {} predates {}, skipping",
                id, message.received_at, bound
            );
            if let Ok(mut too_old) = self.too_old.lock() {
                too_old.insert(id);
            }
            return Ok(MessageOutcome::TooOld);
        }

        // the code itself only goes into the notification
        let passcode = passcode::extract(message.body(), self.policy);
        match &passcode {
            Some(_) => info!("Passcode extracted from message {}", id),
            None => warn!("No passcode found in message {}", id),
        }

        let text = notifications::format_notification(message.received_at, passcode.as_ref());
        let outcomes = notifications::deliver(self.notifier.as_ref(), &self.targets, &text).await;
        let delivered = outcomes.iter().filter(|o| o.is_success()).count();

        if delivered == 0 {
            return Err(delivery_error(id, &outcomes));
        }

        let mut marked_seen = false;
        if self.mark_forwarded_seen {
            info!("Marking message {} as seen", id);
            match mailbox.mark_seen(id).await {
                Ok(()) => {
                    info!("Message {} marked as seen", id);
                    marked_seen = true;
                }
                Err(e) => error!("Error marking message {} as seen: {:?}", id, e),
            }
        }

        Ok(MessageOutcome::Notified {
            delivered,
            marked_seen,
        })
    }

    fn is_known_too_old(&self, id: MessageId) -> bool {
        self.too_old
            .lock()
            .map(|too_old| too_old.contains(&id))
            .unwrap_or(false)
    }

    /// Processes `ids` strictly one after another in the given order. A
    /// failure on one message is logged and never stops the batch.
    pub async fn process_all(
        &self,
        mailbox: &mut dyn MailboxSession,
        ids: &[MessageId],
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for &id in ids {
            info!("Processing message {}", id);
            match self.process(mailbox, id).await {
                Ok(MessageOutcome::Notified {
                    delivered,
                    marked_seen,
                }) => {
                    summary.processed += 1;
                    summary.notified += 1;
                    if marked_seen {
                        summary.marked_seen += 1;
                    }
                    info!(
                        "Message {} forwarded to {}/{} chats",
                        id,
                        delivered,
                        self.targets.len()
                    );
                }
                Ok(MessageOutcome::TooOld) => {
                    summary.processed += 1;
                    summary.skipped += 1;
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("Failed to process message {}: {:?}", id, e);
                }
            }
        }

        info!(
            "Done processing {} messages ({} notified, {} failed, {} skipped)",
            ids.len(),
            summary.notified,
            summary.failed,
            summary.skipped
        );
        summary
    }
}

fn delivery_error(id: MessageId, outcomes: &[DeliveryOutcome]) -> anyhow::Error {
    let failed: Vec<&str> = outcomes.iter().map(|o| o.chat_id.as_str()).collect();
    anyhow::anyhow!(
        "Message {} could not be delivered to any chat ({})",
        id,
        failed.join(", ")
    )
}
