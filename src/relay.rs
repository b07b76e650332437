use crate::config::{AppConfig, MIN_POLL_INTERVAL_MS};
use crate::criteria::CriteriaBuilder;
use crate::imap_mailbox::ImapMailbox;
use crate::notifications::TelegramNotifier;
use crate::poll_loop::run_poll_loop;
use crate::processor::MessageProcessor;
use crate::telegram::TelegramClient;
use crate::traits::MailboxSession;
use chrono::{Local, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything one pipeline run needs, already wired together.
pub struct Relay {
    mailbox: Box<dyn MailboxSession>,
    processor: MessageProcessor,
    criteria: CriteriaBuilder,
    mailbox_name: String,
    read_only: bool,
    period: Duration,
}

impl Relay {
    /// Builds the production pipeline: IMAP in, Telegram out.
    pub fn from_config(config: &AppConfig) -> Self {
        let criteria = CriteriaBuilder::new(&config.filter, &config.polling, Utc::now());

        let client = TelegramClient::with_api_url(
            config.telegram.bot_token.clone(),
            config.telegram.api_url.clone(),
        );
        let processor = MessageProcessor::new(
            Arc::new(TelegramNotifier::new(client)),
            config.telegram.chat_ids.clone(),
            config.passcode.match_policy,
            config.polling.mark_forwarded_seen,
        );

        Self::new(
            Box::new(ImapMailbox::new(config.mail.clone())),
            processor,
            criteria,
            config,
        )
    }

    pub fn new(
        mailbox: Box<dyn MailboxSession>,
        processor: MessageProcessor,
        criteria: CriteriaBuilder,
        config: &AppConfig,
    ) -> Self {
        let since = criteria.build().since;
        let interval_ms = config.polling.interval_ms.max(MIN_POLL_INTERVAL_MS);
        if interval_ms != config.polling.interval_ms {
            warn!(
                "Polling interval {}ms is too short, using {}ms",
                config.polling.interval_ms, interval_ms
            );
        }

        Self {
            mailbox,
            processor: processor.with_not_before(since),
            criteria,
            mailbox_name: config.mail.mailbox.clone(),
            read_only: config.mail.read_only,
            period: Duration::from_millis(interval_ms),
        }
    }

    /// Connects, selects the mailbox and polls until `cancel` fires.
    ///
    /// Failing to connect or to open the mailbox ends the run with an error;
    /// nothing retries it here.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        match self.criteria.build().since {
            Some(_) => info!(
                "Deploy time: {} (only messages received after it are forwarded)",
                self.criteria.deploy_time().with_timezone(&Local)
            ),
            None => info!("Forwarding historical messages, no deploy time bound"),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Relay cancelled before the mailbox was ready");
                return Ok(());
            }
            result = self.mailbox.connect() => result?,
        }

        self.mailbox
            .open_mailbox(&self.mailbox_name, self.read_only)
            .await
            .map_err(|e| anyhow::anyhow!("Error opening {}: {}", self.mailbox_name, e))?;
        info!("{} opened, polling every {:?}", self.mailbox_name, self.period);

        run_poll_loop(
            self.mailbox.as_mut(),
            &self.processor,
            &self.criteria,
            self.period,
            cancel,
        )
        .await;

        if let Err(e) = self.mailbox.logout().await {
            error!("Error closing IMAP connection: {:?}", e);
        }
        info!("Connection ended");
        Ok(())
    }
}

/// Runs the production relay for `config` until `cancel` fires.
pub async fn run_relay(config: Arc<AppConfig>, cancel: CancellationToken) -> anyhow::Result<()> {
    Relay::from_config(&config).run(cancel).await
}
