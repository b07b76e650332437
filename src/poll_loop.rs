use crate::criteria::CriteriaBuilder;
use crate::processor::{BatchSummary, MessageProcessor};
use crate::traits::MailboxSession;
use log::{debug, error, info};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs one search-and-process cycle. A failed search only aborts this cycle.
pub async fn run_cycle(
    mailbox: &mut dyn MailboxSession,
    processor: &MessageProcessor,
    criteria: &CriteriaBuilder,
) -> Option<BatchSummary> {
    let criteria = criteria.build();
    debug!("Search criteria: {:?}", criteria);

    let ids = match mailbox.search(&criteria).await {
        Ok(ids) => ids,
        Err(e) => {
            error!("Error searching for emails: {:?}", e);
            return None;
        }
    };

    info!("Search results: {:?}", ids);
    if ids.is_empty() {
        info!("No new unseen messages found");
        return Some(BatchSummary::default());
    }

    Some(processor.process_all(mailbox, &ids).await)
}

/// Searches once right away and then every `period` until `cancel` fires.
///
/// Each cycle is awaited before the next tick is taken, so two cycles never
/// touch the mailbox at the same time; ticks missed during a long cycle are
/// delayed rather than bunched up.
pub async fn run_poll_loop(
    mailbox: &mut dyn MailboxSession,
    processor: &MessageProcessor,
    criteria: &CriteriaBuilder,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cycles: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Poll loop cancelled after {} cycles", cycles);
                break;
            }
            _ = ticker.tick() => {}
        }

        cycles += 1;
        if cycles > 1 {
            info!("Polling for new messages...");
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Poll loop cancelled during cycle {}", cycles);
                break;
            }
            _ = run_cycle(mailbox, processor, criteria) => {}
        }
    }
}
