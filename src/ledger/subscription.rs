use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use tracing::debug;

use super::{LedgerClient, LedgerEvent, LedgerResult};

/// Cursor over finalized ledger events.
///
/// An event at height `h` is delivered once `head - h + 1 >= finality_depth`.
/// Restarting from an earlier height re-delivers events; consumers dedup by
/// event id.
#[derive(Debug, Clone)]
pub struct EventSubscription {
    next_height: u64,
    finality_depth: u64,
    page_size: u64,
    poll_interval: Duration,
}

impl EventSubscription {
    pub fn new(finality_depth: u64) -> Self {
        Self::from_height(1, finality_depth)
    }

    /// Resume delivery at `height` (inclusive).
    pub fn from_height(height: u64, finality_depth: u64) -> Self {
        Self {
            next_height: height.max(1),
            finality_depth: finality_depth.max(1),
            page_size: 64,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Next height that has not been delivered yet.
    pub fn height(&self) -> u64 {
        self.next_height
    }

    /// Highest height that is final given the current head.
    fn finalized_tip(&self, head: u64) -> Option<u64> {
        let tip = (head + 1).checked_sub(self.finality_depth)?;
        (tip >= 1).then_some(tip)
    }

    /// Fetch the next page of finalized events and advance the cursor.
    ///
    /// An empty batch means the cursor has caught up with finality.
    pub async fn next_batch(&mut self, ledger: &dyn LedgerClient) -> LedgerResult<Vec<LedgerEvent>> {
        loop {
            let head = ledger.head_height().await?;
            let Some(tip) = self.finalized_tip(head) else {
                return Ok(Vec::new());
            };
            if self.next_height > tip {
                return Ok(Vec::new());
            }
            let to = tip.min(self.next_height + self.page_size - 1);
            let events = ledger.events_in_range(self.next_height, to).await?;
            debug!(from = self.next_height, to, count = events.len(), "Fetched finalized events");
            self.next_height = to + 1;
            if !events.is_empty() {
                return Ok(events);
            }
        }
    }

    /// Infinite stream of finalized events.
    ///
    /// Sleeps for the poll interval whenever it catches up. Ledger errors are
    /// yielded without ending the stream; the cursor does not advance past them.
    pub fn into_stream(
        self,
        ledger: Arc<dyn LedgerClient>,
    ) -> impl Stream<Item = LedgerResult<LedgerEvent>> + Send {
        let buffered: std::collections::VecDeque<LedgerEvent> = Default::default();
        stream::unfold((self, ledger, buffered), |(mut sub, ledger, mut buffered)| async move {
            loop {
                if let Some(event) = buffered.pop_front() {
                    return Some((Ok(event), (sub, ledger, buffered)));
                }
                match sub.next_batch(ledger.as_ref()).await {
                    Ok(events) if events.is_empty() => {
                        tokio::time::sleep(sub.poll_interval).await;
                    }
                    Ok(events) => buffered.extend(events),
                    Err(err) => {
                        tokio::time::sleep(sub.poll_interval).await;
                        return Some((Err(err), (sub, ledger, buffered)));
                    }
                }
            }
        })
    }
}
