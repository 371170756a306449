use std::{collections::VecDeque, sync::Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{HlsError, HlsResult};

/// A downloaded segment waiting to be demuxed.
#[derive(Debug, Clone)]
pub(crate) struct QueuedSegment {
    pub(crate) sequence: u64,
    pub(crate) data: Bytes,
    /// `EXT-X-PROGRAM-DATE-TIME` of the segment.
    pub(crate) date_time: Option<DateTime<Utc>>,
}

/// FIFO between a stream downloader and its container processor.
///
/// Every push and pull wakes all current waiters once.
#[derive(Default)]
pub(crate) struct SegmentQueue {
    queue: Mutex<VecDeque<QueuedSegment>>,
    changed: Notify,
}

impl SegmentQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedSegment>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, segment: QueuedSegment) {
        self.lock().push_back(segment);
        self.changed.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Waits until the queue holds fewer than `n` segments.
    pub(crate) async fn wait_until_size_is_below(
        &self,
        n: usize,
        token: &CancellationToken,
    ) -> HlsResult<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.len() < n {
                return Ok(());
            }

            tokio::select! {
                _ = notified => {}
                _ = token.cancelled() => return Err(HlsError::Terminated),
            }
        }
    }

    /// Removes the oldest segment, waiting for one to be pushed.
    pub(crate) async fn pull(&self, token: &CancellationToken) -> HlsResult<QueuedSegment> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let segment = self.lock().pop_front();
            if let Some(segment) = segment {
                self.changed.notify_waiters();
                return Ok(segment);
            }

            tokio::select! {
                _ = notified => {}
                _ = token.cancelled() => return Err(HlsError::Terminated),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    fn segment(sequence: u64) -> QueuedSegment {
        QueuedSegment {
            sequence,
            data: Bytes::from_static(b"data"),
            date_time: None,
        }
    }

    #[tokio::test]
    async fn test_pull_waits_for_push() -> anyhow::Result<()> {
        let queue = Arc::new(SegmentQueue::new());
        let token = CancellationToken::new();

        let puller = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.pull(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(segment(3));

        let pulled = puller.await??;
        assert_eq!(pulled.sequence, 3);
        assert_eq!(queue.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_until_size_is_below() -> anyhow::Result<()> {
        let queue = Arc::new(SegmentQueue::new());
        let token = CancellationToken::new();
        queue.push(segment(1));
        queue.push(segment(2));

        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.wait_until_size_is_below(2, &token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        assert_eq!(queue.pull(&token).await?.sequence, 1);
        tokio::time::timeout(Duration::from_secs(1), waiter).await???;
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation() {
        let queue = SegmentQueue::new();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            queue.pull(&token).await,
            Err(HlsError::Terminated)
        ));
    }
}
