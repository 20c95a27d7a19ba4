//! Fetch-then-acknowledge message synchronization.
//!
//! [`MessageSync`] ties an acknowledgment to the exact batch that was just
//! fetched and delivered, never to a running counter, so the service only
//! forgets messages the consumer has actually been handed. Marks sent within
//! one session never decrease.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::api::{ApiError, FetchError};
use crate::message::{high_water_mark, Message};
use crate::session::DeviceCredentials;

/// Remote message queue for one device.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns all pending messages in service order.
    async fn fetch_messages(
        &self,
        device: &DeviceCredentials,
    ) -> Result<Vec<Message>, FetchError>;

    /// Deletes every message with a relative id at or below `highest_id`.
    async fn acknowledge(
        &self,
        device: &DeviceCredentials,
        highest_id: u64,
    ) -> Result<(), ApiError>;
}

/// Highest relative id acknowledged so far in this session.
///
/// Shared between on-demand syncs and the notification stream so neither
/// can send a mark below the other's. The lock is held across the
/// acknowledge request, so concurrent acknowledgments reach the service
/// one at a time and in increasing order.
#[derive(Clone, Debug, Default)]
pub struct HighWaterMark(Arc<Mutex<u64>>);

impl HighWaterMark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for any acknowledgment in flight, then reads the mark.
    pub async fn get(&self) -> u64 {
        *self.0.lock().await
    }
}

/// Failure while syncing messages into the delivery queue.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("acknowledging messages failed: {0}")]
    Acknowledge(#[source] ApiError),

    #[error("delivery queue is closed")]
    QueueClosed,
}

/// Fetches, delivers and acknowledges messages for one device.
#[derive(Clone)]
pub struct MessageSync {
    store: Arc<dyn MessageStore>,
    device: DeviceCredentials,
    acknowledged: HighWaterMark,
}

impl MessageSync {
    pub fn new(
        store: Arc<dyn MessageStore>,
        device: DeviceCredentials,
        acknowledged: HighWaterMark,
    ) -> Self {
        Self {
            store,
            device,
            acknowledged,
        }
    }

    pub fn device(&self) -> &DeviceCredentials {
        &self.device
    }

    pub async fn fetch(&self) -> Result<Vec<Message>, FetchError> {
        self.store.fetch_messages(&self.device).await
    }

    /// Acknowledges everything up to the highest relative id in `messages`.
    ///
    /// Returns the mark that was sent, or `None` when the batch would not
    /// move the high-water mark and no request was made.
    pub async fn acknowledge_through(
        &self,
        messages: &[Message],
    ) -> Result<Option<u64>, ApiError> {
        self.acknowledge_up_to(high_water_mark(messages)).await
    }

    /// Acknowledges an explicit relative id, subject to the same rule as
    /// [`MessageSync::acknowledge_through`].
    pub async fn acknowledge_up_to(&self, highest_id: u64) -> Result<Option<u64>, ApiError> {
        let mut acknowledged = self.acknowledged.0.lock().await;
        let previous = *acknowledged;
        if highest_id == 0 || highest_id <= previous {
            debug!(event = "acknowledge_skipped", highest_id, previous);
            return Ok(None);
        }

        self.store.acknowledge(&self.device, highest_id).await?;
        *acknowledged = highest_id;
        Ok(Some(highest_id))
    }

    /// Runs one full sync: fetch, push every message onto `queue` in fetch
    /// order, then acknowledge the batch.
    ///
    /// Pushing waits for queue capacity, so a slow consumer stalls the
    /// caller rather than losing messages. Returns the number delivered.
    pub async fn deliver(&self, queue: &mpsc::Sender<Message>) -> Result<usize, SyncError> {
        let messages = self.fetch().await?;
        let count = messages.len();
        let mark = high_water_mark(&messages);

        for message in messages {
            queue.send(message).await.map_err(|_| SyncError::QueueClosed)?;
        }

        self.acknowledge_up_to(mark)
            .await
            .map_err(SyncError::Acknowledge)?;
        debug!(event = "sync_delivered", count, mark);
        Ok(count)
    }
}
