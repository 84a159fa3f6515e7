// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::BrokerError;
use crate::event::Event;
use crate::event_loop::GetRequest;

/// A group of events reserved for one consumer.
///
/// Call [`Batch::ack`] once the events are handled. Dropping a batch without acknowledging it
/// releases its slots all the same, but the broker logs the batch as released. The broker never
/// redelivers a batch.
pub struct Batch<T> {
    id: u64,
    events: Vec<Event<T>>,
    done: oneshot::Sender<()>,
}

impl<T> Batch<T> {
    pub(crate) fn new(id: u64, events: Vec<Event<T>>, done: oneshot::Sender<()>) -> Self {
        Self { id, events, done }
    }

    /// Position of this batch in the broker's reservation order.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event<T>] {
        &self.events
    }

    /// Moves the events out of the batch, leaving it empty but still acknowledgeable.
    pub fn take_events(&mut self) -> Vec<Event<T>> {
        std::mem::take(&mut self.events)
    }

    /// Marks the batch as handled. May be called from any task.
    pub fn ack(self) {
        trace!("Acknowledging batch {}", self.id);
        // The receiving side only disappears when the broker is gone.
        let _ = self.done.send(());
    }

    pub(crate) fn into_events(self) -> Vec<Event<T>> {
        self.events
    }
}

impl<T> fmt::Debug for Batch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("len", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Handle for reserving batches of events.
pub struct Consumer<T> {
    get_tx: mpsc::Sender<GetRequest<T>>,
    shutdown: CancellationToken,
    closed: bool,
}

impl<T> Consumer<T> {
    pub(crate) fn new(get_tx: mpsc::Sender<GetRequest<T>>, shutdown: CancellationToken) -> Self {
        Self {
            get_tx,
            shutdown,
            closed: false,
        }
    }

    /// Waits for a batch of at most `max` events (`0` for everything available).
    ///
    /// # Errors
    ///
    /// [`BrokerError::ConsumerClosed`] after [`Consumer::close`], [`BrokerError::Closed`] once the
    /// broker shuts down.
    pub async fn get(&self, max: usize) -> Result<Batch<T>, BrokerError> {
        if self.closed {
            return Err(BrokerError::ConsumerClosed);
        }
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = GetRequest {
            max,
            reply: reply_tx,
        };
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(BrokerError::Closed),
            sent = self.get_tx.send(request) => {
                if sent.is_err() {
                    return Err(BrokerError::Closed);
                }
            }
        }

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(BrokerError::Closed),
            batch = reply_rx => batch.map_err(|_| BrokerError::Closed),
        }
    }

    /// Detaches the consumer. Batches it already received stay valid and can still be acked.
    pub fn close(&mut self) {
        if !self.closed {
            debug!("Closing consumer");
            self.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn batch(payloads: &[u32]) -> (Batch<u32>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let events = payloads.iter().copied().map(Event::new).collect();
        (Batch::new(7, events, tx), rx)
    }

    #[test]
    fn test_batch_ack_signals_completion() {
        let (batch, mut done) = batch(&[1, 2]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.id(), 7);

        batch.ack();
        assert!(done.try_recv().is_ok());
    }

    #[test]
    fn test_dropped_batch_closes_completion() {
        let (batch, mut done) = batch(&[1]);
        drop(batch);
        assert_eq!(
            done.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        );
    }

    #[test]
    fn test_take_events_keeps_batch_ackable() {
        let (mut batch, mut done) = batch(&[1, 2, 3]);
        let events = batch.take_events();
        assert_eq!(events.len(), 3);
        assert!(batch.is_empty());

        batch.ack();
        assert!(done.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_closed_consumer_rejects_get() {
        let (get_tx, _get_rx) = mpsc::channel(1);
        let mut consumer: Consumer<u32> = Consumer::new(get_tx, CancellationToken::new());
        consumer.close();

        assert!(consumer.is_closed());
        assert_eq!(consumer.get(1).await.unwrap_err(), BrokerError::ConsumerClosed);
    }

    #[tokio::test]
    async fn test_get_fails_on_shutdown() {
        let (get_tx, _get_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let consumer: Consumer<u32> = Consumer::new(get_tx, shutdown.clone());

        let pending = tokio::spawn(async move { consumer.get(1).await });
        tokio::task::yield_now().await;
        shutdown.cancel();

        assert_eq!(pending.await.unwrap().unwrap_err(), BrokerError::Closed);
    }
}
