// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::ack_loop::AckLoop;
use crate::config::Settings;
use crate::consumer::Consumer;
use crate::error::BrokerError;
use crate::event::EntryId;
use crate::event_loop::{request_channels, EventLoop, MetricsRequest, RequestSenders};
use crate::producer::{AckCallback, Producer, ProducerConfig};

/// Point-in-time counters reported by the coordination loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerMetrics {
    /// Events currently held in the ring, reserved or not.
    pub event_count: usize,
    /// Ring capacity.
    pub event_limit: usize,
    /// Events handed to consumers and not yet acknowledged.
    pub unacked_consumed_events: usize,
    /// Events acknowledged since the broker started.
    pub acked_events: u64,
    /// Id of the oldest event not yet reclaimed, or the next id to assign when the ring is
    /// empty. Only advances as acknowledged events are reclaimed in order.
    pub oldest_entry_id: EntryId,
}

/// A bounded in-memory event broker.
///
/// Owns the coordination loop and the ACK loop. Producers and consumers are cheap handles onto
/// the broker's request queues; they keep working from any task until the broker is closed or
/// dropped.
pub struct Broker<T> {
    senders: RequestSenders<T>,
    shutdown: CancellationToken,
    wait_on_close: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Broker<T> {
    /// Starts a broker.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new(settings: &Settings) -> Self {
        Self::start(settings, None)
    }

    /// Starts a broker whose `observer` receives the size of every consolidated ACK report.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn with_ack_observer<F>(settings: &Settings, observer: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        Self::start(settings, Some(Arc::new(observer)))
    }

    fn start(settings: &Settings, observer: Option<AckCallback>) -> Self {
        let settings = settings.normalized();
        let shutdown = CancellationToken::new();

        let (senders, requests) = request_channels(settings.input_queue_size);
        // A single slot keeps ACK reports a rendezvous between the two loops.
        let (acks_tx, acks_rx) = mpsc::channel(1);
        let (scheduled_tx, scheduled_rx) = mpsc::channel(1);

        let event_loop = EventLoop::new(
            &settings,
            requests,
            acks_rx,
            scheduled_tx,
            shutdown.clone(),
        );
        let ack_loop = AckLoop::new(scheduled_rx, acks_tx, observer, shutdown.clone());

        let tasks = vec![tokio::spawn(event_loop.run()), tokio::spawn(ack_loop.run())];
        debug!(
            "Started broker with {} slots and request queues of {}",
            settings.events, settings.input_queue_size
        );

        Self {
            senders,
            shutdown,
            wait_on_close: settings.wait_on_close,
            tasks,
        }
    }
}

impl<T> Broker<T> {
    pub fn producer(&self, config: ProducerConfig) -> Producer<T> {
        Producer::new(&self.senders, self.shutdown.clone(), config)
    }

    pub fn consumer(&self) -> Consumer<T> {
        Consumer::new(self.senders.get.clone(), self.shutdown.clone())
    }

    /// Queries the coordination loop for its current counters.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] if the broker has shut down.
    pub async fn metrics(&self) -> Result<BrokerMetrics, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(BrokerError::Closed),
            sent = self.senders.metrics.send(MetricsRequest { reply: reply_tx }) => {
                sent.map_err(|_| BrokerError::Closed)?;
            }
        }

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(BrokerError::Closed),
            metrics = reply_rx => metrics.map_err(|_| BrokerError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shuts the broker down. Blocked producers and consumers return immediately.
    ///
    /// With `wait_on_close` set this also waits for both internal tasks to exit.
    pub async fn close(mut self) {
        debug!("Closing broker");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut self.tasks);
        if !self.wait_on_close {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("Broker task failed: {}", e);
            }
        }
        debug!("Broker tasks stopped");
    }
}

impl<T> Drop for Broker<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<T> std::fmt::Debug for Broker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("closed", &self.is_closed())
            .field("wait_on_close", &self.wait_on_close)
            .finish_non_exhaustive()
    }
}
