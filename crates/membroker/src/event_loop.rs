// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The coordination loop: the only task that touches the ring buffer.
//!
//! Producers, consumers and the ACK loop talk to it through the request queues in
//! [`RequestSenders`]. Each request carries a oneshot reply channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::ack_loop::AckMarker;
use crate::broker::BrokerMetrics;
use crate::config::Settings;
use crate::consumer::Batch;
use crate::event::{EntryId, Event};
use crate::producer::{ClientTag, ProducerState};
use crate::ring_buffer::{Reservation, RingBuffer};

pub(crate) struct PushRequest<T> {
    pub(crate) event: Event<T>,
    pub(crate) tag: ClientTag,
    /// The stored event's id, or `None` when it was refused or dropped.
    pub(crate) reply: oneshot::Sender<Option<EntryId>>,
}

pub(crate) struct CancelRequest {
    pub(crate) state: Arc<ProducerState>,
    pub(crate) reply: oneshot::Sender<usize>,
}

pub(crate) struct GetRequest<T> {
    /// Upper bound on the batch size, 0 for everything available.
    pub(crate) max: usize,
    pub(crate) reply: oneshot::Sender<Batch<T>>,
}

pub(crate) struct MetricsRequest {
    pub(crate) reply: oneshot::Sender<BrokerMetrics>,
}

/// Sending halves of the request queues, shared by every producer and consumer handle.
pub(crate) struct RequestSenders<T> {
    /// Blocking inserts. Not read while the buffer is full.
    pub(crate) push: mpsc::Sender<PushRequest<T>>,
    /// Non-blocking inserts. Always read; refused while the buffer is full.
    pub(crate) try_push: mpsc::Sender<PushRequest<T>>,
    pub(crate) cancel: mpsc::Sender<CancelRequest>,
    pub(crate) get: mpsc::Sender<GetRequest<T>>,
    pub(crate) metrics: mpsc::Sender<MetricsRequest>,
}

// derive(Clone) would require T: Clone
impl<T> Clone for RequestSenders<T> {
    fn clone(&self) -> Self {
        Self {
            push: self.push.clone(),
            try_push: self.try_push.clone(),
            cancel: self.cancel.clone(),
            get: self.get.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

pub(crate) struct Requests<T> {
    push: mpsc::Receiver<PushRequest<T>>,
    try_push: mpsc::Receiver<PushRequest<T>>,
    cancel: mpsc::Receiver<CancelRequest>,
    get: mpsc::Receiver<GetRequest<T>>,
    metrics: mpsc::Receiver<MetricsRequest>,
}

/// What one pass of [`EventLoop::run`] has to do once the select has finished.
enum Step<T> {
    Stop,
    Acks(usize),
    Cancel(CancelRequest),
    Metrics(MetricsRequest),
    Get(GetRequest<T>),
    Push(PushRequest<T>),
    Flush,
    HandedOff,
}

pub(crate) fn request_channels<T>(queue_size: usize) -> (RequestSenders<T>, Requests<T>) {
    let queue_size = queue_size.max(1);
    let (push_tx, push_rx) = mpsc::channel(queue_size);
    let (try_push_tx, try_push_rx) = mpsc::channel(queue_size);
    let (cancel_tx, cancel_rx) = mpsc::channel(queue_size);
    let (get_tx, get_rx) = mpsc::channel(queue_size);
    let (metrics_tx, metrics_rx) = mpsc::channel(queue_size);

    (
        RequestSenders {
            push: push_tx,
            try_push: try_push_tx,
            cancel: cancel_tx,
            get: get_tx,
            metrics: metrics_tx,
        },
        Requests {
            push: push_rx,
            try_push: try_push_rx,
            cancel: cancel_rx,
            get: get_rx,
            metrics: metrics_rx,
        },
    )
}

pub(crate) struct EventLoop<T> {
    buf: RingBuffer<T>,
    requests: Requests<T>,
    acks_rx: mpsc::Receiver<usize>,
    scheduled_tx: mpsc::Sender<Vec<AckMarker>>,
    /// Markers created since the last handoff to the ACK loop.
    pending: Vec<AckMarker>,
    min_events: usize,
    flush_timeout: Duration,
    flush_deadline: Option<Instant>,
    /// Set when the flush timer fired; cleared by the next served reservation.
    flush_ready: bool,
    shutdown: CancellationToken,
    next_batch_id: u64,
    acked_events: u64,
}

impl<T> EventLoop<T> {
    /// `settings` must already be normalized.
    pub(crate) fn new(
        settings: &Settings,
        requests: Requests<T>,
        acks_rx: mpsc::Receiver<usize>,
        scheduled_tx: mpsc::Sender<Vec<AckMarker>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            buf: RingBuffer::new(settings.events),
            requests,
            acks_rx,
            scheduled_tx,
            pending: Vec::new(),
            min_events: settings.flush_min_events,
            flush_timeout: settings.flush_timeout,
            flush_deadline: None,
            flush_ready: false,
            shutdown,
            next_batch_id: 0,
            acked_events: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(
            "Event loop started: capacity {}, flush_min_events {}, flush_timeout {:?}",
            self.buf.capacity(),
            self.min_events,
            self.flush_timeout
        );

        loop {
            self.update_flush_timer();
            let accepting = !self.buf.full();
            let serving = self.serving();

            // Arms only borrow fields; handlers run after the select has released them.
            let step = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => Step::Stop,
                Some(count) = self.acks_rx.recv() => Step::Acks(count),
                Some(request) = self.requests.cancel.recv() => Step::Cancel(request),
                Some(request) = self.requests.metrics.recv() => Step::Metrics(request),
                permit = self.scheduled_tx.reserve(), if !self.pending.is_empty() => match permit {
                    Ok(permit) => {
                        trace!("Handing {} ACK markers to the ACK loop", self.pending.len());
                        permit.send(std::mem::take(&mut self.pending));
                        Step::HandedOff
                    }
                    Err(_) => Step::Stop,
                },
                Some(request) = self.requests.get.recv(), if serving => Step::Get(request),
                Some(request) = self.requests.push.recv(), if accepting => Step::Push(request),
                Some(request) = self.requests.try_push.recv() => Step::Push(request),
                () = flush_timer(self.flush_deadline), if self.flush_deadline.is_some() => Step::Flush,
            };

            match step {
                Step::Stop => break,
                Step::Acks(count) => self.handle_acks(count),
                Step::Cancel(request) => self.handle_cancel(request),
                Step::Metrics(request) => self.handle_metrics(request),
                Step::Get(request) => self.handle_get(request),
                Step::Push(request) => self.handle_push(request),
                Step::Flush => {
                    trace!("Flush timeout elapsed with {} events buffered", self.buf.total_avail());
                    self.flush_deadline = None;
                    self.flush_ready = true;
                }
                Step::HandedOff => {}
            }
        }

        debug!(
            "Event loop stopped: {} events buffered, {} reserved, {} acknowledged",
            self.buf.len(),
            self.buf.reserved(),
            self.acked_events
        );
    }

    /// Whether a reservation can be answered right now.
    fn serving(&self) -> bool {
        self.buf.avail() > 0
            && (self.flush_ready
                || self.buf.full()
                || self.buf.total_avail() >= self.min_events)
    }

    fn update_flush_timer(&mut self) {
        let buffered = self.buf.total_avail();
        if buffered == 0 {
            self.flush_deadline = None;
            self.flush_ready = false;
            return;
        }
        if buffered >= self.min_events || self.buf.full() {
            self.flush_deadline = None;
            return;
        }
        if !self.flush_ready && self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now() + self.flush_timeout);
        }
    }

    /// Applies a queued insert, whether or not its publisher is still waiting for the reply.
    fn handle_push(&mut self, request: PushRequest<T>) {
        let PushRequest {
            event,
            mut tag,
            reply,
        } = request;

        let producer = tag.producer();
        if let Some(state) = &producer {
            if state.is_cancelled() {
                state.notify_dropped(1);
                let _ = reply.send(None);
                return;
            }
            tag.seq = state.next_sequence();
        }

        let Some((id, free)) = self.buf.insert(event, tag) else {
            trace!("Buffer full, refusing event");
            let _ = reply.send(None);
            return;
        };
        if let Some(state) = &producer {
            state.commit_sequence();
        }
        if free == 0 {
            debug!("Buffer full, pausing inserts until events are acknowledged");
        }
        let _ = reply.send(Some(id));
    }

    fn handle_cancel(&mut self, request: CancelRequest) {
        let CancelRequest { state, reply } = request;
        state.cancel();
        let removed = self.buf.cancel(&state);
        if state.drops_on_cancel() {
            state.notify_dropped(removed);
        }
        debug!("Cancelled producer, removed {} buffered events", removed);
        let _ = reply.send(removed);
    }

    fn handle_get(&mut self, request: GetRequest<T>) {
        let GetRequest { max, reply } = request;
        if reply.is_closed() {
            trace!("Skipping reservation for a consumer that stopped waiting");
            return;
        }

        let reservation = self.buf.reserve(max);
        if reservation.is_empty() {
            error!(
                "Served a reservation with no events, {} reported available",
                self.buf.avail()
            );
            panic!("event loop produced an empty reservation");
        }

        let count = reservation.len();
        let Reservation {
            start,
            events,
            tags,
        } = reservation;
        let id = self.next_batch_id;
        let (done_tx, done_rx) = oneshot::channel();
        match reply.send(Batch::new(id, events, done_tx)) {
            Ok(()) => {
                trace!("Reserved batch {} of {} events at index {}", id, count, start);
                self.next_batch_id += 1;
                self.pending.push(AckMarker::new(id, start, tags, done_rx));
                self.flush_deadline = None;
                self.flush_ready = false;
            }
            Err(batch) => {
                debug!("Consumer went away before batch {} was delivered", id);
                self.buf.unreserve(batch.into_events(), tags);
            }
        }
    }

    fn handle_acks(&mut self, count: usize) {
        let was_full = self.buf.full();
        self.buf.ack(count);
        self.acked_events += count as u64;
        if was_full && !self.buf.full() {
            debug!("Freed {} slots, resuming inserts", count);
        }
    }

    fn handle_metrics(&self, request: MetricsRequest) {
        let metrics = BrokerMetrics {
            event_count: self.buf.len(),
            event_limit: self.buf.capacity(),
            unacked_consumed_events: self.buf.reserved(),
            acked_events: self.acked_events,
            oldest_entry_id: self.buf.oldest_id(),
        };
        let _ = request.reply.send(metrics);
    }
}

async fn flush_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
