// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer handles used by upstream components to publish events.
//!
//! A producer is either untracked (fire-and-forget) or tracked. A tracked producer owns a
//! [`ProducerState`]; every event it publishes carries a [`ClientTag`] with a weak reference back
//! to that state. The event loop numbers the event when it is stored, and the ACK loop uses the
//! tag to invoke the producer's ACK callback once the event's batch has been acknowledged.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{EntryId, Event};
use crate::event_loop::{CancelRequest, PushRequest, RequestSenders};

/// Callback receiving the number of newly acknowledged events.
pub type AckCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Callback receiving the number of events dropped on behalf of a cancelled producer.
pub type DropCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Options for [`crate::Broker::producer`].
///
/// Supplying an ACK callback selects a tracked producer; without one the producer is
/// fire-and-forget and `on_drop`/`drop_on_cancel` have no effect.
#[derive(Clone, Default)]
pub struct ProducerConfig {
    pub on_ack: Option<AckCallback>,
    pub on_drop: Option<DropCallback>,
    /// Report events removed by [`Producer::cancel`] to `on_drop`.
    pub drop_on_cancel: bool,
}

impl ProducerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ack<F>(mut self, on_ack: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_ack = Some(Arc::new(on_ack));
        self
    }

    #[must_use]
    pub fn with_drop<F>(mut self, on_drop: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_drop = Some(Arc::new(on_drop));
        self
    }

    #[must_use]
    pub fn with_drop_on_cancel(mut self, drop_on_cancel: bool) -> Self {
        self.drop_on_cancel = drop_on_cancel;
        self
    }
}

impl fmt::Debug for ProducerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerConfig")
            .field("on_ack", &self.on_ack.is_some())
            .field("on_drop", &self.on_drop.is_some())
            .field("drop_on_cancel", &self.drop_on_cancel)
            .finish()
    }
}

/// Bookkeeping shared between a tracked producer, the event loop and the ACK loop.
///
/// The producer handle holds the only strong reference outside of in-flight requests. Only the
/// event loop writes `next_seq` and only the ACK loop writes `last_ack`; the owning producer and
/// the event loop set `cancelled`.
pub(crate) struct ProducerState {
    on_ack: AckCallback,
    on_drop: Option<DropCallback>,
    drop_on_cancel: bool,
    cancelled: AtomicBool,
    /// Sequence number given to the next stored event. Starts at 1.
    next_seq: AtomicU32,
    last_ack: AtomicU32,
}

impl ProducerState {
    pub(crate) fn new(
        on_ack: AckCallback,
        on_drop: Option<DropCallback>,
        drop_on_cancel: bool,
    ) -> Self {
        Self {
            on_ack,
            on_drop,
            drop_on_cancel,
            cancelled: AtomicBool::new(false),
            next_seq: AtomicU32::new(1),
            last_ack: AtomicU32::new(0),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn drops_on_cancel(&self) -> bool {
        self.drop_on_cancel
    }

    pub(crate) fn next_sequence(&self) -> u32 {
        self.next_seq.load(Ordering::Acquire)
    }

    /// Marks the current sequence number as used by a stored event.
    pub(crate) fn commit_sequence(&self) {
        self.next_seq.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn last_ack(&self) -> u32 {
        self.last_ack.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_ack(&self, seq: u32) {
        self.last_ack.store(seq, Ordering::Release);
    }

    pub(crate) fn notify_acked(&self, count: usize) {
        (self.on_ack)(count);
    }

    pub(crate) fn notify_dropped(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(on_drop) = &self.on_drop {
            on_drop(count);
        }
    }
}

impl fmt::Debug for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerState")
            .field("cancelled", &self.is_cancelled())
            .field("next_seq", &self.next_sequence())
            .field("last_ack", &self.last_ack())
            .field("drop_on_cancel", &self.drop_on_cancel)
            .finish_non_exhaustive()
    }
}

/// Per-slot producer metadata: a sequence number and a non-owning link to the producer.
///
/// Untracked events carry an empty tag. Tracked tags leave the producer with sequence 0 and are
/// numbered by the event loop when the event is stored.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClientTag {
    pub(crate) seq: u32,
    pub(crate) state: Option<Weak<ProducerState>>,
}

impl ClientTag {
    pub(crate) fn untracked() -> Self {
        Self::default()
    }

    pub(crate) fn tracked(seq: u32, state: &Arc<ProducerState>) -> Self {
        Self {
            seq,
            state: Some(Arc::downgrade(state)),
        }
    }

    pub(crate) fn belongs_to(&self, state: &Arc<ProducerState>) -> bool {
        self.state
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(state)))
    }

    /// The producer this tag points at, if it is tracked and still alive.
    pub(crate) fn producer(&self) -> Option<Arc<ProducerState>> {
        self.state.as_ref().and_then(Weak::upgrade)
    }
}

enum Tracking {
    Untracked,
    Tracked { state: Arc<ProducerState> },
}

/// Handle for publishing events into a broker.
pub struct Producer<T> {
    push_tx: mpsc::Sender<PushRequest<T>>,
    try_push_tx: mpsc::Sender<PushRequest<T>>,
    cancel_tx: mpsc::Sender<CancelRequest>,
    shutdown: CancellationToken,
    tracking: Tracking,
}

impl<T> Producer<T> {
    pub(crate) fn new(
        senders: &RequestSenders<T>,
        shutdown: CancellationToken,
        config: ProducerConfig,
    ) -> Self {
        let tracking = match config.on_ack {
            Some(on_ack) => Tracking::Tracked {
                state: Arc::new(ProducerState::new(
                    on_ack,
                    config.on_drop,
                    config.drop_on_cancel,
                )),
            },
            None => Tracking::Untracked,
        };

        Self {
            push_tx: senders.push.clone(),
            try_push_tx: senders.try_push.clone(),
            cancel_tx: senders.cancel.clone(),
            shutdown,
            tracking,
        }
    }

    /// Whether this producer receives ACK callbacks.
    pub fn is_tracked(&self) -> bool {
        matches!(self.tracking, Tracking::Tracked { .. })
    }

    /// Highest sequence number reported to the ACK callback so far (0 when untracked).
    pub fn last_acked_sequence(&self) -> u32 {
        match &self.tracking {
            Tracking::Tracked { state } => state.last_ack(),
            Tracking::Untracked => 0,
        }
    }

    /// Publishes `event`, waiting while the buffer is full.
    ///
    /// Returns the event's [`EntryId`] once it is stored. Returns `None` if the producer was
    /// cancelled (the event goes to the drop callback) or the broker shut down.
    ///
    /// Once the request is queued the event loop applies it even if this future is dropped.
    pub async fn publish(&mut self, event: Event<T>) -> Option<EntryId> {
        let tag = self.next_tag()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PushRequest {
            event,
            tag,
            reply: reply_tx,
        };

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return None,
            sent = self.push_tx.send(request) => {
                sent.ok()?;
            }
        }

        // The request is queued: the event loop answers it unless it shuts down first.
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            reply = reply_rx => reply.ok().flatten(),
        }
    }

    /// Publishes `event` only if the buffer has room right now.
    ///
    /// Never waits for buffer space: a full buffer (or a saturated request queue) yields
    /// `None` immediately.
    pub async fn try_publish(&mut self, event: Event<T>) -> Option<EntryId> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        let tag = self.next_tag()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PushRequest {
            event,
            tag,
            reply: reply_tx,
        };
        self.try_push_tx.try_send(request).ok()?;

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            reply = reply_rx => reply.ok().flatten(),
        }
    }

    /// Removes this producer's events that no consumer has reserved yet.
    ///
    /// Returns the number of removed events. Later publishes are dropped. Untracked producers
    /// cannot be cancelled and always return 0.
    pub async fn cancel(&mut self) -> usize {
        let Tracking::Tracked { state } = &self.tracking else {
            return 0;
        };
        state.cancel();

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CancelRequest {
            state: Arc::clone(state),
            reply: reply_tx,
        };
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return 0,
            sent = self.cancel_tx.send(request) => {
                if sent.is_err() {
                    return 0;
                }
            }
        }

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => 0,
            removed = reply_rx => removed.unwrap_or(0),
        }
    }

    /// Releases the producer. Events already published stay in the broker, but their ACKs are
    /// no longer reported.
    pub fn close(self) {
        if let Tracking::Tracked { state } = &self.tracking {
            debug!(
                "Closing tracked producer after {} stored events",
                state.next_sequence().wrapping_sub(1)
            );
        }
    }

    fn next_tag(&self) -> Option<ClientTag> {
        match &self.tracking {
            Tracking::Untracked => Some(ClientTag::untracked()),
            Tracking::Tracked { state } => {
                if state.is_cancelled() {
                    state.notify_dropped(1);
                    None
                } else {
                    Some(ClientTag::tracked(0, state))
                }
            }
        }
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Producer");
        match &self.tracking {
            Tracking::Untracked => out.field("tracked", &false),
            Tracking::Tracked { state } => out.field("tracked", &true).field("state", state),
        };
        out.finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn state() -> Arc<ProducerState> {
        Arc::new(ProducerState::new(Arc::new(|_| {}), None, false))
    }

    #[test]
    fn test_client_tag_belongs_to_its_producer() {
        let first = state();
        let second = state();
        let tag = ClientTag::tracked(3, &first);

        assert!(tag.belongs_to(&first));
        assert!(!tag.belongs_to(&second));
        assert!(!ClientTag::untracked().belongs_to(&first));
        assert_eq!(tag.seq, 3);
    }

    #[test]
    fn test_client_tag_does_not_keep_producer_alive() {
        let st = state();
        let tag = ClientTag::tracked(1, &st);
        assert!(tag.producer().is_some());

        drop(st);
        assert!(tag.producer().is_none());
    }

    #[test]
    fn test_drop_callback_skips_zero() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dropped);
        let st = ProducerState::new(
            Arc::new(|_| {}),
            Some(Arc::new(move |n| {
                counter.fetch_add(n, Ordering::SeqCst);
            })),
            true,
        );

        st.notify_dropped(0);
        st.notify_dropped(2);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert!(st.drops_on_cancel());
    }

    #[test]
    fn test_sequence_advances_only_on_commit() {
        let st = state();
        assert_eq!(st.next_sequence(), 1);
        assert_eq!(st.next_sequence(), 1);

        st.commit_sequence();
        st.commit_sequence();
        assert_eq!(st.next_sequence(), 3);
        assert_eq!(st.last_ack(), 0);
    }

    #[test]
    fn test_producer_config_builder() {
        let config = ProducerConfig::new()
            .with_ack(|_| {})
            .with_drop(|_| {})
            .with_drop_on_cancel(true);

        assert!(config.on_ack.is_some());
        assert!(config.on_drop.is_some());
        assert!(config.drop_on_cancel);
        assert_eq!(
            format!("{config:?}"),
            "ProducerConfig { on_ack: true, on_drop: true, drop_on_cancel: true }"
        );
    }
}
