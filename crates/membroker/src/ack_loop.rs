// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! ACK aggregation.
//!
//! Consumers acknowledge batches in any order, but buffer space can only be reclaimed from the
//! front of the ring. The ACK loop keeps every outstanding [`AckMarker`] in creation order and
//! only reports a batch once all batches created before it are done:
//!
//! ```text
//!  markers:  [ m1 (pending) | m2 (done) | m3 (done) | m4 (pending) ]
//!                  ^ head
//!  m1 done  -> pop m1, drain m2 and m3 without waiting, stop at m4
//!           -> report_acks over their tags, send count(m1+m2+m3) to the event loop
//! ```

use std::collections::VecDeque;

use tokio::sync::{
    mpsc,
    oneshot::{self, error::RecvError, error::TryRecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::producer::{AckCallback, ClientTag};

/// Bookkeeping for one reserved batch.
#[derive(Debug)]
pub(crate) struct AckMarker {
    /// Creation order, for diagnostics.
    pub(crate) id: u64,
    /// Array index of the first event of the batch.
    pub(crate) start: usize,
    pub(crate) count: usize,
    tags: Vec<ClientTag>,
    done: oneshot::Receiver<()>,
}

impl AckMarker {
    pub(crate) fn new(
        id: u64,
        start: usize,
        tags: Vec<ClientTag>,
        done: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            id,
            start,
            count: tags.len(),
            tags,
            done,
        }
    }
}

/// Reports newly acknowledged events to their producers.
///
/// `tags` must be walked from the newest event to the oldest. The first tag seen for a producer
/// carries its highest sequence number, so the producer is told about everything up to that
/// number in a single callback; its older tags then compare as stale and are skipped. Tags that
/// trigger a callback are cleared so a repeated report cannot count them twice.
///
/// Returns the number of callbacks invoked.
pub(crate) fn report_acks<'a, I>(tags: I) -> usize
where
    I: IntoIterator<Item = &'a mut ClientTag>,
{
    let mut notified = 0;
    for tag in tags {
        let Some(state) = tag.producer() else {
            tag.state = None;
            continue;
        };

        let delta = tag.seq.wrapping_sub(state.last_ack());
        if delta == 0 || delta > u32::MAX / 2 {
            continue;
        }

        state.set_last_ack(tag.seq);
        state.notify_acked(delta as usize);
        tag.state = None;
        notified += 1;
    }
    notified
}

enum Signal {
    Scheduled(Vec<AckMarker>),
    HeadDone(Result<(), RecvError>),
}

pub(crate) struct AckLoop {
    markers: VecDeque<AckMarker>,
    scheduled_rx: mpsc::Receiver<Vec<AckMarker>>,
    acks_tx: mpsc::Sender<usize>,
    observer: Option<AckCallback>,
    shutdown: CancellationToken,
    /// Acknowledged events not yet delivered to the event loop.
    pending_report: usize,
    total_events: u64,
    total_batches: u64,
    released_batches: u64,
}

impl AckLoop {
    pub(crate) fn new(
        scheduled_rx: mpsc::Receiver<Vec<AckMarker>>,
        acks_tx: mpsc::Sender<usize>,
        observer: Option<AckCallback>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            markers: VecDeque::new(),
            scheduled_rx,
            acks_tx,
            observer,
            shutdown,
            pending_report: 0,
            total_events: 0,
            total_batches: 0,
            released_batches: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("ACK loop started");

        loop {
            let signal = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                scheduled = self.scheduled_rx.recv() => match scheduled {
                    Some(markers) => Signal::Scheduled(markers),
                    None => break,
                },
                done = head_done(&mut self.markers), if !self.markers.is_empty() => {
                    Signal::HeadDone(done)
                }
                permit = self.acks_tx.reserve(), if self.pending_report > 0 => match permit {
                    Ok(permit) => {
                        trace!("Reporting {} acknowledged events", self.pending_report);
                        permit.send(self.pending_report);
                        self.pending_report = 0;
                        continue;
                    }
                    Err(_) => break,
                },
            };

            match signal {
                Signal::Scheduled(markers) => {
                    trace!("Scheduled {} ACK markers", markers.len());
                    self.markers.extend(markers);
                }
                Signal::HeadDone(result) => self.collect(result),
            }
        }

        debug!(
            "ACK loop stopped after {} events in {} batches ({} released without ACK), {} markers outstanding",
            self.total_events,
            self.total_batches,
            self.released_batches,
            self.markers.len()
        );
    }

    /// Pops the completed head marker plus every following marker that is already done.
    fn collect(&mut self, head: Result<(), RecvError>) {
        let Some(first) = self.markers.pop_front() else {
            return;
        };
        let mut done = vec![(first, head.is_ok())];

        while let Some(next) = self.markers.front_mut() {
            let acked = match next.done.try_recv() {
                Ok(()) => true,
                Err(TryRecvError::Closed) => false,
                Err(TryRecvError::Empty) => break,
            };
            if let Some(marker) = self.markers.pop_front() {
                done.push((marker, acked));
            }
        }

        let mut count = 0;
        for (marker, acked) in &done {
            if !acked {
                warn!(
                    "Batch {} ({} events at index {}) was released without acknowledgement",
                    marker.id, marker.count, marker.start
                );
                self.released_batches += 1;
            }
            count += marker.count;
        }

        let notified = report_acks(
            done.iter_mut()
                .rev()
                .flat_map(|(marker, _)| marker.tags.iter_mut().rev()),
        );
        trace!(
            "Collected {} batches, {} events, {} producer callbacks",
            done.len(),
            count,
            notified
        );

        if let Some(observer) = &self.observer {
            observer(count);
        }

        self.total_batches += done.len() as u64;
        self.total_events += count as u64;
        self.pending_report += count;
    }
}

async fn head_done(markers: &mut VecDeque<AckMarker>) -> Result<(), RecvError> {
    match markers.front_mut() {
        Some(marker) => (&mut marker.done).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::producer::ProducerState;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recording_producer() -> (Arc<ProducerState>, Arc<Mutex<Vec<usize>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let state = Arc::new(ProducerState::new(
            Arc::new(move |n| sink.lock().unwrap().push(n)),
            None,
            false,
        ));
        (state, calls)
    }

    fn tags_for(state: &Arc<ProducerState>, seqs: std::ops::RangeInclusive<u32>) -> Vec<ClientTag> {
        seqs.map(|seq| ClientTag::tracked(seq, state)).collect()
    }

    #[test]
    fn test_report_acks_collapses_per_producer() {
        let (state, calls) = recording_producer();
        let mut tags = tags_for(&state, 1..=4);

        assert_eq!(report_acks(tags.iter_mut().rev()), 1);
        assert_eq!(*calls.lock().unwrap(), vec![4]);
        assert_eq!(state.last_ack(), 4);
        assert!(tags[3].state.is_none());
    }

    #[test]
    fn test_report_acks_interleaved_producers() {
        let (p1, calls1) = recording_producer();
        let (p2, calls2) = recording_producer();
        let mut tags = vec![
            ClientTag::tracked(1, &p1),
            ClientTag::tracked(1, &p2),
            ClientTag::untracked(),
            ClientTag::tracked(2, &p1),
            ClientTag::tracked(3, &p1),
            ClientTag::tracked(2, &p2),
        ];

        assert_eq!(report_acks(tags.iter_mut().rev()), 2);
        assert_eq!(*calls1.lock().unwrap(), vec![3]);
        assert_eq!(*calls2.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_report_acks_counts_only_new_events() {
        let (state, calls) = recording_producer();
        let mut first = tags_for(&state, 1..=2);
        let mut second = tags_for(&state, 3..=5);

        report_acks(first.iter_mut().rev());
        report_acks(second.iter_mut().rev());

        assert_eq!(*calls.lock().unwrap(), vec![2, 3]);
        assert_eq!(state.last_ack(), 5);
    }

    #[test]
    fn test_report_acks_ignores_stale_duplicates() {
        let (state, calls) = recording_producer();
        let mut tags = tags_for(&state, 1..=3);
        let mut duplicate = tags.clone();

        report_acks(tags.iter_mut().rev());
        assert_eq!(report_acks(duplicate.iter_mut().rev()), 0);

        assert_eq!(*calls.lock().unwrap(), vec![3]);
        assert_eq!(state.last_ack(), 3);
    }

    #[test]
    fn test_report_acks_skips_closed_producers() {
        let (state, calls) = recording_producer();
        let mut tags = tags_for(&state, 1..=2);
        let callback_owner = Arc::clone(&calls);
        drop(state);

        assert_eq!(report_acks(tags.iter_mut().rev()), 0);
        assert!(callback_owner.lock().unwrap().is_empty());
        assert!(tags.iter().all(|tag| tag.state.is_none()));
    }

    struct Harness {
        scheduled_tx: mpsc::Sender<Vec<AckMarker>>,
        acks_rx: mpsc::Receiver<usize>,
        shutdown: CancellationToken,
        next_id: u64,
    }

    impl Harness {
        fn start() -> Self {
            let (scheduled_tx, scheduled_rx) = mpsc::channel(4);
            let (acks_tx, acks_rx) = mpsc::channel(1);
            let shutdown = CancellationToken::new();
            let ack_loop = AckLoop::new(scheduled_rx, acks_tx, None, shutdown.clone());
            tokio::spawn(ack_loop.run());
            Self {
                scheduled_tx,
                acks_rx,
                shutdown,
                next_id: 0,
            }
        }

        fn marker(&mut self, tags: Vec<ClientTag>) -> (AckMarker, oneshot::Sender<()>) {
            let (tx, rx) = oneshot::channel();
            self.next_id += 1;
            (AckMarker::new(self.next_id, 0, tags, rx), tx)
        }
    }

    #[tokio::test]
    async fn test_ack_loop_reports_in_creation_order() {
        let mut harness = Harness::start();
        let (state, calls) = recording_producer();

        let (m1, done1) = harness.marker(tags_for(&state, 1..=2));
        let (m2, done2) = harness.marker(tags_for(&state, 3..=4));
        harness.scheduled_tx.send(vec![m1, m2]).await.unwrap();

        done2.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(harness.acks_rx.try_recv().is_err());
        assert!(calls.lock().unwrap().is_empty());

        done1.send(()).unwrap();
        let count = tokio::time::timeout(Duration::from_secs(1), harness.acks_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 4);
        assert_eq!(*calls.lock().unwrap(), vec![4]);
        assert_eq!(state.last_ack(), 4);

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_ack_loop_counts_released_batches() {
        let mut harness = Harness::start();

        let (m1, done1) = harness.marker(vec![ClientTag::untracked(); 3]);
        harness.scheduled_tx.send(vec![m1]).await.unwrap();
        drop(done1);

        let count = tokio::time::timeout(Duration::from_secs(1), harness.acks_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 3);

        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_ack_loop_stops_on_shutdown() {
        let (_scheduled_tx, scheduled_rx) = mpsc::channel(1);
        let (acks_tx, _acks_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(AckLoop::new(scheduled_rx, acks_tx, None, shutdown.clone()).run());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
