// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity event storage owned by the event loop.
//!
//! The buffer emulates a circular queue with two contiguous regions instead of modulo
//! arithmetic:
//!
//! ```text
//!  index:   0   1   2   3   4   5   6   7
//!         [ B | B | - | - | A | A | A | A ]
//!                           ^ reserved prefix of A is owned by consumers
//! ```
//!
//! Region A holds the oldest events. Region B only exists once A has reached the end of the
//! array while its start has moved past index 0; it collects newer events at the front. When A
//! drains completely, B takes its place.
//!
//! Every call runs on the event loop task, so there is no locking here.

use std::sync::Arc;

use tracing::error;

use crate::event::{EntryId, Event};
use crate::producer::{ClientTag, ProducerState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Region {
    pub(crate) index: usize,
    pub(crate) size: usize,
}

impl Region {
    fn end(self) -> usize {
        self.index + self.size
    }
}

#[derive(Debug)]
struct Slot<T> {
    /// Taken out when the slot is reserved.
    event: Option<Event<T>>,
    tag: ClientTag,
    /// Kept through reservations so the oldest unacknowledged id stays known.
    id: EntryId,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            event: None,
            tag: ClientTag::default(),
            id: EntryId::default(),
        }
    }
}

/// Events and tags moved out of the buffer by [`RingBuffer::reserve`].
#[derive(Debug)]
pub(crate) struct Reservation<T> {
    /// Array index of the first reserved slot.
    pub(crate) start: usize,
    pub(crate) events: Vec<Event<T>>,
    pub(crate) tags: Vec<ClientTag>,
}

impl<T> Reservation<T> {
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug)]
pub(crate) struct RingBuffer<T> {
    entries: Vec<Slot<T>>,
    reg_a: Region,
    reg_b: Region,
    /// Events at the front of region A handed to consumers but not acknowledged yet.
    reserved: usize,
    next_id: EntryId,
}

impl<T> RingBuffer<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| Slot::empty()).collect(),
            reg_a: Region::default(),
            reg_b: Region::default(),
            reserved: 0,
            next_id: EntryId::default(),
        }
    }

    /// Stores `event`, returning its id and the free capacity left, or `None` when full.
    pub(crate) fn insert(
        &mut self,
        event: Event<T>,
        tag: ClientTag,
    ) -> Option<(EntryId, usize)> {
        let capacity = self.capacity();

        let index = if self.reg_b.size > 0 {
            // A is still draining, only B can grow.
            let end = self.reg_b.end();
            if end >= self.reg_a.index {
                return None;
            }
            self.reg_b.size += 1;
            end
        } else if self.reg_a.end() < capacity {
            let end = self.reg_a.end();
            self.reg_a.size += 1;
            end
        } else if self.reg_a.index == 0 {
            return None;
        } else {
            self.reg_b = Region { index: 0, size: 1 };
            0
        };

        let id = self.next_id;
        self.next_id = id.next();
        self.entries[index] = Slot {
            event: Some(event),
            tag,
            id,
        };
        Some((id, self.free_capacity()))
    }

    /// Hands out up to `max` events from region A, right after the reserved prefix.
    ///
    /// `max == 0` reserves everything available. The events are moved out of their slots; the
    /// slots themselves stay occupied until [`RingBuffer::ack`].
    pub(crate) fn reserve(&mut self, max: usize) -> Reservation<T> {
        let available = self.avail();
        let count = if max == 0 || max > available {
            available
        } else {
            max
        };
        let start = self.reg_a.index + self.reserved;

        let mut events = Vec::with_capacity(count);
        let mut tags = Vec::with_capacity(count);
        for slot in &mut self.entries[start..start + count] {
            if let Some(event) = slot.event.take() {
                events.push(event);
                tags.push(std::mem::take(&mut slot.tag));
            }
        }
        self.reserved += events.len();

        Reservation {
            start,
            events,
            tags,
        }
    }

    /// Returns the most recent reservation to the buffer, as if it never happened.
    pub(crate) fn unreserve(&mut self, events: Vec<Event<T>>, tags: Vec<ClientTag>) {
        let count = events.len().min(tags.len()).min(self.reserved);
        let start = self.reg_a.index + self.reserved - count;

        let restored = events.into_iter().zip(tags).take(count);
        for (slot, (event, tag)) in self.entries[start..start + count].iter_mut().zip(restored) {
            slot.event = Some(event);
            slot.tag = tag;
        }
        self.reserved -= count;
    }

    /// Frees the `count` oldest events.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the size of region A or the number of reserved events.
    /// Callers only acknowledge events they reserved, so either is a broken internal contract.
    pub(crate) fn ack(&mut self, count: usize) {
        if count > self.reg_a.size {
            error!(
                "Acknowledged {} events but only {} are buffered in the active region",
                count, self.reg_a.size
            );
            panic!(
                "ring buffer ack({count}) exceeds active region size {}",
                self.reg_a.size
            );
        }
        if count > self.reserved {
            error!(
                "Acknowledged {} events but only {} are reserved",
                count, self.reserved
            );
            panic!(
                "ring buffer ack({count}) exceeds reserved events {}",
                self.reserved
            );
        }

        let start = self.reg_a.index;
        for slot in &mut self.entries[start..start + count] {
            *slot = Slot::empty();
        }

        self.reg_a.index += count;
        self.reg_a.size -= count;
        self.reserved -= count;
        if self.reg_a.size == 0 {
            self.promote_b();
        }
    }

    /// Removes every unreserved event published by `state`, compacting both regions.
    pub(crate) fn cancel(&mut self, state: &Arc<ProducerState>) -> usize {
        let removed_b = self.cancel_region(state, self.reg_b);
        self.reg_b.size -= removed_b;

        let unreserved_a = Region {
            index: self.reg_a.index + self.reserved,
            size: self.reg_a.size - self.reserved,
        };
        let removed_a = self.cancel_region(state, unreserved_a);
        self.reg_a.size -= removed_a;

        if self.reg_b.size == 0 {
            self.reg_b = Region::default();
        }
        if self.reg_a.size == 0 {
            self.promote_b();
        }

        removed_a + removed_b
    }

    fn cancel_region(&mut self, state: &Arc<ProducerState>, region: Region) -> usize {
        let mut write = region.index;
        for read in region.index..region.end() {
            if self.entries[read].tag.belongs_to(state) {
                self.entries[read] = Slot::empty();
            } else {
                // Everything between `write` and `read` is already empty.
                if write != read {
                    self.entries.swap(write, read);
                }
                write += 1;
            }
        }
        region.end() - write
    }

    fn promote_b(&mut self) {
        self.reg_a = self.reg_b;
        self.reg_b = Region::default();
    }

    /// Events in region A that can still be reserved.
    pub(crate) fn avail(&self) -> usize {
        self.reg_a.size - self.reserved
    }

    /// Buffered events not reserved by any consumer, across both regions.
    pub(crate) fn total_avail(&self) -> usize {
        self.reg_a.size + self.reg_b.size - self.reserved
    }

    /// Occupied slots, reserved ones included.
    pub(crate) fn len(&self) -> usize {
        self.reg_a.size + self.reg_b.size
    }

    pub(crate) fn reserved(&self) -> usize {
        self.reserved
    }

    /// Id of the oldest event still held, or the id the next insert gets when empty.
    pub(crate) fn oldest_id(&self) -> EntryId {
        if self.len() > 0 {
            self.entries[self.reg_a.index].id
        } else {
            self.next_id
        }
    }

    /// Slots an insert can still use.
    pub(crate) fn free_capacity(&self) -> usize {
        if self.reg_b.size > 0 {
            self.reg_a.index - self.reg_b.end()
        } else {
            self.capacity() - self.reg_a.size
        }
    }

    pub(crate) fn full(&self) -> bool {
        self.free_capacity() == 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn regions(&self) -> (Region, Region) {
        (self.reg_a, self.reg_b)
    }
}
