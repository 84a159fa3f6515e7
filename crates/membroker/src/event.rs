// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

/// Position of an event in the order the broker admitted it, starting at 0.
///
/// Ids are assigned per broker and never reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl EntryId {
    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A producer-supplied payload and the time it was created.
///
/// The broker moves events around but never looks inside `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<T> {
    pub timestamp: SystemTime,
    pub payload: T,
}

impl<T> Event<T> {
    /// Wraps `payload`, stamped with the current time.
    pub fn new(payload: T) -> Self {
        Self::with_timestamp(payload, SystemTime::now())
    }

    pub fn with_timestamp(payload: T, timestamp: SystemTime) -> Self {
        Self { timestamp, payload }
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T> From<T> for Event<T> {
    fn from(payload: T) -> Self {
        Self::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_event_keeps_timestamp() {
        let ts = SystemTime::UNIX_EPOCH + Duration::from_secs(1_656_581_409);
        let event = Event::with_timestamp("payload", ts);
        assert_eq!(event.timestamp, ts);
        assert_eq!(event.into_payload(), "payload");
    }

    #[test]
    fn test_event_from_payload() {
        let before = SystemTime::now();
        let event: Event<u32> = 7.into();
        assert_eq!(event.payload, 7);
        assert!(event.timestamp >= before);
    }

    #[test]
    fn test_entry_id_orders_and_displays() {
        let first = EntryId::default();
        assert_eq!(first.next(), EntryId(1));
        assert!(first < first.next());
        assert_eq!(EntryId(42).to_string(), "42");
    }
}
