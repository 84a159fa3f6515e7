// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Broker settings.
//!
//! Settings can be built programmatically, deserialized with serde (any format) or read from
//! `MEMBROKER_*` environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `MEMBROKER_EVENTS` | `events` |
//! | `MEMBROKER_FLUSH_MIN_EVENTS` | `flush_min_events` |
//! | `MEMBROKER_FLUSH_TIMEOUT` | `flush_timeout` (`"250ms"`, `"1s"`, or plain milliseconds) |
//! | `MEMBROKER_WAIT_ON_CLOSE` | `wait_on_close` |
//! | `MEMBROKER_INPUT_QUEUE_SIZE` | `input_queue_size` |
//!
//! Loaders enforce [`MIN_EVENTS`] through [`Settings::validate`]. Values built in code are only
//! clamped when the broker is constructed, so tiny brokers remain available for tests.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::error::BrokerError;

/// Smallest ring capacity accepted by the configuration loaders.
pub const MIN_EVENTS: usize = 32;

const DEFAULT_EVENTS: usize = 4096;
const DEFAULT_FLUSH_MIN_EVENTS: usize = 2048;
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// Request queues never shrink below this, and are capped at a fraction of the ring size.
const MIN_INPUT_QUEUE_SIZE: usize = 20;
const MAX_INPUT_QUEUE_SIZE_RATIO: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Total slot capacity of the ring buffer.
    pub events: usize,
    /// Buffered events needed before a reservation is served without waiting for the timer.
    pub flush_min_events: usize,
    /// Longest a partial batch is held back. Zero flushes immediately.
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_timeout: Duration,
    /// Block in `Broker::close` until both internal tasks exit.
    pub wait_on_close: bool,
    /// Requested capacity of each request queue; see [`adjust_input_queue_size`].
    pub input_queue_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            events: DEFAULT_EVENTS,
            flush_min_events: DEFAULT_FLUSH_MIN_EVENTS,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            wait_on_close: false,
            input_queue_size: 0,
        }
    }
}

impl Settings {
    /// Reads settings from `MEMBROKER_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, BrokerError> {
        let settings = Self::from_lookup(|key| env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(events) = parse_var(&lookup, "MEMBROKER_EVENTS", |v| v.parse().ok()) {
            settings.events = events;
        }
        if let Some(min_events) =
            parse_var(&lookup, "MEMBROKER_FLUSH_MIN_EVENTS", |v| v.parse().ok())
        {
            settings.flush_min_events = min_events;
        }
        if let Some(timeout) = parse_var(&lookup, "MEMBROKER_FLUSH_TIMEOUT", parse_duration) {
            settings.flush_timeout = timeout;
        }
        if let Some(wait) = parse_var(&lookup, "MEMBROKER_WAIT_ON_CLOSE", parse_bool) {
            settings.wait_on_close = wait;
        }
        if let Some(size) = parse_var(&lookup, "MEMBROKER_INPUT_QUEUE_SIZE", |v| v.parse().ok()) {
            settings.input_queue_size = size;
        }

        settings
    }

    /// Checks the settings a configuration loader is allowed to hand to a broker.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.events < MIN_EVENTS {
            return Err(BrokerError::InvalidConfig(format!(
                "events must be at least {MIN_EVENTS}, got {}",
                self.events
            )));
        }
        Ok(())
    }

    /// Settings as the broker applies them: at least one slot, `flush_min_events` within
    /// `[1, events]`, forced to 1 when the flush timeout is zero.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let events = self.events.max(1);
        let flush_min_events = if self.flush_timeout.is_zero() {
            1
        } else {
            self.flush_min_events.clamp(1, events)
        };
        Self {
            events,
            flush_min_events,
            flush_timeout: self.flush_timeout,
            wait_on_close: self.wait_on_close,
            input_queue_size: adjust_input_queue_size(self.input_queue_size, events),
        }
    }
}

/// Bounds the capacity of a request queue relative to the ring it feeds.
///
/// The requested size is capped at 10% of `main_queue_size` when that is positive, and never
/// drops below 20.
#[must_use]
pub fn adjust_input_queue_size(requested: usize, main_queue_size: usize) -> usize {
    let mut actual = requested;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let max = (main_queue_size as f64 * MAX_INPUT_QUEUE_SIZE_RATIO) as usize;
    if main_queue_size > 0 && actual > max {
        actual = max;
    }
    actual.max(MIN_INPUT_QUEUE_SIZE)
}

fn parse_var<F, P, T>(lookup: &F, key: &str, parse: P) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let raw = lookup(key)?;
    let value = parse(raw.trim());
    if value.is_none() {
        warn!("Ignoring invalid {} value '{}', using default", key, raw);
    }
    value
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Parses `"<n>ms"`, `"<n>s"`, `"<n>m"`, `"<n>h"` or plain milliseconds.
///
/// Negative values are accepted and mean "flush immediately", so they collapse to zero.
pub(crate) fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, magnitude) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };

    let split = magnitude
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(magnitude.len());
    let (digits, unit) = magnitude.split_at(split);
    let amount: u64 = digits.parse().ok()?;

    let duration = match unit {
        "" | "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.checked_mul(60)?),
        "h" => Duration::from_secs(amount.checked_mul(3600)?),
        _ => return None,
    };

    if negative {
        Some(Duration::ZERO)
    } else {
        Some(duration)
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(i64),
        Text(String),
    }

    match RawDuration::deserialize(deserializer)? {
        RawDuration::Millis(ms) => Ok(Duration::from_millis(ms.max(0).unsigned_abs())),
        RawDuration::Text(text) => parse_duration(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid duration '{text}'"))
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tracing_test::traced_test;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.events, 4096);
        assert_eq!(settings.flush_min_events, 2048);
        assert_eq!(settings.flush_timeout, Duration::from_secs(1));
        assert!(!settings.wait_on_close);
    }

    #[test]
    fn test_validate_rejects_small_ring() {
        let settings = Settings {
            events: 8,
            ..Default::default()
        };
        assert_eq!(
            settings.validate(),
            Err(BrokerError::InvalidConfig(
                "events must be at least 32, got 8".to_string()
            ))
        );
    }

    #[test]
    fn test_normalized_clamps_min_events() {
        let settings = Settings {
            events: 4,
            flush_min_events: 100,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.flush_min_events, 4);

        let settings = Settings {
            events: 0,
            flush_min_events: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.events, 1);
        assert_eq!(settings.flush_min_events, 1);
    }

    #[test]
    fn test_zero_timeout_flushes_immediately() {
        let settings = Settings {
            flush_timeout: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.flush_min_events, 1);
    }

    #[test]
    fn test_from_lookup_reads_all_variables() {
        let settings = Settings::from_lookup(lookup(&[
            ("MEMBROKER_EVENTS", "512"),
            ("MEMBROKER_FLUSH_MIN_EVENTS", "64"),
            ("MEMBROKER_FLUSH_TIMEOUT", "250ms"),
            ("MEMBROKER_WAIT_ON_CLOSE", "true"),
            ("MEMBROKER_INPUT_QUEUE_SIZE", "30"),
        ]));
        assert_eq!(
            settings,
            Settings {
                events: 512,
                flush_min_events: 64,
                flush_timeout: Duration::from_millis(250),
                wait_on_close: true,
                input_queue_size: 30,
            }
        );
    }

    #[test]
    #[traced_test]
    fn test_from_lookup_ignores_invalid_values() {
        let settings = Settings::from_lookup(lookup(&[
            ("MEMBROKER_EVENTS", "lots"),
            ("MEMBROKER_FLUSH_TIMEOUT", "soon"),
        ]));
        assert_eq!(settings, Settings::default());
        assert!(logs_contain("Ignoring invalid MEMBROKER_EVENTS value"));
        assert!(logs_contain("Ignoring invalid MEMBROKER_FLUSH_TIMEOUT value"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1500"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("-1s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("1d"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_deserialize_settings() {
        let settings: Settings = serde_json::from_str(
            r#"{"events": 1024, "flush_min_events": 16, "flush_timeout": "100ms"}"#,
        )
        .unwrap();
        assert_eq!(settings.events, 1024);
        assert_eq!(settings.flush_min_events, 16);
        assert_eq!(settings.flush_timeout, Duration::from_millis(100));
        assert!(!settings.wait_on_close);

        let settings: Settings =
            serde_json::from_str(r#"{"flush_timeout": 50, "wait_on_close": true}"#).unwrap();
        assert_eq!(settings.flush_timeout, Duration::from_millis(50));
        assert!(settings.wait_on_close);
        assert_eq!(settings.events, 4096);

        let settings: Settings = serde_json::from_str(r#"{"flush_timeout": -1}"#).unwrap();
        assert_eq!(settings.flush_timeout, Duration::ZERO);
    }

    #[test]
    fn test_deserialize_invalid_duration() {
        let result: Result<Settings, _> = serde_json::from_str(r#"{"flush_timeout": "later"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_adjust_input_queue_size() {
        // zero yields the floor, whatever the main queue size
        assert_eq!(adjust_input_queue_size(0, 0), MIN_INPUT_QUEUE_SIZE);
        assert_eq!(adjust_input_queue_size(0, 10), MIN_INPUT_QUEUE_SIZE);
        assert_eq!(adjust_input_queue_size(1, 0), MIN_INPUT_QUEUE_SIZE);

        // anything within bounds is kept
        let mut q = MIN_INPUT_QUEUE_SIZE + 1;
        while q < 409 {
            assert_eq!(adjust_input_queue_size(q, 4096), q);
            q += 10;
        }

        // no upper bound without a main queue size
        assert_eq!(adjust_input_queue_size(1 << 20, 0), 1 << 20);

        // capped at 10% of the main queue
        assert_eq!(adjust_input_queue_size(4096, 4096), 409);
    }
}
